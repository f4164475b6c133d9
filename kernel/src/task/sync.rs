//! Blocking synchronization primitives: semaphore, lock (with priority
//! donation), and condition variable (Mesa semantics). Built directly on
//! the scheduler's ready/block primitives, the way the teacher builds
//! `Vma`/`Vfs` abstractions directly on the facilities they need rather
//! than through a generic concurrency crate (this kernel has no OS threads
//! to borrow one from).

use super::scheduler;
use super::thread::BlockedReason;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use spin::Mutex;

/// Registry from a lock's identity (its address) to the thread currently
/// holding it. `Lock` itself only stores its own holder, which is enough
/// for a single acquire/release pair; nested donation (spec §4.5) needs to
/// resolve the holder of a lock several hops down a wait-for chain, so
/// that lookup goes through this global table instead.
static LOCK_HOLDERS: Mutex<BTreeMap<u64, u64>> = Mutex::new(BTreeMap::new());

/// A counting semaphore with a FIFO-within-priority waiter queue.
pub struct Semaphore {
    inner: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    count: u32,
    waiters: VecDeque<u64>,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            inner: Mutex::new(SemaphoreState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Decrement the semaphore, blocking while it is zero.
    pub fn down(&self) {
        loop {
            let blocked = x86_64::instructions::interrupts::without_interrupts(|| {
                let mut state = self.inner.lock();
                if state.count > 0 {
                    state.count -= 1;
                    false
                } else {
                    let tid = scheduler::current_thread_id().expect("down() outside a thread");
                    state.waiters.push_back(tid);
                    scheduler::with_thread_mut(tid, |t| t.set_blocked(BlockedReason::Semaphore));
                    true
                }
            });
            if !blocked {
                return;
            }
            scheduler::yield_current();
        }
    }

    /// Increment the semaphore, waking the highest-priority waiter if any.
    /// Preempts the caller afterward if the woken thread now outranks it.
    pub fn up(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut state = self.inner.lock();
            let woken = pop_highest_priority(&mut state.waiters);
            match woken {
                Some(tid) => {
                    scheduler::with_thread_mut(tid, |t| t.set_ready());
                    scheduler::requeue_ready(tid);
                }
                None => state.count += 1,
            }
        });
        scheduler::maybe_preempt();
    }
}

/// Remove and return the queued waiter with the highest effective priority,
/// breaking ties by FIFO (earliest-enqueued wins).
fn pop_highest_priority(waiters: &mut VecDeque<u64>) -> Option<u64> {
    if waiters.is_empty() {
        return None;
    }
    let mut best_index = 0usize;
    let mut best_priority = i32::MIN;
    for (i, &tid) in waiters.iter().enumerate() {
        let priority = scheduler::with_thread_mut(tid, |t| t.effective_priority).unwrap_or(i32::MIN);
        if priority > best_priority {
            best_priority = priority;
            best_index = i;
        }
    }
    waiters.remove(best_index)
}

/// A mutual-exclusion lock with priority donation: while a higher-priority
/// thread waits on this lock, the holder's effective priority is raised to
/// match, and restored on release.
pub struct Lock {
    sema: Semaphore,
    holder: Mutex<Option<u64>>,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
            holder: Mutex::new(None),
        }
    }

    pub fn holder(&self) -> Option<u64> {
        *self.holder.lock()
    }

    /// Acquire the lock, donating this thread's priority to the current
    /// holder (and propagating along the holder's own `wait_on_lock` chain)
    /// while blocked.
    pub fn acquire(&self) {
        let self_id = self as *const Self as u64;
        let acquirer = scheduler::current_thread_id().expect("acquire() outside a thread");

        x86_64::instructions::interrupts::without_interrupts(|| {
            if let Some(holder) = *self.holder.lock() {
                if holder != acquirer {
                    donate_priority(acquirer, holder, self_id);
                }
            }
        });

        self.sema.down();

        x86_64::instructions::interrupts::without_interrupts(|| {
            scheduler::with_thread_mut(acquirer, |t| t.wait_on_lock = None);
            *self.holder.lock() = Some(acquirer);
            LOCK_HOLDERS.lock().insert(self_id, acquirer);
        });
    }

    /// Release the lock: clear donations this lock's waiters made to us,
    /// recompute our own effective priority from remaining donors, then
    /// wake the highest-priority waiter.
    pub fn release(&self) {
        let self_id = self as *const Self as u64;
        x86_64::instructions::interrupts::without_interrupts(|| {
            let releaser = self.holder.lock().take();
            LOCK_HOLDERS.lock().remove(&self_id);
            if let Some(releaser) = releaser {
                withdraw_donations_for_lock(releaser, self_id);
            }
        });
        self.sema.up();
    }
}

/// Record `acquirer`'s donation to `holder` and propagate along any chain
/// of locks `holder` is itself waiting on (nested donation).
fn donate_priority(acquirer: u64, holder: u64, lock_id: u64) {
    scheduler::with_thread_mut(acquirer, |t| t.wait_on_lock = Some(lock_id));

    let mut current_holder = holder;
    let acquirer_priority = scheduler::with_thread_mut(acquirer, |t| t.effective_priority).unwrap_or(i32::MIN);

    loop {
        let (raised, next_lock) = scheduler::with_thread_mut(current_holder, |t| {
            if !t.donations.contains(&acquirer) {
                t.donations.push(acquirer);
            }
            let raised = acquirer_priority > t.effective_priority;
            if raised {
                t.effective_priority = acquirer_priority;
            }
            (raised, t.wait_on_lock)
        })
        .unwrap_or((false, None));

        if !raised {
            break;
        }
        match next_lock {
            Some(next_lock_id) => match lock_holder_of(next_lock_id) {
                Some(next_holder) if next_holder != current_holder => current_holder = next_holder,
                _ => break,
            },
            None => break,
        }
    }
}

/// Resolve the thread currently holding the lock at `lock_id`, via
/// `LOCK_HOLDERS`. Lock addresses are used as opaque identifiers; the
/// scheduler never dereferences this value as a pointer.
fn lock_holder_of(lock_id: u64) -> Option<u64> {
    LOCK_HOLDERS.lock().get(&lock_id).copied()
}

/// After releasing a lock, remove every donation made on account of that
/// specific lock and recompute our effective priority from what remains.
///
/// Donors waiting specifically on `lock_id` are identified by their own
/// `wait_on_lock` field (set by `donate_priority`, cleared once `acquire`
/// succeeds), so a donor still waiting on some other lock the releaser
/// holds is kept. The snapshot and per-donor lookups below run *before*
/// the releaser's own `with_thread_mut` call: `with_thread_mut` holds the
/// scheduler's lock for the whole closure, and that lock isn't reentrant,
/// so nesting another `with_thread_mut` call inside it would deadlock as
/// soon as there was a donor to look up.
fn withdraw_donations_for_lock(releaser: u64, lock_id: u64) {
    let donations = scheduler::with_thread_mut(releaser, |t| t.donations.clone()).unwrap_or_default();

    let mut remaining_donors = alloc::vec::Vec::new();
    let mut remaining_priorities: BTreeSet<i32> = BTreeSet::new();
    for tid in donations {
        let info = scheduler::with_thread_mut(tid, |d| (d.wait_on_lock, d.effective_priority));
        if let Some((wait_on_lock, priority)) = info {
            if wait_on_lock != Some(lock_id) {
                remaining_donors.push(tid);
                remaining_priorities.insert(priority);
            }
        }
    }

    scheduler::with_thread_mut(releaser, |t| {
        t.donations = remaining_donors;
        t.recompute_effective_priority(&remaining_priorities);
    });
}

/// A condition variable with Mesa semantics, used together with a `Lock`.
pub struct Condvar {
    waiters: Mutex<VecDeque<(u64, alloc::sync::Arc<Semaphore>)>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically release `lock`, wait for a signal, then reacquire `lock`.
    pub fn wait(&self, lock: &Lock) {
        let tid = scheduler::current_thread_id().expect("wait() outside a thread");
        let private = alloc::sync::Arc::new(Semaphore::new(0));
        self.waiters.lock().push_back((tid, private.clone()));
        lock.release();
        private.down();
        lock.acquire();
    }

    /// Wake the highest-priority waiter's private semaphore, if any (spec
    /// §4.5: "signal ups the highest-priority waiter's semaphore"), ties
    /// broken FIFO the same way the ready queue and lock donors are.
    pub fn notify_one(&self) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        let mut best_index = 0usize;
        let mut best_priority = i32::MIN;
        for (i, &(tid, _)) in waiters.iter().enumerate() {
            let priority = scheduler::with_thread_mut(tid, |t| t.effective_priority).unwrap_or(i32::MIN);
            if priority > best_priority {
                best_priority = priority;
                best_index = i;
            }
        }
        if let Some((_, sema)) = waiters.remove(best_index) {
            sema.up();
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some((_, sema)) = waiters.pop_front() {
            sema.up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_state_starts_at_configured_count() {
        let sem = Semaphore::new(3);
        let state = sem.inner.lock();
        assert_eq!(state.count, 3);
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn pop_highest_priority_is_fifo_when_untracked() {
        // With no scheduler backing these ids, priority lookups default to
        // i32::MIN for every waiter, so the first entry wins ties.
        let mut waiters: VecDeque<u64> = VecDeque::new();
        waiters.push_back(10);
        waiters.push_back(20);
        waiters.push_back(30);
        assert_eq!(pop_highest_priority(&mut waiters), Some(10));
        assert_eq!(waiters.len(), 2);
    }

    #[test]
    fn empty_waiter_queue_pops_none() {
        let mut waiters: VecDeque<u64> = VecDeque::new();
        assert_eq!(pop_highest_priority(&mut waiters), None);
    }
}
