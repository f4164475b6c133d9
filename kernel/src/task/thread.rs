//! Thread control blocks for preemptive multitasking (C5).
//!
//! A `Thread` carries everything the scheduler needs to pick, run, and
//! preempt it: its CPU register frame, its base/effective priority and
//! donation bookkeeping, its MLFQS `nice`/`recent_cpu`, and its sleep
//! wakeup tick. Process-level resources (address space, SPT, fd table,
//! the per-child rendezvous semaphores) live on `process::Process` instead
//! of here, matching how this codebase already splits "schedulable unit"
//! from "resource owner" rather than collapsing both into one struct.

use super::fixed_point::Fixed;
use alloc::collections::BTreeSet;
use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::VirtAddr;

/// Global thread ID counter.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1); // 0 is reserved for kernel thread

/// Allocate a new thread ID.
pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

/// Lowest priority a thread may hold.
pub const PRI_MIN: i32 = 0;
/// Highest priority a thread may hold.
pub const PRI_MAX: i32 = 63;
/// Priority newly created threads start at absent other instructions.
pub const PRI_DEFAULT: i32 = 31;

/// Magic cookie written at a fixed offset in the thread's own kernel stack;
/// checked on every context switch to detect stack overflow.
pub const THREAD_MAGIC: u64 = 0xcd6a_bf4c_5a3e_19d7;

/// Why a thread is currently blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    /// Blocked on a semaphore (`down`).
    Semaphore,
    /// Blocked acquiring a `Lock`.
    Lock,
    /// Blocked on a condition variable.
    Condvar,
    /// Blocked in `sleep_until` on the sleep queue.
    Sleep,
    /// Blocked in `wait()` for a child to exit.
    Wait,
    /// Blocked until the parent acknowledges exit (the exit semaphore).
    ExitAck,
}

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is currently running on the CPU.
    Running,
    /// Thread is ready to run and sits in the scheduler's ready queue.
    Ready,
    /// Thread is blocked waiting for something.
    Blocked(BlockedReason),
    /// Thread has terminated; its stack is retired on the next switch.
    Terminated,
}

/// Thread privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPrivilege {
    /// Kernel thread (Ring 0).
    Kernel,
    /// User thread (Ring 3).
    User,
}

/// CPU context saved during a context switch.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
    pub rflags: u64,

    pub cs: u64,
    pub ss: u64,
}

impl CpuContext {
    /// Create a new CPU context for a thread entry point.
    pub fn new(entry_point: VirtAddr, stack_pointer: VirtAddr, privilege: ThreadPrivilege) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: stack_pointer.as_u64(),
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,

            rip: entry_point.as_u64(),

            // Kernel threads start with interrupts disabled so a timer tick
            // can't preempt them before they finish initializing; user
            // threads always run with IF set. Bit 1 is reserved-as-1.
            rflags: match privilege {
                ThreadPrivilege::Kernel => 0x002,
                ThreadPrivilege::User => 0x202,
            },

            cs: match privilege {
                ThreadPrivilege::Kernel => 0x08,
                ThreadPrivilege::User => 0x33,
            },
            ss: match privilege {
                ThreadPrivilege::Kernel => 0x10,
                ThreadPrivilege::User => 0x2b,
            },
        }
    }
}

/// Thread control block.
pub struct Thread {
    pub id: u64,
    pub name: String,
    pub state: ThreadState,
    pub context: CpuContext,

    pub stack_top: VirtAddr,
    pub stack_bottom: VirtAddr,

    /// Kernel stack top for syscalls/interrupts (userspace threads only).
    pub kernel_stack_top: Option<VirtAddr>,
    /// Kernel stack allocation, kept alive for RAII.
    #[allow(dead_code)]
    pub kernel_stack_allocation: Option<crate::memory::kernel_stack::KernelStack>,

    pub tls_block: VirtAddr,

    /// Priority as set by the owner (via `set_priority`, never touched by MLFQS).
    pub base_priority: i32,
    /// max(base_priority, highest donor's effective_priority); what the
    /// scheduler actually compares.
    pub effective_priority: i32,
    /// Threads currently donating to this one, ordered by priority
    /// (highest last so `pop` gives the max donor in O(1) amortized).
    pub donations: alloc::vec::Vec<u64>,
    /// The lock this thread is blocked trying to acquire, if any. Used to
    /// propagate donation along a chain of nested lock holders.
    pub wait_on_lock: Option<u64>,

    /// MLFQS niceness, [-20, 20].
    pub nice: i32,
    /// MLFQS recent_cpu, 17.14 fixed point.
    pub recent_cpu: Fixed,

    /// Absolute tick at which a sleeping thread should be woken.
    pub wakeup_tick: Option<u64>,

    pub time_slice: u32,
    pub entry_point: Option<fn()>,
    pub privilege: ThreadPrivilege,
    pub has_started: bool,

    /// Set while the thread is executing a syscall, so a fault taken on its
    /// behalf knows to treat the saved rsp as the kernel-entry rsp rather
    /// than a true user-mode rsp.
    pub blocked_in_syscall: bool,
    /// User-mode register frame saved on kernel entry, restored on return.
    pub saved_userspace_context: Option<CpuContext>,
    /// Absolute wake tick recorded by `sleep_until`; mirrors `wakeup_tick`
    /// for call sites that only care whether a wake time is pending.
    pub wake_time_ns: Option<u64>,
}

impl Clone for Thread {
    fn clone(&self) -> Self {
        Thread {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            context: self.context.clone(),
            stack_top: self.stack_top,
            stack_bottom: self.stack_bottom,
            kernel_stack_top: self.kernel_stack_top,
            kernel_stack_allocation: None,
            tls_block: self.tls_block,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority,
            donations: self.donations.clone(),
            wait_on_lock: self.wait_on_lock,
            nice: self.nice,
            recent_cpu: self.recent_cpu,
            wakeup_tick: self.wakeup_tick,
            time_slice: self.time_slice,
            entry_point: self.entry_point,
            privilege: self.privilege,
            has_started: self.has_started,
            blocked_in_syscall: self.blocked_in_syscall,
            saved_userspace_context: self.saved_userspace_context.clone(),
            wake_time_ns: self.wake_time_ns,
        }
    }
}

impl Thread {
    fn base_new(
        id: u64,
        name: String,
        context: CpuContext,
        stack_top: VirtAddr,
        stack_bottom: VirtAddr,
        tls_block: VirtAddr,
        privilege: ThreadPrivilege,
        priority: i32,
        time_slice: u32,
        entry_point: Option<fn()>,
    ) -> Self {
        Self {
            id,
            name,
            state: ThreadState::Ready,
            context,
            stack_top,
            stack_bottom,
            kernel_stack_top: None,
            kernel_stack_allocation: None,
            tls_block,
            base_priority: priority,
            effective_priority: priority,
            donations: alloc::vec::Vec::new(),
            wait_on_lock: None,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wakeup_tick: None,
            time_slice,
            entry_point,
            privilege,
            has_started: false,
            blocked_in_syscall: false,
            saved_userspace_context: None,
            wake_time_ns: None,
        }
    }

    /// Create a new kernel thread with an argument passed in `rdi`.
    pub fn new_kernel(
        name: String,
        entry_point: extern "C" fn(u64) -> !,
        arg: u64,
    ) -> Result<Self, &'static str> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);

        const KERNEL_STACK_SIZE: usize = 16 * 1024;
        let stack = crate::memory::alloc_kernel_stack(KERNEL_STACK_SIZE)
            .ok_or("Failed to allocate kernel stack")?;

        let stack_top = stack.top();
        let stack_bottom = stack.bottom();

        let mut context = CpuContext::new(
            VirtAddr::new(entry_point as u64),
            stack_top,
            ThreadPrivilege::Kernel,
        );
        context.rdi = arg;

        let mut thread = Self::base_new(
            id,
            name,
            context,
            stack_top,
            stack_bottom,
            VirtAddr::new(0),
            ThreadPrivilege::Kernel,
            PRI_DEFAULT + 1, // kernel housekeeping threads run slightly ahead
            20,
            None,
        );
        thread.kernel_stack_top = Some(stack_top);
        thread.kernel_stack_allocation = Some(stack);
        Ok(thread)
    }

    /// Create a new user thread. `entry_point` is a kernel-side trampoline,
    /// not the user binary's real entry (set separately on the saved
    /// userspace context once the loader runs).
    pub fn new(
        name: String,
        entry_point: fn(),
        stack_top: VirtAddr,
        stack_bottom: VirtAddr,
        tls_block: VirtAddr,
        privilege: ThreadPrivilege,
    ) -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
        let context = CpuContext::new(VirtAddr::new(entry_point as u64), stack_top, privilege);
        Self::base_new(
            id,
            name,
            context,
            stack_top,
            stack_bottom,
            tls_block,
            privilege,
            PRI_DEFAULT,
            10,
            Some(entry_point),
        )
    }

    /// Create a new user thread that enters Ring 3 through
    /// `task::userspace`. The thread's own `context` is a Ring 0 frame
    /// (so the ordinary register-only switcher can schedule it like any
    /// kernel thread) with `rip` pointed at `user_thread_start`;
    /// `user_context` is the Ring-3 register frame that function restores
    /// the first time this thread actually runs.
    pub fn new_user(
        name: String,
        kernel_stack: crate::memory::kernel_stack::KernelStack,
        tls_block: VirtAddr,
        user_context: CpuContext,
    ) -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
        let stack_top = kernel_stack.top();
        let stack_bottom = kernel_stack.bottom();

        let context = CpuContext::new(
            VirtAddr::new(super::userspace::user_thread_start as usize as u64),
            stack_top,
            ThreadPrivilege::Kernel,
        );

        let mut thread = Self::base_new(
            id,
            name,
            context,
            stack_top,
            stack_bottom,
            tls_block,
            ThreadPrivilege::Kernel,
            PRI_DEFAULT,
            10,
            None,
        );
        thread.kernel_stack_top = Some(stack_top);
        thread.kernel_stack_allocation = Some(kernel_stack);
        thread.privilege = ThreadPrivilege::User;
        thread.saved_userspace_context = Some(user_context);
        thread
    }

    /// Create a new thread with a caller-chosen ID (used by fork, which must
    /// keep the parent's own ID stable while minting a fresh one for the
    /// child before the child thread object exists).
    pub fn new_with_id(
        id: u64,
        name: String,
        entry_point: fn(),
        stack_top: VirtAddr,
        stack_bottom: VirtAddr,
        tls_block: VirtAddr,
        privilege: ThreadPrivilege,
    ) -> Self {
        let context = CpuContext::new(VirtAddr::new(entry_point as u64), stack_top, privilege);
        Self::base_new(
            id,
            name,
            context,
            stack_top,
            stack_bottom,
            tls_block,
            privilege,
            PRI_DEFAULT,
            10,
            Some(entry_point),
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn set_running(&mut self) {
        self.state = ThreadState::Running;
    }

    pub fn set_ready(&mut self) {
        if self.state != ThreadState::Terminated {
            self.state = ThreadState::Ready;
        }
    }

    pub fn set_blocked(&mut self, reason: BlockedReason) {
        self.state = ThreadState::Blocked(reason);
    }

    pub fn set_terminated(&mut self) {
        self.state = ThreadState::Terminated;
    }

    /// Recompute `effective_priority` from `base_priority` and the current
    /// donor set: max(base, max donor). Called after a donation is added,
    /// a donation is removed, or `base_priority` changes.
    pub fn recompute_effective_priority(&mut self, donor_priorities: &BTreeSet<i32>) {
        let max_donor = donor_priorities.iter().next_back().copied().unwrap_or(PRI_MIN);
        self.effective_priority = self.base_priority.max(max_donor);
    }

    /// Set the owner-specified priority. In MLFQS mode the scheduler alone
    /// drives priority via `recompute_mlfqs_priority`, so callers must not
    /// invoke this while MLFQS is enabled.
    pub fn set_base_priority(&mut self, priority: i32) {
        let priority = priority.clamp(PRI_MIN, PRI_MAX);
        self.base_priority = priority;
        if self.donations.is_empty() {
            self.effective_priority = priority;
        } else {
            self.effective_priority = self.effective_priority.max(priority);
        }
    }

    /// MLFQS priority recompute: `PRI_MAX - recent_cpu/4 - 2*nice`, clamped.
    pub fn recompute_mlfqs_priority(&mut self) {
        let pri = Fixed::from_int(PRI_MAX)
            .sub(self.recent_cpu.div_int(4))
            .sub(Fixed::from_int(2 * self.nice));
        let pri = pri.to_int_truncate().clamp(PRI_MIN, PRI_MAX);
        self.base_priority = pri;
        self.effective_priority = pri;
    }
}
