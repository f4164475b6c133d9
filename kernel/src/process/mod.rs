//! Process lifecycle management (C6): creation, exit, fork, and wait.
//!
//! A process owns an address space, a supplemental page table, and an fd
//! table; `task::scheduler` owns the threads that run it. `ProcessManager`
//! is the single source of truth for the process table and is reached
//! exclusively through `with_process_manager`/`manager()` below so every
//! caller goes through the same interrupt-disabling discipline the
//! scheduler's own globals use.

use spin::Mutex;

pub mod argv;
pub mod creation;
pub mod elf;
pub mod fork;
pub mod manager;
pub mod process;

pub use manager::ProcessManager;
pub use process::{Process, ProcessId, ProcessState};

/// Wrapper around the process manager's lock guard. Exists (rather than a
/// bare `MutexGuard`) so the lock's acquisition site can be changed without
/// touching every caller.
pub struct ProcessManagerGuard {
    _guard: spin::MutexGuard<'static, Option<ProcessManager>>,
}

impl core::ops::Deref for ProcessManagerGuard {
    type Target = Option<ProcessManager>;
    fn deref(&self) -> &Self::Target {
        &self._guard
    }
}

impl core::ops::DerefMut for ProcessManagerGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self._guard
    }
}

/// Global process manager.
static PROCESS_MANAGER: Mutex<Option<ProcessManager>> = Mutex::new(None);

/// Initialize the process management system.
pub fn init() {
    *PROCESS_MANAGER.lock() = Some(ProcessManager::new());
    log::info!("Process management initialized");
}

/// Acquire the process manager directly, without disabling interrupts.
/// Only safe for call sites that run before interrupts are enabled or that
/// are otherwise known not to race a timer tick (process creation, which
/// runs single-threaded during boot or in response to a synchronous
/// syscall already executing with a consistent view of the table).
pub fn manager() -> ProcessManagerGuard {
    ProcessManagerGuard { _guard: PROCESS_MANAGER.lock() }
}

/// Run `f` with the process manager while interrupts are disabled. The
/// mandatory entry point for anything reachable from interrupt or
/// timer-tick context, matching `task::scheduler`'s own `with_scheduler`.
pub fn with_process_manager<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut ProcessManager) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut guard = PROCESS_MANAGER.lock();
        guard.as_mut().map(f)
    })
}

/// Try to get the process manager without blocking (for interrupt contexts
/// that must not spin).
pub fn try_manager() -> Option<spin::MutexGuard<'static, Option<ProcessManager>>> {
    PROCESS_MANAGER.try_lock()
}

/// Create a new user process and enqueue its main thread with the
/// scheduler.
pub fn create_user_process(name: alloc::string::String, elf_data: &[u8]) -> Result<ProcessId, &'static str> {
    creation::create_user_process(name, elf_data)
}

/// The running process's ID, if any (no process runs the idle thread).
pub fn current_pid() -> Option<ProcessId> {
    with_process_manager(|m| m.current_pid()).flatten()
}

/// Tear down the current process and mark its thread terminated. Does not
/// itself force a reschedule; syscall/fault callers that know the thread
/// must not resume call `task::scheduler::set_need_resched()` right after
/// (as `memory::fault::terminate_current` does), since some callers intend
/// to keep running briefly (e.g. to finish logging) before yielding.
pub fn exit_current(exit_code: i32) {
    let Some(pid) = current_pid() else {
        log::error!("exit_current: no current process");
        return;
    };
    with_process_manager(|m| m.exit_process(pid, exit_code));
}

/// fork() (spec §4.6): duplicate the current process and spawn the child's
/// main thread. Returns the child's pid to the parent; the child observes
/// its own fork() return as 0 via `saved_userspace_context.rax`, set by
/// `ProcessManager::fork_process`.
pub fn fork_current() -> Result<ProcessId, &'static str> {
    let parent_pid = current_pid().ok_or("fork: no current process")?;
    let (child_pid, child_thread) = with_process_manager(|m| m.fork_process(parent_pid))
        .ok_or("fork: process manager unavailable")??;
    crate::task::scheduler::spawn(alloc::boxed::Box::new(child_thread));
    Ok(child_pid)
}

/// wait() (spec §4.6): block until `child_pid` exits, then reap it and
/// return its exit code. The blocking step happens outside the manager
/// lock so the scheduler can freely switch to and run other threads
/// (including the child itself) while this thread is parked.
pub fn wait(child_pid: ProcessId) -> Result<i32, &'static str> {
    let parent_pid = current_pid().ok_or("wait: no current process")?;
    let sema = with_process_manager(|m| m.wait_sema_for(parent_pid, child_pid))
        .ok_or("wait: process manager unavailable")??;
    sema.down();
    with_process_manager(|m| m.reap_child(parent_pid, child_pid))
        .ok_or("wait: process manager unavailable")?
}
