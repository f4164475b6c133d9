//! Process creation with user threads from start.
//!
//! Processes are created as user threads from the beginning: there is no
//! kernel-to-user spawn-thread transition. The real work (ELF loading, SPT
//! population, argv marshalling) happens in `manager::create_process`; this
//! module is the thin public entry point that also hands the resulting
//! thread to the scheduler.

use crate::process::ProcessId;
use alloc::boxed::Box;
use alloc::string::String;

/// Create a new user process and enqueue its main thread with the
/// scheduler. `command_line` is split into argv by `process::argv`.
pub fn create_user_process(command_line: String, elf_data: &[u8]) -> Result<ProcessId, &'static str> {
    log::info!("create_user_process: creating '{}'", command_line);

    let pid = {
        let mut manager_guard = crate::process::manager();
        let manager = manager_guard
            .as_mut()
            .ok_or("create_user_process: process manager not available")?;
        manager.create_process(command_line.clone(), elf_data)?
    };

    {
        let manager_guard = crate::process::manager();
        let manager = manager_guard
            .as_ref()
            .ok_or("create_user_process: process manager not available")?;
        let process = manager
            .get(pid)
            .ok_or("create_user_process: process vanished after creation")?;
        let main_thread = process
            .main_thread
            .as_ref()
            .ok_or("create_user_process: process has no main thread")?;
        if main_thread.privilege != crate::task::thread::ThreadPrivilege::User {
            return Err("create_user_process: main thread is not a user thread");
        }
        log::info!(
            "create_user_process: scheduling user thread {} ('{}')",
            main_thread.id,
            main_thread.name
        );
        crate::task::scheduler::spawn(Box::new(main_thread.clone()));
    }

    log::info!("create_user_process: PID {} ready", pid.as_u64());
    Ok(pid)
}

/// Create PID 1 (init).
#[allow(dead_code)]
pub fn init_user_process(elf_data: &[u8]) -> Result<ProcessId, &'static str> {
    create_user_process(String::from("init"), elf_data)
}
