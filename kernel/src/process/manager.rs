//! The process table (C6): creation, exit, fork, and the wait rendezvous.
//!
//! `ProcessManager` is reached only through `process::with_process_manager`/
//! `process::manager()`, the same discipline `task::scheduler` enforces on
//! its own global state, so every mutation happens with interrupts disabled
//! (or, for the boot-time/syscall-synchronous creation path, with no
//! concurrent access to race). A process's identity here is derived from
//! its main thread's ID rather than tracked redundantly: `current_pid` and
//! `process_for_thread` both resolve through `task::scheduler`'s own notion
//! of "current thread", so the two can never drift apart.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::VirtAddr;

use super::{argv, elf, fork, Process, ProcessId, ProcessState};
use crate::fs::vfs::file::{OpenFile, OpenFlags};
use crate::fs::vfs::inode::{FilePermissions, FileType, VfsInode};
use crate::gdt;
use crate::memory;
use crate::memory::layout::{PGSIZE, USER_STACK};
use crate::memory::page::PageDescriptor;
use crate::memory::process_memory::ProcessPageTable;
use crate::memory::pte;
use crate::task::scheduler;
use crate::task::sync::Semaphore;
use crate::task::thread::{CpuContext, Thread};

/// Inode numbers handed to program images wrapped as an `OpenFile`; this
/// kernel has no real filesystem backing process executables, so every
/// loaded ELF gets the next one rather than a number from a real inode
/// table.
static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn wrap_executable(data: Vec<u8>) -> Arc<OpenFile> {
    let inode = VfsInode {
        inode_num: NEXT_INODE.fetch_add(1, Ordering::SeqCst),
        file_type: FileType::Regular,
        size: data.len() as u64,
        permissions: FilePermissions::from_mode(0o755),
        uid: 0,
        gid: 0,
        link_count: 1,
        atime: 0,
        mtime: 0,
        ctime: 0,
    };
    Arc::new(OpenFile::new(inode, OpenFlags::from_flags(OpenFlags::O_RDONLY), 0, data))
}

pub struct ProcessManager {
    processes: BTreeMap<ProcessId, Process>,
    next_pid: u64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self { processes: BTreeMap::new(), next_pid: 1 }
    }

    fn alloc_pid(&mut self) -> ProcessId {
        let id = self.next_pid;
        self.next_pid += 1;
        ProcessId::new(id)
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// The process owning `thread_id`'s main thread, if any (the idle
    /// thread and any not-yet-reaped thread with no owning process resolve
    /// to `None`).
    pub fn process_for_thread(&self, thread_id: u64) -> Option<ProcessId> {
        self.processes
            .iter()
            .find(|(_, p)| p.main_thread.as_ref().map_or(false, |t| t.id == thread_id))
            .map(|(&pid, _)| pid)
    }

    /// The process whose main thread is currently running, derived from
    /// the scheduler's own `current_thread_id` rather than tracked here.
    pub fn current_pid(&self) -> Option<ProcessId> {
        let tid = scheduler::current_thread_id()?;
        self.process_for_thread(tid)
    }

    /// Create a new user process: load `elf_data`, register its initial
    /// stack page, marshal argv onto it, and build a Ring-3-entering main
    /// thread. Does not itself hand the thread to the scheduler; callers
    /// (`process::creation`) do that once they also hold a reference to
    /// confirm the process was built successfully.
    pub fn create_process(&mut self, command_line: String, elf_data: &[u8]) -> Result<ProcessId, &'static str> {
        let pid = self.alloc_pid();
        let args = argv::split_args(&command_line);
        let name = command_line.clone();
        let mut process = Process::new(pid, command_line, VirtAddr::zero());

        process.page_table = Some(Box::new(ProcessPageTable::new()?));

        let executable = wrap_executable(elf_data.to_vec());
        executable.deny_write();

        let image = match elf::load(&executable, elf_data, &mut process.spt) {
            Ok(image) => image,
            Err(e) => {
                executable.allow_write();
                if let Some(table) = process.page_table.take() {
                    table.destroy();
                }
                return Err(e);
            }
        };
        process.entry_point = image.entry_point;
        process.memory_usage.code_size = image.segments_end as usize;
        process.executable = Some(executable);

        let stack_page_va = VirtAddr::new(USER_STACK - PGSIZE);
        if let Err(e) = process.spt.insert(PageDescriptor::new_anon(stack_page_va, pte::user_leaf_flags(true))) {
            process.terminate(-1);
            return Err(e);
        }

        self.processes.insert(pid, process);

        if let Err(e) = crate::memory::fault::claim_in_manager(self, pid, stack_page_va) {
            self.remove_and_terminate(pid);
            return Err(e);
        }

        let stack_setup = match self.setup_argv(pid, &args) {
            Ok(s) => s,
            Err(e) => {
                self.remove_and_terminate(pid);
                return Err(e);
            }
        };

        let user_context = CpuContext {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: stack_setup.rsi,
            rdi: stack_setup.rdi,
            rbp: 0,
            rsp: stack_setup.rsp,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: image.entry_point.as_u64(),
            rflags: 0x202,
            cs: gdt::user_code_selector().0 as u64,
            ss: gdt::user_data_selector().0 as u64,
        };

        let kernel_stack = match memory::alloc_kernel_stack(0) {
            Some(stack) => stack,
            None => {
                self.remove_and_terminate(pid);
                return Err("create_process: out of kernel stacks");
            }
        };

        let main_thread = Thread::new_user(name, kernel_stack, VirtAddr::zero(), user_context);
        if let Some(proc) = self.processes.get_mut(&pid) {
            proc.set_main_thread(main_thread);
        }

        Ok(pid)
    }

    fn setup_argv(&self, pid: ProcessId, args: &[String]) -> Result<argv::StackSetup, &'static str> {
        let proc = self.get(pid).ok_or("create_process: process vanished")?;
        let table = proc.page_table.as_deref().ok_or("create_process: missing page table")?;
        argv::setup(table, args)
    }

    fn remove_and_terminate(&mut self, pid: ProcessId) {
        if let Some(mut p) = self.processes.remove(&pid) {
            p.terminate(-1);
        }
    }

    /// Tear down `pid` (spec §4.6): release its address space/fds/SPT via
    /// `Process::terminate`, mark its thread terminated so the scheduler
    /// never resumes it, and wake a parent blocked in `wait`. If `pid` was
    /// the thread actually running, forces the scheduler's notion of
    /// "current" to idle so the next reschedule doesn't try to resume it.
    pub fn exit_process(&mut self, pid: ProcessId, exit_code: i32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.terminate(exit_code);
        let wait_sema = process.wait_sema.clone();
        let thread_id = process.main_thread.as_ref().map(|t| t.id);

        if let Some(tid) = thread_id {
            scheduler::with_thread_mut(tid, |t| t.set_terminated());
        }
        wait_sema.up();

        if let (Some(cur), Some(tid)) = (scheduler::current_thread_id(), thread_id) {
            if cur == tid {
                scheduler::switch_to_idle();
            }
        }
    }

    /// fork() (spec §4.6): duplicate `parent_pid`'s address space and fd
    /// table into a new process, whose main thread resumes at the same
    /// saved userspace context as the parent's, with `rax` zeroed. Returns
    /// the child's pid and a spawn-ready clone of its main thread; the
    /// original (which owns the real kernel-stack allocation) is kept on
    /// `child.main_thread`.
    pub fn fork_process(&mut self, parent_pid: ProcessId) -> Result<(ProcessId, Thread), &'static str> {
        let child_pid = self.alloc_pid();
        let mut parent = self.processes.remove(&parent_pid).ok_or("fork: parent not found")?;

        let build = (|| -> Result<(Process, Thread), &'static str> {
            let mut child = Process::new(child_pid, parent.name.clone(), parent.entry_point);
            child.parent = Some(parent_pid);

            let mut child_table = ProcessPageTable::new()?;
            {
                let parent_table = parent.page_table.as_deref().ok_or("fork: parent has no page table")?;
                fork::fork_address_space(&parent, &mut child, child_pid, parent_table, &mut child_table)?;
            }
            fork::copy_process_state(&parent, &mut child);
            child.page_table = Some(Box::new(child_table));

            let parent_thread = parent.main_thread.as_ref().ok_or("fork: parent has no main thread")?;
            let mut user_context = parent_thread
                .saved_userspace_context
                .clone()
                .ok_or("fork: parent thread has no saved userspace context")?;
            user_context.rax = 0; // fork() returns 0 in the child

            let kernel_stack = memory::alloc_kernel_stack(0).ok_or("fork: out of kernel stacks")?;
            let child_thread =
                Thread::new_user(child.name.clone(), kernel_stack, parent_thread.tls_block, user_context);
            child.set_main_thread(child_thread);
            let spawned = child.main_thread.as_ref().expect("just set").clone();
            Ok((child, spawned))
        })();

        let result = match build {
            Ok((child, spawned)) => {
                parent.add_child(child_pid);
                self.processes.insert(child_pid, child);
                Ok((child_pid, spawned))
            }
            Err(e) => Err(e),
        };

        self.processes.insert(parent_pid, parent);
        result
    }

    /// The semaphore a `wait(child_pid)` caller should block on, after
    /// confirming `child_pid` actually is a child of `parent_pid`.
    pub fn wait_sema_for(&mut self, parent_pid: ProcessId, child_pid: ProcessId) -> Result<Arc<Semaphore>, &'static str> {
        let parent = self.get(parent_pid).ok_or("wait: parent not found")?;
        if !parent.children.contains(&child_pid) {
            return Err("wait: not a child of this process");
        }
        let child = self.get(child_pid).ok_or("wait: child not found")?;
        Ok(child.wait_sema.clone())
    }

    /// Remove an exited child from the table and return its exit code.
    /// Called once the parent's blocking wait on `wait_sema_for`'s
    /// semaphore has returned, by which point the child's thread is
    /// guaranteed `Terminated` and never running; retiring its scheduler
    /// slot here and dropping its `Process` (freeing the real kernel-stack
    /// allocation) is therefore safe.
    pub fn reap_child(&mut self, parent_pid: ProcessId, child_pid: ProcessId) -> Result<i32, &'static str> {
        let child = self.processes.remove(&child_pid).ok_or("wait: child already reaped")?;
        if let Some(parent) = self.processes.get_mut(&parent_pid) {
            parent.children.retain(|&c| c != child_pid);
        }
        if let Some(tid) = child.main_thread.as_ref().map(|t| t.id) {
            scheduler::retire_thread(tid);
        }
        Ok(match child.state {
            ProcessState::Terminated(code) => code,
            _ => -1,
        })
    }
}
