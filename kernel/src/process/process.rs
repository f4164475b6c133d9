//! Process structure and lifecycle

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::boxed::Box;
use x86_64::VirtAddr;
use crate::task::thread::Thread;
use crate::task::sync::Semaphore;
use crate::memory::process_memory::ProcessPageTable;
use crate::memory::supplemental_page_table::SupplementalPageTable;
use crate::fs::vfs::file::OpenFile;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new(id: u64) -> Self {
        ProcessId(id)
    }
    
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is being created
    Creating,
    /// Process is ready to run
    Ready,
    /// Process has terminated
    Terminated(i32), // exit code
}

/// A process represents a running program with its own address space
pub struct Process {
    /// Unique process identifier
    pub id: ProcessId,
    
    /// Process name (for debugging)
    pub name: String,
    
    /// Current state
    pub state: ProcessState,
    
    /// Entry point address
    pub entry_point: VirtAddr,
    
    /// Main thread of the process
    pub main_thread: Option<Thread>,
    
    
    /// Parent process ID (if any)
    pub parent: Option<ProcessId>,
    
    /// Child processes
    pub children: Vec<ProcessId>,
    
    /// Exit code (if terminated)
    pub exit_code: Option<i32>,
    
    /// Memory usage statistics
    pub memory_usage: MemoryUsage,
    
    /// Per-process page table
    pub page_table: Option<Box<ProcessPageTable>>,

    /// Supplemental page table: every not-necessarily-resident page this
    /// process knows about (spec §4.3/§4.6).
    pub spt: SupplementalPageTable,

    /// Open file descriptors, indexed by fd number. `None` entries are
    /// closed/unused slots so fd numbers stay stable across `close`.
    pub fd_table: Vec<Option<Arc<OpenFile>>>,

    /// The file this process was loaded from, write-denied for the
    /// lifetime of the process (spec §4.6).
    pub executable: Option<Arc<OpenFile>>,

    /// Rendezvous semaphore with this process's parent (spec §4.6/§5),
    /// signaled on exit to release a parent blocked in `wait`.
    /// `ProcessManager` keeps the exited `Process` (and its
    /// already-computed exit code) in the process table until `wait` reaps
    /// it, all under the same process-manager lock that both `exit` and
    /// `wait` go through, so there is no separate handshake needed to
    /// protect the parent's read of the exit code from the child's
    /// teardown: the kernel-stack-only teardown the spec defers past that
    /// read happens later still, at `ProcessManager::reap_child`'s
    /// `scheduler::retire_thread` call. `fork`'s own "load complete"
    /// handshake is likewise unnecessary here: `ProcessManager::fork_process`
    /// duplicates the child's state synchronously in the parent's own
    /// call, before the child thread is ever spawned, so the parent learns
    /// success/failure as a plain `Result` rather than by waiting on a
    /// semaphore the child signals later.
    pub wait_sema: Arc<Semaphore>,
}

/// Memory usage tracking
#[derive(Debug, Default)]
pub struct MemoryUsage {
    /// Size of loaded program segments in bytes
    pub code_size: usize,
    /// Size of allocated stack in bytes
    pub stack_size: usize,
}

impl Process {
    /// Create a new process
    pub fn new(id: ProcessId, name: String, entry_point: VirtAddr) -> Self {
        Process {
            id,
            name,
            state: ProcessState::Creating,
            entry_point,
            main_thread: None,
            parent: None,
            children: Vec::new(),
            exit_code: None,
            memory_usage: MemoryUsage::default(),
            page_table: None,
            spt: SupplementalPageTable::new(),
            fd_table: Vec::new(),
            executable: None,
            wait_sema: Arc::new(Semaphore::new(0)),
        }
    }

    /// Set the main thread for this process
    pub fn set_main_thread(&mut self, thread: Thread) {
        self.main_thread = Some(thread);
        self.state = ProcessState::Ready;
    }


    /// Mark terminated and release everything exit teardown owns except
    /// the kernel stack (spec §4.6: fds, executable write-deny, SPT
    /// including writeback, address space). The kernel stack itself is
    /// freed later by the scheduler's retire path.
    pub fn terminate(&mut self, exit_code: i32) {
        self.state = ProcessState::Terminated(exit_code);
        self.exit_code = Some(exit_code);

        self.fd_table.clear();
        if let Some(executable) = self.executable.take() {
            executable.allow_write();
        }
        let table = self.page_table.as_deref();
        for desc in self.spt.iter_mut() {
            let dirty = table.map_or(false, |t| crate::memory::page_table::is_dirty(t, desc.va));
            crate::memory::fault::writeback_and_release(desc, dirty);
        }
        self.spt.destroy_all();
        if let Some(table) = self.page_table.take() {
            table.destroy();
        }
    }

    /// Install an fd, returning its number. Reuses the lowest closed slot.
    pub fn install_fd(&mut self, file: Arc<OpenFile>) -> usize {
        for (i, slot) in self.fd_table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return i;
            }
        }
        self.fd_table.push(Some(file));
        self.fd_table.len() - 1
    }

    /// Add a child process
    pub fn add_child(&mut self, child_id: ProcessId) {
        self.children.push(child_id);
    }

}