//! FIFO of closures destined for the VM thread.
//!
//! The VM's breakpoint and callback APIs are not thread safe, so
//! mutating requests that arrive while the program is running are
//! parked here and drained from the VM's interrupt callback, which is
//! guaranteed to run between instructions on the VM thread.

use parking_lot::Mutex;
use std::thread::ThreadId;

type Task = Box<dyn FnOnce() + Send>;

/// Work queue drained at every VM interrupt.
#[derive(Default)]
pub struct TaskPool {
    vm_thread: Mutex<Option<ThreadId>>,
    tasks: Mutex<Vec<Task>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the calling thread as the VM thread. Called once at
    /// initialization and again on every drain, so the pool stays
    /// correct even if the host migrates the VM.
    pub fn bind_current_thread(&self) {
        *self.vm_thread.lock() = Some(std::thread::current().id());
    }

    /// Run `task` inline when already on the VM thread, otherwise queue
    /// it for the next drain.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_vm_thread() {
            task();
            return;
        }
        self.tasks.lock().push(Box::new(task));
    }

    /// Execute everything queued, in submission order. Must be called
    /// from the VM thread.
    pub fn drain(&self) {
        self.bind_current_thread();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task();
        }
    }

    /// Number of queued tasks (excludes inline execution).
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    fn is_vm_thread(&self) -> bool {
        *self.vm_thread.lock() == Some(std::thread::current().id())
    }
}
