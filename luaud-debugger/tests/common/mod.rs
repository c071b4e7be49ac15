//! Shared harness: a simulated VM on its own thread plus a listening
//! debugger, mirroring how a host embeds the adapter.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use luaud_debugger::{Debugger, DebuggerConfig};
use luaud_testing::SimVm;
use luaud_vm::{ScriptVm, VmError};

static NEXT_PORT: AtomicU16 = AtomicU16::new(58100);

/// Unique port per test so suites can run concurrently.
pub fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

pub struct Harness {
    pub vm: Arc<SimVm>,
    pub debugger: Arc<Debugger>,
    pub port: u16,
    start_gate: Option<mpsc::Sender<()>>,
    vm_thread: Option<JoinHandle<Result<(), VmError>>>,
}

impl Harness {
    /// Boot the adapter and park the VM thread until [`Self::release`],
    /// so tests can configure breakpoints before execution begins.
    pub fn start(vm: Arc<SimVm>, entry: &str, entry_source: &str, stop_on_entry: bool) -> Self {
        luaud_testing::init_tracing();

        let port = next_port();
        let config = DebuggerConfig {
            stop_on_entry,
            ..DebuggerConfig::default()
        };
        let dyn_vm: Arc<dyn ScriptVm> = vm.clone();
        let debugger = Arc::new(Debugger::new(dyn_vm, config));
        // Keep the test process alive through launch disconnects.
        debugger.set_terminate_hook(Arc::new(|| {}));
        debugger.listen(port).expect("listen on test port");

        let (start_gate, gated) = mpsc::channel();
        let vm_thread = {
            let vm = Arc::clone(&vm);
            let debugger = Arc::clone(&debugger);
            let entry = entry.to_string();
            let entry_source = entry_source.to_string();
            std::thread::spawn(move || {
                debugger.initialize(vm.main_thread());
                let _ = gated.recv();
                let function = vm.instantiate(&entry)?;
                debugger.on_file_loaded(vm.main_thread(), &function, &entry_source, true);
                vm.run_entry(&function)
            })
        };

        Self {
            vm,
            debugger,
            port,
            start_gate: Some(start_gate),
            vm_thread: Some(vm_thread),
        }
    }

    /// Let the parked VM thread load and run the entry script.
    pub fn release(&mut self) {
        if let Some(gate) = self.start_gate.take() {
            let _ = gate.send(());
        }
    }

    /// Wait for the program to finish.
    pub fn join_vm(&mut self) -> Result<(), VmError> {
        self.vm_thread
            .take()
            .expect("vm thread already joined")
            .join()
            .expect("vm thread panicked")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.release();
        // Shutdown frees any paused or entry-waiting VM before the join.
        self.debugger.stop();
        if let Some(handle) = self.vm_thread.take() {
            let _ = handle.join();
        }
    }
}
