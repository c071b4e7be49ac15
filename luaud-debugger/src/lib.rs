//! # Luaud debugger
//!
//! In-process Debug Adapter Protocol server for a Luau-style byte-code
//! VM. The host embeds [`Debugger`], wires the VM behind the
//! [`luaud_vm::ScriptVm`] contract, and reports script loads and
//! runtime errors; IDE clients connect over TCP and drive breakpoints,
//! stepping, stack and variable inspection, variable mutation, and
//! expression evaluation in a paused frame.
//!
//! ## Threading
//!
//! Two threads interact: the VM thread, which is the only place VM
//! APIs are touched, and the DAP session thread driven by network I/O.
//! The [`bridge::DebugBridge`] is the rendezvous: the VM thread parks
//! there while paused and executes DAP-submitted work in place.
//!
//! ## Embedding
//!
//! ```no_run
//! use std::sync::Arc;
//! use luaud_debugger::{Debugger, DebuggerConfig};
//! use luaud_vm::ScriptVm;
//! # fn host_vm() -> Arc<dyn ScriptVm> { unimplemented!() }
//!
//! let vm = host_vm();
//! let config = DebuggerConfig { stop_on_entry: true, ..DebuggerConfig::default() };
//! let debugger = Debugger::new(Arc::clone(&vm), config);
//! debugger.initialize(vm.main_thread()); // on the VM thread
//! debugger.listen(58000).expect("port is free");
//! // ... host loads and runs scripts, reporting loads:
//! // debugger.on_file_loaded(thread, &closure, "@main.lua", true);
//! debugger.stop();
//! ```

pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod eval;
pub mod files;
pub mod format;
pub mod handlers;
pub mod paths;
pub mod server;
pub mod session;
pub mod stepping;
pub mod task_pool;
pub mod variables;
pub mod vm_registry;
pub mod vmref;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use luaud_vm::{ScriptVm, ThreadId, Value};

pub use bridge::DebugBridge;
pub use config::DebuggerConfig;
pub use error::DebuggerError;

use callbacks::BridgeCallbacks;
use server::DapServer;

/// Quiescence delay before dropping a session so queued outbound
/// errors reach the client.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(100);

/// The embedding surface exposed to the host application.
pub struct Debugger {
    bridge: Arc<DebugBridge>,
    server: Mutex<Option<DapServer>>,
    terminate: Mutex<Arc<dyn Fn() + Send + Sync>>,
}

impl Debugger {
    /// Create a debugger for `vm`. The VM is not touched until
    /// [`Debugger::initialize`].
    pub fn new(vm: Arc<dyn ScriptVm>, config: DebuggerConfig) -> Self {
        Self {
            bridge: Arc::new(DebugBridge::new(vm, &config)),
            server: Mutex::new(None),
            terminate: Mutex::new(Arc::new(|| std::process::exit(0))),
        }
    }

    /// Install the debug callbacks and register the main state. Must be
    /// called on the VM thread before any script runs.
    pub fn initialize(&self, main_thread: ThreadId) {
        self.bridge.initialize(main_thread);
        let callbacks = BridgeCallbacks::new(&self.bridge);
        self.bridge.vm().install_callbacks(callbacks);
    }

    /// Start accepting DAP clients on `port`.
    pub fn listen(&self, port: u16) -> Result<(), DebuggerError> {
        let terminate = self.terminate.lock().clone();
        let server = server::listen(Arc::clone(&self.bridge), port, terminate)?;
        *self.server.lock() = Some(server);
        Ok(())
    }

    /// Root for resolving relative script identifiers.
    pub fn set_root(&self, root: &str) {
        self.bridge.set_root(root);
    }

    /// Report a loaded top-level closure. Call on the VM thread with
    /// the closure returned by the load, before resuming it.
    pub fn on_file_loaded(
        &self,
        thread: ThreadId,
        function: &Value,
        raw_path: &str,
        is_entry: bool,
    ) {
        self.bridge.on_file_loaded(thread, function, raw_path, is_entry);
    }

    /// Forward a runtime error to the client's debug console.
    pub fn on_error(&self, message: &str, thread: Option<ThreadId>) {
        self.bridge.on_error(message, thread);
    }

    /// Replace the action taken when a launch-mode client disconnects.
    /// Defaults to exiting the process. Takes effect for sessions
    /// accepted after the next [`Debugger::listen`].
    pub fn set_terminate_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.terminate.lock() = hook;
    }

    /// Tear the server down, freeing a paused VM first.
    pub fn stop(&self) {
        info!("stopping debugger");
        self.bridge.shutdown();
        // Let any queued error output flush before the socket drops.
        std::thread::sleep(SHUTDOWN_FLUSH);
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
    }

    /// The underlying bridge, for hosts composing their own transport.
    pub fn bridge(&self) -> &Arc<DebugBridge> {
        &self.bridge
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
    }
}
