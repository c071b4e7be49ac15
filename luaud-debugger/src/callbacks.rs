//! VM callback glue.
//!
//! Adapts the VM's four debug callbacks to bridge operations. The glue
//! holds a weak reference so the VM outliving the debugger never keeps
//! the bridge alive (the original back-pointer lived in the VM's
//! per-thread data slot; an `Arc` cycle is the failure mode here).

use std::sync::{Arc, Weak};

use luaud_vm::{DebugRecord, ThreadId, VmCallbacks};

use crate::bridge::DebugBridge;

/// The callback set installed on the VM's main state.
pub struct BridgeCallbacks {
    bridge: Weak<DebugBridge>,
}

impl BridgeCallbacks {
    pub fn new(bridge: &Arc<DebugBridge>) -> Arc<Self> {
        Arc::new(Self {
            bridge: Arc::downgrade(bridge),
        })
    }

    fn bridge(&self) -> Option<Arc<DebugBridge>> {
        self.bridge.upgrade()
    }
}

impl VmCallbacks for BridgeCallbacks {
    fn debug_break(&self, thread: ThreadId, _record: &DebugRecord) {
        if let Some(bridge) = self.bridge() {
            let reason = bridge.classify_break(thread);
            bridge.enter_break(thread, reason);
        }
    }

    fn debug_step(&self, thread: ThreadId, _record: &DebugRecord) -> bool {
        self.bridge()
            .is_some_and(|bridge| bridge.on_debug_step(thread))
    }

    fn interrupt(&self, thread: ThreadId) {
        if let Some(bridge) = self.bridge() {
            bridge.on_interrupt(thread);
        }
    }

    fn user_thread(&self, parent: Option<ThreadId>, thread: ThreadId) {
        if let Some(bridge) = self.bridge() {
            bridge.on_user_thread(parent, thread);
        }
    }
}
