//! RAII wrapper over the VM's reference table.

use std::fmt;
use std::sync::Arc;

use luaud_vm::{RefId, ScriptVm, Value};

/// A strong hold on a VM value, released on drop.
///
/// Used wherever the adapter must keep a heap object alive across
/// suspension points: loaded closures, their loader threads, and the
/// containers behind compound variable scopes.
pub struct VmRef {
    vm: Arc<dyn ScriptVm>,
    id: RefId,
}

impl VmRef {
    /// Pin `value` in the VM's reference table.
    pub fn new(vm: Arc<dyn ScriptVm>, value: &Value) -> Self {
        let id = vm.create_ref(value);
        Self { vm, id }
    }

    /// Resolve the pinned value. `None` only if the VM discarded its
    /// reference table (shutdown).
    pub fn get(&self) -> Option<Value> {
        self.vm.lookup_ref(self.id)
    }
}

impl fmt::Debug for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmRef").field("id", &self.id).finish()
    }
}

impl Drop for VmRef {
    fn drop(&mut self) {
        self.vm.release_ref(self.id);
    }
}
