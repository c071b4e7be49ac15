//! Breakpoint and file store.
//!
//! A [`File`] collects the breakpoints of one normalized source path
//! together with every loaded top-level closure of that path. The
//! invariant maintained throughout: every stored breakpoint is armed on
//! every [`FunctionRef`] of its file, so the VM is guaranteed to call
//! back when an instrumented line executes.

use std::collections::HashMap;
use std::sync::Arc;

use luaud_vm::{ScriptVm, ThreadId, Value};
use tracing::{debug, info, warn};

use crate::vmref::VmRef;

/// One line breakpoint, optionally conditional.
#[derive(Debug)]
pub struct BreakPoint {
    line: u32,
    /// Line the VM actually instrumented; differs from `line` when the
    /// requested line holds no executable statement.
    target_line: u32,
    condition: Option<String>,
}

impl BreakPoint {
    pub fn new(line: u32) -> Self {
        Self {
            line,
            target_line: line,
            condition: None,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn target_line(&self) -> u32 {
        self.target_line
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn set_condition(&mut self, condition: Option<String>) {
        self.condition = condition;
    }

    /// Arm or disarm this breakpoint on one loaded closure. Returns
    /// false when the VM could not place it.
    fn enable_on(&mut self, vm: &dyn ScriptVm, function: &Value, enabled: bool) -> bool {
        match vm.set_breakpoint(function, self.line, enabled) {
            Ok(placed) => {
                if enabled {
                    self.target_line = placed;
                }
                true
            }
            Err(e) => {
                warn!(line = self.line, "failed to place breakpoint: {e}");
                false
            }
        }
    }

}

/// Strong hold on a loaded top-level closure and the script thread it
/// was loaded on. Dropping the ref releases both registry slots.
#[derive(Debug)]
pub struct FunctionRef {
    function: VmRef,
    _thread: VmRef,
}

impl FunctionRef {
    pub fn new(vm: &Arc<dyn ScriptVm>, thread: ThreadId, function: &Value) -> Self {
        Self {
            function: VmRef::new(Arc::clone(vm), function),
            _thread: VmRef::new(Arc::clone(vm), &Value::Thread(thread)),
        }
    }

    /// The pinned closure.
    pub fn function(&self) -> Option<Value> {
        self.function.get()
    }
}

/// Breakpoints and loaded instances of one source file.
#[derive(Debug)]
pub struct File {
    path: String,
    breakpoints: HashMap<u32, BreakPoint>,
    refs: Vec<FunctionRef>,
}

impl File {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            breakpoints: HashMap::new(),
            refs: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// True once at least one closure of this file is loaded.
    pub fn is_loaded(&self) -> bool {
        !self.refs.is_empty()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &BreakPoint> {
        self.breakpoints.values()
    }

    /// Find a breakpoint by the line the VM reports, which is the
    /// instrumented line; fall back to the requested line.
    pub fn find_breakpoint(&self, line: u32) -> Option<&BreakPoint> {
        self.breakpoints
            .values()
            .find(|bp| bp.target_line == line)
            .or_else(|| self.breakpoints.get(&line))
    }

    pub fn breakpoint(&self, line: u32) -> Option<&BreakPoint> {
        self.breakpoints.get(&line)
    }

    pub fn breakpoint_mut(&mut self, line: u32) -> Option<&mut BreakPoint> {
        self.breakpoints.get_mut(&line)
    }

    /// Register a newly loaded closure and arm every breakpoint on it.
    pub fn add_ref(&mut self, vm: &dyn ScriptVm, function_ref: FunctionRef) {
        if let Some(function) = function_ref.function() {
            for bp in self.breakpoints.values_mut() {
                bp.enable_on(vm, &function, true);
            }
        }
        debug!(path = %self.path, refs = self.refs.len() + 1, "registered loaded closure");
        self.refs.push(function_ref);
    }

    /// Add a breakpoint, arming it on every loaded closure. Adding a
    /// line twice is a no-op.
    pub fn add_breakpoint(&mut self, vm: &dyn ScriptVm, line: u32) -> &BreakPoint {
        if !self.breakpoints.contains_key(&line) {
            info!(path = %self.path, line, "add breakpoint");
            let mut bp = BreakPoint::new(line);
            for function_ref in &self.refs {
                if let Some(function) = function_ref.function() {
                    bp.enable_on(vm, &function, true);
                }
            }
            self.breakpoints.insert(line, bp);
        }
        &self.breakpoints[&line]
    }

    /// Remove one breakpoint, disarming it everywhere.
    pub fn remove_breakpoint(&mut self, vm: &dyn ScriptVm, line: u32) {
        if let Some(mut bp) = self.breakpoints.remove(&line) {
            info!(path = %self.path, line, "remove breakpoint");
            for function_ref in &self.refs {
                if let Some(function) = function_ref.function() {
                    bp.enable_on(vm, &function, false);
                }
            }
        }
    }

    /// Remove breakpoints rejected by `keep`, disarming each.
    pub fn retain_breakpoints(&mut self, vm: &dyn ScriptVm, keep: impl Fn(&BreakPoint) -> bool) {
        let doomed: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| !keep(bp))
            .map(BreakPoint::line)
            .collect();
        for line in doomed {
            self.remove_breakpoint(vm, line);
        }
    }

    /// Disarm and drop every breakpoint.
    pub fn clear_breakpoints(&mut self, vm: &dyn ScriptVm) {
        info!(path = %self.path, "clear breakpoints");
        let lines: Vec<u32> = self.breakpoints.keys().copied().collect();
        for line in lines {
            self.remove_breakpoint(vm, line);
        }
    }
}
