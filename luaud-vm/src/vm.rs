//! The VM debug surface consumed by the adapter.

use std::sync::Arc;

use crate::error::VmError;
use crate::value::{RefId, ThreadId, Value};

/// Snapshot of the instruction the VM is stopped at, handed to debug
/// callbacks. Mirrors the `"sl n"` subset of the VM's debug record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugRecord {
    /// Raw source identifier of the running chunk (may carry a `@`/`=`
    /// prefix; the adapter normalizes it).
    pub source: Option<String>,
    /// Current line, 1-based.
    pub line: u32,
    /// Name of the running function, when the VM knows one.
    pub name: Option<String>,
}

/// Description of one stack frame.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Raw source identifier of the frame's chunk.
    pub source: Option<String>,
    /// Current line of the frame, 1-based. Zero for native frames.
    pub line: u32,
    /// Function name, when known.
    pub name: Option<String>,
    /// The frame's function value, used to reach upvalues and the
    /// function environment. Absent for native frames.
    pub function: Option<Value>,
    /// True when the frame executes host code rather than script.
    pub is_native: bool,
}

/// Scheduling state of a script thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing.
    Running,
    /// Alive, resumed another thread and is waiting for it.
    Normal,
    /// Suspended in a yield.
    Yielded,
    /// Finished or errored.
    Dead,
}

/// Callbacks the adapter installs on the VM's main state.
///
/// All four fire on the VM's execution thread. `debug_break` is expected
/// to block for the whole pause; the VM must not require it to return
/// promptly.
pub trait VmCallbacks: Send + Sync {
    /// A `break` instruction executed: a placed breakpoint fired or the
    /// script invoked the explicit break primitive.
    fn debug_break(&self, thread: ThreadId, record: &DebugRecord);

    /// Called before every statement while single-stepping is enabled.
    /// Returns true when execution was suspended; the VM then skips the
    /// `debug_break` a breakpoint on the same statement would fire, so
    /// one statement never produces two stops.
    fn debug_step(&self, thread: ThreadId, record: &DebugRecord) -> bool;

    /// Called periodically between instructions regardless of the
    /// single-step flag.
    fn interrupt(&self, thread: ThreadId);

    /// Coroutine lifecycle: `parent` is `Some` on creation and `None`
    /// when `thread` is about to be destroyed.
    fn user_thread(&self, parent: Option<ThreadId>, thread: ThreadId);
}

/// Debug interface of the host VM.
///
/// Unless noted, methods must be invoked on the VM thread; the adapter
/// marshals all of its calls there. The object itself must be shareable
/// across threads so the adapter can hold it from its server side.
pub trait ScriptVm: Send + Sync {
    /// The main state. Stable for the lifetime of the VM.
    fn main_thread(&self) -> ThreadId;

    /// Install the adapter's callback set on the main state. Callable
    /// from any thread before execution starts.
    fn install_callbacks(&self, callbacks: Arc<dyn VmCallbacks>);

    /// Toggle the per-statement `debug_step` callback.
    fn set_single_step(&self, enabled: bool);

    fn thread_status(&self, thread: ThreadId) -> ThreadStatus;

    // Reference table -----------------------------------------------------

    /// Take a strong hold on `value`, keeping it alive until released.
    fn create_ref(&self, value: &Value) -> RefId;

    fn release_ref(&self, reference: RefId);

    /// Resolve a previously created reference.
    fn lookup_ref(&self, reference: RefId) -> Option<Value>;

    // Breakpoints ---------------------------------------------------------

    /// Place or remove a line breakpoint on a loaded closure. Returns the
    /// line actually instrumented, which is the nearest executable
    /// statement at or after `line`.
    fn set_breakpoint(&self, function: &Value, line: u32, enabled: bool) -> Result<u32, VmError>;

    // Stack introspection -------------------------------------------------

    /// Number of call frames on `thread`. Zero for threads that have not
    /// started or have finished.
    fn stack_depth(&self, thread: ThreadId) -> u32;

    /// Frame description at `level`, 0 being the innermost frame.
    fn frame_info(&self, thread: ThreadId, level: u32) -> Option<FrameInfo>;

    /// Local slot `index` (1-based) of the frame at `level`, or `None`
    /// past the last local.
    fn get_local(&self, thread: ThreadId, level: u32, index: u32) -> Option<(String, Value)>;

    fn set_local(
        &self,
        thread: ThreadId,
        level: u32,
        index: u32,
        value: &Value,
    ) -> Result<(), VmError>;

    /// Upvalue slot `index` (1-based) of a closure, or `None` past the
    /// last upvalue.
    fn get_upvalue(&self, function: &Value, index: u32) -> Option<(String, Value)>;

    fn set_upvalue(&self, function: &Value, index: u32, value: &Value) -> Result<(), VmError>;

    /// Global environment table of `thread`.
    fn globals(&self, thread: ThreadId) -> Value;

    /// Environment table a closure resolves free names against.
    fn function_env(&self, function: &Value) -> Option<Value>;

    // Value operations ----------------------------------------------------

    fn new_table(&self) -> Value;

    fn raw_get(&self, table: &Value, key: &Value) -> Result<Value, VmError>;

    fn raw_set(&self, table: &Value, key: &Value, value: &Value) -> Result<(), VmError>;

    /// Raw iteration: the entry after `previous`, or the first entry when
    /// `previous` is `None`. `Ok(None)` once exhausted.
    fn next_entry(
        &self,
        container: &Value,
        previous: Option<&Value>,
    ) -> Result<Option<(Value, Value)>, VmError>;

    /// Make lookups that miss `table` fall through to `index`
    /// (`setmetatable(table, {{ __index = index }})`).
    fn set_index_metatable(&self, table: &Value, index: &Value) -> Result<(), VmError>;

    /// A field of the value's metatable, e.g. `__iter` or `__tostring`.
    fn get_metafield(&self, value: &Value, field: &str) -> Option<Value>;

    // Execution -----------------------------------------------------------

    /// Compile `source` into a callable closure. The closure starts with
    /// the default global environment; rebind it with
    /// [`ScriptVm::set_function_env`] before calling.
    fn compile(&self, source: &str, chunk_name: &str) -> Result<Value, VmError>;

    fn set_function_env(&self, function: &Value, env: &Value) -> Result<(), VmError>;

    /// Protected call with all results returned.
    fn call(
        &self,
        thread: ThreadId,
        function: &Value,
        args: &[Value],
    ) -> Result<Vec<Value>, VmError>;
}
