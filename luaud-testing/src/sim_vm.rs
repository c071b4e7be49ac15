//! Simulated VM implementing the `luaud-vm` contract.
//!
//! Executes [`Proto`] statement lists on an in-memory heap and fires
//! the debug callbacks with the real VM's ordering: interrupt before
//! every statement, then the single-step callback while enabled, then
//! the break callback when the statement's line carries a breakpoint
//! and single-stepping did not already suspend there.
//!
//! All VM-side calls issued by the adapter (`call`, `compile`,
//! introspection) run without firing callbacks, mirroring the real
//! VM's disabled-instrumentation evaluation mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use luaud_vm::{
    DebugRecord, FrameInfo, ObjectId, RefId, ScriptVm, ThreadId, ThreadStatus, Value, VmCallbacks,
    VmError,
};

use crate::program::{Op, ProgramExpr, Proto, Stmt};

/// Host-defined native function.
pub type BuiltinFn = Arc<dyn Fn(&SimVm, &[Value]) -> Result<Vec<Value>, VmError> + Send + Sync>;

#[derive(Default)]
struct TableData {
    entries: Vec<(Value, Value)>,
    metatable: Option<ObjectId>,
}

enum FunctionData {
    /// An instantiated [`Proto`].
    Script {
        proto: Arc<Proto>,
        env: ObjectId,
        upvalues: Vec<(String, Value)>,
    },
    /// A compiled expression or statement.
    Expr { ast: Ast, env: Option<ObjectId> },
    /// A native function registered by a test.
    Builtin { call: BuiltinFn },
}

struct Frame {
    function: ObjectId,
    proto: Arc<Proto>,
    pc: usize,
    line: u32,
    locals: Vec<(String, Value)>,
}

struct ThreadData {
    status: ThreadStatus,
    frames: Vec<Frame>,
}

struct VmState {
    next_object: u64,
    next_thread: u64,
    next_ref: u32,
    tables: HashMap<ObjectId, TableData>,
    functions: HashMap<ObjectId, FunctionData>,
    userdata: HashMap<ObjectId, Option<ObjectId>>,
    threads: HashMap<ThreadId, ThreadData>,
    refs: HashMap<RefId, Value>,
    protos: HashMap<String, Arc<Proto>>,
    instances: HashMap<String, ObjectId>,
    /// Armed breakpoints as `(raw source, line)`.
    breakpoints: HashSet<(String, u32)>,
    globals: ObjectId,
    main: ThreadId,
}

/// The simulated VM. Execution happens on whichever thread calls
/// [`SimVm::run_entry`]; that thread is "the VM thread".
pub struct SimVm {
    state: Mutex<VmState>,
    callbacks: Mutex<Option<Arc<dyn VmCallbacks>>>,
    single_step: AtomicBool,
    suppress_callbacks: AtomicBool,
}

enum Flow {
    Next,
    Jump(usize),
    Return,
    /// This thread yielded (status already updated).
    Yield,
}

/// How a run loop ended.
#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Finished,
    Yielded,
}

impl SimVm {
    pub fn new() -> Arc<Self> {
        let globals = ObjectId(0x1000);
        let main = ThreadId(1);
        let mut tables = HashMap::new();
        tables.insert(globals, TableData::default());
        let mut threads = HashMap::new();
        threads.insert(
            main,
            ThreadData {
                status: ThreadStatus::Running,
                frames: Vec::new(),
            },
        );
        Arc::new(Self {
            state: Mutex::new(VmState {
                next_object: 0x1001,
                next_thread: 2,
                next_ref: 1,
                tables,
                functions: HashMap::new(),
                userdata: HashMap::new(),
                threads,
                refs: HashMap::new(),
                protos: HashMap::new(),
                instances: HashMap::new(),
                breakpoints: HashSet::new(),
                globals,
                main,
            }),
            callbacks: Mutex::new(None),
            single_step: AtomicBool::new(false),
            suppress_callbacks: AtomicBool::new(false),
        })
    }

    // ── fixture construction ─────────────────────────────────────────────

    pub fn register_proto(&self, proto: Proto) {
        let mut state = self.state.lock();
        state.protos.insert(proto.name.clone(), Arc::new(proto));
    }

    /// Function object for a registered proto, created on first use.
    pub fn instantiate(&self, name: &str) -> Result<Value, VmError> {
        let mut state = self.state.lock();
        if let Some(&id) = state.instances.get(name) {
            return Ok(Value::Function(id));
        }
        let proto = state
            .protos
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("unknown function: {name}")))?;
        let id = state.fresh_object();
        let globals = state.globals;
        let upvalues = proto.upvalues.clone();
        state.functions.insert(
            id,
            FunctionData::Script {
                proto,
                env: globals,
                upvalues,
            },
        );
        state.instances.insert(name.to_string(), id);
        Ok(Value::Function(id))
    }

    /// Register a native function value.
    pub fn register_builtin(&self, call: BuiltinFn) -> Value {
        let mut state = self.state.lock();
        let id = state.fresh_object();
        state.functions.insert(id, FunctionData::Builtin { call });
        Value::Function(id)
    }

    /// Fresh table initialized from constant pairs.
    pub fn create_table(&self, pairs: Vec<(Value, Value)>) -> Value {
        let mut state = self.state.lock();
        let id = state.fresh_object();
        state.tables.insert(
            id,
            TableData {
                entries: pairs,
                metatable: None,
            },
        );
        Value::Table(id)
    }

    /// Fresh userdata, optionally with a metatable.
    pub fn create_userdata(&self, metatable: Option<&Value>) -> Value {
        let mut state = self.state.lock();
        let id = state.fresh_object();
        let mt = metatable.and_then(Value::object_id);
        state.userdata.insert(id, mt);
        Value::UserData(id)
    }

    /// Attach a metatable to a table or userdata.
    pub fn set_metatable(&self, value: &Value, metatable: &Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let mt = metatable.object_id().ok_or(VmError::Type {
            operation: "setmetatable",
            expected: "table",
            actual: metatable.type_name(),
        })?;
        match value {
            Value::Table(id) => {
                state
                    .tables
                    .get_mut(id)
                    .ok_or_else(|| VmError::Runtime("stale table".into()))?
                    .metatable = Some(mt);
                Ok(())
            }
            Value::UserData(id) => {
                state.userdata.insert(*id, Some(mt));
                Ok(())
            }
            other => Err(VmError::Type {
                operation: "setmetatable",
                expected: "table or userdata",
                actual: other.type_name(),
            }),
        }
    }

    pub fn set_global(&self, name: &str, value: Value) {
        let mut state = self.state.lock();
        let globals = state.globals;
        state.table_set(globals, Value::String(name.to_string()), value);
    }

    /// Breakpoints currently armed in the VM, as `(source, line)`.
    /// Test-side observability for the activation invariants.
    pub fn armed_breakpoints(&self) -> Vec<(String, u32)> {
        let state = self.state.lock();
        let mut armed: Vec<_> = state.breakpoints.iter().cloned().collect();
        armed.sort();
        armed
    }

    // ── execution driver ─────────────────────────────────────────────────

    /// Run a top-level closure on the main thread to completion. The
    /// calling thread becomes the VM thread.
    pub fn run_entry(&self, function: &Value) -> Result<(), VmError> {
        let main = self.main_thread();
        self.push_call(main, function)?;
        match self.run_until_depth(main, 0)? {
            RunOutcome::Finished => Ok(()),
            RunOutcome::Yielded => Err(VmError::Runtime("thread yielded unexpectedly".into())),
        }
    }

    fn push_call(&self, thread: ThreadId, function: &Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let id = function.object_id().ok_or(VmError::Type {
            operation: "call",
            expected: "function",
            actual: function.type_name(),
        })?;
        let Some(FunctionData::Script { proto, .. }) = state.functions.get(&id) else {
            return Err(VmError::Type {
                operation: "call",
                expected: "script function",
                actual: function.type_name(),
            });
        };
        let proto = Arc::clone(proto);
        let line = proto.stmts.first().map_or(0, |stmt| stmt.line);
        let frame = Frame {
            function: id,
            proto,
            pc: 0,
            line,
            locals: Vec::new(),
        };
        state
            .threads
            .get_mut(&thread)
            .ok_or(VmError::DeadThread)?
            .frames
            .push(frame);
        Ok(())
    }

    fn run_until_depth(&self, thread: ThreadId, stop_depth: usize) -> Result<RunOutcome, VmError> {
        loop {
            let fetched = {
                let mut state = self.state.lock();
                let Some(data) = state.threads.get_mut(&thread) else {
                    return Err(VmError::DeadThread);
                };
                loop {
                    if data.frames.len() <= stop_depth {
                        break None;
                    }
                    let frame = data
                        .frames
                        .last_mut()
                        .ok_or_else(|| VmError::Runtime("empty stack".into()))?;
                    match frame.proto.stmts.get(frame.pc).cloned() {
                        // Fell off the end: implicit return.
                        None => {
                            data.frames.pop();
                        }
                        Some(stmt) => {
                            frame.line = stmt.line;
                            break Some((stmt, frame.proto.source.clone()));
                        }
                    }
                }
            };
            let Some((stmt, source)) = fetched else {
                return Ok(RunOutcome::Finished);
            };

            self.fire_statement_callbacks(thread, &stmt, &source);

            match self.execute_op(thread, &stmt.op)? {
                Flow::Next => self.advance_pc(thread, None),
                Flow::Jump(target) => self.advance_pc(thread, Some(target)),
                Flow::Return => {
                    let mut state = self.state.lock();
                    if let Some(data) = state.threads.get_mut(&thread) {
                        data.frames.pop();
                    }
                }
                Flow::Yield => return Ok(RunOutcome::Yielded),
            }
        }
    }

    fn advance_pc(&self, thread: ThreadId, jump: Option<usize>) {
        let mut state = self.state.lock();
        if let Some(frame) = state
            .threads
            .get_mut(&thread)
            .and_then(|data| data.frames.last_mut())
        {
            frame.pc = jump.unwrap_or(frame.pc + 1);
        }
    }

    fn fire_statement_callbacks(&self, thread: ThreadId, stmt: &Stmt, source: &str) {
        if self.suppress_callbacks.load(Ordering::SeqCst) {
            return;
        }
        let Some(callbacks) = self.callbacks.lock().clone() else {
            return;
        };
        callbacks.interrupt(thread);

        let record = DebugRecord {
            source: Some(source.to_string()),
            line: stmt.line,
            name: None,
        };
        let mut suspended_by_step = false;
        if self.single_step.load(Ordering::SeqCst) {
            trace!(line = stmt.line, "debug step");
            suspended_by_step = callbacks.debug_step(thread, &record);
        }
        let armed = {
            let state = self.state.lock();
            state.breakpoints.contains(&(source.to_string(), stmt.line))
        };
        if armed && !suspended_by_step {
            trace!(line = stmt.line, "debug break");
            callbacks.debug_break(thread, &record);
        }
    }

    fn execute_op(&self, thread: ThreadId, op: &Op) -> Result<Flow, VmError> {
        match op {
            Op::Nop => Ok(Flow::Next),
            Op::Assign(name, expr) => {
                let value = self.eval_program_expr(thread, expr)?;
                self.set_frame_local(thread, name, value)?;
                Ok(Flow::Next)
            }
            Op::AssignGlobal(name, expr) => {
                let value = self.eval_program_expr(thread, expr)?;
                let mut state = self.state.lock();
                let globals = state.globals;
                state.table_set(globals, Value::String(name.clone()), value);
                Ok(Flow::Next)
            }
            Op::Call(callee) => {
                let function = self.instantiate(callee)?;
                let depth = self.depth_of(thread);
                self.push_call(thread, &function)?;
                match self.run_until_depth(thread, depth)? {
                    RunOutcome::Finished => Ok(Flow::Next),
                    // A yield inside a plain call suspends this thread.
                    RunOutcome::Yielded => Ok(Flow::Yield),
                }
            }
            Op::SpawnCoroutine { proto, local } => {
                let function = self.instantiate(proto)?;
                let coroutine = {
                    let mut state = self.state.lock();
                    let id = ThreadId(state.next_thread);
                    state.next_thread += 1;
                    state.threads.insert(
                        id,
                        ThreadData {
                            status: ThreadStatus::Yielded,
                            frames: Vec::new(),
                        },
                    );
                    id
                };
                self.push_call(coroutine, &function)?;
                if let Some(callbacks) = self.callbacks.lock().clone() {
                    callbacks.user_thread(Some(thread), coroutine);
                }
                self.set_frame_local(thread, local, Value::Thread(coroutine))?;
                Ok(Flow::Next)
            }
            Op::Resume(local) => {
                let value = self.read_frame_local(thread, local)?;
                let Value::Thread(coroutine) = value else {
                    return Err(VmError::Type {
                        operation: "resume",
                        expected: "thread",
                        actual: value.type_name(),
                    });
                };
                self.resume_coroutine(thread, coroutine)?;
                Ok(Flow::Next)
            }
            Op::Yield => {
                let mut state = self.state.lock();
                if let Some(data) = state.threads.get_mut(&thread) {
                    data.status = ThreadStatus::Yielded;
                }
                Ok(Flow::Yield)
            }
            Op::JumpIfLess {
                local,
                limit,
                target,
            } => {
                let value = self.read_frame_local(thread, local)?;
                let number = value.as_number().ok_or(VmError::Type {
                    operation: "compare",
                    expected: "number",
                    actual: value.type_name(),
                })?;
                if number < *limit {
                    Ok(Flow::Jump(*target))
                } else {
                    Ok(Flow::Next)
                }
            }
            Op::Return => Ok(Flow::Return),
        }
    }

    fn resume_coroutine(&self, resumer: ThreadId, coroutine: ThreadId) -> Result<(), VmError> {
        {
            let mut state = self.state.lock();
            match state.threads.get(&coroutine).map(|data| data.status) {
                Some(ThreadStatus::Yielded) => {}
                Some(ThreadStatus::Dead) | None => {
                    return Err(VmError::Runtime("cannot resume dead coroutine".into()))
                }
                Some(_) => {
                    return Err(VmError::Runtime("cannot resume non-suspended coroutine".into()))
                }
            }
            if let Some(data) = state.threads.get_mut(&resumer) {
                data.status = ThreadStatus::Normal;
            }
            if let Some(data) = state.threads.get_mut(&coroutine) {
                data.status = ThreadStatus::Running;
            }
        }

        let outcome = self.run_until_depth(coroutine, 0)?;

        let mut state = self.state.lock();
        if let Some(data) = state.threads.get_mut(&resumer) {
            data.status = ThreadStatus::Running;
        }
        match outcome {
            RunOutcome::Finished => {
                if let Some(data) = state.threads.get_mut(&coroutine) {
                    data.status = ThreadStatus::Dead;
                }
                drop(state);
                if let Some(callbacks) = self.callbacks.lock().clone() {
                    callbacks.user_thread(None, coroutine);
                }
            }
            // Status was set by the yield statement.
            RunOutcome::Yielded => {}
        }
        Ok(())
    }

    fn depth_of(&self, thread: ThreadId) -> usize {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map_or(0, |data| data.frames.len())
    }

    fn eval_program_expr(&self, thread: ThreadId, expr: &ProgramExpr) -> Result<Value, VmError> {
        match expr {
            ProgramExpr::Const(value) => Ok(value.clone()),
            ProgramExpr::Var(name) => self.read_frame_local(thread, name),
            ProgramExpr::Add(name, delta) => {
                let value = self.read_frame_local(thread, name)?;
                let number = value.as_number().ok_or(VmError::Type {
                    operation: "add",
                    expected: "number",
                    actual: value.type_name(),
                })?;
                Ok(Value::Number(number + delta))
            }
            ProgramExpr::Table(pairs) => Ok(self.create_table(pairs.clone())),
        }
    }

    fn set_frame_local(&self, thread: ThreadId, name: &str, value: Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let frame = state
            .threads
            .get_mut(&thread)
            .and_then(|data| data.frames.last_mut())
            .ok_or(VmError::DeadThread)?;
        if let Some(slot) = frame.locals.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            frame.locals.push((name.to_string(), value));
        }
        Ok(())
    }

    fn read_frame_local(&self, thread: ThreadId, name: &str) -> Result<Value, VmError> {
        let state = self.state.lock();
        let frame = state
            .threads
            .get(&thread)
            .and_then(|data| data.frames.last())
            .ok_or(VmError::DeadThread)?;
        if let Some((_, value)) = frame.locals.iter().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        // Fall back to globals, like an unqualified name would.
        let globals = state.globals;
        Ok(state.table_get(globals, &Value::String(name.to_string())))
    }

    fn suppressed_call<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.suppress_callbacks.swap(true, Ordering::SeqCst);
        let result = f();
        self.suppress_callbacks.store(previous, Ordering::SeqCst);
        result
    }

    // ── expression evaluation (compiled chunks) ──────────────────────────

    fn env_lookup(&self, env: Option<ObjectId>, name: &str) -> Value {
        let state = self.state.lock();
        let key = Value::String(name.to_string());
        let mut table = env.unwrap_or(state.globals);
        loop {
            let value = state.table_get(table, &key);
            if !value.is_nil() {
                return value;
            }
            // Follow the __index chain.
            let Some(mt) = state.tables.get(&table).and_then(|t| t.metatable) else {
                return Value::Nil;
            };
            let index = state.table_get(mt, &Value::String("__index".to_string()));
            match index.object_id() {
                Some(next) if matches!(index, Value::Table(_)) => table = next,
                _ => return Value::Nil,
            }
        }
    }

    fn eval_ast_expr(&self, expr: &Expr, env: Option<ObjectId>) -> Result<Value, VmError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => Ok(self.env_lookup(env, name)),
            Expr::Binary(lhs, op, rhs) => {
                let left = self.eval_ast_expr(lhs, env)?;
                let right = self.eval_ast_expr(rhs, env)?;
                eval_binary(&left, *op, &right)
            }
        }
    }
}

impl VmState {
    fn fresh_object(&mut self) -> ObjectId {
        let id = ObjectId(self.next_object);
        self.next_object += 1;
        id
    }

    fn table_get(&self, table: ObjectId, key: &Value) -> Value {
        self.tables
            .get(&table)
            .and_then(|data| {
                data.entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            })
            .unwrap_or(Value::Nil)
    }

    fn table_set(&mut self, table: ObjectId, key: Value, value: Value) {
        let Some(data) = self.tables.get_mut(&table) else {
            return;
        };
        if value.is_nil() {
            data.entries.retain(|(k, _)| k != &key);
            return;
        }
        if let Some(slot) = data.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            data.entries.push((key, value));
        }
    }

    fn metatable_of(&self, value: &Value) -> Option<ObjectId> {
        match value {
            Value::Table(id) => self.tables.get(id).and_then(|t| t.metatable),
            Value::UserData(id) => self.userdata.get(id).copied().flatten(),
            _ => None,
        }
    }
}

// ── the ScriptVm contract ────────────────────────────────────────────────

impl ScriptVm for SimVm {
    fn main_thread(&self) -> ThreadId {
        self.state.lock().main
    }

    fn install_callbacks(&self, callbacks: Arc<dyn VmCallbacks>) {
        *self.callbacks.lock() = Some(callbacks);
    }

    fn set_single_step(&self, enabled: bool) {
        self.single_step.store(enabled, Ordering::SeqCst);
    }

    fn thread_status(&self, thread: ThreadId) -> ThreadStatus {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map_or(ThreadStatus::Dead, |data| data.status)
    }

    fn create_ref(&self, value: &Value) -> RefId {
        let mut state = self.state.lock();
        let id = RefId(state.next_ref);
        state.next_ref += 1;
        state.refs.insert(id, value.clone());
        id
    }

    fn release_ref(&self, reference: RefId) {
        self.state.lock().refs.remove(&reference);
    }

    fn lookup_ref(&self, reference: RefId) -> Option<Value> {
        self.state.lock().refs.get(&reference).cloned()
    }

    fn set_breakpoint(&self, function: &Value, line: u32, enabled: bool) -> Result<u32, VmError> {
        let mut state = self.state.lock();
        let id = function.object_id().ok_or(VmError::Type {
            operation: "breakpoint",
            expected: "function",
            actual: function.type_name(),
        })?;
        let Some(FunctionData::Script { proto, .. }) = state.functions.get(&id) else {
            return Err(VmError::Type {
                operation: "breakpoint",
                expected: "script function",
                actual: function.type_name(),
            });
        };
        let source = proto.source.clone();
        // Like the real VM, placement considers every proto of the
        // chunk, so nested functions of the file are covered.
        let placed = state
            .protos
            .values()
            .filter(|p| p.source == source)
            .filter_map(|p| p.nearest_line(line))
            .min()
            .ok_or(VmError::InvalidLine(line))?;
        if enabled {
            state.breakpoints.insert((source, placed));
        } else {
            state.breakpoints.remove(&(source, placed));
        }
        Ok(placed)
    }

    fn stack_depth(&self, thread: ThreadId) -> u32 {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map_or(0, |data| data.frames.len() as u32)
    }

    fn frame_info(&self, thread: ThreadId, level: u32) -> Option<FrameInfo> {
        let state = self.state.lock();
        let data = state.threads.get(&thread)?;
        let index = data.frames.len().checked_sub(1 + level as usize)?;
        let frame = &data.frames[index];
        Some(FrameInfo {
            source: Some(frame.proto.source.clone()),
            line: frame.line,
            name: Some(frame.proto.name.clone()),
            function: Some(Value::Function(frame.function)),
            is_native: false,
        })
    }

    fn get_local(&self, thread: ThreadId, level: u32, index: u32) -> Option<(String, Value)> {
        if index == 0 {
            return None;
        }
        let state = self.state.lock();
        let data = state.threads.get(&thread)?;
        let frame_index = data.frames.len().checked_sub(1 + level as usize)?;
        data.frames[frame_index]
            .locals
            .get(index as usize - 1)
            .cloned()
    }

    fn set_local(
        &self,
        thread: ThreadId,
        level: u32,
        index: u32,
        value: &Value,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let data = state.threads.get_mut(&thread).ok_or(VmError::DeadThread)?;
        let frame_index = data
            .frames
            .len()
            .checked_sub(1 + level as usize)
            .ok_or(VmError::InvalidSlot(level))?;
        let slot = data.frames[frame_index]
            .locals
            .get_mut(index as usize - 1)
            .ok_or(VmError::InvalidSlot(index))?;
        slot.1 = value.clone();
        Ok(())
    }

    fn get_upvalue(&self, function: &Value, index: u32) -> Option<(String, Value)> {
        if index == 0 {
            return None;
        }
        let state = self.state.lock();
        let id = function.object_id()?;
        match state.functions.get(&id)? {
            FunctionData::Script { upvalues, .. } => upvalues.get(index as usize - 1).cloned(),
            _ => None,
        }
    }

    fn set_upvalue(&self, function: &Value, index: u32, value: &Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let id = function.object_id().ok_or(VmError::Type {
            operation: "setupvalue",
            expected: "function",
            actual: function.type_name(),
        })?;
        match state.functions.get_mut(&id) {
            Some(FunctionData::Script { upvalues, .. }) => {
                let slot = upvalues
                    .get_mut(index as usize - 1)
                    .ok_or(VmError::InvalidSlot(index))?;
                slot.1 = value.clone();
                Ok(())
            }
            _ => Err(VmError::Type {
                operation: "setupvalue",
                expected: "script function",
                actual: function.type_name(),
            }),
        }
    }

    fn globals(&self, _thread: ThreadId) -> Value {
        Value::Table(self.state.lock().globals)
    }

    fn function_env(&self, function: &Value) -> Option<Value> {
        let state = self.state.lock();
        let id = function.object_id()?;
        match state.functions.get(&id)? {
            FunctionData::Script { env, .. } => Some(Value::Table(*env)),
            FunctionData::Expr { env, .. } => Some(Value::Table(env.unwrap_or(state.globals))),
            FunctionData::Builtin { .. } => Some(Value::Table(state.globals)),
        }
    }

    fn new_table(&self) -> Value {
        self.create_table(Vec::new())
    }

    fn raw_get(&self, table: &Value, key: &Value) -> Result<Value, VmError> {
        let state = self.state.lock();
        match table {
            Value::Table(id) => Ok(state.table_get(*id, key)),
            other => Err(VmError::Type {
                operation: "rawget",
                expected: "table",
                actual: other.type_name(),
            }),
        }
    }

    fn raw_set(&self, table: &Value, key: &Value, value: &Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        match table {
            Value::Table(id) => {
                state.table_set(*id, key.clone(), value.clone());
                Ok(())
            }
            other => Err(VmError::Type {
                operation: "rawset",
                expected: "table",
                actual: other.type_name(),
            }),
        }
    }

    fn next_entry(
        &self,
        container: &Value,
        previous: Option<&Value>,
    ) -> Result<Option<(Value, Value)>, VmError> {
        let state = self.state.lock();
        let Value::Table(id) = container else {
            return Err(VmError::Type {
                operation: "next",
                expected: "table",
                actual: container.type_name(),
            });
        };
        let entries = &state
            .tables
            .get(id)
            .ok_or_else(|| VmError::Runtime("stale table".into()))?
            .entries;
        let next_index = match previous {
            None => 0,
            Some(key) => {
                let position = entries
                    .iter()
                    .position(|(k, _)| k == key)
                    .ok_or_else(|| VmError::Runtime("invalid key to next".into()))?;
                position + 1
            }
        };
        Ok(entries.get(next_index).cloned())
    }

    fn set_index_metatable(&self, table: &Value, index: &Value) -> Result<(), VmError> {
        let metatable = self.create_table(vec![(
            Value::String("__index".to_string()),
            index.clone(),
        )]);
        self.set_metatable(table, &metatable)
    }

    fn get_metafield(&self, value: &Value, field: &str) -> Option<Value> {
        let state = self.state.lock();
        let mt = state.metatable_of(value)?;
        let result = state.table_get(mt, &Value::String(field.to_string()));
        if result.is_nil() {
            None
        } else {
            Some(result)
        }
    }

    fn compile(&self, source: &str, _chunk_name: &str) -> Result<Value, VmError> {
        let ast = parse_chunk(source)?;
        let mut state = self.state.lock();
        let id = state.fresh_object();
        state
            .functions
            .insert(id, FunctionData::Expr { ast, env: None });
        Ok(Value::Function(id))
    }

    fn set_function_env(&self, function: &Value, env: &Value) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let id = function.object_id().ok_or(VmError::Type {
            operation: "setfenv",
            expected: "function",
            actual: function.type_name(),
        })?;
        let env_id = match env {
            Value::Table(id) => *id,
            other => {
                return Err(VmError::Type {
                    operation: "setfenv",
                    expected: "table",
                    actual: other.type_name(),
                })
            }
        };
        match state.functions.get_mut(&id) {
            Some(FunctionData::Expr { env, .. }) => {
                *env = Some(env_id);
                Ok(())
            }
            Some(FunctionData::Script { env, .. }) => {
                *env = env_id;
                Ok(())
            }
            _ => Err(VmError::Type {
                operation: "setfenv",
                expected: "function",
                actual: function.type_name(),
            }),
        }
    }

    fn call(
        &self,
        thread: ThreadId,
        function: &Value,
        args: &[Value],
    ) -> Result<Vec<Value>, VmError> {
        let id = function.object_id().ok_or(VmError::Type {
            operation: "call",
            expected: "function",
            actual: function.type_name(),
        })?;

        enum Target {
            Expr(Ast, Option<ObjectId>),
            Builtin(BuiltinFn),
            Script,
        }
        let target = {
            let state = self.state.lock();
            match state.functions.get(&id) {
                Some(FunctionData::Expr { ast, env }) => Target::Expr(ast.clone(), *env),
                Some(FunctionData::Builtin { call }) => Target::Builtin(Arc::clone(call)),
                Some(FunctionData::Script { .. }) => Target::Script,
                None => {
                    return Err(VmError::Runtime("attempt to call a stale function".into()));
                }
            }
        };

        match target {
            Target::Expr(ast, env) => match ast {
                Ast::Return(expr) => Ok(vec![self.eval_ast_expr(&expr, env)?]),
                Ast::Assign(name, expr) => {
                    let value = self.eval_ast_expr(&expr, env)?;
                    let mut state = self.state.lock();
                    let table = env.unwrap_or(state.globals);
                    state.table_set(table, Value::String(name), value);
                    Ok(Vec::new())
                }
            },
            Target::Builtin(call) => call(self, args),
            Target::Script => self.suppressed_call(|| {
                let depth = self.depth_of(thread);
                self.push_call(thread, function)?;
                match self.run_until_depth(thread, depth)? {
                    RunOutcome::Finished => Ok(Vec::new()),
                    RunOutcome::Yielded => {
                        Err(VmError::Runtime("attempt to yield across call".into()))
                    }
                }
            }),
        }
    }
}

// ── compiled-chunk AST ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Ast {
    Return(Expr),
    Assign(String, Expr),
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

fn eval_binary(left: &Value, op: BinOp, right: &Value) -> Result<Value, VmError> {
    match op {
        BinOp::Eq => Ok(Value::Boolean(left == right)),
        BinOp::Ne => Ok(Value::Boolean(left != right)),
        _ => {
            let (Some(l), Some(r)) = (left.as_number(), right.as_number()) else {
                return Err(VmError::Runtime(format!(
                    "attempt to perform arithmetic on a {} value",
                    if left.as_number().is_none() {
                        left.type_name()
                    } else {
                        right.type_name()
                    }
                )));
            };
            Ok(match op {
                BinOp::Lt => Value::Boolean(l < r),
                BinOp::Le => Value::Boolean(l <= r),
                BinOp::Gt => Value::Boolean(l > r),
                BinOp::Ge => Value::Boolean(l >= r),
                BinOp::Add => Value::Number(l + r),
                BinOp::Sub => Value::Number(l - r),
                BinOp::Mul => Value::Number(l * r),
                BinOp::Div => Value::Number(l / r),
                BinOp::Eq | BinOp::Ne => unreachable!(),
            })
        }
    }
}

// ── tiny expression parser ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Sym(&'static str),
}

fn tokenize(source: &str) -> Result<Vec<Token>, VmError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text
                    .parse()
                    .map_err(|_| VmError::Compile(format!("malformed number near '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(d) if d == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => {
                                return Err(VmError::Compile("unfinished string".to_string()));
                            }
                        },
                        Some(d) => text.push(d),
                        None => return Err(VmError::Compile("unfinished string".to_string())),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Sym("=="));
                } else {
                    tokens.push(Token::Sym("="));
                }
            }
            '~' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Sym("~="));
                } else {
                    return Err(VmError::Compile("unexpected '~'".to_string()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Sym("<="));
                } else {
                    tokens.push(Token::Sym("<"));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Sym(">="));
                } else {
                    tokens.push(Token::Sym(">"));
                }
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                chars.next();
                let sym = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '(' => "(",
                    ')' => ")",
                    _ => ",",
                };
                tokens.push(Token::Sym(sym));
            }
            other => {
                return Err(VmError::Compile(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, VmError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Sym("==")) => Some(BinOp::Eq),
            Some(Token::Sym("~=")) => Some(BinOp::Ne),
            Some(Token::Sym("<")) => Some(BinOp::Lt),
            Some(Token::Sym("<=")) => Some(BinOp::Le),
            Some(Token::Sym(">")) => Some(BinOp::Gt),
            Some(Token::Sym(">=")) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.position += 1;
            let right = self.parse_additive()?;
            return Ok(Expr::Binary(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Sym("+")) => BinOp::Add,
                Some(Token::Sym("-")) => BinOp::Sub,
                _ => break,
            };
            self.position += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, VmError> {
        let mut left = self.parse_primary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Sym("*")) => BinOp::Mul,
                Some(Token::Sym("/")) => BinOp::Div,
                _ => break,
            };
            self.position += 1;
            let right = self.parse_primary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, VmError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "nil" => Ok(Expr::Literal(Value::Nil)),
                "true" => Ok(Expr::Literal(Value::Boolean(true))),
                "false" => Ok(Expr::Literal(Value::Boolean(false))),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::Sym("-")) => {
                let inner = self.parse_primary()?;
                Ok(Expr::Binary(
                    Box::new(Expr::Literal(Value::Number(0.0))),
                    BinOp::Sub,
                    Box::new(inner),
                ))
            }
            Some(Token::Sym("(")) => {
                let first = self.parse_expr()?;
                if self.eat_sym(",") {
                    // Vector literal: three numeric components.
                    let second = self.parse_expr()?;
                    if !self.eat_sym(",") {
                        return Err(VmError::Compile("expected ',' in vector".to_string()));
                    }
                    let third = self.parse_expr()?;
                    if !self.eat_sym(")") {
                        return Err(VmError::Compile("expected ')' in vector".to_string()));
                    }
                    return Ok(Expr::Literal(Value::Vector([
                        const_number(&first)? as f32,
                        const_number(&second)? as f32,
                        const_number(&third)? as f32,
                    ])));
                }
                if !self.eat_sym(")") {
                    return Err(VmError::Compile("expected ')'".to_string()));
                }
                Ok(first)
            }
            other => Err(VmError::Compile(format!("unexpected token: {other:?}"))),
        }
    }
}

/// Constant-fold a numeric component of a vector literal.
fn const_number(expr: &Expr) -> Result<f64, VmError> {
    match expr {
        Expr::Literal(Value::Number(n)) => Ok(*n),
        Expr::Binary(left, op, right) => {
            match eval_binary(
                &Value::Number(const_number(left)?),
                *op,
                &Value::Number(const_number(right)?),
            )? {
                Value::Number(n) => Ok(n),
                _ => Err(VmError::Compile(
                    "vector components must be numbers".to_string(),
                )),
            }
        }
        _ => Err(VmError::Compile(
            "vector components must be numbers".to_string(),
        )),
    }
}

/// Parse a compiled chunk: `return <expr>`, an assignment statement, or
/// a bare expression.
fn parse_chunk(source: &str) -> Result<Ast, VmError> {
    let trimmed = source.trim();
    if let Some(rest) = trimmed
        .strip_prefix("return ")
        .or_else(|| trimmed.strip_prefix("return\t"))
    {
        let mut parser = Parser {
            tokens: tokenize(rest)?,
            position: 0,
        };
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(VmError::Compile("unexpected trailing input".to_string()));
        }
        return Ok(Ast::Return(expr));
    }

    let tokens = tokenize(trimmed)?;
    // Assignment statement: `name = expr`.
    if let (Some(Token::Ident(name)), Some(Token::Sym("="))) = (tokens.first(), tokens.get(1)) {
        let mut parser = Parser {
            tokens: tokens[2..].to_vec(),
            position: 0,
        };
        let name = name.clone();
        let expr = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(VmError::Compile("unexpected trailing input".to_string()));
        }
        return Ok(Ast::Assign(name, expr));
    }

    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.parse_expr()?;
    if parser.peek().is_some() {
        return Err(VmError::Compile("unexpected trailing input".to_string()));
    }
    Ok(Ast::Return(expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals() {
        assert!(matches!(
            parse_chunk("return 3"),
            Ok(Ast::Return(Expr::Literal(Value::Number(n)))) if n == 3.0
        ));
        assert!(matches!(
            parse_chunk(r#"return "hi""#),
            Ok(Ast::Return(Expr::Literal(Value::String(ref s)))) if s == "hi"
        ));
        assert!(matches!(
            parse_chunk("return nil"),
            Ok(Ast::Return(Expr::Literal(Value::Nil)))
        ));
    }

    #[test]
    fn parses_vector_literals() {
        assert!(matches!(
            parse_chunk("return (1, 2, 3)"),
            Ok(Ast::Return(Expr::Literal(Value::Vector(v)))) if v == [1.0, 2.0, 3.0]
        ));
    }

    #[test]
    fn return_of_assignment_fails_to_compile() {
        assert!(matches!(parse_chunk("return x = 5"), Err(VmError::Compile(_))));
        assert!(matches!(parse_chunk("x = 5"), Ok(Ast::Assign(_, _))));
    }

    #[test]
    fn comparison_parses() {
        assert!(matches!(
            parse_chunk("return i == 3"),
            Ok(Ast::Return(Expr::Binary(_, BinOp::Eq, _)))
        ));
    }

    #[test]
    fn simvm_runs_a_straight_line_program() {
        use crate::program::{Op, ProgramExpr, Proto};

        let vm = SimVm::new();
        vm.register_proto(
            Proto::new("main", "@/scripts/plain.lua")
                .stmt(1, Op::Assign("x".into(), ProgramExpr::Const(Value::Number(1.0))))
                .stmt(2, Op::Assign("x".into(), ProgramExpr::Add("x".into(), 2.0)))
                .stmt(3, Op::AssignGlobal("done".into(), ProgramExpr::Var("x".into())))
                .stmt(4, Op::Return),
        );
        let main = vm.instantiate("main").unwrap();
        vm.run_entry(&main).unwrap();

        let globals = vm.globals(vm.main_thread());
        let done = vm
            .raw_get(&globals, &Value::String("done".into()))
            .unwrap();
        assert_eq!(done, Value::Number(3.0));
    }

    #[test]
    fn simvm_snaps_breakpoints_to_statements() {
        use crate::program::{Op, Proto};

        let vm = SimVm::new();
        vm.register_proto(
            Proto::new("main", "@/scripts/snap.lua")
                .stmt(2, Op::Nop)
                .stmt(7, Op::Nop)
                .stmt(9, Op::Return),
        );
        let main = vm.instantiate("main").unwrap();
        assert_eq!(vm.set_breakpoint(&main, 1, true).unwrap(), 2);
        assert_eq!(vm.set_breakpoint(&main, 3, true).unwrap(), 7);
        assert!(vm.set_breakpoint(&main, 10, true).is_err());
    }

    #[test]
    fn eval_env_falls_through_index_chain() {
        let vm = SimVm::new();
        vm.set_global("answer", Value::Number(42.0));

        let env = vm.new_table();
        let globals = vm.globals(vm.main_thread());
        vm.set_index_metatable(&env, &globals).unwrap();
        vm.raw_set(&env, &Value::String("x".into()), &Value::Number(5.0))
            .unwrap();

        let chunk = vm.compile("return x + answer", "=test").unwrap();
        vm.set_function_env(&chunk, &env).unwrap();
        let results = vm.call(vm.main_thread(), &chunk, &[]).unwrap();
        assert_eq!(results, vec![Value::Number(47.0)]);
    }
}
