//! Scope and variable registry.
//!
//! Rebuilt on every entry into the Break state: the paused thread's
//! ancestor chain is walked innermost-first and every script frame gets
//! a `Local` and an `Upvalue` scope, followed by one `Global` scope for
//! the active environment. Scope handles are 31-bit hashes so they are
//! stable within an episode; contents are materialized lazily and
//! discarded by [`VariableRegistry::invalidate`] after mutations.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use luaud_vm::{ObjectId, ScriptVm, ThreadId, Value};
use tracing::{debug, warn};

use crate::error::DebuggerError;
use crate::eval;
use crate::format;
use crate::paths::PathMapper;
use crate::vmref::VmRef;

/// 31-bit handle for named scopes (`___locals__3`, `___globals__`).
pub fn scope_key_for_name(name: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    clamp_key(hasher.finish())
}

/// 31-bit handle keyed off a container's heap identity.
pub fn scope_key_for_object(id: ObjectId) -> i64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    clamp_key(hasher.finish())
}

fn clamp_key(hash: u64) -> i64 {
    let key = (hash & 0x7fff_ffff) as i64;
    if key == 0 {
        1
    } else {
        key
    }
}

fn local_scope_key(depth: u32) -> i64 {
    scope_key_for_name(&format!("___locals__{depth}"))
}

fn upvalue_scope_key(depth: u32) -> i64 {
    scope_key_for_name(&format!("___upvalues__{depth}"))
}

fn global_scope_key() -> i64 {
    scope_key_for_name("___globals__")
}

/// What a scope handle addresses.
#[derive(Debug)]
enum ScopeKind {
    Local {
        depth: u32,
    },
    Upvalue {
        depth: u32,
    },
    Global,
    /// A script table, pinned for the lifetime of the scope.
    Table {
        container: VmRef,
        frame_depth: u32,
    },
    UserData {
        container: VmRef,
        frame_depth: u32,
    },
}

/// One frame of the stitched logical stack.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Global depth across the ancestor chain; doubles as the DAP
    /// frame id.
    pub depth: u32,
    pub thread: ThreadId,
    /// Per-thread level as the VM counts it (0 = innermost).
    pub level: u32,
    /// Normalized source path; empty for native frames.
    pub source: String,
    pub line: u32,
    pub name: String,
    pub is_native: bool,
    pub function: Option<Value>,
}

/// One row of a variables response, plus what a write needs.
#[derive(Debug, Clone)]
pub struct VariableSnapshot {
    pub name: String,
    pub value: Value,
    pub display_value: String,
    pub display_type: String,
    /// Original numeric key, kept so integer table keys survive writes.
    pub numeric_key: Option<f64>,
    /// Frame whose environment evaluates replacement literals.
    pub frame_depth: u32,
    /// 1-based local/upvalue slot; 0 for container entries.
    pub slot: u32,
    /// Child scope handle, or 0 for non-expandable values.
    pub child: i64,
}

/// Result of a successful `setVariable`.
#[derive(Debug, Clone)]
pub struct SetVariableOutcome {
    pub display_value: String,
    pub display_type: String,
    pub child: i64,
}

/// The three handles returned by a `scopes` request.
#[derive(Debug, Clone, Copy)]
pub struct FrameScopes {
    pub locals: i64,
    pub upvalues: i64,
    pub globals: i64,
}

/// Registry of scope handles, frame records and lazily expanded
/// variable snapshots for the current Break episode.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    scopes: HashMap<i64, ScopeKind>,
    contents: HashMap<i64, Vec<VariableSnapshot>>,
    frames: Vec<FrameRecord>,
    break_thread: Option<ThreadId>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything, releasing the strong references held by
    /// compound scopes. Called when the Break episode ends.
    pub fn clear(&mut self) {
        self.scopes.clear();
        self.contents.clear();
        self.frames.clear();
        self.break_thread = None;
    }

    /// Forget expanded contents but keep handles and pinned containers,
    /// so the client can re-request after an `invalidated` event.
    pub fn invalidate(&mut self) {
        self.contents.clear();
    }

    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn break_thread(&self) -> Option<ThreadId> {
        self.break_thread
    }

    /// Rebuild frames and scope descriptors for a new Break episode.
    /// `ancestors` is the paused thread's chain, paused thread first.
    pub fn refresh(&mut self, vm: &dyn ScriptVm, mapper: &PathMapper, ancestors: &[ThreadId]) {
        self.clear();
        self.break_thread = ancestors.first().copied();

        let mut depth: u32 = 0;
        for &thread in ancestors {
            let frame_count = vm.stack_depth(thread);
            for level in 0..frame_count {
                let Some(info) = vm.frame_info(thread, level) else {
                    continue;
                };
                self.frames.push(FrameRecord {
                    depth,
                    thread,
                    level,
                    source: mapper.normalize(info.source.as_deref().unwrap_or("")),
                    line: info.line,
                    name: info.name.unwrap_or_else(|| "unknown".to_string()),
                    is_native: info.is_native,
                    function: info.function,
                });
                self.scopes
                    .insert(local_scope_key(depth), ScopeKind::Local { depth });
                self.scopes
                    .insert(upvalue_scope_key(depth), ScopeKind::Upvalue { depth });
                depth += 1;
            }
        }
        self.scopes.insert(global_scope_key(), ScopeKind::Global);
        debug!(frames = self.frames.len(), "variable registry refreshed");
    }

    /// Scope handles for one frame id.
    pub fn frame_scopes(&self, frame_id: i64) -> Result<FrameScopes, DebuggerError> {
        let depth = u32::try_from(frame_id).map_err(|_| DebuggerError::UnknownFrame(frame_id))?;
        if depth as usize >= self.frames.len() {
            return Err(DebuggerError::UnknownFrame(frame_id));
        }
        Ok(FrameScopes {
            locals: local_scope_key(depth),
            upvalues: upvalue_scope_key(depth),
            globals: global_scope_key(),
        })
    }

    /// Contents of a scope, expanding on first access.
    pub fn variables(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        key: i64,
    ) -> Result<Vec<VariableSnapshot>, DebuggerError> {
        self.ensure_expanded(vm, key)?;
        Ok(self.contents.get(&key).cloned().unwrap_or_default())
    }

    /// Register the container behind an `evaluate` result so the client
    /// can expand it. Returns 0 for non-expandable values.
    pub fn register_eval_result(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        value: &Value,
        frame_depth: u32,
    ) -> i64 {
        self.register_container(vm, value, frame_depth)
    }

    /// Write `literal` into the named variable of scope `key`.
    pub fn set_variable(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        key: i64,
        name: &str,
        literal: &str,
    ) -> Result<SetVariableOutcome, DebuggerError> {
        if !self.scopes.contains_key(&key) {
            return Err(DebuggerError::UnknownScope(key));
        }
        self.ensure_expanded(vm, key)?;

        let entry_index = self
            .contents
            .get(&key)
            .and_then(|rows| rows.iter().position(|row| row.name == name))
            .ok_or_else(|| DebuggerError::UnknownVariable(name.to_string()))?;
        let entry = self.contents[&key][entry_index].clone();

        let frame = self
            .frames
            .get(entry.frame_depth as usize)
            .cloned()
            .ok_or(DebuggerError::UnknownFrame(i64::from(entry.frame_depth)))?;

        let new_value = self.coerce_literal(vm.as_ref(), &frame, &entry.value, literal)?;

        match &self.scopes[&key] {
            ScopeKind::Local { .. } => {
                vm.set_local(frame.thread, frame.level, entry.slot, &new_value)?;
            }
            ScopeKind::Upvalue { .. } => {
                let function = frame.function.clone().ok_or_else(|| {
                    DebuggerError::State("frame has no function for upvalue write".to_string())
                })?;
                vm.set_upvalue(&function, entry.slot, &new_value)?;
            }
            ScopeKind::Global => {
                let thread = self.break_thread.ok_or(DebuggerError::NotPaused)?;
                let globals = vm.globals(thread);
                vm.raw_set(&globals, &table_key(name, entry.numeric_key), &new_value)?;
            }
            ScopeKind::Table { container, .. } | ScopeKind::UserData { container, .. } => {
                let container = container
                    .get()
                    .ok_or_else(|| DebuggerError::State("container was collected".to_string()))?;
                vm.raw_set(&container, &table_key(name, entry.numeric_key), &new_value)?;
            }
        }

        let thread = frame.thread;
        let child = if new_value.is_expandable() {
            self.register_container(vm, &new_value, entry.frame_depth)
        } else {
            0
        };
        let display_value = format::display_value(vm.as_ref(), thread, &new_value);
        let display_type = new_value.type_name().to_string();

        if let Some(rows) = self.contents.get_mut(&key) {
            let row = &mut rows[entry_index];
            row.value = new_value;
            row.display_value.clone_from(&display_value);
            row.display_type.clone_from(&display_type);
            row.child = child;
        }

        Ok(SetVariableOutcome {
            display_value,
            display_type,
            child,
        })
    }

    // ── expansion ────────────────────────────────────────────────────────

    fn ensure_expanded(&mut self, vm: &Arc<dyn ScriptVm>, key: i64) -> Result<(), DebuggerError> {
        if self.contents.contains_key(&key) {
            return Ok(());
        }

        // Resolve the plan first so expansion can re-borrow the registry.
        enum Plan {
            Local(u32),
            Upvalue(u32),
            Global,
            Container(Option<Value>, u32),
        }
        let plan = match self.scopes.get(&key) {
            None => return Err(DebuggerError::UnknownScope(key)),
            Some(ScopeKind::Local { depth }) => Plan::Local(*depth),
            Some(ScopeKind::Upvalue { depth }) => Plan::Upvalue(*depth),
            Some(ScopeKind::Global) => Plan::Global,
            Some(
                ScopeKind::Table {
                    container,
                    frame_depth,
                }
                | ScopeKind::UserData {
                    container,
                    frame_depth,
                },
            ) => Plan::Container(container.get(), *frame_depth),
        };

        let rows = match plan {
            Plan::Local(depth) => self.expand_locals(vm, depth),
            Plan::Upvalue(depth) => self.expand_upvalues(vm, depth),
            Plan::Global => self.expand_globals(vm),
            Plan::Container(Some(value), frame_depth) => {
                self.expand_container(vm, &value, frame_depth)
            }
            Plan::Container(None, _) => Vec::new(),
        };
        self.contents.insert(key, rows);
        Ok(())
    }

    fn expand_locals(&mut self, vm: &Arc<dyn ScriptVm>, depth: u32) -> Vec<VariableSnapshot> {
        let Some(frame) = self.frames.get(depth as usize).cloned() else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        let mut index = 1;
        while let Some((name, value)) = vm.get_local(frame.thread, frame.level, index) {
            rows.push(self.snapshot(vm, frame.thread, name, None, depth, index, value));
            index += 1;
        }
        rows
    }

    fn expand_upvalues(&mut self, vm: &Arc<dyn ScriptVm>, depth: u32) -> Vec<VariableSnapshot> {
        let Some(frame) = self.frames.get(depth as usize).cloned() else {
            return Vec::new();
        };
        let Some(function) = frame.function else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        let mut index = 1;
        while let Some((name, value)) = vm.get_upvalue(&function, index) {
            rows.push(self.snapshot(vm, frame.thread, name, None, depth, index, value));
            index += 1;
        }
        rows
    }

    fn expand_globals(&mut self, vm: &Arc<dyn ScriptVm>) -> Vec<VariableSnapshot> {
        let Some(thread) = self.break_thread else {
            return Vec::new();
        };
        let globals = vm.globals(thread);
        self.expand_container(vm, &globals, 0)
    }

    /// Expand a table or userdata. Prefers the `__iter` metamethod when
    /// present; otherwise raw iteration.
    fn expand_container(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        container: &Value,
        frame_depth: u32,
    ) -> Vec<VariableSnapshot> {
        let Some(thread) = self.break_thread else {
            return Vec::new();
        };

        let entries = collect_entries(vm.as_ref(), thread, container);
        entries
            .into_iter()
            .map(|(key, value)| {
                let name = format::display_key(vm.as_ref(), thread, &key);
                let numeric_key = key.as_number();
                self.snapshot(vm, thread, name, numeric_key, frame_depth, 0, value)
            })
            .collect()
    }

    fn snapshot(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        thread: ThreadId,
        name: String,
        numeric_key: Option<f64>,
        frame_depth: u32,
        slot: u32,
        value: Value,
    ) -> VariableSnapshot {
        let child = if value.is_expandable() {
            self.register_container(vm, &value, frame_depth)
        } else {
            0
        };
        VariableSnapshot {
            name,
            display_value: format::display_value(vm.as_ref(), thread, &value),
            display_type: value.type_name().to_string(),
            numeric_key,
            frame_depth,
            slot,
            child,
            value,
        }
    }

    /// Allocate (or reuse) the scope handle for a container, pinning
    /// the container while the scope lives. Contents stay lazy.
    fn register_container(
        &mut self,
        vm: &Arc<dyn ScriptVm>,
        value: &Value,
        frame_depth: u32,
    ) -> i64 {
        let Some(id) = value.object_id() else {
            return 0;
        };
        let key = scope_key_for_object(id);
        if !self.scopes.contains_key(&key) {
            let container = VmRef::new(Arc::clone(vm), value);
            let kind = match value {
                Value::Table(_) => ScopeKind::Table {
                    container,
                    frame_depth,
                },
                Value::UserData(_) => ScopeKind::UserData {
                    container,
                    frame_depth,
                },
                _ => return 0,
            };
            self.scopes.insert(key, kind);
        }
        key
    }

    fn coerce_literal(
        &self,
        vm: &dyn ScriptVm,
        frame: &FrameRecord,
        target: &Value,
        literal: &str,
    ) -> Result<Value, DebuggerError> {
        let trimmed = literal.trim();

        // The client sends bare text for string targets unless the user
        // quoted it; treat it as the string itself.
        if matches!(target, Value::String(_))
            && !trimmed.starts_with('"')
            && !trimmed.starts_with('\'')
        {
            return Ok(Value::String(trimmed.to_string()));
        }
        if matches!(target, Value::Vector(_)) {
            if let Some(vector) = parse_vector(trimmed) {
                return Ok(Value::Vector(vector));
            }
        }

        let results = eval::evaluate(vm, frame.thread, frame.level, trimmed)?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| DebuggerError::Eval("expression produced no value".to_string()))
    }
}

/// All `(key, value)` pairs of a container, via `__iter` or raw next.
fn collect_entries(vm: &dyn ScriptVm, thread: ThreadId, container: &Value) -> Vec<(Value, Value)> {
    if let Some(iter) = vm.get_metafield(container, "__iter") {
        match vm.call(thread, &iter, &[container.clone()]) {
            Ok(triplet) => {
                let next = triplet.first().cloned().unwrap_or(Value::Nil);
                let state = triplet.get(1).cloned().unwrap_or(Value::Nil);
                let control = triplet.get(2).cloned().unwrap_or(Value::Nil);
                if !next.is_nil() {
                    return iterate_with(vm, thread, &next, &state, control);
                }
            }
            Err(e) => warn!("__iter metamethod failed: {e}"),
        }
    }

    let mut rows = Vec::new();
    let mut previous: Option<Value> = None;
    loop {
        match vm.next_entry(container, previous.as_ref()) {
            Ok(Some((key, value))) => {
                rows.push((key.clone(), value));
                previous = Some(key);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("raw iteration failed: {e}");
                break;
            }
        }
    }
    rows
}

fn iterate_with(
    vm: &dyn ScriptVm,
    thread: ThreadId,
    next: &Value,
    state: &Value,
    mut control: Value,
) -> Vec<(Value, Value)> {
    let mut rows = Vec::new();
    loop {
        match vm.call(thread, next, &[state.clone(), control.clone()]) {
            Ok(pair) => {
                let key = pair.first().cloned().unwrap_or(Value::Nil);
                if key.is_nil() {
                    break;
                }
                let value = pair.get(1).cloned().unwrap_or(Value::Nil);
                rows.push((key.clone(), value));
                control = key;
            }
            Err(e) => {
                warn!("__iter loop failed: {e}");
                break;
            }
        }
    }
    rows
}

fn table_key(name: &str, numeric: Option<f64>) -> Value {
    numeric.map_or_else(|| Value::String(name.to_string()), Value::Number)
}

fn parse_vector(text: &str) -> Option<[f32; 3]> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = inner.split(',').map(str::trim);
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some([x, y, z])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_keys_are_31_bit_positive() {
        for name in ["___locals__0", "___upvalues__12", "___globals__"] {
            let key = scope_key_for_name(name);
            assert!(key > 0);
            assert!(key <= i64::from(i32::MAX));
        }
        let key = scope_key_for_object(ObjectId(0xdead_beef));
        assert!(key > 0);
        assert!(key <= i64::from(i32::MAX));
    }

    #[test]
    fn scope_keys_are_deterministic() {
        assert_eq!(local_scope_key(3), local_scope_key(3));
        assert_ne!(local_scope_key(3), local_scope_key(4));
        assert_ne!(local_scope_key(3), upvalue_scope_key(3));
    }

    #[test]
    fn vector_literals_parse() {
        assert_eq!(parse_vector("(1, 2, 3)"), Some([1.0, 2.0, 3.0]));
        assert_eq!(parse_vector("(0.5,-1,2.25)"), Some([0.5, -1.0, 2.25]));
        assert_eq!(parse_vector("1, 2, 3"), None);
        assert_eq!(parse_vector("(1, 2)"), None);
        assert_eq!(parse_vector("(1, 2, 3, 4)"), None);
    }

    #[test]
    fn numeric_keys_are_preserved_for_writes() {
        assert_eq!(table_key("1", Some(1.0)), Value::Number(1.0));
        assert_eq!(table_key("x", None), Value::String("x".to_string()));
    }
}
