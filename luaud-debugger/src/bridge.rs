//! The DebugBridge: couples the VM's execution thread with the DAP
//! session around a single paused state.
//!
//! The VM thread blocks inside [`DebugBridge::enter_break`] for the
//! whole Break episode. DAP handlers never touch the VM directly: reads
//! of paused state are served from snapshots built on the VM thread,
//! and anything that must run VM code is submitted as a pending job the
//! parked VM thread executes in place (see [`DebugBridge::with_vm`]).
//!
//! Lock order: `state` first, then any of the leaf locks (`files`,
//! `threads`, `variables`, `paths`, `entry_path`, `stepper`). Pending
//! jobs run with the state lock released and may take leaf locks only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use luaud_vm::{ScriptVm, ThreadId, Value};

use crate::config::DebuggerConfig;
use crate::error::DebuggerError;
use crate::eval;
use crate::files::{BreakPoint, File, FunctionRef};
use crate::format;
use crate::paths::PathMapper;
use crate::session::Session;
use crate::stepping::{BreakContext, StepKind, Stepper};
use crate::task_pool::TaskPool;
use crate::variables::{FrameRecord, FrameScopes, SetVariableOutcome, VariableRegistry, VariableSnapshot};
use crate::vm_registry::{ThreadInfo, VmRegistry};

/// Why the VM stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    Entry,
    BreakPoint,
    Step,
    Pause,
}

impl BreakReason {
    /// The `reason` string of the DAP `stopped` event.
    pub fn as_str(self) -> &'static str {
        match self {
            BreakReason::Entry => "entry",
            BreakReason::BreakPoint => "breakpoint",
            BreakReason::Step => "step",
            BreakReason::Pause => "pause",
        }
    }
}

/// Reported state of one breakpoint after `setBreakpoints`.
#[derive(Debug, Clone)]
pub struct BreakpointSnapshot {
    pub line: u32,
    /// Line the VM instrumented; equals `line` until a closure is
    /// loaded and the VM picks the nearest executable statement.
    pub target_line: u32,
    pub verified: bool,
}

/// Result of an `evaluate` request.
#[derive(Debug, Clone)]
pub struct EvaluateOutcome {
    pub result: String,
    pub value_type: Option<String>,
    /// Non-zero when the first result is expandable.
    pub reference: i64,
}

type Job = Box<dyn FnOnce() + Send>;

/// State guarded by the break mutex.
struct BreakState {
    paused: bool,
    /// Context of the paused thread, including its identity; doubles
    /// as the step-origin capture.
    break_context: Option<BreakContext>,
    pending_job: Option<Job>,
    session: Option<Arc<Session>>,
    /// Set by [`DebugBridge::shutdown`]; releases the entry wait.
    shutdown: bool,
}

/// The concurrent core of the debugger.
pub struct DebugBridge {
    vm: Arc<dyn ScriptVm>,
    stop_on_entry: bool,
    paths: Mutex<PathMapper>,
    state: Mutex<BreakState>,
    resume_cv: Condvar,
    session_cv: Condvar,
    files: Mutex<HashMap<String, File>>,
    threads: Mutex<VmRegistry>,
    variables: Mutex<VariableRegistry>,
    tasks: TaskPool,
    stepper: Mutex<Option<Stepper>>,
    should_pause: AtomicBool,
    entry_path: Mutex<Option<String>>,
}

impl DebugBridge {
    pub fn new(vm: Arc<dyn ScriptVm>, config: &DebuggerConfig) -> Self {
        Self {
            vm,
            stop_on_entry: config.stop_on_entry,
            paths: Mutex::new(PathMapper::new(
                config.root.clone(),
                config.script_extension.clone(),
            )),
            state: Mutex::new(BreakState {
                paused: false,
                break_context: None,
                pending_job: None,
                session: None,
                shutdown: false,
            }),
            resume_cv: Condvar::new(),
            session_cv: Condvar::new(),
            files: Mutex::new(HashMap::new()),
            threads: Mutex::new(VmRegistry::new()),
            variables: Mutex::new(VariableRegistry::new()),
            tasks: TaskPool::new(),
            stepper: Mutex::new(None),
            should_pause: AtomicBool::new(false),
            entry_path: Mutex::new(None),
        }
    }

    /// Register the main state and bind the task pool to the calling
    /// thread, which must be the VM thread.
    pub fn initialize(&self, main_thread: ThreadId) {
        self.threads.lock().register_main(main_thread);
        self.tasks.bind_current_thread();
        info!(%main_thread, "debug bridge initialized");
    }

    pub fn vm(&self) -> &Arc<dyn ScriptVm> {
        &self.vm
    }

    pub fn set_root(&self, root: &str) {
        self.paths.lock().set_root(root);
    }

    pub fn normalize(&self, raw: &str) -> String {
        self.paths.lock().normalize(raw)
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    // ── session lifecycle ────────────────────────────────────────────────

    /// A client finished the initialize handshake.
    pub fn on_connect(&self, session: Arc<Session>) {
        let mut st = self.state.lock();
        st.session = Some(session);
        self.session_cv.notify_all();
        info!("debug session attached");
    }

    /// The client is gone: free a paused VM and strip instrumentation.
    /// Safe to call in any state and from any thread.
    pub fn on_disconnect(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.session = None;
            if st.paused {
                st.paused = false;
                self.resume_cv.notify_all();
            }
        }
        let bridge = Arc::clone(self);
        self.tasks.post(move || {
            bridge.remove_all_breakpoints();
            bridge.install_stepper(None);
        });
        info!("debug session detached");
    }

    /// Final teardown: unblock every wait and strip instrumentation.
    /// Unlike a disconnect, no later client is expected.
    pub fn shutdown(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.shutdown = true;
            st.session = None;
            if st.paused {
                st.paused = false;
            }
            self.resume_cv.notify_all();
            self.session_cv.notify_all();
        }
        let bridge = Arc::clone(self);
        self.tasks.post(move || {
            bridge.remove_all_breakpoints();
            bridge.install_stepper(None);
        });
        info!("debug bridge shut down");
    }

    fn remove_all_breakpoints(&self) {
        let mut files = self.files.lock();
        for file in files.values_mut() {
            file.clear_breakpoints(self.vm.as_ref());
        }
    }

    // ── host notifications (VM thread) ───────────────────────────────────

    /// A top-level closure finished loading. Called by the host with
    /// the closure still alive on `thread`.
    pub fn on_file_loaded(&self, thread: ThreadId, function: &Value, raw_path: &str, is_entry: bool) {
        let normalized = self.normalize(raw_path);
        if normalized.is_empty() {
            warn!("ignoring load of unnamed chunk");
            return;
        }

        let arm_entry = is_entry && self.stop_on_entry;
        if arm_entry {
            *self.entry_path.lock() = Some(normalized.clone());
            debug!(path = %normalized, "armed break-on-entry");
        }

        let mut files = self.files.lock();
        let file = files
            .entry(normalized.clone())
            .or_insert_with(|| File::new(normalized.clone()));
        if arm_entry {
            file.add_breakpoint(self.vm.as_ref(), 1);
        }

        info!(path = %normalized, is_entry, "script loaded");
        file.add_ref(self.vm.as_ref(), FunctionRef::new(&self.vm, thread, function));
    }

    /// Forward a runtime error to the client console, enriched with the
    /// failing frame when the erroring thread is known.
    pub fn on_error(&self, message: &str, thread: Option<ThreadId>) {
        let session = self.state.lock().session.clone();
        let Some(session) = session else {
            debug!("runtime error with no session: {message}");
            return;
        };
        let location = thread.and_then(|t| self.vm.frame_info(t, 0));
        let source = location
            .as_ref()
            .and_then(|info| info.source.as_deref())
            .map(|raw| self.normalize(raw));
        let line = location.as_ref().map(|info| info.line);
        session.send_output("stderr", message, source, line);
    }

    // ── VM callbacks ─────────────────────────────────────────────────────

    /// Classify a `debug_break` callback: the one-shot entry breakpoint
    /// maps to `Entry`, everything else is a breakpoint.
    pub fn classify_break(&self, thread: ThreadId) -> BreakReason {
        let entry = self.entry_path.lock().clone();
        if let Some(entry) = entry {
            let context = self.capture_context(thread);
            if context.source == entry && context.line == 1 {
                return BreakReason::Entry;
            }
        }
        BreakReason::BreakPoint
    }

    /// Periodic interrupt: drain deferred work, honor pause requests.
    pub fn on_interrupt(&self, thread: ThreadId) {
        self.tasks.drain();
        if self.should_pause.swap(false, Ordering::SeqCst) {
            self.enter_break(thread, BreakReason::Pause);
        }
    }

    /// Single-step callback: evaluate the armed predicate. Returns true
    /// when execution was suspended here.
    pub fn on_debug_step(&self, thread: ThreadId) -> bool {
        let stepper = self.stepper.lock().clone();
        let Some(stepper) = stepper else {
            return false;
        };
        let current = self.capture_context(thread);
        let origin = stepper.origin();
        let origin_status = self.vm.thread_status(origin.thread);
        let in_family =
            thread == origin.thread || self.threads.lock().is_child(thread, origin.thread);
        if stepper.should_stop(&current, origin_status, in_family) {
            self.enter_break(thread, BreakReason::Step);
            return true;
        }
        false
    }

    /// Coroutine lifecycle callback.
    pub fn on_user_thread(&self, parent: Option<ThreadId>, thread: ThreadId) {
        let mut threads = self.threads.lock();
        match parent {
            Some(parent) => threads.mark_alive(thread, parent),
            None => threads.mark_dead(thread),
        }
    }

    /// Enter the Break state on the VM thread and stay there until a
    /// continue-class request or disconnect. This is the only place the
    /// VM thread suspends.
    pub fn enter_break(&self, thread: ThreadId, reason: BreakReason) {
        // Conditions run user code, so they are evaluated before the
        // rendezvous lock is taken.
        let mut condition_diagnostic = None;
        if reason == BreakReason::BreakPoint {
            if self.state.lock().session.is_none() {
                debug!("breakpoint with no session, ignoring");
                return;
            }
            match self.check_condition(thread) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => condition_diagnostic = Some(format!("breakpoint condition error: {e}\n")),
            }
        }

        let context = self.capture_context(thread);
        let mut st = self.state.lock();

        if reason == BreakReason::Entry {
            if st.session.is_none() && !st.shutdown {
                info!("entry break before any client: waiting for connection");
                while st.session.is_none() && !st.shutdown {
                    self.session_cv.wait(&mut st);
                }
            }
            self.clear_entry_breakpoint();
        }

        let Some(session) = st.session.clone() else {
            debug!("break with no session, ignoring");
            return;
        };

        if let Some(diagnostic) = condition_diagnostic {
            session.send_output("console", &diagnostic, Some(context.source.clone()), Some(context.line));
        }

        info!(
            reason = reason.as_str(),
            source = %context.source,
            line = context.line,
            "stopped"
        );
        let thread_key = self.threads.lock().thread_key(thread);
        session.send_stopped(reason.as_str(), thread_key);

        st.paused = true;
        st.break_context = Some(context);

        {
            let ancestors = self.threads.lock().ancestors(thread);
            let mapper = self.paths.lock().clone();
            self.variables
                .lock()
                .refresh(self.vm.as_ref(), &mapper, &ancestors);
        }

        loop {
            if !st.paused && st.pending_job.is_none() {
                break;
            }
            if let Some(job) = st.pending_job.take() {
                // Jobs run on this thread to preserve the VM's
                // single-threaded discipline, without the state lock so
                // they may take leaf locks.
                MutexGuard::unlocked(&mut st, job);
                continue;
            }
            self.resume_cv.wait(&mut st);
        }

        st.break_context = None;
        drop(st);
        self.variables.lock().clear();
        info!("resumed");
    }

    fn check_condition(&self, thread: ThreadId) -> Result<bool, DebuggerError> {
        let context = self.capture_context(thread);
        let condition = {
            let files = self.files.lock();
            files
                .get(&context.source)
                .and_then(|file| file.find_breakpoint(context.line))
                .and_then(|bp| bp.condition().map(str::to_string))
        };
        match condition {
            None => Ok(true),
            Some(condition) => eval::evaluate_condition(self.vm.as_ref(), thread, &condition),
        }
    }

    fn clear_entry_breakpoint(&self) {
        let Some(path) = self.entry_path.lock().take() else {
            return;
        };
        if let Some(file) = self.files.lock().get_mut(&path) {
            file.remove_breakpoint(self.vm.as_ref(), 1);
        }
    }

    /// Current context of `thread`: innermost source/line plus the
    /// global depth over its ancestor chain.
    pub fn capture_context(&self, thread: ThreadId) -> BreakContext {
        let (source, line) = self
            .vm
            .frame_info(thread, 0)
            .map(|info| {
                (
                    self.normalize(info.source.as_deref().unwrap_or("")),
                    info.line,
                )
            })
            .unwrap_or_default();
        BreakContext {
            source,
            line,
            depth: self.global_depth(thread),
            thread,
        }
    }

    fn global_depth(&self, thread: ThreadId) -> u32 {
        let ancestors = self.threads.lock().ancestors(thread);
        ancestors.iter().map(|&t| self.vm.stack_depth(t)).sum()
    }

    // ── DAP-side operations ──────────────────────────────────────────────

    /// Run `f` on the parked VM thread and wait for its result.
    pub fn with_vm<R, F>(self: &Arc<Self>, f: F) -> Result<R, DebuggerError>
    where
        R: Send + 'static,
        F: FnOnce(&DebugBridge) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        {
            let mut st = self.state.lock();
            if !st.paused {
                return Err(DebuggerError::NotPaused);
            }
            let bridge = Arc::clone(self);
            st.pending_job = Some(Box::new(move || {
                let _ = tx.send(f(&bridge));
            }));
            self.resume_cv.notify_all();
        }
        rx.recv().map_err(|_| DebuggerError::SessionClosed)
    }

    /// Resume after clearing any armed stepper.
    pub fn resume(&self) -> Result<(), DebuggerError> {
        let mut st = self.state.lock();
        if !st.paused {
            return Err(DebuggerError::NotPaused);
        }
        self.install_stepper(None);
        st.paused = false;
        self.resume_cv.notify_all();
        Ok(())
    }

    /// Arm a stepping predicate and resume.
    pub fn step(&self, kind: StepKind) -> Result<(), DebuggerError> {
        let mut st = self.state.lock();
        if !st.paused {
            return Err(DebuggerError::NotPaused);
        }
        let origin = st.break_context.clone().ok_or(DebuggerError::NotPaused)?;
        self.install_stepper(Some(Stepper::new(kind, origin)));
        st.paused = false;
        self.resume_cv.notify_all();
        Ok(())
    }

    /// The VM is parked inside `enter_break` whenever this runs with a
    /// paused state, so toggling instrumentation is safe here.
    fn install_stepper(&self, stepper: Option<Stepper>) {
        self.vm.set_single_step(stepper.is_some());
        *self.stepper.lock() = stepper;
    }

    /// Request a pause at the next interrupt. The flag is the only
    /// lock-free path: any thread may set it, the VM reads-and-clears.
    pub fn request_pause(&self) {
        self.should_pause.store(true, Ordering::SeqCst);
    }

    /// Atomic breakpoint replacement for one source. Must run on the VM
    /// thread (inline job when paused, task pool when running).
    pub fn apply_breakpoints(
        &self,
        raw_path: &str,
        breakpoints: Option<Vec<(u32, Option<String>)>>,
    ) -> Vec<BreakpointSnapshot> {
        let normalized = self.normalize(raw_path);
        let mut files = self.files.lock();

        let Some(requested) = breakpoints else {
            if let Some(file) = files.get_mut(&normalized) {
                file.clear_breakpoints(self.vm.as_ref());
            }
            return Vec::new();
        };

        let file = files
            .entry(normalized.clone())
            .or_insert_with(|| File::new(normalized.clone()));

        let mut keep: HashSet<u32> = HashSet::new();
        for (line, condition) in &requested {
            file.add_breakpoint(self.vm.as_ref(), *line);
            if let Some(bp) = file.breakpoint_mut(*line) {
                bp.set_condition(condition.clone());
            }
            keep.insert(*line);
        }
        file.retain_breakpoints(self.vm.as_ref(), |bp| keep.contains(&bp.line()));

        let verified = file.is_loaded();
        requested
            .iter()
            .map(|(line, _)| BreakpointSnapshot {
                line: *line,
                target_line: file.breakpoint(*line).map_or(*line, BreakPoint::target_line),
                verified,
            })
            .collect()
    }

    /// Queue a breakpoint update if the VM is running, or apply it in
    /// place when paused. Returns the snapshots when applied inline.
    pub fn set_breakpoints(
        self: &Arc<Self>,
        raw_path: &str,
        breakpoints: Option<Vec<(u32, Option<String>)>>,
    ) -> Option<Vec<BreakpointSnapshot>> {
        if self.is_paused() {
            let path = raw_path.to_string();
            let requested = breakpoints.clone();
            if let Ok(snapshots) = self.with_vm(move |b| b.apply_breakpoints(&path, requested)) {
                return Some(snapshots);
            }
            // Raced with a resume; fall through to the task pool.
        }
        let bridge = Arc::clone(self);
        let path = raw_path.to_string();
        self.tasks.post(move || {
            bridge.apply_breakpoints(&path, breakpoints);
        });
        None
    }

    /// Rows of the `threads` response.
    pub fn thread_rows(&self) -> Vec<ThreadInfo> {
        self.threads.lock().threads()
    }

    /// Snapshot of the paused stack, empty while running.
    pub fn stack_frames(&self) -> Vec<FrameRecord> {
        if !self.is_paused() {
            return Vec::new();
        }
        self.variables.lock().frames().to_vec()
    }

    /// Scope handles of one frame; requires the paused state.
    pub fn frame_scopes(&self, frame_id: i64) -> Result<FrameScopes, DebuggerError> {
        if !self.is_paused() {
            return Err(DebuggerError::NotPaused);
        }
        self.variables.lock().frame_scopes(frame_id)
    }

    /// Lazy scope expansion; runs as a VM-thread job.
    pub fn variables_on_vm(&self, reference: i64) -> Result<Vec<VariableSnapshot>, DebuggerError> {
        self.variables.lock().variables(&self.vm, reference)
    }

    /// Variable mutation; runs as a VM-thread job.
    pub fn set_variable_on_vm(
        &self,
        reference: i64,
        name: &str,
        value: &str,
    ) -> Result<SetVariableOutcome, DebuggerError> {
        self.variables
            .lock()
            .set_variable(&self.vm, reference, name, value)
    }

    /// Expression evaluation in a chosen frame; runs as a VM-thread job.
    pub fn evaluate_on_vm(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluateOutcome, DebuggerError> {
        let frame = {
            let variables = self.variables.lock();
            let id = frame_id.unwrap_or(0);
            let index = usize::try_from(id).map_err(|_| DebuggerError::UnknownFrame(id))?;
            variables
                .frames()
                .get(index)
                .cloned()
                .ok_or(DebuggerError::UnknownFrame(id))?
        };

        let results = eval::evaluate(self.vm.as_ref(), frame.thread, frame.level, expression)?;

        let text = results
            .iter()
            .map(|value| format::display_value(self.vm.as_ref(), frame.thread, value))
            .collect::<Vec<_>>()
            .join("\n");
        let value_type = results.first().map(|v| v.type_name().to_string());
        let reference = results
            .first()
            .filter(|v| v.is_expandable())
            .map_or(0, |v| {
                self.variables
                    .lock()
                    .register_eval_result(&self.vm, v, frame.depth)
            });

        Ok(EvaluateOutcome {
            result: text,
            value_type,
            reference,
        })
    }

    /// Discard expanded variable snapshots and tell the client.
    pub fn invalidate(&self) {
        self.variables.lock().invalidate();
        let session = self.state.lock().session.clone();
        if let Some(session) = session {
            session.send_invalidated();
        }
    }
}
