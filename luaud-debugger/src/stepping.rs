//! Stepping controller.
//!
//! Each stepping command captures the context it was issued from and
//! installs a predicate; the VM's single-step callback evaluates that
//! predicate before every statement and stops execution when it returns
//! true. Coroutine switches fall out of the context comparison: a
//! different thread produces a different context.

use luaud_vm::{ThreadId, ThreadStatus};

/// Totally-ordered record of where execution stands, comparable across
/// coroutines because `depth` is global over the ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakContext {
    /// Normalized source path of the innermost frame.
    pub source: String,
    /// Current line of the innermost frame.
    pub line: u32,
    /// Stack depth summed over the thread's ancestor chain.
    pub depth: u32,
    pub thread: ThreadId,
}

/// Which stepping command is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Stop at the first statement with a different context.
    In,
    /// Stop once the stack is shallower than at capture time.
    Out,
    /// Stop at the next statement at the same depth (or shallower),
    /// staying within the originating thread's family.
    Over,
}

/// An armed stepping predicate.
#[derive(Debug, Clone)]
pub struct Stepper {
    kind: StepKind,
    origin: BreakContext,
}

impl Stepper {
    pub fn new(kind: StepKind, origin: BreakContext) -> Self {
        Self { kind, origin }
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn origin(&self) -> &BreakContext {
        &self.origin
    }

    /// Decide whether to stop at `current`.
    ///
    /// `origin_status` is the present status of the thread the step was
    /// issued from; `in_origin_family` is true when the current thread
    /// is the originating thread or one of its descendants.
    pub fn should_stop(
        &self,
        current: &BreakContext,
        origin_status: ThreadStatus,
        in_origin_family: bool,
    ) -> bool {
        match self.kind {
            StepKind::In => *current != self.origin,
            StepKind::Out => current.depth < self.origin.depth,
            StepKind::Over => {
                // The originating thread yielded: the program moved to a
                // different coroutine, wait for resumption.
                if origin_status == ThreadStatus::Yielded {
                    return false;
                }
                if !in_origin_family {
                    return false;
                }
                (current.depth == self.origin.depth && current.line != self.origin.line)
                    || current.depth < self.origin.depth
            }
        }
    }
}
