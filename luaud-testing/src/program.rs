//! Scripted programs for the simulated VM.
//!
//! A [`Proto`] stands in for one compiled function: a list of
//! statements, each pinned to a source line. The statement set is just
//! big enough to exercise the debugger: locals, globals, calls,
//! coroutines, loops and returns.

use luaud_vm::Value;

/// Right-hand side of an assignment.
#[derive(Debug, Clone)]
pub enum ProgramExpr {
    /// A constant value.
    Const(Value),
    /// Read a local (or fall back to a global) by name.
    Var(String),
    /// `name + delta`, reading `name` like [`ProgramExpr::Var`].
    Add(String, f64),
    /// Construct a fresh table from constant pairs.
    Table(Vec<(Value, Value)>),
}

/// One executable statement.
#[derive(Debug, Clone)]
pub enum Op {
    /// No effect; a plain executable line.
    Nop,
    /// Assign a local variable, declaring it on first write.
    Assign(String, ProgramExpr),
    /// Assign a global variable.
    AssignGlobal(String, ProgramExpr),
    /// Call another proto by registered name.
    Call(String),
    /// Create a coroutine over a proto and store its thread in a local.
    SpawnCoroutine { proto: String, local: String },
    /// Resume the coroutine held in a local.
    Resume(String),
    /// Yield the current coroutine.
    Yield,
    /// Jump to statement `target` while `local < limit`.
    JumpIfLess {
        local: String,
        limit: f64,
        target: usize,
    },
    /// Return from the current function.
    Return,
}

/// One line-tagged statement.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub op: Op,
}

/// A compiled function of a source file.
#[derive(Debug, Clone)]
pub struct Proto {
    /// Registered name, also used as the frame's function name.
    pub name: String,
    /// Raw chunk identifier as the VM would report it (`@…`).
    pub source: String,
    pub stmts: Vec<Stmt>,
    /// Upvalues each instantiation starts with.
    pub upvalues: Vec<(String, Value)>,
}

impl Proto {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            stmts: Vec::new(),
            upvalues: Vec::new(),
        }
    }

    /// Append a statement at `line`.
    #[must_use]
    pub fn stmt(mut self, line: u32, op: Op) -> Self {
        self.stmts.push(Stmt { line, op });
        self
    }

    /// Declare an upvalue with its initial value.
    #[must_use]
    pub fn upvalue(mut self, name: impl Into<String>, value: Value) -> Self {
        self.upvalues.push((name.into(), value));
        self
    }

    /// Smallest statement line at or after `line`, the way the VM
    /// snaps breakpoints to executable statements.
    pub fn nearest_line(&self, line: u32) -> Option<u32> {
        self.stmts
            .iter()
            .map(|stmt| stmt.line)
            .filter(|&l| l >= line)
            .min()
    }
}
