//! Errors surfaced by the host VM.

use thiserror::Error;

/// Failure of a VM operation requested by the adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    /// Source text did not compile; the message is the VM diagnostic.
    #[error("compile error: {0}")]
    Compile(String),

    /// A protected call raised; the message is the script error value.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The operation was applied to a value of the wrong type.
    #[error("{operation} expects a {expected}, got {actual}")]
    Type {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// No executable statement exists at or after the requested line.
    #[error("no executable statement at or after line {0}")]
    InvalidLine(u32),

    /// The thread handle no longer denotes a live thread.
    #[error("thread is not alive")]
    DeadThread,

    /// A local or upvalue slot was out of range for the frame.
    #[error("no such slot: {0}")]
    InvalidSlot(u32),
}
