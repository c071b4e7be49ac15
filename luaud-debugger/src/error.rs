//! Error taxonomy of the adapter.
//!
//! Errors stay local to the request that produced them: handlers turn
//! them into DAP error responses and the session keeps running. Only
//! `Listen` reaches the host, which decides whether to continue without
//! a debugger.

use luaud_protocol::ProtocolError;
use luaud_vm::VmError;
use thiserror::Error;

/// Anything that can go wrong while serving the debug session.
#[derive(Debug, Error)]
pub enum DebuggerError {
    /// Request requires the VM to be paused and it is running.
    #[error("request is not allowed while the program is running")]
    NotPaused,

    /// Request arrived in a state where it cannot be served.
    #[error("{0}")]
    State(String),

    /// The VM rejected an operation; carries the script-side diagnostic.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// Wire-level failure; closes the session.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The TCP listener could not be started.
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A variables reference the registry has never issued.
    #[error("unknown scope handle {0}")]
    UnknownScope(i64),

    /// A frame id outside the paused stack.
    #[error("unknown frame {0}")]
    UnknownFrame(i64),

    /// setVariable named a variable the scope does not contain.
    #[error("variable not found: {0}")]
    UnknownVariable(String),

    /// Expression evaluation failed; carries the VM diagnostic.
    #[error("evaluation failed: {0}")]
    Eval(String),

    /// The client went away while a request was in flight.
    #[error("debug session is closed")]
    SessionClosed,
}
