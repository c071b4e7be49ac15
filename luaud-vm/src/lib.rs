//! # Luaud VM contract
//!
//! The debug adapter never embeds a virtual machine of its own; it drives
//! the host's VM through the [`ScriptVm`] trait and receives execution
//! callbacks through [`VmCallbacks`]. The trait mirrors the debug surface
//! of a Luau-style VM: per-state callback slots, single-stepping,
//! line-precise breakpoints on loaded closures, stack introspection with
//! locals and upvalues, a strong-reference table, and protected
//! compile/call for expression evaluation.
//!
//! Everything is handle-based: threads and heap objects are opaque
//! identities, values are a tagged [`Value`] enum. All methods must be
//! called from the VM's execution thread unless a method documents
//! otherwise; the adapter enforces that discipline on its side.

pub mod error;
pub mod value;
pub mod vm;

pub use error::VmError;
pub use value::{ObjectId, RefId, ThreadId, Value};
pub use vm::{DebugRecord, FrameInfo, ScriptVm, ThreadStatus, VmCallbacks};
