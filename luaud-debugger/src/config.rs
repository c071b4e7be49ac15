//! Debugger configuration supplied by the host.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host-side configuration of the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Stop on the first statement of the entry script by synthesizing a
    /// breakpoint on line 1 of that file.
    pub stop_on_entry: bool,

    /// Root that relative script identifiers are resolved against. Can
    /// also be set later through [`crate::Debugger::set_root`].
    pub root: Option<PathBuf>,

    /// Extension appended to script identifiers that have none.
    pub script_extension: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            stop_on_entry: false,
            root: None,
            script_extension: ".lua".to_string(),
        }
    }
}
