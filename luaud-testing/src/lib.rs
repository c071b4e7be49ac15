//! # Luaud test support
//!
//! Deterministic fixtures for exercising the debug adapter without a
//! real VM build:
//!
//! - [`SimVm`]: an in-memory implementation of the `luaud-vm`
//!   contract, driven by scripted statement lists ([`program`]).
//!   It fires the interrupt, single-step and break callbacks with the
//!   same ordering guarantees the real VM documents.
//! - [`DapClient`]: a blocking DAP client over TCP for integration
//!   tests, with event queueing and response matching.

pub mod client;
pub mod program;
pub mod sim_vm;

pub use client::DapClient;
pub use program::{Op, Proto, ProgramExpr, Stmt};
pub use sim_vm::SimVm;

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
