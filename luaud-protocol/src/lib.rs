//! # Luaud DAP wire layer
//!
//! Message envelope, typed request/response bodies, and the
//! `Content-Length` framing codec for the Debug Adapter Protocol.
//!
//! The layer is transport-agnostic and blocking: [`codec::read_message`]
//! works on any [`std::io::BufRead`], [`codec::write_message`] on any
//! [`std::io::Write`]. The adapter runs it over TCP.

pub mod codec;
pub mod error;
pub mod message;
pub mod types;

pub use error::ProtocolError;
pub use message::{Event, Message, Request, Response};
