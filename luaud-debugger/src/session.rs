//! One DAP client session.
//!
//! Owns the framed writer half of the connection. Responses come from
//! the handler thread, events from whichever thread produced them (the
//! VM thread for `stopped` and `output`), so every send goes through
//! one writer mutex with its own sequence counter.

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use luaud_protocol::codec;
use luaud_protocol::message::{Event, Message, Request};
use luaud_protocol::types::{InvalidatedEventBody, OutputEventBody, Source, StoppedEventBody};

/// How the client started the session; `Launch` implies the process
/// terminates when the client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Launch,
    Attach,
}

/// Shared write side of a connected client.
pub struct Session {
    writer: Mutex<Box<dyn Write + Send>>,
    seq: AtomicI64,
    kind: Mutex<SessionKind>,
}

impl Session {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            seq: AtomicI64::new(1),
            kind: Mutex::new(SessionKind::Attach),
        }
    }

    pub fn kind(&self) -> SessionKind {
        *self.kind.lock()
    }

    pub fn set_kind(&self, kind: SessionKind) {
        *self.kind.lock() = kind;
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Answer `request` with a body or an error message.
    pub fn respond(&self, request: &Request, result: Result<Option<serde_json::Value>, String>) {
        let response = match result {
            Ok(body) => request.success(self.next_seq(), body),
            Err(message) => request.error(self.next_seq(), message),
        };
        self.send(Message::Response(response));
    }

    pub fn send_event(&self, event: &str, body: Option<serde_json::Value>) {
        let message = Message::Event(Event {
            seq: self.next_seq(),
            event: event.to_string(),
            body,
        });
        self.send(message);
    }

    pub fn send_initialized(&self) {
        self.send_event("initialized", None);
    }

    pub fn send_stopped(&self, reason: &str, thread_id: i64) {
        let body = StoppedEventBody {
            reason: reason.to_string(),
            thread_id: Some(thread_id),
            description: None,
            all_threads_stopped: Some(true),
        };
        self.send_event("stopped", serde_json::to_value(body).ok());
    }

    pub fn send_output(
        &self,
        category: &str,
        output: &str,
        source: Option<String>,
        line: Option<u32>,
    ) {
        let body = OutputEventBody {
            category: Some(category.to_string()),
            output: output.to_string(),
            source: source.map(Source::from_path),
            line,
        };
        self.send_event("output", serde_json::to_value(body).ok());
    }

    pub fn send_invalidated(&self) {
        let body = InvalidatedEventBody {
            areas: vec!["variables".to_string()],
        };
        self.send_event("invalidated", serde_json::to_value(body).ok());
    }

    fn send(&self, message: Message) {
        let mut writer = self.writer.lock();
        if let Err(e) = codec::write_message(&mut *writer, &message) {
            // The read loop observes the same broken pipe and tears the
            // session down; nothing to do here.
            warn!("failed to write DAP message: {e}");
        } else {
            debug!("sent DAP message");
        }
    }
}
