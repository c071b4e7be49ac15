//! Blocking DAP client used by the integration suite.
//!
//! Requests are synchronous: `request` writes one frame and reads until
//! the matching response arrives, queueing any events seen on the way
//! so tests can assert on them afterwards.

use std::collections::VecDeque;
use std::io::BufReader;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use luaud_protocol::codec;
use luaud_protocol::message::{Event, Message, Request, Response};

const CONNECT_RETRY: Duration = Duration::from_millis(25);
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A test-side DAP client over TCP.
pub struct DapClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_seq: i64,
    events: VecDeque<Event>,
}

impl DapClient {
    /// Connect to a freshly started adapter, retrying while the
    /// listener comes up.
    pub fn connect(port: u16) -> std::io::Result<Self> {
        let deadline = Instant::now() + CONNECT_DEADLINE;
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => std::thread::sleep(CONNECT_RETRY),
                Err(e) => return Err(e),
            }
        };
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            next_seq: 1,
            events: VecDeque::new(),
        })
    }

    /// Send one request and wait for its response.
    pub fn request(&mut self, command: &str, arguments: Value) -> Response {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = Message::Request(Request {
            seq,
            command: command.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        });
        codec::write_message(&mut self.writer, &request)
            .unwrap_or_else(|e| panic!("failed to send {command}: {e}"));

        loop {
            match self.read() {
                Message::Event(event) => self.events.push_back(event),
                Message::Response(response) if response.request_seq == seq => {
                    return response;
                }
                other => panic!("unexpected message while waiting for {command}: {other:?}"),
            }
        }
    }

    /// Next event named `name`, reading from the wire as needed.
    pub fn wait_event(&mut self, name: &str) -> Event {
        if let Some(position) = self.events.iter().position(|e| e.event == name) {
            return self.events.remove(position).unwrap_or_else(|| unreachable!());
        }
        loop {
            match self.read() {
                Message::Event(event) if event.event == name => return event,
                Message::Event(event) => self.events.push_back(event),
                other => panic!("unexpected message while waiting for event {name}: {other:?}"),
            }
        }
    }

    /// Non-blocking check of the already-received event queue.
    pub fn take_queued_event(&mut self, name: &str) -> Option<Event> {
        let position = self.events.iter().position(|e| e.event == name)?;
        self.events.remove(position)
    }

    /// True when no event named `name` shows up within `window`.
    pub fn assert_quiet(&mut self, name: &str, window: Duration) -> bool {
        if self.events.iter().any(|e| e.event == name) {
            return false;
        }
        let stream = self.reader.get_ref();
        let _ = stream.set_read_timeout(Some(window));
        let result = match codec::read_message(&mut self.reader) {
            Ok(Some(Message::Event(event))) => {
                let matched = event.event == name;
                self.events.push_back(event);
                !matched
            }
            Ok(Some(_)) | Err(_) | Ok(None) => true,
        };
        let _ = self
            .reader
            .get_ref()
            .set_read_timeout(Some(RESPONSE_TIMEOUT));
        result
    }

    /// Standard handshake: initialize, wait for `initialized`, attach.
    pub fn handshake_attach(&mut self) {
        let response = self.request("initialize", json!({"adapterID": "luaud"}));
        assert!(response.success, "initialize failed: {response:?}");
        self.wait_event("initialized");
        let response = self.request("attach", json!({}));
        assert!(response.success, "attach failed: {response:?}");
    }

    /// Same handshake but as a launch session.
    pub fn handshake_launch(&mut self) {
        let response = self.request("initialize", json!({"adapterID": "luaud"}));
        assert!(response.success, "initialize failed: {response:?}");
        self.wait_event("initialized");
        let response = self.request("launch", json!({}));
        assert!(response.success, "launch failed: {response:?}");
    }

    /// `setBreakpoints` for `path` with `(line, condition)` pairs.
    pub fn set_breakpoints(&mut self, path: &str, breakpoints: &[(u32, Option<&str>)]) -> Response {
        let rows: Vec<Value> = breakpoints
            .iter()
            .map(|(line, condition)| match condition {
                Some(condition) => json!({"line": line, "condition": condition}),
                None => json!({"line": line}),
            })
            .collect();
        self.request(
            "setBreakpoints",
            json!({"source": {"path": path}, "breakpoints": rows}),
        )
    }

    fn read(&mut self) -> Message {
        match codec::read_message(&mut self.reader) {
            Ok(Some(message)) => message,
            Ok(None) => panic!("server closed the connection"),
            Err(e) => panic!("protocol error: {e}"),
        }
    }
}
