//! TCP listener and session read loop.
//!
//! One client at a time: the accept thread serves a connection to
//! completion, then waits for the next one, so a second client can
//! attach after the first disconnects. Invalid protocol data closes
//! the connection; the debuggee is never affected.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use luaud_protocol::codec;
use luaud_protocol::message::Message;
use luaud_protocol::ProtocolError;

use crate::bridge::DebugBridge;
use crate::error::DebuggerError;
use crate::handlers::{dispatch, HandlerContext};
use crate::session::Session;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to the background listener.
pub struct DapServer {
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl DapServer {
    /// Stop accepting clients and join the listener thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Bind the DAP port and start serving clients in the background.
pub fn listen(
    bridge: Arc<DebugBridge>,
    port: u16,
    terminate: Arc<dyn Fn() + Send + Sync>,
) -> Result<DapServer, DebuggerError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|source| DebuggerError::Listen { port, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| DebuggerError::Listen { port, source })?;
    info!(port, "listening for DAP clients");

    let shutdown = Arc::new(AtomicBool::new(false));
    let accept_shutdown = Arc::clone(&shutdown);
    let accept_thread = std::thread::Builder::new()
        .name("luaud-dap-accept".to_string())
        .spawn(move || accept_loop(&listener, &bridge, &terminate, &accept_shutdown))
        .map_err(|source| DebuggerError::Listen { port, source })?;

    Ok(DapServer {
        shutdown,
        accept_thread: Some(accept_thread),
    })
}

fn accept_loop(
    listener: &TcpListener,
    bridge: &Arc<DebugBridge>,
    terminate: &Arc<dyn Fn() + Send + Sync>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "debugger client connected");
                if let Err(e) = serve_client(bridge, stream, terminate, shutdown) {
                    warn!("debug session ended with error: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn serve_client(
    bridge: &Arc<DebugBridge>,
    stream: TcpStream,
    terminate: &Arc<dyn Fn() + Send + Sync>,
    shutdown: &AtomicBool,
) -> Result<(), DebuggerError> {
    stream
        .set_nonblocking(false)
        .map_err(ProtocolError::from)?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(ProtocolError::from)?;
    let writer = stream.try_clone().map_err(ProtocolError::from)?;

    let session = Arc::new(Session::new(Box::new(writer)));
    let ctx = HandlerContext {
        bridge: Arc::clone(bridge),
        session,
        terminate: Arc::clone(terminate),
    };

    let mut reader = BufReader::new(stream);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Wait for traffic with the read timeout so shutdown stays
        // responsive; only start decoding once bytes are buffered.
        match std::io::BufRead::fill_buf(&mut reader) {
            Ok(buffer) if buffer.is_empty() => {
                info!("client connection closed");
                bridge.on_disconnect();
                return Ok(());
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("closing session on read error: {e}");
                bridge.on_disconnect();
                return Err(ProtocolError::from(e).into());
            }
        }
        match codec::read_message(&mut reader) {
            Ok(Some(Message::Request(request))) => {
                if !dispatch(&ctx, &request) {
                    info!("client disconnected");
                    return Ok(());
                }
            }
            Ok(Some(_)) => {
                warn!("ignoring non-request message from client");
            }
            Ok(None) => {
                // Peer hung up without a disconnect request; free any
                // paused state so the VM keeps running.
                info!("client connection closed");
                bridge.on_disconnect();
                return Ok(());
            }
            Err(e) => {
                // Session policy: invalid data closes the connection.
                warn!("closing session on protocol error: {e}");
                bridge.on_disconnect();
                return Err(e.into());
            }
        }
    }
}
