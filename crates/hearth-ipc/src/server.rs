//! Unix-socket IPC server.
//!
//! One dedicated server thread accepts a single shell client at a time.
//! The session loop short-polls the inbound byte stream (non-blocking
//! reads with a 10 ms idle sleep), dispatches each newline-framed JSON
//! message to the handler registered for its type, and drains an outbound
//! queue to the client.  A broken connection ends the session and the
//! server goes back to accepting.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::wire::WireMessage;
use crate::{IpcError, Result};

/// Poll interval for the session loop when the socket is idle.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Handler for one inbound message type.  A returned message is queued as
/// the reply; handlers that respond later (or not at all) return `None`.
pub type MessageHandler = Box<dyn Fn(&WireMessage) -> Option<WireMessage> + Send + Sync>;

struct ServerInner {
    socket_path: PathBuf,
    running: AtomicBool,
    client_connected: AtomicBool,
    handlers: DashMap<String, MessageHandler>,
    outbound_tx: Sender<WireMessage>,
    outbound_rx: Receiver<WireMessage>,
    /// Write half of the current client connection.
    client: Mutex<Option<UnixStream>>,
}

/// Local-only IPC server over a Unix domain socket.
pub struct IpcServer {
    inner: Arc<ServerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(ServerInner {
                socket_path: socket_path.into(),
                running: AtomicBool::new(false),
                client_connected: AtomicBool::new(false),
                handlers: DashMap::new(),
                outbound_tx,
                outbound_rx,
                client: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register the handler for a message type, replacing any previous one.
    /// Handlers are wired once at initialization, before `start`.
    pub fn register_handler<F>(&self, message_type: &str, handler: F)
    where
        F: Fn(&WireMessage) -> Option<WireMessage> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .insert(message_type.to_string(), Box::new(handler));
        tracing::debug!(message_type, "ipc handler registered");
    }

    /// Bind the socket and start the server thread.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }

        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(&self.inner.socket_path);
        if let Some(parent) = self.inner.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener =
            UnixListener::bind(&self.inner.socket_path).map_err(|source| IpcError::Bind {
                path: self.inner.socket_path.clone(),
                source,
            })?;

        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        *self.thread.lock() = Some(std::thread::spawn(move || run_server(&inner, listener)));

        tracing::info!(socket = %self.inner.socket_path.display(), "ipc server started");
        Ok(())
    }

    /// Stop the server thread and remove the socket file.  Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // Unblock a thread parked in accept() by connecting to ourselves.
        let _ = UnixStream::connect(&self.inner.socket_path);

        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.inner.socket_path);

        tracing::info!("ipc server stopped");
    }

    /// Write a message to the connected client immediately.
    pub fn send(&self, message: &WireMessage) -> Result<()> {
        send_to_client(&self.inner, message)
    }

    /// Queue a message; the session loop delivers it to the current (or
    /// next) client.
    pub fn queue(&self, message: WireMessage) {
        let _ = self.inner.outbound_tx.send(message);
    }

    pub fn is_client_connected(&self) -> bool {
        self.inner.client_connected.load(Ordering::Acquire)
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

fn run_server(inner: &ServerInner, listener: UnixListener) {
    while inner.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let writer = match stream.try_clone() {
                    Ok(writer) => writer,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to clone client stream");
                        continue;
                    }
                };

                tracing::info!("ipc client connected");
                *inner.client.lock() = Some(writer);
                inner.client_connected.store(true, Ordering::Release);

                handle_client(inner, stream);

                inner.client_connected.store(false, Ordering::Release);
                *inner.client.lock() = None;
                tracing::info!("ipc client disconnected");
            }
            Err(err) => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!(error = %err, "ipc accept failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    tracing::debug!("ipc server thread stopped");
}

fn handle_client(inner: &ServerInner, mut stream: UnixStream) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    while inner.running.load(Ordering::Acquire) {
        let mut had_data = false;
        match stream.read(&mut buf) {
            // Zero bytes means the client closed its end.
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                drain_messages(inner, &mut pending);
                had_data = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(error = %err, "ipc read error");
                break;
            }
        }

        flush_outbound(inner);

        if !had_data {
            std::thread::sleep(IDLE_POLL);
        }
    }
}

fn drain_messages(inner: &ServerInner, pending: &mut Vec<u8>) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        let text = text.trim();
        if !text.is_empty() {
            dispatch(inner, text);
        }
    }
}

fn dispatch(inner: &ServerInner, raw: &str) {
    let message = match WireMessage::from_json(raw) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "discarding unparseable ipc message");
            return;
        }
    };

    tracing::debug!(message_type = %message.message_type, "ipc message received");

    let Some(handler) = inner.handlers.get(&message.message_type) else {
        tracing::warn!(message_type = %message.message_type, "no handler for message type");
        return;
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| (handler.value())(&message))) {
        Ok(Some(reply)) => {
            let _ = inner.outbound_tx.send(reply);
        }
        Ok(None) => {}
        Err(_) => {
            tracing::error!(message_type = %message.message_type, "ipc handler panicked");
        }
    }
}

fn flush_outbound(inner: &ServerInner) {
    while let Ok(message) = inner.outbound_rx.try_recv() {
        if let Err(err) = send_to_client(inner, &message) {
            tracing::warn!(error = %err, "failed to deliver queued ipc message");
            break;
        }
    }
}

fn send_to_client(inner: &ServerInner, message: &WireMessage) -> Result<()> {
    let mut guard = inner.client.lock();
    let stream = guard.as_mut().ok_or(IpcError::NotConnected)?;

    let mut json = message.to_json().map_err(IpcError::Encode)?;
    json.push('\n');
    stream.write_all(json.as_bytes()).map_err(IpcError::Write)?;

    tracing::debug!(message_type = %message.message_type, "ipc message sent");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
