//! Newline-delimited JSON-RPC over a container's attached stdin/stdout.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::errors::TransportError;
use crate::lifecycle::StdioPipe;
use crate::transport::McpTransport;
use crate::types::{JsonRpcMessage, TransportKind};

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

/// Stdio connector for one sandbox.
///
/// Calls are serialized in arrival order. Each outgoing request id is
/// replaced by an internal counter value and the caller's id is restored on
/// the response, so a late answer to an abandoned call is dropped instead of
/// being attributed to a later one. Writes and reads happen on dedicated
/// tasks so a cancelled call never leaves half a line on the wire.
pub struct StdioTransport {
    label: String,
    turn: Mutex<()>,
    next_id: AtomicU64,
    outbound: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

/// Removes a pending slot when the waiting call goes away.
struct PendingSlot {
    pending: Pending,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl StdioTransport {
    pub fn new(label: impl Into<String>, pipe: StdioPipe) -> Self {
        Self::from_streams(label, pipe.stdin, pipe.stdout)
    }

    pub fn from_streams(
        label: impl Into<String>,
        stdin: Pin<Box<dyn AsyncWrite + Send>>,
        stdout: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Self {
        let label = label.into();
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(label.clone(), stdin, rx));
        let reader = tokio::spawn(read_loop(
            label.clone(),
            stdout,
            pending.clone(),
            closed.clone(),
            tx.clone(),
        ));

        Self {
            label,
            turn: Mutex::new(()),
            next_id: AtomicU64::new(1),
            outbound: StdMutex::new(Some(tx)),
            pending,
            closed,
            reader: StdMutex::new(Some(reader)),
        }
    }

    fn send_line(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let line = serde_json::to_string(message)?;
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TransportError::io("transport state poisoned"))?;
        let sender = outbound
            .as_ref()
            .ok_or_else(|| TransportError::io("transport is closed"))?;
        sender
            .send(line)
            .map_err(|_| TransportError::io("stdin of the sandbox is closed"))
    }

    async fn exchange(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, TransportError> {
        let _turn = self.turn.lock().await;
        if self.is_closed() {
            return Err(TransportError::io("stdout of the sandbox is closed"));
        }

        let internal_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let caller_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| TransportError::io("transport state poisoned"))?
            .insert(internal_id, tx);
        let _slot = PendingSlot {
            pending: self.pending.clone(),
            id: internal_id,
        };
        // The reader marks the stream closed before draining pending calls
        if self.is_closed() {
            return Err(TransportError::io("stdout of the sandbox is closed"));
        }

        let mut outgoing = request;
        outgoing.id = Some(json!(internal_id));
        self.send_line(&outgoing)?;

        let mut response = rx
            .await
            .map_err(|_| TransportError::io("stdout of the sandbox closed before a response arrived"))?;
        response.id = caller_id;
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn call(&self, request: JsonRpcMessage, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        let method = request.method.clone().unwrap_or_default();
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| {
                log::warn!("[{}] {} timed out after {:?}", self.label, method, timeout);
                TransportError::timeout(format!("no response to '{}' within {:?}", method, timeout))
            })?
    }

    async fn notify(&self, notification: JsonRpcMessage) -> Result<(), TransportError> {
        let _turn = self.turn.lock().await;
        self.send_line(&notification)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // Dropping the sender ends the writer, which closes stdin
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        log::debug!("[{}] stdio transport closed", self.label);
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

async fn write_loop(
    label: String,
    mut stdin: Pin<Box<dyn AsyncWrite + Send>>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            log::warn!("[{}] write to sandbox stdin failed: {}", label, e);
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_loop(
    label: String,
    stdout: Pin<Box<dyn AsyncRead + Send>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&label, &line, &pending, &outbound),
            Ok(None) => {
                log::info!("[{}] sandbox stdout reached EOF", label);
                break;
            }
            Err(e) => {
                log::warn!("[{}] reading sandbox stdout failed: {}", label, e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiting call with an I/O error
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}

fn dispatch_line(
    label: &str,
    line: &str,
    pending: &Pending,
    outbound: &mpsc::UnboundedSender<String>,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let message: JsonRpcMessage = match serde_json::from_str(trimmed) {
        Ok(message) => message,
        Err(_) => {
            log::debug!("[{}] skipping non-JSON output: {}", label, trimmed);
            return;
        }
    };

    if message.is_notification() {
        log::debug!(
            "[{}] server notification {}",
            label,
            message.method.as_deref().unwrap_or_default()
        );
        return;
    }

    // Requests initiated by the server; only ping is answered meaningfully
    if let (Some(method), Some(id)) = (message.method.as_deref(), message.id.clone()) {
        let reply = if method == "ping" {
            JsonRpcMessage::response(id, json!({}))
        } else {
            JsonRpcMessage::error_response(id, -32601, format!("method '{}' not supported by client", method))
        };
        if let Ok(line) = serde_json::to_string(&reply) {
            let _ = outbound.send(line);
        }
        return;
    }

    let Some(id) = message.id.as_ref().and_then(Value::as_u64) else {
        log::debug!("[{}] skipping response with foreign id: {}", label, trimmed);
        return;
    };

    let waiter = pending.lock().ok().and_then(|mut pending| pending.remove(&id));
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => log::debug!("[{}] dropping late response for request {}", label, id),
    }
}
