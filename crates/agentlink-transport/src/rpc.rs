//! Request/response correlation over a framed byte stream.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, timeout_at},
};

use agentlink_core::{Error, Result, RpcError};

use crate::{
    codec::{FrameReader, write_frame},
    frame::{Incoming, Request, Response, id_key},
};

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
type Slot = oneshot::Sender<Result<Value>>;

/// Unsolicited frame from the agent, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Notification {
        method: String,
        params: Value,
    },
    /// Must be answered with [`RpcClient::respond`].
    Request {
        id: Value,
        method: String,
        params: Value,
    },
}

struct Shared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<String, Slot>>,
    inflight: watch::Sender<usize>,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn take_pending(&self, id: &str) -> Option<Slot> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = pending.remove(id);
        self.inflight.send_replace(pending.len());
        slot
    }

    /// Register a call unless the client is closed. Checked under the same
    /// lock [`Shared::shutdown`] drains with.
    fn register(&self, id: &str, slot: Slot) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *self.closed.borrow() {
            return Err(Error::ConnectionClosed);
        }
        pending.insert(id.to_string(), slot);
        self.inflight.send_replace(pending.len());
        Ok(())
    }

    /// Fail every outstanding call and mark the client closed.
    fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.send_replace(true);
            let slots = pending.drain().map(|(_, slot)| slot).collect();
            self.inflight.send_replace(0);
            slots
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Failing pending calls on close");
        }
        for slot in drained {
            let _ = slot.send(Err(Error::ConnectionClosed));
        }
    }
}

/// Removes the pending entry if the call is dropped before resolution.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.take_pending(self.id);
    }
}

/// JSON-RPC client that correlates responses with outstanding calls.
///
/// Responses resolve the matching call directly on the reader task. Every
/// other frame is forwarded, in arrival order, on the [`Inbound`] channel
/// returned by [`RpcClient::spawn`].
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// Start the reader task over `reader` and return the client together
    /// with the inbound frame channel.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let (inflight, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(Box::pin(writer))),
            pending: Mutex::new(HashMap::new()),
            inflight,
            closed,
            reader: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            read_loop(FrameReader::new(reader), &task_shared, &tx).await;
            task_shared.shutdown();
        });
        *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        (Self { shared }, rx)
    }

    /// Issue `method` and wait up to `timeout` for its response. The
    /// timeout covers writing the request as well as the reply.
    ///
    /// A write cut short by the timeout leaves a partial frame on the
    /// stream, so the client closes itself.
    ///
    /// # Errors
    /// `Remote` for an error reported by the agent, `Timeout` when the
    /// deadline passes, `ConnectionClosed` when the stream goes away first.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.register(&id, tx)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: &id,
        };

        let body = serde_json::to_vec(&Request::new(&id, method, &params))?;
        let Ok(mut writer) = timeout_at(deadline, self.shared.writer.lock()).await else {
            tracing::debug!(method, id = %id, "Timed out waiting to write request");
            return Err(Error::Timeout(timeout));
        };
        let Some(w) = writer.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        let written = timeout_at(deadline, write_frame(w, &body)).await;
        match written {
            Ok(written) => written.map_err(write_error)?,
            Err(_) => {
                tracing::warn!(method, id = %id, "Request write timed out, closing stream");
                writer.take();
                drop(writer);
                self.abort();
                return Err(Error::Timeout(timeout));
            }
        }
        drop(writer);
        tracing::trace!(method, id = %id, "Sent request");

        match timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                tracing::debug!(method, id = %id, "Request timed out");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Answer a server→client request.
    ///
    /// # Errors
    /// Returns error if the frame cannot be written.
    pub async fn respond(&self, id: &Value, outcome: std::result::Result<Value, RpcError>) -> Result<()> {
        let body = serde_json::to_vec(&Response::new(id, &outcome))?;
        self.write(&body).await
    }

    async fn write(&self, body: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        write_frame(w, body).await.map_err(write_error)
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        *self.shared.inflight.borrow()
    }

    /// Wait until no call is outstanding. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.inflight.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the stream has ended or [`RpcClient::close`] was called.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shut the write half, stop reading and fail outstanding calls.
    pub async fn close(&self) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Error shutting down writer: {e}");
            }
        }
        let reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.shared.shutdown();
    }

    /// Stop reading and fail outstanding calls without touching the writer.
    pub fn abort(&self) {
        let reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.shared.shutdown();
    }
}

fn write_error(e: std::io::Error) -> Error {
    if matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    ) {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    shared: &Shared,
    tx: &mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let body = match reader.read_frame().await {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!("Agent closed the stream");
                return;
            }
            Err(Error::Protocol(msg)) => {
                tracing::warn!("Framing error, closing stream: {msg}");
                return;
            }
            Err(e) => {
                tracing::debug!("Error reading from agent: {e}");
                return;
            }
        };

        match Incoming::parse(&body) {
            Ok(Incoming::Response { id, outcome }) => {
                let key = id_key(&id);
                if let Some(slot) = shared.take_pending(&key) {
                    let _ = slot.send(outcome.map_err(Error::Remote));
                } else {
                    tracing::debug!(id = %key, "Dropping response for unknown or expired request");
                }
            }
            Ok(Incoming::Notification { method, params }) => {
                let _ = tx.send(Inbound::Notification { method, params });
            }
            Ok(Incoming::Request { id, method, params }) => {
                let _ = tx.send(Inbound::Request { id, method, params });
            }
            Err(e) => {
                tracing::warn!("Skipping malformed frame: {e}");
            }
        }
    }
}
