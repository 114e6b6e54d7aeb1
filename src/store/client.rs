//! Remote Store Client
//!
//! `CoordinationStore` over a TCP connection to a `StoreServer`. Requests
//! are multiplexed by transaction id; watch and session events arrive as
//! pushed frames and are forwarded to the session's event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{read_frame, write_frame, Frame, Reply, Request};
use super::{CoordinationStore, CreateMode, EventReceiver, SessionId, Stat, StoreEvent};
use crate::error::{Error, Result};

/// Replies awaited by in-flight requests
type PendingMap = HashMap<u64, oneshot::Sender<Reply>>;

/// State shared with the reader and ping tasks
struct Shared {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<PendingMap>,
    next_xid: AtomicU64,
    /// No further requests may be sent
    closed: AtomicBool,
    /// Set by an explicit close so the reader stays quiet on EOF
    closing: AtomicBool,
}

impl Shared {
    async fn call(&self, request: Request) -> Result<Reply> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLoss);
        }

        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(xid, tx);

        // The reader marks `closed` before draining `pending`
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&xid);
            return Err(Error::ConnectionLoss);
        }

        let frame = Frame::Request { xid, request };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&xid);
            tracing::debug!("Failed to send request {}: {}", xid, e);
            return Err(Error::ConnectionLoss);
        }

        match rx.await.map_err(|_| Error::ConnectionLoss)? {
            Reply::Error { code, message } => Err(code.into_error(message)),
            reply => Ok(reply),
        }
    }
}

/// Client session on a remote coordination store
pub struct RemoteStore {
    address: String,
    session_id: SessionId,
    shared: Arc<Shared>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteStore {
    /// Connect to a store server and open a session.
    ///
    /// `Connected` is the first event on the returned channel.
    pub async fn connect(
        address: &str,
        session_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = Frame::Request {
            xid: 0,
            request: Request::Connect {
                session_timeout_ms: session_timeout.as_millis() as u64,
            },
        };
        write_frame(&mut writer, &hello).await?;

        let (session_id, negotiated_ms) = match timeout(connect_timeout, read_frame(&mut reader)).await {
            Ok(Ok(Frame::Reply { reply: Reply::Connected { session_id, session_timeout_ms }, .. })) => {
                (session_id, session_timeout_ms)
            }
            Ok(Ok(_)) => return Err(Error::Protocol("unexpected handshake reply".into())),
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        let session_timeout = Duration::from_millis(negotiated_ms);

        tracing::info!(
            "Connected to coordination store at {} (session {}, timeout {} ms)",
            address,
            session_id,
            negotiated_ms
        );

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_xid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Reader: route replies to callers, events to the session channel
        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Frame::Reply { xid, reply }) => {
                        if let Some(tx) = reader_shared.pending.lock().await.remove(&xid) {
                            let _ = tx.send(reply);
                        }
                    }
                    Ok(Frame::Event(event)) => {
                        if event == StoreEvent::Expired {
                            reader_shared.closed.store(true, Ordering::SeqCst);
                        }
                        let _ = events_tx.send(event);
                    }
                    Ok(Frame::Request { .. }) => {
                        tracing::warn!("Ignoring request frame from store server");
                    }
                    Err(e) => {
                        tracing::debug!("Store connection reader stopped: {}", e);
                        break;
                    }
                }
            }

            let was_closed = reader_shared.closed.swap(true, Ordering::SeqCst);
            reader_shared.pending.lock().await.clear();
            if !was_closed && !reader_shared.closing.load(Ordering::SeqCst) {
                let _ = events_tx.send(StoreEvent::Disconnected);
            }
        });

        // Pinger: keep the session alive well inside its timeout
        let ping_shared = Arc::clone(&shared);
        let ping_interval = session_timeout / 3;
        let ping_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ping_shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                match timeout(session_timeout, ping_shared.call(Request::Ping)).await {
                    Ok(Ok(_)) => tracing::trace!("Session ping acknowledged"),
                    Ok(Err(e)) => {
                        tracing::warn!("Session ping failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("Session ping timed out");
                        break;
                    }
                }
            }
        });

        let store = Arc::new(Self {
            address: address.to_string(),
            session_id,
            shared,
            tasks: std::sync::Mutex::new(vec![reader_task, ping_task]),
        });

        Ok((store, events_rx))
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn unexpected(reply: Reply) -> Error {
        Error::Protocol(format!("unexpected reply: {:?}", reply))
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let request = Request::Create {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
        };
        match self.shared.call(request).await? {
            Reply::Created(path) => Ok(path),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn delete(&self, path: &str, version: i32) -> Result<()> {
        let request = Request::Delete {
            path: path.to_string(),
            version,
        };
        match self.shared.call(request).await? {
            Reply::Deleted => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        let request = Request::Exists {
            path: path.to_string(),
            watch,
        };
        match self.shared.call(request).await? {
            Reply::Exists(stat) => Ok(stat),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let request = Request::GetChildren {
            path: path.to_string(),
            watch,
        };
        match self.shared.call(request).await? {
            Reply::Children(children) => Ok(children),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat)> {
        let request = Request::GetData {
            path: path.to_string(),
            watch,
        };
        match self.shared.call(request).await? {
            Reply::Data { data, stat } => Ok((data, stat)),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> Result<Stat> {
        let request = Request::SetData {
            path: path.to_string(),
            data: data.to_vec(),
            version,
        };
        match self.shared.call(request).await? {
            Reply::Stat(stat) => Ok(stat),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = match self.shared.call(Request::Close).await {
            Ok(_) | Err(Error::ConnectionLoss) => Ok(()),
            Err(e) => Err(e),
        };
        self.shared.closed.store(true, Ordering::SeqCst);
        self.abort_tasks();
        tracing::info!("Closed session {} on {}", self.session_id, self.address);
        result
    }
}
