//! Store Server
//!
//! TCP server exposing a `MemoryStore` namespace. Each connection carries
//! exactly one session; the session ends when the client closes it, when
//! the connection drops, or when no frame arrives within the session
//! timeout.

use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::protocol::{read_frame, write_frame, Frame, Reply, Request};
use super::{CoordinationStore, EventReceiver, MemorySession, MemoryStore};
use crate::error::{Error, Result};

/// Bounds applied to the timeout a client asks for
const MIN_SESSION_TIMEOUT_MS: u64 = 200;
const MAX_SESSION_TIMEOUT_MS: u64 = 60_000;

/// Time allowed for the Connect frame after accept
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a served session came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Client sent Close
    Closed,
    /// Connection dropped or sent garbage
    Dropped,
    /// No frame within the session timeout
    TimedOut,
    /// The namespace expired the session on its own
    Expired,
}

/// Coordination store server
pub struct StoreServer {
    /// Bind address
    bind_address: String,
    /// Namespace shared by all sessions
    namespace: MemoryStore,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl StoreServer {
    /// Create a new store server
    pub fn new(bind_address: String, namespace: MemoryStore) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            namespace,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Coordination store listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let namespace = self.namespace.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), namespace).await {
                                    tracing::warn!("Session error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordination store stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single client connection for the lifetime of its session
async fn handle_connection(socket: TcpStream, peer_addr: String, namespace: MemoryStore) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let (xid, requested_ms) = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Frame::Request { xid, request: Request::Connect { session_timeout_ms } })) => {
            (xid, session_timeout_ms)
        }
        Ok(Ok(_)) => return Err(Error::Protocol("expected Connect as first frame".into())),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::ConnectionTimeout(peer_addr)),
    };
    let timeout_ms = requested_ms.clamp(MIN_SESSION_TIMEOUT_MS, MAX_SESSION_TIMEOUT_MS);

    let (session, mut events) = namespace.connect().await;
    let session_id = session.id();
    tracing::info!("Session {} established for {} (timeout {} ms)", session_id, peer_addr, timeout_ms);

    let connected = Frame::Reply {
        xid,
        reply: Reply::Connected { session_id, session_timeout_ms: timeout_ms },
    };
    if let Err(e) = write_frame(&mut writer, &connected).await {
        session.close().await?;
        return Err(e);
    }

    // Reads are not cancel-safe, so they run in their own task
    let (inbound_tx, inbound_rx) = mpsc::channel::<Result<Frame>>(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if inbound_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let end = serve_session(
        &session,
        &mut events,
        inbound_rx,
        &mut writer,
        Duration::from_millis(timeout_ms),
    )
    .await;
    reader_task.abort();

    match end {
        Ok(SessionEnd::Closed) | Ok(SessionEnd::Expired) => {}
        Ok(SessionEnd::TimedOut) => {
            tracing::warn!("Session {} from {} timed out", session_id, peer_addr);
            namespace.expire_session(session_id).await;
            while let Ok(event) = events.try_recv() {
                if write_frame(&mut writer, &Frame::Event(event)).await.is_err() {
                    break;
                }
            }
        }
        Ok(SessionEnd::Dropped) | Err(_) => {
            session.close().await?;
        }
    }

    tracing::info!("Session {} from {} ended", session_id, peer_addr);
    end.map(|_| ())
}

/// Request/event loop for one established session
async fn serve_session(
    session: &MemorySession,
    events: &mut EventReceiver,
    mut inbound: mpsc::Receiver<Result<Frame>>,
    writer: &mut OwnedWriteHalf,
    session_timeout: Duration,
) -> Result<SessionEnd> {
    let mut deadline = Instant::now() + session_timeout;

    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let (xid, request) = match frame {
                    Some(Ok(Frame::Request { xid, request })) => (xid, request),
                    Some(Ok(_)) => {
                        tracing::warn!("Unexpected frame from client in session {}", session.id());
                        return Ok(SessionEnd::Dropped);
                    }
                    Some(Err(Error::Io(ref e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Ok(SessionEnd::Dropped);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Error reading frame in session {}: {}", session.id(), e);
                        return Ok(SessionEnd::Dropped);
                    }
                    None => return Ok(SessionEnd::Dropped),
                };

                deadline = Instant::now() + session_timeout;
                tracing::trace!("Session {} request {} ({})", session.id(), xid, request.type_name());

                let closing = matches!(request, Request::Close);
                let reply = execute(session, request).await;

                // Watch events raised before this reply go out first
                while let Ok(event) = events.try_recv() {
                    write_frame(writer, &Frame::Event(event)).await?;
                }
                write_frame(writer, &Frame::Reply { xid, reply }).await?;

                if closing {
                    return Ok(SessionEnd::Closed);
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => write_frame(writer, &Frame::Event(event)).await?,
                    None => return Ok(SessionEnd::Expired),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(SessionEnd::TimedOut);
            }
        }
    }
}

/// Run one request against the session
async fn execute(session: &MemorySession, request: Request) -> Reply {
    let result = match request {
        Request::Create { path, data, mode } => session.create(&path, &data, mode).await.map(Reply::Created),
        Request::Delete { path, version } => session.delete(&path, version).await.map(|_| Reply::Deleted),
        Request::Exists { path, watch } => session.exists(&path, watch).await.map(Reply::Exists),
        Request::GetChildren { path, watch } => {
            session.get_children(&path, watch).await.map(Reply::Children)
        }
        Request::GetData { path, watch } => session
            .get_data(&path, watch)
            .await
            .map(|(data, stat)| Reply::Data { data, stat }),
        Request::SetData { path, data, version } => {
            session.set_data(&path, &data, version).await.map(Reply::Stat)
        }
        Request::Ping => Ok(Reply::Pong),
        Request::Close => session.close().await.map(|_| Reply::Closed),
        Request::Connect { .. } => Err(Error::Protocol("session already established".into())),
    };

    result.unwrap_or_else(|e| Reply::from_error(&e))
}

/// Serve a namespace on an ephemeral localhost port
#[cfg(test)]
pub(crate) async fn spawn_local(namespace: MemoryStore) -> Result<(std::sync::Arc<StoreServer>, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let server = std::sync::Arc::new(StoreServer::new(address.clone(), namespace));

    let serving = std::sync::Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = serving.serve(listener).await {
            tracing::error!("Store server error: {}", e);
        }
    });

    Ok((server, address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::protocol::read_frame;
    use crate::store::{CreateMode, StoreEvent};

    async fn handshake(address: &str, timeout_ms: u64) -> (tokio::net::tcp::OwnedReadHalf, OwnedWriteHalf, u64) {
        let stream = TcpStream::connect(address).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        write_frame(
            &mut writer,
            &Frame::Request { xid: 0, request: Request::Connect { session_timeout_ms: timeout_ms } },
        )
        .await
        .unwrap();

        match read_frame(&mut reader).await.unwrap() {
            Frame::Reply { reply: Reply::Connected { session_id, .. }, .. } => (reader, writer, session_id),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_session_times_out() {
        let namespace = MemoryStore::new();
        let (owner, _events) = namespace.connect().await;
        owner.create("/election", &[], CreateMode::Persistent).await.unwrap();

        let (server, address) = spawn_local(namespace.clone()).await.unwrap();
        let (mut reader, mut writer, _) = handshake(&address, 300).await;

        let create = Frame::Request {
            xid: 1,
            request: Request::Create {
                path: "/election/c_".into(),
                data: Vec::new(),
                mode: CreateMode::EphemeralSequential,
            },
        };
        write_frame(&mut writer, &create).await.unwrap();

        let mut saw_expired = false;
        loop {
            match read_frame(&mut reader).await {
                Ok(Frame::Event(StoreEvent::Expired)) => saw_expired = true,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        assert!(saw_expired);
        assert!(owner.get_children("/election", false).await.unwrap().is_empty());
        server.stop();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_connect() {
        let namespace = MemoryStore::new();
        let (server, address) = spawn_local(namespace.clone()).await.unwrap();

        let stream = TcpStream::connect(&address).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Request { xid: 0, request: Request::Ping }).await.unwrap();

        assert!(read_frame(&mut reader).await.is_err());
        assert_eq!(namespace.session_count().await, 0);
        server.stop();
    }
}
