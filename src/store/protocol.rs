//! Store Wire Protocol
//!
//! Defines the frames exchanged between `RemoteStore` and `StoreServer`.
//! Every frame is a bincode body behind a length + CRC32 header.

use serde::{Deserialize, Serialize};

use super::{CreateMode, SessionId, Stat, StoreEvent};
use crate::error::{Error, Result};

/// Requests sent by a client session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Open a session (must be the first frame on a connection)
    Connect { session_timeout_ms: u64 },
    Create { path: String, data: Vec<u8>, mode: CreateMode },
    Delete { path: String, version: i32 },
    Exists { path: String, watch: bool },
    GetChildren { path: String, watch: bool },
    GetData { path: String, watch: bool },
    SetData { path: String, data: Vec<u8>, version: i32 },
    /// Keeps the session alive
    Ping,
    /// End the session
    Close,
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "Connect",
            Request::Create { .. } => "Create",
            Request::Delete { .. } => "Delete",
            Request::Exists { .. } => "Exists",
            Request::GetChildren { .. } => "GetChildren",
            Request::GetData { .. } => "GetData",
            Request::SetData { .. } => "SetData",
            Request::Ping => "Ping",
            Request::Close => "Close",
        }
    }
}

/// Replies from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Connected { session_id: SessionId, session_timeout_ms: u64 },
    Created(String),
    Deleted,
    Exists(Option<Stat>),
    Children(Vec<String>),
    Data { data: Vec<u8>, stat: Stat },
    Stat(Stat),
    Pong,
    Closed,
    Error { code: ErrorCode, message: String },
}

impl Reply {
    /// Build an error reply from a store error
    pub fn from_error(error: &Error) -> Self {
        let (code, message) = match error {
            Error::NodeExists(p) => (ErrorCode::NodeExists, p.clone()),
            Error::NoNode(p) => (ErrorCode::NoNode, p.clone()),
            Error::NoParent(p) => (ErrorCode::NoParent, p.clone()),
            Error::NotEmpty(p) => (ErrorCode::NotEmpty, p.clone()),
            Error::NoChildrenForEphemerals(p) => (ErrorCode::NoChildrenForEphemerals, p.clone()),
            Error::InvalidPath(p) => (ErrorCode::InvalidPath, p.clone()),
            Error::BadVersion { path, expected, actual } => {
                (ErrorCode::BadVersion, format!("{}:{}:{}", path, expected, actual))
            }
            Error::SessionExpired => (ErrorCode::SessionExpired, String::new()),
            other => (ErrorCode::Internal, other.to_string()),
        };
        Reply::Error { code, message }
    }
}

/// Error codes carried in `Reply::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NodeExists,
    NoNode,
    NoParent,
    NotEmpty,
    BadVersion,
    NoChildrenForEphemerals,
    InvalidPath,
    SessionExpired,
    Internal,
}

impl ErrorCode {
    /// Rebuild the crate error on the client side
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorCode::NodeExists => Error::NodeExists(message),
            ErrorCode::NoNode => Error::NoNode(message),
            ErrorCode::NoParent => Error::NoParent(message),
            ErrorCode::NotEmpty => Error::NotEmpty(message),
            ErrorCode::NoChildrenForEphemerals => Error::NoChildrenForEphemerals(message),
            ErrorCode::InvalidPath => Error::InvalidPath(message),
            ErrorCode::BadVersion => {
                let mut parts = message.rsplitn(3, ':');
                let actual = parts.next().and_then(|v| v.parse().ok()).unwrap_or_default();
                let expected = parts.next().and_then(|v| v.parse().ok()).unwrap_or_default();
                let path = parts.next().unwrap_or_default().to_string();
                Error::BadVersion { path, expected, actual }
            }
            ErrorCode::SessionExpired => Error::SessionExpired,
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

/// Top-level frame on the connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request { xid: u64, request: Request },
    Reply { xid: u64, reply: Reply },
    /// Pushed watch or session notification
    Event(StoreEvent),
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_BODY: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Protocol(format!("Frame too large: {} bytes", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Protocol("Frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
