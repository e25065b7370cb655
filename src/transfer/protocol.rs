//! Wire types and framing for the chunked transfer protocol.
//!
//! All frames: `u32` big-endian length, followed by exactly that many bytes
//! of UTF-8 JSON. This implementation picks the "inlined base64 payload"
//! profile rather than a binary-trailer profile, and is consistent about
//! it everywhere.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TransportError, TransportErrorKind};

pub const MAX_REQUEST_FRAME: u32 = 1024 * 1024;
pub const MAX_CHUNK_FRAME: u32 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub filename: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_config: Option<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub chunk_size: u32,
    pub max_concurrent: u16,
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub metadata: TransferMetadata,
    pub chunking: ChunkingParams,
    pub resume_transfer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub auth: AuthInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// JSON-encoded array of already-received chunk indices, on resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional: Option<String>,
    /// Issued on a fresh (non-resume) session; absent on resume, since the
    /// client already holds the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl TransferResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            additional: None,
            resume_token: None,
        }
    }

    pub fn ok_fresh(resume_token: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            additional: None,
            resume_token: Some(resume_token.into()),
        }
    }

    pub fn ok_with_received(received: &[u32]) -> Self {
        Self {
            success: true,
            error: None,
            additional: Some(serde_json::to_string(received).unwrap_or_else(|_| "[]".to_string())),
            resume_token: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            additional: None,
            resume_token: None,
        }
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.additional
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    pub index: u32,
    pub size: u32,
    pub sha256: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub chunk_index: u32,
}

impl ChunkResult {
    pub fn ok(chunk_index: u32) -> Self {
        Self {
            success: true,
            error: None,
            chunk_index,
        }
    }

    pub fn err(chunk_index: u32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            chunk_index,
        }
    }
}

/// Reads one length-prefixed frame, rejecting anything over `max_len`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, TransportError> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Connect, err.to_string()))?;
    let len = u32::from_be_bytes(len_bytes);
    if len > max_len {
        return Err(TransportError::new(
            TransportErrorKind::Protocol,
            format!("frame of {len} bytes exceeds the {max_len} byte limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Connect, err.to_string()))?;
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::new(TransportErrorKind::Protocol, "frame too large to encode"))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Connect, err.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|err| TransportError::new(TransportErrorKind::Connect, err.to_string()))?;
    Ok(())
}

pub async fn read_json_frame<R, T>(reader: &mut R, max_len: u32) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let raw = read_frame(reader, max_len).await?;
    serde_json::from_slice(&raw).map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))
}

pub async fn write_json_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let raw =
        serde_json::to_vec(value).map_err(|err| TransportError::new(TransportErrorKind::Protocol, err.to_string()))?;
    write_frame(writer, &raw).await
}
