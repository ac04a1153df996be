//! Content hashing
//!
//! SHA-256 over the raw bytes, rendered as 64 lowercase hex characters. The
//! digest is the only identity a blob ever has.
//!
//! All hashing is streaming: readers are consumed through a fixed buffer and
//! never held in memory as a whole.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Streaming buffer size (64KB)
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest
pub const CONTENT_ID_LEN: usize = 64;

/// Content identifier: hex-encoded SHA-256 digest of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    fn from_digest(hasher: Sha256) -> Self {
        ContentId(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for log lines and listings
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != CONTENT_ID_LEN {
            return Err(AppError::validation_error(format!(
                "content id must be {} hex characters, got {}",
                CONTENT_ID_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(AppError::validation_error(format!(
                "content id must be lowercase hex: {}",
                s
            )));
        }
        Ok(ContentId(s.to_string()))
    }
}

impl TryFrom<String> for ContentId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

/// Hash an in-memory buffer
pub fn hash_bytes(content: &[u8]) -> ContentId {
    let mut hasher = Sha256::new();
    hasher.update(content);
    ContentId::from_digest(hasher)
}

/// Hash a reader to EOF
///
/// Returns the digest and the number of bytes consumed. Read failures are
/// reported as [`AppError::Read`]; no digest is produced for a partial stream.
pub async fn hash_reader<R>(mut reader: R) -> Result<(ContentId, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .map_err(|e| AppError::read_error(format!("Failed to read stream: {}", e), None))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((ContentId::from_digest(hasher), total))
}

/// Hash a file on disk
///
/// The byte count is checked against the size reported before reading, so a
/// file truncated mid-hash is rejected instead of yielding a short digest.
pub async fn hash_file(path: &Path) -> Result<(ContentId, u64)> {
    let file = fs::File::open(path).await.map_err(|e| {
        AppError::read_error(
            format!("Failed to open file for hashing: {}", e),
            Some(path.to_path_buf()),
        )
    })?;

    let expected = file
        .metadata()
        .await
        .map_err(|e| {
            AppError::read_error(
                format!("Failed to stat file for hashing: {}", e),
                Some(path.to_path_buf()),
            )
        })?
        .len();

    let (id, total) = hash_reader(file).await.map_err(|e| match e {
        AppError::Read { message, .. } => AppError::Read {
            message,
            path: Some(path.to_path_buf()),
        },
        other => other,
    })?;

    if total != expected {
        return Err(AppError::read_error(
            format!(
                "File changed size while hashing: expected {} bytes, read {}",
                expected, total
            ),
            Some(path.to_path_buf()),
        ));
    }

    Ok((id, total))
}

/// Copy a reader into a writer while hashing the bytes that pass through
///
/// Read failures become [`AppError::Read`], write failures
/// [`AppError::Storage`]. The writer is flushed but not synced.
pub async fn hash_and_copy<R, W>(mut reader: R, writer: &mut W) -> Result<(ContentId, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .map_err(|e| AppError::read_error(format!("Failed to read source: {}", e), None))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        writer
            .write_all(&buffer[..bytes_read])
            .await
            .map_err(|e| AppError::storage_error(format!("Failed to write blob: {}", e), None))?;
        total += bytes_read as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| AppError::storage_error(format!("Failed to flush blob: {}", e), None))?;

    Ok((ContentId::from_digest(hasher), total))
}
