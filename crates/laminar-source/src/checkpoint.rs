//! Versioned checkpoint payloads.
//!
//! Every payload handed to the checkpoint store starts with a 4-byte
//! big-endian serializer version followed by the serializer's bytes:
//!
//! ```text
//! +---------+---------------------------+
//! | version |          payload          |
//! |  u32 BE |  (serializer-specific)    |
//! +---------+---------------------------+
//! ```
//!
//! Decoding a payload whose version the serializer does not understand fails
//! with [`SourceError::UnsupportedVersion`]; nothing is partially decoded.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SourceError};

/// Serializer for checkpointed values with an explicit format version.
pub trait VersionedSerializer<T>: Send + Sync {
    /// Version written by [`VersionedSerializer::serialize`].
    fn version(&self) -> u32;

    /// Serializes a value in the current format.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes bytes written by format `version`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnsupportedVersion` for unknown versions.
    fn deserialize(&self, version: u32, bytes: &[u8]) -> Result<T>;
}

/// JSON serializer for any serde type, fixed to one format version.
pub struct JsonSerializer<T> {
    version: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    /// Creates a serializer writing and accepting `version`.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self {
            version,
            _marker: PhantomData,
        }
    }

    /// Convenience constructor returning a shareable trait object.
    #[must_use]
    pub fn shared(version: u32) -> Arc<dyn VersionedSerializer<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        Arc::new(Self::new(version))
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("version", &self.version)
            .finish()
    }
}

impl<T> VersionedSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn version(&self) -> u32 {
        self.version
    }

    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, version: u32, bytes: &[u8]) -> Result<T> {
        if version != self.version {
            return Err(SourceError::UnsupportedVersion {
                found: version,
                supported: self.version,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encodes `value` with its serializer version prefix.
///
/// # Errors
///
/// Propagates serializer errors.
pub fn serialize_versioned<T>(serializer: &dyn VersionedSerializer<T>, value: &T) -> Result<Bytes> {
    let payload = serializer.serialize(value)?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(serializer.version());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a payload written by [`serialize_versioned`].
///
/// # Errors
///
/// Returns `SourceError::CorruptCheckpoint` if the prefix is missing, or the
/// serializer's error for unknown versions and malformed payloads.
pub fn deserialize_versioned<T>(serializer: &dyn VersionedSerializer<T>, bytes: &[u8]) -> Result<T> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err(SourceError::CorruptCheckpoint(format!(
            "payload of {} bytes has no version prefix",
            bytes.len()
        )));
    }
    let version = buf.get_u32();
    serializer.deserialize(version, buf)
}

/// Enumerator snapshot: connector-specific state plus splits not yet assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumeratorCheckpoint<St, Sp> {
    /// Enumerator-private state (discovery cursor, seen paths, ...).
    pub state: St,
    /// Splits discovered but not yet handed to any reader.
    pub pending_splits: Vec<Sp>,
}

impl<St, Sp> EnumeratorCheckpoint<St, Sp> {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(state: St, pending_splits: Vec<Sp>) -> Self {
        Self {
            state,
            pending_splits,
        }
    }
}

/// Reader snapshot: every owned split with its current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderCheckpoint<Sp> {
    /// Checkpoint the snapshot belongs to.
    pub checkpoint_id: u64,
    /// Owned splits in split-id order, each carrying its progress.
    pub splits: Vec<Sp>,
}

/// Binary framing of a [`ReaderCheckpoint`].
///
/// ```text
/// u32 envelope version | u64 checkpoint id | u32 split serializer version
/// u32 split count      | { u32 len | split bytes } * count
/// ```
pub struct ReaderCheckpointSerializer<Sp> {
    splits: Arc<dyn VersionedSerializer<Sp>>,
}

impl<Sp> std::fmt::Debug for ReaderCheckpointSerializer<Sp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderCheckpointSerializer")
            .field("split_version", &self.splits.version())
            .finish()
    }
}

impl<Sp> ReaderCheckpointSerializer<Sp> {
    /// Envelope format version.
    pub const VERSION: u32 = 1;

    /// Creates a framing serializer around a split serializer.
    #[must_use]
    pub fn new(splits: Arc<dyn VersionedSerializer<Sp>>) -> Self {
        Self { splits }
    }

    /// Encodes a reader snapshot.
    ///
    /// # Errors
    ///
    /// Propagates split serializer errors.
    pub fn encode(&self, checkpoint: &ReaderCheckpoint<Sp>) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u32(Self::VERSION);
        buf.put_u64(checkpoint.checkpoint_id);
        buf.put_u32(self.splits.version());
        buf.put_u32(frame_len(checkpoint.splits.len())?);
        for split in &checkpoint.splits {
            let bytes = self.splits.serialize(split)?;
            buf.put_u32(frame_len(bytes.len())?);
            buf.put_slice(&bytes);
        }
        Ok(buf.freeze())
    }

    /// Decodes a reader snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnsupportedVersion` for an unknown envelope or
    /// split version and `SourceError::CorruptCheckpoint` for truncated input.
    pub fn decode(&self, bytes: &[u8]) -> Result<ReaderCheckpoint<Sp>> {
        let mut buf = bytes;
        ensure_remaining(buf, 4, "envelope version")?;
        let version = buf.get_u32();
        if version != Self::VERSION {
            return Err(SourceError::UnsupportedVersion {
                found: version,
                supported: Self::VERSION,
            });
        }
        ensure_remaining(buf, 16, "header")?;
        let checkpoint_id = buf.get_u64();
        let split_version = buf.get_u32();
        let count = buf.get_u32() as usize;

        let mut splits = Vec::with_capacity(count.min(1024));
        for idx in 0..count {
            ensure_remaining(buf, 4, "split length")?;
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(SourceError::CorruptCheckpoint(format!(
                    "split {idx} declares {len} bytes, {} remain",
                    buf.remaining()
                )));
            }
            let (head, tail) = buf.split_at(len);
            splits.push(self.splits.deserialize(split_version, head)?);
            buf = tail;
        }
        if buf.has_remaining() {
            return Err(SourceError::CorruptCheckpoint(format!(
                "{} trailing bytes after {count} splits",
                buf.remaining()
            )));
        }
        Ok(ReaderCheckpoint {
            checkpoint_id,
            splits,
        })
    }
}

fn ensure_remaining(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(SourceError::CorruptCheckpoint(format!(
            "truncated {what}: need {needed} bytes, {} remain",
            buf.len()
        )));
    }
    Ok(())
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| SourceError::CorruptCheckpoint(format!("frame of {len} exceeds u32")))
}
