//! Receiver-side reassembly of a chunk stream
//!
//! The [`Reassembler`] is a small synchronous state machine:
//! `idle → receiving → idle`, once per file. A `file-info` message starts a
//! file, binary chunks are appended in arrival order, and the file is
//! rebuilt as soon as the received byte count reaches the declared size.
//! The transport guarantees ordered delivery, so no sequence numbers are
//! needed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::message::FileMetadata;

/// Name used when the sender's file name is unusable on disk
const FALLBACK_FILE_NAME: &str = "received.bin";

/// A file rebuilt from its chunks
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// The file name sent by the peer
    pub name: Arc<str>,
    /// The media type sent by the peer
    pub media_type: Arc<str>,
    /// File contents
    pub data: Bytes,
    /// When reconstruction finished
    pub received_at: Instant,
}

impl ReceivedFile {
    /// A zero-byte file matching an announcement
    ///
    /// Empty files send no chunks, so the [`Reassembler`] never completes
    /// them.
    pub fn empty(metadata: &FileMetadata) -> Self {
        Self {
            name: Arc::from(metadata.name.as_str()),
            media_type: Arc::from(metadata.media_type.as_str()),
            data: Bytes::new(),
            received_at: Instant::now(),
        }
    }

    /// File size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns the age of the received file
    #[inline]
    pub fn age(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }

    /// Writes the file into `dir`, returning the path written
    ///
    /// Only the final component of the peer-supplied name is used, so a
    /// name like `../../etc/passwd` lands inside `dir` as `passwd`.
    pub async fn save_into(&self, dir: impl AsRef<Path>) -> std::io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let file_name = Path::new(&*self.name)
            .file_name()
            .filter(|n| !n.is_empty())
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.into());
        let path = dir.join(file_name);
        tokio::fs::write(&path, &self.data).await?;
        info!(path = %path.display(), size = self.size(), "Saved received file");
        Ok(path)
    }
}

/// Phase of the receive state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceivePhase {
    /// No file announced
    #[default]
    Idle,
    /// Metadata accepted, collecting chunks
    Receiving,
}

/// What happened to an incoming chunk
#[derive(Debug)]
pub enum ChunkOutcome {
    /// No file was announced; the chunk was dropped
    Discarded,
    /// The chunk was appended; more are expected
    Buffered {
        /// Bytes received so far
        received: u64,
        /// Declared file size
        expected: u64,
    },
    /// The chunk completed the file
    Complete(ReceivedFile),
}

/// Accumulates chunks for the active file
#[derive(Debug, Default)]
pub struct Reassembler {
    metadata: Option<FileMetadata>,
    chunks: Vec<Bytes>,
    received: u64,
}

impl Reassembler {
    /// Creates an idle reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase
    pub fn phase(&self) -> ReceivePhase {
        if self.metadata.is_some() {
            ReceivePhase::Receiving
        } else {
            ReceivePhase::Idle
        }
    }

    /// Metadata of the file being received, if any
    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    /// Bytes received for the active file
    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// Chunks buffered for the active file
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Starts a new file, dropping anything buffered for a previous one
    pub fn begin(&mut self, metadata: FileMetadata) {
        if self.metadata.is_some() && !self.chunks.is_empty() {
            warn!(
                received = self.received,
                "New file announced before the previous one completed"
            );
        }
        info!(name = %metadata.name, size = metadata.size, "Receiving file");
        self.reset();
        self.metadata = Some(metadata);
    }

    /// Appends a chunk, rebuilding the file once it is complete
    pub fn push_chunk(&mut self, chunk: Bytes) -> ChunkOutcome {
        let Some(expected) = self.metadata.as_ref().map(|m| m.size) else {
            warn!(len = chunk.len(), "Discarding chunk received with no file announced");
            return ChunkOutcome::Discarded;
        };

        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
        debug!(
            received = self.received,
            expected,
            chunks = self.chunks.len(),
            "Received chunk"
        );

        if expected > 0 && self.received >= expected {
            if self.received > expected {
                warn!(
                    received = self.received,
                    expected, "Reconstruction mismatch: received more bytes than declared"
                );
            }
            ChunkOutcome::Complete(self.finish())
        } else {
            ChunkOutcome::Buffered {
                received: self.received,
                expected,
            }
        }
    }

    /// Returns to idle, discarding any partial file
    pub fn reset(&mut self) {
        self.metadata = None;
        self.chunks.clear();
        self.received = 0;
    }

    fn finish(&mut self) -> ReceivedFile {
        let metadata = self.metadata.take().unwrap_or_else(|| FileMetadata {
            name: FALLBACK_FILE_NAME.into(),
            size: self.received,
            media_type: String::new(),
        });
        let chunks = std::mem::take(&mut self.chunks);
        let data = if chunks.len() == 1 {
            chunks.into_iter().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.received as usize);
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        };
        info!(
            name = %metadata.name,
            size = data.len(),
            "Reconstructed file"
        );
        self.reset();

        ReceivedFile {
            name: Arc::from(metadata.name),
            media_type: Arc::from(metadata.media_type),
            data,
            received_at: Instant::now(),
        }
    }
}
