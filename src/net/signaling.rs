//! Out-of-band signaling store
//!
//! Connection descriptors travel between host and joiner through a shared
//! key/value namespace. The store is polled, never pushed: the host writes
//! its offer and polls for the answer, the joiner reads the offer and
//! writes the answer.
//!
//! Keys have the form `"{namespace}_{kind}_{CODE}"` and values are JSON
//! [`SignalRecord`]s. Each key has exactly one writer role, so concurrent
//! unrelated sessions never collide and no locking is required.
//!
//! Two backends are provided:
//!
//! - [`MemorySignalingStore`]: an in-process map, shared by cloning
//! - [`DirSignalingStore`]: one file per key in a directory that both
//!   processes can see

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};

use super::pairing::SessionCode;

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "p2p";

/// Environment variable overriding the default signal directory
pub const SIGNAL_DIR_ENV: &str = "PEERDROP_SIGNAL_DIR";

/// Errors that can occur while talking to a signaling store
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The backing storage failed
    #[error("signaling store I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The key contains characters the backend cannot store
    #[error("invalid signaling key: {0}")]
    InvalidKey(Arc<str>),
}

/// Key/value namespace used for descriptor exchange
pub trait SignalingStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value
    fn put(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// Returns the value under `key`, or `None` if absent
    fn get(&self, key: &str)
        -> impl Future<Output = Result<Option<String>, SignalingError>> + Send;

    /// Removes `key`; removing an absent key is not an error
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), SignalingError>> + Send;
}

/// Which negotiation message a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Written by the host, read by the joiner
    Offer,
    /// Written by the joiner, read by the host
    Answer,
}

impl SignalKind {
    /// Returns the wire tag for this kind
    pub const fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A descriptor as stored in the signaling namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Opaque descriptor produced by the transport
    pub data: String,
    /// Milliseconds since the Unix epoch at creation
    pub timestamp: u64,
}

impl SignalRecord {
    /// Creates a record stamped with the current time
    pub fn new(kind: SignalKind, data: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind,
            data: data.into(),
            timestamp,
        }
    }

    /// Serializes the record to its JSON form
    pub fn to_json(&self) -> String {
        // Only strings and integers: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a stored value, returning `None` if it has the wrong shape
    pub fn from_json(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }
}

/// Derives the store key for `kind` under `code`
pub fn signal_key(namespace: &str, kind: SignalKind, code: &SessionCode) -> String {
    format!("{namespace}_{}_{}", kind.as_str(), code.as_str())
}

/// In-process signaling store
///
/// Clones share the same map, so a host and a joiner in one process (or
/// one test) can rendezvous through it.
#[derive(Debug, Clone, Default)]
pub struct MemorySignalingStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemorySignalingStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl SignalingStore for MemorySignalingStore {
    async fn put(&self, key: &str, value: String) -> Result<(), SignalingError> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SignalingError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), SignalingError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Directory-backed signaling store
///
/// Every key is one `<key>.json` file. Two processes pointed at the same
/// directory (a shared folder, or simply two terminals on one machine) can
/// rendezvous without any server.
#[derive(Debug, Clone)]
pub struct DirSignalingStore {
    root: PathBuf,
}

impl DirSignalingStore {
    /// Creates a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, SignalingError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened signaling directory");
        Ok(Self { root })
    }

    /// Returns the default signaling directory
    ///
    /// Uses `PEERDROP_SIGNAL_DIR` if set, otherwise a `peerdrop/signals`
    /// directory under the platform cache directory.
    pub fn default_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(SIGNAL_DIR_ENV) {
            return PathBuf::from(dir);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("peerdrop")
            .join("signals")
    }

    /// Returns the directory this store writes to
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SignalingError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SignalingError::InvalidKey(Arc::from(key)));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl SignalingStore for DirSignalingStore {
    #[instrument(skip(self, value), fields(root = %self.root.display()))]
    async fn put(&self, key: &str, value: String) -> Result<(), SignalingError> {
        let path = self.path_for(key)?;
        // Write then rename so a polling reader never sees a partial record
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SignalingError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SignalingError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
