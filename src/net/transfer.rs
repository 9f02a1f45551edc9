//! Chunked file transfer over a transport session
//!
//! The [`TransferEngine`] runs the drop protocol on one open
//! [`TransportSession`]:
//!
//! 1. The sender announces the file with a `file-info` message.
//! 2. The receiver resets its reassembly state and answers `ready`.
//! 3. The sender streams the content as binary chunks, pausing whenever the
//!    transport reports too many bytes still in flight.
//! 4. The receiver rebuilds the file once the declared size has arrived
//!    and reports it through the file-received callback.
//!
//! Both directions run on the same engine: `send_file` runs on the caller's
//! task, while a dispatch task spawned by the engine routes incoming
//! messages.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::message::{ControlMessage, FileMetadata};
use super::reassembly::{ChunkOutcome, Reassembler};
use super::session::{ChannelMessage, ConnectionState, Transport, TransportError, TransportSession};

pub use super::reassembly::ReceivedFile;

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default backpressure threshold, in chunks
const BACKPRESSURE_CHUNKS: u64 = 10;

/// Default interval between buffered-amount checks
const DEFAULT_BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// Default bound on the wait for the receiver's `ready`
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during file transfers
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("channel is not open")]
    ChannelNotReady,

    #[error("timed out waiting for the receiver to accept the file")]
    HandshakeTimeout,

    #[error("failed to send chunk {index}")]
    ChunkSendFailed { index: usize },

    #[error("channel closed during transfer")]
    ChannelClosed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("failed to read file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode file metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotOpen => TransferError::ChannelNotReady,
            _ => TransferError::ChannelClosed,
        }
    }
}

/// Configuration for the transfer engine
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Maximum bytes per binary chunk
    pub chunk_size: usize,
    /// Pause sending while the transport buffers more than this many bytes
    pub backpressure_threshold: u64,
    /// How often to re-check the buffered amount while paused
    pub backpressure_poll: Duration,
    /// Optional pause between consecutive chunks
    pub chunk_delay: Option<Duration>,
    /// Bound on the wait for `ready`; `None` waits indefinitely
    pub ready_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl TransferConfig {
    /// Default configuration with a different chunk size
    ///
    /// The backpressure threshold follows the chunk size.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            backpressure_threshold: BACKPRESSURE_CHUNKS * chunk_size as u64,
            backpressure_poll: DEFAULT_BACKPRESSURE_POLL,
            chunk_delay: None,
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
        }
    }
}

/// Sender-side phase of the most recent transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    AwaitingMetadataAck,
    Streaming,
    Complete,
    Failed,
}

/// Progress of an outgoing transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub sent_bytes: u64,
    pub total_bytes: u64,
    pub sent_chunks: usize,
    pub total_chunks: usize,
}

impl TransferProgress {
    fn new(total_bytes: u64, total_chunks: usize) -> Self {
        Self {
            sent_bytes: 0,
            total_bytes,
            sent_chunks: 0,
            total_chunks,
        }
    }

    /// Percentage of chunks sent; 100 for an empty file
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.sent_chunks as f64 / self.total_chunks as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.sent_chunks >= self.total_chunks
    }
}

/// A file ready to be sent
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: Arc<str>,
    pub media_type: Arc<str>,
    pub data: Bytes,
}

impl OutgoingFile {
    /// Creates a file from in-memory content
    pub fn new(name: impl Into<Arc<str>>, media_type: impl Into<Arc<str>>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Loads a file from disk, guessing its media type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let media_type = mime_guess::from_path(path).first_or_octet_stream();
        debug!(path = %path.display(), size = data.len(), %media_type, "Loaded file");
        Ok(Self::new(name, media_type.essence_str(), data))
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Metadata announced before the chunk stream
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.name.to_string(),
            size: self.size(),
            media_type: self.media_type.to_string(),
        }
    }
}

/// Number of chunks needed for `len` bytes
#[inline]
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Splits `data` into consecutive chunks of at most `chunk_size` bytes
///
/// The chunks share the buffer; nothing is copied.
pub fn plan_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let chunk_size = chunk_size.max(1);
    (0..chunk_count(data.len(), chunk_size)).map(move |index| {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(data.len());
        data.slice(start..end)
    })
}

/// Callback type for received files
pub type OnFileReceived = Arc<dyn Fn(ReceivedFile) + Send + Sync + 'static>;

/// Callback type for file announcements
pub type OnFileAnnounced = Arc<dyn Fn(FileMetadata) + Send + Sync + 'static>;

/// Callback type for connection state changes
pub type OnConnectionStateChange = Arc<dyn Fn(ConnectionState) + Send + Sync + 'static>;

/// State shared between the engine and its background tasks
struct EngineShared {
    reassembler: Mutex<Reassembler>,
    /// Set while `send_file` waits for `ready`
    awaiting_ready: AtomicBool,
    ready_tx: mpsc::UnboundedSender<()>,
    on_file_received: RwLock<Option<OnFileReceived>>,
    on_file_announced: RwLock<Option<OnFileAnnounced>>,
    on_state_change: RwLock<Option<OnConnectionStateChange>>,
}

impl EngineShared {
    fn handle_text<T: Transport>(&self, session: &TransportSession<T>, text: &str) {
        match ControlMessage::parse(text) {
            Some(ControlMessage::FileInfo(metadata)) => {
                self.reassembler.lock().begin(metadata.clone());
                if session.is_open() {
                    match ControlMessage::Ready.to_json() {
                        Ok(ready) => {
                            if let Err(e) = session.send(ChannelMessage::Text(ready)) {
                                warn!(error = %e, "Failed to acknowledge file info");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode ready message"),
                    }
                }
                let callback = self.on_file_announced.read().clone();
                if let Some(callback) = callback {
                    callback(metadata);
                }
            }
            Some(ControlMessage::Ready) => {
                if self.awaiting_ready.load(Ordering::Acquire) {
                    let _ = self.ready_tx.send(());
                } else {
                    debug!("Ignoring ready with no transfer waiting");
                }
            }
            Some(ControlMessage::Unknown) => {
                debug!(message = %text, "Ignoring unknown control message");
            }
            None => {
                warn!(len = text.len(), "Ignoring malformed control message");
            }
        }
    }

    fn handle_chunk(&self, chunk: Bytes) {
        let outcome = self.reassembler.lock().push_chunk(chunk);
        if let ChunkOutcome::Complete(file) = outcome {
            let callback = self.on_file_received.read().clone();
            match callback {
                Some(callback) => callback(file),
                None => warn!(name = %file.name, "File received with no observer registered"),
            }
        }
    }
}

/// Runs the drop protocol over one transport session
pub struct TransferEngine<T: Transport> {
    session: Arc<TransportSession<T>>,
    shared: Arc<EngineShared>,
    /// Also serializes concurrent `send_file` calls
    ready_rx: AsyncMutex<mpsc::UnboundedReceiver<()>>,
    config: TransferConfig,
    phase: RwLock<SendPhase>,
    cancel: CancellationToken,
}

impl<T: Transport> std::fmt::Debug for TransferEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("phase", &*self.phase.read())
            .field("state", &self.session.connection_state())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> TransferEngine<T> {
    /// Creates an engine with the default configuration
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: TransportSession<T>) -> Self {
        Self::with_config(session, TransferConfig::default())
    }

    /// Creates an engine with a custom configuration
    pub fn with_config(session: TransportSession<T>, config: TransferConfig) -> Self {
        let session = Arc::new(session);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(EngineShared {
            reassembler: Mutex::new(Reassembler::new()),
            awaiting_ready: AtomicBool::new(false),
            ready_tx,
            on_file_received: RwLock::new(None),
            on_file_announced: RwLock::new(None),
            on_state_change: RwLock::new(None),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(dispatch_loop(
            Arc::clone(&session),
            Arc::clone(&shared),
            cancel.clone(),
        ));
        let state = session.state();
        let initial = *state.borrow();
        tokio::spawn(watch_state(state, initial, Arc::clone(&shared)));

        info!(chunk_size = config.chunk_size, "Transfer engine started");

        Self {
            session,
            shared,
            ready_rx: AsyncMutex::new(ready_rx),
            config,
            phase: RwLock::new(SendPhase::Idle),
            cancel,
        }
    }

    /// Returns the transport session
    pub fn session(&self) -> &TransportSession<T> {
        &self.session
    }

    /// Returns the engine configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Phase of the most recent outgoing transfer
    pub fn send_phase(&self) -> SendPhase {
        *self.phase.read()
    }

    /// Returns true once the engine has been closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sets the callback invoked for every reconstructed file
    ///
    /// Replaces any previous callback. Callbacks run on the dispatch task
    /// and must not block.
    pub fn on_file_received(&self, callback: impl Fn(ReceivedFile) + Send + Sync + 'static) {
        *self.shared.on_file_received.write() = Some(Arc::new(callback));
    }

    /// Sets the callback invoked for every `file-info` the peer sends
    ///
    /// Runs after `ready` has been sent back. A zero-byte file is only
    /// ever seen here, since it never produces a file-received event.
    pub fn on_file_announced(&self, callback: impl Fn(FileMetadata) + Send + Sync + 'static) {
        *self.shared.on_file_announced.write() = Some(Arc::new(callback));
    }

    /// Sets the callback invoked when the connection state changes
    ///
    /// Replaces any previous callback.
    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) {
        *self.shared.on_state_change.write() = Some(Arc::new(callback));
    }

    /// Sends one file, reporting progress after every chunk
    ///
    /// Resolves once the last chunk has been handed to the transport.
    #[instrument(skip_all, fields(name = %file.name, size = file.size()))]
    pub async fn send_file(
        &self,
        file: OutgoingFile,
        mut on_progress: impl FnMut(TransferProgress),
    ) -> Result<TransferProgress, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !self.session.is_open() {
            return Err(TransferError::ChannelNotReady);
        }

        let mut ready_rx = self.ready_rx.lock().await;
        let result = self.run_send(&file, &mut ready_rx, &mut on_progress).await;
        self.shared.awaiting_ready.store(false, Ordering::Release);

        match &result {
            Ok(progress) => {
                self.set_phase(SendPhase::Complete);
                info!(chunks = progress.total_chunks, "File sent");
            }
            Err(e) => {
                self.set_phase(SendPhase::Failed);
                warn!(error = %e, "File transfer failed");
            }
        }
        result
    }

    async fn run_send(
        &self,
        file: &OutgoingFile,
        ready_rx: &mut mpsc::UnboundedReceiver<()>,
        on_progress: &mut impl FnMut(TransferProgress),
    ) -> Result<TransferProgress, TransferError> {
        self.set_phase(SendPhase::AwaitingMetadataAck);
        self.shared.awaiting_ready.store(true, Ordering::Release);
        // Drop readies left over from earlier transfers
        while ready_rx.try_recv().is_ok() {}

        let metadata = ControlMessage::FileInfo(file.metadata()).to_json()?;
        self.session.send(ChannelMessage::Text(metadata))?;
        debug!("Sent file info, waiting for ready");

        self.wait_ready(ready_rx).await?;
        self.shared.awaiting_ready.store(false, Ordering::Release);

        self.set_phase(SendPhase::Streaming);
        let chunk_size = self.config.chunk_size;
        let mut progress = TransferProgress::new(file.size(), chunk_count(file.data.len(), chunk_size));
        if progress.total_chunks == 0 {
            on_progress(progress);
            return Ok(progress);
        }

        for (index, chunk) in plan_chunks(&file.data, chunk_size).enumerate() {
            self.wait_for_buffer_space().await?;

            let len = chunk.len() as u64;
            self.session
                .send(ChannelMessage::Binary(chunk))
                .map_err(|e| {
                    warn!(index, error = %e, "Chunk send failed");
                    TransferError::ChunkSendFailed { index }
                })?;

            progress.sent_bytes += len;
            progress.sent_chunks += 1;
            debug!(
                index,
                sent = progress.sent_bytes,
                total = progress.total_bytes,
                "Sent chunk"
            );
            on_progress(progress);

            if let Some(delay) = self.config.chunk_delay {
                if !progress.is_complete() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(progress)
    }

    async fn wait_ready(
        &self,
        ready_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<(), TransferError> {
        let wait = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
                _ = self.session.closed() => Err(TransferError::ChannelClosed),
                ready = ready_rx.recv() => ready.ok_or(TransferError::ChannelClosed),
            }
        };

        match self.config.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TransferError::HandshakeTimeout)?,
            None => wait.await,
        }
    }

    /// Waits until the transport has room for another chunk
    async fn wait_for_buffer_space(&self) -> Result<(), TransferError> {
        while self.session.buffered_amount() > self.config.backpressure_threshold {
            if self.session.connection_state().is_closed() {
                return Err(TransferError::ChannelClosed);
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.config.backpressure_poll) => {}
            }
        }
        if self.session.connection_state().is_closed() {
            return Err(TransferError::ChannelClosed);
        }
        Ok(())
    }

    fn set_phase(&self, phase: SendPhase) {
        *self.phase.write() = phase;
    }

    /// Stops background tasks, cancels any pending send and closes the
    /// transport
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Closing transfer engine");
        self.cancel.cancel();
        self.session.close();
        self.shared.reassembler.lock().reset();
    }
}

impl<T: Transport> Drop for TransferEngine<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch_loop<T: Transport>(
    session: Arc<TransportSession<T>>,
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = session.recv() => message,
        };
        match message {
            Some(ChannelMessage::Text(text)) => shared.handle_text(&session, &text),
            Some(ChannelMessage::Binary(chunk)) => shared.handle_chunk(chunk),
            None => {
                // Everything queued before the close has been handled
                let mut reassembler = shared.reassembler.lock();
                if reassembler.metadata().is_some_and(|m| m.size > 0) {
                    warn!(
                        received = reassembler.received_bytes(),
                        "Channel closed before the file completed"
                    );
                }
                reassembler.reset();
                debug!("Channel closed, stopping dispatch");
                break;
            }
        }
    }
}

async fn watch_state(
    mut state: watch::Receiver<ConnectionState>,
    mut last: ConnectionState,
    shared: Arc<EngineShared>,
) {
    loop {
        let current = *state.borrow_and_update();
        if current != last {
            last = current;
            info!(state = %current, "Connection state changed");
            let callback = shared.on_state_change.read().clone();
            if let Some(callback) = callback {
                callback(current);
            }
        }
        if current.is_closed() || state.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::loopback::{LoopbackHub, LoopbackTransport};
    use std::sync::atomic::AtomicUsize;

    async fn open_pair() -> (LoopbackTransport, LoopbackTransport) {
        let hub = LoopbackHub::new();
        let host = hub.transport();
        let joiner = hub.transport();
        let offer = host.create_local_offer().await.unwrap();
        let answer = joiner.accept_remote_offer(&offer).await.unwrap();
        host.accept_remote_answer(&answer).await.unwrap();
        (host, joiner)
    }

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn collect_files<T: Transport>(
        engine: &TransferEngine<T>,
    ) -> mpsc::UnboundedReceiver<ReceivedFile> {
        let (tx, rx) = mpsc::unbounded_channel();
        engine.on_file_received(move |file| {
            let _ = tx.send(file);
        });
        rx
    }

    /// Loopback transport that fails one binary send
    struct FlakyTransport {
        inner: LoopbackTransport,
        fail_at: usize,
        binaries: AtomicUsize,
    }

    impl Transport for FlakyTransport {
        async fn create_local_offer(&self) -> Result<String, TransportError> {
            self.inner.create_local_offer().await
        }

        async fn accept_remote_offer(&self, offer: &str) -> Result<String, TransportError> {
            self.inner.accept_remote_offer(offer).await
        }

        async fn accept_remote_answer(&self, answer: &str) -> Result<(), TransportError> {
            self.inner.accept_remote_answer(answer).await
        }

        fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
            if matches!(message, ChannelMessage::Binary(_))
                && self.binaries.fetch_add(1, Ordering::SeqCst) == self.fail_at
            {
                return Err(TransportError::Closed);
            }
            self.inner.send(message)
        }

        async fn recv(&self) -> Option<ChannelMessage> {
            self.inner.recv().await
        }

        fn state(&self) -> watch::Receiver<ConnectionState> {
            self.inner.state()
        }

        fn buffered_amount(&self) -> u64 {
            self.inner.buffered_amount()
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[test]
    fn test_chunk_planning() {
        assert_eq!(chunk_count(0, 16_384), 0);
        assert_eq!(chunk_count(1, 16_384), 1);
        assert_eq!(chunk_count(16_384, 16_384), 1);
        assert_eq!(chunk_count(16_385, 16_384), 2);

        let data = Bytes::from(sample_data(50_000));
        let sizes: Vec<usize> = plan_chunks(&data, 16_384).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![16_384, 16_384, 16_384, 848]);

        for (len, chunk_size) in [(0, 1), (1, 1), (7, 3), (9, 3), (100, 7)] {
            let data = Bytes::from(sample_data(len));
            let chunks: Vec<Bytes> = plan_chunks(&data, chunk_size).collect();
            assert_eq!(chunks.len(), chunk_count(len, chunk_size));
            assert_eq!(chunks.concat(), data.to_vec());
        }
    }

    #[test]
    fn test_progress_percent() {
        let mut progress = TransferProgress::new(50_000, 4);
        assert_eq!(progress.percent(), 0.0);
        progress.sent_chunks = 3;
        assert_eq!(progress.percent(), 75.0);
        assert!(!progress.is_complete());
        progress.sent_chunks = 4;
        assert_eq!(progress.percent(), 100.0);
        assert!(progress.is_complete());

        assert_eq!(TransferProgress::new(0, 0).percent(), 100.0);
    }

    #[test]
    fn test_config_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 16_384);
        assert_eq!(config.backpressure_threshold, 163_840);
        assert_eq!(config.backpressure_poll, Duration::from_millis(10));
        assert_eq!(config.chunk_delay, None);
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(30)));

        let config = TransferConfig::with_chunk_size(0);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.backpressure_threshold, 10);
    }

    #[tokio::test]
    async fn test_outgoing_file_from_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.png");
        tokio::fs::write(&path, b"not really a png").await.unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        assert_eq!(file.name.as_ref(), "photo.png");
        assert_eq!(file.media_type.as_ref(), "image/png");
        assert_eq!(file.size(), 16);

        let missing = OutgoingFile::from_path(temp_dir.path().join("missing")).await;
        assert!(matches!(missing, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn test_send_file_end_to_end() {
        let (host, joiner) = open_pair().await;
        let sender = TransferEngine::new(TransportSession::new(host));
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);

        let data = sample_data(50_000);
        let mut percents = Vec::new();
        let progress = sender
            .send_file(
                OutgoingFile::new("report.pdf", "application/pdf", data.clone()),
                |p| percents.push(p.percent()),
            )
            .await
            .unwrap();

        assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);
        assert_eq!(progress.sent_bytes, 50_000);
        assert_eq!(progress.total_chunks, 4);
        assert_eq!(sender.send_phase(), SendPhase::Complete);

        let file = files.recv().await.unwrap();
        assert_eq!(file.name.as_ref(), "report.pdf");
        assert_eq!(file.media_type.as_ref(), "application/pdf");
        assert_eq!(&file.data[..], &data[..]);
        assert!(files.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_file_on_same_session() {
        let (host, joiner) = open_pair().await;
        let sender = TransferEngine::with_config(
            TransportSession::new(host),
            TransferConfig::with_chunk_size(1000),
        );
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);

        for (name, len) in [("one.txt", 4_500), ("two.txt", 4_500)] {
            sender
                .send_file(OutgoingFile::new(name, "text/plain", sample_data(len)), |_| {})
                .await
                .unwrap();
            let file = files.recv().await.unwrap();
            assert_eq!(file.name.as_ref(), name);
            assert_eq!(file.size(), len as u64);
        }
    }

    #[tokio::test]
    async fn test_empty_file_reports_complete_once() {
        let (host, joiner) = open_pair().await;
        let sender = TransferEngine::new(TransportSession::new(host));
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);

        let mut reports = Vec::new();
        sender
            .send_file(OutgoingFile::new("empty", "text/plain", Vec::new()), |p| {
                reports.push(p.percent())
            })
            .await
            .unwrap();
        assert_eq!(reports, vec![100.0]);

        // A non-empty file afterwards still arrives on its own
        sender
            .send_file(OutgoingFile::new("after", "text/plain", vec![7u8; 10]), |_| {})
            .await
            .unwrap();
        let file = files.recv().await.unwrap();
        assert_eq!(file.name.as_ref(), "after");
        assert!(files.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_file_survives_sender_close() {
        let (host, joiner) = open_pair().await;
        let config = TransferConfig {
            backpressure_threshold: u64::MAX,
            ..TransferConfig::with_chunk_size(100)
        };
        let sender = TransferEngine::with_config(TransportSession::new(host), config);
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);

        // Nearly every chunk is still queued when the sender hangs up
        let data = sample_data(50_000);
        sender
            .send_file(
                OutgoingFile::new("late.bin", "application/octet-stream", data.clone()),
                |_| {},
            )
            .await
            .unwrap();
        sender.close();

        let file = tokio::time::timeout(Duration::from_secs(5), files.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.name.as_ref(), "late.bin");
        assert_eq!(&file.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_announcement_reaches_observer() {
        let (host, joiner) = open_pair().await;
        let sender = TransferEngine::new(TransportSession::new(host));
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);
        let (tx, mut announced) = mpsc::unbounded_channel();
        receiver.on_file_announced(move |metadata| {
            let _ = tx.send(metadata);
        });

        sender
            .send_file(OutgoingFile::new("empty.txt", "text/plain", Vec::new()), |_| {})
            .await
            .unwrap();
        let metadata = announced.recv().await.unwrap();
        assert_eq!(metadata.name, "empty.txt");
        assert_eq!(metadata.size, 0);
        assert_eq!(metadata.media_type, "text/plain");
        assert!(files.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let hub = LoopbackHub::new();
        let engine = TransferEngine::new(TransportSession::new(hub.transport()));

        let result = engine
            .send_file(OutgoingFile::new("a", "text/plain", vec![1u8]), |_| {})
            .await;
        assert!(matches!(result, Err(TransferError::ChannelNotReady)));
        assert_eq!(engine.send_phase(), SendPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ready_times_out() {
        let (host, _joiner) = open_pair().await;
        let engine = TransferEngine::new(TransportSession::new(host));

        let result = engine
            .send_file(OutgoingFile::new("a", "text/plain", vec![1u8; 10]), |_| {})
            .await;
        assert!(matches!(result, Err(TransferError::HandshakeTimeout)));
        assert_eq!(engine.send_phase(), SendPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ready_is_not_reused() {
        let (host, joiner) = open_pair().await;
        let engine = TransferEngine::new(TransportSession::new(host));

        joiner
            .send(ChannelMessage::Text(ControlMessage::Ready.to_json().unwrap()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut sent = 0;
        let result = engine
            .send_file(OutgoingFile::new("a", "text/plain", vec![1u8; 10]), |_| sent += 1)
            .await;
        assert!(matches!(result, Err(TransferError::HandshakeTimeout)));
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_close_cancels_ready_wait() {
        let (host, _joiner) = open_pair().await;
        let engine = Arc::new(TransferEngine::new(TransportSession::new(host)));

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .send_file(OutgoingFile::new("a", "text/plain", vec![1u8; 10]), |_| {})
                    .await
            }
        });
        while engine.send_phase() != SendPhase::AwaitingMetadataAck {
            tokio::task::yield_now().await;
        }

        engine.close();
        assert!(matches!(task.await.unwrap(), Err(TransferError::Cancelled)));
        assert!(engine.is_closed());
        assert_eq!(
            engine.session().connection_state(),
            ConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn test_backpressure_bounds_buffered_bytes() {
        let (host, joiner) = open_pair().await;
        let config = TransferConfig {
            backpressure_poll: Duration::from_millis(1),
            ..TransferConfig::with_chunk_size(100)
        };
        let threshold = config.backpressure_threshold;
        let engine = TransferEngine::with_config(TransportSession::new(host), config);

        // A slow reader that answers ready and then drains one chunk at a time
        let reader = tokio::spawn(async move {
            let mut received = 0usize;
            while let Some(message) = joiner.recv().await {
                match message {
                    ChannelMessage::Text(_) => joiner
                        .send(ChannelMessage::Text(ControlMessage::Ready.to_json().unwrap()))
                        .unwrap(),
                    ChannelMessage::Binary(chunk) => {
                        received += chunk.len();
                        if received == 5_000 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
            received
        });

        let mut max_buffered = 0;
        let session = Arc::clone(&engine.session);
        engine
            .send_file(OutgoingFile::new("a", "text/plain", sample_data(5_000)), |_| {
                max_buffered = max_buffered.max(session.buffered_amount());
            })
            .await
            .unwrap();

        assert!(max_buffered <= threshold + 100, "buffered {max_buffered}");
        assert_eq!(reader.await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn test_chunk_send_failure_reports_index() {
        let hub = LoopbackHub::new();
        let host = FlakyTransport {
            inner: hub.transport(),
            fail_at: 2,
            binaries: AtomicUsize::new(0),
        };
        let joiner = hub.transport();
        let offer = host.create_local_offer().await.unwrap();
        let answer = joiner.accept_remote_offer(&offer).await.unwrap();
        host.accept_remote_answer(&answer).await.unwrap();

        let sender = TransferEngine::with_config(
            TransportSession::new(host),
            TransferConfig::with_chunk_size(10),
        );
        let _receiver = TransferEngine::new(TransportSession::new(joiner));

        let mut reported = 0;
        let result = sender
            .send_file(OutgoingFile::new("a", "text/plain", vec![0u8; 50]), |_| reported += 1)
            .await;
        assert!(matches!(result, Err(TransferError::ChunkSendFailed { index: 2 })));
        assert_eq!(reported, 2);
        assert_eq!(sender.send_phase(), SendPhase::Failed);
    }

    #[tokio::test]
    async fn test_receiver_ignores_noise() {
        let (host, joiner) = open_pair().await;
        let receiver = TransferEngine::new(TransportSession::new(joiner));
        let mut files = collect_files(&receiver);

        // Binary data with no file announced, then junk text
        host.send(ChannelMessage::Binary(Bytes::from_static(b"stray")))
            .unwrap();
        host.send(ChannelMessage::Text(r#"{"type":"cancel"}"#.into()))
            .unwrap();
        host.send(ChannelMessage::Text("{not json".into())).unwrap();

        let info = ControlMessage::FileInfo(FileMetadata {
            name: "b.bin".into(),
            size: 6,
            media_type: "application/octet-stream".into(),
        });
        host.send(ChannelMessage::Text(info.to_json().unwrap()))
            .unwrap();

        // The receiver acknowledges the metadata
        match host.recv().await {
            Some(ChannelMessage::Text(text)) => {
                assert_eq!(ControlMessage::parse(&text), Some(ControlMessage::Ready))
            }
            other => panic!("unexpected message {other:?}"),
        }

        host.send(ChannelMessage::Binary(Bytes::from_static(b"abc")))
            .unwrap();
        host.send(ChannelMessage::Binary(Bytes::from_static(b"def")))
            .unwrap();

        let file = files.recv().await.unwrap();
        assert_eq!(&file.data[..], b"abcdef");
        assert_eq!(file.name.as_ref(), "b.bin");
    }

    #[tokio::test]
    async fn test_state_change_callback_sees_close() {
        let (host, joiner) = open_pair().await;
        let engine = TransferEngine::new(TransportSession::new(host));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_connection_state_change(move |state| {
            let _ = tx.send(state);
        });

        joiner.close();
        assert_eq!(rx.recv().await, Some(ConnectionState::Closed));

        let result = engine
            .send_file(OutgoingFile::new("a", "text/plain", vec![1u8]), |_| {})
            .await;
        assert!(matches!(result, Err(TransferError::ChannelNotReady)));
    }
}
