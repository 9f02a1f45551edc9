//! Descriptor exchange through a signaling store
//!
//! The host creates a transport, publishes its offer under a fresh
//! [`SessionCode`] and polls for the joiner's answer. The joiner reads the
//! offer by code, publishes its answer and waits for the channel to open.
//!
//! ```text
//! host                        store                        joiner
//!  | create_connection()        |                              |
//!  |-- put p2p_offer_CODE ----->|                              |
//!  |                            |<---- get p2p_offer_CODE -----| join_connection(CODE)
//!  |                            |<---- put p2p_answer_CODE ----|
//!  | complete_connection()      |                              |
//!  |-- get p2p_answer_CODE ---->|  (every poll_interval)       |
//!  |== accept answer: channel open ===========================|
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pairing::SessionCode;
use super::session::{Transport, TransportError, TransportFactory, TransportSession};
use super::signaling::{
    DEFAULT_NAMESPACE, SignalKind, SignalRecord, SignalingError, SignalingStore, signal_key,
};

/// Default interval between answer polls
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on the host's wait for an answer
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that can occur while negotiating a connection
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// No offer is published under the code, or the code is malformed
    #[error("invalid session code: {0}")]
    InvalidCode(Arc<str>),

    /// A store entry exists but is not the expected record
    #[error("malformed signal: {0}")]
    MalformedSignal(Arc<str>),

    /// The joiner did not answer in time
    #[error("no answer received within {0:?}")]
    NegotiationTimeout(Duration),

    /// Polling was stopped by `teardown`
    #[error("negotiation cancelled")]
    Cancelled,

    /// `complete_connection` was called without a pending offer
    #[error("no pending connection to complete")]
    NoPendingConnection,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl NegotiationError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedSignal(Arc::from(msg.into()))
    }
}

/// Configuration for the negotiator
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// How often the host checks for an answer
    pub poll_interval: Duration,
    /// How long the host waits for an answer
    pub timeout: Duration,
    /// Prefix of every store key
    pub namespace: String,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Drives offer/answer exchange for either role
///
/// One negotiator handles one session at a time. Calling
/// [`create_connection`](Self::create_connection) again discards the
/// previous pending offer.
pub struct ConnectionNegotiator<S, F: TransportFactory> {
    store: S,
    factory: F,
    config: NegotiatorConfig,
    /// Host transport waiting for an answer
    pending: Mutex<Option<TransportSession<F::Transport>>>,
    /// Code of the last session this negotiator touched
    active_code: Mutex<Option<SessionCode>>,
    /// Cancels the running answer poll
    poll_cancel: Mutex<Option<CancellationToken>>,
}

impl<S, F: TransportFactory> std::fmt::Debug for ConnectionNegotiator<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionNegotiator")
            .field("config", &self.config)
            .field("active_code", &*self.active_code.lock())
            .field("pending", &self.pending.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl<S: SignalingStore, F: TransportFactory> ConnectionNegotiator<S, F> {
    /// Creates a negotiator with the default configuration
    pub fn new(store: S, factory: F) -> Self {
        Self::with_config(store, factory, NegotiatorConfig::default())
    }

    /// Creates a negotiator with a custom configuration
    pub fn with_config(store: S, factory: F, config: NegotiatorConfig) -> Self {
        Self {
            store,
            factory,
            config,
            pending: Mutex::new(None),
            active_code: Mutex::new(None),
            poll_cancel: Mutex::new(None),
        }
    }

    /// Returns the signaling store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the negotiator configuration
    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Code of the session currently being negotiated, if any
    pub fn active_code(&self) -> Option<SessionCode> {
        self.active_code.lock().clone()
    }

    fn key(&self, kind: SignalKind, code: &SessionCode) -> String {
        signal_key(&self.config.namespace, kind, code)
    }

    /// Publishes a fresh offer and returns the code to share with the joiner
    ///
    /// Returns immediately; call
    /// [`complete_connection`](Self::complete_connection) to wait for the
    /// answer.
    #[instrument(skip(self), fields(code = tracing::field::Empty))]
    pub async fn create_connection(&self) -> Result<SessionCode, NegotiationError> {
        self.discard_pending().await;

        let transport = self.factory.create();
        let code = SessionCode::generate();
        tracing::Span::current().record("code", code.as_str());

        if let Err(e) = self.publish_offer(&transport, &code).await {
            transport.close();
            return Err(e);
        }

        *self.pending.lock() = Some(TransportSession::new(transport));
        *self.active_code.lock() = Some(code.clone());
        info!("Published offer");
        Ok(code)
    }

    async fn publish_offer(
        &self,
        transport: &F::Transport,
        code: &SessionCode,
    ) -> Result<(), NegotiationError> {
        let offer = transport.create_local_offer().await?;
        // A leftover answer from an earlier session with the same code
        // would complete this one
        self.store.delete(&self.key(SignalKind::Answer, code)).await?;
        let record = SignalRecord::new(SignalKind::Offer, offer);
        self.store
            .put(&self.key(SignalKind::Offer, code), record.to_json())
            .await?;
        Ok(())
    }

    /// Waits for the joiner's answer and finalizes the pending offer
    ///
    /// Polls every `poll_interval` until `timeout`. On failure the pending
    /// transport is closed and the store entries are removed.
    ///
    /// # Errors
    ///
    /// - [`NegotiationError::NoPendingConnection`] without a prior
    ///   `create_connection`
    /// - [`NegotiationError::NegotiationTimeout`] if no answer arrives
    /// - [`NegotiationError::Cancelled`] if `teardown` runs meanwhile
    /// - [`NegotiationError::MalformedSignal`] for an unusable answer entry
    #[instrument(skip(self), fields(code = tracing::field::Empty))]
    pub async fn complete_connection(
        &self,
    ) -> Result<TransportSession<F::Transport>, NegotiationError> {
        let code = self.active_code();
        let code = match code {
            Some(code) if self.pending.lock().is_some() => code,
            _ => return Err(NegotiationError::NoPendingConnection),
        };
        tracing::Span::current().record("code", code.as_str());

        let token = CancellationToken::new();
        let previous = self.poll_cancel.lock().replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        // The token stays installed until the answer is applied
        let result = match self.poll_answer(&code, &token).await {
            Ok(answer) => self.finish(&answer, &token).await,
            Err(e) => Err(e),
        };
        let cancelled = {
            let mut poll_cancel = self.poll_cancel.lock();
            poll_cancel.take();
            token.is_cancelled()
        };

        match result {
            Ok(session) if cancelled => {
                debug!("Torn down while the answer was applied");
                session.close();
                Err(NegotiationError::Cancelled)
            }
            Ok(session) => {
                info!("Negotiation complete");
                Ok(session)
            }
            // teardown owns the cleanup
            Err(NegotiationError::Cancelled) => Err(NegotiationError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Negotiation failed");
                let pending = self.pending.lock().take();
                if let Some(session) = pending {
                    session.close();
                }
                self.invalidate(&code).await;
                Err(e)
            }
        }
    }

    async fn poll_answer(
        &self,
        code: &SessionCode,
        token: &CancellationToken,
    ) -> Result<String, NegotiationError> {
        let key = self.key(SignalKind::Answer, code);
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(NegotiationError::Cancelled),
                _ = &mut deadline => {
                    return Err(NegotiationError::NegotiationTimeout(self.config.timeout));
                }
                _ = ticker.tick() => {
                    let Some(value) = self.store.get(&key).await? else {
                        debug!("No answer yet");
                        continue;
                    };
                    return match SignalRecord::from_json(&value) {
                        Some(record) if record.kind == SignalKind::Answer => Ok(record.data),
                        Some(record) => Err(NegotiationError::malformed(format!(
                            "expected an answer, found {}",
                            record.kind
                        ))),
                        None => Err(NegotiationError::malformed("answer entry is not a signal record")),
                    };
                }
            }
        }
    }

    async fn finish(
        &self,
        answer: &str,
        token: &CancellationToken,
    ) -> Result<TransportSession<F::Transport>, NegotiationError> {
        let session = self
            .pending
            .lock()
            .take()
            .ok_or(NegotiationError::Cancelled)?;
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            accepted = session.transport().accept_remote_answer(answer) => Some(accepted),
        };
        match accepted {
            Some(Ok(())) => Ok(session),
            Some(Err(e)) => {
                // Put it back so the failure path closes it
                *self.pending.lock() = Some(session);
                Err(e.into())
            }
            None => {
                debug!("Cancelled while applying the answer");
                session.close();
                Err(NegotiationError::Cancelled)
            }
        }
    }

    /// Reads the host's offer for `code` and publishes an answer
    ///
    /// The returned session is still negotiating; it opens once the host
    /// applies the answer. On failure the transport is closed and no
    /// session is returned.
    #[instrument(skip(self))]
    pub async fn join_connection(
        &self,
        code: &str,
    ) -> Result<TransportSession<F::Transport>, NegotiationError> {
        let code = SessionCode::parse(code).map_err(|e| {
            debug!(error = %e, "Rejected session code");
            NegotiationError::InvalidCode(Arc::from(code))
        })?;

        let transport = self.factory.create();
        if let Err(e) = self.answer_offer(&transport, &code).await {
            warn!(error = %e, "Join failed");
            transport.close();
            return Err(e);
        }

        *self.active_code.lock() = Some(code);
        info!("Published answer");
        Ok(TransportSession::new(transport))
    }

    async fn answer_offer(
        &self,
        transport: &F::Transport,
        code: &SessionCode,
    ) -> Result<(), NegotiationError> {
        let value = self
            .store
            .get(&self.key(SignalKind::Offer, code))
            .await?
            .ok_or_else(|| NegotiationError::InvalidCode(Arc::from(code.as_str())))?;
        let record = SignalRecord::from_json(&value)
            .ok_or_else(|| NegotiationError::malformed("offer entry is not a signal record"))?;
        if record.kind != SignalKind::Offer {
            return Err(NegotiationError::malformed(format!(
                "expected an offer, found {}",
                record.kind
            )));
        }

        let answer = transport.accept_remote_offer(&record.data).await?;
        let record = SignalRecord::new(SignalKind::Answer, answer);
        self.store
            .put(&self.key(SignalKind::Answer, code), record.to_json())
            .await?;
        Ok(())
    }

    /// Stops polling or applying an answer, closes any pending transport and removes both store
    /// entries of the last code used
    ///
    /// Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn teardown(&self) {
        {
            // Cancel under the lock so a finishing complete_connection
            // observes it
            let mut poll_cancel = self.poll_cancel.lock();
            if let Some(token) = poll_cancel.take() {
                debug!("Cancelling answer poll");
                token.cancel();
            }
        }
        let pending = self.pending.lock().take();
        if let Some(session) = pending {
            session.close();
        }
        let code = self.active_code.lock().take();
        if let Some(code) = code {
            self.invalidate(&code).await;
            info!(code = %code, "Session torn down");
        }
    }

    /// Closes a previous pending offer before starting a new one
    async fn discard_pending(&self) {
        let pending = self.pending.lock().take();
        if let Some(session) = pending {
            debug!("Discarding previous pending offer");
            session.close();
            let code = self.active_code.lock().take();
            if let Some(code) = code {
                self.invalidate(&code).await;
            }
        }
    }

    async fn invalidate(&self, code: &SessionCode) {
        for kind in [SignalKind::Offer, SignalKind::Answer] {
            let key = self.key(kind, code);
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to remove signal");
            }
        }
    }
}
