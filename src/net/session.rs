//! Transport primitive seam and the session wrapper around it
//!
//! The drop protocol never looks inside the point-to-point transport. It
//! only needs something that can produce and accept negotiation
//! descriptors, and that exposes an ordered, message-oriented channel once
//! negotiation completes. That contract is the [`Transport`] trait;
//! [`TransportSession`] wraps one transport for the lifetime of a single
//! drop session.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Errors reported by a transport primitive
#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel has not finished negotiating
    #[error("channel is not open")]
    NotOpen,

    /// The channel was closed by either side
    #[error("channel closed")]
    Closed,

    /// A negotiation descriptor could not be decoded
    #[error("invalid negotiation descriptor: {0}")]
    InvalidDescriptor(Arc<str>),

    /// Negotiation could not be completed
    #[error("negotiation failed: {0}")]
    Negotiation(Arc<str>),

    /// The underlying socket failed
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Creates an invalid descriptor error
    pub(crate) fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(Arc::from(msg.into()))
    }

    /// Creates a negotiation error
    pub(crate) fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(Arc::from(msg.into()))
    }
}

/// Lifecycle of a transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Descriptors are still being exchanged
    #[default]
    Negotiating,
    /// The channel is usable in both directions
    Open,
    /// The channel is gone; terminal
    Closed,
}

impl ConnectionState {
    /// Returns true for the terminal state
    #[inline]
    pub const fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        })
    }
}

/// One message on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// A structured, human-readable control record
    Text(String),
    /// Raw bytes with no envelope
    Binary(Bytes),
}

impl ChannelMessage {
    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns true if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An opaque point-to-point transport
///
/// Implementations must deliver messages in the order they were sent.
pub trait Transport: Send + Sync + 'static {
    /// Produces the local offer descriptor (host side)
    fn create_local_offer(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Applies the remote offer and produces the local answer (joiner side)
    fn accept_remote_offer(
        &self,
        offer: &str,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Applies the remote answer, finalizing negotiation (host side)
    fn accept_remote_answer(
        &self,
        answer: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Queues a message for delivery
    fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;

    /// Waits for the next incoming message; `None` once the channel closes
    fn recv(&self) -> impl Future<Output = Option<ChannelMessage>> + Send;

    /// Subscribes to connection state changes
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Bytes sent but not yet taken off the wire by the peer
    fn buffered_amount(&self) -> u64;

    /// Closes the channel; idempotent
    fn close(&self);
}

/// Creates fresh transports for each negotiation attempt
pub trait TransportFactory: Send + Sync {
    /// The transport type produced
    type Transport: Transport;

    /// Creates a transport in the negotiating state
    fn create(&self) -> Self::Transport;
}

/// A negotiated, possibly not yet open, channel
///
/// A session is owned by exactly one transfer engine and never shared
/// across drop sessions.
#[derive(Debug)]
pub struct TransportSession<T> {
    transport: T,
}

impl<T: Transport> TransportSession<T> {
    /// Wraps a transport that is still negotiating
    pub fn new(transport: T) -> Self {
        debug!("Created transport session");
        Self { transport }
    }

    /// Returns the wrapped transport
    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.transport.state().borrow()
    }

    /// Subscribes to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state()
    }

    /// Returns true if the channel is open
    #[inline]
    pub fn is_open(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Waits until the channel leaves the negotiating state
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the channel closes instead of
    /// opening.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Negotiating)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);
        if reached == ConnectionState::Open {
            info!("Transport session open");
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Waits until the channel is closed
    pub async fn closed(&self) {
        let mut state = self.transport.state();
        let _ = state.wait_for(|s| s.is_closed()).await;
    }

    /// Sends a message over the channel
    #[inline]
    pub fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        self.transport.send(message)
    }

    /// Waits for the next incoming message
    #[inline]
    pub async fn recv(&self) -> Option<ChannelMessage> {
        self.transport.recv().await
    }

    /// Bytes queued on the channel and not yet consumed by the peer
    #[inline]
    pub fn buffered_amount(&self) -> u64 {
        self.transport.buffered_amount()
    }

    /// Closes the channel
    pub fn close(&self) {
        debug!("Closing transport session");
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_message_len() {
        assert_eq!(ChannelMessage::Text("ready".into()).len(), 5);
        assert_eq!(
            ChannelMessage::Binary(Bytes::from_static(&[1, 2, 3])).len(),
            3
        );
        assert!(ChannelMessage::Binary(Bytes::new()).is_empty());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Negotiating);
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert!(ConnectionState::Closed.is_closed());
        assert!(!ConnectionState::Open.is_closed());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::invalid_descriptor("bad json");
        assert!(err.to_string().contains("bad json"));

        let err = TransportError::negotiation("unknown offer");
        assert!(err.to_string().contains("negotiation failed"));

        assert_eq!(TransportError::NotOpen.to_string(), "channel is not open");
    }
}
