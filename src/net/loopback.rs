//! In-process transport primitive
//!
//! A [`LoopbackHub`] pairs transports living in the same process. Offer and
//! answer descriptors are small JSON tokens that identify the two ends in
//! the hub; accepting the answer wires the ends together and opens both.
//! Messages travel over unbounded channels, and the bytes sitting in the
//! peer's inbox are reported as the sender's buffered amount, so
//! backpressure behaves the way it does on a real data channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, info};

use super::session::{ChannelMessage, ConnectionState, Transport, TransportError, TransportFactory};

/// One side of a loopback link
struct LinkEnd {
    /// Delivers into this end's inbox
    inbox_tx: mpsc::UnboundedSender<ChannelMessage>,
    /// Bytes sitting in this end's inbox
    inbox_bytes: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// The other end, once linked
    peer: RwLock<Option<Arc<LinkEnd>>>,
}

impl std::fmt::Debug for LinkEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The peer points back at us; printing it would recurse
        f.debug_struct("LinkEnd")
            .field("inbox_bytes", &self.inbox_bytes)
            .field("state", &*self.state.borrow())
            .field("linked", &self.peer.read().is_some())
            .finish()
    }
}

impl LinkEnd {
    fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

#[derive(Debug, Default)]
struct HubInner {
    /// Host ends waiting for an answer, keyed by offer token
    offers: DashMap<String, Arc<LinkEnd>>,
    /// Joiner ends waiting for the host, keyed by answer token
    answers: DashMap<String, Arc<LinkEnd>>,
}

/// Rendezvous point for loopback transports
///
/// Clones share the same hub.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    /// Creates an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this hub
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport::new(self.clone())
    }

    /// Number of offers and answers still waiting to be linked
    pub fn pending(&self) -> usize {
        self.inner.offers.len() + self.inner.answers.len()
    }
}

impl TransportFactory for LoopbackHub {
    type Transport = LoopbackTransport;

    fn create(&self) -> LoopbackTransport {
        self.transport()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackDescriptor {
    offer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
}

impl LoopbackDescriptor {
    fn parse(s: &str) -> Result<Self, TransportError> {
        serde_json::from_str(s).map_err(|e| TransportError::invalid_descriptor(e.to_string()))
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn new_token() -> String {
    let bytes: [u8; 8] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A transport whose peer lives in the same process
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    end: Arc<LinkEnd>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    /// Offer token (host) or answer token (joiner) registered in the hub
    token: Mutex<Option<String>>,
}

impl LoopbackTransport {
    /// Creates a negotiating transport attached to `hub`
    pub fn new(hub: LoopbackHub) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Negotiating);
        Self {
            hub,
            end: Arc::new(LinkEnd {
                inbox_tx,
                inbox_bytes: AtomicU64::new(0),
                state,
                peer: RwLock::new(None),
            }),
            inbox_rx: AsyncMutex::new(inbox_rx),
            token: Mutex::new(None),
        }
    }
}

impl Transport for LoopbackTransport {
    async fn create_local_offer(&self) -> Result<String, TransportError> {
        let offer = new_token();
        self.hub
            .inner
            .offers
            .insert(offer.clone(), Arc::clone(&self.end));
        *self.token.lock() = Some(offer.clone());
        debug!(offer = %offer, "Registered loopback offer");
        Ok(LoopbackDescriptor {
            offer,
            answer: None,
        }
        .encode())
    }

    async fn accept_remote_offer(&self, offer: &str) -> Result<String, TransportError> {
        let descriptor = LoopbackDescriptor::parse(offer)?;
        if !self.hub.inner.offers.contains_key(&descriptor.offer) {
            return Err(TransportError::negotiation("offer is not registered with the hub"));
        }
        let answer = new_token();
        self.hub
            .inner
            .answers
            .insert(answer.clone(), Arc::clone(&self.end));
        *self.token.lock() = Some(answer.clone());
        debug!(offer = %descriptor.offer, answer = %answer, "Answered loopback offer");
        Ok(LoopbackDescriptor {
            offer: descriptor.offer,
            answer: Some(answer),
        }
        .encode())
    }

    async fn accept_remote_answer(&self, answer: &str) -> Result<(), TransportError> {
        let descriptor = LoopbackDescriptor::parse(answer)?;
        let answer_token = descriptor
            .answer
            .ok_or_else(|| TransportError::invalid_descriptor("descriptor carries no answer"))?;
        if self.token.lock().as_deref() != Some(descriptor.offer.as_str()) {
            return Err(TransportError::negotiation("answer is for a different offer"));
        }
        let (_, joiner) = self
            .hub
            .inner
            .answers
            .remove(&answer_token)
            .ok_or_else(|| TransportError::negotiation("answering transport is gone"))?;
        self.hub.inner.offers.remove(&descriptor.offer);
        self.token.lock().take();

        if joiner.state.borrow().is_closed() {
            return Err(TransportError::Closed);
        }

        *self.end.peer.write() = Some(Arc::clone(&joiner));
        *joiner.peer.write() = Some(Arc::clone(&self.end));
        self.end.state.send_replace(ConnectionState::Open);
        joiner.state.send_replace(ConnectionState::Open);
        info!(offer = %descriptor.offer, "Loopback link open");
        Ok(())
    }

    fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        match *self.end.state.borrow() {
            ConnectionState::Negotiating => return Err(TransportError::NotOpen),
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Open => {}
        }
        let peer = self.end.peer.read().clone().ok_or(TransportError::Closed)?;
        let len = message.len() as u64;
        peer.inbox_bytes.fetch_add(len, Ordering::AcqRel);
        if peer.inbox_tx.send(message).is_err() {
            peer.inbox_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let mut inbox = self.inbox_rx.lock().await;
        let mut state = self.end.state.subscribe();
        tokio::select! {
            biased;

            message = inbox.recv() => {
                let message = message?;
                self.end
                    .inbox_bytes
                    .fetch_sub(message.len() as u64, Ordering::AcqRel);
                Some(message)
            }
            _ = state.wait_for(|s| s.is_closed()) => None,
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.end.state.subscribe()
    }

    fn buffered_amount(&self) -> u64 {
        self.end
            .peer
            .read()
            .as_ref()
            .map(|peer| peer.inbox_bytes.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn close(&self) {
        if let Some(token) = self.token.lock().take() {
            self.hub.inner.offers.remove(&token);
            self.hub.inner.answers.remove(&token);
        }
        self.end.mark_closed();
        // Break the reference cycle between the two ends
        let peer = self.end.peer.write().take();
        if let Some(peer) = peer {
            peer.peer.write().take();
            peer.mark_closed();
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn linked_pair(hub: &LoopbackHub) -> (LoopbackTransport, LoopbackTransport) {
        let host = hub.transport();
        let joiner = hub.transport();
        let offer = host.create_local_offer().await.unwrap();
        let answer = joiner.accept_remote_offer(&offer).await.unwrap();
        assert_eq!(*joiner.state().borrow(), ConnectionState::Negotiating);
        host.accept_remote_answer(&answer).await.unwrap();
        (host, joiner)
    }

    #[tokio::test]
    async fn test_loopback_negotiation_opens_both_ends() {
        let hub = LoopbackHub::new();
        let (host, joiner) = linked_pair(&hub).await;

        assert_eq!(*host.state().borrow(), ConnectionState::Open);
        assert_eq!(*joiner.state().borrow(), ConnectionState::Open);
        assert_eq!(hub.pending(), 0);
    }

    #[tokio::test]
    async fn test_loopback_messages_are_ordered_and_counted() {
        let hub = LoopbackHub::new();
        let (host, joiner) = linked_pair(&hub).await;

        host.send(ChannelMessage::Text("hello".into())).unwrap();
        host.send(ChannelMessage::Binary(Bytes::from_static(&[0u8; 100])))
            .unwrap();
        assert_eq!(host.buffered_amount(), 105);

        assert_eq!(
            joiner.recv().await,
            Some(ChannelMessage::Text("hello".into()))
        );
        assert_eq!(host.buffered_amount(), 100);
        assert!(matches!(joiner.recv().await, Some(ChannelMessage::Binary(b)) if b.len() == 100));
        assert_eq!(host.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_loopback_send_before_open_fails() {
        let hub = LoopbackHub::new();
        let host = hub.transport();
        host.create_local_offer().await.unwrap();

        assert!(matches!(
            host.send(ChannelMessage::Text("x".into())),
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_loopback_rejects_unknown_descriptors() {
        let hub = LoopbackHub::new();
        let joiner = hub.transport();

        assert!(matches!(
            joiner.accept_remote_offer("garbage").await,
            Err(TransportError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            joiner.accept_remote_offer(r#"{"offer":"nope"}"#).await,
            Err(TransportError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_close_propagates() {
        let hub = LoopbackHub::new();
        let (host, joiner) = linked_pair(&hub).await;

        joiner.close();
        assert_eq!(*host.state().borrow(), ConnectionState::Closed);
        assert_eq!(host.recv().await, None);
        assert!(matches!(
            host.send(ChannelMessage::Text("late".into())),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_loopback_close_unregisters_offer() {
        let hub = LoopbackHub::new();
        let host = hub.transport();
        host.create_local_offer().await.unwrap();
        assert_eq!(hub.pending(), 1);

        drop(host);
        assert_eq!(hub.pending(), 0);
    }
}
