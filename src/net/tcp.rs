//! Direct TCP transport primitive
//!
//! The host binds a listener and advertises its addresses plus a random
//! token in the offer descriptor. The joiner connects straight to the host,
//! introduces itself with a hello frame carrying both tokens, and answers
//! with its own token. When the host reads the answer it matches it against
//! the hello it received, replies with an accept frame, and both ends open.
//!
//! # Framing
//!
//! Every message is one length-delimited frame whose first byte tags the
//! payload:
//!
//! | tag    | payload                       |
//! |--------|-------------------------------|
//! | `0x01` | UTF-8 control text            |
//! | `0x02` | raw binary chunk              |
//! | `0x10` | hello (JSON, joiner to host)  |
//! | `0x11` | accept (empty, host to joiner)|
//!
//! No NAT traversal or encryption is attempted; this transport is meant
//! for peers that can reach each other directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::session::{ChannelMessage, ConnectionState, Transport, TransportError, TransportFactory};

const TAG_TEXT: u8 = 0x01;
const TAG_BINARY: u8 = 0x02;
const TAG_HELLO: u8 = 0x10;
const TAG_ACCEPT: u8 = 0x11;

/// Largest frame accepted from a peer (16 MiB)
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Pending hellos buffered between the accept loop and the answer
const HELLO_QUEUE_CAPACITY: usize = 4;

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

/// Configuration for [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address the host listens on; an unspecified IP advertises the
    /// primary interface and loopback
    pub bind_addr: SocketAddr,
    /// Per-address connect timeout on the joiner side
    pub connect_timeout: Duration,
    /// Bound on each handshake step (hello, accept)
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportFactory for TcpConfig {
    type Transport = TcpTransport;

    fn create(&self) -> TcpTransport {
        TcpTransport::new(self.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpOffer {
    addrs: Vec<SocketAddr>,
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TcpAnswer {
    token: String,
    peer: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    token: String,
    peer: String,
}

fn new_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

fn encode_frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(1 + payload.len());
    frame.put_u8(tag);
    frame.extend_from_slice(payload);
    frame.freeze()
}

fn decode_frame(frame: BytesMut) -> Option<(u8, Bytes)> {
    if frame.is_empty() {
        return None;
    }
    let mut frame = frame.freeze();
    let payload = frame.split_off(1);
    Some((frame[0], payload))
}

fn parse_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TransportError> {
    serde_json::from_str(s).map_err(|e| TransportError::invalid_descriptor(e.to_string()))
}

/// Best guess at the address other hosts on the LAN can reach us on
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified())
}

fn advertised_addrs(local: SocketAddr) -> Vec<SocketAddr> {
    if !local.ip().is_unspecified() {
        return vec![local];
    }
    let mut addrs = Vec::with_capacity(2);
    if let Some(ip) = primary_ip() {
        addrs.push(SocketAddr::new(ip, local.port()));
    }
    addrs.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()));
    addrs
}

/// State shared between the transport and its I/O tasks
#[derive(Debug)]
struct Shared {
    state: watch::Sender<ConnectionState>,
    inbox_tx: mpsc::UnboundedSender<ChannelMessage>,
    /// Encoded frames waiting for the writer, with their payload length
    outgoing: RwLock<Option<mpsc::UnboundedSender<(Bytes, u64)>>>,
    /// Payload bytes queued but not yet written to the socket
    buffered: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    fn mark_closed(&self) {
        self.outgoing.write().take();
        self.cancel.cancel();
        if !self.state.borrow().is_closed() {
            self.state.send_replace(ConnectionState::Closed);
            debug!("TCP transport closed");
        }
    }

    /// Splits an established connection into reader and writer tasks
    fn start(self: &Arc<Self>, framed: FramedTcp) {
        let (sink, stream) = framed.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outgoing.write() = Some(out_tx);
        tokio::spawn(write_loop(Arc::clone(self), sink, out_rx));
        tokio::spawn(read_loop(Arc::clone(self), stream));
        self.state.send_replace(ConnectionState::Open);
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: SplitSink<FramedTcp, Bytes>,
    mut out_rx: mpsc::UnboundedReceiver<(Bytes, u64)>,
) {
    loop {
        let next = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,
            next = out_rx.recv() => next,
        };
        let Some((frame, payload_len)) = next else {
            break;
        };
        let result = sink.send(frame).await;
        shared.buffered.fetch_sub(payload_len, Ordering::AcqRel);
        if let Err(e) = result {
            warn!(error = %e, "Failed to write frame");
            break;
        }
    }
    let _ = sink.close().await;
    shared.mark_closed();
}

async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<FramedTcp>) {
    loop {
        let next = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read frame");
                break;
            }
            None => {
                debug!("Peer closed the connection");
                break;
            }
        };
        let message = match decode_frame(frame) {
            Some((TAG_TEXT, payload)) => match String::from_utf8(payload.to_vec()) {
                Ok(text) => ChannelMessage::Text(text),
                Err(_) => {
                    warn!("Dropping text frame that is not UTF-8");
                    continue;
                }
            },
            Some((TAG_BINARY, payload)) => ChannelMessage::Binary(payload),
            Some((tag, _)) => {
                debug!(tag, "Ignoring unexpected frame");
                continue;
            }
            None => continue,
        };
        let _ = shared.inbox_tx.send(message);
    }
    shared.mark_closed();
}

/// Accepts joiners until one is matched by an answer or the listener is
/// cancelled
async fn accept_loop(
    listener: TcpListener,
    token: String,
    hello_tx: mpsc::Sender<(Hello, FramedTcp)>,
    cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, codec());

        let hello = match timeout(handshake_timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => decode_frame(frame)
                .filter(|(tag, _)| *tag == TAG_HELLO)
                .and_then(|(_, payload)| serde_json::from_slice::<Hello>(&payload).ok()),
            _ => None,
        };
        match hello {
            Some(hello) if hello.token == token => {
                debug!(remote = %remote, peer = %hello.peer, "Joiner said hello");
                if hello_tx.send((hello, framed)).await.is_err() {
                    break;
                }
            }
            _ => warn!(remote = %remote, "Dropping connection without a valid hello"),
        }
    }
    debug!("Listener stopped");
}

/// A transport over one direct TCP connection
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    shared: Arc<Shared>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    offer_token: Mutex<Option<String>>,
    hellos: AsyncMutex<Option<mpsc::Receiver<(Hello, FramedTcp)>>>,
    listener_cancel: Mutex<Option<CancellationToken>>,
}

impl TcpTransport {
    /// Creates a negotiating transport
    pub fn new(config: TcpConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Negotiating);
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                inbox_tx,
                outgoing: RwLock::new(None),
                buffered: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            inbox_rx: AsyncMutex::new(inbox_rx),
            offer_token: Mutex::new(None),
            hellos: AsyncMutex::new(None),
            listener_cancel: Mutex::new(None),
        }
    }

    async fn connect_any(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        for addr in addrs {
            match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    info!(addr = %addr, "Connected to host");
                    return Ok(stream);
                }
                Ok(Err(e)) => debug!(addr = %addr, error = %e, "Connect failed"),
                Err(_) => debug!(addr = %addr, "Connect timed out"),
            }
        }
        Err(TransportError::negotiation(
            "host is not reachable at any advertised address",
        ))
    }

    fn stop_listener(&self) {
        let cancel = self.listener_cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

impl Transport for TcpTransport {
    #[instrument(skip(self), fields(bind = %self.config.bind_addr))]
    async fn create_local_offer(&self) -> Result<String, TransportError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local = listener.local_addr()?;
        let addrs = advertised_addrs(local);
        let token = new_token();

        let (hello_tx, hello_rx) = mpsc::channel(HELLO_QUEUE_CAPACITY);
        *self.hellos.lock().await = Some(hello_rx);
        *self.offer_token.lock() = Some(token.clone());

        let cancel = self.shared.cancel.child_token();
        *self.listener_cancel.lock() = Some(cancel.clone());
        tokio::spawn(accept_loop(
            listener,
            token.clone(),
            hello_tx,
            cancel,
            self.config.handshake_timeout,
        ));

        info!(addrs = ?addrs, "Listening for joiner");
        Ok(serde_json::to_string(&TcpOffer { addrs, token }).unwrap_or_default())
    }

    #[instrument(skip_all)]
    async fn accept_remote_offer(&self, offer: &str) -> Result<String, TransportError> {
        let offer: TcpOffer = parse_json(offer)?;
        let stream = self.connect_any(&offer.addrs).await?;
        let peer = new_token();

        let mut framed = Framed::new(stream, codec());
        let hello = Hello {
            token: offer.token.clone(),
            peer: peer.clone(),
        };
        let payload = serde_json::to_vec(&hello).unwrap_or_default();
        framed.send(encode_frame(TAG_HELLO, &payload)).await?;

        // The channel opens once the host has read our answer and accepts
        let shared = Arc::clone(&self.shared);
        let handshake_timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            let accepted = tokio::select! {
                biased;

                _ = shared.cancel.cancelled() => false,
                frame = timeout(handshake_timeout, framed.next()) => matches!(
                    frame,
                    Ok(Some(Ok(ref f))) if f.first() == Some(&TAG_ACCEPT)
                ),
            };
            if accepted {
                info!("Host accepted connection");
                shared.start(framed);
            } else {
                warn!("Host never accepted the connection");
                shared.mark_closed();
            }
        });

        Ok(serde_json::to_string(&TcpAnswer {
            token: offer.token,
            peer,
        })
        .unwrap_or_default())
    }

    #[instrument(skip_all)]
    async fn accept_remote_answer(&self, answer: &str) -> Result<(), TransportError> {
        let answer: TcpAnswer = parse_json(answer)?;
        let expected = self
            .offer_token
            .lock()
            .clone()
            .ok_or_else(|| TransportError::negotiation("no offer was created"))?;
        if answer.token != expected {
            return Err(TransportError::negotiation("answer is for a different offer"));
        }

        let mut hellos = self.hellos.lock().await;
        let framed = {
            let rx = hellos
                .as_mut()
                .ok_or_else(|| TransportError::negotiation("answer was already applied"))?;
            let matching = async {
                while let Some((hello, framed)) = rx.recv().await {
                    if hello.peer == answer.peer {
                        return Some(framed);
                    }
                    debug!(peer = %hello.peer, "Ignoring hello from another joiner");
                }
                None
            };
            timeout(self.config.handshake_timeout, matching)
                .await
                .map_err(|_| TransportError::negotiation("joiner never connected"))?
                .ok_or(TransportError::Closed)?
        };
        *hellos = None;
        drop(hellos);
        self.stop_listener();

        let mut framed = framed;
        framed.send(encode_frame(TAG_ACCEPT, &[])).await?;
        self.shared.start(framed);
        info!("Joiner accepted, channel open");
        Ok(())
    }

    fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        match *self.shared.state.borrow() {
            ConnectionState::Negotiating => return Err(TransportError::NotOpen),
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Open => {}
        }
        let frame = match &message {
            ChannelMessage::Text(text) => encode_frame(TAG_TEXT, text.as_bytes()),
            ChannelMessage::Binary(bytes) => encode_frame(TAG_BINARY, bytes),
        };
        let len = message.len() as u64;
        let outgoing = self
            .shared
            .outgoing
            .read()
            .clone()
            .ok_or(TransportError::Closed)?;
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        outgoing.send((frame, len)).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let mut inbox = self.inbox_rx.lock().await;
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            biased;

            message = inbox.recv() => message,
            _ = state.wait_for(|s| s.is_closed()) => None,
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn buffered_amount(&self) -> u64 {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.stop_listener();
        self.shared.mark_closed();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
