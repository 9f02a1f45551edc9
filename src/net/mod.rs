//! Networking module for peerdrop
//!
//! This module provides everything needed to move one file between two
//! endpoints without a relay:
//!
//! - **Pairing**: short session codes the host shares with the joiner
//! - **Signaling**: the key/value store used to exchange offer and answer
//! - **Session**: the transport seam and the session wrapper around it
//! - **Negotiator**: drives the offer/answer exchange for both roles
//! - **Transfer**: metadata handshake, paced chunk stream and reassembly
//!
//! Two transport primitives ship with the crate: an in-process
//! [`LoopbackHub`] and a direct [`TcpTransport`] for LAN use.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerdrop::net::{ConnectionNegotiator, LoopbackHub, MemorySignalingStore, TransferEngine};
//!
//! let store = MemorySignalingStore::new();
//! let hub = LoopbackHub::new();
//! let host = ConnectionNegotiator::new(store.clone(), hub.clone());
//! let joiner = ConnectionNegotiator::new(store, hub);
//!
//! let code = host.create_connection().await?;
//! let joined = joiner.join_connection(code.as_str()).await?;
//! let hosted = host.complete_connection().await?;
//!
//! let sender = TransferEngine::new(hosted);
//! let receiver = TransferEngine::new(joined);
//! receiver.on_file_received(|file| println!("got {}", file.name));
//! sender.send_file(file, |p| println!("{:.0}%", p.percent())).await?;
//! ```

pub mod loopback;
pub mod message;
pub mod negotiator;
pub mod pairing;
pub mod reassembly;
pub mod session;
pub mod signaling;
pub mod tcp;
pub mod transfer;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use message::{ControlMessage, FileMetadata};
pub use negotiator::{ConnectionNegotiator, NegotiationError, NegotiatorConfig};
pub use pairing::{CodeError, SessionCode};
pub use reassembly::{Reassembler, ReceivePhase, ReceivedFile};
pub use session::{
    ChannelMessage, ConnectionState, Transport, TransportError, TransportFactory, TransportSession,
};
pub use signaling::{
    DirSignalingStore, MemorySignalingStore, SignalKind, SignalRecord, SignalingError,
    SignalingStore,
};
pub use tcp::{TcpConfig, TcpTransport};
pub use transfer::{
    OutgoingFile, SendPhase, TransferConfig, TransferEngine, TransferError, TransferProgress,
};
