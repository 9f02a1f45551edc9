//! peerdrop - Direct file drops between two endpoints
//!
//! One endpoint (the host) publishes a connection offer under a short
//! session code; the other (the joiner) uses the code to answer, and the
//! file then moves over the negotiated channel as a paced stream of
//! chunks. No server ever relays file bytes: the only shared resource is a
//! small key/value signaling store used for the offer/answer exchange.
//!
//! # Architecture
//!
//! Everything lives under [`net`]:
//!
//! - [`net::negotiator`]: offer/answer exchange through a signaling store
//! - [`net::transfer`]: the `file-info` → `ready` → chunks protocol
//! - [`net::session`]: the transport seam both of the above build on
//!
//! See the `peerdrop` binary for a command-line front end over TCP.

pub mod net;
