#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # sfu-signaling
//! sfu-signaling is the signaling side of a multi-party SFU. Peers connect over a message channel, negotiate send and
//! receive transports with the media engine, publish their tracks as producers and consume the producers of every
//! other peer. Media itself never passes through this crate: it only talks to a [`engine::MediaEngine`].
//!
//! ## Usage
//! Create a [`worker::Worker`] on top of an engine, then call [`worker::Worker::open_channel`] for every connected
//! peer and feed its text frames to the returned [`signaling::channel::ChannelHandle`].
//! `demos/signaling_server.rs` is a complete WebSocket server built this way.

/// Peer-side counterpart of the protocol.
pub mod client;
/// Configuration for the router codecs and [`engine::TransportHandle`] creation.
pub mod config;
/// Media engine binding.
pub mod engine;
pub mod error;
/// Session Registry which announces new producers to every other peer.
pub mod registry;
/// RTP, ICE and DTLS parameter types exchanged on the wire.
pub mod rtp_parameters;
/// Server-side state of one peer.
pub mod session;
/// Signaling protocol.
pub mod signaling;
/// Worker is a module that owns the engine and the registry.
pub mod worker;
