//! Peer connections and signaling for Stagecast.
//!
//! [`Negotiator`] runs offer/answer over a WebSocket channel with an HTTP
//! publish exchange as fallback. [`ConnectionManager`] owns the guest and
//! publish peer connections and the media pumps attached to them.

#![forbid(unsafe_code)]

pub mod connection;
pub mod negotiator;
pub mod peer;
pub mod pumps;
pub mod sdp;
pub mod transport;

pub use connection::{ConnectionManager, GuestState};
pub use negotiator::{
    CandidateRelay, Negotiated, NegotiationOutcome, NegotiationState, Negotiator, SessionPeer,
    SignalingSession,
};
pub use peer::{new_peer_connection, RtcPeer};
pub use sdp::synthesize_answer;
pub use transport::{
    channel_url, ChannelPeer, HttpExchange, PrimaryChannel, PrimaryConnector, SecondaryExchange,
    WsConnector,
};
