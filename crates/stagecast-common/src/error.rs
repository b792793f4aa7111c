//! Common error types for Stagecast.
//!
//! The `Display` output of every variant doubles as the human-readable reason
//! attached to user-visible status transitions.

use thiserror::Error;

use crate::protocol::TransportKind;

/// Result type alias using Stagecast's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Stagecast operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Guest cap of the active layout (or of the registry) exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// A guest slot that is occupied (or still releasing) was added again.
    #[error("guest slot {0} is already occupied")]
    DuplicateSlot(u8),

    /// Camera or microphone unavailable.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// A signaling transport exceeded its bound.
    #[error("negotiation timed out on {transport} transport after {after_ms} ms")]
    NegotiationTimeout {
        transport: TransportKind,
        after_ms: u64,
    },

    /// Malformed or unexpected signaling response.
    #[error("negotiation protocol error: {0}")]
    NegotiationProtocol(String),

    /// An established connection reported disconnection.
    #[error("track lost: {0}")]
    TrackLoss(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Signaling transport failure (socket closed, connection refused, ...)
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by the WebRTC stack
    #[error("rtc error: {0}")]
    Rtc(String),

    /// Operation cancelled before completion
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Caller supplied an invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A publish session is already running
    #[error("already streaming")]
    AlreadyStreaming,

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Create a capacity error from any displayable type.
    pub fn capacity(msg: impl std::fmt::Display) -> Self {
        Self::Capacity(msg.to_string())
    }

    /// Create a media acquisition error from any displayable type.
    pub fn media(msg: impl std::fmt::Display) -> Self {
        Self::MediaAcquisition(msg.to_string())
    }

    /// Create a negotiation protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationProtocol(msg.to_string())
    }

    /// Create a track loss error from any displayable type.
    pub fn track_loss(msg: impl std::fmt::Display) -> Self {
        Self::TrackLoss(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an rtc error from any displayable type.
    pub fn rtc(msg: impl std::fmt::Display) -> Self {
        Self::Rtc(msg.to_string())
    }

    /// Create a cancellation error from any displayable type.
    pub fn cancelled(msg: impl std::fmt::Display) -> Self {
        Self::Cancelled(msg.to_string())
    }

    /// Create an invalid argument error from any displayable type.
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Errors rejected locally, before any connection is attempted.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            Self::Capacity(_) | Self::DuplicateSlot(_) | Self::InvalidArgument(_)
        )
    }

    /// The remote end could not be reached or refused the exchange. A
    /// timeout is not included: the server may still be processing.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
