use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stagecast_common::{Error, Result};

pub const MAX_GUESTS: usize = 4;

/// Guest slot number, always in 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GuestSlot(u8);

impl GuestSlot {
    pub const ALL: [GuestSlot; MAX_GUESTS] = [GuestSlot(1), GuestSlot(2), GuestSlot(3), GuestSlot(4)];

    pub fn new(n: u8) -> Result<Self> {
        Self::try_from(n)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based position, used to index slot arrays.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for GuestSlot {
    type Error = Error;

    fn try_from(n: u8) -> Result<Self> {
        if (1..=MAX_GUESTS as u8).contains(&n) {
            Ok(Self(n))
        } else {
            Err(Error::invalid(format!(
                "guest slot must be between 1 and {}, got {}",
                MAX_GUESTS, n
            )))
        }
    }
}

impl From<GuestSlot> for u8 {
    fn from(slot: GuestSlot) -> u8 {
        slot.0
    }
}

impl fmt::Display for GuestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant identity. The derived ordering is the canonical evaluation
/// order: host first, then guests by slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParticipantId {
    Host,
    Guest(GuestSlot),
}

impl ParticipantId {
    pub fn guest(self) -> Option<GuestSlot> {
        match self {
            ParticipantId::Host => None,
            ParticipantId::Guest(slot) => Some(slot),
        }
    }

    pub fn canonical() -> impl Iterator<Item = ParticipantId> {
        std::iter::once(ParticipantId::Host).chain(GuestSlot::ALL.into_iter().map(ParticipantId::Guest))
    }
}

impl From<GuestSlot> for ParticipantId {
    fn from(slot: GuestSlot) -> Self {
        ParticipantId::Guest(slot)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Host => f.write_str("host"),
            ParticipantId::Guest(slot) => write!(f, "guest-{}", slot),
        }
    }
}

impl FromStr for ParticipantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "host" {
            return Ok(ParticipantId::Host);
        }
        let n = s
            .strip_prefix("guest-")
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| Error::invalid(format!("unknown participant '{}'", s)))?;
        Ok(ParticipantId::Guest(GuestSlot::new(n)?))
    }
}

/// Index into the connection arena owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
