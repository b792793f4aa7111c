//! Outward status surface, driven only by publish-connection transitions.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StudioStatus {
    Ready,
    Connecting,
    Streaming,
    Error,
    Disconnected,
}

impl StudioStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudioStatus::Ready => "ready",
            StudioStatus::Connecting => "connecting",
            StudioStatus::Streaming => "streaming",
            StudioStatus::Error => "error",
            StudioStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for StudioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the publish connection as seen by the studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Negotiating,
    Connected,
    /// Negotiated in degraded mode against a synthesized answer.
    ConnectedDegraded,
    Failed,
    /// An established connection dropped.
    Lost,
    /// The remote side closed the connection.
    Closed,
    /// Stopped by the user.
    Stopped,
}

impl PublishState {
    pub fn status(self) -> StudioStatus {
        match self {
            PublishState::Idle | PublishState::Stopped => StudioStatus::Ready,
            PublishState::Negotiating => StudioStatus::Connecting,
            PublishState::Connected | PublishState::ConnectedDegraded => StudioStatus::Streaming,
            PublishState::Failed | PublishState::Lost => StudioStatus::Error,
            PublishState::Closed => StudioStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: StudioStatus,
    pub reason: String,
}

impl StatusReport {
    pub fn new(status: StudioStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.reason)
    }
}

pub struct StatusSurface {
    tx: watch::Sender<StatusReport>,
}

impl Default for StatusSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSurface {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusReport::new(StudioStatus::Ready, "Ready"));
        Self { tx }
    }

    pub fn current(&self) -> StatusReport {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.tx.subscribe()
    }

    /// Publish a transition. Repeating the current report is a no-op, so
    /// subscribers see each distinct transition once.
    pub fn set(&self, state: PublishState, reason: impl Into<String>) -> bool {
        let report = StatusReport::new(state.status(), reason);
        let changed = self.tx.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            *current = report.clone();
            true
        });
        if changed {
            match report.status {
                StudioStatus::Error | StudioStatus::Disconnected => warn!("status: {}", report),
                _ => info!("status: {}", report),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(PublishState::Negotiating.status(), StudioStatus::Connecting);
        assert_eq!(PublishState::ConnectedDegraded.status(), StudioStatus::Streaming);
        assert_eq!(PublishState::Lost.status(), StudioStatus::Error);
        assert_eq!(PublishState::Closed.status(), StudioStatus::Disconnected);
        assert_eq!(PublishState::Stopped.status(), StudioStatus::Ready);
    }

    #[test]
    fn test_repeated_report_is_not_republished() {
        let surface = StatusSurface::new();
        let mut rx = surface.subscribe();
        assert!(!surface.set(PublishState::Idle, "Ready"));
        assert!(!rx.has_changed().unwrap());

        assert!(surface.set(PublishState::Failed, "negotiation timed out"));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!surface.set(PublishState::Failed, "negotiation timed out"));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(surface.current().status, StudioStatus::Error);
    }
}
