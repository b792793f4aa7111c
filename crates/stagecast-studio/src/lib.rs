//! Studio core for Stagecast: who is on stage, how they are laid out, who is
//! speaking, and the composited feed that gets published.

#![forbid(unsafe_code)]

pub mod compositor;
pub mod ids;
pub mod layout;
pub mod registry;
pub mod session;
pub mod speaker;
pub mod status;

pub use compositor::{CompositeOutput, Compositor, CompositorHandle, FramePacer, RenderPlan};
pub use ids::{ConnectionId, GuestSlot, ParticipantId, MAX_GUESTS};
pub use layout::{Layout, LayoutChange, LayoutEngine, SlotRect, LAYOUT_TABLE};
pub use registry::{Participant, Registry};
pub use session::{ConnectionRelease, NoConnections, Session};
pub use speaker::{select_speaker, SpeakerMonitor};
pub use status::{PublishState, StatusReport, StatusSurface, StudioStatus};
