//! The studio session context: one explicit owner for participant, layout
//! and speaker state, shared by `Arc` between the render loop, the sampling
//! loop and the connection manager.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use stagecast_common::{Error, Result, StagecastConfig};
use stagecast_media::{AudioTap, MediaDevices, MediaRequest, MediaSource, PcmAnalyser, Resolution, VideoTrack};
use tracing::{info, warn};

use crate::compositor::{CompositeOutput, PlannedSlot, RenderPlan};
use crate::ids::{ConnectionId, GuestSlot, ParticipantId};
use crate::layout::{Layout, LayoutChange, LayoutEngine};
use crate::registry::{Participant, Registry};
use crate::speaker::SpeakerMonitor;
use crate::status::StatusSurface;

/// Releases the network side of a guest before its slot is freed.
#[async_trait]
pub trait ConnectionRelease: Send + Sync {
    async fn release(&self, slot: GuestSlot, connection: ConnectionId);
}

/// Used when no connection manager is wired in.
pub struct NoConnections;

#[async_trait]
impl ConnectionRelease for NoConnections {
    async fn release(&self, _slot: GuestSlot, _connection: ConnectionId) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Session {
    config: Arc<StagecastConfig>,
    // Lock order: registry, layout, speaker.
    registry: Mutex<Registry>,
    layout: Mutex<LayoutEngine>,
    speaker: Mutex<SpeakerMonitor>,
    output: CompositeOutput,
    status: StatusSurface,
}

impl Session {
    pub fn new(config: StagecastConfig) -> Self {
        let resolution = Resolution {
            width: config.video.width,
            height: config.video.height,
        };
        let output = CompositeOutput::new(resolution, config.video.fps);
        let threshold = config.audio.vad_threshold;
        Self {
            config: Arc::new(config),
            registry: Mutex::new(Registry::new("host")),
            layout: Mutex::new(LayoutEngine::default()),
            speaker: Mutex::new(SpeakerMonitor::new(threshold)),
            output,
            status: StatusSurface::new(),
        }
    }

    pub fn config(&self) -> &Arc<StagecastConfig> {
        &self.config
    }

    pub fn output(&self) -> &CompositeOutput {
        &self.output
    }

    pub fn status(&self) -> &StatusSurface {
        &self.status
    }

    /// Read access to the registry for inspection.
    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&lock(&self.registry))
    }

    pub fn current_layout(&self) -> Layout {
        lock(&self.layout).current()
    }

    pub fn is_auto_spotlight(&self) -> bool {
        lock(&self.layout).is_auto()
    }

    pub fn spotlighted(&self) -> Option<ParticipantId> {
        lock(&self.layout).spotlighted()
    }

    pub fn active_speaker(&self) -> Option<ParticipantId> {
        lock(&self.registry).active_speaker()
    }

    /// Register a guest. Rejected locally, before any connection exists, when
    /// the slot is taken or the current layout's cap would be exceeded.
    pub fn add_guest(&self, slot: GuestSlot, display_id: &str) -> Result<()> {
        let mut registry = lock(&self.registry);
        let layout = lock(&self.layout);
        if display_id.trim().is_empty() {
            return Err(Error::invalid("guest display id must not be empty"));
        }
        registry.ensure_vacant(slot)?;
        layout.check_guest_capacity(registry.guest_count())?;
        registry.add_guest(slot, display_id)?;
        info!("session: guest-{} '{}' added", slot, display_id);
        Ok(())
    }

    pub fn next_vacant_slot(&self) -> Result<GuestSlot> {
        lock(&self.registry)
            .first_vacant()
            .ok_or_else(|| Error::capacity("all guest slots are occupied"))
    }

    /// Remove a guest: the slot becomes releasing, `connections` tears down
    /// the guest's connection, media tracks end, then the slot is freed.
    /// Removing an empty slot is a no-op. Returns whether a guest was removed.
    pub async fn remove_guest(&self, slot: GuestSlot, connections: &dyn ConnectionRelease) -> bool {
        let id = ParticipantId::Guest(slot);
        let participant = {
            let mut registry = lock(&self.registry);
            let Some(participant) = registry.begin_removal(slot) else {
                return false;
            };
            lock(&self.speaker).detach(id);
            participant
        };

        if let Some(connection) = participant.connection {
            connections.release(slot, connection).await;
        }
        self.release_media(&participant);

        lock(&self.registry).finish_removal(slot);
        info!("session: {} '{}' removed", id, participant.display_id);
        true
    }

    fn release_media(&self, participant: &Participant) {
        if let Some(media) = &participant.media {
            media.stop();
        }
    }

    pub fn set_guest_connection(&self, slot: GuestSlot, connection: Option<ConnectionId>) -> Result<()> {
        lock(&self.registry).set_connection(slot, connection)
    }

    pub fn attach_video(&self, id: ParticipantId, track: VideoTrack) -> Result<()> {
        lock(&self.registry).attach_video(id, track)
    }

    /// Attach an audio tap and start analysing it for speaker detection.
    pub fn attach_audio(&self, id: ParticipantId, tap: AudioTap) -> Result<()> {
        let mut registry = lock(&self.registry);
        registry.attach_audio(id, tap.clone())?;
        lock(&self.speaker).attach(id, Box::new(PcmAnalyser::new(tap)));
        Ok(())
    }

    pub fn set_host_media(&self, media: MediaSource) {
        let audio = media.audio.clone();
        let mut registry = lock(&self.registry);
        if let Some(previous) = registry.set_host_media(Some(media)) {
            previous.stop();
        }
        let mut speaker = lock(&self.speaker);
        match audio {
            Some(tap) => speaker.attach(ParticipantId::Host, Box::new(PcmAnalyser::new(tap))),
            None => speaker.detach(ParticipantId::Host),
        }
    }

    /// Acquire camera and microphone for the host slot.
    pub async fn acquire_host_media(&self, devices: &dyn MediaDevices, request: &MediaRequest) -> Result<()> {
        let media = devices.acquire(request).await.map_err(|e| match e {
            Error::MediaAcquisition(_) => e,
            other => Error::media(other),
        })?;
        info!(
            "session: host media acquired (video: {}, audio: {})",
            media.video.is_some(),
            media.audio.is_some()
        );
        self.set_host_media(media);
        Ok(())
    }

    pub fn release_host_media(&self) {
        let mut registry = lock(&self.registry);
        if let Some(media) = registry.set_host_media(None) {
            media.stop();
            info!("session: host media released");
        }
        lock(&self.speaker).detach(ParticipantId::Host);
    }

    pub fn select_layout(&self, layout: Layout) -> LayoutChange {
        lock(&self.layout).select(layout)
    }

    pub fn set_auto_spotlight(&self, enabled: bool) -> Layout {
        let registry = lock(&self.registry);
        let speaker = registry.active_speaker();
        lock(&self.layout).set_auto(enabled, speaker)
    }

    /// One audio sampling tick; returns the new active speaker if it changed.
    pub fn sample_audio(&self) -> Option<ParticipantId> {
        let mut registry = lock(&self.registry);
        let mut layout = lock(&self.layout);
        let changed = lock(&self.speaker).sample(&mut registry)?;
        layout.on_active_speaker(changed);
        Some(changed)
    }

    /// Snapshot for one render tick, taken under the registry lock so a
    /// half-added guest is never observed.
    pub fn render_plan(&self) -> RenderPlan {
        let registry = lock(&self.registry);
        let layout = lock(&self.layout);
        let slots = layout
            .geometry(&registry)
            .into_iter()
            .map(|rect| PlannedSlot {
                frame: registry
                    .get(rect.participant)
                    .and_then(|p| p.media.as_ref())
                    .and_then(MediaSource::latest_frame),
                rect,
            })
            .collect();
        RenderPlan {
            layout: layout.current(),
            slots,
        }
    }

    /// Audio taps of every registered participant. The guest cap limits what
    /// is drawn, not what is heard.
    pub fn all_audio(&self) -> Vec<AudioTap> {
        lock(&self.registry)
            .participants()
            .filter_map(|p| p.audio().cloned())
            .collect()
    }

    /// Release every participant's media. Used at shutdown.
    pub async fn shutdown(&self, connections: &dyn ConnectionRelease) {
        for slot in GuestSlot::ALL {
            self.remove_guest(slot, connections).await;
        }
        self.release_host_media();
        if lock(&self.registry).len() != 1 {
            warn!("session: guests remained after shutdown");
        }
    }
}
