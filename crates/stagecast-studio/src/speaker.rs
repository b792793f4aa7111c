//! Active speaker detection from per-participant audio levels.

use std::collections::BTreeMap;
use std::sync::Arc;

use stagecast_media::AudioAnalyser;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ids::ParticipantId;
use crate::registry::Registry;
use crate::session::Session;

/// Per-tick decay applied to the visual level when the signal drops.
pub const VISUAL_DECAY: f32 = 0.85;

/// Pick the loudest participant above `threshold`.
///
/// `levels` must be in canonical order. The running maximum starts at the
/// threshold and only a strictly greater level takes the lead, so equal
/// levels favour the participant evaluated first.
pub fn select_speaker(levels: &[(ParticipantId, f32)], threshold: f32) -> Option<ParticipantId> {
    let mut max = threshold;
    let mut leader = None;
    for &(id, level) in levels {
        if level > max {
            max = level;
            leader = Some(id);
        }
    }
    leader
}

pub struct SpeakerMonitor {
    threshold: f32,
    analysers: BTreeMap<ParticipantId, Box<dyn AudioAnalyser>>,
    visual: BTreeMap<ParticipantId, f32>,
}

impl SpeakerMonitor {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            analysers: BTreeMap::new(),
            visual: BTreeMap::new(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn attach(&mut self, id: ParticipantId, analyser: Box<dyn AudioAnalyser>) {
        debug!("speaker: analyser attached for {}", id);
        self.analysers.insert(id, analyser);
    }

    pub fn detach(&mut self, id: ParticipantId) {
        if self.analysers.remove(&id).is_some() {
            debug!("speaker: analyser detached for {}", id);
        }
        self.visual.remove(&id);
    }

    pub fn is_attached(&self, id: ParticipantId) -> bool {
        self.analysers.contains_key(&id)
    }

    pub fn visual_level(&self, id: ParticipantId) -> f32 {
        self.visual.get(&id).copied().unwrap_or(0.0)
    }

    /// One sampling tick. Writes decayed visual levels for every analysed
    /// participant and returns the new active speaker when it changed.
    pub fn sample(&mut self, registry: &mut Registry) -> Option<ParticipantId> {
        let mut levels = Vec::with_capacity(self.analysers.len());
        // BTreeMap iteration is canonical order.
        for (id, analyser) in self.analysers.iter_mut() {
            if registry.get(*id).is_none() {
                continue;
            }
            let level = analyser.level().clamp(0.0, 100.0);
            let previous = self.visual.get(id).copied().unwrap_or(0.0);
            let visual = level.max(previous * VISUAL_DECAY);
            self.visual.insert(*id, visual);
            registry.set_level(*id, visual, level > self.threshold);
            levels.push((*id, level));
        }

        let leader = select_speaker(&levels, self.threshold)?;
        if registry.active_speaker() == Some(leader) {
            return None;
        }
        registry.set_active_speaker(Some(leader));
        info!("speaker: active speaker is now {}", leader);
        Some(leader)
    }
}

/// Sample audio levels on the configured interval until cancelled.
pub async fn run(session: Arc<Session>, cancel: CancellationToken) {
    let mut ticker = interval(session.config().audio.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                session.sample_audio();
            }
        }
    }
    debug!("speaker: sampling stopped");
}
