//! Guest and publish peer connections.
//!
//! Guest connections live in a fixed arena indexed by slot; the registry only
//! stores the [`ConnectionId`]. The publish connection carries the composite
//! output and is the only source of status transitions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use stagecast_common::{Error, Result};
use stagecast_media::{AudioTap, Codec, EncodeConfig, Resolution, VideoTrack};
use stagecast_studio::{
    CompositeOutput, ConnectionId, ConnectionRelease, GuestSlot, ParticipantId, PublishState,
    Session, MAX_GUESTS,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::negotiator::{CandidateRelay, NegotiationOutcome, Negotiator, SignalingSession};
use crate::peer::{new_peer_connection, rtc_error, RtcPeer};
use crate::pumps;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    Created,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl GuestState {
    fn is_terminal(self) -> bool {
        matches!(self, GuestState::Closed | GuestState::Failed)
    }
}

struct GuestConnection {
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<GuestState>>,
    cancel: CancellationToken,
    relay: Option<CandidateRelay>,
}

struct PublishConnection {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
    relay: Option<CandidateRelay>,
}

type PublishSlot = Arc<Mutex<Option<PublishConnection>>>;
type GuestArena = Arc<Mutex<[Option<GuestConnection>; MAX_GUESTS]>>;

/// Transition a guest state unless it already reached a terminal one.
fn set_guest_state(state: &Mutex<GuestState>, label: &str, next: GuestState) {
    let mut current = lock(state);
    if current.is_terminal() || *current == next {
        return;
    }
    debug!("{}: connection {:?} -> {:?}", label, *current, next);
    *current = next;
}

pub struct ConnectionManager {
    session: Arc<Session>,
    negotiator: Arc<Negotiator>,
    guests: GuestArena,
    publish: PublishSlot,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(session: Arc<Session>, negotiator: Negotiator) -> Self {
        Self {
            session,
            negotiator: Arc::new(negotiator),
            guests: Arc::new(Mutex::new(Default::default())),
            publish: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Manager with transports built from the session's configuration.
    pub fn from_session(session: Arc<Session>) -> Result<Self> {
        let negotiator = Negotiator::from_config(&session.config().signaling)?;
        Ok(Self::new(session, negotiator))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn guest_state(&self, slot: GuestSlot) -> Option<GuestState> {
        lock(&self.guests)[slot.index()]
            .as_ref()
            .map(|guest| *lock(&guest.state))
    }

    pub fn is_publishing(&self) -> bool {
        lock(&self.publish).is_some()
    }

    /// Register a guest and connect it.
    pub async fn add_guest(&self, slot: GuestSlot, display_id: &str) -> Result<ConnectionId> {
        self.session.add_guest(slot, display_id)?;
        self.create_guest_connection(slot).await
    }

    /// Open a receive-only connection for a registered guest. Inbound tracks
    /// are attached to the guest's registry entry as they arrive.
    pub async fn create_guest_connection(&self, slot: GuestSlot) -> Result<ConnectionId> {
        let id = ParticipantId::Guest(slot);
        let display_id = self
            .session
            .with_registry(|registry| registry.get(id).map(|p| p.display_id.clone()))
            .ok_or_else(|| Error::not_found(format!("{id} is not registered")))?;
        if lock(&self.guests)[slot.index()].is_some() {
            return Err(Error::DuplicateSlot(slot.get()));
        }

        let pc = new_peer_connection(&self.session.config().ice_servers).await?;
        let label = id.to_string();
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            if let Err(e) = pc.add_transceiver_from_kind(kind, Some(init)).await {
                close_pc(&pc, &label).await;
                return Err(rtc_error(e));
            }
        }

        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(GuestState::Created));
        self.attach_inbound(&pc, id, &cancel);
        self.supervise_guest(&pc, slot, state.clone());

        let guest = GuestConnection {
            pc: pc.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            relay: None,
        };
        let connection = match self.install_guest(slot, guest) {
            Ok(connection) => connection,
            Err(e) => {
                cancel.cancel();
                close_pc(&pc, &label).await;
                return Err(e);
            }
        };
        set_guest_state(&state, &label, GuestState::Negotiating);

        let peer = Arc::new(RtcPeer::new(pc.clone()));
        let candidates = peer.local_candidates(&label);
        let mut signaling = SignalingSession::new(label.clone());
        match self
            .negotiator
            .negotiate(&mut signaling, &display_id, peer, candidates, &cancel)
            .await
        {
            Ok(negotiated) => {
                if let NegotiationOutcome::Degraded = negotiated.outcome {
                    warn!("{}: guest connection running without a media server", label);
                }
                let mut guests = lock(&self.guests);
                match guests[slot.index()].as_mut() {
                    Some(guest) if Arc::ptr_eq(&guest.pc, &pc) => {
                        guest.relay = Some(negotiated.relay);
                        Ok(connection)
                    }
                    _ => Err(Error::cancelled(format!("{label} closed during negotiation"))),
                }
            }
            Err(e) => {
                set_guest_state(&state, &label, GuestState::Failed);
                error!("{}: guest connection failed: {}", label, e);
                self.close_guest_connection(slot).await;
                Err(e)
            }
        }
    }

    /// Put a freshly built connection in the arena and link it from the
    /// registry. On failure the arena entry is rolled back, so a guest
    /// removed mid-setup leaves its slot reusable.
    fn install_guest(&self, slot: GuestSlot, guest: GuestConnection) -> Result<ConnectionId> {
        let pc = guest.pc.clone();
        {
            let mut guests = lock(&self.guests);
            let entry = &mut guests[slot.index()];
            if entry.is_some() {
                return Err(Error::DuplicateSlot(slot.get()));
            }
            *entry = Some(guest);
        }
        let connection = ConnectionId(slot.index());
        if let Err(e) = self.session.set_guest_connection(slot, Some(connection)) {
            let mut guests = lock(&self.guests);
            let entry = &mut guests[slot.index()];
            if entry.as_ref().is_some_and(|g| Arc::ptr_eq(&g.pc, &pc)) {
                *entry = None;
            }
            return Err(e);
        }
        Ok(connection)
    }

    fn attach_inbound(&self, pc: &Arc<RTCPeerConnection>, id: ParticipantId, cancel: &CancellationToken) {
        let session = self.session.clone();
        let cancel = cancel.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let session = session.clone();
            let cancel = cancel.child_token();
            Box::pin(async move {
                let label = format!("{id}/{}", track.kind());
                info!("{}: inbound track {}", label, track.codec().capability.mime_type);
                match track.kind() {
                    RTPCodecType::Video => {
                        let sink = VideoTrack::new(label.clone());
                        if let Err(e) = session.attach_video(id, sink.clone()) {
                            warn!("{}: cannot attach video: {}", label, e);
                            return;
                        }
                        tokio::spawn(pumps::receive_video(track, sink, label, cancel));
                    }
                    RTPCodecType::Audio => {
                        let tap = AudioTap::new(label.clone());
                        if let Err(e) = session.attach_audio(id, tap.clone()) {
                            warn!("{}: cannot attach audio: {}", label, e);
                            return;
                        }
                        tokio::spawn(pumps::receive_audio(track, tap, label, cancel));
                    }
                    _ => debug!("{}: ignoring track of unknown kind", label),
                }
            })
        }));
    }

    /// Tear down a guest connection. Idempotent; returns whether one existed.
    pub async fn close_guest_connection(&self, slot: GuestSlot) -> bool {
        teardown_guest(&self.guests, &self.session, slot, None).await
    }

    /// Follow a guest's peer-connection state. A drop after the connection
    /// was established is a track loss: the connection is closed and the
    /// guest stays on a placeholder until removed. No reconnect is attempted.
    fn supervise_guest(&self, pc: &Arc<RTCPeerConnection>, slot: GuestSlot, state: Arc<Mutex<GuestState>>) {
        let states = state_changes(pc);
        tokio::spawn(follow_guest(
            states,
            self.guests.clone(),
            self.session.clone(),
            slot,
            Arc::downgrade(pc),
            state,
        ));
    }

    /// Remove a guest: its connection is released before the slot frees up.
    pub async fn remove_guest(&self, slot: GuestSlot) -> bool {
        self.session.remove_guest(slot, self).await
    }

    /// Start publishing the session's composite output.
    pub async fn start_publish(&self) -> Result<NegotiationOutcome> {
        let output = self.session.output().clone();
        self.create_publish_connection(output).await
    }

    /// Open the publish connection: attach the output's tracks, start the
    /// encode pumps, negotiate, and report transitions on the status surface.
    pub async fn create_publish_connection(&self, output: CompositeOutput) -> Result<NegotiationOutcome> {
        if self.is_publishing() {
            return Err(Error::AlreadyStreaming);
        }
        let status = self.session.status();
        status.set(PublishState::Negotiating, "Connecting");

        let (pc, video, audio) = match self.build_publish_pc().await {
            Ok(built) => built,
            Err(e) => {
                status.set(PublishState::Failed, e.to_string());
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let inserted = {
            let mut publish = lock(&self.publish);
            if publish.is_some() {
                false
            } else {
                *publish = Some(PublishConnection {
                    generation,
                    pc: pc.clone(),
                    cancel: cancel.clone(),
                    relay: None,
                });
                true
            }
        };
        if !inserted {
            close_pc(&pc, "publish").await;
            return Err(Error::AlreadyStreaming);
        }

        let encode = self.encode_config(output.resolution());
        tokio::spawn(pumps::send_video(output.clone(), video, encode, cancel.child_token()));
        tokio::spawn(pumps::send_audio(output, audio, cancel.child_token()));

        let degraded = Arc::new(AtomicBool::new(false));
        self.supervise_publish(&pc, generation, degraded.clone());

        let peer = Arc::new(RtcPeer::new(pc.clone()));
        let candidates = peer.local_candidates("publish");
        let mut signaling = SignalingSession::new("publish");
        let stream_id = self.session.config().signaling.stream_id.clone();
        match self
            .negotiator
            .negotiate(&mut signaling, &stream_id, peer, candidates, &cancel)
            .await
        {
            Ok(negotiated) => {
                let outcome = negotiated.outcome;
                {
                    let mut publish = lock(&self.publish);
                    match publish.as_mut() {
                        Some(current) if current.generation == generation => {
                            current.relay = Some(negotiated.relay);
                        }
                        _ => return Err(Error::cancelled("publish stopped during negotiation")),
                    }
                }
                match outcome {
                    NegotiationOutcome::Established(transport) => {
                        status.set(PublishState::Connected, format!("Streaming via {transport}"));
                    }
                    NegotiationOutcome::Degraded => {
                        degraded.store(true, Ordering::Relaxed);
                        status.set(
                            PublishState::ConnectedDegraded,
                            "Streaming (degraded: no media server answered)",
                        );
                    }
                }
                Ok(outcome)
            }
            Err(e @ Error::Cancelled(_)) => Err(e),
            Err(e) => {
                status.set(PublishState::Failed, e.to_string());
                teardown_publish(&self.publish, generation).await;
                Err(e)
            }
        }
    }

    async fn build_publish_pc(
        &self,
    ) -> Result<(
        Arc<RTCPeerConnection>,
        Arc<TrackLocalStaticSample>,
        Arc<TrackLocalStaticSample>,
    )> {
        let pc = new_peer_connection(&self.session.config().ice_servers).await?;
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "stagecast".to_string(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "stagecast".to_string(),
        ));
        for track in [video.clone(), audio.clone()] {
            if let Err(e) = pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>).await {
                close_pc(&pc, "publish").await;
                return Err(rtc_error(e));
            }
        }
        Ok((pc, video, audio))
    }

    fn encode_config(&self, resolution: Resolution) -> EncodeConfig {
        let video = &self.session.config().video;
        EncodeConfig {
            codec: Codec::H264,
            resolution,
            fps: video.fps,
            bitrate_kbps: video.bitrate_kbps,
        }
    }

    /// Map peer-connection state changes onto the status surface. A drop
    /// after the connection was established is a track loss; the connection
    /// is closed and not retried.
    fn supervise_publish(&self, pc: &Arc<RTCPeerConnection>, generation: u64, degraded: Arc<AtomicBool>) {
        let states = state_changes(pc);
        tokio::spawn(follow_publish(
            states,
            self.session.clone(),
            self.publish.clone(),
            generation,
            degraded,
        ));
    }

    /// Stop publishing. Cancels an in-flight negotiation; a no-op when not
    /// streaming. Returns whether a publish connection was stopped.
    pub async fn stop_publish(&self) -> bool {
        let Some(mut publish) = lock(&self.publish).take() else {
            return false;
        };
        publish.cancel.cancel();
        if let Some(mut relay) = publish.relay.take() {
            relay.stop();
        }
        close_pc(&publish.pc, "publish").await;
        self.session.status().set(PublishState::Stopped, "Ready");
        true
    }

    /// Stop publishing and release every guest and the host media.
    pub async fn shutdown(&self) {
        self.stop_publish().await;
        self.session.shutdown(self).await;
    }
}

#[async_trait]
impl ConnectionRelease for ConnectionManager {
    async fn release(&self, slot: GuestSlot, _connection: ConnectionId) {
        self.close_guest_connection(slot).await;
    }
}

fn state_changes(pc: &RTCPeerConnection) -> mpsc::UnboundedReceiver<RTCPeerConnectionState> {
    let (tx, rx) = mpsc::unbounded_channel();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let _ = tx.send(state);
        Box::pin(async {})
    }));
    rx
}

async fn follow_guest(
    mut states: mpsc::UnboundedReceiver<RTCPeerConnectionState>,
    guests: GuestArena,
    session: Arc<Session>,
    slot: GuestSlot,
    pc: Weak<RTCPeerConnection>,
    state: Arc<Mutex<GuestState>>,
) {
    let label = ParticipantId::Guest(slot).to_string();
    let mut established = false;
    while let Some(pc_state) = states.recv().await {
        debug!("{}: peer connection {}", label, pc_state);
        match pc_state {
            RTCPeerConnectionState::Connected => {
                established = true;
                set_guest_state(&state, &label, GuestState::Connected);
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                if established =>
            {
                let reason = Error::track_loss(format!("{label} connection {pc_state}"));
                error!("{}: {}", label, reason);
                set_guest_state(&state, &label, GuestState::Failed);
                if let Some(pc) = pc.upgrade() {
                    teardown_guest(&guests, &session, slot, Some(&pc)).await;
                }
                break;
            }
            RTCPeerConnectionState::Failed => {
                warn!("{}: peer connection failed", label);
                set_guest_state(&state, &label, GuestState::Failed);
                if let Some(pc) = pc.upgrade() {
                    teardown_guest(&guests, &session, slot, Some(&pc)).await;
                }
                break;
            }
            RTCPeerConnectionState::Closed => break,
            _ => {}
        }
    }
}

/// Map publish peer-connection states onto the status surface. A drop after
/// the connection was established is a track loss; the connection is closed
/// and not retried.
async fn follow_publish(
    mut states: mpsc::UnboundedReceiver<RTCPeerConnectionState>,
    session: Arc<Session>,
    publish: PublishSlot,
    generation: u64,
    degraded: Arc<AtomicBool>,
) {
    let mut established = false;
    while let Some(state) = states.recv().await {
        info!("publish: peer connection {}", state);
        match state {
            RTCPeerConnectionState::Connected => {
                established = true;
                if !degraded.load(Ordering::Relaxed) {
                    session.status().set(PublishState::Connected, "Streaming");
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed if established => {
                let reason = Error::track_loss(format!("publish connection {state}"));
                session.status().set(PublishState::Lost, reason.to_string());
                teardown_publish(&publish, generation).await;
                break;
            }
            RTCPeerConnectionState::Failed if !degraded.load(Ordering::Relaxed) => {
                session
                    .status()
                    .set(PublishState::Failed, "ICE connection failed");
                teardown_publish(&publish, generation).await;
                break;
            }
            RTCPeerConnectionState::Closed => break,
            _ => {}
        }
    }
}

/// Take a guest out of the arena and close it. With `only`, the entry is
/// taken only while it still holds that peer connection.
async fn teardown_guest(
    guests: &GuestArena,
    session: &Session,
    slot: GuestSlot,
    only: Option<&Arc<RTCPeerConnection>>,
) -> bool {
    let taken = {
        let mut guests = lock(guests);
        let entry = &mut guests[slot.index()];
        let replaced = matches!(
            (entry.as_ref(), only),
            (Some(current), Some(pc)) if !Arc::ptr_eq(&current.pc, pc)
        );
        if replaced {
            None
        } else {
            entry.take()
        }
    };
    let Some(mut guest) = taken else {
        return false;
    };
    let label = ParticipantId::Guest(slot).to_string();
    guest.cancel.cancel();
    if let Some(mut relay) = guest.relay.take() {
        relay.stop();
    }
    close_pc(&guest.pc, &label).await;
    {
        let mut state = lock(&guest.state);
        if !state.is_terminal() {
            *state = GuestState::Closed;
        }
    }
    if let Err(e) = session.set_guest_connection(slot, None) {
        debug!("{}: connection handle already detached: {}", label, e);
    }
    info!("{}: connection closed", label);
    true
}

async fn teardown_publish(publish: &PublishSlot, generation: u64) {
    let taken = {
        let mut slot = lock(publish);
        match slot.as_ref() {
            Some(current) if current.generation == generation => slot.take(),
            _ => None,
        }
    };
    if let Some(mut connection) = taken {
        connection.cancel.cancel();
        if let Some(mut relay) = connection.relay.take() {
            relay.stop();
        }
        close_pc(&connection.pc, "publish").await;
    }
}

async fn close_pc(pc: &RTCPeerConnection, label: &str) {
    if let Err(e) = pc.close().await {
        warn!("{}: failed to close peer connection: {}", label, e);
    }
}
