//! Offer/answer negotiation as a sequential pipeline:
//! create-offer, set-local, transmit, await-remote, set-remote,
//! drain-candidates. Every step observes the caller's cancellation token.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use stagecast_common::helpers::transaction_id;
use stagecast_common::{
    Error, IceCandidatePayload, PublishRequest, Result, SignalEnvelope, SignalingConfig,
    TransportKind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sdp::synthesize_answer;
use crate::transport::{HttpExchange, PrimaryChannel, PrimaryConnector, SecondaryExchange, WsConnector};

/// The local side of a peer connection, as far as negotiation is concerned.
#[async_trait]
pub trait SessionPeer: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn set_local_offer(&self, sdp: &str) -> Result<()>;
    /// Current local description, including candidates gathered so far.
    async fn local_description(&self) -> Option<String>;
    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferSent,
    AwaitingAnswer,
    AnswerApplied,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Established(TransportKind),
    /// No media server answered; a synthesized receive-only answer was used.
    Degraded,
}

/// Per-connection signaling state.
#[derive(Debug)]
pub struct SignalingSession {
    label: String,
    state: NegotiationState,
    transport: Option<TransportKind>,
    pending: VecDeque<IceCandidatePayload>,
    dropped: Arc<AtomicU64>,
}

impl SignalingSession {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: NegotiationState::Idle,
            transport: None,
            pending: VecDeque::new(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Local candidates discarded because no transport was active.
    pub fn dropped_candidates(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn advance(&mut self, next: NegotiationState) {
        debug!("{}: negotiation {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: &Error) {
        warn!("{}: negotiation failed: {}", self.label, err);
        self.state = NegotiationState::Failed;
    }

    fn remote_applied(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::AnswerApplied | NegotiationState::Established
        )
    }

    /// Queue a remote candidate until the answer is applied. Returns the
    /// candidate back when it can be applied immediately.
    pub fn accept_remote_candidate(
        &mut self,
        candidate: IceCandidatePayload,
    ) -> Option<IceCandidatePayload> {
        if self.remote_applied() {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    /// Queued candidates in receipt order.
    pub fn take_pending(&mut self) -> Vec<IceCandidatePayload> {
        self.pending.drain(..).collect()
    }

    fn restart_for_fallback(&mut self) {
        self.pending.clear();
        self.transport = None;
        self.advance(NegotiationState::OfferCreated);
    }
}

/// Background forwarding of trickled candidates after negotiation. Stops
/// when dropped.
pub struct CandidateRelay {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CandidateRelay {
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CandidateRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Negotiated {
    pub outcome: NegotiationOutcome,
    pub relay: CandidateRelay,
}

async fn step<T>(
    cancel: &CancellationToken,
    name: &str,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(format!("negotiation step {name}"))),
        out = fut => Ok(out),
    }
}

pub struct Negotiator {
    config: SignalingConfig,
    primary: Option<Arc<dyn PrimaryConnector>>,
    secondary: Option<Arc<dyn SecondaryExchange>>,
}

impl Negotiator {
    pub fn new(
        config: SignalingConfig,
        primary: Option<Arc<dyn PrimaryConnector>>,
        secondary: Option<Arc<dyn SecondaryExchange>>,
    ) -> Self {
        Self {
            config,
            primary,
            secondary,
        }
    }

    /// WebSocket primary and HTTP secondary, each only when configured.
    pub fn from_config(config: &SignalingConfig) -> Result<Self> {
        let primary: Option<Arc<dyn PrimaryConnector>> = if config.primary_enabled() {
            Some(Arc::new(WsConnector::new(config.primary_url.clone())))
        } else {
            None
        };
        let secondary: Option<Arc<dyn SecondaryExchange>> = if config.secondary_enabled() {
            Some(Arc::new(HttpExchange::new(config.secondary_url.clone())?))
        } else {
            None
        };
        Ok(Self::new(config.clone(), primary, secondary))
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Run the full pipeline for one connection.
    ///
    /// `local_candidates` yields candidates in generation order. They are
    /// forwarded over the primary channel while it is active; otherwise they
    /// are dropped and counted on the session.
    pub async fn negotiate(
        &self,
        session: &mut SignalingSession,
        stream_id: &str,
        peer: Arc<dyn SessionPeer>,
        mut local_candidates: mpsc::UnboundedReceiver<IceCandidatePayload>,
        cancel: &CancellationToken,
    ) -> Result<Negotiated> {
        match self
            .run_pipeline(session, stream_id, peer, &mut local_candidates, cancel)
            .await
        {
            Ok((outcome, channel, peer)) => {
                let relay = self.spawn_relay(session, channel, peer, local_candidates, cancel);
                Ok(Negotiated { outcome, relay })
            }
            Err(e) => {
                session.fail(&e);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        session: &mut SignalingSession,
        stream_id: &str,
        peer: Arc<dyn SessionPeer>,
        local_candidates: &mut mpsc::UnboundedReceiver<IceCandidatePayload>,
        cancel: &CancellationToken,
    ) -> Result<(NegotiationOutcome, Option<PrimaryChannel>, Arc<dyn SessionPeer>)> {
        let offer = step(cancel, "create-offer", peer.create_offer()).await??;
        session.advance(NegotiationState::OfferCreated);
        step(cancel, "set-local", peer.set_local_offer(&offer)).await??;

        let (answer, outcome, channel) = match self
            .via_primary(session, stream_id, &offer, local_candidates, cancel)
            .await
        {
            Ok((answer, channel)) => (
                answer,
                NegotiationOutcome::Established(TransportKind::DirectChannel),
                Some(channel),
            ),
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                if self.primary.is_some() {
                    warn!(
                        "{}: primary transport failed ({}), falling back to {}",
                        session.label,
                        e,
                        TransportKind::RequestResponse
                    );
                }
                session.restart_for_fallback();

                let local = step(cancel, "local-description", peer.local_description())
                    .await?
                    .unwrap_or_else(|| offer.clone());
                // Candidates gathered so far are part of the local description.
                let mut carried = 0usize;
                while local_candidates.try_recv().is_ok() {
                    carried += 1;
                }
                if carried > 0 {
                    debug!("{}: {} candidate(s) carried in the offer", session.label, carried);
                }

                match self.via_secondary(session, stream_id, &local, cancel).await {
                    Ok(answer) => (
                        answer,
                        NegotiationOutcome::Established(TransportKind::RequestResponse),
                        None,
                    ),
                    Err(e) if e.is_unreachable() && self.config.allow_degraded_answer =>
                    {
                        warn!(
                            "{}: no media server reachable ({}); continuing in DEGRADED mode with a synthesized receive-only answer",
                            session.label, e
                        );
                        (synthesize_answer(&local), NegotiationOutcome::Degraded, None)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match step(cancel, "set-remote", peer.set_remote_answer(&answer)).await? {
            Ok(()) => {}
            Err(e) if outcome == NegotiationOutcome::Degraded => {
                warn!("{}: synthesized answer not applied: {}", session.label, e);
            }
            Err(e) => return Err(e),
        }
        session.advance(NegotiationState::AnswerApplied);

        for candidate in session.take_pending() {
            let applied = step(cancel, "drain-candidates", peer.add_remote_candidate(candidate)).await?;
            if let Err(e) = applied {
                warn!("{}: remote candidate rejected: {}", session.label, e);
            }
        }
        session.advance(NegotiationState::Established);
        match outcome {
            NegotiationOutcome::Established(transport) => {
                info!("{}: negotiated over {}", session.label, transport)
            }
            NegotiationOutcome::Degraded => warn!("{}: negotiated in degraded mode", session.label),
        }
        Ok((outcome, channel, peer))
    }

    async fn via_primary(
        &self,
        session: &mut SignalingSession,
        stream_id: &str,
        offer: &str,
        local_candidates: &mut mpsc::UnboundedReceiver<IceCandidatePayload>,
        cancel: &CancellationToken,
    ) -> Result<(String, PrimaryChannel)> {
        let Some(connector) = &self.primary else {
            return Err(Error::transport("primary transport disabled"));
        };

        let bound = self.config.primary_connect_timeout();
        let mut channel = match step(cancel, "transmit", timeout(bound, connector.connect(stream_id))).await? {
            Ok(channel) => channel?,
            Err(_) => {
                return Err(Error::NegotiationTimeout {
                    transport: TransportKind::DirectChannel,
                    after_ms: self.config.primary_connect_timeout_ms,
                })
            }
        };
        session.transport = Some(TransportKind::DirectChannel);

        channel
            .send(SignalEnvelope::Offer {
                sdp: offer.to_string(),
            })
            .await?;
        session.advance(NegotiationState::OfferSent);
        session.advance(NegotiationState::AwaitingAnswer);

        // An open channel that never answers is bounded like the secondary
        // exchange.
        let deadline = sleep(self.config.secondary_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled("negotiation step await-remote"));
                }
                _ = &mut deadline => {
                    return Err(Error::NegotiationTimeout {
                        transport: TransportKind::DirectChannel,
                        after_ms: self.config.secondary_timeout_ms,
                    });
                }
                Some(candidate) = local_candidates.recv() => {
                    channel.send(SignalEnvelope::IceCandidate { candidate }).await?;
                }
                message = channel.recv() => match message {
                    Some(SignalEnvelope::Answer { sdp }) => return Ok((sdp, channel)),
                    Some(SignalEnvelope::IceCandidate { candidate }) => {
                        session.accept_remote_candidate(candidate);
                    }
                    Some(SignalEnvelope::Offer { .. }) => {
                        warn!("{}: ignoring unexpected offer from signaling server", session.label);
                    }
                    None => return Err(Error::transport("primary channel closed before answer")),
                },
            }
        }
    }

    async fn via_secondary(
        &self,
        session: &mut SignalingSession,
        stream_id: &str,
        local: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(exchange) = &self.secondary else {
            return Err(Error::transport("secondary transport disabled"));
        };
        session.transport = Some(TransportKind::RequestResponse);

        let mut request = PublishRequest::offer(local, stream_id);
        request.api = Some(exchange.endpoint().to_string());
        request.streamurl = self.config.stream_url.clone();
        request.tid = Some(transaction_id());
        session.advance(NegotiationState::OfferSent);
        session.advance(NegotiationState::AwaitingAnswer);

        let bound = self.config.secondary_timeout();
        match step(cancel, "transmit", timeout(bound, exchange.exchange(&request))).await? {
            Ok(response) => response?.into_answer_sdp(),
            Err(_) => Err(Error::NegotiationTimeout {
                transport: TransportKind::RequestResponse,
                after_ms: self.config.secondary_timeout_ms,
            }),
        }
    }

    fn spawn_relay(
        &self,
        session: &SignalingSession,
        channel: Option<PrimaryChannel>,
        peer: Arc<dyn SessionPeer>,
        mut local_candidates: mpsc::UnboundedReceiver<IceCandidatePayload>,
        parent: &CancellationToken,
    ) -> CandidateRelay {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let label = session.label.clone();
        let dropped = session.dropped.clone();

        let task = tokio::spawn(async move {
            let mut channel = channel;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    candidate = local_candidates.recv() => {
                        let Some(candidate) = candidate else { break };
                        let sent = match &channel {
                            Some(channel) => channel
                                .send(SignalEnvelope::IceCandidate { candidate })
                                .await
                                .is_ok(),
                            None => false,
                        };
                        if !sent {
                            channel = None;
                            dropped.fetch_add(1, Ordering::Relaxed);
                            warn!("{}: no active signaling transport, dropping local ICE candidate", label);
                        }
                    }
                    message = async {
                        match channel.as_mut() {
                            Some(channel) => channel.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match message {
                        Some(SignalEnvelope::IceCandidate { candidate }) => {
                            if let Err(e) = peer.add_remote_candidate(candidate).await {
                                warn!("{}: remote candidate rejected: {}", label, e);
                            }
                        }
                        Some(other) => debug!("{}: ignoring {} after negotiation", label, other.kind()),
                        None => {
                            info!("{}: signaling channel closed", label);
                            channel = None;
                        }
                    },
                }
            }
        });

        CandidateRelay {
            cancel,
            task: Some(task),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use stagecast_common::PublishResponse;
    use tokio::time::Instant;

    use crate::transport::ChannelPeer;

    pub(crate) const OFFER: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=sendrecv\r\n";

    #[derive(Default)]
    pub(crate) struct MockPeer {
        pub calls: Mutex<Vec<String>>,
        pub remote: Mutex<Option<String>>,
        pub candidates: Mutex<Vec<String>>,
        pub reject_remote: bool,
    }

    impl MockPeer {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn applied_candidates(&self) -> Vec<String> {
            self.candidates.lock().unwrap().clone()
        }

        pub fn remote(&self) -> Option<String> {
            self.remote.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionPeer for MockPeer {
        async fn create_offer(&self) -> Result<String> {
            self.record("create-offer");
            Ok(OFFER.to_string())
        }

        async fn set_local_offer(&self, _sdp: &str) -> Result<()> {
            self.record("set-local");
            Ok(())
        }

        async fn local_description(&self) -> Option<String> {
            Some(OFFER.to_string())
        }

        async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
            self.record("set-remote");
            if self.reject_remote {
                return Err(Error::rtc("answer rejected"));
            }
            *self.remote.lock().unwrap() = Some(sdp.to_string());
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
            self.record("add-candidate");
            self.candidates.lock().unwrap().push(candidate.candidate);
            Ok(())
        }
    }

    pub(crate) fn candidate(text: &str) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: text.to_string(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Hands out a pre-built in-process channel once.
    struct PairConnector(Mutex<Option<PrimaryChannel>>);

    #[async_trait]
    impl PrimaryConnector for PairConnector {
        async fn connect(&self, _stream_id: &str) -> Result<PrimaryChannel> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::transport("already connected"))
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl PrimaryConnector for HangingConnector {
        async fn connect(&self, _stream_id: &str) -> Result<PrimaryChannel> {
            std::future::pending().await
        }
    }

    enum Reply {
        Answer(&'static str),
        Hang,
        Unreachable,
        Rejected,
    }

    struct ScriptedExchange {
        reply: Reply,
        seen: Mutex<Vec<PublishRequest>>,
    }

    impl ScriptedExchange {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SecondaryExchange for ScriptedExchange {
        async fn exchange(&self, request: &PublishRequest) -> Result<PublishResponse> {
            self.seen.lock().unwrap().push(request.clone());
            match self.reply {
                Reply::Answer(sdp) => Ok(PublishResponse {
                    sdp: Some(sdp.to_string()),
                    code: Some(0),
                    msg: None,
                }),
                Reply::Hang => std::future::pending().await,
                Reply::Unreachable => Err(Error::transport("connection refused")),
                Reply::Rejected => Ok(PublishResponse {
                    sdp: None,
                    code: Some(400),
                    msg: Some("stream busy".into()),
                }),
            }
        }

        fn endpoint(&self) -> &str {
            "http://media.local/rtc/v1/publish/"
        }
    }

    fn config() -> SignalingConfig {
        SignalingConfig {
            stream_url: Some("rtc://media.local/live/studio".into()),
            ..SignalingConfig::default()
        }
    }

    fn primary_pair() -> (Arc<dyn PrimaryConnector>, ChannelPeer) {
        let (channel, far) = PrimaryChannel::pair();
        let connector: Arc<dyn PrimaryConnector> =
            Arc::new(PairConnector(Mutex::new(Some(channel))));
        (connector, far)
    }

    #[tokio::test]
    async fn primary_queues_remote_candidates_until_answer() {
        let (connector, mut far) = primary_pair();
        let negotiator = Negotiator::new(config(), Some(connector), None);
        let peer = Arc::new(MockPeer::default());
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let server = tokio::spawn(async move {
            let offer = far.received.recv().await.unwrap();
            assert_eq!(offer.kind(), "offer");
            local_tx.send(candidate("local-1")).unwrap();
            let forwarded = far.received.recv().await.unwrap();
            far.sender
                .send(SignalEnvelope::IceCandidate { candidate: candidate("remote-1") })
                .await
                .unwrap();
            far.sender
                .send(SignalEnvelope::IceCandidate { candidate: candidate("remote-2") })
                .await
                .unwrap();
            far.sender
                .send(SignalEnvelope::Answer { sdp: "v=0 answer".into() })
                .await
                .unwrap();
            (forwarded, far, local_tx)
        });

        let cancel = CancellationToken::new();
        let negotiated = negotiator
            .negotiate(&mut session, "studio", peer.clone(), local_rx, &cancel)
            .await
            .unwrap();
        let (forwarded, _far, _local_tx) = server.await.unwrap();

        assert_eq!(
            negotiated.outcome,
            NegotiationOutcome::Established(TransportKind::DirectChannel)
        );
        assert_eq!(session.state(), NegotiationState::Established);
        assert_eq!(session.transport(), Some(TransportKind::DirectChannel));
        assert_eq!(peer.remote().as_deref(), Some("v=0 answer"));
        assert_eq!(peer.applied_candidates(), vec!["remote-1", "remote-2"]);
        assert_eq!(
            peer.calls(),
            vec!["create-offer", "set-local", "set-remote", "add-candidate", "add-candidate"]
        );
        match forwarded {
            SignalEnvelope::IceCandidate { candidate } => assert_eq!(candidate.candidate, "local-1"),
            other => panic!("expected candidate, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn relay_applies_late_remote_candidates() {
        let (connector, mut far) = primary_pair();
        let negotiator = Negotiator::new(config(), Some(connector), None);
        let peer = Arc::new(MockPeer::default());
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let server = tokio::spawn(async move {
            far.received.recv().await.unwrap();
            far.sender
                .send(SignalEnvelope::Answer { sdp: "v=0 answer".into() })
                .await
                .unwrap();
            far
        });

        let cancel = CancellationToken::new();
        let _negotiated = negotiator
            .negotiate(&mut session, "studio", peer.clone(), local_rx, &cancel)
            .await
            .unwrap();
        let far = server.await.unwrap();
        far.sender
            .send(SignalEnvelope::IceCandidate { candidate: candidate("late") })
            .await
            .unwrap();

        for _ in 0..50 {
            if !peer.applied_candidates().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(peer.applied_candidates(), vec!["late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_timeout_falls_back_to_secondary() {
        let exchange = ScriptedExchange::new(Reply::Answer("v=0 from server"));
        let negotiator = Negotiator::new(
            config(),
            Some(Arc::new(HangingConnector)),
            Some(exchange.clone()),
        );
        let peer = Arc::new(MockPeer::default());
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let started = Instant::now();
        let negotiated = negotiator
            .negotiate(&mut session, "studio", peer.clone(), local_rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            negotiated.outcome,
            NegotiationOutcome::Established(TransportKind::RequestResponse)
        );
        assert_eq!(peer.remote().as_deref(), Some("v=0 from server"));

        let seen = exchange.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stream_id, "studio");
        assert_eq!(seen[0].api.as_deref(), Some("http://media.local/rtc/v1/publish/"));
        assert_eq!(seen[0].streamurl.as_deref(), Some("rtc://media.local/live/studio"));
        assert_eq!(seen[0].tid.as_ref().map(|t| t.len()), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn both_transports_timing_out_fails_once() {
        let negotiator = Negotiator::new(
            config(),
            Some(Arc::new(HangingConnector)),
            Some(ScriptedExchange::new(Reply::Hang)),
        );
        let peer = Arc::new(MockPeer::default());
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("guest-1");

        let started = Instant::now();
        let err = negotiator
            .negotiate(&mut session, "guest-1", peer.clone(), local_rx, &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(matches!(
            err,
            Error::NegotiationTimeout {
                transport: TransportKind::RequestResponse,
                after_ms: 10_000
            }
        ));
        assert_eq!(session.state(), NegotiationState::Failed);
        assert!(peer.remote().is_none());
    }

    #[tokio::test]
    async fn unreachable_server_degrades_with_synthesized_answer() {
        let negotiator = Negotiator::new(
            config(),
            None,
            Some(ScriptedExchange::new(Reply::Unreachable)),
        );
        let peer = Arc::new(MockPeer::default());
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let negotiated = negotiator
            .negotiate(&mut session, "studio", peer.clone(), local_rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(negotiated.outcome, NegotiationOutcome::Degraded);
        assert_eq!(session.state(), NegotiationState::Established);
        let remote = peer.remote().unwrap();
        assert!(remote.contains("a=recvonly"));
        assert!(!remote.contains("a=sendrecv"));

        local_tx.send(candidate("late-local")).unwrap();
        for _ in 0..50 {
            if session.dropped_candidates() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(session.dropped_candidates(), 1);
    }

    #[tokio::test]
    async fn degraded_answer_rejection_is_not_fatal() {
        let negotiator = Negotiator::new(config(), None, None);
        let peer = Arc::new(MockPeer {
            reject_remote: true,
            ..MockPeer::default()
        });
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let negotiated = negotiator
            .negotiate(&mut session, "studio", peer, local_rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(negotiated.outcome, NegotiationOutcome::Degraded);
    }

    #[tokio::test]
    async fn degraded_mode_can_be_disabled() {
        let mut cfg = config();
        cfg.allow_degraded_answer = false;
        let negotiator = Negotiator::new(cfg, None, Some(ScriptedExchange::new(Reply::Unreachable)));
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let err = negotiator
            .negotiate(
                &mut session,
                "studio",
                Arc::new(MockPeer::default()),
                local_rx,
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(session.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn server_rejection_is_surfaced() {
        let negotiator = Negotiator::new(config(), None, Some(ScriptedExchange::new(Reply::Rejected)));
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");

        let err = negotiator
            .negotiate(
                &mut session,
                "studio",
                Arc::new(MockPeer::default()),
                local_rx,
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NegotiationProtocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_pending_step() {
        let negotiator = Negotiator::new(
            config(),
            Some(Arc::new(HangingConnector)),
            Some(ScriptedExchange::new(Reply::Hang)),
        );
        let (_local_tx, local_rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new("host");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = negotiator
            .negotiate(
                &mut session,
                "studio",
                Arc::new(MockPeer::default()),
                local_rx,
                &cancel,
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(session.state(), NegotiationState::Failed);
    }

    #[test]
    fn remote_candidates_apply_directly_once_answered() {
        let mut session = SignalingSession::new("host");
        assert!(session.accept_remote_candidate(candidate("a")).is_none());
        assert!(session.accept_remote_candidate(candidate("b")).is_none());
        assert_eq!(session.pending_candidates(), 2);

        session.advance(NegotiationState::AnswerApplied);
        let drained: Vec<_> = session.take_pending().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(session.accept_remote_candidate(candidate("c")).is_some());
        assert_eq!(session.pending_candidates(), 0);
    }
}
