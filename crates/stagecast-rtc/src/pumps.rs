//! Media pumps between `webrtc` tracks and studio media handles.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use stagecast_media::{codecs, AudioTap, Codec, EncodeConfig, VideoTrack};
use stagecast_studio::CompositeOutput;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const VIDEO_CLOCK_RATE: u64 = 90_000;
const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Inbound guest video: RTP → H.264 access units → decoded frames. Without a
/// decoder the packets are drained and the slot keeps its placeholder.
pub async fn receive_video(
    track: Arc<TrackRemote>,
    sink: VideoTrack,
    label: String,
    cancel: CancellationToken,
) {
    let mime = track.codec().capability.mime_type;
    let codec = Codec::from_mime(&mime);
    let mut decoder = match codec {
        Some(Codec::H264) => codecs::video_decoder(Codec::H264),
        _ => None,
    };
    if decoder.is_none() {
        info!("{}: no decoder for {}, video will render as placeholder", label, mime);
    }

    let mut depacketizer = H264Packet::default();
    let mut access_unit = BytesMut::new();
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!("{}: video track ended: {}", label, e);
                    break;
                }
            },
        };
        let Some(decoder) = decoder.as_mut() else {
            continue;
        };

        match depacketizer.depacketize(&packet.payload) {
            Ok(nal) => access_unit.extend_from_slice(&nal),
            Err(e) => {
                debug!("{}: dropping malformed H.264 packet: {}", label, e);
                access_unit.clear();
                continue;
            }
        }
        if !packet.header.marker || access_unit.is_empty() {
            continue;
        }

        let timestamp_us = u64::from(packet.header.timestamp) * 1_000_000 / VIDEO_CLOCK_RATE;
        match decoder.decode(&access_unit, timestamp_us) {
            Ok(Some(frame)) => sink.publish(frame),
            Ok(None) => {}
            Err(e) => debug!("{}: decode failed: {}", label, e),
        }
        access_unit.clear();
    }
    sink.end();
}

/// Inbound guest audio: Opus packets → PCM in the participant's tap.
pub async fn receive_audio(
    track: Arc<TrackRemote>,
    tap: AudioTap,
    label: String,
    cancel: CancellationToken,
) {
    let mut decoder = codecs::audio_decoder();
    if decoder.is_none() {
        info!("{}: no audio decoder compiled in, guest audio is silent", label);
    }

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!("{}: audio track ended: {}", label, e);
                    break;
                }
            },
        };
        let Some(decoder) = decoder.as_mut() else {
            continue;
        };
        match decoder.decode(&packet.payload) {
            Ok(pcm) => tap.push(&pcm),
            Err(e) => debug!("{}: opus decode failed: {}", label, e),
        }
    }
    tap.end();
}

/// Outbound composite video. Returns when cancelled or when the output is
/// gone.
pub async fn send_video(
    output: CompositeOutput,
    track: Arc<TrackLocalStaticSample>,
    config: EncodeConfig,
    cancel: CancellationToken,
) {
    let Some(mut encoder) = codecs::video_encoder(&config) else {
        warn!("publish: no video encoder compiled in, composite video is not transmitted");
        cancel.cancelled().await;
        return;
    };
    let duration = Duration::from_secs(1) / config.fps.max(1);
    let mut frames = output.subscribe_video();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };
        let encoded = match encoder.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("publish: encode failed: {}", e);
                continue;
            }
        };
        if encoded.data.is_empty() {
            continue;
        }
        let sample = Sample {
            data: Bytes::from(encoded.data),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("publish: video write failed: {}", e);
        }
    }
}

/// Outbound mixed audio in 20 ms Opus frames.
pub async fn send_audio(
    output: CompositeOutput,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    let Some(mut encoder) = codecs::audio_encoder() else {
        warn!("publish: no audio encoder compiled in, composite audio is not transmitted");
        cancel.cancelled().await;
        return;
    };
    let mut frames = output.subscribe_audio();

    loop {
        let pcm = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(pcm) => pcm,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("publish: audio sender lagged by {} frames", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        let packet = match encoder.encode(&pcm) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("publish: opus encode failed: {}", e);
                continue;
            }
        };
        let sample = Sample {
            data: Bytes::from(packet),
            duration: AUDIO_FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("publish: audio write failed: {}", e);
        }
    }
}
