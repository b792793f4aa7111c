//! Host camera and microphone capture.
//!
//! Each device is driven from its own thread, since neither camera handles
//! nor audio streams can move between threads on every platform. A thread
//! runs until the track it feeds is ended.

use std::thread;

use async_trait::async_trait;
use stagecast_common::{Error, Result};
use tokio::sync::oneshot;
use tracing::info;

use crate::track::{AudioTap, MediaDevices, MediaRequest, MediaSource, VideoTrack};

/// Camera and microphone of the local machine. Backends are compiled in by
/// the `camera` and `microphone` features; a device whose backend is missing
/// fails acquisition.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceCapture;

impl DeviceCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for DeviceCapture {
    async fn acquire(&self, request: &MediaRequest) -> Result<MediaSource> {
        let mut source = MediaSource::new("host");
        if request.video {
            let track = VideoTrack::new("host/video");
            start_device("camera", {
                let track = track.clone();
                let request = request.clone();
                move |ready| camera::run(track, request, ready)
            })
            .await?;
            source = source.with_video(track);
        }
        if request.audio {
            let tap = AudioTap::new("host/audio");
            let started = start_device("microphone", {
                let tap = tap.clone();
                move |ready| microphone::run(tap, ready)
            })
            .await;
            if let Err(e) = started {
                source.stop();
                return Err(e);
            }
            source = source.with_audio(tap);
        }
        info!(
            "capture: host media started (video: {}, audio: {})",
            source.video.is_some(),
            source.audio.is_some()
        );
        Ok(source)
    }
}

/// Run `body` on a named thread and wait for it to report that the device
/// is open.
async fn start_device<F>(name: &str, body: F) -> Result<()>
where
    F: FnOnce(oneshot::Sender<Result<()>>) + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    thread::Builder::new()
        .name(format!("stagecast-{name}"))
        .spawn(move || body(ready_tx))
        .map_err(|e| Error::media(format!("{name} thread: {e}")))?;
    match ready_rx.await {
        Ok(result) => result,
        Err(_) => Err(Error::media(format!("{name} thread exited before opening the device"))),
    }
}

/// Average interleaved frames down to mono.
#[cfg_attr(not(feature = "microphone"), allow(dead_code))]
pub(crate) fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    let channels = channels.max(1);
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

#[cfg(feature = "camera")]
mod camera {
    use std::time::Instant;

    use image::RgbaImage;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
    use nokhwa::Camera;
    use stagecast_common::{Error, Result};
    use tokio::sync::oneshot;
    use tracing::{debug, warn};

    use crate::track::{MediaRequest, VideoTrack};
    use crate::VideoFrame;

    /// Consecutive failed reads before the camera is given up on.
    const MAX_READ_FAILURES: u32 = 30;

    fn open(request: &MediaRequest) -> Result<Camera> {
        let index = match &request.device_id {
            Some(id) => match id.parse::<u32>() {
                Ok(n) => CameraIndex::Index(n),
                Err(_) => CameraIndex::String(id.clone()),
            },
            None => CameraIndex::Index(0),
        };
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(request.width, request.height),
        ));
        let mut camera = Camera::new(index, format)
            .map_err(|e| Error::media(format!("camera init failed: {e}")))?;
        camera
            .open_stream()
            .map_err(|e| Error::media(format!("camera stream failed: {e}")))?;
        Ok(camera)
    }

    pub(super) fn run(track: VideoTrack, request: MediaRequest, ready: oneshot::Sender<Result<()>>) {
        let mut camera = match open(&request) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let started = Instant::now();
        let mut failures = 0u32;
        while !track.is_ended() {
            let decoded = camera
                .frame()
                .and_then(|buffer| buffer.decode_image::<RgbFormat>());
            match decoded {
                Ok(image) => {
                    failures = 0;
                    let (width, height) = image.dimensions();
                    let timestamp_us = started.elapsed().as_micros() as u64;
                    if let Some(frame) = rgb_frame(width, height, &image.into_raw(), timestamp_us) {
                        track.publish(frame);
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!("capture: camera read failed: {}", e);
                    if failures >= MAX_READ_FAILURES {
                        warn!("capture: camera stopped after {} failed reads", failures);
                        break;
                    }
                }
            }
        }
        if let Err(e) = camera.stop_stream() {
            debug!("capture: camera stop failed: {}", e);
        }
        track.end();
    }

    /// Expand packed RGB into an RGBA frame.
    pub(crate) fn rgb_frame(width: u32, height: u32, rgb: &[u8], timestamp_us: u64) -> Option<VideoFrame> {
        let pixels = width as usize * height as usize;
        if rgb.len() < pixels * 3 {
            return None;
        }
        let mut rgba = Vec::with_capacity(pixels * 4);
        for px in rgb.chunks_exact(3).take(pixels) {
            rgba.extend_from_slice(&[px[0], px[1], px[2], u8::MAX]);
        }
        RgbaImage::from_raw(width, height, rgba).map(|image| VideoFrame::new(image, timestamp_us))
    }
}

#[cfg(not(feature = "camera"))]
mod camera {
    use stagecast_common::{Error, Result};
    use tokio::sync::oneshot;

    use crate::track::{MediaRequest, VideoTrack};

    pub(super) fn run(_track: VideoTrack, _request: MediaRequest, ready: oneshot::Sender<Result<()>>) {
        let _ = ready.send(Err(Error::media("built without camera support")));
    }
}

#[cfg(feature = "microphone")]
mod microphone {
    use std::thread;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
    use stagecast_common::{Error, Result};
    use tokio::sync::oneshot;
    use tracing::{debug, error};

    use super::downmix;
    use crate::track::AudioTap;
    use crate::AUDIO_SAMPLE_RATE;

    /// How often the idle thread checks whether the tap was ended.
    const END_POLL: Duration = Duration::from_millis(100);

    fn select_input_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat)> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| Error::media(format!("microphone configs: {e}")))?;
        let mut chosen: Option<(StreamConfig, SampleFormat)> = None;
        for cfg in configs {
            let min = cfg.min_sample_rate().0;
            let max = cfg.max_sample_rate().0;
            if min > AUDIO_SAMPLE_RATE || max < AUDIO_SAMPLE_RATE {
                continue;
            }
            let mono = cfg.channels() == 1;
            let format = cfg.sample_format();
            let config = cfg.with_sample_rate(SampleRate(AUDIO_SAMPLE_RATE)).config();
            // Prefer mono; otherwise keep the first usable layout.
            if mono || chosen.is_none() {
                chosen = Some((config, format));
            }
            if mono {
                break;
            }
        }
        chosen.ok_or_else(|| Error::media(format!("microphone does not support {AUDIO_SAMPLE_RATE} Hz")))
    }

    fn build_input<T>(device: &cpal::Device, config: &StreamConfig, tap: AudioTap) -> Result<Stream>
    where
        T: SizedSample,
        i16: cpal::FromSample<T>,
    {
        let channels = usize::from(config.channels);
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let pcm: Vec<i16> = data.iter().map(|&s| s.to_sample::<i16>()).collect();
                    tap.push(&downmix(&pcm, channels));
                },
                |err| error!("capture: microphone stream error: {}", err),
                None,
            )
            .map_err(|e| Error::media(format!("microphone stream: {e}")))
    }

    fn open(tap: AudioTap) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::media("no microphone available"))?;
        let (config, format) = select_input_config(&device)?;
        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, tap)?,
            SampleFormat::I16 => build_input::<i16>(&device, &config, tap)?,
            SampleFormat::U16 => build_input::<u16>(&device, &config, tap)?,
            other => return Err(Error::media(format!("unsupported microphone format {other:?}"))),
        };
        stream
            .play()
            .map_err(|e| Error::media(format!("microphone start failed: {e}")))?;
        Ok(stream)
    }

    pub(super) fn run(tap: AudioTap, ready: oneshot::Sender<Result<()>>) {
        let stream = match open(tap.clone()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        while !tap.is_ended() {
            thread::sleep(END_POLL);
        }
        drop(stream);
        debug!("capture: microphone released");
    }
}

#[cfg(not(feature = "microphone"))]
mod microphone {
    use stagecast_common::{Error, Result};
    use tokio::sync::oneshot;

    use crate::track::AudioTap;

    pub(super) fn run(_tap: AudioTap, ready: oneshot::Sender<Result<()>>) {
        let _ = ready.send(Err(Error::media("built without microphone support")));
    }
}
