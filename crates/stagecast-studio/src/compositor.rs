//! Fixed-resolution compositor producing the outbound video/audio feed.
//!
//! The render tick reads a [`RenderPlan`] built atomically from the session,
//! draws every slot (frame or placeholder) and publishes the result on the
//! [`CompositeOutput`]. It performs no I/O and never waits on a frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use stagecast_media::{AudioMixer, AudioTap, Resolution, VideoFrame, AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::layout::{Layout, PixelRect, SlotRect};
use crate::session::Session;

pub const BACKGROUND: Rgba<u8> = Rgba([0x00, 0x00, 0x00, 0xff]);
pub const PLACEHOLDER: Rgba<u8> = Rgba([0x1e, 0x1e, 0x23, 0xff]);

const AUDIO_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct PlannedSlot {
    pub rect: SlotRect,
    pub frame: Option<Arc<VideoFrame>>,
}

/// Everything one render tick needs, captured under the session locks.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub layout: Layout,
    /// Draw order; later slots are drawn on top.
    pub slots: Vec<PlannedSlot>,
}

/// Composite feed consumed by the publish connection.
#[derive(Clone)]
pub struct CompositeOutput {
    resolution: Resolution,
    fps: u32,
    video: Arc<watch::Sender<Option<Arc<VideoFrame>>>>,
    audio: broadcast::Sender<Arc<Vec<i16>>>,
}

impl CompositeOutput {
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        let (video, _rx) = watch::channel(None);
        let (audio, _rx) = broadcast::channel(AUDIO_CHANNEL_DEPTH);
        Self {
            resolution,
            fps,
            video: Arc::new(video),
            audio,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn latest_video(&self) -> Option<Arc<VideoFrame>> {
        self.video.borrow().clone()
    }

    pub fn subscribe_video(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.video.subscribe()
    }

    /// Mixed 20 ms mono frames at 48 kHz.
    pub fn subscribe_audio(&self) -> broadcast::Receiver<Arc<Vec<i16>>> {
        self.audio.subscribe()
    }

    fn publish_video(&self, frame: Arc<VideoFrame>) {
        self.video.send_replace(Some(frame));
    }

    fn publish_audio(&self, frame: Arc<Vec<i16>>) {
        // No subscriber until a publish connection exists.
        let _ = self.audio.send(frame);
    }
}

pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            image: RgbaImage::from_pixel(resolution.width, resolution.height, BACKGROUND),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn clear(&mut self, color: Rgba<u8>) {
        for pixel in self.image.pixels_mut() {
            *pixel = color;
        }
    }

    pub fn fill(&mut self, rect: PixelRect, color: Rgba<u8>) {
        let x_end = (rect.x + rect.w).min(self.width());
        let y_end = (rect.y + rect.h).min(self.height());
        for y in rect.y..y_end {
            for x in rect.x..x_end {
                self.image.put_pixel(x, y, color);
            }
        }
    }

    /// Scale `source` to the rectangle (nearest neighbour) and draw it.
    pub fn draw_scaled(&mut self, rect: PixelRect, source: &RgbaImage) {
        if rect.w == 0 || rect.h == 0 {
            return;
        }
        if source.width() == rect.w && source.height() == rect.h {
            imageops::replace(&mut self.image, source, i64::from(rect.x), i64::from(rect.y));
        } else {
            let scaled = imageops::resize(source, rect.w, rect.h, FilterType::Nearest);
            imageops::replace(&mut self.image, &scaled, i64::from(rect.x), i64::from(rect.y));
        }
    }
}

/// Frame clock for the render loop: one tick per frame period, skipping
/// missed ticks instead of bursting to catch up.
pub struct FramePacer {
    ticker: Interval,
    period: Duration,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        let period = Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) -> Instant {
        self.ticker.tick().await
    }
}

/// Cloneable handle to stop a running compositor from elsewhere.
#[derive(Clone, Debug)]
pub struct CompositorHandle {
    running: Arc<AtomicBool>,
}

impl CompositorHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct Compositor {
    canvas: Canvas,
    output: CompositeOutput,
    mixer: AudioMixer,
    frame_index: u64,
    running: Arc<AtomicBool>,
}

impl Compositor {
    pub fn new(output: CompositeOutput) -> Self {
        Self {
            canvas: Canvas::new(output.resolution()),
            output,
            mixer: AudioMixer::new(),
            frame_index: 0,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> CompositorHandle {
        CompositorHandle {
            running: self.running.clone(),
        }
    }

    pub fn output(&self) -> &CompositeOutput {
        &self.output
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frame_index
    }

    /// Draw one frame and publish it.
    pub fn render(&mut self, plan: &RenderPlan) -> Arc<VideoFrame> {
        let (width, height) = (self.canvas.width(), self.canvas.height());
        self.canvas.clear(BACKGROUND);

        for slot in &plan.slots {
            let rect = slot.rect.to_pixels(width, height);
            match slot.frame.as_deref() {
                Some(frame) if frame.width() > 0 && frame.height() > 0 => {
                    self.canvas.draw_scaled(rect, &frame.image);
                }
                _ => self.canvas.fill(rect, PLACEHOLDER),
            }
        }

        let fps = u64::from(self.output.fps().max(1));
        let timestamp_us = self.frame_index * 1_000_000 / fps;
        self.frame_index += 1;

        let frame = Arc::new(VideoFrame::new(self.canvas.image().clone(), timestamp_us));
        self.output.publish_video(frame.clone());
        frame
    }

    /// Mix one 20 ms frame from the given taps and publish it.
    pub fn mix_audio(&mut self, taps: Vec<AudioTap>) -> Arc<Vec<i16>> {
        self.mixer.set_inputs(taps);
        let frame = Arc::new(self.mixer.mix_frame());
        self.output.publish_audio(frame.clone());
        frame
    }

    /// Render and mix until cancelled or stopped through a [`CompositorHandle`].
    pub async fn run(&mut self, session: Arc<Session>, cancel: CancellationToken) {
        self.running.store(true, Ordering::Release);
        let mut pacer = FramePacer::new(self.output.fps());
        let audio_period = Duration::from_micros(
            AUDIO_FRAME_SAMPLES as u64 * 1_000_000 / u64::from(AUDIO_SAMPLE_RATE),
        );
        let mut audio_ticker = interval(audio_period);
        audio_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "compositor: rendering {}x{} at {} fps",
            self.canvas.width(),
            self.canvas.height(),
            self.output.fps()
        );
        while self.running.load(Ordering::Acquire) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pacer.tick() => {
                    let plan = session.render_plan();
                    self.render(&plan);
                }
                _ = audio_ticker.tick() => {
                    let taps = session.all_audio();
                    self.mix_audio(taps);
                }
            }
        }
        self.running.store(false, Ordering::Release);
        debug!("compositor: stopped after {} frames", self.frame_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{GuestSlot, ParticipantId};

    fn output() -> CompositeOutput {
        CompositeOutput::new(
            Resolution {
                width: 64,
                height: 36,
            },
            30,
        )
    }

    fn rect(participant: ParticipantId, x: f32, y: f32, w: f32, h: f32) -> SlotRect {
        SlotRect {
            participant,
            x,
            y,
            w,
            h,
        }
    }

    #[test]
    fn test_missing_frames_render_placeholders() {
        let mut compositor = Compositor::new(output());
        let plan = RenderPlan {
            layout: Layout::SideBySide,
            slots: vec![
                PlannedSlot {
                    rect: rect(ParticipantId::Host, 0.0, 0.0, 0.5, 1.0),
                    frame: Some(Arc::new(VideoFrame::new(
                        RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255])),
                        0,
                    ))),
                },
                PlannedSlot {
                    rect: rect(ParticipantId::Guest(GuestSlot::ALL[0]), 0.5, 0.0, 0.5, 1.0),
                    frame: None,
                },
            ],
        };
        let frame = compositor.render(&plan);
        assert_eq!(frame.width(), 64);
        assert_eq!(*frame.image.get_pixel(5, 5), Rgba([255, 0, 0, 255]));
        assert_eq!(*frame.image.get_pixel(40, 20), PLACEHOLDER);
        assert_eq!(compositor.output().latest_video().unwrap().timestamp_us, 0);
    }

    #[test]
    fn test_uncovered_area_is_background_and_inset_on_top() {
        let mut compositor = Compositor::new(output());
        let green = Arc::new(VideoFrame::new(
            RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 255])),
            0,
        ));
        let plan = RenderPlan {
            layout: Layout::PictureInPicture,
            slots: vec![
                PlannedSlot {
                    rect: rect(ParticipantId::Host, 0.0, 0.0, 0.5, 0.5),
                    frame: None,
                },
                PlannedSlot {
                    rect: rect(ParticipantId::Guest(GuestSlot::ALL[0]), 0.25, 0.25, 0.5, 0.5),
                    frame: Some(green),
                },
            ],
        };
        let frame = compositor.render(&plan);
        assert_eq!(*frame.image.get_pixel(2, 2), PLACEHOLDER);
        assert_eq!(*frame.image.get_pixel(20, 12), Rgba([0, 255, 0, 255]));
        assert_eq!(*frame.image.get_pixel(63, 35), BACKGROUND);
    }

    #[test]
    fn test_timestamps_advance_per_frame() {
        let mut compositor = Compositor::new(output());
        let plan = RenderPlan {
            layout: Layout::Spotlight,
            slots: Vec::new(),
        };
        compositor.render(&plan);
        let second = compositor.render(&plan);
        assert_eq!(second.timestamp_us, 33_333);
        assert_eq!(compositor.frames_rendered(), 2);
    }

    #[test]
    fn test_mix_audio_publishes() {
        let mut compositor = Compositor::new(output());
        let mut rx = compositor.output().subscribe_audio();
        let tap = AudioTap::new("host");
        tap.push(&[100; AUDIO_FRAME_SAMPLES]);
        let mixed = compositor.mix_audio(vec![tap]);
        assert_eq!(mixed[0], 100);
        assert_eq!(rx.try_recv().unwrap()[0], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_pacer_period() {
        let mut pacer = FramePacer::new(30);
        assert_eq!(pacer.period(), Duration::from_nanos(33_333_333));
        let first = pacer.tick().await;
        let second = pacer.tick().await;
        assert_eq!(second - first, pacer.period());
    }
}
