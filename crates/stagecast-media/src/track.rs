//! Track handles shared between the network side (which fills them) and the
//! studio side (which reads them every frame / sampling tick).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use stagecast_common::Result;
use tokio::sync::watch;

use crate::VideoFrame;

/// Samples of history kept for analysis (about 43 ms at 48 kHz).
const RECENT_CAPACITY: usize = 2_048;
/// Upper bound on unmixed audio; older samples are discarded first.
const PENDING_CAPACITY: usize = 48_000;

/// Latest-frame slot for one video track.
#[derive(Clone)]
pub struct VideoTrack {
    id: String,
    slot: Arc<watch::Sender<Option<Arc<VideoFrame>>>>,
    ended: Arc<AtomicBool>,
}

impl VideoTrack {
    pub fn new(id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            id: id.into(),
            slot: Arc::new(tx),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the current frame. Ignored once the track has ended.
    pub fn publish(&self, frame: VideoFrame) {
        if self.is_ended() {
            return;
        }
        self.slot.send_replace(Some(Arc::new(frame)));
    }

    /// Most recent frame, if any has arrived and the track is live.
    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        if self.is_ended() {
            return None;
        }
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.slot.subscribe()
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::Release);
        self.slot.send_replace(None);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for VideoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoTrack")
            .field("id", &self.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Default)]
struct TapBuffers {
    recent: VecDeque<i16>,
    pending: VecDeque<i16>,
    ended: bool,
}

/// Decoded mono PCM for one audio track.
///
/// Keeps two views of the same stream: a sliding window of recent samples
/// for level analysis (never consumed) and a FIFO drained by the mixer.
#[derive(Clone, Default)]
pub struct AudioTap {
    id: String,
    inner: Arc<Mutex<TapBuffers>>,
}

impl AudioTap {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(TapBuffers::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn buffers(&self) -> MutexGuard<'_, TapBuffers> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, samples: &[i16]) {
        let mut buffers = self.buffers();
        if buffers.ended {
            return;
        }
        buffers.recent.extend(samples.iter().copied());
        let excess = buffers.recent.len().saturating_sub(RECENT_CAPACITY);
        buffers.recent.drain(..excess);

        buffers.pending.extend(samples.iter().copied());
        let excess = buffers.pending.len().saturating_sub(PENDING_CAPACITY);
        buffers.pending.drain(..excess);
    }

    /// Copy of the newest `count` samples, zero-padded at the front when
    /// fewer are available.
    pub fn latest(&self, count: usize) -> Vec<i16> {
        let mut out = vec![0i16; count];
        let buffers = self.buffers();
        let available = buffers.recent.len().min(count);
        let skip = buffers.recent.len() - available;
        for (dst, src) in out[count - available..]
            .iter_mut()
            .zip(buffers.recent.iter().skip(skip))
        {
            *dst = *src;
        }
        out
    }

    /// Remove and return the oldest `count` unmixed samples, zero-padded at
    /// the end on underrun.
    pub fn take(&self, count: usize) -> Vec<i16> {
        let mut out = Vec::with_capacity(count);
        {
            let mut buffers = self.buffers();
            let available = buffers.pending.len().min(count);
            out.extend(buffers.pending.drain(..available));
        }
        out.resize(count, 0);
        out
    }

    pub fn end(&self) {
        let mut buffers = self.buffers();
        buffers.ended = true;
        buffers.recent.clear();
        buffers.pending.clear();
    }

    pub fn is_ended(&self) -> bool {
        self.buffers().ended
    }
}

impl std::fmt::Debug for AudioTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTap").field("id", &self.id).finish()
    }
}

/// Zero or one video track plus zero or one audio track of a participant.
#[derive(Debug, Clone, Default)]
pub struct MediaSource {
    pub id: String,
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTap>,
}

impl MediaSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            video: None,
            audio: None,
        }
    }

    pub fn with_video(mut self, track: VideoTrack) -> Self {
        self.video = Some(track);
        self
    }

    pub fn with_audio(mut self, tap: AudioTap) -> Self {
        self.audio = Some(tap);
        self
    }

    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.video.as_ref().and_then(VideoTrack::latest)
    }

    /// End every track; readers observe no further frames or samples.
    pub fn stop(&self) {
        if let Some(video) = &self.video {
            video.end();
        }
        if let Some(audio) = &self.audio {
            audio.end();
        }
    }
}

/// Constraints for acquiring the host's camera and microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    /// Camera index or name; the first camera when unset.
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            device_id: None,
            width: 1280,
            height: 720,
            video: true,
            audio: true,
        }
    }
}

/// Capture backend boundary; failures map to `Error::MediaAcquisition`.
/// [`crate::capture::DeviceCapture`] is the device-backed implementation.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, request: &MediaRequest) -> Result<MediaSource>;
}
