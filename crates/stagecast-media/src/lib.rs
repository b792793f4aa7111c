#![forbid(unsafe_code)]

use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub mod analyser;
pub mod capture;
pub mod codecs;
pub mod mixer;
pub mod track;

#[cfg(feature = "h264")]
mod h264;
#[cfg(feature = "opus-support")]
mod opus_codec;

pub use analyser::{AudioAnalyser, PcmAnalyser, FREQUENCY_BIN_COUNT};
pub use capture::DeviceCapture;
pub use mixer::AudioMixer;
pub use track::{AudioTap, MediaDevices, MediaRequest, MediaSource, VideoTrack};

/// PCM sample rate used for every decoded and mixed audio buffer (mono).
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
/// Samples in one 20 ms audio frame at [`AUDIO_SAMPLE_RATE`].
pub const AUDIO_FRAME_SAMPLES: usize = 960;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Codec {
    H264,
    Vp8,
    Opus,
}

impl Codec {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "video/h264" => Some(Self::H264),
            "video/vp8" => Some(Self::Vp8),
            "audio/opus" => Some(Self::Opus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A decoded RGBA video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub timestamp_us: u64,
    pub image: RgbaImage,
}

impl VideoFrame {
    pub fn new(image: RgbaImage, timestamp_us: u64) -> Self {
        Self {
            timestamp_us,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeConfig {
    pub codec: Codec,
    pub resolution: Resolution,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

pub trait Encoder: Send {
    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame>;
}

pub trait Decoder: Send {
    /// Decode one access unit. `Ok(None)` means the decoder needs more data.
    fn decode(&mut self, payload: &[u8], timestamp_us: u64) -> Result<Option<VideoFrame>>;
}

pub trait AudioEncoder: Send {
    /// Encode exactly [`AUDIO_FRAME_SAMPLES`] mono samples.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>>;
}
