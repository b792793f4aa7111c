//! Codec selection. Backends are compiled in through cargo features; when a
//! backend is missing the factory returns `None` and callers degrade (guest
//! video renders as a placeholder, the composite is not encoded).

use tracing::debug;

use crate::{AudioDecoder, AudioEncoder, Codec, Decoder, EncodeConfig, Encoder};

pub fn video_encoder(config: &EncodeConfig) -> Option<Box<dyn Encoder>> {
    match config.codec {
        #[cfg(feature = "h264")]
        Codec::H264 => match crate::h264::H264Encoder::new(config) {
            Ok(encoder) => Some(Box::new(encoder)),
            Err(e) => {
                tracing::warn!("H.264 encoder unavailable: {}", e);
                None
            }
        },
        other => {
            debug!("no video encoder compiled in for {:?}", other);
            None
        }
    }
}

pub fn video_decoder(codec: Codec) -> Option<Box<dyn Decoder>> {
    match codec {
        #[cfg(feature = "h264")]
        Codec::H264 => match crate::h264::H264Decoder::new() {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(e) => {
                tracing::warn!("H.264 decoder unavailable: {}", e);
                None
            }
        },
        other => {
            debug!("no video decoder compiled in for {:?}", other);
            None
        }
    }
}

pub fn audio_encoder() -> Option<Box<dyn AudioEncoder>> {
    #[cfg(feature = "opus-support")]
    {
        match crate::opus_codec::OpusAudioEncoder::new() {
            Ok(encoder) => return Some(Box::new(encoder)),
            Err(e) => tracing::warn!("Opus encoder unavailable: {}", e),
        }
    }
    None
}

pub fn audio_decoder() -> Option<Box<dyn AudioDecoder>> {
    #[cfg(feature = "opus-support")]
    {
        match crate::opus_codec::OpusAudioDecoder::new() {
            Ok(decoder) => return Some(Box::new(decoder)),
            Err(e) => tracing::warn!("Opus decoder unavailable: {}", e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vp8_has_no_backend() {
        assert!(video_decoder(Codec::Vp8).is_none());
        assert!(video_decoder(Codec::Opus).is_none());
    }

    #[cfg(not(feature = "h264"))]
    #[test]
    fn test_h264_absent_without_feature() {
        assert!(video_decoder(Codec::H264).is_none());
    }
}
