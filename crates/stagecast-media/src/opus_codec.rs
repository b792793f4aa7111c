//! Opus backend (mono, 48 kHz, 20 ms frames).

use anyhow::{anyhow, Result};
use opus::{Application, Channels, Decoder as OpusDecoder, Encoder as OpusEncoder};

use crate::{AudioDecoder, AudioEncoder, AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE};

/// Largest Opus frame (120 ms) at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5_760;
const MAX_PACKET_BYTES: usize = 4_000;

pub struct OpusAudioEncoder {
    encoder: OpusEncoder,
}

impl OpusAudioEncoder {
    pub fn new() -> Result<Self> {
        let encoder = OpusEncoder::new(AUDIO_SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| anyhow!("Opus encoder init failed: {}", e))?;
        Ok(Self { encoder })
    }
}

impl AudioEncoder for OpusAudioEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != AUDIO_FRAME_SAMPLES {
            return Err(anyhow!(
                "expected {} samples, got {}",
                AUDIO_FRAME_SAMPLES,
                pcm.len()
            ));
        }
        self.encoder
            .encode_vec(pcm, MAX_PACKET_BYTES)
            .map_err(|e| anyhow!("Opus encode failed: {}", e))
    }
}

pub struct OpusAudioDecoder {
    decoder: OpusDecoder,
    decode_buf: Vec<i16>,
}

impl OpusAudioDecoder {
    pub fn new() -> Result<Self> {
        let decoder = OpusDecoder::new(AUDIO_SAMPLE_RATE, Channels::Mono)
            .map_err(|e| anyhow!("Opus decoder init failed: {}", e))?;
        Ok(Self {
            decoder,
            decode_buf: vec![0i16; MAX_FRAME_SAMPLES],
        })
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let decoded = self
            .decoder
            .decode(packet, &mut self.decode_buf, false)
            .map_err(|e| anyhow!("Opus decode failed: {}", e))?;
        Ok(self.decode_buf[..decoded].to_vec())
    }
}
