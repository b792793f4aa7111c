//! Frequency-domain level analysis over decoded PCM.

use std::f32::consts::PI;

use crate::AudioTap;

/// Number of frequency bins an analyser reports.
pub const FREQUENCY_BIN_COUNT: usize = 128;
const WINDOW: usize = FREQUENCY_BIN_COUNT * 2;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Source of per-bin magnitudes in the range 0..=255.
pub trait AudioAnalyser: Send {
    fn frequency_bins(&mut self) -> [u8; FREQUENCY_BIN_COUNT];

    /// Mean bin magnitude scaled to 0..=100.
    fn level(&mut self) -> f32 {
        level_of(&self.frequency_bins())
    }
}

/// Mean of `bins` normalized by 255 and scaled to 0..=100.
pub fn level_of(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| u32::from(b)).sum();
    (sum as f32 / bins.len() as f32) / 255.0 * 100.0
}

/// Hann-windowed DFT over the newest samples of an [`AudioTap`], with
/// exponential smoothing across calls.
pub struct PcmAnalyser {
    tap: AudioTap,
    window: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
    smoothed: [f32; FREQUENCY_BIN_COUNT],
}

impl PcmAnalyser {
    pub fn new(tap: AudioTap) -> Self {
        let window = (0..WINDOW)
            .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / WINDOW as f32).cos()))
            .collect();
        let cos = (0..WINDOW)
            .map(|i| (2.0 * PI * i as f32 / WINDOW as f32).cos())
            .collect();
        let sin = (0..WINDOW)
            .map(|i| (2.0 * PI * i as f32 / WINDOW as f32).sin())
            .collect();
        Self {
            tap,
            window,
            cos,
            sin,
            smoothed: [0.0; FREQUENCY_BIN_COUNT],
        }
    }

    pub fn tap(&self) -> &AudioTap {
        &self.tap
    }
}

impl AudioAnalyser for PcmAnalyser {
    fn frequency_bins(&mut self) -> [u8; FREQUENCY_BIN_COUNT] {
        let samples = self.tap.latest(WINDOW);
        let input: Vec<f32> = samples
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| f32::from(s) / 32_768.0 * w)
            .collect();

        let mut bins = [0u8; FREQUENCY_BIN_COUNT];
        for (k, bin) in bins.iter_mut().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (n, x) in input.iter().enumerate() {
                let idx = (k * n) % WINDOW;
                re += x * self.cos[idx];
                im -= x * self.sin[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / WINDOW as f32;
            let smoothed = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[k] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            *bin = scaled.clamp(0.0, 255.0) as u8;
        }
        bins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<i16> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 16) as i16) / 2
            })
            .collect()
    }

    #[test]
    fn test_level_of_bounds() {
        assert_eq!(level_of(&[]), 0.0);
        assert_eq!(level_of(&[0; 8]), 0.0);
        assert!((level_of(&[255; 8]) - 100.0).abs() < 1e-4);
        assert!((level_of(&[0, 255]) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_silence_reads_zero() {
        let tap = AudioTap::new("silent");
        tap.push(&[0; WINDOW]);
        let mut analyser = PcmAnalyser::new(tap);
        assert_eq!(analyser.level(), 0.0);
    }

    #[test]
    fn test_noise_exceeds_default_threshold() {
        let tap = AudioTap::new("loud");
        let mut analyser = PcmAnalyser::new(tap.clone());
        let mut level = 0.0;
        for chunk in noise(WINDOW * 20).chunks(WINDOW) {
            tap.push(chunk);
            level = analyser.level();
        }
        assert!(level > 30.0, "level was {level}");
    }

    #[test]
    fn test_smoothing_decays_after_silence() {
        let tap = AudioTap::new("fade");
        let mut analyser = PcmAnalyser::new(tap.clone());
        for chunk in noise(WINDOW * 10).chunks(WINDOW) {
            tap.push(chunk);
            analyser.level();
        }
        let loud = analyser.level();
        tap.push(&[0; WINDOW]);
        let first_quiet = analyser.level();
        assert!(first_quiet > 0.0);
        assert!(first_quiet <= loud);
    }
}
