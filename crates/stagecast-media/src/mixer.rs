use crate::{AudioTap, AUDIO_FRAME_SAMPLES};

/// Sums the pending audio of every input into 20 ms mono frames.
#[derive(Debug, Default)]
pub struct AudioMixer {
    inputs: Vec<AudioTap>,
}

impl AudioMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, tap: AudioTap) {
        if self.inputs.iter().any(|t| t.id() == tap.id()) {
            return;
        }
        self.inputs.push(tap);
    }

    /// Replace the input set, keeping taps whose id is unchanged.
    pub fn set_inputs(&mut self, taps: impl IntoIterator<Item = AudioTap>) {
        let taps: Vec<AudioTap> = taps.into_iter().collect();
        self.inputs.retain(|t| taps.iter().any(|n| n.id() == t.id()));
        for tap in taps {
            self.add_input(tap);
        }
    }

    /// Drain one frame from each live input and sum with saturation.
    pub fn mix_frame(&mut self) -> Vec<i16> {
        self.inputs.retain(|t| !t.is_ended());
        let mut acc = vec![0i32; AUDIO_FRAME_SAMPLES];
        for tap in &self.inputs {
            for (sum, sample) in acc.iter_mut().zip(tap.take(AUDIO_FRAME_SAMPLES)) {
                *sum += i32::from(sample);
            }
        }
        acc.into_iter()
            .map(|s| s.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
            .collect()
    }
}
