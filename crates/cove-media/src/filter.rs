use std::f32::consts::PI;
use std::fmt::{Display, Formatter};

const DEEP_CUTOFF_HZ: f32 = 500.0;
const DEEP_GAIN: f32 = 1.6;
const ROBOT_CARRIER_HZ: f32 = 90.0;
// Fraction of dry signal blended into the ring-modulated output so
// speech stays intelligible.
const ROBOT_DRY_MIX: f32 = 0.15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VoiceFilterMode {
    #[default]
    Normal,
    Deep,
    Robot,
}

impl Display for VoiceFilterMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Deep => f.write_str("deep"),
            Self::Robot => f.write_str("robot"),
        }
    }
}

/// In-path transform over captured mono i16 PCM, applied before frames
/// reach the transport. Video tracks are not routed through here; they
/// pass to the endpoint untouched.
///
/// Switching modes rebuilds the processing state from scratch, so a
/// frame never mixes residue from the previous mode.
#[derive(Debug, Clone)]
pub struct VoiceFilterChain {
    mode: VoiceFilterMode,
    sample_rate: u32,
    lowpass_state: f32,
    carrier_phase: f32,
}

impl VoiceFilterChain {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            mode: VoiceFilterMode::Normal,
            sample_rate,
            lowpass_state: 0.0,
            carrier_phase: 0.0,
        }
    }

    pub fn mode(&self) -> VoiceFilterMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: VoiceFilterMode) {
        self.mode = mode;
        self.lowpass_state = 0.0;
        self.carrier_phase = 0.0;
    }

    pub fn process_frame(&mut self, pcm: &[i16]) -> Vec<i16> {
        match self.mode {
            VoiceFilterMode::Normal => pcm.to_vec(),
            VoiceFilterMode::Deep => self.process_deep(pcm),
            VoiceFilterMode::Robot => self.process_robot(pcm),
        }
    }

    /// One-pole low-pass plus gain boost, clamped back into i16 range.
    fn process_deep(&mut self, pcm: &[i16]) -> Vec<i16> {
        let alpha = 1.0 - (-2.0 * PI * DEEP_CUTOFF_HZ / self.sample_rate as f32).exp();
        pcm.iter()
            .map(|&sample| {
                self.lowpass_state += alpha * (sample as f32 - self.lowpass_state);
                clamp_i16(self.lowpass_state * DEEP_GAIN)
            })
            .collect()
    }

    /// Ring modulation against a sine carrier, with a small dry blend.
    fn process_robot(&mut self, pcm: &[i16]) -> Vec<i16> {
        let step = 2.0 * PI * ROBOT_CARRIER_HZ / self.sample_rate as f32;
        pcm.iter()
            .map(|&sample| {
                let carrier = self.carrier_phase.sin();
                self.carrier_phase += step;
                if self.carrier_phase > 2.0 * PI {
                    self.carrier_phase -= 2.0 * PI;
                }
                let dry = sample as f32;
                clamp_i16(dry * carrier * (1.0 - ROBOT_DRY_MIX) + dry * ROBOT_DRY_MIX)
            })
            .collect()
    }
}

fn clamp_i16(sample: f32) -> i16 {
    sample.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
