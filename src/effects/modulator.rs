//! Ring modulator

use super::{EffectProps, EffectState, Waveform, speaker_gains};
use crate::channel::{Channel, MAX_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use std::f64::consts::TAU;

const WAVEFORM_FRAC_BITS: u32 = 16;
const WAVEFORM_FRAC_ONE: u32 = 1 << WAVEFORM_FRAC_BITS;
const WAVEFORM_FRAC_MASK: u32 = WAVEFORM_FRAC_ONE - 1;

#[derive(Debug, Clone)]
pub struct ModulatorState {
    waveform: Waveform,
    /// Phase in 16-bit fixed point.
    index: u32,
    step: u32,
    gain: [f32; MAX_CHANNELS],
    hp_coeff: f32,
    hp_history: f32,
}

impl ModulatorState {
    pub fn new() -> Self {
        Self {
            waveform: Waveform::Sinusoid,
            index: 0,
            step: 1,
            gain: [0.0; MAX_CHANNELS],
            hp_coeff: 0.0,
            hp_history: 0.0,
        }
    }

    #[inline]
    fn wave(&self, index: u32) -> f32 {
        match self.waveform {
            Waveform::Sinusoid => (index as f64 / WAVEFORM_FRAC_ONE as f64 * TAU).sin() as f32,
            Waveform::Sawtooth => (index * 2) as f32 / WAVEFORM_FRAC_ONE as f32 - 1.0,
            Waveform::Square => {
                if (index >> (WAVEFORM_FRAC_BITS - 1)) & 1 != 0 {
                    -1.0
                } else {
                    1.0
                }
            }
        }
    }

    /// One-pole high-pass: the input minus its low-passed copy.
    #[inline]
    fn high_pass(&mut self, input: f32) -> f32 {
        let low = input + (self.hp_history - input) * self.hp_coeff;
        self.hp_history = low;
        input - low
    }
}

impl Default for ModulatorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectState for ModulatorState {
    fn device_update(&mut self, device: &DeviceInfo) -> Result<()> {
        self.gain = speaker_gains(device);
        Ok(())
    }

    fn update(&mut self, device: &DeviceInfo, props: &EffectProps) {
        let EffectProps::Modulator(props) = props else {
            return;
        };
        let frequency = device.frequency as f32;

        self.waveform = props.waveform;
        self.step = ((props.frequency * WAVEFORM_FRAC_ONE as f32 / frequency) as u32).max(1);

        let cw = (std::f32::consts::TAU * props.high_pass_cutoff / frequency).cos();
        self.hp_coeff = (2.0 - cw) - ((2.0 - cw) * (2.0 - cw) - 1.0).sqrt();
    }

    fn process(&mut self, slot_gain: f32, input: &[f32], output: &mut [[f32; MAX_CHANNELS]]) {
        let fl = Channel::FrontLeft.index();
        let fr = Channel::FrontRight.index();
        for (&sample, out) in input.iter().zip(output.iter_mut()) {
            self.index = (self.index + self.step) & WAVEFORM_FRAC_MASK;
            let modulated = sample * self.wave(self.index);
            let filtered = self.high_pass(modulated) * slot_gain;

            // only the front pair is modulated
            out[fl] += self.gain[fl] * filtered;
            out[fr] += self.gain[fr] * filtered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DevChannels;
    use crate::config::PetalSonicDeviceDesc;
    use crate::effects::ModulatorProps;
    use approx::assert_relative_eq;

    fn modulator(desc: PetalSonicDeviceDesc, props: ModulatorProps) -> ModulatorState {
        let device = DeviceInfo::new(&desc).unwrap();
        let mut state = ModulatorState::new();
        state.device_update(&device).unwrap();
        state.update(&device, &EffectProps::Modulator(props));
        state
    }

    #[test]
    fn square_wave_at_quarter_rate() {
        let props = ModulatorProps {
            frequency: 4000.0,
            high_pass_cutoff: 0.0,
            waveform: Waveform::Square,
        };
        let mut state = modulator(PetalSonicDeviceDesc::default().frequency(16000), props);
        assert_eq!(state.step, 16384);

        let input = [1.0; 8];
        let mut output = [[0.0; MAX_CHANNELS]; 8];
        state.process(1.0, &input, &mut output);
        let left: Vec<f32> = output.iter().map(|f| f[Channel::FrontLeft.index()]).collect();
        assert_eq!(left, vec![1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0]);
        assert!(output.iter().all(|f| f[Channel::FrontCenter.index()] == 0.0));
    }

    #[test]
    fn sawtooth_ramps() {
        let props = ModulatorProps {
            frequency: 1000.0,
            high_pass_cutoff: 0.0,
            waveform: Waveform::Sawtooth,
        };
        let mut state = modulator(PetalSonicDeviceDesc::default().frequency(8000), props);
        let input = [0.5; 4];
        let mut output = [[0.0; MAX_CHANNELS]; 4];
        state.process(2.0, &input, &mut output);
        // index steps by 8192: -0.75, -0.5, -0.25, 0.0 scaled by 0.5 * 2
        let expected = [-0.75, -0.5, -0.25, 0.0];
        for (frame, want) in output.iter().zip(expected) {
            assert_relative_eq!(frame[Channel::FrontRight.index()], want, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_frequency_still_advances() {
        let props = ModulatorProps {
            frequency: 0.0,
            ..Default::default()
        };
        let state = modulator(PetalSonicDeviceDesc::default(), props);
        assert_eq!(state.step, 1);
    }

    #[test]
    fn high_pass_removes_dc() {
        let props = ModulatorProps {
            frequency: 0.0,
            high_pass_cutoff: 800.0,
            waveform: Waveform::Square,
        };
        let mut state = modulator(PetalSonicDeviceDesc::default(), props);
        let input = vec![1.0; 20_000];
        let mut output = vec![[0.0; MAX_CHANNELS]; input.len()];
        state.process(1.0, &input, &mut output);
        assert!(output[0][Channel::FrontLeft.index()] > 0.5);
        assert!(output[19_999][Channel::FrontLeft.index()].abs() < 1e-3);
    }

    #[test]
    fn mono_device_gets_nothing() {
        let props = ModulatorProps {
            high_pass_cutoff: 0.0,
            waveform: Waveform::Square,
            ..Default::default()
        };
        let desc = PetalSonicDeviceDesc::default().channels(DevChannels::Mono);
        let mut state = modulator(desc, props);
        let input = [1.0; 16];
        let mut output = [[0.0; MAX_CHANNELS]; 16];
        state.process(1.0, &input, &mut output);
        assert!(output.iter().flatten().all(|&s| s == 0.0));
    }
}
