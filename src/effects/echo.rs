//! Two-tap echo with damped feedback

use super::{EffectProps, EffectState, alloc_samples, speaker_gains};
use crate::channel::{Channel, MAX_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::filter::{IirFilter, cutoff_cos, lp_coeff_calc};
use crate::math::next_power_of_2;

/// Longest first-tap delay, seconds.
const MAX_DELAY: f32 = 0.207;
/// Longest distance between the taps, seconds.
const MAX_LR_DELAY: f32 = 0.404;

#[derive(Debug, Clone)]
pub struct EchoState {
    samples: Vec<f32>,
    mask: usize,
    /// Distance of each tap behind the write cursor.
    taps: [usize; 2],
    offset: usize,
    /// Panning of the first tap; the second tap uses them swapped.
    gain_l: f32,
    gain_r: f32,
    feed_gain: f32,
    gain: [f32; MAX_CHANNELS],
    filter: IirFilter,
}

impl EchoState {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            mask: 0,
            taps: [0; 2],
            offset: 0,
            gain_l: 0.0,
            gain_r: 0.0,
            feed_gain: 0.0,
            gain: [0.0; MAX_CHANNELS],
            filter: IirFilter::default(),
        }
    }

    /// Tap distances in samples, for inspection.
    pub fn taps(&self) -> [usize; 2] {
        self.taps
    }
}

impl Default for EchoState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectState for EchoState {
    fn device_update(&mut self, device: &DeviceInfo) -> Result<()> {
        let frequency = device.frequency as f32;
        let max_len = next_power_of_2(
            (MAX_DELAY * frequency) as u32 + 1 + (MAX_LR_DELAY * frequency) as u32 + 1,
        ) as usize;
        if max_len != self.samples.len() {
            self.samples = alloc_samples(max_len)?;
        } else {
            self.samples.fill(0.0);
        }
        self.mask = max_len - 1;
        self.gain = speaker_gains(device);
        Ok(())
    }

    fn update(&mut self, device: &DeviceInfo, props: &EffectProps) {
        let EffectProps::Echo(props) = props else {
            return;
        };
        let frequency = device.frequency as f32;

        self.taps[0] = (props.delay * frequency) as usize + 1;
        self.taps[1] = (props.lr_delay * frequency) as usize + self.taps[0];

        let lrpan = props.spread * 0.5 + 0.5;
        self.gain_l = lrpan.sqrt();
        self.gain_r = (1.0 - lrpan).sqrt();

        self.feed_gain = props.feedback;
        self.filter.coeff = lp_coeff_calc(1.0 - props.damping, cutoff_cos(device.frequency));
    }

    fn process(&mut self, slot_gain: f32, input: &[f32], output: &mut [[f32; MAX_CHANNELS]]) {
        let mask = self.mask;
        for (&sample, out) in input.iter().zip(output.iter_mut()) {
            let first = self.samples[self.offset.wrapping_sub(self.taps[0]) & mask];
            let mut left = first * self.gain_l;
            let mut right = first * self.gain_r;

            let second = self.samples[self.offset.wrapping_sub(self.taps[1]) & mask];
            left += second * self.gain_r;
            right += second * self.gain_l;

            let feed = self.filter.lp2p(0, second + sample);
            self.samples[self.offset & mask] = feed * self.feed_gain;
            self.offset = self.offset.wrapping_add(1);

            left *= slot_gain;
            right *= slot_gain;
            for chan in [Channel::FrontLeft, Channel::SideLeft, Channel::BackLeft] {
                out[chan.index()] += self.gain[chan.index()] * left;
            }
            for chan in [Channel::FrontRight, Channel::SideRight, Channel::BackRight] {
                out[chan.index()] += self.gain[chan.index()] * right;
            }
        }
    }
}
