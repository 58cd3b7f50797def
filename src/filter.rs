//! One-pole low-pass building blocks shared by the mixer and the effects

use crate::channel::MAX_CHANNELS;
use crate::error::{Result, check_range};
use crate::math::LOWPASS_FREQ_CUTOFF;
use std::f32::consts::PI;

/// `cos(2π·fc/fs)` for the engine-wide HF cutoff at sample rate `frequency`.
pub fn cutoff_cos(frequency: u32) -> f32 {
    (2.0 * PI * LOWPASS_FREQ_CUTOFF / frequency as f32).cos()
}

/// One-pole coefficient giving linear gain `g` at the frequency whose cosine
/// term is `cw`. A gain of (nearly) 1 yields 0, which passes input unchanged.
pub fn lp_coeff_calc(g: f32, cw: f32) -> f32 {
    let g = g.max(0.01);
    if g < 0.9999 {
        (1.0 - g * cw - (2.0 * g * (1.0 - cw) - g * g * (1.0 - cw * cw)).sqrt()) / (1.0 - g)
    } else {
        0.0
    }
}

/// Cascaded one-pole low-pass with room for a history slot per stage and channel.
///
/// The same history array is addressed three ways: a 4-stage chain at
/// offset 0 (spatialized dry path), a 2-stage chain per input channel at
/// offset `2·i`, and a single stage per input channel at offset `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IirFilter {
    pub coeff: f32,
    pub history: [f32; MAX_CHANNELS * 2],
}

impl Default for IirFilter {
    fn default() -> Self {
        Self {
            coeff: 0.0,
            history: [0.0; MAX_CHANNELS * 2],
        }
    }
}

impl IirFilter {
    #[inline]
    fn run(&mut self, offset: usize, stages: usize, input: f32) -> f32 {
        let a = self.coeff;
        let mut output = input;
        for h in &mut self.history[offset..offset + stages] {
            output += (*h - output) * a;
            *h = output;
        }
        output
    }

    /// Same response as [`run`](Self::run) without touching the history.
    #[inline]
    fn peek(&self, offset: usize, stages: usize, input: f32) -> f32 {
        let a = self.coeff;
        self.history[offset..offset + stages]
            .iter()
            .fold(input, |output, h| output + (h - output) * a)
    }

    #[inline]
    pub fn lp4p(&mut self, offset: usize, input: f32) -> f32 {
        self.run(offset, 4, input)
    }

    #[inline]
    pub fn lp4pc(&self, offset: usize, input: f32) -> f32 {
        self.peek(offset, 4, input)
    }

    #[inline]
    pub fn lp2p(&mut self, offset: usize, input: f32) -> f32 {
        self.run(offset, 2, input)
    }

    #[inline]
    pub fn lp2pc(&self, offset: usize, input: f32) -> f32 {
        self.peek(offset, 2, input)
    }

    #[inline]
    pub fn lp1p(&mut self, offset: usize, input: f32) -> f32 {
        self.run(offset, 1, input)
    }

    #[inline]
    pub fn lp1pc(&self, offset: usize, input: f32) -> f32 {
        self.peek(offset, 1, input)
    }

    pub fn clear_history(&mut self) {
        self.history = [0.0; MAX_CHANNELS * 2];
    }
}

/// Low-pass filter object attached to a source's direct path or to a send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowpassParams {
    gain: f32,
    gain_hf: f32,
}

impl Default for LowpassParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
        }
    }
}

impl LowpassParams {
    pub fn new(gain: f32, gain_hf: f32) -> Result<Self> {
        check_range("lowpass gain", gain, 0.0, 1.0)?;
        check_range("lowpass gain HF", gain_hf, 0.0, 1.0)?;
        Ok(Self { gain, gain_hf })
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn gain_hf(&self) -> f32 {
        self.gain_hf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn unity_gain_is_pass_through() {
        let cw = cutoff_cos(44100);
        assert_eq!(lp_coeff_calc(1.0, cw), 0.0);

        let mut filter = IirFilter::default();
        filter.coeff = lp_coeff_calc(1.0, cw);
        for x in [0.5, -0.25, 1.0, 0.0] {
            assert_eq!(filter.lp4p(0, x), x);
        }
    }

    #[test]
    fn coefficient_is_stable_under_recalculation() {
        let cw = cutoff_cos(48000);
        let a = lp_coeff_calc(0.3, cw);
        let b = lp_coeff_calc(0.3, cw);
        assert_eq!(a.to_bits(), b.to_bits());
        assert!(a > 0.0 && a < 1.0);
    }

    #[test]
    fn gain_floor_keeps_coefficient_finite() {
        let cw = cutoff_cos(22050);
        let zero = lp_coeff_calc(0.0, cw);
        assert!(zero.is_finite());
        assert_eq!(zero, lp_coeff_calc(0.01, cw));
    }

    #[test]
    fn lower_gain_means_heavier_filtering() {
        let cw = cutoff_cos(44100);
        assert!(lp_coeff_calc(0.2, cw) > lp_coeff_calc(0.8, cw));
    }

    #[test]
    fn dc_settles_to_input() {
        let mut filter = IirFilter {
            coeff: lp_coeff_calc(0.25, cutoff_cos(44100)),
            ..Default::default()
        };
        let mut out = 0.0;
        for _ in 0..10_000 {
            out = filter.lp2p(4, 1.0);
        }
        assert_relative_eq!(out, 1.0, epsilon = 1e-4);
        // stages outside offset 4..6 are untouched
        assert_eq!(filter.history[0], 0.0);
        assert_eq!(filter.history[6], 0.0);
    }

    #[test]
    fn peek_matches_run_without_side_effects() {
        let mut filter = IirFilter {
            coeff: 0.4,
            ..Default::default()
        };
        filter.lp4p(0, 1.0);
        let before = filter.history;
        let peeked = filter.lp4pc(0, 0.5);
        assert_eq!(filter.history, before);
        assert_eq!(peeked, filter.lp4p(0, 0.5));
    }

    #[test]
    fn lowpass_params_validate() {
        assert!(LowpassParams::new(0.5, 0.5).is_ok());
        assert!(LowpassParams::new(1.5, 0.5).is_err());
        assert!(LowpassParams::new(0.5, -0.1).is_err());
    }
}
