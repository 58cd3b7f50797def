//! Feedback-delay-network reverb, in standard and EAX flavours
//!
//! The input is low-passed, optionally modulated, and written to an initial
//! delay line. Two taps off that line feed the early reflections (a four
//! line Householder junction) and the late reverb (four damped, all-passed
//! delay lines coupled by a skew-symmetric rotation matrix). The EAX flavour
//! adds an echo line mixed into the late outputs and pans early and late
//! output separately.
//!
//! All delay lines live in one shared sample buffer and are addressed with a
//! single running offset, so every line length is a power of two.

use super::{EffectProps, EffectState, ReverbProps, alloc_samples, speaker_gains};
use crate::channel::{Channel, MAX_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::filter::{IirFilter, lp_coeff_calc};
use crate::math::{SPEED_OF_SOUND_METRES_PER_SEC, Vec3, lerp, next_power_of_2};
use crate::panning::cart_to_lut_pos;
use std::f32::consts::TAU;

const MAX_REFLECTIONS_DELAY: f32 = 0.3;
const MAX_LATE_REVERB_DELAY: f32 = 0.1;
const MAX_ECHO_TIME: f32 = 0.25;
const MAX_MODULATION_TIME: f32 = 4.0;

const MODULATION_DEPTH_COEFF: f32 = 0.1;
const MODULATION_FILTER_COEFF: f32 = 0.048;
const MODULATION_FILTER_CONST: f32 = 100_000.0;

const ECHO_ALLPASS_LENGTH: f32 = 0.0133;
const DECO_FRACTION: f32 = 0.15;
const DECO_MULTIPLIER: f32 = 2.0;

const EARLY_LINE_LENGTH: [f32; 4] = [0.0015, 0.0045, 0.0135, 0.0405];
const ALLPASS_LINE_LENGTH: [f32; 4] = [0.0151, 0.0167, 0.0183, 0.0200];
const LATE_LINE_LENGTH: [f32; 4] = [0.0211, 0.0311, 0.0461, 0.0680];
const LATE_LINE_MULTIPLIER: f32 = 4.0;

/// A power-of-two window into the shared sample buffer.
#[derive(Debug, Clone, Copy, Default)]
struct DelayLine {
    start: usize,
    mask: usize,
}

impl DelayLine {
    #[inline]
    fn read(&self, samples: &[f32], offset: usize) -> f32 {
        samples[self.start + (offset & self.mask)]
    }

    #[inline]
    fn write(&self, samples: &mut [f32], offset: usize, value: f32) {
        samples[self.start + (offset & self.mask)] = value;
    }
}

/// Hands out consecutive delay lines while counting the total size.
struct LineLayout {
    frequency: f32,
    total: usize,
}

impl LineLayout {
    fn line(&mut self, seconds: f32) -> DelayLine {
        let len = next_power_of_2((seconds * self.frequency) as u32 + 1) as usize;
        let line = DelayLine {
            start: self.total,
            mask: len - 1,
        };
        self.total += len;
        line
    }
}

#[derive(Debug, Clone, Default)]
struct Modulation {
    delay: DelayLine,
    index: u32,
    range: u32,
    depth: f32,
    coeff: f32,
    filter: f32,
}

#[derive(Debug, Clone, Default)]
struct Early {
    gain: f32,
    coeff: [f32; 4],
    delay: [DelayLine; 4],
    offset: [usize; 4],
    pan_gain: [f32; MAX_CHANNELS],
}

#[derive(Debug, Clone, Default)]
struct Late {
    gain: f32,
    /// Attenuates the decorrelator input to match the lines' energy.
    density_gain: f32,
    /// `y / x` of the rotation matrix.
    mix_coeff: f32,

    ap_feed_coeff: f32,
    ap_coeff: [f32; 4],
    ap_delay: [DelayLine; 4],
    ap_offset: [usize; 4],

    coeff: [f32; 4],
    delay: [DelayLine; 4],
    offset: [usize; 4],

    lp_coeff: [f32; 4],
    lp_sample: [f32; 4],

    pan_gain: [f32; MAX_CHANNELS],
}

#[derive(Debug, Clone, Default)]
struct Echo {
    delay: DelayLine,
    offset: usize,
    coeff: f32,
    density_gain: f32,
    mix_coeff: [f32; 2],

    ap_delay: DelayLine,
    ap_offset: usize,
    ap_feed_coeff: f32,
    ap_coeff: f32,

    lp_coeff: f32,
    lp_sample: f32,
}

#[derive(Debug, Clone)]
pub struct ReverbState {
    eax: bool,
    samples: Vec<f32>,
    lp_filter: IirFilter,
    modulation: Modulation,
    delay: DelayLine,
    delay_tap: [usize; 2],
    early: Early,
    decorrelator: DelayLine,
    deco_tap: [usize; 3],
    late: Late,
    echo: Echo,
    /// Speaker gains of the standard reverb.
    gain: [f32; MAX_CHANNELS],
    offset: usize,
}

impl ReverbState {
    pub fn new(eax: bool) -> Self {
        Self {
            eax,
            samples: Vec::new(),
            lp_filter: IirFilter::default(),
            modulation: Modulation {
                range: 1,
                ..Default::default()
            },
            delay: DelayLine::default(),
            delay_tap: [0; 2],
            early: Early::default(),
            decorrelator: DelayLine::default(),
            deco_tap: [0; 3],
            late: Late::default(),
            echo: Echo::default(),
            gain: [0.0; MAX_CHANNELS],
            offset: 0,
        }
    }

    pub fn is_eax(&self) -> bool {
        self.eax
    }

    /// Lays out every delay line for `frequency` and (re)allocates the shared
    /// buffer when its size changes. The buffer is always cleared.
    fn alloc_lines(&mut self, frequency: u32) -> Result<()> {
        let mut layout = LineLayout {
            frequency: frequency as f32,
            total: 0,
        };

        if self.eax {
            let length =
                MAX_MODULATION_TIME * MODULATION_DEPTH_COEFF / 2.0 + 1.0 / frequency as f32;
            self.modulation.delay = layout.line(length);
        }
        self.delay = layout.line(MAX_REFLECTIONS_DELAY + MAX_LATE_REVERB_DELAY);
        for (line, &length) in self.early.delay.iter_mut().zip(&EARLY_LINE_LENGTH) {
            *line = layout.line(length);
        }
        self.decorrelator = layout.line(
            DECO_FRACTION
                * DECO_MULTIPLIER
                * DECO_MULTIPLIER
                * LATE_LINE_LENGTH[0]
                * (1.0 + LATE_LINE_MULTIPLIER),
        );
        for (line, &length) in self.late.ap_delay.iter_mut().zip(&ALLPASS_LINE_LENGTH) {
            *line = layout.line(length);
        }
        for (line, &length) in self.late.delay.iter_mut().zip(&LATE_LINE_LENGTH) {
            *line = layout.line(length * (1.0 + LATE_LINE_MULTIPLIER));
        }
        if self.eax {
            self.echo.ap_delay = layout.line(ECHO_ALLPASS_LENGTH);
            self.echo.delay = layout.line(MAX_ECHO_TIME);
        }

        if layout.total != self.samples.len() {
            self.samples = alloc_samples(layout.total)?;
        } else {
            self.samples.fill(0.0);
        }
        Ok(())
    }

    fn update_modulator(&mut self, mod_time: f32, mod_depth: f32, frequency: f32) {
        let length = mod_time * frequency;
        if length >= 1.0 {
            // keep the phase when the period changes
            self.modulation.index =
                (self.modulation.index as f32 * length / self.modulation.range as f32) as u32;
            self.modulation.range = length as u32;
        } else {
            self.modulation.index = 0;
            self.modulation.range = 1;
        }
        self.modulation.depth =
            mod_depth * MODULATION_DEPTH_COEFF * mod_time / 2.0 / 2.0 * frequency;
    }

    fn update_delay_line(&mut self, reflections_delay: f32, late_delay: f32, frequency: f32) {
        self.delay_tap[0] = (reflections_delay * frequency) as usize;
        self.delay_tap[1] = ((reflections_delay + late_delay) * frequency) as usize;
    }

    fn update_early_lines(&mut self, gain: f32, reflections_gain: f32, late_delay: f32) {
        self.early.gain = 0.5 * gain * reflections_gain;
        for (coeff, &length) in self.early.coeff.iter_mut().zip(&EARLY_LINE_LENGTH) {
            *coeff = decay_coeff(length, late_delay);
        }
    }

    fn update_decorrelator(&mut self, density: f32, frequency: f32) {
        for (i, tap) in self.deco_tap.iter_mut().enumerate() {
            let length = DECO_FRACTION
                * DECO_MULTIPLIER.powi(i as i32)
                * LATE_LINE_LENGTH[0]
                * (1.0 + density * LATE_LINE_MULTIPLIER);
            *tap = (length * frequency) as usize;
        }
    }

    fn update_late_lines(&mut self, props: &ReverbProps, x: f32, hf_ratio: f32, cw: f32, frequency: f32) {
        let late = &mut self.late;
        let density_scale = 1.0 + props.density * LATE_LINE_MULTIPLIER;

        late.gain = props.gain * props.late_reverb_gain * x;

        let average = LATE_LINE_LENGTH.iter().sum::<f32>() / 4.0 * density_scale;
        late.density_gain = density_gain(decay_coeff(average, props.decay_time));

        late.ap_feed_coeff = 0.5 * props.diffusion * props.diffusion;

        for i in 0..4 {
            late.ap_coeff[i] = decay_coeff(ALLPASS_LINE_LENGTH[i], props.decay_time);

            let length = LATE_LINE_LENGTH[i] * density_scale;
            late.offset[i] = (length * frequency) as usize;
            late.coeff[i] = decay_coeff(length, props.decay_time);
            late.lp_coeff[i] =
                damping_coeff(hf_ratio, length, props.decay_time, late.coeff[i], cw);
            // the diagonal of the mixing matrix rides on the line coefficients
            late.coeff[i] *= x;
        }
    }

    fn update_echo_line(&mut self, props: &ReverbProps, hf_ratio: f32, cw: f32, frequency: f32) {
        let echo = &mut self.echo;
        echo.offset = (props.echo_time * frequency) as usize;
        echo.coeff = decay_coeff(props.echo_time, props.decay_time);
        echo.density_gain = density_gain(echo.coeff);
        echo.ap_feed_coeff = 0.5 * props.diffusion * props.diffusion;
        echo.ap_coeff = decay_coeff(ECHO_ALLPASS_LENGTH, props.decay_time);
        echo.lp_coeff =
            damping_coeff(hf_ratio, props.echo_time, props.decay_time, echo.coeff, cw);
        echo.mix_coeff = [
            props.gain * props.late_reverb_gain * props.echo_depth,
            1.0 - props.echo_depth * 0.5 * (1.0 - props.diffusion),
        ];
    }

    fn update_3d_panning(&mut self, device: &DeviceInfo, reflections_pan: Vec3, late_pan: Vec3) {
        self.early.pan_gain = pan_gains(device, reflections_pan);
        self.late.pan_gain = pan_gains(device, late_pan);
    }

    fn modulate(&mut self, input: f32) -> f32 {
        let m = &mut self.modulation;
        let sinus = 1.0 - (TAU * m.index as f32 / m.range as f32).cos();

        // smooth depth changes so they do not click
        m.filter = lerp(m.filter, m.depth, m.coeff);

        let mut frac = 1.0 + m.filter * sinus;
        let whole = frac as usize;
        frac -= whole as f32;

        let out0 = m.delay.read(&self.samples, self.offset.wrapping_sub(whole));
        let out1 = m.delay.read(&self.samples, self.offset.wrapping_sub(whole + 1));
        m.delay.write(&mut self.samples, self.offset, input);

        m.index = (m.index + 1) % m.range;
        lerp(out0, out1, frac)
    }

    fn early_reflection(&mut self, input: f32) -> [f32; 4] {
        let offset = self.offset;
        let mut d = [0.0; 4];
        for i in 0..4 {
            d[i] = self.early.coeff[i]
                * self.early.delay[i]
                    .read(&self.samples, offset.wrapping_sub(self.early.offset[i]));
        }

        // lossless scattering junction: v = 2/N * sum(d), loaded with the input
        let v = (d[0] + d[1] + d[2] + d[3]) * 0.5 + input;

        let mut out = [0.0; 4];
        for i in 0..4 {
            let feed = v - d[i];
            self.early.delay[i].write(&mut self.samples, offset, feed);
            out[i] = self.early.gain * feed;
        }
        out
    }

    #[inline]
    fn late_delay_out(&self, index: usize) -> f32 {
        self.late.coeff[index]
            * self.late.delay[index].read(
                &self.samples,
                self.offset.wrapping_sub(self.late.offset[index]),
            )
    }

    #[inline]
    fn late_low_pass(&mut self, index: usize, input: f32) -> f32 {
        let out = lerp(input, self.late.lp_sample[index], self.late.lp_coeff[index]);
        self.late.lp_sample[index] = out;
        out
    }

    fn late_reverb(&mut self, input: [f32; 4]) -> [f32; 4] {
        // the feedback cycles 0 -> 1 -> 3 -> 2 -> 0
        let mut d = [0.0; 4];
        for (slot, line) in [(0, 2), (1, 0), (2, 3), (3, 1)] {
            let fed = input[line] + self.late_delay_out(line);
            d[slot] = self.late_low_pass(line, fed);
        }

        for (i, value) in d.iter_mut().enumerate() {
            *value = allpass_in_out(
                &mut self.samples,
                self.late.ap_delay[i],
                self.offset.wrapping_sub(self.late.ap_offset[i]),
                self.offset,
                *value,
                self.late.ap_feed_coeff,
                self.late.ap_coeff[i],
            );
        }

        let m = self.late.mix_coeff;
        let f = [
            d[0] + m * (d[1] - d[2] + d[3]),
            d[1] + m * (-d[0] + d[2] + d[3]),
            d[2] + m * (d[0] - d[1] + d[3]),
            d[3] + m * (-d[0] - d[1] - d[2]),
        ];

        let mut out = [0.0; 4];
        for i in 0..4 {
            out[i] = self.late.gain * f[i];
            self.late.delay[i].write(&mut self.samples, self.offset, f[i]);
        }
        out
    }

    fn eax_echo(&mut self, input: f32, late: &mut [f32; 4]) {
        let offset = self.offset;
        let echo = &mut self.echo;

        let mut feed =
            echo.coeff * echo.delay.read(&self.samples, offset.wrapping_sub(echo.offset));

        let out = echo.mix_coeff[0] * feed;
        for value in late.iter_mut() {
            *value = echo.mix_coeff[1] * *value + out;
        }

        feed += echo.density_gain * input;
        feed = lerp(feed, echo.lp_sample, echo.lp_coeff);
        echo.lp_sample = feed;

        feed = allpass_in_out(
            &mut self.samples,
            echo.ap_delay,
            offset.wrapping_sub(echo.ap_offset),
            offset,
            feed,
            echo.ap_feed_coeff,
            echo.ap_coeff,
        );

        echo.delay.write(&mut self.samples, offset, feed);
    }

    /// Runs one input sample through the network, returning the early and
    /// late four-channel outputs.
    fn pass(&mut self, input: f32) -> ([f32; 4], [f32; 4]) {
        let mut input = self.lp_filter.lp2p(0, input);
        if self.eax {
            input = self.modulate(input);
        }

        self.delay.write(&mut self.samples, self.offset, input);

        let early_in = self
            .delay
            .read(&self.samples, self.offset.wrapping_sub(self.delay_tap[0]));
        let early = self.early_reflection(early_in);

        let late_in = self
            .delay
            .read(&self.samples, self.offset.wrapping_sub(self.delay_tap[1]));
        let feed = late_in * self.late.density_gain;
        self.decorrelator.write(&mut self.samples, self.offset, feed);

        let mut taps = [feed, 0.0, 0.0, 0.0];
        for (tap, &distance) in taps[1..].iter_mut().zip(&self.deco_tap) {
            *tap = self
                .decorrelator
                .read(&self.samples, self.offset.wrapping_sub(distance));
        }
        let mut late = self.late_reverb(taps);

        if self.eax {
            self.eax_echo(late_in, &mut late);
        }

        self.offset = self.offset.wrapping_add(1);
        (early, late)
    }
}

impl EffectState for ReverbState {
    fn device_update(&mut self, device: &DeviceInfo) -> Result<()> {
        let frequency = device.frequency as f32;
        self.alloc_lines(device.frequency)?;

        for i in 0..4 {
            self.early.offset[i] = (EARLY_LINE_LENGTH[i] * frequency) as usize;
            self.late.ap_offset[i] = (ALLPASS_LINE_LENGTH[i] * frequency) as usize;
        }

        if self.eax {
            // same filter response over time at any rate
            self.modulation.coeff =
                MODULATION_FILTER_COEFF.powf(MODULATION_FILTER_CONST / frequency);
            self.echo.ap_offset = (ECHO_ALLPASS_LENGTH * frequency) as usize;
        } else {
            self.gain = speaker_gains(device);
        }
        Ok(())
    }

    fn update(&mut self, device: &DeviceInfo, props: &EffectProps) {
        let props = match (self.eax, props) {
            (false, EffectProps::Reverb(props)) | (true, EffectProps::EaxReverb(props)) => props,
            _ => return,
        };
        let frequency = device.frequency as f32;

        let cw = i3dl2_hf_cos(props.hf_reference, frequency);
        // two chained one-pole stages, so the gain is not squared
        self.lp_filter.coeff = lp_coeff_calc(props.gain_hf, cw);

        if self.eax {
            self.update_modulator(props.modulation_time, props.modulation_depth, frequency);
        }
        self.update_delay_line(props.reflections_delay, props.late_reverb_delay, frequency);
        self.update_early_lines(props.gain, props.reflections_gain, props.late_reverb_delay);
        self.update_decorrelator(props.density, frequency);

        let (x, y) = matrix_coeffs(props.diffusion);
        self.late.mix_coeff = y / x;

        let mut hf_ratio = props.decay_hf_ratio;
        if props.decay_hf_limit && props.air_absorption_gain_hf < 1.0 {
            hf_ratio = limited_hf_ratio(hf_ratio, props.air_absorption_gain_hf, props.decay_time);
        }

        self.update_late_lines(props, x, hf_ratio, cw, frequency);

        if self.eax {
            self.update_echo_line(props, hf_ratio, cw, frequency);
            self.update_3d_panning(device, props.reflections_pan, props.late_reverb_pan);
        }
    }

    fn process(&mut self, slot_gain: f32, input: &[f32], output: &mut [[f32; MAX_CHANNELS]]) {
        use Channel::*;
        for (&sample, out) in input.iter().zip(output.iter_mut()) {
            let (early, late) = self.pass(sample);

            if self.eax {
                let ep = &self.early.pan_gain;
                let lp = &self.late.pan_gain;
                for (chan, k) in [
                    (FrontLeft, 0),
                    (FrontRight, 1),
                    (FrontCenter, 3),
                    (SideLeft, 0),
                    (SideRight, 1),
                    (BackLeft, 0),
                    (BackRight, 1),
                    (BackCenter, 2),
                ] {
                    let c = chan.index();
                    out[c] += (ep[c] * early[k] + lp[c] * late[k]) * slot_gain;
                }
            } else {
                let mixed: [f32; 4] = std::array::from_fn(|k| (early[k] + late[k]) * slot_gain);
                for (chan, k) in [
                    (FrontLeft, 0),
                    (FrontRight, 1),
                    (FrontCenter, 3),
                    (SideLeft, 0),
                    (SideRight, 1),
                    (BackLeft, 0),
                    (BackRight, 1),
                    (BackCenter, 2),
                ] {
                    let c = chan.index();
                    out[c] += self.gain[c] * mixed[k];
                }
            }
        }
    }
}

/// Gain that brings a signal to -60 dB after `decay_time` when applied once
/// per `length` seconds.
fn decay_coeff(length: f32, decay_time: f32) -> f32 {
    10.0f32.powf(length / decay_time * -60.0 / 20.0)
}

/// Inverse of [`decay_coeff`]: the length over which `coeff` is applied.
fn decay_length(coeff: f32, decay_time: f32) -> f32 {
    coeff.log10() / -60.0 * 20.0 * decay_time
}

fn i3dl2_hf_cos(hf_reference: f32, frequency: f32) -> f32 {
    (TAU * hf_reference / frequency).cos()
}

fn density_gain(a: f32) -> f32 {
    (1.0 - a * a).sqrt()
}

/// Diagonal `x` and off-diagonal `y` of the late mixing matrix, from a
/// rotation of `diffusion * atan(sqrt(3))`.
pub(crate) fn matrix_coeffs(diffusion: f32) -> (f32, f32) {
    let n = 3.0f32.sqrt();
    let t = diffusion * n.atan();
    (t.cos(), t.sin() / n)
}

fn limited_hf_ratio(hf_ratio: f32, air_absorption_gain_hf: f32, decay_time: f32) -> f32 {
    let limit = 1.0
        / (decay_length(air_absorption_gain_hf, decay_time) * SPEED_OF_SOUND_METRES_PER_SEC);
    hf_ratio.min(limit.max(0.1))
}

fn damping_coeff(hf_ratio: f32, length: f32, decay_time: f32, decay: f32, cw: f32) -> f32 {
    if hf_ratio >= 1.0 {
        return 0.0;
    }
    let g = decay_coeff(length, decay_time * hf_ratio) / decay;
    // very short decays give tiny lines; keep the filter stable
    lp_coeff_calc(g * g, cw).min(0.98)
}

#[inline]
fn allpass_in_out(
    samples: &mut [f32],
    line: DelayLine,
    out_offset: usize,
    in_offset: usize,
    input: f32,
    feed_coeff: f32,
    coeff: f32,
) -> f32 {
    let out = line.read(samples, out_offset);
    let feed = feed_coeff * input;
    line.write(samples, in_offset, feed_coeff * (out - feed) + input);
    coeff * out - feed
}

/// Per-channel gains for a pan vector: full spread at the origin, the LUT
/// direction as the vector reaches unit length.
fn pan_gains(device: &DeviceInfo, pan: Vec3) -> [f32; MAX_CHANNELS] {
    let pan = if pan.length_squared() > 1.0 {
        pan.normalize()
    } else {
        pan
    };
    let lut = device.panning.lut(cart_to_lut_pos(pan.z, pan.x));
    let dir = (pan.x * pan.x + pan.z * pan.z).sqrt();

    let mut gains = [0.0; MAX_CHANNELS];
    for chan in device.panning.speakers() {
        let c = chan.index();
        gains[c] = 1.0 + (lut[c] - 1.0) * dir;
    }
    gains
}
