//! Effect processors run on the wet buffers of effect slots
//!
//! Every processor follows the same life cycle: [`EffectState::device_update`]
//! sizes its delay lines for the device rate, [`EffectState::update`] derives
//! coefficients from an [`EffectProps`] set, and [`EffectState::process`]
//! turns one chunk of wet input into output on the device's virtual
//! channels. Only `device_update` allocates.

mod echo;
mod modulator;
mod none;
mod reverb;

pub use echo::EchoState;
pub use modulator::ModulatorState;
pub use none::NoneState;
pub use reverb::ReverbState;

use crate::channel::MAX_CHANNELS;
use crate::device::DeviceInfo;
use crate::error::{PetalSonicError, Result, check_range};
use crate::listener::ensure_finite;
use crate::math::Vec3;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EffectType {
    #[default]
    Null,
    Reverb,
    EaxReverb,
    Echo,
    Modulator,
}

impl fmt::Display for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EffectType::Null => "null",
            EffectType::Reverb => "reverb",
            EffectType::EaxReverb => "eax-reverb",
            EffectType::Echo => "echo",
            EffectType::Modulator => "ring-modulator",
        };
        f.write_str(name)
    }
}

/// Parameters shared by the standard and EAX reverbs. The standard reverb
/// ignores the EAX-only fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbProps {
    pub density: f32,
    pub diffusion: f32,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
    pub decay_time: f32,
    pub decay_hf_ratio: f32,
    pub decay_lf_ratio: f32,
    pub reflections_gain: f32,
    pub reflections_delay: f32,
    pub reflections_pan: Vec3,
    pub late_reverb_gain: f32,
    pub late_reverb_delay: f32,
    pub late_reverb_pan: Vec3,
    pub echo_time: f32,
    pub echo_depth: f32,
    pub modulation_time: f32,
    pub modulation_depth: f32,
    pub air_absorption_gain_hf: f32,
    pub hf_reference: f32,
    pub lf_reference: f32,
    pub room_rolloff_factor: f32,
    pub decay_hf_limit: bool,
}

impl Default for ReverbProps {
    fn default() -> Self {
        Self {
            density: 1.0,
            diffusion: 1.0,
            gain: 0.32,
            gain_hf: 0.89,
            gain_lf: 1.0,
            decay_time: 1.49,
            decay_hf_ratio: 0.83,
            decay_lf_ratio: 1.0,
            reflections_gain: 0.05,
            reflections_delay: 0.007,
            reflections_pan: Vec3::ZERO,
            late_reverb_gain: 1.26,
            late_reverb_delay: 0.011,
            late_reverb_pan: Vec3::ZERO,
            echo_time: 0.25,
            echo_depth: 0.0,
            modulation_time: 0.25,
            modulation_depth: 0.0,
            air_absorption_gain_hf: 0.994,
            hf_reference: 5000.0,
            lf_reference: 250.0,
            room_rolloff_factor: 0.0,
            decay_hf_limit: true,
        }
    }
}

impl ReverbProps {
    pub fn validate(&self) -> Result<()> {
        check_range("reverb density", self.density, 0.0, 1.0)?;
        check_range("reverb diffusion", self.diffusion, 0.0, 1.0)?;
        check_range("reverb gain", self.gain, 0.0, 1.0)?;
        check_range("reverb gain HF", self.gain_hf, 0.0, 1.0)?;
        check_range("reverb gain LF", self.gain_lf, 0.0, 1.0)?;
        check_range("reverb decay time", self.decay_time, 0.1, 20.0)?;
        check_range("reverb decay HF ratio", self.decay_hf_ratio, 0.1, 2.0)?;
        check_range("reverb decay LF ratio", self.decay_lf_ratio, 0.1, 2.0)?;
        check_range("reverb reflections gain", self.reflections_gain, 0.0, 3.16)?;
        check_range("reverb reflections delay", self.reflections_delay, 0.0, 0.3)?;
        ensure_finite("reverb reflections pan", self.reflections_pan)?;
        check_range("reverb late gain", self.late_reverb_gain, 0.0, 10.0)?;
        check_range("reverb late delay", self.late_reverb_delay, 0.0, 0.1)?;
        ensure_finite("reverb late pan", self.late_reverb_pan)?;
        check_range("reverb echo time", self.echo_time, 0.075, 0.25)?;
        check_range("reverb echo depth", self.echo_depth, 0.0, 1.0)?;
        check_range("reverb modulation time", self.modulation_time, 0.04, 4.0)?;
        check_range("reverb modulation depth", self.modulation_depth, 0.0, 1.0)?;
        check_range(
            "reverb air absorption gain HF",
            self.air_absorption_gain_hf,
            0.892,
            1.0,
        )?;
        check_range("reverb HF reference", self.hf_reference, 1000.0, 20000.0)?;
        check_range("reverb LF reference", self.lf_reference, 20.0, 1000.0)?;
        check_range("reverb room rolloff", self.room_rolloff_factor, 0.0, 10.0)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoProps {
    /// Seconds until the first tap.
    pub delay: f32,
    /// Seconds between the first and second tap.
    pub lr_delay: f32,
    pub damping: f32,
    pub feedback: f32,
    /// -1 puts the first tap fully right, 1 fully left.
    pub spread: f32,
}

impl Default for EchoProps {
    fn default() -> Self {
        Self {
            delay: 0.1,
            lr_delay: 0.1,
            damping: 0.5,
            feedback: 0.5,
            spread: -1.0,
        }
    }
}

impl EchoProps {
    pub fn validate(&self) -> Result<()> {
        check_range("echo delay", self.delay, 0.0, 0.207)?;
        check_range("echo LR delay", self.lr_delay, 0.0, 0.404)?;
        check_range("echo damping", self.damping, 0.0, 0.99)?;
        check_range("echo feedback", self.feedback, 0.0, 1.0)?;
        check_range("echo spread", self.spread, -1.0, 1.0)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    Sinusoid,
    Sawtooth,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulatorProps {
    pub frequency: f32,
    pub high_pass_cutoff: f32,
    pub waveform: Waveform,
}

impl Default for ModulatorProps {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            high_pass_cutoff: 800.0,
            waveform: Waveform::Sinusoid,
        }
    }
}

impl ModulatorProps {
    pub fn validate(&self) -> Result<()> {
        check_range("modulator frequency", self.frequency, 0.0, 8000.0)?;
        check_range("modulator high-pass cutoff", self.high_pass_cutoff, 0.0, 24000.0)?;
        Ok(())
    }
}

/// An effect object: its type and parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EffectProps {
    #[default]
    Null,
    Reverb(ReverbProps),
    EaxReverb(ReverbProps),
    Echo(EchoProps),
    Modulator(ModulatorProps),
}

impl EffectProps {
    /// Default parameters of an effect type.
    pub fn new(effect_type: EffectType) -> Self {
        match effect_type {
            EffectType::Null => EffectProps::Null,
            EffectType::Reverb => EffectProps::Reverb(ReverbProps::default()),
            EffectType::EaxReverb => EffectProps::EaxReverb(ReverbProps::default()),
            EffectType::Echo => EffectProps::Echo(EchoProps::default()),
            EffectType::Modulator => EffectProps::Modulator(ModulatorProps::default()),
        }
    }

    pub fn effect_type(&self) -> EffectType {
        match self {
            EffectProps::Null => EffectType::Null,
            EffectProps::Reverb(_) => EffectType::Reverb,
            EffectProps::EaxReverb(_) => EffectType::EaxReverb,
            EffectProps::Echo(_) => EffectType::Echo,
            EffectProps::Modulator(_) => EffectType::Modulator,
        }
    }

    /// Reverb parameters, for either reverb flavour.
    pub fn reverb(&self) -> Option<&ReverbProps> {
        match self {
            EffectProps::Reverb(props) | EffectProps::EaxReverb(props) => Some(props),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            EffectProps::Null => Ok(()),
            EffectProps::Reverb(props) | EffectProps::EaxReverb(props) => props.validate(),
            EffectProps::Echo(props) => props.validate(),
            EffectProps::Modulator(props) => props.validate(),
        }
    }
}

/// A running effect instance owned by an effect slot.
pub trait EffectState: Send + fmt::Debug {
    /// (Re)allocates internal storage for the device's rate and layout.
    fn device_update(&mut self, device: &DeviceInfo) -> Result<()>;

    /// Recomputes coefficients from `props`. Parameter sets of another
    /// effect type are ignored.
    fn update(&mut self, device: &DeviceInfo, props: &EffectProps);

    /// Consumes `input` and adds the result, scaled by `slot_gain`, to
    /// `output` (one frame of virtual channels per input sample).
    fn process(&mut self, slot_gain: f32, input: &[f32], output: &mut [[f32; MAX_CHANNELS]]);
}

/// A fresh, not yet device-updated processor for `effect_type`.
pub fn create_effect_state(effect_type: EffectType) -> Box<dyn EffectState> {
    match effect_type {
        EffectType::Null => Box::new(NoneState),
        EffectType::Reverb => Box::new(ReverbState::new(false)),
        EffectType::EaxReverb => Box::new(ReverbState::new(true)),
        EffectType::Echo => Box::new(EchoState::new()),
        EffectType::Modulator => Box::new(ModulatorState::new()),
    }
}

/// Zeroed sample storage, reporting allocation failure instead of aborting.
pub(crate) fn alloc_samples(len: usize) -> Result<Vec<f32>> {
    let mut samples = Vec::new();
    samples.try_reserve_exact(len).map_err(|e| {
        PetalSonicError::OutOfMemory(format!("{} delay samples: {}", len, e))
    })?;
    samples.resize(len, 0.0);
    Ok(samples)
}

/// Unity gain on every positional speaker of the device, zero elsewhere.
pub(crate) fn speaker_gains(device: &DeviceInfo) -> [f32; MAX_CHANNELS] {
    let mut gains = [0.0; MAX_CHANNELS];
    for chan in device.panning.speakers() {
        gains[chan.index()] = 1.0;
    }
    gains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PetalSonicDeviceDesc;

    #[test]
    fn defaults_are_in_range() {
        for ty in [
            EffectType::Null,
            EffectType::Reverb,
            EffectType::EaxReverb,
            EffectType::Echo,
            EffectType::Modulator,
        ] {
            let props = EffectProps::new(ty);
            assert_eq!(props.effect_type(), ty);
            props.validate().unwrap();
        }
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        let reverb = ReverbProps {
            decay_time: 25.0,
            ..Default::default()
        };
        assert!(matches!(
            EffectProps::Reverb(reverb).validate(),
            Err(PetalSonicError::InvalidValue(_))
        ));

        let echo = EchoProps {
            damping: 1.0,
            ..Default::default()
        };
        assert!(echo.validate().is_err());

        let modulator = ModulatorProps {
            frequency: 9000.0,
            ..Default::default()
        };
        assert!(modulator.validate().is_err());

        let pan = ReverbProps {
            late_reverb_pan: Vec3::new(f32::INFINITY, 0.0, 0.0),
            ..Default::default()
        };
        assert!(pan.validate().is_err());
    }

    #[test]
    fn reverb_accessor_covers_both_flavours() {
        assert!(EffectProps::new(EffectType::Reverb).reverb().is_some());
        assert!(EffectProps::new(EffectType::EaxReverb).reverb().is_some());
        assert!(EffectProps::new(EffectType::Echo).reverb().is_none());
    }

    #[test]
    fn every_state_survives_a_silent_chunk() {
        let device = DeviceInfo::new(&PetalSonicDeviceDesc::default()).unwrap();
        for ty in [
            EffectType::Null,
            EffectType::Reverb,
            EffectType::EaxReverb,
            EffectType::Echo,
            EffectType::Modulator,
        ] {
            let mut state = create_effect_state(ty);
            state.device_update(&device).unwrap();
            state.update(&device, &EffectProps::new(ty));
            let input = vec![0.0; 256];
            let mut output = vec![[0.0; MAX_CHANNELS]; 256];
            state.process(1.0, &input, &mut output);
            assert!(output.iter().flatten().all(|&s| s == 0.0), "{} made noise", ty);
        }
    }
}
