//! Auxiliary effect slots

use crate::channel::MAX_CHANNELS;
use crate::device::DeviceInfo;
use crate::effects::{EffectProps, EffectState, EffectType, NoneState, create_effect_state};
use crate::error::{PetalSonicError, Result, check_range};
use crate::mixer::BUFFERSIZE;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

pub type SlotMap = HashMap<SlotId, EffectSlot>;

/// Mono accumulation buffer fed by every source sending to a slot.
#[derive(Debug, Clone)]
pub struct WetBuffer {
    pub buffer: Vec<f32>,
    pub click_removal: f32,
    pub pending_clicks: f32,
}

impl WetBuffer {
    fn new() -> Self {
        Self {
            buffer: vec![0.0; BUFFERSIZE],
            click_removal: 0.0,
            pending_clicks: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct EffectSlot {
    props: EffectProps,
    state: Box<dyn EffectState>,
    gain: f32,
    aux_send_auto: bool,
    wet: WetBuffer,
}

impl EffectSlot {
    pub(crate) fn new() -> Self {
        Self {
            props: EffectProps::Null,
            state: Box::new(NoneState),
            gain: 1.0,
            aux_send_auto: true,
            wet: WetBuffer::new(),
        }
    }

    pub fn effect_type(&self) -> EffectType {
        self.props.effect_type()
    }

    pub fn props(&self) -> &EffectProps {
        &self.props
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn aux_send_auto(&self) -> bool {
        self.aux_send_auto
    }

    pub(crate) fn wet_mut(&mut self) -> &mut WetBuffer {
        &mut self.wet
    }

    /// Loads `props` into the slot. A change of effect type builds a new
    /// processor; if its storage cannot be allocated the slot keeps its
    /// current effect and the call fails with `OutOfMemory`.
    pub(crate) fn load_effect(&mut self, device: &DeviceInfo, props: EffectProps) -> Result<()> {
        self.load_effect_with(device, props, create_effect_state)
    }

    /// [`load_effect`](Self::load_effect) with the processor built by `create`.
    fn load_effect_with<F>(&mut self, device: &DeviceInfo, props: EffectProps, create: F) -> Result<()>
    where
        F: FnOnce(EffectType) -> Box<dyn EffectState>,
    {
        props.validate()?;

        if props.effect_type() != self.effect_type() {
            let mut state = create(props.effect_type());
            if let Err(err) = state.device_update(device) {
                log::warn!(
                    "Failed to load {} effect, keeping {}: {}",
                    props.effect_type(),
                    self.effect_type(),
                    err
                );
                return Err(match err {
                    PetalSonicError::OutOfMemory(_) => err,
                    other => PetalSonicError::OutOfMemory(other.to_string()),
                });
            }
            log::debug!("Loaded {} effect", props.effect_type());
            self.state = state;
        }

        self.state.update(device, &props);
        self.props = props;
        Ok(())
    }

    pub(crate) fn set_gain(&mut self, gain: f32) -> Result<()> {
        check_range("slot gain", gain, 0.0, 1.0)?;
        self.gain = gain;
        Ok(())
    }

    pub(crate) fn set_aux_send_auto(&mut self, auto: bool) {
        self.aux_send_auto = auto;
    }

    /// Declicks the wet buffer, runs the effect into `output` and clears the
    /// wet samples it consumed.
    pub(crate) fn process(&mut self, output: &mut [[f32; MAX_CHANNELS]]) {
        let samples_to_do = output.len();
        let wet = &mut self.wet;
        for sample in &mut wet.buffer[..samples_to_do] {
            wet.click_removal -= wet.click_removal / 256.0;
            *sample += wet.click_removal;
        }
        wet.click_removal += wet.pending_clicks;
        wet.pending_clicks = 0.0;

        self.state.process(self.gain, &wet.buffer[..samples_to_do], output);
        wet.buffer[..samples_to_do].fill(0.0);
    }
}
