use super::{EffectProps, EffectState};
use crate::channel::MAX_CHANNELS;
use crate::device::DeviceInfo;
use crate::error::Result;

/// Discards its input. Empty slots and failed loads use it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneState;

impl EffectState for NoneState {
    fn device_update(&mut self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _device: &DeviceInfo, _props: &EffectProps) {}

    fn process(&mut self, _slot_gain: f32, _input: &[f32], _output: &mut [[f32; MAX_CHANNELS]]) {}
}
