//! Conversion of the dry mix to the device's sample format and layout

use crate::bs2b::Bs2b;
use crate::channel::{Channel, DevChannels, MAX_CHANNELS};
use crate::panning::ChannelMatrix;

/// A sample type the device can write.
pub trait OutputSample: Copy + Default + Send + 'static {
    fn from_mix(value: f32) -> Self;
}

/// Clamps to [-1, 1] and scales to the signed 16-bit range.
#[inline]
pub fn f32_to_i16(value: f32) -> i16 {
    if value > 1.0 {
        32767
    } else if value < -1.0 {
        -32768
    } else {
        (value * 32767.0) as i16
    }
}

#[inline]
pub fn f32_to_u16(value: f32) -> u16 {
    (f32_to_i16(value) as i32 + 32768) as u16
}

impl OutputSample for f32 {
    #[inline]
    fn from_mix(value: f32) -> Self {
        value
    }
}

impl OutputSample for i16 {
    #[inline]
    fn from_mix(value: f32) -> Self {
        f32_to_i16(value)
    }
}

impl OutputSample for u16 {
    #[inline]
    fn from_mix(value: f32) -> Self {
        f32_to_u16(value)
    }
}

impl OutputSample for i8 {
    #[inline]
    fn from_mix(value: f32) -> Self {
        (f32_to_i16(value) >> 8) as i8
    }
}

impl OutputSample for u8 {
    #[inline]
    fn from_mix(value: f32) -> Self {
        (f32_to_u16(value) >> 8) as u8
    }
}

/// Interleaves `dry` into `out` in `layout`'s channel order, folding the
/// virtual channels through `matrix`. Stereo output goes through the
/// crossfeed when one is given.
pub fn write_frames<T: OutputSample>(
    dry: &[[f32; MAX_CHANNELS]],
    matrix: &ChannelMatrix,
    layout: DevChannels,
    bs2b: Option<&mut Bs2b>,
    out: &mut [T],
) {
    let channels = layout.output_channels();
    let frames = out.chunks_exact_mut(channels.len()).zip(dry);

    match bs2b {
        Some(bs2b) if layout == DevChannels::Stereo => {
            let left = Channel::FrontLeft.index();
            let right = Channel::FrontRight.index();
            for (out, frame) in frames {
                let mut samples = [mix_channel(frame, matrix, left), mix_channel(frame, matrix, right)];
                bs2b.cross_feed(&mut samples);
                out[0] = T::from_mix(samples[0]);
                out[1] = T::from_mix(samples[1]);
            }
        }
        _ => {
            for (out, frame) in frames {
                for (sample, chan) in out.iter_mut().zip(channels) {
                    *sample = T::from_mix(mix_channel(frame, matrix, chan.index()));
                }
            }
        }
    }
}

#[inline]
fn mix_channel(frame: &[f32; MAX_CHANNELS], matrix: &ChannelMatrix, output: usize) -> f32 {
    frame
        .iter()
        .zip(matrix)
        .filter(|(_, row)| row[output] != 0.0)
        .map(|(sample, row)| sample * row[output])
        .sum()
}
