//! Immutable PCM buffers shared between source queues

use crate::channel::{FmtChannels, FmtType};
use crate::error::{PetalSonicError, Result};
use uuid::Uuid;

/// Interleaved sample storage in the buffer's native type.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    UByte(Vec<u8>),
    Short(Vec<i16>),
    Float(Vec<f32>),
}

impl BufferData {
    pub fn fmt_type(&self) -> FmtType {
        match self {
            BufferData::UByte(_) => FmtType::UByte,
            BufferData::Short(_) => FmtType::Short,
            BufferData::Float(_) => FmtType::Float,
        }
    }

    /// Number of samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            BufferData::UByte(v) => v.len(),
            BufferData::Short(v) => v.len(),
            BufferData::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sample data with its format, rate and loop points.
///
/// Buffers never change after creation; sources hold them through `Arc`, so
/// a buffer lives as long as some queue still references it.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    id: Uuid,
    frequency: u32,
    channels: FmtChannels,
    data: BufferData,
    loop_start: usize,
    loop_end: usize,
}

impl Buffer {
    /// Wraps interleaved `data` recorded at `frequency` Hz.
    ///
    /// # Errors
    ///
    /// `InvalidValue` when the frequency is zero or the sample count is not a
    /// whole number of frames.
    pub fn new(channels: FmtChannels, frequency: u32, data: BufferData) -> Result<Self> {
        if frequency == 0 {
            return Err(PetalSonicError::InvalidValue(
                "buffer frequency must be non-zero".into(),
            ));
        }
        let chans = channels.channel_count();
        if data.len() % chans != 0 {
            return Err(PetalSonicError::InvalidValue(format!(
                "{} samples is not a whole number of {}-channel frames",
                data.len(),
                chans
            )));
        }
        let frames = data.len() / chans;
        Ok(Self {
            id: Uuid::new_v4(),
            frequency,
            channels,
            data,
            loop_start: 0,
            loop_end: frames,
        })
    }

    pub fn from_u8(channels: FmtChannels, frequency: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(channels, frequency, BufferData::UByte(data))
    }

    pub fn from_i16(channels: FmtChannels, frequency: u32, data: Vec<i16>) -> Result<Self> {
        Self::new(channels, frequency, BufferData::Short(data))
    }

    pub fn from_f32(channels: FmtChannels, frequency: u32, data: Vec<f32>) -> Result<Self> {
        Self::new(channels, frequency, BufferData::Float(data))
    }

    /// Sets the loop range in frames; requires `start < end <= frames`.
    pub fn with_loop_points(mut self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.frames() {
            return Err(PetalSonicError::InvalidValue(format!(
                "loop points {}..{} do not fit a {}-frame buffer",
                start,
                end,
                self.frames()
            )));
        }
        self.loop_start = start;
        self.loop_end = end;
        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn channels(&self) -> FmtChannels {
        self.channels
    }

    pub fn fmt_type(&self) -> FmtType {
        self.data.fmt_type()
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    /// Length in sample frames.
    pub fn frames(&self) -> usize {
        self.data.len() / self.channels.channel_count()
    }

    pub fn loop_start(&self) -> usize {
        self.loop_start
    }

    pub fn loop_end(&self) -> usize {
        self.loop_end
    }

    /// True when both buffers can sit in the same source queue.
    pub fn same_format(&self, other: &Buffer) -> bool {
        self.frequency == other.frequency
            && self.channels == other.channels
            && self.fmt_type() == other.fmt_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_and_default_loop() {
        let buffer = Buffer::from_i16(FmtChannels::Stereo, 22050, vec![0; 200]).unwrap();
        assert_eq!(buffer.frames(), 100);
        assert_eq!(buffer.loop_start(), 0);
        assert_eq!(buffer.loop_end(), 100);
        assert_eq!(buffer.fmt_type(), FmtType::Short);
    }

    #[test]
    fn rejects_partial_frames_and_zero_rate() {
        assert!(Buffer::from_u8(FmtChannels::Stereo, 8000, vec![128; 3]).is_err());
        assert!(Buffer::from_f32(FmtChannels::Mono, 0, vec![0.0; 4]).is_err());
    }

    #[test]
    fn loop_points_are_checked() {
        let buffer = Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.0; 300]).unwrap();
        let looped = buffer.clone().with_loop_points(100, 200).unwrap();
        assert_eq!((looped.loop_start(), looped.loop_end()), (100, 200));
        assert!(buffer.clone().with_loop_points(200, 100).is_err());
        assert!(buffer.with_loop_points(0, 301).is_err());
    }

    #[test]
    fn each_buffer_gets_its_own_id() {
        let a = Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.0]).unwrap();
        let b = Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.0]).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.same_format(&b));
    }
}
