//! Sources: spatial attributes, buffer queue and cached mix parameters

use crate::buffer::Buffer;
use crate::channel::{FmtChannels, MAX_CHANNELS};
use crate::error::{PetalSonicError, Result, check_range};
use crate::filter::{IirFilter, LowpassParams};
use crate::listener::ensure_finite;
use crate::math::{FRACTION_ONE, Vec3};
use crate::mixer::Resampler;
use crate::slot::SlotId;
use std::fmt;
use std::sync::Arc;

/// Most auxiliary sends a source can have.
pub const MAX_SENDS: usize = 4;

/// Priority at which a source ignores the admission limit.
pub const PRIORITY_ALWAYS_ADMIT: u8 = 127;

/// Unique identifier for a source within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// How the buffer queue was filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Undetermined,
    /// One buffer attached with [`Source::set_buffer`]; loops use its loop points.
    Static,
    /// Buffers appended with [`Source::queue_buffers`].
    Streaming,
}

/// Distance attenuation curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    None,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

impl DistanceModel {
    /// Clamped models limit the distance to `[reference, max]` first.
    pub fn is_clamped(self) -> bool {
        matches!(
            self,
            DistanceModel::InverseClamped | DistanceModel::LinearClamped | DistanceModel::ExponentClamped
        )
    }
}

/// Routing of one auxiliary send.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceSend {
    pub slot: Option<SlotId>,
    pub filter: LowpassParams,
}

/// Cached per-send mix state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SendParams {
    pub wet_gain: f32,
    pub iir_filter: IirFilter,
}

/// Everything the mixer needs from a source, derived by `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct MixParams {
    /// Resampling step in 14-bit fixed point.
    pub step: u32,
    /// `dry_gains[input channel][output channel]`
    pub dry_gains: [[f32; MAX_CHANNELS]; MAX_CHANNELS],
    pub iir_filter: IirFilter,
    pub sends: [SendParams; MAX_SENDS],
}

impl Default for MixParams {
    fn default() -> Self {
        Self {
            step: FRACTION_ONE,
            dry_gains: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
            iir_filter: IirFilter::default(),
            sends: [SendParams::default(); MAX_SENDS],
        }
    }
}

/// A sound emitter: attributes set through the context, plus the playback
/// cursor and cached parameters owned by the mixer.
#[derive(Debug, Clone)]
pub struct Source {
    pub(crate) pitch: f32,
    pub(crate) gain: f32,
    pub(crate) min_gain: f32,
    pub(crate) max_gain: f32,
    pub(crate) ref_distance: f32,
    pub(crate) max_distance: f32,
    pub(crate) rolloff_factor: f32,
    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) direction: Vec3,
    pub(crate) head_relative: bool,
    pub(crate) cone_inner_angle: f32,
    pub(crate) cone_outer_angle: f32,
    pub(crate) cone_outer_gain: f32,
    pub(crate) cone_outer_gain_hf: f32,
    pub(crate) air_absorption_factor: f32,
    pub(crate) room_rolloff_factor: f32,
    pub(crate) doppler_factor: f32,
    pub(crate) dry_gain_hf_auto: bool,
    pub(crate) wet_gain_auto: bool,
    pub(crate) wet_gain_hf_auto: bool,
    pub(crate) distance_model: DistanceModel,
    pub(crate) resampler: Resampler,
    pub(crate) priority: u8,
    pub(crate) looping: bool,
    pub(crate) direct_filter: LowpassParams,
    pub(crate) sends: [SourceSend; MAX_SENDS],

    pub(crate) state: SourceState,
    pub(crate) source_type: SourceType,
    pub(crate) queue: Vec<Option<Arc<Buffer>>>,
    pub(crate) buffers_played: usize,
    /// Integer frame position within the current queue item.
    pub(crate) position_int: u32,
    pub(crate) position_frac: u32,
    pending_offset: Option<usize>,

    pub(crate) params: MixParams,
    pub(crate) needs_update: bool,
}

impl Source {
    pub(crate) fn new(resampler: Resampler) -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            head_relative: false,
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
            cone_outer_gain_hf: 1.0,
            air_absorption_factor: 0.0,
            room_rolloff_factor: 0.0,
            doppler_factor: 1.0,
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
            distance_model: DistanceModel::InverseClamped,
            resampler,
            priority: 0,
            looping: false,
            direct_filter: LowpassParams::default(),
            sends: [SourceSend::default(); MAX_SENDS],
            state: SourceState::Initial,
            source_type: SourceType::Undetermined,
            queue: Vec::new(),
            buffers_played: 0,
            position_int: 0,
            position_frac: 0,
            pending_offset: None,
            params: MixParams::default(),
            needs_update: true,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn is_head_relative(&self) -> bool {
        self.head_relative
    }

    pub fn distance_model(&self) -> DistanceModel {
        self.distance_model
    }

    pub fn resampler(&self) -> Resampler {
        self.resampler
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn send(&self, index: usize) -> Option<&SourceSend> {
        self.sends.get(index)
    }

    pub fn mix_params(&self) -> &MixParams {
        &self.params
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Frame position inside the current buffer and its fixed-point fraction.
    pub fn playback_position(&self) -> (u32, u32) {
        (self.position_int, self.position_frac)
    }

    pub fn buffers_queued(&self) -> usize {
        self.queue.len()
    }

    pub fn buffers_played(&self) -> usize {
        self.buffers_played
    }

    /// Queue entries that may be unqueued: none for looping or static sources.
    pub fn buffers_processed(&self) -> usize {
        if self.looping || self.source_type != SourceType::Streaming {
            0
        } else {
            self.buffers_played
        }
    }

    /// First non-empty queue entry; its format decides the parameter path.
    pub fn first_buffer(&self) -> Option<&Arc<Buffer>> {
        self.queue.iter().flatten().next()
    }

    /// True for a mono head buffer, which gets full 3D processing.
    pub(crate) fn is_spatialized(&self) -> bool {
        self.first_buffer()
            .map(|b| b.channels() == FmtChannels::Mono)
            .unwrap_or(true)
    }

    pub fn set_pitch(&mut self, pitch: f32) -> Result<()> {
        check_range("pitch", pitch, 0.0, f32::MAX)?;
        self.pitch = pitch;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        check_range("gain", gain, 0.0, f32::MAX)?;
        self.gain = gain;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_gain_bounds(&mut self, min_gain: f32, max_gain: f32) -> Result<()> {
        check_range("min gain", min_gain, 0.0, 1.0)?;
        check_range("max gain", max_gain, 0.0, 1.0)?;
        self.min_gain = min_gain;
        self.max_gain = max_gain;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_distances(&mut self, reference: f32, max: f32) -> Result<()> {
        check_range("reference distance", reference, 0.0, f32::MAX)?;
        check_range("max distance", max, 0.0, f32::MAX)?;
        self.ref_distance = reference;
        self.max_distance = max;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_rolloff_factor(&mut self, rolloff: f32) -> Result<()> {
        check_range("rolloff factor", rolloff, 0.0, f32::MAX)?;
        self.rolloff_factor = rolloff;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_room_rolloff_factor(&mut self, rolloff: f32) -> Result<()> {
        check_range("room rolloff factor", rolloff, 0.0, 10.0)?;
        self.room_rolloff_factor = rolloff;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_air_absorption_factor(&mut self, factor: f32) -> Result<()> {
        check_range("air absorption factor", factor, 0.0, 10.0)?;
        self.air_absorption_factor = factor;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_doppler_factor(&mut self, factor: f32) -> Result<()> {
        check_range("source doppler factor", factor, 0.0, 1.0)?;
        self.doppler_factor = factor;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_position(&mut self, position: Vec3) -> Result<()> {
        ensure_finite("source position", position)?;
        self.position = position;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_velocity(&mut self, velocity: Vec3) -> Result<()> {
        ensure_finite("source velocity", velocity)?;
        self.velocity = velocity;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_direction(&mut self, direction: Vec3) -> Result<()> {
        ensure_finite("source direction", direction)?;
        self.direction = direction;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_head_relative(&mut self, relative: bool) {
        self.head_relative = relative;
        self.mark_dirty();
    }

    pub fn set_cone(&mut self, inner: f32, outer: f32, outer_gain: f32, outer_gain_hf: f32) -> Result<()> {
        check_range("cone inner angle", inner, 0.0, 360.0)?;
        check_range("cone outer angle", outer, 0.0, 360.0)?;
        check_range("cone outer gain", outer_gain, 0.0, 1.0)?;
        check_range("cone outer gain HF", outer_gain_hf, 0.0, 1.0)?;
        self.cone_inner_angle = inner;
        self.cone_outer_angle = outer;
        self.cone_outer_gain = outer_gain;
        self.cone_outer_gain_hf = outer_gain_hf;
        self.mark_dirty();
        Ok(())
    }

    pub fn set_auto_flags(&mut self, dry_gain_hf: bool, wet_gain: bool, wet_gain_hf: bool) {
        self.dry_gain_hf_auto = dry_gain_hf;
        self.wet_gain_auto = wet_gain;
        self.wet_gain_hf_auto = wet_gain_hf;
        self.mark_dirty();
    }

    pub fn set_distance_model(&mut self, model: DistanceModel) {
        self.distance_model = model;
        self.mark_dirty();
    }

    pub fn set_resampler(&mut self, resampler: Resampler) {
        self.resampler = resampler;
        self.mark_dirty();
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn set_direct_filter(&mut self, filter: LowpassParams) {
        self.direct_filter = filter;
        self.mark_dirty();
    }

    pub(crate) fn set_send(&mut self, index: usize, send: SourceSend) {
        self.sends[index] = send;
        self.mark_dirty();
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.needs_update = true;
    }

    /// Replaces the queue with a single static buffer, or empties it.
    pub fn set_buffer(&mut self, buffer: Option<Arc<Buffer>>) -> Result<()> {
        if !matches!(self.state, SourceState::Stopped | SourceState::Initial) {
            return Err(PetalSonicError::InvalidOperation(
                "buffer can only be changed on a stopped or initial source".into(),
            ));
        }
        self.queue.clear();
        self.buffers_played = 0;
        match buffer {
            Some(buffer) => {
                self.queue.push(Some(buffer));
                self.source_type = SourceType::Static;
            }
            None => self.source_type = SourceType::Undetermined,
        }
        self.mark_dirty();
        Ok(())
    }

    /// Appends buffers to a streaming queue. `None` entries are silent gaps.
    pub fn queue_buffers(&mut self, buffers: &[Option<Arc<Buffer>>]) -> Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }
        if self.source_type == SourceType::Static {
            return Err(PetalSonicError::InvalidOperation(
                "cannot queue buffers on a static source".into(),
            ));
        }

        let mut format = self.first_buffer().cloned();
        let had_format = format.is_some();
        for buffer in buffers.iter().flatten() {
            match &format {
                None => format = Some(buffer.clone()),
                Some(existing) if !existing.same_format(buffer) => {
                    return Err(PetalSonicError::InvalidOperation(
                        "queued buffers must share frequency and format".into(),
                    ));
                }
                Some(_) => {}
            }
        }

        self.source_type = SourceType::Streaming;
        self.queue.extend(buffers.iter().cloned());
        if !had_format && format.is_some() {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Removes `count` already processed entries from the head of the queue.
    pub fn unqueue_buffers(&mut self, count: usize) -> Result<Vec<Option<Arc<Buffer>>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.looping || self.source_type != SourceType::Streaming || count > self.buffers_played {
            return Err(PetalSonicError::InvalidValue(format!(
                "{} buffers requested but only {} are processed",
                count,
                self.buffers_processed()
            )));
        }
        let removed = self.queue.drain(..count).collect();
        self.buffers_played -= count;
        Ok(removed)
    }

    /// Sets a playback offset in frames across the whole queue. Applied now
    /// when playing or paused, otherwise on the next play.
    pub fn set_sample_offset(&mut self, offset: usize) -> Result<()> {
        let total: usize = self.queue.iter().flatten().map(|b| b.frames()).sum();
        if offset >= total {
            return Err(PetalSonicError::InvalidValue(format!(
                "offset {} is past the {} queued frames",
                offset, total
            )));
        }
        self.pending_offset = Some(offset);
        if matches!(self.state, SourceState::Playing | SourceState::Paused) {
            self.apply_offset();
        }
        Ok(())
    }

    /// Moves the cursor to the pending offset, if it falls inside the queue.
    fn apply_offset(&mut self) {
        let Some(offset) = self.pending_offset.take() else {
            return;
        };
        let mut total = 0;
        for (played, item) in self.queue.iter().enumerate() {
            let frames = item.as_ref().map(|b| b.frames()).unwrap_or(0);
            if frames > offset - total {
                self.buffers_played = played;
                self.position_int = (offset - total) as u32;
                self.position_frac = 0;
                return;
            }
            total += frames;
        }
    }

    fn rewind_cursor(&mut self) {
        self.position_int = 0;
        self.position_frac = 0;
    }

    /// Play transition. Returns true when the source ended up playing and
    /// belongs in the active set.
    pub(crate) fn start(&mut self, connected: bool) -> bool {
        let has_data = self.queue.iter().flatten().any(|b| b.frames() > 0);
        if !has_data {
            self.state = SourceState::Stopped;
            self.buffers_played = self.queue.len();
            self.rewind_cursor();
            self.pending_offset = None;
            return false;
        }

        if self.state != SourceState::Paused {
            self.rewind_cursor();
            self.buffers_played = 0;
        }
        self.state = SourceState::Playing;
        self.apply_offset();

        if !connected {
            self.state = SourceState::Stopped;
            self.buffers_played = self.queue.len();
            self.rewind_cursor();
            return false;
        }
        true
    }

    pub(crate) fn pause(&mut self) {
        if self.state == SourceState::Playing {
            self.state = SourceState::Paused;
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.state != SourceState::Initial {
            self.state = SourceState::Stopped;
            self.buffers_played = self.queue.len();
        }
        self.pending_offset = None;
    }

    pub(crate) fn rewind(&mut self) {
        if self.state != SourceState::Initial {
            self.state = SourceState::Initial;
            self.rewind_cursor();
            self.buffers_played = 0;
        }
        self.pending_offset = None;
    }

    /// Forced stop used when the device goes away.
    pub(crate) fn force_stop(&mut self) {
        if self.state == SourceState::Playing {
            self.state = SourceState::Stopped;
            self.buffers_played = self.queue.len();
            self.rewind_cursor();
        }
    }

    pub(crate) fn sends_to(&self, slot: SlotId) -> bool {
        self.sends.iter().any(|s| s.slot == Some(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(frames: usize) -> Arc<Buffer> {
        Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.5; frames]).unwrap())
    }

    #[test]
    fn defaults() {
        let source = Source::new(Resampler::Linear);
        assert_eq!(source.state(), SourceState::Initial);
        assert_eq!(source.source_type(), SourceType::Undetermined);
        assert_eq!(source.distance_model(), DistanceModel::InverseClamped);
        assert_eq!(source.max_distance, f32::MAX);
        assert_eq!(source.cone_inner_angle, 360.0);
        assert!(source.needs_update());
    }

    #[test]
    fn setters_validate_and_mark_dirty() {
        let mut source = Source::new(Resampler::Point);
        source.needs_update = false;
        assert!(source.set_gain(-0.5).is_err());
        assert!(!source.needs_update());
        source.set_gain(2.0).unwrap();
        assert!(source.needs_update());
        assert!(source.set_cone(10.0, 400.0, 0.0, 1.0).is_err());
        assert!(source.set_gain_bounds(0.0, 1.5).is_err());
        assert!(source.set_doppler_factor(1.5).is_err());
    }

    #[test]
    fn static_and_streaming_do_not_mix() {
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(mono(10))).unwrap();
        assert_eq!(source.source_type(), SourceType::Static);
        assert!(matches!(
            source.queue_buffers(&[Some(mono(4))]),
            Err(PetalSonicError::InvalidOperation(_))
        ));

        let mut streaming = Source::new(Resampler::Point);
        streaming.queue_buffers(&[Some(mono(4)), None]).unwrap();
        assert_eq!(streaming.source_type(), SourceType::Streaming);
        assert_eq!(streaming.buffers_queued(), 2);
    }

    #[test]
    fn queue_rejects_format_mismatch() {
        let mut source = Source::new(Resampler::Point);
        source.queue_buffers(&[Some(mono(4))]).unwrap();
        let stereo = Arc::new(Buffer::from_f32(FmtChannels::Stereo, 44100, vec![0.0; 8]).unwrap());
        assert!(source.queue_buffers(&[Some(stereo)]).is_err());
        assert_eq!(source.buffers_queued(), 1);
    }

    #[test]
    fn set_buffer_requires_stopped_or_initial() {
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(mono(10))).unwrap();
        assert!(source.start(true));
        assert!(source.set_buffer(None).is_err());
        source.stop();
        assert!(source.set_buffer(None).is_ok());
        assert_eq!(source.source_type(), SourceType::Undetermined);
    }

    #[test]
    fn only_processed_buffers_unqueue() {
        let mut source = Source::new(Resampler::Point);
        source.queue_buffers(&[Some(mono(4)), Some(mono(4)), Some(mono(4))]).unwrap();
        assert!(source.unqueue_buffers(1).is_err());
        source.buffers_played = 2;
        let removed = source.unqueue_buffers(2).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(source.buffers_queued(), 1);
        assert_eq!(source.buffers_played(), 0);
    }

    #[test]
    fn start_with_empty_queue_stops() {
        let mut source = Source::new(Resampler::Point);
        source.queue_buffers(&[None, Some(mono(0))]).unwrap();
        assert!(!source.start(true));
        assert_eq!(source.state(), SourceState::Stopped);
        assert_eq!(source.buffers_played(), 2);
    }

    #[test]
    fn start_while_disconnected_stops() {
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(mono(10))).unwrap();
        assert!(!source.start(false));
        assert_eq!(source.state(), SourceState::Stopped);
        assert_eq!(source.buffers_played(), 1);
    }

    #[test]
    fn resume_from_pause_keeps_position() {
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(mono(100))).unwrap();
        source.start(true);
        source.position_int = 42;
        source.pause();
        assert_eq!(source.state(), SourceState::Paused);
        source.start(true);
        assert_eq!(source.playback_position(), (42, 0));

        source.stop();
        source.start(true);
        assert_eq!(source.playback_position(), (0, 0));
    }

    #[test]
    fn sample_offset_lands_in_the_right_buffer() {
        let mut source = Source::new(Resampler::Point);
        source.queue_buffers(&[Some(mono(10)), None, Some(mono(10))]).unwrap();
        source.set_sample_offset(13).unwrap();
        assert!(source.start(true));
        assert_eq!(source.buffers_played(), 2);
        assert_eq!(source.playback_position(), (3, 0));
        assert!(source.set_sample_offset(20).is_err());
    }

    #[test]
    fn rewind_returns_to_initial() {
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(mono(10))).unwrap();
        source.start(true);
        source.position_int = 5;
        source.rewind();
        assert_eq!(source.state(), SourceState::Initial);
        assert_eq!(source.playback_position(), (0, 0));
    }
}
