//! Per-source resampling mixer
//!
//! [`mix_source`] walks a source's buffer queue, gathers the frames the
//! current chunk needs into a scratch buffer (with the padding the chosen
//! interpolator reads around each position), and accumulates the filtered,
//! resampled signal into the dry mix and every active send.

use crate::buffer::{Buffer, BufferData};
use crate::channel::MAX_CHANNELS;
use crate::effects::EffectType;
use crate::error::PetalSonicError;
use crate::filter::IirFilter;
use crate::math::{FRACTION_BITS, FRACTION_MASK, FRACTION_ONE, cubic, lerp};
use crate::slot::{SlotMap, WetBuffer};
use crate::source::{MixParams, SendParams, Source, SourceState, SourceType};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Frames mixed per pass of the device loop.
pub const BUFFERSIZE: usize = 4096;

/// Bytes of source data gathered per pass of the source loop.
pub const STACK_DATA_SIZE: usize = 16384;

/// Interpolation used when a source's step is not exactly one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampler {
    Point,
    #[default]
    Linear,
    Cubic,
}

impl Resampler {
    /// Frames read past the integer position.
    pub const fn padding(self) -> usize {
        match self {
            Resampler::Point => 0,
            Resampler::Linear => 1,
            Resampler::Cubic => 2,
        }
    }

    /// Frames read before the integer position.
    pub const fn pre_padding(self) -> usize {
        match self {
            Resampler::Point | Resampler::Linear => 0,
            Resampler::Cubic => 1,
        }
    }
}

impl fmt::Display for Resampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resampler::Point => "point",
            Resampler::Linear => "linear",
            Resampler::Cubic => "cubic",
        };
        f.write_str(name)
    }
}

impl FromStr for Resampler {
    type Err = PetalSonicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "point" => Ok(Resampler::Point),
            "linear" => Ok(Resampler::Linear),
            "cubic" => Ok(Resampler::Cubic),
            other => Err(PetalSonicError::Configuration(format!(
                "unknown resampler '{}'",
                other
            ))),
        }
    }
}

/// Scratch space for gathered source frames, one buffer per sample format.
/// Allocated once per device so the mix path never allocates.
#[derive(Debug, Clone)]
pub struct MixScratch {
    ubyte: Vec<u8>,
    short: Vec<i16>,
    float: Vec<f32>,
}

impl MixScratch {
    pub fn new() -> Self {
        Self {
            ubyte: vec![0; STACK_DATA_SIZE],
            short: vec![0; STACK_DATA_SIZE / 2],
            float: vec![0.0; STACK_DATA_SIZE / 4],
        }
    }
}

impl Default for MixScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// The device's dry accumulation buffer and its declick state.
#[derive(Debug, Clone)]
pub struct DryMix {
    pub buffer: Vec<[f32; MAX_CHANNELS]>,
    pub click_removal: [f32; MAX_CHANNELS],
    pub pending_clicks: [f32; MAX_CHANNELS],
}

impl DryMix {
    pub fn new() -> Self {
        Self {
            buffer: vec![[0.0; MAX_CHANNELS]; BUFFERSIZE],
            click_removal: [0.0; MAX_CHANNELS],
            pending_clicks: [0.0; MAX_CHANNELS],
        }
    }
}

impl Default for DryMix {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored sample format the mixer can read.
pub(crate) trait Sample: Copy + 'static {
    const SILENCE: Self;

    /// Normalised value in roughly [-1, 1].
    fn to_real(self) -> f32;

    fn samples(data: &BufferData) -> Option<&[Self]>;

    fn scratch(scratch: &mut MixScratch) -> &mut [Self];
}

impl Sample for u8 {
    const SILENCE: Self = 0x80;

    #[inline]
    fn to_real(self) -> f32 {
        (self as f32 - 128.0) * (1.0 / 127.0)
    }

    fn samples(data: &BufferData) -> Option<&[Self]> {
        match data {
            BufferData::UByte(v) => Some(v),
            _ => None,
        }
    }

    fn scratch(scratch: &mut MixScratch) -> &mut [Self] {
        &mut scratch.ubyte
    }
}

impl Sample for i16 {
    const SILENCE: Self = 0;

    #[inline]
    fn to_real(self) -> f32 {
        self as f32 * (1.0 / 32767.0)
    }

    fn samples(data: &BufferData) -> Option<&[Self]> {
        match data {
            BufferData::Short(v) => Some(v),
            _ => None,
        }
    }

    fn scratch(scratch: &mut MixScratch) -> &mut [Self] {
        &mut scratch.short
    }
}

impl Sample for f32 {
    const SILENCE: Self = 0.0;

    #[inline]
    fn to_real(self) -> f32 {
        self
    }

    fn samples(data: &BufferData) -> Option<&[Self]> {
        match data {
            BufferData::Float(v) => Some(v),
            _ => None,
        }
    }

    fn scratch(scratch: &mut MixScratch) -> &mut [Self] {
        &mut scratch.float
    }
}

/// Reads one channel at a fractional position. `at` indexes the sample at
/// the integer position and `stride` is the distance between frames.
trait Interpolator {
    fn sample<S: Sample>(data: &[S], at: usize, stride: usize, frac: u32) -> f32;
}

struct PointSampler;
struct LinearSampler;
struct CubicSampler;

impl Interpolator for PointSampler {
    #[inline]
    fn sample<S: Sample>(data: &[S], at: usize, _stride: usize, _frac: u32) -> f32 {
        data[at].to_real()
    }
}

impl Interpolator for LinearSampler {
    #[inline]
    fn sample<S: Sample>(data: &[S], at: usize, stride: usize, frac: u32) -> f32 {
        lerp(
            data[at].to_real(),
            data[at + stride].to_real(),
            frac as f32 * (1.0 / FRACTION_ONE as f32),
        )
    }
}

impl Interpolator for CubicSampler {
    #[inline]
    fn sample<S: Sample>(data: &[S], at: usize, stride: usize, frac: u32) -> f32 {
        cubic(
            data[at - stride].to_real(),
            data[at].to_real(),
            data[at + stride].to_real(),
            data[at + 2 * stride].to_real(),
            frac as f32 * (1.0 / FRACTION_ONE as f32),
        )
    }
}

/// Gathered frames for one pass and where the pass writes.
struct Chunk<'a, S> {
    data: &'a [S],
    /// Sample index of the first frame at the current position.
    base: usize,
    channels: usize,
    step: u32,
    frac: u32,
    out_pos: usize,
    samples_to_do: usize,
    count: usize,
}

impl<S: Sample> Chunk<'_, S> {
    #[inline]
    fn at(&self, pos: usize, channel: usize) -> usize {
        self.base + pos * self.channels + channel
    }
}

#[inline]
fn advance(pos: &mut usize, frac: &mut u32, step: u32) {
    *frac += step;
    *pos += (*frac >> FRACTION_BITS) as usize;
    *frac &= FRACTION_MASK;
}

/// Dry path. Mono input runs through four filter stages, every other layout
/// through two per channel. Returns the frames advanced and the new fraction.
fn mix_dry<S: Sample, I: Interpolator>(
    chunk: &Chunk<'_, S>,
    params: &mut MixParams,
    dry: &mut DryMix,
) -> (usize, u32) {
    let channels = chunk.channels;
    let mono = channels == 1;
    let filter = &mut params.iir_filter;
    let mut pos = 0;
    let mut frac = chunk.frac;

    if chunk.out_pos == 0 {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            let value = peek_dry(filter, mono, i, value);
            for (click, gain) in dry.click_removal.iter_mut().zip(&params.dry_gains[i]) {
                *click -= value * gain;
            }
        }
    }

    for frame in &mut dry.buffer[chunk.out_pos..chunk.out_pos + chunk.count] {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            let value = filter_dry(filter, mono, i, value);
            for (out, gain) in frame.iter_mut().zip(&params.dry_gains[i]) {
                *out += value * gain;
            }
        }
        advance(&mut pos, &mut frac, chunk.step);
    }

    if chunk.out_pos + chunk.count == chunk.samples_to_do {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            let value = peek_dry(filter, mono, i, value);
            for (click, gain) in dry.pending_clicks.iter_mut().zip(&params.dry_gains[i]) {
                *click += value * gain;
            }
        }
    }

    (pos, frac)
}

#[inline]
fn filter_dry(filter: &mut IirFilter, mono: bool, channel: usize, value: f32) -> f32 {
    if mono {
        filter.lp4p(0, value)
    } else {
        filter.lp2p(channel * 2, value)
    }
}

#[inline]
fn peek_dry(filter: &IirFilter, mono: bool, channel: usize, value: f32) -> f32 {
    if mono {
        filter.lp4pc(0, value)
    } else {
        filter.lp2pc(channel * 2, value)
    }
}

/// One send. Multichannel input is summed down to mono with `1/channels`.
fn mix_wet<S: Sample, I: Interpolator>(chunk: &Chunk<'_, S>, send: &mut SendParams, wet: &mut WetBuffer) {
    let channels = chunk.channels;
    let mono = channels == 1;
    let gain = if mono {
        send.wet_gain
    } else {
        send.wet_gain / channels as f32
    };
    let filter = &mut send.iir_filter;
    let mut pos = 0;
    let mut frac = chunk.frac;

    if chunk.out_pos == 0 {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            wet.click_removal -= peek_wet(filter, mono, i, value) * gain;
        }
    }

    for out in &mut wet.buffer[chunk.out_pos..chunk.out_pos + chunk.count] {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            *out += filter_wet(filter, mono, i, value) * gain;
        }
        advance(&mut pos, &mut frac, chunk.step);
    }

    if chunk.out_pos + chunk.count == chunk.samples_to_do {
        for i in 0..channels {
            let value = I::sample(chunk.data, chunk.at(pos, i), channels, frac);
            wet.pending_clicks += peek_wet(filter, mono, i, value) * gain;
        }
    }
}

#[inline]
fn filter_wet(filter: &mut IirFilter, mono: bool, channel: usize, value: f32) -> f32 {
    if mono {
        filter.lp2p(0, value)
    } else {
        filter.lp1p(channel, value)
    }
}

#[inline]
fn peek_wet(filter: &IirFilter, mono: bool, channel: usize, value: f32) -> f32 {
    if mono {
        filter.lp2pc(0, value)
    } else {
        filter.lp1pc(channel, value)
    }
}

/// Dry path plus every send that targets a live, non-null slot.
fn mix_chunk<S: Sample, I: Interpolator>(
    chunk: &Chunk<'_, S>,
    source: &mut Source,
    dry: &mut DryMix,
    slots: &mut SlotMap,
    num_sends: usize,
) -> (usize, u32) {
    let advanced = mix_dry::<S, I>(chunk, &mut source.params, dry);

    for (send, params) in source.sends.iter().zip(source.params.sends.iter_mut()).take(num_sends) {
        let Some(slot) = send.slot.and_then(|id| slots.get_mut(&id)) else {
            continue;
        };
        if slot.effect_type() == EffectType::Null {
            continue;
        }
        mix_wet::<S, I>(chunk, params, slot.wet_mut());
    }

    advanced
}

/// Mixes up to `samples_to_do` frames of `source` into `dry` and the wet
/// buffers of the slots it sends to, advancing its position and queue
/// state. A source that runs out of data is left `Stopped`.
pub fn mix_source(
    source: &mut Source,
    dry: &mut DryMix,
    slots: &mut SlotMap,
    scratch: &mut MixScratch,
    num_sends: usize,
    samples_to_do: usize,
) {
    let Some(first) = source.first_buffer().cloned() else {
        source.state = SourceState::Stopped;
        source.buffers_played = source.queue.len();
        source.position_int = 0;
        source.position_frac = 0;
        return;
    };

    match first.data() {
        BufferData::UByte(_) => mix_typed::<u8>(source, &first, dry, slots, scratch, num_sends, samples_to_do),
        BufferData::Short(_) => mix_typed::<i16>(source, &first, dry, slots, scratch, num_sends, samples_to_do),
        BufferData::Float(_) => mix_typed::<f32>(source, &first, dry, slots, scratch, num_sends, samples_to_do),
    }
}

fn mix_typed<S: Sample>(
    source: &mut Source,
    format: &Buffer,
    dry: &mut DryMix,
    slots: &mut SlotMap,
    scratch: &mut MixScratch,
    num_sends: usize,
    samples_to_do: usize,
) {
    let channels = format.channels().channel_count();
    let resampler = if source.params.step == FRACTION_ONE {
        Resampler::Point
    } else {
        source.resampler
    };
    let pad = resampler.padding();
    let prepad = resampler.pre_padding();

    let is_static = source.source_type == SourceType::Static;
    let mut pos = source.position_int as usize;
    let mut frac = source.position_frac;
    let mut current = source.buffers_played;
    let mut out_pos = 0;

    let data = S::scratch(scratch);
    let max_frames = data.len() / channels;
    // a step cached for a narrower interpolator must still leave one frame
    // per pass inside the window
    let max_step = (max_frames.saturating_sub(pad + prepad + 1).max(1) as u32) << FRACTION_BITS;
    let step = source.params.step.clamp(1, max_step);

    loop {
        let wanted = ((((samples_to_do - out_pos + 1) as u64 * step as u64
            + frac as u64
            + FRACTION_MASK as u64)
            >> FRACTION_BITS) as usize)
            + pad
            + prepad;
        let frames = wanted.min(max_frames);
        let window = &mut data[..frames * channels];

        let mut looping = source.looping;
        if is_static {
            let Some(buffer) = source.queue.first().and_then(Option::as_ref) else {
                break;
            };
            if pos >= buffer.loop_end() {
                looping = false;
            }
            fill_static::<S>(window, channels, buffer, pos, prepad, looping);
        } else {
            fill_streaming::<S>(window, channels, &source.queue, current, pos, prepad, looping);
        }

        // frames whose full interpolation window lies inside the gathered data
        let mut available = ((frames - pad - prepad) as i64) << FRACTION_BITS;
        available -= step as i64 + frac as i64;
        let count = ((available + step as i64 - 1) / step as i64)
            .clamp(0, (samples_to_do - out_pos) as i64) as usize;
        if count == 0 {
            break;
        }

        let chunk = Chunk {
            data: window,
            base: prepad * channels,
            channels,
            step,
            frac,
            out_pos,
            samples_to_do,
            count,
        };
        let (advanced, new_frac) = match resampler {
            Resampler::Point => mix_chunk::<S, PointSampler>(&chunk, source, dry, slots, num_sends),
            Resampler::Linear => mix_chunk::<S, LinearSampler>(&chunk, source, dry, slots, num_sends),
            Resampler::Cubic => mix_chunk::<S, CubicSampler>(&chunk, source, dry, slots, num_sends),
        };
        pos += advanced;
        frac = new_frac;
        out_pos += count;

        // step through every buffer the position has moved past
        loop {
            let item = source.queue.get(current).and_then(Option::as_ref);
            let (item_frames, loop_start, loop_end) = item
                .map(|b| (b.frames(), b.loop_start(), b.loop_end()))
                .unwrap_or((0, 0, 0));

            if item.is_some() && loop_end > pos {
                break;
            }
            if looping && is_static && loop_end > loop_start {
                pos = (pos - loop_start) % (loop_end - loop_start) + loop_start;
                break;
            }
            if item_frames > pos {
                break;
            }

            if current + 1 < source.queue.len() {
                current += 1;
                source.buffers_played += 1;
            } else if looping {
                current = 0;
                source.buffers_played = 0;
            } else {
                source.state = SourceState::Stopped;
                source.buffers_played = source.queue.len();
                pos = 0;
                frac = 0;
                break;
            }
            pos -= item_frames;
        }

        if source.state != SourceState::Playing || out_pos >= samples_to_do {
            break;
        }
    }

    source.position_int = pos as u32;
    source.position_frac = frac;
}

/// Gathers a static buffer starting `prepad` frames before `pos`, repeating
/// the loop region when looping and padding with silence otherwise.
fn fill_static<S: Sample>(
    out: &mut [S],
    channels: usize,
    buffer: &Buffer,
    pos: usize,
    prepad: usize,
    looping: bool,
) {
    let Some(data) = S::samples(buffer.data()) else {
        out.fill(S::SILENCE);
        return;
    };
    let mut filled = 0;

    if !looping {
        let start = if pos >= prepad {
            pos - prepad
        } else {
            filled = fill_silence(out, 0, (prepad - pos) * channels);
            0
        };
        filled = copy_from(out, filled, data, start * channels, data.len());
        out[filled..].fill(S::SILENCE);
        return;
    }

    let loop_start = buffer.loop_start();
    let loop_end = buffer.loop_end();
    let start = if pos >= loop_start {
        let mut p = pos - loop_start;
        while p < prepad {
            p += loop_end - loop_start;
        }
        p - prepad + loop_start
    } else if pos >= prepad {
        pos - prepad
    } else {
        filled = fill_silence(out, 0, (prepad - pos) * channels);
        0
    };

    filled = copy_from(out, filled, data, start * channels, loop_end * channels);
    while filled < out.len() {
        filled = copy_from(out, filled, data, loop_start * channels, loop_end * channels);
    }
}

/// Gathers a streaming queue starting `prepad` frames before `pos` in item
/// `current`, borrowing the pre-padding from earlier items when there are any.
fn fill_streaming<S: Sample>(
    out: &mut [S],
    channels: usize,
    queue: &[Option<Arc<Buffer>>],
    current: usize,
    pos: usize,
    prepad: usize,
    looping: bool,
) {
    let mut filled = 0;
    let mut item = current;
    let mut skip;

    if pos >= prepad {
        skip = pos - prepad;
    } else {
        let mut need = prepad - pos;
        skip = 0;
        while need > 0 {
            if item == 0 && !looping {
                filled = fill_silence(out, 0, need * channels);
                break;
            }
            item = if item > 0 { item - 1 } else { queue.len() - 1 };
            if let Some(buffer) = &queue[item] {
                let frames = buffer.frames();
                if frames > need {
                    skip = frames - need;
                    break;
                }
                need -= frames;
            }
        }
    }

    let mut idle = 0;
    while filled < out.len() {
        let mut copied = false;
        if let Some(data) = queue[item].as_ref().and_then(|b| S::samples(b.data())) {
            let frames = data.len() / channels;
            if frames > skip {
                filled = copy_from(out, filled, data, skip * channels, data.len());
                skip = 0;
                copied = true;
            } else {
                skip -= frames;
            }
        }
        idle = if copied { 0 } else { idle + 1 };

        if item + 1 < queue.len() {
            item += 1;
        } else if looping && idle <= queue.len() {
            item = 0;
        } else {
            break;
        }
    }
    out[filled..].fill(S::SILENCE);
}

#[inline]
fn fill_silence<S: Sample>(out: &mut [S], filled: usize, count: usize) -> usize {
    let end = (filled + count).min(out.len());
    out[filled..end].fill(S::SILENCE);
    end
}

#[inline]
fn copy_from<S: Sample>(out: &mut [S], filled: usize, data: &[S], start: usize, end: usize) -> usize {
    let src = &data[start.min(end)..end];
    let n = src.len().min(out.len() - filled);
    out[filled..filled + n].copy_from_slice(&src[..n]);
    filled + n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, FmtChannels};
    use crate::source::SourceState;
    use approx::assert_relative_eq;

    const FC: usize = Channel::FrontCenter.index();

    fn playing(source: &mut Source) {
        assert!(source.start(true));
        source.params.dry_gains[0][FC] = 1.0;
        source.params.step = FRACTION_ONE;
    }

    fn mix(source: &mut Source, frames: usize) -> Vec<f32> {
        let mut dry = DryMix::new();
        let mut slots = SlotMap::new();
        let mut scratch = MixScratch::new();
        mix_source(source, &mut dry, &mut slots, &mut scratch, 0, frames);
        dry.buffer[..frames].iter().map(|f| f[FC]).collect()
    }

    #[test]
    fn resampler_padding_and_names() {
        assert_eq!(Resampler::Point.padding(), 0);
        assert_eq!(Resampler::Linear.padding(), 1);
        assert_eq!(Resampler::Cubic.padding(), 2);
        assert_eq!(Resampler::Cubic.pre_padding(), 1);
        assert_eq!("Cubic".parse::<Resampler>().unwrap(), Resampler::Cubic);
        assert!("sinc".parse::<Resampler>().is_err());
        assert_eq!(Resampler::default().to_string(), "linear");
    }

    #[test]
    fn unit_step_copies_samples() {
        let samples: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let buffer = Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, samples.clone()).unwrap());
        let mut source = Source::new(Resampler::Cubic);
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);

        let out = mix(&mut source, 32);
        for (got, want) in out.iter().zip(&samples) {
            assert_relative_eq!(*got, *want, epsilon = 1e-6);
        }
        assert_eq!(source.state(), SourceState::Playing);
        assert_eq!(source.playback_position(), (32, 0));
    }

    #[test]
    fn half_step_interpolates_linearly() {
        let buffer = Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.0, 1.0, 0.0, 1.0, 0.0]).unwrap());
        let mut source = Source::new(Resampler::Linear);
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);
        source.params.step = FRACTION_ONE / 2;

        let out = mix(&mut source, 4);
        let expected = [0.0, 0.5, 1.0, 0.5];
        for (got, want) in out.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn streaming_queue_plays_through_and_stops() {
        let mut source = Source::new(Resampler::Point);
        let buffers: Vec<_> = (0..3)
            .map(|i| Some(Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![i as f32; 100]).unwrap())))
            .collect();
        source.queue_buffers(&buffers).unwrap();
        playing(&mut source);

        let out = mix(&mut source, 400);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[150], 1.0);
        assert_eq!(out[299], 2.0);
        assert!(out[300..].iter().all(|&s| s == 0.0));
        assert_eq!(source.state(), SourceState::Stopped);
        assert_eq!(source.buffers_played(), 3);
        assert_eq!(source.playback_position(), (0, 0));
    }

    #[test]
    fn silent_gap_in_queue_is_skipped() {
        let mut source = Source::new(Resampler::Point);
        let tone = Some(Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![1.0; 10]).unwrap()));
        source.queue_buffers(&[tone.clone(), None, tone]).unwrap();
        playing(&mut source);

        let out = mix(&mut source, 30);
        assert!(out[..20].iter().all(|&s| s == 1.0));
        assert!(out[20..].iter().all(|&s| s == 0.0));
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn static_loop_stays_inside_loop_region() {
        let samples: Vec<f32> = (0..300).map(|i| i as f32).collect();
        let buffer = Buffer::from_f32(FmtChannels::Mono, 44100, samples).unwrap();
        let buffer = Arc::new(buffer.with_loop_points(100, 200).unwrap());
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(buffer)).unwrap();
        source.set_looping(true);
        playing(&mut source);

        let out = mix(&mut source, 1000);
        assert_eq!(out[99], 99.0);
        assert_eq!(out[199], 199.0);
        assert_eq!(out[200], 100.0);
        assert!(out.iter().all(|&s| s < 200.0));
        assert_eq!(source.state(), SourceState::Playing);
        let (pos, _) = source.playback_position();
        assert!((100..200).contains(&pos));
    }

    #[test]
    fn looping_queue_wraps_to_the_head() {
        let mut source = Source::new(Resampler::Point);
        let a = Some(Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![1.0; 50]).unwrap()));
        let b = Some(Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![2.0; 50]).unwrap()));
        source.queue_buffers(&[a, b]).unwrap();
        source.set_looping(true);
        playing(&mut source);

        let out = mix(&mut source, 250);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[60], 2.0);
        assert_eq!(out[110], 1.0);
        assert_eq!(out[249], 1.0);
        assert_eq!(source.state(), SourceState::Playing);
        assert_eq!(source.buffers_played(), 1);
    }

    #[test]
    fn integer_formats_are_normalised() {
        let mut source = Source::new(Resampler::Point);
        let buffer = Arc::new(Buffer::from_u8(FmtChannels::Mono, 44100, vec![255, 128, 1]).unwrap());
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);
        let out = mix(&mut source, 3);
        assert_relative_eq!(out[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[2], -1.0, epsilon = 1e-6);

        let mut source = Source::new(Resampler::Point);
        let buffer = Arc::new(Buffer::from_i16(FmtChannels::Mono, 44100, vec![32767, -32767]).unwrap());
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);
        let out = mix(&mut source, 2);
        assert_relative_eq!(out[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn stereo_channels_route_through_their_own_gains() {
        let mut source = Source::new(Resampler::Point);
        let buffer = Arc::new(Buffer::from_f32(FmtChannels::Stereo, 44100, [0.25f32, -0.5].repeat(8)).unwrap());
        source.set_buffer(Some(buffer)).unwrap();
        assert!(source.start(true));
        source.params.step = FRACTION_ONE;
        source.params.dry_gains[0][Channel::FrontLeft.index()] = 1.0;
        source.params.dry_gains[1][Channel::FrontRight.index()] = 1.0;

        let mut dry = DryMix::new();
        mix_source(&mut source, &mut dry, &mut SlotMap::new(), &mut MixScratch::new(), 0, 4);
        assert_relative_eq!(dry.buffer[0][Channel::FrontLeft.index()], 0.25, epsilon = 1e-6);
        assert_relative_eq!(dry.buffer[0][Channel::FrontRight.index()], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn switching_to_a_wider_resampler_still_advances() {
        let buffer = Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.5; 100_000]).unwrap());
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);
        source.needs_update = false;

        source.set_resampler(Resampler::Cubic);
        assert!(source.needs_update());

        // widest step point sampling allows, stale for the cubic window
        source.params.step = ((STACK_DATA_SIZE / 4 - 1) as u32) << FRACTION_BITS;
        let out = mix(&mut source, 8);
        assert_eq!(source.state(), SourceState::Playing);
        assert!(source.playback_position().0 > 8 * 4000);
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn source_without_buffers_stops() {
        let mut source = Source::new(Resampler::Linear);
        source.state = SourceState::Playing;
        let out = mix(&mut source, 16);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn pending_clicks_hold_the_next_sample() {
        let buffer = Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.5; 64]).unwrap());
        let mut source = Source::new(Resampler::Point);
        source.set_buffer(Some(buffer)).unwrap();
        playing(&mut source);

        let mut dry = DryMix::new();
        mix_source(&mut source, &mut dry, &mut SlotMap::new(), &mut MixScratch::new(), 0, 16);
        assert_relative_eq!(dry.click_removal[FC], -0.5, epsilon = 1e-6);
        assert_relative_eq!(dry.pending_clicks[FC], 0.5, epsilon = 1e-6);
    }
}
