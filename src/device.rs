//! Mixing device: owns the dry mix and the contexts, and drives one mix
//! cycle per call to [`PetalSonicDevice::mix_to_buffer`].

use crate::admission::AdmissionControl;
use crate::bs2b::Bs2b;
use crate::channel::{DevChannels, DevSampleType, MAX_CHANNELS};
use crate::config::PetalSonicDeviceDesc;
use crate::context::{Context, ContextId, DeviceLink};
use crate::error::{PetalSonicError, Result};
use crate::events::{EventSender, PetalSonicEvent, event_channel};
use crate::mixer::{BUFFERSIZE, DryMix, MixScratch, Resampler};
use crate::output::{OutputSample, write_frames};
use crate::panning::Panning;
use crossbeam_channel::Receiver;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Fixed properties of an open device, shared with every context.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub frequency: u32,
    pub channels: DevChannels,
    pub sample_type: DevSampleType,
    pub panning: Panning,
    pub num_aux_sends: usize,
    pub duplicate_stereo: bool,
    pub head_dampen: f32,
    pub default_resampler: Resampler,
    pub crossfeed_level: u32,
}

impl DeviceInfo {
    pub fn new(desc: &PetalSonicDeviceDesc) -> Result<Self> {
        desc.validate()?;
        let panning = Panning::new(desc.channels, &desc.config)?;
        Ok(Self {
            frequency: desc.frequency,
            channels: desc.channels,
            sample_type: desc.sample_type,
            panning,
            num_aux_sends: desc.num_aux_sends,
            duplicate_stereo: desc.duplicate_stereo,
            head_dampen: desc.head_dampen.clamp(0.0, 1.0),
            default_resampler: desc.default_resampler,
            crossfeed_level: desc.crossfeed_level,
        })
    }

    /// Bytes per output frame in the device's sample type.
    pub fn frame_size(&self) -> usize {
        self.channels.channel_count() * self.sample_type.bytes()
    }
}

/// Everything the mix cycle touches, behind one lock.
#[derive(Debug)]
struct MixState {
    dry: DryMix,
    scratch: MixScratch,
    contexts: Vec<Context>,
    bs2b: Option<Bs2b>,
}

/// An open output device.
///
/// The device owns its contexts. API calls reach a context through
/// [`context`](Self::context), which holds the same lock the mixer takes
/// for a whole cycle, so a mix never sees a half-applied change.
#[derive(Debug)]
pub struct PetalSonicDevice {
    info: Arc<DeviceInfo>,
    state: Mutex<MixState>,
    connected: Arc<AtomicBool>,
    admission: Arc<AdmissionControl>,
    event_tx: EventSender,
    event_rx: Receiver<PetalSonicEvent>,
    next_context: AtomicU64,
}

impl PetalSonicDevice {
    pub fn open(desc: PetalSonicDeviceDesc) -> Result<Self> {
        let info = DeviceInfo::new(&desc)?;

        let bs2b = match info.channels {
            DevChannels::Stereo => Bs2b::new(info.crossfeed_level, info.frequency),
            _ => None,
        };
        let (event_tx, event_rx) = event_channel(desc.event_capacity.max(1));

        log::info!(
            "Opened device: {:?} {:?} at {} Hz, speakers {:?}, {} aux sends",
            info.channels,
            info.sample_type,
            info.frequency,
            info.panning.speakers(),
            info.num_aux_sends
        );
        if let Some(bs2b) = &bs2b {
            log::info!("Stereo crossfeed enabled at level {}", bs2b.level());
        }

        Ok(Self {
            info: Arc::new(info),
            state: Mutex::new(MixState {
                dry: DryMix::new(),
                scratch: MixScratch::new(),
                contexts: Vec::new(),
                bs2b,
            }),
            connected: Arc::new(AtomicBool::new(true)),
            admission: Arc::new(AdmissionControl::new(desc.admission)),
            event_tx,
            event_rx,
            next_context: AtomicU64::new(1),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Current admission limit, `None` when admission control is off.
    pub fn max_sources(&self) -> Option<usize> {
        self.admission.max_sources()
    }

    pub fn events(&self) -> &Receiver<PetalSonicEvent> {
        &self.event_rx
    }

    /// Drains every pending event.
    pub fn poll_events(&self) -> Vec<PetalSonicEvent> {
        self.event_rx.try_iter().collect()
    }

    pub(crate) fn emit(&self, event: PetalSonicEvent) {
        self.event_tx.send(event);
    }

    pub fn create_context(&self) -> ContextId {
        let id = ContextId::new(self.next_context.fetch_add(1, Ordering::Relaxed));
        let link = DeviceLink {
            info: self.info.clone(),
            connected: self.connected.clone(),
            admission: self.admission.clone(),
            events: self.event_tx.clone(),
        };
        self.state.lock().contexts.push(Context::new(id, link));
        log::info!("Created {}", id);
        id
    }

    pub fn destroy_context(&self, id: ContextId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .contexts
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))?;
        state.contexts.remove(index);
        log::info!("Destroyed {}", id);
        Ok(())
    }

    /// Locks the device and hands out one of its contexts. The mixer is held
    /// off until the guard is dropped.
    pub fn context(&self, id: ContextId) -> Result<MappedMutexGuard<'_, Context>> {
        MutexGuard::try_map(self.state.lock(), |state| {
            state.contexts.iter_mut().find(|c| c.id() == id)
        })
        .map_err(|_| PetalSonicError::InvalidName(id.to_string()))
    }

    /// Mixes `frames` frames into `out`, interleaved in the layout's channel
    /// order. `out` is filled up to whichever is shorter. A disconnected
    /// device writes silence.
    pub fn mix_to_buffer<T: OutputSample>(&self, out: &mut [T], frames: usize) {
        let channels = self.info.channels.channel_count();
        let frames = frames.min(out.len() / channels);
        let out = &mut out[..frames * channels];

        if !self.is_connected() {
            out.fill(T::from_mix(0.0));
            return;
        }

        let started = Instant::now();
        let mut state = self.state.lock();
        let MixState {
            dry,
            scratch,
            contexts,
            bs2b,
        } = &mut *state;

        for chunk in out.chunks_mut(BUFFERSIZE * channels) {
            let samples_to_do = chunk.len() / channels;

            for frame in &mut dry.buffer[..samples_to_do] {
                *frame = [0.0; MAX_CHANNELS];
            }

            for context in contexts.iter_mut() {
                context.mix(dry, scratch, samples_to_do);
            }

            declick(dry, samples_to_do);

            write_frames(
                &dry.buffer[..samples_to_do],
                self.info.panning.matrix(),
                self.info.channels,
                bs2b.as_mut(),
                chunk,
            );
        }

        let active_sources = contexts.iter().map(|c| c.active_sources().len()).sum();
        drop(state);

        let elapsed_us = started.elapsed().as_micros() as u64;
        if let Some((old_limit, new_limit)) =
            self.admission
                .update(elapsed_us, active_sources, frames, self.info.frequency)
        {
            log::debug!(
                "Admission limit {} -> {} ({} us for {} sources)",
                old_limit,
                new_limit,
                elapsed_us,
                active_sources
            );
            self.event_tx.send(PetalSonicEvent::AdmissionLimitChanged {
                old_limit,
                new_limit,
            });
        }
    }

    /// Mixes `frames` frames into `out` as native-endian bytes of the
    /// device's sample type.
    pub fn mix_to_bytes(&self, out: &mut [u8], frames: usize) {
        let frames = frames.min(out.len() / self.info.frame_size());
        match self.info.sample_type {
            DevSampleType::Byte => self.mix_encoded(out, frames, i8::to_ne_bytes),
            DevSampleType::UByte => self.mix_encoded(out, frames, u8::to_ne_bytes),
            DevSampleType::Short => self.mix_encoded(out, frames, i16::to_ne_bytes),
            DevSampleType::UShort => self.mix_encoded(out, frames, u16::to_ne_bytes),
            DevSampleType::Float => self.mix_encoded(out, frames, f32::to_ne_bytes),
        }
    }

    fn mix_encoded<T: OutputSample, const N: usize>(
        &self,
        out: &mut [u8],
        frames: usize,
        to_bytes: fn(T) -> [u8; N],
    ) {
        let mut samples = vec![T::default(); frames * self.info.channels.channel_count()];
        self.mix_to_buffer(&mut samples, frames);
        for (bytes, sample) in out.chunks_exact_mut(N).zip(samples) {
            bytes.copy_from_slice(&to_bytes(sample));
        }
    }

    /// Marks the device lost and force-stops every playing source. Safe to
    /// call from a backend thread while another thread is mixing.
    pub fn handle_disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        for context in state.contexts.iter_mut() {
            context.stop_all();
        }
        drop(state);

        log::info!("Device disconnected, all sources stopped");
        self.event_tx.send(PetalSonicEvent::DeviceDisconnected);
    }
}

fn declick(dry: &mut DryMix, samples_to_do: usize) {
    for frame in &mut dry.buffer[..samples_to_do] {
        for (sample, click) in frame.iter_mut().zip(dry.click_removal.iter_mut()) {
            *click -= *click / 256.0;
            *sample += *click;
        }
    }
    for (click, pending) in dry.click_removal.iter_mut().zip(dry.pending_clicks.iter_mut()) {
        *click += *pending;
        *pending = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::buffer::Buffer;
    use crate::channel::FmtChannels;
    use crate::effects::{EchoProps, EffectProps};
    use crate::math::Vec3;
    use crate::source::{SourceSend, SourceState};
    use approx::assert_relative_eq;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn tone(frames: usize, value: f32) -> Arc<Buffer> {
        Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![value; frames]).unwrap())
    }

    #[test]
    fn zero_rate_is_a_configuration_error() {
        let err = PetalSonicDevice::open(PetalSonicDeviceDesc::default().frequency(0)).unwrap_err();
        assert!(matches!(err, PetalSonicError::Configuration(_)));
    }

    #[test]
    fn crossfeed_only_on_stereo() {
        let stereo = PetalSonicDevice::open(PetalSonicDeviceDesc::default().crossfeed_level(3)).unwrap();
        assert!(stereo.state.lock().bs2b.is_some());
        let quad = PetalSonicDevice::open(
            PetalSonicDeviceDesc::default()
                .channels(DevChannels::Quad)
                .crossfeed_level(3),
        )
        .unwrap();
        assert!(quad.state.lock().bs2b.is_none());
    }

    #[test]
    fn unknown_context_is_invalid_name() {
        let device = PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap();
        let id = device.create_context();
        device.destroy_context(id).unwrap();
        assert!(matches!(device.context(id), Err(PetalSonicError::InvalidName(_))));
        assert!(device.destroy_context(id).is_err());
    }

    #[test]
    fn silent_device_writes_silence() {
        let device = PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap();
        device.create_context();
        let mut out = vec![1.0f32; 512];
        device.mix_to_buffer(&mut out, 256);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn centred_source_plays_equally_on_both_channels() {
        init_logger();
        let device = PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap();
        let ctx = device.create_context();
        let id = {
            let mut context = device.context(ctx).unwrap();
            let id = context.create_source();
            let source = context.source_mut(id).unwrap();
            source.set_buffer(Some(tone(10_000, 0.5))).unwrap();
            source.set_position(Vec3::new(0.0, 0.0, -1.0)).unwrap();
            context.play_source(id).unwrap();
            id
        };

        let mut out = vec![0.0f32; 2 * 1024];
        device.mix_to_buffer(&mut out, 1024);
        let (left, right) = (out[2000], out[2001]);
        assert!(left > 0.0);
        assert_relative_eq!(left, right, epsilon = 1e-6);
        assert_eq!(
            device.context(ctx).unwrap().source(id).unwrap().state(),
            SourceState::Playing
        );
    }

    #[test]
    fn large_requests_run_in_several_chunks() {
        let device = PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap();
        let ctx = device.create_context();
        {
            let mut context = device.context(ctx).unwrap();
            let id = context.create_source();
            context.source_mut(id).unwrap().set_buffer(Some(tone(5000, 0.5))).unwrap();
            context.play_source(id).unwrap();
        }

        let frames = BUFFERSIZE * 2 + 100;
        let mut out = vec![0i16; frames * 2];
        device.mix_to_buffer(&mut out, frames);

        // still sounding in the second chunk, silent once the 5000 frames ran out
        assert!(out[2 * 4500] > 0);
        assert!(out[2 * 6000..].iter().all(|&s| s == 0));
        let events = device.poll_events();
        assert!(events.iter().any(|e| matches!(e, PetalSonicEvent::SourceStopped { .. })));
    }

    #[test]
    fn bytes_follow_the_sample_type() {
        let device = PetalSonicDevice::open(
            PetalSonicDeviceDesc::default()
                .channels(DevChannels::Mono)
                .sample_type(DevSampleType::UByte),
        )
        .unwrap();
        device.create_context();
        let mut out = vec![0u8; 64];
        device.mix_to_bytes(&mut out, 64);
        assert!(out.iter().all(|&b| b == 0x80));

        let device = PetalSonicDevice::open(
            PetalSonicDeviceDesc::default().sample_type(DevSampleType::UShort),
        )
        .unwrap();
        let mut out = vec![0u8; 16];
        device.mix_to_bytes(&mut out, 4);
        assert_eq!(&out[..2], &32768u16.to_ne_bytes());
    }

    #[test]
    fn disconnect_stops_everything_and_silences_output() {
        init_logger();
        let device = PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap();
        let ctx = device.create_context();
        let id = {
            let mut context = device.context(ctx).unwrap();
            let slot = context.create_effect_slot();
            context
                .load_effect(slot, EffectProps::Echo(EchoProps::default()))
                .unwrap();
            let id = context.create_source();
            context.source_mut(id).unwrap().set_buffer(Some(tone(100_000, 0.5))).unwrap();
            context
                .set_source_send(id, 0, SourceSend { slot: Some(slot), ..Default::default() })
                .unwrap();
            context.play_source(id).unwrap();
            id
        };

        let mut out = vec![0.0f32; 2 * 8192];
        device.mix_to_buffer(&mut out, 8192);
        device.handle_disconnect();
        device.handle_disconnect();

        assert!(!device.is_connected());
        let mut context = device.context(ctx).unwrap();
        assert_eq!(context.source(id).unwrap().state(), SourceState::Stopped);
        context.play_source(id).unwrap();
        assert_eq!(context.source(id).unwrap().state(), SourceState::Stopped);
        drop(context);

        device.mix_to_buffer(&mut out, 8192);
        assert!(out.iter().all(|&s| s == 0.0));

        let events = device.poll_events();
        let disconnects = events.iter().filter(|e| **e == PetalSonicEvent::DeviceDisconnected).count();
        assert_eq!(disconnects, 1);
        assert!(events.contains(&PetalSonicEvent::SourceStopped { source_id: id }));
    }

    #[test]
    fn idle_cycles_keep_admission_at_start() {
        let device = PetalSonicDevice::open(
            PetalSonicDeviceDesc::default().admission(Some(AdmissionLimits::default())),
        )
        .unwrap();
        device.create_context();
        let mut out = vec![0.0f32; 2 * 256];
        device.mix_to_buffer(&mut out, 256);
        assert_eq!(device.max_sources(), Some(AdmissionLimits::default().start));
        assert!(device.poll_events().is_empty());
    }

    #[test]
    fn declick_decays_toward_zero() {
        let mut dry = DryMix::new();
        dry.pending_clicks[0] = 1.0;
        declick(&mut dry, 1);
        assert_eq!(dry.click_removal[0], 1.0);
        assert_eq!(dry.buffer[0][0], 0.0);

        declick(&mut dry, 256);
        assert!(dry.buffer[0][0] > 0.99);
        assert!(dry.buffer[255][0] < dry.buffer[0][0]);
        assert!(dry.click_removal[0] < 0.4);
    }
}
