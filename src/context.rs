//! Contexts: a listener, its sources and effect slots, and the active set

use crate::admission::AdmissionControl;
use crate::device::DeviceInfo;
use crate::effects::EffectProps;
use crate::error::{PetalSonicError, Result, check_range};
use crate::events::{EventSender, PetalSonicEvent};
use crate::listener::Listener;
use crate::math::{Pose, SPEED_OF_SOUND_METRES_PER_SEC, Vec3};
use crate::mixer::{DryMix, MixScratch, mix_source};
use crate::params::update_source_params;
use crate::slot::{EffectSlot, SlotId, SlotMap};
use crate::source::{DistanceModel, Source, SourceId, SourceSend, SourceState};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

/// Context-wide propagation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextSettings {
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    pub distance_model: DistanceModel,
    /// Let each source's own distance model override `distance_model`.
    pub source_distance_model: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METRES_PER_SEC,
            distance_model: DistanceModel::InverseClamped,
            source_distance_model: false,
        }
    }
}

/// Device state every context shares.
#[derive(Debug, Clone)]
pub(crate) struct DeviceLink {
    pub info: Arc<DeviceInfo>,
    pub connected: Arc<AtomicBool>,
    pub admission: Arc<AdmissionControl>,
    pub events: EventSender,
}

#[derive(Debug)]
pub struct Context {
    id: ContextId,
    link: DeviceLink,
    listener: Listener,
    settings: ContextSettings,
    sources: HashMap<SourceId, Source>,
    slots: SlotMap,
    /// Sources the mixer visits; stopped ones are dropped on the next pass.
    active: Vec<SourceId>,
    priority_slots: usize,
    next_id: u64,
}

impl Context {
    pub(crate) fn new(id: ContextId, link: DeviceLink) -> Self {
        Self {
            id,
            link,
            listener: Listener::default(),
            settings: ContextSettings::default(),
            sources: HashMap::new(),
            slots: SlotMap::new(),
            active: Vec::new(),
            priority_slots: 0,
            next_id: 1,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.link.info
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub fn active_sources(&self) -> &[SourceId] {
        &self.active
    }

    pub fn priority_slots(&self) -> usize {
        self.priority_slots
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn mark_all_dirty(&mut self) {
        for source in self.sources.values_mut() {
            source.mark_dirty();
        }
    }

    fn mark_slot_users_dirty(&mut self, slot: SlotId) {
        for source in self.sources.values_mut().filter(|s| s.sends_to(slot)) {
            source.mark_dirty();
        }
    }

    // ---- context settings ----

    pub fn set_doppler_factor(&mut self, factor: f32) -> Result<()> {
        check_range("doppler factor", factor, 0.0, f32::MAX)?;
        self.settings.doppler_factor = factor;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_doppler_velocity(&mut self, velocity: f32) -> Result<()> {
        if !(velocity > 0.0 && velocity.is_finite()) {
            return Err(PetalSonicError::InvalidValue(format!(
                "doppler velocity must be positive, got {}",
                velocity
            )));
        }
        self.settings.doppler_velocity = velocity;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_speed_of_sound(&mut self, speed: f32) -> Result<()> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(PetalSonicError::InvalidValue(format!(
                "speed of sound must be positive, got {}",
                speed
            )));
        }
        self.settings.speed_of_sound = speed;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_distance_model(&mut self, model: DistanceModel) {
        self.settings.distance_model = model;
        self.mark_all_dirty();
    }

    pub fn set_source_distance_model(&mut self, enabled: bool) {
        self.settings.source_distance_model = enabled;
        self.mark_all_dirty();
    }

    /// Reserves part of the admission limit for high-priority sources.
    pub fn set_priority_slots(&mut self, slots: usize) {
        self.priority_slots = slots;
    }

    // ---- listener ----

    pub fn set_listener_position(&mut self, position: Vec3) -> Result<()> {
        self.listener.set_position(position)?;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_listener_velocity(&mut self, velocity: Vec3) -> Result<()> {
        self.listener.set_velocity(velocity)?;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_listener_orientation(&mut self, forward: Vec3, up: Vec3) -> Result<()> {
        self.listener.set_orientation(forward, up)?;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_listener_pose(&mut self, pose: Pose) -> Result<()> {
        self.listener.set_pose(pose)?;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_listener_gain(&mut self, gain: f32) -> Result<()> {
        self.listener.set_gain(gain)?;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn set_meters_per_unit(&mut self, meters: f32) -> Result<()> {
        self.listener.set_meters_per_unit(meters)?;
        self.mark_all_dirty();
        Ok(())
    }

    // ---- sources ----

    pub fn create_source(&mut self) -> SourceId {
        let id = SourceId::new(self.next_id());
        self.sources.insert(id, Source::new(self.link.info.default_resampler));
        id
    }

    /// Removes a source, releasing its buffers and slot references.
    pub fn delete_source(&mut self, id: SourceId) -> Result<()> {
        self.sources
            .remove(&id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))?;
        self.active.retain(|&active| active != id);
        Ok(())
    }

    pub fn source(&self, id: SourceId) -> Result<&Source> {
        self.sources
            .get(&id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))
    }

    /// Mutable access for attribute and queue changes. Setters mark the
    /// source dirty so its mix parameters are rebuilt before the next mix.
    pub fn source_mut(&mut self, id: SourceId) -> Result<&mut Source> {
        self.sources
            .get_mut(&id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))
    }

    /// Routes send `index` of a source. The slot, if any, must exist and the
    /// index must be below the device's send count.
    pub fn set_source_send(&mut self, id: SourceId, index: usize, send: SourceSend) -> Result<()> {
        if index >= self.link.info.num_aux_sends {
            return Err(PetalSonicError::InvalidValue(format!(
                "send {} is out of range, device has {}",
                index, self.link.info.num_aux_sends
            )));
        }
        if let Some(slot) = send.slot
            && !self.slots.contains_key(&slot)
        {
            return Err(PetalSonicError::InvalidName(slot.to_string()));
        }
        self.source_mut(id)?.set_send(index, send);
        Ok(())
    }

    pub fn play_source(&mut self, id: SourceId) -> Result<()> {
        self.play_sources(&[id])
    }

    /// Starts each source. Sources refused by admission control are skipped
    /// and reported with [`PetalSonicEvent::SourceRefused`].
    pub fn play_sources(&mut self, ids: &[SourceId]) -> Result<()> {
        self.check_ids(ids)?;
        let connected = self.link.connected.load(Ordering::Acquire);

        for &id in ids {
            let Some(source) = self.sources.get_mut(&id) else {
                continue;
            };

            if !self
                .link
                .admission
                .can_admit(self.active.len(), source.priority, self.priority_slots)
            {
                let max_sources = self.link.admission.max_sources().unwrap_or(usize::MAX);
                log::warn!(
                    "Not starting {}: {} sources active, limit {} with {} reserved",
                    id,
                    self.active.len(),
                    max_sources,
                    self.priority_slots
                );
                self.link.events.send(PetalSonicEvent::SourceRefused {
                    source_id: id,
                    active_sources: self.active.len(),
                    max_sources,
                });
                continue;
            }

            if source.start(connected) && !self.active.contains(&id) {
                self.active.push(id);
            }
        }
        Ok(())
    }

    pub fn pause_sources(&mut self, ids: &[SourceId]) -> Result<()> {
        self.check_ids(ids)?;
        for id in ids {
            if let Some(source) = self.sources.get_mut(id) {
                source.pause();
            }
        }
        Ok(())
    }

    pub fn pause_source(&mut self, id: SourceId) -> Result<()> {
        self.pause_sources(&[id])
    }

    pub fn stop_sources(&mut self, ids: &[SourceId]) -> Result<()> {
        self.check_ids(ids)?;
        for id in ids {
            if let Some(source) = self.sources.get_mut(id) {
                source.stop();
            }
        }
        Ok(())
    }

    pub fn stop_source(&mut self, id: SourceId) -> Result<()> {
        self.stop_sources(&[id])
    }

    pub fn rewind_sources(&mut self, ids: &[SourceId]) -> Result<()> {
        self.check_ids(ids)?;
        for id in ids {
            if let Some(source) = self.sources.get_mut(id) {
                source.rewind();
            }
        }
        Ok(())
    }

    pub fn rewind_source(&mut self, id: SourceId) -> Result<()> {
        self.rewind_sources(&[id])
    }

    fn check_ids(&self, ids: &[SourceId]) -> Result<()> {
        match ids.iter().find(|id| !self.sources.contains_key(id)) {
            Some(missing) => Err(PetalSonicError::InvalidName(missing.to_string())),
            None => Ok(()),
        }
    }

    // ---- effect slots ----

    pub fn create_effect_slot(&mut self) -> SlotId {
        let id = SlotId::new(self.next_id());
        self.slots.insert(id, EffectSlot::new());
        id
    }

    /// Deletes a slot no source sends to.
    pub fn delete_effect_slot(&mut self, id: SlotId) -> Result<()> {
        if !self.slots.contains_key(&id) {
            return Err(PetalSonicError::InvalidName(id.to_string()));
        }
        if let Some((source, _)) = self.sources.iter().find(|(_, s)| s.sends_to(id)) {
            return Err(PetalSonicError::InvalidOperation(format!(
                "{} is still used by {}",
                id, source
            )));
        }
        self.slots.remove(&id);
        Ok(())
    }

    pub fn effect_slot(&self, id: SlotId) -> Result<&EffectSlot> {
        self.slots
            .get(&id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))
    }

    fn effect_slot_mut(&mut self, id: SlotId) -> Result<&mut EffectSlot> {
        self.slots
            .get_mut(&id)
            .ok_or_else(|| PetalSonicError::InvalidName(id.to_string()))
    }

    pub fn load_effect(&mut self, id: SlotId, props: EffectProps) -> Result<()> {
        let info = self.link.info.clone();
        self.effect_slot_mut(id)?.load_effect(&info, props)?;
        self.mark_slot_users_dirty(id);
        Ok(())
    }

    pub fn set_slot_gain(&mut self, id: SlotId, gain: f32) -> Result<()> {
        self.effect_slot_mut(id)?.set_gain(gain)?;
        self.mark_slot_users_dirty(id);
        Ok(())
    }

    pub fn set_slot_aux_send_auto(&mut self, id: SlotId, auto: bool) -> Result<()> {
        self.effect_slot_mut(id)?.set_aux_send_auto(auto);
        self.mark_slot_users_dirty(id);
        Ok(())
    }

    // ---- mixing ----

    /// Mixes one chunk of every active source, then runs the effect slots
    /// over what the sources sent them.
    pub(crate) fn mix(&mut self, dry: &mut DryMix, scratch: &mut MixScratch, samples_to_do: usize) {
        let Self {
            link,
            listener,
            settings,
            sources,
            slots,
            active,
            ..
        } = self;
        let info = &*link.info;

        let mut i = 0;
        while i < active.len() {
            let id = active[i];
            let Some(source) = sources.get_mut(&id).filter(|s| s.state == SourceState::Playing) else {
                active.swap_remove(i);
                continue;
            };

            update_source_params(source, info, listener, settings, slots);

            let played_before = source.buffers_played;
            mix_source(source, dry, slots, scratch, info.num_aux_sends, samples_to_do);

            if source.buffers_played > played_before {
                for buffer in source.queue[played_before..source.buffers_played].iter().flatten() {
                    link.events.send(PetalSonicEvent::BufferProcessed {
                        source_id: id,
                        buffer_id: buffer.id(),
                    });
                }
            }
            if source.state != SourceState::Playing {
                log::debug!("{} ran out of data and stopped", id);
                link.events.send(PetalSonicEvent::SourceStopped { source_id: id });
            }
            i += 1;
        }

        for slot in slots.values_mut() {
            slot.process(&mut dry.buffer[..samples_to_do]);
        }
    }

    /// Forced stop of everything playing, used on disconnect.
    pub(crate) fn stop_all(&mut self) {
        for (&id, source) in self.sources.iter_mut() {
            if source.state == SourceState::Playing {
                source.force_stop();
                self.link.events.send(PetalSonicEvent::SourceStopped { source_id: id });
            }
        }
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::buffer::Buffer;
    use crate::channel::{Channel, FmtChannels};
    use crate::config::PetalSonicDeviceDesc;
    use crate::effects::{EffectType, ReverbProps};
    use crate::events::event_channel;
    use crate::source::PRIORITY_ALWAYS_ADMIT;
    use crossbeam_channel::Receiver;

    fn context_with(admission: AdmissionControl) -> (Context, Receiver<PetalSonicEvent>, Arc<AtomicBool>) {
        let info = Arc::new(DeviceInfo::new(&PetalSonicDeviceDesc::default().num_aux_sends(2)).unwrap());
        let (events, rx) = event_channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        let link = DeviceLink {
            info,
            connected: connected.clone(),
            admission: Arc::new(admission),
            events,
        };
        (Context::new(ContextId::new(1), link), rx, connected)
    }

    fn new_context() -> (Context, Receiver<PetalSonicEvent>) {
        let (context, rx, _) = context_with(AdmissionControl::with_cores(None, 2));
        (context, rx)
    }

    fn tone(frames: usize) -> Arc<Buffer> {
        Arc::new(Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.25; frames]).unwrap())
    }

    fn loaded_source(context: &mut Context, frames: usize) -> SourceId {
        let id = context.create_source();
        context.source_mut(id).unwrap().set_buffer(Some(tone(frames))).unwrap();
        id
    }

    #[test]
    fn unknown_ids_are_invalid_names() {
        let (mut context, _) = new_context();
        let bogus = SourceId::new(99);
        assert!(matches!(context.play_source(bogus), Err(PetalSonicError::InvalidName(_))));
        assert!(matches!(context.source(bogus), Err(PetalSonicError::InvalidName(_))));
        assert!(matches!(
            context.load_effect(SlotId::new(99), EffectProps::Null),
            Err(PetalSonicError::InvalidName(_))
        ));
    }

    #[test]
    fn play_adds_to_active_set_once() {
        let (mut context, _) = new_context();
        let id = loaded_source(&mut context, 100);
        context.play_source(id).unwrap();
        context.play_source(id).unwrap();
        assert_eq!(context.active_sources(), &[id]);
        assert_eq!(context.source(id).unwrap().state(), SourceState::Playing);
    }

    #[test]
    fn empty_source_goes_straight_to_stopped() {
        let (mut context, _) = new_context();
        let id = context.create_source();
        context.play_source(id).unwrap();
        assert_eq!(context.source(id).unwrap().state(), SourceState::Stopped);
        assert!(context.active_sources().is_empty());
    }

    #[test]
    fn disconnected_device_refuses_to_play() {
        let (mut context, _, connected) = context_with(AdmissionControl::with_cores(None, 2));
        connected.store(false, Ordering::Release);
        let id = loaded_source(&mut context, 100);
        context.play_source(id).unwrap();
        assert_eq!(context.source(id).unwrap().state(), SourceState::Stopped);
    }

    #[test]
    fn admission_refuses_beyond_limit_except_priority() {
        let limits = AdmissionLimits {
            low: 2,
            start: 2,
            high: 8,
        };
        let (mut context, rx, _) = context_with(AdmissionControl::with_cores(Some(limits), 2));
        let ids: Vec<_> = (0..3).map(|_| loaded_source(&mut context, 100)).collect();
        context.play_sources(&ids).unwrap();

        assert_eq!(context.active_sources().len(), 2);
        assert_eq!(context.source(ids[2]).unwrap().state(), SourceState::Initial);
        let refused = rx.try_iter().find(|e| matches!(e, PetalSonicEvent::SourceRefused { .. }));
        assert_eq!(refused.and_then(|e| e.source_id()), Some(ids[2]));

        context.source_mut(ids[2]).unwrap().set_priority(PRIORITY_ALWAYS_ADMIT);
        context.play_source(ids[2]).unwrap();
        assert_eq!(context.active_sources().len(), 3);
    }

    #[test]
    fn listener_changes_dirty_every_source() {
        let (mut context, _) = new_context();
        let id = loaded_source(&mut context, 100);
        context.source_mut(id).unwrap().needs_update = false;
        context.set_listener_gain(0.5).unwrap();
        assert!(context.source(id).unwrap().needs_update());
    }

    #[test]
    fn slot_changes_dirty_only_its_users() {
        let (mut context, _) = new_context();
        let slot = context.create_effect_slot();
        let user = loaded_source(&mut context, 100);
        let other = loaded_source(&mut context, 100);
        context
            .set_source_send(user, 0, SourceSend { slot: Some(slot), ..Default::default() })
            .unwrap();
        for id in [user, other] {
            context.source_mut(id).unwrap().needs_update = false;
        }

        context.set_slot_gain(slot, 0.5).unwrap();
        assert!(context.source(user).unwrap().needs_update());
        assert!(!context.source(other).unwrap().needs_update());
    }

    #[test]
    fn sends_are_validated() {
        let (mut context, _) = new_context();
        let id = loaded_source(&mut context, 100);
        let slot = context.create_effect_slot();
        let send = SourceSend { slot: Some(slot), ..Default::default() };
        assert!(matches!(
            context.set_source_send(id, 2, send),
            Err(PetalSonicError::InvalidValue(_))
        ));
        let missing = SourceSend { slot: Some(SlotId::new(77)), ..Default::default() };
        assert!(matches!(
            context.set_source_send(id, 0, missing),
            Err(PetalSonicError::InvalidName(_))
        ));
    }

    #[test]
    fn referenced_slot_cannot_be_deleted() {
        let (mut context, _) = new_context();
        let slot = context.create_effect_slot();
        let id = loaded_source(&mut context, 100);
        context
            .set_source_send(id, 0, SourceSend { slot: Some(slot), ..Default::default() })
            .unwrap();
        assert!(matches!(
            context.delete_effect_slot(slot),
            Err(PetalSonicError::InvalidOperation(_))
        ));

        context.set_source_send(id, 0, SourceSend::default()).unwrap();
        context.delete_effect_slot(slot).unwrap();
        assert!(context.effect_slot(slot).is_err());
    }

    #[test]
    fn mix_reports_finished_sources_and_compacts() {
        let (mut context, rx) = new_context();
        let short = loaded_source(&mut context, 10);
        let long = loaded_source(&mut context, 10_000);
        context.play_sources(&[short, long]).unwrap();

        let mut dry = DryMix::new();
        let mut scratch = MixScratch::new();
        context.mix(&mut dry, &mut scratch, 64);
        assert_eq!(context.source(short).unwrap().state(), SourceState::Stopped);
        assert!(dry.buffer[0][Channel::FrontLeft.index()] > 0.0);

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&PetalSonicEvent::SourceStopped { source_id: short }));
        assert!(events.iter().any(|e| matches!(
            e,
            PetalSonicEvent::BufferProcessed { source_id, .. } if *source_id == short
        )));

        context.mix(&mut dry, &mut scratch, 64);
        assert_eq!(context.active_sources(), &[long]);
    }

    #[test]
    fn wet_signal_reaches_the_output_through_a_slot() {
        let (mut context, _) = new_context();
        let slot = context.create_effect_slot();
        context.load_effect(slot, EffectProps::new(EffectType::Echo)).unwrap();
        let id = loaded_source(&mut context, 20_000);
        context
            .set_source_send(id, 0, SourceSend { slot: Some(slot), ..Default::default() })
            .unwrap();
        context.play_source(id).unwrap();

        let mut dry = DryMix::new();
        let mut scratch = MixScratch::new();
        let mut dry_only = DryMix::new();
        context.mix(&mut dry, &mut scratch, 4096);
        context.mix(&mut dry, &mut scratch, 4096);

        // second chunk: echo taps at 0.1 s and 0.2 s are now audible
        let (mut plain, _) = new_context();
        let plain_id = loaded_source(&mut plain, 20_000);
        plain.play_source(plain_id).unwrap();
        plain.mix(&mut dry_only, &mut scratch, 4096);
        plain.mix(&mut dry_only, &mut scratch, 4096);

        let fr = Channel::FrontRight.index();
        assert!(dry.buffer[4095][fr] > dry_only.buffer[4095][fr]);
    }

    #[test]
    fn reverb_slot_sends_room_attenuated_signal() {
        let (mut context, _) = new_context();
        let slot = context.create_effect_slot();
        context
            .load_effect(slot, EffectProps::Reverb(ReverbProps::default()))
            .unwrap();
        let id = loaded_source(&mut context, 100);
        context
            .set_source_send(id, 0, SourceSend { slot: Some(slot), ..Default::default() })
            .unwrap();
        context.play_source(id).unwrap();

        let mut dry = DryMix::new();
        context.mix(&mut dry, &mut MixScratch::new(), 32);
        assert!(context.source(id).unwrap().mix_params().sends[0].wet_gain > 0.0);
    }

    #[test]
    fn stop_all_forces_playing_sources_off() {
        let (mut context, rx) = new_context();
        let id = loaded_source(&mut context, 1000);
        context.play_source(id).unwrap();
        context.stop_all();
        assert_eq!(context.source(id).unwrap().state(), SourceState::Stopped);
        assert!(context.active_sources().is_empty());
        assert_eq!(rx.try_recv(), Ok(PetalSonicEvent::SourceStopped { source_id: id }));
    }
}
