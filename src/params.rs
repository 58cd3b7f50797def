//! Per-source mix parameter calculation
//!
//! Turns a source's attributes, the listener and the context settings into
//! the cached [`MixParams`](crate::source::MixParams): resampling step, dry
//! gain matrix, low-pass coefficients and per-send wet gains. Mono sources
//! go through the full spatial path; anything with more channels is routed
//! straight to the matching speakers.

use crate::buffer::Buffer;
use crate::channel::{Channel, DevChannels, FmtChannels, MAX_CHANNELS, frame_size};
use crate::context::ContextSettings;
use crate::device::DeviceInfo;
use crate::effects::EffectType;
use crate::filter::{cutoff_cos, lp_coeff_calc};
use crate::listener::Listener;
use crate::math::{
    AIR_ABSORB_GAIN_DB_HF, FRACTION_BITS, FRACTION_ONE, SPEED_OF_SOUND_METRES_PER_SEC, Vec3,
    normalize_or_keep,
};
use crate::mixer::{Resampler, STACK_DATA_SIZE};
use crate::panning::cart_to_lut_pos;
use crate::slot::{EffectSlot, SlotMap};
use crate::source::{DistanceModel, MAX_SENDS, Source};
use std::f32::consts::FRAC_1_SQRT_2;

/// Recomputes `source`'s mix parameters if it is dirty.
pub fn update_source_params(
    source: &mut Source,
    device: &DeviceInfo,
    listener: &Listener,
    settings: &ContextSettings,
    slots: &SlotMap,
) {
    if !source.needs_update {
        return;
    }
    if source.is_spatialized() {
        calc_source_params(source, device, listener, settings, slots);
    } else {
        calc_non_attn_source_params(source, device, listener, slots);
    }
    source.needs_update = false;
}

/// Fixed-point step for `pitch`, limited so one pass of the mixer always
/// fits its padded window in the scratch buffer.
fn resample_step(pitch: f32, buffer: &Buffer, device: &DeviceInfo, resampler: Resampler) -> u32 {
    let frame = frame_size(buffer.channels(), buffer.fmt_type());
    let reserved = resampler.padding() + resampler.pre_padding() + 1;
    let max_step = (STACK_DATA_SIZE / frame)
        .saturating_sub(reserved)
        .min((i32::MAX >> FRACTION_BITS) as usize) as u32;

    let pitch = pitch * buffer.frequency() as f32 / device.frequency as f32;
    if pitch > max_step as f32 {
        max_step << FRACTION_BITS
    } else {
        ((pitch * FRACTION_ONE as f32) as u32).max(1)
    }
}

/// The slot a send feeds, if it exists and has an effect loaded.
fn live_slot<'a>(source: &Source, index: usize, slots: &'a SlotMap) -> Option<&'a EffectSlot> {
    source.sends[index]
        .slot
        .and_then(|id| slots.get(&id))
        .filter(|slot| slot.effect_type() != EffectType::Null)
}

/// Parameters for multichannel sources: no distance, cone or doppler
/// processing, each input channel goes to its own speaker.
pub fn calc_non_attn_source_params(
    source: &mut Source,
    device: &DeviceInfo,
    listener: &Listener,
    slots: &SlotMap,
) {
    let Some(buffer) = source.first_buffer().cloned() else {
        return;
    };
    source.params.step = resample_step(source.pitch, &buffer, device, source.resampler);

    let listener_gain = listener.gain;
    let dry_gain = source.gain.max(source.min_gain).min(source.max_gain) * source.direct_filter.gain();
    let dry_gain_hf = source.direct_filter.gain_hf();

    let gains = &mut source.params.dry_gains;
    *gains = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    let mut route = |input: usize, speakers: &[Channel], scale: f32| {
        for chan in speakers {
            gains[input][chan.index()] = dry_gain * scale * listener_gain;
        }
    };

    use Channel::*;
    match buffer.channels() {
        FmtChannels::Mono => route(0, &[FrontCenter], 1.0),
        FmtChannels::Stereo if device.duplicate_stereo => match device.channels {
            DevChannels::Mono | DevChannels::Stereo => {
                route(0, &[FrontLeft], 1.0);
                route(1, &[FrontRight], 1.0);
            }
            DevChannels::Quad | DevChannels::X51 => {
                let scale = FRAC_1_SQRT_2;
                route(0, &[FrontLeft, BackLeft], scale);
                route(1, &[FrontRight, BackRight], scale);
            }
            DevChannels::X61 => {
                let scale = FRAC_1_SQRT_2;
                route(0, &[FrontLeft, SideLeft], scale);
                route(1, &[FrontRight, SideRight], scale);
            }
            DevChannels::X71 => {
                let scale = (2.0f32 / 6.0).sqrt();
                route(0, &[FrontLeft, BackLeft, SideLeft], scale);
                route(1, &[FrontRight, BackRight, SideRight], scale);
            }
        },
        FmtChannels::Stereo => {
            route(0, &[FrontLeft], 1.0);
            route(1, &[FrontRight], 1.0);
        }
        FmtChannels::Rear => {
            route(0, &[BackLeft], 1.0);
            route(1, &[BackRight], 1.0);
        }
        FmtChannels::Quad => {
            for (i, chan) in [FrontLeft, FrontRight, BackLeft, BackRight].iter().enumerate() {
                route(i, &[*chan], 1.0);
            }
        }
        FmtChannels::X51 => {
            for (i, chan) in [FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight]
                .iter()
                .enumerate()
            {
                route(i, &[*chan], 1.0);
            }
        }
        FmtChannels::X61 => {
            for (i, chan) in [FrontLeft, FrontRight, FrontCenter, Lfe, BackCenter, SideLeft, SideRight]
                .iter()
                .enumerate()
            {
                route(i, &[*chan], 1.0);
            }
        }
        FmtChannels::X71 => {
            for (i, chan) in [
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ]
            .iter()
            .enumerate()
            {
                route(i, &[*chan], 1.0);
            }
        }
    }

    let cw = cutoff_cos(device.frequency);
    source.params.iir_filter.coeff = lp_coeff_calc(dry_gain_hf, cw);

    for i in 0..device.num_aux_sends.min(MAX_SENDS) {
        let filter = source.sends[i].filter;
        let wet_gain = if live_slot(source, i, slots).is_some() {
            source.gain.max(source.min_gain).min(source.max_gain) * filter.gain() * listener_gain
        } else {
            0.0
        };
        let wet_gain_hf = filter.gain_hf();
        let send = &mut source.params.sends[i];
        send.wet_gain = wet_gain;
        send.iir_filter.coeff = lp_coeff_calc(wet_gain_hf * wet_gain_hf, cw);
    }
}

/// Distance attenuation for one model. Returns 1 when the model does not
/// apply (zero reference distance, equal min and max, and so on).
pub fn distance_attenuation(model: DistanceModel, distance: f32, min_dist: f32, max_dist: f32, rolloff: f32) -> f32 {
    let mut distance = distance;
    if model.is_clamped() {
        distance = distance.max(min_dist).min(max_dist);
        if max_dist < min_dist {
            return 1.0;
        }
    }

    match model {
        DistanceModel::Inverse | DistanceModel::InverseClamped => {
            let denom = min_dist + rolloff * (distance - min_dist);
            if min_dist > 0.0 && denom > 0.0 {
                min_dist / denom
            } else {
                1.0
            }
        }
        DistanceModel::Linear | DistanceModel::LinearClamped => {
            if max_dist != min_dist {
                (1.0 - rolloff * (distance - min_dist) / (max_dist - min_dist)).max(0.0)
            } else {
                1.0
            }
        }
        DistanceModel::Exponent | DistanceModel::ExponentClamped => {
            if distance > 0.0 && min_dist > 0.0 {
                (distance / min_dist).powf(-rolloff)
            } else {
                1.0
            }
        }
        DistanceModel::None => 1.0,
    }
}

/// Full spatial path for mono sources.
pub fn calc_source_params(
    source: &mut Source,
    device: &DeviceInfo,
    listener: &Listener,
    settings: &ContextSettings,
    slots: &SlotMap,
) {
    let num_sends = device.num_aux_sends.min(MAX_SENDS);
    let doppler_factor = settings.doppler_factor * source.doppler_factor;
    let speed_of_sound = settings.speed_of_sound;
    let doppler_velocity = settings.doppler_velocity;
    let min_dist = source.ref_distance;
    let max_dist = source.max_distance;

    // into listener space: x right, y up, -z forward
    let (mut position, direction, velocity, listener_velocity) = if source.head_relative {
        (source.position, source.direction, source.velocity, Vec3::ZERO)
    } else {
        let n = normalize_or_keep(listener.forward);
        let v = normalize_or_keep(listener.up);
        let u = normalize_or_keep(n.cross(v));
        let rotate = |p: Vec3| Vec3::new(p.dot(u), p.dot(v), -p.dot(n));
        (
            rotate(source.position - listener.position),
            rotate(source.direction),
            rotate(source.velocity),
            rotate(listener.velocity),
        )
    };

    let source_to_listener = normalize_or_keep(-position);
    let direction = normalize_or_keep(direction);
    let orig_dist = position.length();

    let mut room_rolloff = [0.0; MAX_SENDS];
    for (i, rolloff) in room_rolloff.iter_mut().enumerate().take(num_sends) {
        *rolloff = source.room_rolloff_factor;
        if let Some(reverb) = live_slot(source, i, slots).and_then(|slot| slot.props().reverb()) {
            *rolloff += reverb.room_rolloff_factor;
        }
    }

    let model = if settings.source_distance_model {
        source.distance_model
    } else {
        settings.distance_model
    };
    let attenuation = distance_attenuation(model, orig_dist, min_dist, max_dist, source.rolloff_factor);

    let mut dry_gain = source.gain * attenuation;
    let mut dry_gain_hf = 1.0;
    let mut wet_gain = [0.0; MAX_SENDS];
    let mut wet_gain_hf = [1.0; MAX_SENDS];
    for i in 0..num_sends {
        wet_gain[i] = source.gain * distance_attenuation(model, orig_dist, min_dist, max_dist, room_rolloff[i]);
    }

    let effective_dist = if min_dist > 0.0 && attenuation < 1.0 {
        ((min_dist / attenuation - min_dist) * listener.meters_per_unit).min(f32::MAX)
    } else {
        0.0
    };

    if source.air_absorption_factor > 0.0 && effective_dist > 0.0 {
        let absorb_db = source.air_absorption_factor * AIR_ABSORB_GAIN_DB_HF * effective_dist;
        dry_gain_hf *= 10f32.powf(absorb_db / 20.0);
    }

    let angle = source_to_listener.dot(direction).clamp(-1.0, 1.0).acos().to_degrees();
    let inner = source.cone_inner_angle;
    let outer = source.cone_outer_angle;
    let (cone_volume, mut cone_hf) = if angle >= inner && angle <= outer {
        let scale = if outer > inner {
            (angle - inner) / (outer - inner)
        } else {
            0.0
        };
        (
            1.0 + (source.cone_outer_gain - 1.0) * scale,
            1.0 + (source.cone_outer_gain_hf - 1.0) * scale,
        )
    } else if angle > outer {
        (source.cone_outer_gain, source.cone_outer_gain_hf)
    } else {
        (1.0, 1.0)
    };

    // sounds from behind lose some high end
    let mut head_angle = source_to_listener.z.clamp(-1.0, 1.0).acos().to_degrees();
    if orig_dist < min_dist {
        head_angle *= orig_dist / min_dist;
    }
    if head_angle > 90.0 {
        cone_hf *= 1.0 - device.head_dampen * (head_angle - 90.0) / (180.1 - 90.0);
    }

    dry_gain *= cone_volume;
    if source.dry_gain_hf_auto {
        dry_gain_hf *= cone_hf;
    }
    dry_gain = dry_gain.max(source.min_gain).min(source.max_gain);

    for i in 0..num_sends {
        let Some(slot) = live_slot(source, i, slots) else {
            source.params.sends[i].wet_gain = 0.0;
            wet_gain_hf[i] = 1.0;
            continue;
        };

        if slot.aux_send_auto() {
            if source.wet_gain_auto {
                wet_gain[i] *= cone_volume;
            }
            if source.wet_gain_hf_auto {
                wet_gain_hf[i] *= cone_hf;
            }
            wet_gain[i] = wet_gain[i].max(source.min_gain).min(source.max_gain);

            if let Some(reverb) = slot.props().reverb() {
                let decay_db = effective_dist / (SPEED_OF_SOUND_METRES_PER_SEC * reverb.decay_time) * -60.0;
                wet_gain[i] *= 10f32.powf(decay_db / 20.0);
                wet_gain_hf[i] *= reverb
                    .air_absorption_gain_hf
                    .powf(source.air_absorption_factor * effective_dist);
            }
        } else {
            wet_gain[i] = dry_gain;
            wet_gain_hf[i] = dry_gain_hf;
        }

        let filter = source.sends[i].filter;
        wet_gain[i] *= filter.gain();
        wet_gain_hf[i] *= filter.gain_hf();
        source.params.sends[i].wet_gain = wet_gain[i] * listener.gain;
    }

    dry_gain *= source.direct_filter.gain();
    dry_gain_hf *= source.direct_filter.gain_hf();
    dry_gain *= listener.gain;

    let mut pitch = source.pitch;
    if doppler_factor != 0.0 {
        let max_velocity = speed_of_sound * doppler_velocity / doppler_factor;
        let clamp_velocity = |v: f32| {
            if v >= max_velocity {
                max_velocity - 1.0
            } else if v <= -max_velocity {
                -max_velocity + 1.0
            } else {
                v
            }
        };
        let vss = clamp_velocity(velocity.dot(source_to_listener));
        let vls = clamp_velocity(listener_velocity.dot(source_to_listener));
        let reference = speed_of_sound * doppler_velocity;
        pitch *= (reference - doppler_factor * vls) / (reference - doppler_factor * vss);
    }

    if let Some(buffer) = source.first_buffer().cloned() {
        source.params.step = resample_step(pitch, &buffer, device, source.resampler);
    }

    let length = orig_dist.max(min_dist);
    if length > 0.0 {
        position /= length;
    }
    let lut = device.panning.lut(cart_to_lut_pos(-position.z, position.x));
    let dir_gain = (position.x * position.x + position.z * position.z).sqrt();
    let ambient_gain = (1.0 / device.panning.num_speakers() as f32).sqrt();

    let gains = &mut source.params.dry_gains;
    *gains = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
    for chan in device.panning.speakers() {
        let c = chan.index();
        gains[0][c] = dry_gain * (ambient_gain + (lut[c] - ambient_gain) * dir_gain);
    }

    let cw = cutoff_cos(device.frequency);
    // per-stage target of the 4-pole dry filter
    source.params.iir_filter.coeff = lp_coeff_calc(dry_gain_hf.sqrt(), cw);
    for i in 0..num_sends {
        source.params.sends[i].iir_filter.coeff = lp_coeff_calc(wet_gain_hf[i], cw);
    }
}
