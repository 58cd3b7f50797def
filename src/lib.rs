//! # PetalSonic Mixer
//!
//! The real-time mixing and spatialization core of PetalSonic. A
//! [`PetalSonicDevice`] owns one or more [`Context`]s, each holding a
//! listener, sources with queued [`Buffer`]s and auxiliary effect slots.
//! Every call to [`PetalSonicDevice::mix_to_buffer`] recomputes the mix
//! parameters of changed sources, resamples and pans them into a dry mix,
//! runs the effect slots (reverb, EAX reverb, echo, ring modulator) and
//! writes interleaved samples in the device's layout.
//!
//! ## Quick Start
//!
//! ```no_run
//! use petalsonic_mixer::*;
//! use std::sync::Arc;
//!
//! let device = Arc::new(PetalSonicDevice::open(PetalSonicDeviceDesc::default())?);
//! let ctx = device.create_context();
//!
//! {
//!     let mut context = device.context(ctx)?;
//!     let source = context.create_source();
//!     let buffer = Buffer::from_f32(FmtChannels::Mono, 44100, vec![0.0; 44100])?;
//!     context.source_mut(source)?.set_buffer(Some(Arc::new(buffer)))?;
//!     context.source_mut(source)?.set_position(Vec3::new(2.0, 0.0, -1.0))?;
//!     context.play_source(source)?;
//! }
//!
//! // Play through the default output device
//! let mut engine = PetalSonicEngine::new(device.clone())?;
//! engine.start()?;
//!
//! for event in device.poll_events() {
//!     if let PetalSonicEvent::SourceStopped { source_id } = event {
//!         println!("{} finished", source_id);
//!     }
//! }
//! # Ok::<(), PetalSonicError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`PetalSonicDevice`]**: mix orchestrator, owns the contexts and the dry mix
//! - **[`Context`]**: listener, sources, effect slots and source playback control
//! - **[`Source`]**: spatial attributes and the buffer queue of one voice
//! - **[`EffectProps`]**: parameter sets loaded into effect slots
//! - **[`PetalSonicEngine`]**: cpal backend that pulls mixes on the audio thread
//! - **[`PetalSonicEvent`]**: notifications from the mix thread

pub mod admission;
pub mod bs2b;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod listener;
pub mod math;
pub mod mixer;
pub mod output;
pub mod panning;
pub mod params;
pub mod slot;
pub mod source;

pub use admission::{AdmissionControl, AdmissionLimits};
pub use buffer::{Buffer, BufferData};
pub use channel::{Channel, DevChannels, DevSampleType, FmtChannels, FmtType};
pub use config::{ConfigValues, PetalSonicDeviceDesc};
pub use context::{Context, ContextId, ContextSettings};
pub use device::{DeviceInfo, PetalSonicDevice};
pub use effects::{EchoProps, EffectProps, EffectType, ModulatorProps, ReverbProps, Waveform};
pub use engine::PetalSonicEngine;
pub use error::{PetalSonicError, Result};
pub use events::PetalSonicEvent;
pub use filter::LowpassParams;
pub use listener::Listener;
pub use math::{Pose, Vec3};
pub use mixer::Resampler;
pub use slot::{EffectSlot, SlotId};
pub use source::{DistanceModel, Source, SourceId, SourceSend, SourceState, SourceType};
