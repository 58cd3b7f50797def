//! Configuration for a PetalSonic mixing device
//!
//! [`PetalSonicDeviceDesc`] is the typed description handed to
//! [`PetalSonicDevice::open`](crate::device::PetalSonicDevice::open).
//! [`ConfigValues`] is the string key/value surface read by the panning
//! builder (speaker angle overrides, `scalemix`) and by
//! [`PetalSonicDeviceDesc::from_config`].

use crate::admission::AdmissionLimits;
use crate::channel::{DevChannels, DevSampleType};
use crate::error::{PetalSonicError, Result};
use crate::mixer::Resampler;
use crate::source::MAX_SENDS;
use std::collections::HashMap;
use std::str::FromStr;

/// String key/value store of user configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigValues {
    values: HashMap<String, String>,
}

impl ConfigValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Reads a boolean, falling back to `default` when the key is absent.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                PetalSonicError::Configuration(format!("'{}' is not a boolean: '{}'", key, raw))
            }),
        }
    }

    /// Parses the value stored under `key`, if any.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                PetalSonicError::Configuration(format!("bad value for '{}': {}", key, e))
            }),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = ConfigValues::new();
        for (k, v) in iter {
            values.insert(k, v);
        }
        values
    }
}

/// Accepts `1/0/true/false/yes/no/on/off`, case-insensitive.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration descriptor for a PetalSonic mixing device
#[derive(Debug, Clone)]
pub struct PetalSonicDeviceDesc {
    /// Output sample rate in Hz
    pub frequency: u32,
    /// Physical speaker layout
    pub channels: DevChannels,
    /// Sample type written by `mix_to_bytes`
    pub sample_type: DevSampleType,
    /// Auxiliary sends available to every source (at most `MAX_SENDS`)
    pub num_aux_sends: usize,
    /// Resampler given to newly created sources
    pub default_resampler: Resampler,
    /// How much HF is lost for sources behind the listener, in [0, 1]
    pub head_dampen: f32,
    /// Spread stereo buffers over the rear/side speakers of surround layouts
    pub duplicate_stereo: bool,
    /// bs2b crossfeed level for stereo output, 0 disables it
    pub crossfeed_level: u32,
    /// Voice limits for admission control; `None` admits every source
    pub admission: Option<AdmissionLimits>,
    /// Capacity of the event channel; events are dropped when it is full
    pub event_capacity: usize,
    /// Free-form values read by the panning builder
    pub config: ConfigValues,
}

impl Default for PetalSonicDeviceDesc {
    fn default() -> Self {
        Self {
            frequency: 44100,
            channels: DevChannels::Stereo,
            sample_type: DevSampleType::Short,
            num_aux_sends: 1,
            default_resampler: Resampler::Linear,
            head_dampen: 0.25,
            duplicate_stereo: true,
            crossfeed_level: 0,
            admission: None,
            event_capacity: 256,
            config: ConfigValues::default(),
        }
    }
}

impl PetalSonicDeviceDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn channels(mut self, channels: DevChannels) -> Self {
        self.channels = channels;
        self
    }

    pub fn sample_type(mut self, sample_type: DevSampleType) -> Self {
        self.sample_type = sample_type;
        self
    }

    pub fn num_aux_sends(mut self, sends: usize) -> Self {
        self.num_aux_sends = sends;
        self
    }

    pub fn default_resampler(mut self, resampler: Resampler) -> Self {
        self.default_resampler = resampler;
        self
    }

    pub fn head_dampen(mut self, dampen: f32) -> Self {
        self.head_dampen = dampen.clamp(0.0, 1.0);
        self
    }

    pub fn duplicate_stereo(mut self, enable: bool) -> Self {
        self.duplicate_stereo = enable;
        self
    }

    pub fn crossfeed_level(mut self, level: u32) -> Self {
        self.crossfeed_level = level;
        self
    }

    pub fn admission(mut self, limits: Option<AdmissionLimits>) -> Self {
        self.admission = limits;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn config(mut self, config: ConfigValues) -> Self {
        self.config = config;
        self
    }

    /// Builds a descriptor from string values, starting from the defaults.
    ///
    /// Recognised keys: `frequency`, `channels`, `sample-type`, `sends`,
    /// `resampler`, `head_dampen`, `stereodup`, `cf_level`, `admission`.
    /// The values are also kept as [`config`](Self::config) for the panning
    /// builder.
    pub fn from_config(values: ConfigValues) -> Result<Self> {
        let mut desc = Self::default();

        if let Some(frequency) = values.get_parsed::<u32>("frequency")? {
            desc.frequency = frequency;
        }
        if let Some(channels) = values.get_parsed::<DevChannels>("channels")? {
            desc.channels = channels;
        }
        if let Some(sample_type) = values.get_parsed::<DevSampleType>("sample-type")? {
            desc.sample_type = sample_type;
        }
        if let Some(sends) = values.get_parsed::<usize>("sends")? {
            desc.num_aux_sends = sends;
        }
        if let Some(resampler) = values.get_parsed::<Resampler>("resampler")? {
            desc.default_resampler = resampler;
        }
        if let Some(dampen) = values.get_parsed::<f32>("head_dampen")? {
            desc.head_dampen = dampen.clamp(0.0, 1.0);
        }
        desc.duplicate_stereo = values.get_bool("stereodup", desc.duplicate_stereo)?;
        if let Some(level) = values.get_parsed::<u32>("cf_level")? {
            desc.crossfeed_level = level;
        }
        if values.get_bool("admission", false)? {
            desc.admission = Some(AdmissionLimits::default());
        }

        desc.config = values;
        desc.validate()?;
        Ok(desc)
    }

    /// Checks the values that cannot be corrected silently.
    pub fn validate(&self) -> Result<()> {
        if self.frequency == 0 {
            return Err(PetalSonicError::Configuration(
                "sample rate must be non-zero".into(),
            ));
        }
        if self.num_aux_sends > MAX_SENDS {
            return Err(PetalSonicError::Configuration(format!(
                "{} aux sends requested, at most {} are supported",
                self.num_aux_sends, MAX_SENDS
            )));
        }
        if self.crossfeed_level > 6 {
            return Err(PetalSonicError::Configuration(format!(
                "crossfeed level {} is outside 0..=6",
                self.crossfeed_level
            )));
        }
        if let Some(limits) = &self.admission {
            limits.validate()?;
        }
        Ok(())
    }
}
