//! cpal output backend for a [`PetalSonicDevice`]

use crate::device::PetalSonicDevice;
use crate::error::{PetalSonicError, Result};
use crate::events::PetalSonicEvent;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Plays a mixing device on the system's default output.
pub struct PetalSonicEngine {
    device: Arc<PetalSonicDevice>,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_processed: Arc<AtomicUsize>,
}

impl PetalSonicEngine {
    pub fn new(device: Arc<PetalSonicDevice>) -> Result<Self> {
        Ok(Self {
            device,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
            frames_processed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Opens the default output at the device's rate and channel count and
    /// starts pulling mixes from it.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }
        if !self.device.is_connected() {
            return Err(PetalSonicError::Engine(
                "Cannot start on a disconnected device".into(),
            ));
        }

        let host = cpal::default_host();
        let output = host.default_output_device().ok_or_else(|| {
            PetalSonicError::AudioDevice("No default output device available".into())
        })?;

        let info = self.device.info();
        let config = cpal::StreamConfig {
            channels: info.channels.channel_count() as u16,
            sample_rate: cpal::SampleRate(info.frequency),
            buffer_size: cpal::BufferSize::Default,
        };

        let default_config = output.default_output_config().map_err(|e| {
            PetalSonicError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&output, &config)?,
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&output, &config)?,
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&output, &config)?,
            other => {
                return Err(PetalSonicError::AudioFormat(format!(
                    "Unsupported sample format {:?}",
                    other
                )));
            }
        };

        stream
            .play()
            .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to start stream: {}", e)))?;

        log::info!(
            "Engine started: {} channels at {} Hz ({:?} stream)",
            config.channels,
            info.frequency,
            default_config.sample_format()
        );

        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);
        self.device.emit(PetalSonicEvent::EngineStarted);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            drop(stream);
            log::info!("Engine stopped");
            self.device.emit(PetalSonicEvent::EngineStopped);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Frames mixed since the engine was created.
    pub fn frames_processed(&self) -> usize {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> &Arc<PetalSonicDevice> {
        &self.device
    }

    fn create_stream<T>(&self, output: &cpal::Device, config: &cpal::StreamConfig) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let device = self.device.clone();
        let error_device = self.device.clone();
        let is_running = self.is_running.clone();
        let frames_processed = self.frames_processed.clone();
        let mut mix = Vec::<f32>::new();

        output
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) {
                        data.fill(T::from_sample(0.0f32));
                        return;
                    }

                    let frames = data.len() / channels;
                    // grows to the largest callback size once, then is reused
                    mix.resize(data.len(), 0.0);
                    device.mix_to_buffer(&mut mix, frames);

                    for (sample, &value) in data.iter_mut().zip(&mix) {
                        *sample = T::from_sample(value);
                    }
                    frames_processed.fetch_add(frames, Ordering::Relaxed);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    error_device.emit(PetalSonicEvent::EngineError {
                        error: err.to_string(),
                    });
                    error_device.handle_disconnect();
                },
                None,
            )
            .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}

impl Drop for PetalSonicEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PetalSonicDeviceDesc;

    #[test]
    fn disconnected_device_cannot_start() {
        let device = Arc::new(PetalSonicDevice::open(PetalSonicDeviceDesc::default()).unwrap());
        device.handle_disconnect();

        let mut engine = PetalSonicEngine::new(device).unwrap();
        assert!(matches!(engine.start(), Err(PetalSonicError::Engine(_))));
        assert!(!engine.is_running());
        assert_eq!(engine.frames_processed(), 0);
    }
}
