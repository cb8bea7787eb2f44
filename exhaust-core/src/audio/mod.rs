//! Audio playback via cpal backend.
//!
//! # Design constraints
//!
//! The cpal output callback runs on an OS audio thread at elevated priority.
//! Everything it does is delegated to [`ConsumerCallback::render`], which
//! bounds its lock wait, never waits for data and never logs. Devices that
//! want integer samples get them through a scratch buffer sized once up
//! front and grown only if the host asks for a larger block.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioOutput` must be created and dropped on the same thread.

pub mod convert;
pub mod device;
pub mod resample;

pub use device::{list_output_devices, DeviceInfo};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::engine::consumer::ConsumerCallback;
use crate::error::{ExhaustError, Result};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active output stream.
///
/// **Not `Send`**. Create and drop on the same OS thread.
pub struct AudioOutput {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Set by the backend error callback; the stream is dead once true.
    failed: Arc<AtomicBool>,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Open the preferred output device (by exact name), otherwise the default
    /// device, otherwise the first one available, and start pulling from
    /// `callback`.
    ///
    /// The device is opened at `callback`'s rate and channel count; use
    /// [`probe_output`] first to size the stream to what the device wants.
    #[cfg(feature = "audio-cpal")]
    pub fn open(callback: ConsumerCallback, preferred_device: Option<&str>) -> Result<Self> {
        let device = resolve_device(preferred_device)?;
        let device_name = device.name().unwrap_or_default();
        let supported = device
            .default_output_config()
            .map_err(|e| ExhaustError::AudioDevice(e.to_string()))?;

        let sample_rate = callback.sample_rate();
        let channels = callback.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = device_name.as_str(),
            sample_rate,
            channels,
            format = ?supported.sample_format(),
            "opening output device"
        );

        let failed = Arc::new(AtomicBool::new(false));
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_f32(&device, &config, callback, Arc::clone(&failed))?,
            SampleFormat::I16 => {
                build_converted::<i16>(&device, &config, callback, Arc::clone(&failed))?
            }
            SampleFormat::U16 => {
                build_converted::<u16>(&device, &config, callback, Arc::clone(&failed))?
            }
            fmt => {
                return Err(ExhaustError::UnsupportedFormat(format!(
                    "device sample format {fmt:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| ExhaustError::AudioStream(e.to_string()))?;
        info!(device = device_name.as_str(), "output stream started");

        Ok(Self {
            _stream: stream,
            failed,
            device_name,
            sample_rate,
            channels,
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_callback: ConsumerCallback, _preferred_device: Option<&str>) -> Result<Self> {
        Err(ExhaustError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// True once the backend has reported a stream error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Resolve the output device the same way [`AudioOutput::open`] would and
/// report its default rate and channel count.
#[cfg(feature = "audio-cpal")]
pub fn probe_output(preferred_device: Option<&str>) -> Result<DeviceInfo> {
    let device = resolve_device(preferred_device)?;
    let name = device.name().unwrap_or_default();
    let default_name = cpal::default_host()
        .default_output_device()
        .and_then(|d| d.name().ok());
    let supported = device
        .default_output_config()
        .map_err(|e| ExhaustError::AudioDevice(e.to_string()))?;
    Ok(DeviceInfo {
        is_default: default_name.as_deref() == Some(name.as_str()),
        sample_rate: Some(supported.sample_rate().0),
        channels: Some(supported.channels()),
        name,
    })
}

#[cfg(not(feature = "audio-cpal"))]
pub fn probe_output(_preferred_device: Option<&str>) -> Result<DeviceInfo> {
    Err(ExhaustError::AudioStream(
        "compiled without audio-cpal feature".into(),
    ))
}

#[cfg(feature = "audio-cpal")]
fn resolve_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(preferred_name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                let found = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                });
                if let Some(device) = found {
                    return Ok(device);
                }
                warn!(
                    "preferred output device '{}' not found, falling back",
                    preferred_name
                );
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_output_device() {
        return Ok(default);
    }
    let mut devices = host
        .output_devices()
        .map_err(|e| ExhaustError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(ExhaustError::NoDefaultOutputDevice)?;
    warn!("no default output device, falling back to first available output");
    Ok(fallback)
}

#[cfg(feature = "audio-cpal")]
fn error_handler(failed: Arc<AtomicBool>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        failed.store(true, Ordering::Relaxed);
        error!("audio stream error: {err}");
    }
}

#[cfg(feature = "audio-cpal")]
fn build_f32(
    device: &cpal::Device,
    config: &StreamConfig,
    mut callback: ConsumerCallback,
    failed: Arc<AtomicBool>,
) -> Result<Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback.render(data);
            },
            error_handler(failed),
            None,
        )
        .map_err(|e| ExhaustError::AudioStream(e.to_string()))
}

#[cfg(feature = "audio-cpal")]
fn build_converted<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut callback: ConsumerCallback,
    failed: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let mut scratch: Vec<f32> = vec![0.0; 4096 * usize::from(config.channels.max(1))];
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let buf = &mut scratch[..data.len()];
                callback.render(buf);
                for (dst, &src) in data.iter_mut().zip(buf.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            error_handler(failed),
            None,
        )
        .map_err(|e| ExhaustError::AudioStream(e.to_string()))
}
