//! Output device enumeration.

use serde::{Deserialize, Serialize};

/// Metadata about an audio output device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device name reported by the OS.
    pub name: String,
    pub is_default: bool,
    /// Native rate of the device's default output config, when queryable.
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Default device first, then alphabetical.
pub fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
}

/// List all output devices on the default host.
///
/// Returns an empty `Vec` if enumeration fails and no default device exists.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let describe = |idx: usize, device: &cpal::Device| {
        let name = device
            .name()
            .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
        let config = device.default_output_config().ok();
        DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            sample_rate: config.as_ref().map(|c| c.sample_rate().0),
            channels: config.as_ref().map(|c| c.channels()),
            name,
        }
    };

    match host.output_devices() {
        Ok(devices) => {
            let mut list: Vec<DeviceInfo> = devices
                .enumerate()
                .map(|(idx, device)| describe(idx, &device))
                .collect();
            sort_devices(&mut list);
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            host.default_output_device()
                .map(|device| {
                    let mut info = describe(0, &device);
                    info.is_default = true;
                    vec![info]
                })
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
