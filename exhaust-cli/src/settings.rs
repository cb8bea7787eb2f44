//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use exhaust_core::synth::sine::{MAX_FREQUENCY, MIN_FREQUENCY};
use exhaust_core::StreamConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HostSettings {
    pub preferred_output_device: Option<String>,
    /// Rate the synthesis engine renders at; resampled to the device rate.
    pub engine_sample_rate: u32,
    pub frequency: f64,
    pub amplitude: f64,
    pub jitter: JitterSettings,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct JitterSettings {
    pub base_ms: u64,
    pub spike_ms: u64,
    pub spike_chance: f64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            preferred_output_device: None,
            engine_sample_rate: 44_100,
            frequency: 440.0,
            amplitude: 0.5,
            jitter: JitterSettings::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self {
            base_ms: 0,
            spike_ms: 0,
            spike_chance: 0.0,
        }
    }
}

impl JitterSettings {
    pub fn is_enabled(&self) -> bool {
        self.base_ms > 0 || (self.spike_ms > 0 && self.spike_chance > 0.0)
    }
}

impl HostSettings {
    pub fn normalize(&mut self) {
        self.preferred_output_device = self
            .preferred_output_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if self.engine_sample_rate == 0 {
            self.engine_sample_rate = 44_100;
        }
        self.frequency = if self.frequency.is_finite() {
            self.frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
        } else {
            440.0
        };
        self.amplitude = if self.amplitude.is_finite() {
            self.amplitude.clamp(0.0, 1.0)
        } else {
            0.5
        };
        self.jitter.spike_chance = if self.jitter.spike_chance.is_finite() {
            self.jitter.spike_chance.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Exhaust")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("exhaust")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults; a file that exists but
/// does not parse is reported and ignored.
pub fn load_settings(path: &Path) -> HostSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<HostSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring malformed settings file: {e}");
            HostSettings::default()
        }),
        Err(_) => HostSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &HostSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"frequency": 1000.0, "stream": {"prefill": 1500}}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.frequency, 1000.0);
        assert_eq!(settings.stream.prefill, 1_500);
        assert_eq!(settings.stream.high_watermark, 4_000);
        assert_eq!(settings.engine_sample_rate, 44_100);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = HostSettings {
            preferred_output_device: Some("   ".into()),
            frequency: 1.0e9,
            amplitude: -3.0,
            ..HostSettings::default()
        };
        settings.jitter.spike_chance = f64::NAN;
        settings.normalize();
        assert_eq!(settings.preferred_output_device, None);
        assert_eq!(settings.frequency, MAX_FREQUENCY);
        assert_eq!(settings.amplitude, 0.0);
        assert_eq!(settings.jitter.spike_chance, 0.0);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = HostSettings::default();
        settings.preferred_output_device = Some("USB DAC".into());
        settings.stream.tick_ms = Some(5);
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);

        // One key style throughout, including the embedded stream layout.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"preferredOutputDevice\""));
        assert!(raw.contains("\"highWatermark\""));
        assert!(!raw.contains("high_watermark"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings(&path), HostSettings::default());
    }
}
