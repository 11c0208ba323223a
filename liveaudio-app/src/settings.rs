//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use liveaudio_core::audio::device::SIMULATED_DEVICE_NAME;
use liveaudio_core::SourceConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Capture device by name; `None` picks the host default.
    pub preferred_input_device: Option<String>,
    pub source: SourceConfig,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frequency of the simulated device's tone.
    pub tone_hz: f32,
    pub amplitude: f32,
    /// Buffers to pull before shutting down; 0 runs until killed.
    pub pulls: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            source: SourceConfig::default(),
            sample_rate: 44_100,
            channels: 2,
            tone_hz: 440.0,
            amplitude: 0.25,
            pulls: 100,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.sample_rate = self.sample_rate.clamp(8_000, 192_000);
        self.channels = self.channels.clamp(1, 8);
        self.tone_hz = self.tone_hz.clamp(20.0, 20_000.0);
        self.amplitude = self.amplitude.clamp(0.0, 1.0);

        let defaults = SourceConfig::default();
        if self.source.buffer_time_us == 0 {
            self.source.buffer_time_us = defaults.buffer_time_us;
        }
        if self.source.latency_time_us == 0 {
            self.source.latency_time_us = defaults.latency_time_us;
        }
        self.source.latency_time_us = self.source.latency_time_us.min(self.source.buffer_time_us);
    }

    /// `true` when the settings select the built-in tone generator.
    pub fn wants_simulated(&self) -> bool {
        match self.preferred_input_device.as_deref() {
            Some(name) => name.eq_ignore_ascii_case(SIMULATED_DEVICE_NAME),
            None => !cfg!(feature = "audio-cpal"),
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("liveaudio")
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
            .join("liveaudio")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
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
    fn partial_json_fills_defaults() {
        let raw = r#"{ "sampleRate": 48000, "source": { "latencyTimeUs": 20000 } }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).expect("parse");
        settings.normalize();
        assert_eq!(settings.sample_rate, 48_000);
        assert_eq!(settings.channels, 2);
        assert_eq!(settings.source.latency_time_us, 20_000);
        assert_eq!(settings.source.buffer_time_us, 200_000);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = AppSettings {
            preferred_input_device: Some("   ".into()),
            sample_rate: 1,
            channels: 0,
            amplitude: 3.0,
            source: SourceConfig {
                buffer_time_us: 5_000,
                latency_time_us: 0,
            },
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.sample_rate, 8_000);
        assert_eq!(settings.channels, 1);
        assert_eq!(settings.amplitude, 1.0);
        assert_eq!(settings.source.latency_time_us, 5_000);
    }

    #[test]
    fn simulated_device_is_selected_by_name() {
        let settings = AppSettings {
            preferred_input_device: Some("Simulated".into()),
            ..AppSettings::default()
        };
        assert!(settings.wants_simulated());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("liveaudio-missing-settings-test.json");
        let _ = fs::remove_file(&path);
        let settings = load_settings(&path);
        assert_eq!(settings.pulls, 100);
    }

    #[test]
    fn save_then_load_preserves_device() {
        let dir = std::env::temp_dir().join(format!("liveaudio-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            preferred_input_device: Some("USB Mic".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        let loaded = load_settings(&path);
        assert_eq!(loaded.preferred_input_device.as_deref(), Some("USB Mic"));
        let _ = fs::remove_dir_all(&dir);
    }
}
