//! Capture device enumeration.

use serde::{Deserialize, Serialize};

/// Name under which the built-in tone generator is listed.
pub const SIMULATED_DEVICE_NAME: &str = "simulated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulated,
    Cpal,
}

/// Metadata about a capture device a source can be built on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub backend: BackendKind,
    /// Whether this is the host's default input device.
    pub is_default: bool,
}

/// List every usable capture device. The simulated device is always present
/// and is the default when no hardware backend is compiled in.
pub fn list_input_devices() -> Vec<DeviceInfo> {
    let mut list = hardware_input_devices();
    let has_default = list.iter().any(|d| d.is_default);
    list.push(DeviceInfo {
        name: SIMULATED_DEVICE_NAME.to_string(),
        backend: BackendKind::Simulated,
        is_default: !has_default,
    });
    list
}

#[cfg(feature = "audio-cpal")]
fn hardware_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    DeviceInfo {
                        name,
                        backend: BackendKind::Cpal,
                        is_default,
                    }
                })
                .collect::<Vec<_>>();
            list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_name
                .map(|name| {
                    vec![DeviceInfo {
                        name,
                        backend: BackendKind::Cpal,
                        is_default: true,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn hardware_input_devices() -> Vec<DeviceInfo> {
    vec![]
}
