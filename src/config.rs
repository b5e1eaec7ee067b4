//! Controller settings.
//!
//! Small serde-friendly configuration consumed by
//! [`DeviceController`](crate::controller::DeviceController). Durations use
//! humantime notation ("500ms", "3s") so the struct embeds cleanly in an
//! application's own configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior knobs for one device controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Start the background auto-update loop once connected.
    pub auto_update_enabled: bool,

    /// Delay between auto-update sweeps.
    #[serde(with = "humantime_serde")]
    pub auto_update_interval: Duration,

    /// Timeout handed to the transport when opening a session.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            auto_update_enabled: true,
            auto_update_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let settings = ControllerSettings {
            auto_update_enabled: false,
            auto_update_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        let back: ControllerSettings = serde_json::from_str(&json).expect("deserialize");
        assert!(!back.auto_update_enabled);
        assert_eq!(back.auto_update_interval, Duration::from_millis(250));
        assert_eq!(back.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_settings_accept_humantime_strings() {
        let json = r#"{"auto_update_interval": "250ms", "connect_timeout": "1m"}"#;
        let settings: ControllerSettings = serde_json::from_str(json).expect("deserialize");
        assert!(settings.auto_update_enabled);
        assert_eq!(settings.auto_update_interval, Duration::from_millis(250));
        assert_eq!(settings.connect_timeout, Duration::from_secs(60));
    }
}
