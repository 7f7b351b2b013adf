//! Runtime configuration for the sync core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueConfig;
use crate::stops::GeofenceConfig;
use crate::sync::SyncConfig;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Parse(String),

    #[error("invalid {section} config: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

/// All tunables in one place. Missing sections and fields take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub geofence: GeofenceConfig,
    pub telemetry: TelemetryConfig,
    pub sync: SyncConfig,
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(section: &'static str, e: impl std::fmt::Display) -> ConfigError {
            ConfigError::Invalid {
                section,
                message: e.to_string(),
            }
        }

        self.queue.validate().map_err(|e| invalid("queue", e))?;
        self.geofence.validate().map_err(|e| invalid("geofence", e))?;
        self.telemetry.validate().map_err(|e| invalid("telemetry", e))?;
        self.sync.validate().map_err(|e| invalid("sync", e))?;
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
