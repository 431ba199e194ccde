use serde::{Deserialize, Serialize};

use crate::error::{DaeError, SerializationError};

use super::config::DaeConfig;

/// Versioned form of a [DaeConfig] as written by [crate::DaeIntegrator::serialize].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub version: u32,
    pub config: DaeConfig,
}

impl PersistedRecord {
    pub const VERSION: u32 = 2;
    /// oldest version that can still be read
    pub const OLDEST_VERSION: u32 = 1;

    pub fn new(config: DaeConfig) -> Self {
        Self {
            version: Self::VERSION,
            config,
        }
    }

    pub fn to_toml(&self) -> Result<String, DaeError> {
        toml::to_string(self).map_err(|e| DaeError::from(SerializationError::Encode(e)))
    }

    /// Read a record of the current or the previous version.
    ///
    /// Version 1 records carry neither `max_step_size` nor `constraints`. They load with an
    /// unbounded step size and without constraints, whatever the record contains under
    /// those names.
    pub fn from_toml(s: &str) -> Result<Self, DaeError> {
        let mut table: toml::Table =
            toml::from_str(s).map_err(|e| DaeError::from(SerializationError::Decode(e)))?;
        let version = table
            .get("version")
            .and_then(toml::Value::as_integer)
            .unwrap_or(0);
        let unsupported = || {
            DaeError::from(SerializationError::UnsupportedVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                oldest: Self::OLDEST_VERSION,
                current: Self::VERSION,
            })
        };
        match u32::try_from(version).map_err(|_| unsupported())? {
            Self::VERSION => {
                toml::from_str(s).map_err(|e| DaeError::from(SerializationError::Decode(e)))
            }
            1 => {
                let mut config = match table.remove("config") {
                    Some(toml::Value::Table(config)) => config,
                    _ => toml::Table::new(),
                };
                config.remove("max_step_size");
                config.remove("constraints");
                let config: DaeConfig = toml::Value::Table(config)
                    .try_into()
                    .map_err(|e| DaeError::from(SerializationError::Decode(e)))?;
                Ok(Self::new(config))
            }
            _ => Err(unsupported()),
        }
    }
}
