//! Node configuration
//!
//! One JSON document configures every component of a node. Every field is
//! optional and durations are written as integer milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::eventcheck::heavycheck::HeavyCheckConfig;
use crate::gossip::GossipConfig;
use crate::packs::PacksConfig;
use crate::stream::{LeecherConfig, SeederConfig};

/// Configuration of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream client side, shared by the three streams
    pub leecher: LeecherConfig,
    /// Stream server side, shared by the three streams
    pub seeder: SeederConfig,
    pub packs: PacksConfig,
    pub heavy_check: HeavyCheckConfig,
    pub gossip: GossipConfig,
}

impl Config {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&data).with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse a JSON configuration
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(data)?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.leecher.validate().context("leecher")?;
        self.seeder.validate().context("seeder")?;
        self.packs.validate().context("packs")?;
        self.heavy_check.validate().context("heavy_check")?;
        self.gossip.validate().context("gossip")?;
        Ok(())
    }
}

/// Serde adapter for `Duration` as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super::duration_ms")]
        value: Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let h: Holder = serde_json::from_str(r#"{"value": 1500}"#).unwrap();
        assert_eq!(h.value, Duration::from_millis(1500));
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"value":1500}"#);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.seeder.sender_threads, 8);
        assert_eq!(config.leecher.recheck_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_json(
            r#"{"leecher": {"recheck_interval": 250, "session": {"parallel_chunks_download": 2}},
                "packs": {"max_fetching_full_packs": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.leecher.recheck_interval, Duration::from_millis(250));
        assert_eq!(config.leecher.session.parallel_chunks_download, 2);
        assert_eq!(config.leecher.base_progress_watchdog, Duration::from_secs(5));
        assert_eq!(config.packs.max_fetching_full_packs, 4);
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = Config::from_json(r#"{"seeder": {"sender_threads": 0}}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("sender_threads"));
    }
}
