//! TOML configuration for a recycler deployment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::codes::HashAlgorithm;

/// Environment variable that overrides `[store] container_root`.
pub const CONTAINER_ROOT_ENV: &str = "RECYCLER_CONTAINER_ROOT";

/// Upper bound for `[roadmap] staleness_hours`, about a century.
pub const MAX_STALENESS_HOURS: u64 = 876_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclerConfig {
    pub store: StoreConfig,
    pub roadmap: RoadmapConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root under which every project keeps its artifact containers.
    pub container_root: PathBuf,
    /// SQLite file for transaction records. `None` keeps them in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            container_root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("recycler")
                .join("containers"),
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadmapConfig {
    /// Hours of disuse after which a transaction leaves a cached roadmap.
    pub staleness_hours: u64,
    /// Selection maxima used when a request carries none, as `total,label,user,host`.
    pub default_strategy: Option<String>,
}

impl Default for RoadmapConfig {
    fn default() -> Self {
        Self {
            staleness_hours: 24,
            default_strategy: None,
        }
    }
}

impl RoadmapConfig {
    /// The expiry window, capped at [`MAX_STALENESS_HOURS`].
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staleness_hours.min(MAX_STALENESS_HOURS) as i64)
    }

    fn validate(&self) -> RecyclerResult<()> {
        if self.staleness_hours > MAX_STALENESS_HOURS {
            return Err(RecyclerError::Config(format!(
                "roadmap.staleness_hours must be at most {MAX_STALENESS_HOURS}, got {}",
                self.staleness_hours
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub algorithm: HashAlgorithm,
}

impl RecyclerConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> RecyclerResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<RecyclerConfig>(&content)?
        } else {
            debug!("Config file not found, using defaults: {}", path.display());
            RecyclerConfig::default()
        };
        config.apply_env();
        config.roadmap.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RecyclerResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RecyclerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(root) = std::env::var_os(CONTAINER_ROOT_ENV) {
            if !root.is_empty() {
                self.store.container_root = PathBuf::from(root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: RecyclerConfig = toml::from_str("").unwrap();
        assert_eq!(config.roadmap.staleness_hours, 24);
        assert_eq!(config.identity.algorithm, HashAlgorithm::Crc32);
        assert!(config.store.database_path.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: RecyclerConfig = toml::from_str(
            "[roadmap]\nstaleness_hours = 6\n\n[identity]\nalgorithm = \"sha256\"\n",
        )
        .unwrap();
        assert_eq!(config.roadmap.staleness_hours, 6);
        assert_eq!(config.roadmap.staleness(), chrono::Duration::hours(6));
        assert_eq!(config.identity.algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("recycler.toml");
        let mut config = RecyclerConfig::default();
        config.store.container_root = dir.path().join("containers");
        config.roadmap.default_strategy = Some("10,1,2,3".to_string());
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: RecyclerConfig = toml::from_str(&content).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecyclerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.roadmap, RoadmapConfig::default());
    }

    #[test]
    fn test_huge_staleness_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recycler.toml");
        std::fs::write(&path, "[roadmap]\nstaleness_hours = 9223372036854775807\n").unwrap();
        assert!(matches!(
            RecyclerConfig::load(&path),
            Err(RecyclerError::Config(_))
        ));

        let config = RoadmapConfig {
            staleness_hours: u64::MAX,
            default_strategy: None,
        };
        assert_eq!(
            config.staleness(),
            chrono::Duration::hours(MAX_STALENESS_HOURS as i64)
        );
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[roadmap\n").unwrap();
        assert!(matches!(
            RecyclerConfig::load(&path),
            Err(RecyclerError::Toml(_))
        ));
    }
}
