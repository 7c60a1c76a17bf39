//! Viewer configuration.
//!
//! Loaded from an optional YAML file; every field has a default so partial
//! files are fine. CLI flags override file values.
//!
//! ```yaml
//! budget: 5000
//! strategy: min_max_lttb
//! idle_timeout_secs: 600
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::downsample::{DEFAULT_BUDGET, DownsampleConfig, Strategy};
use super::plot_state::{DEFAULT_MAX_SUBPLOT_GROUPS, PlotConfig};
use super::source::DEFAULT_TIME_COLUMN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Points per trace.
    pub budget: usize,
    pub max_subplot_groups: usize,
    /// Sessions idle this long are evicted.
    pub idle_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    pub strategy: Strategy,
    pub minmax_ratio: usize,
    pub time_column: String,
    pub port: u16,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            max_subplot_groups: DEFAULT_MAX_SUBPLOT_GROUPS,
            idle_timeout_secs: 30 * 60,
            eviction_interval_secs: 60,
            strategy: Strategy::default(),
            minmax_ratio: DownsampleConfig::default().minmax_ratio,
            time_column: DEFAULT_TIME_COLUMN.to_string(),
            port: 8050,
        }
    }
}

impl ViewerConfig {
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse viewer config")
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn plot_config(&self) -> PlotConfig {
        PlotConfig {
            budget: self.budget,
            max_subplot_groups: self.max_subplot_groups,
        }
    }

    pub fn downsample_config(&self) -> DownsampleConfig {
        DownsampleConfig {
            strategy: self.strategy,
            minmax_ratio: self.minmax_ratio,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Never zero: a zero interval would make the eviction timer panic.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ViewerConfig::default();
        assert_eq!(config.budget, 10_000);
        assert_eq!(config.max_subplot_groups, 4);
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.eviction_interval(), Duration::from_secs(60));
        assert_eq!(config.strategy, Strategy::MinMax);
        assert_eq!(config.time_column, "time");
        assert_eq!(config.port, 8050);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ViewerConfig::from_yaml_str("budget: 2000\nstrategy: lttb\n").unwrap();
        assert_eq!(config.budget, 2000);
        assert_eq!(config.strategy, Strategy::Lttb);
        assert_eq!(config.max_subplot_groups, 4);
        assert_eq!(config.plot_config().budget, 2000);
        assert_eq!(config.downsample_config().strategy, Strategy::Lttb);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "idle_timeout_secs: 5\neviction_interval_secs: 0").unwrap();
        let config = ViewerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.eviction_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        assert!(ViewerConfig::from_yaml_str("budget: lots").is_err());
        assert!(ViewerConfig::from_yaml_file(Path::new("/nonexistent/viewer.yaml")).is_err());
    }
}
