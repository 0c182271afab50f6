//! Config module.
//! Manages I/O for board_config.json (detector thresholds, classifier band, engine and search limits).
//! Uses serde for JSON serialization; a missing file means defaults.
//! Environment variables and CLI flags are layered on top by the caller.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AnalyzerError;

pub const DEFAULT_CONFIG_PATH: &str = "board_config.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
    pub engine: EngineConfig,
    pub search: SearchConfig,
    /// Seconds between scans in watch mode
    pub scan_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            classifier: ClassifierConfig::default(),
            engine: EngineConfig::default(),
            search: SearchConfig::default(),
            scan_interval_secs: 10,
        }
    }
}

/// How the four polygon vertices are assigned to board corners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CornerOrdering {
    /// Sort by x+y for TL/BR, by y-x for TR/BL. Breaks past ~45 degrees of rotation.
    #[default]
    SumDiff,
    /// Walk the corners clockwise around their centroid, starting at the minimum x+y corner.
    Angular,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum board side in pixels; candidate area must exceed its square
    pub min_board_size: u32,
    /// Local threshold window (odd)
    pub threshold_window: u32,
    /// Constant subtracted from the local mean
    pub threshold_offset: f32,
    /// Radius of the morphological close that joins broken board edges; 0 disables it
    pub close_radius: u8,
    /// Polygon approximation tolerance as a fraction of the contour perimeter
    pub approx_epsilon_ratio: f64,
    pub corner_ordering: CornerOrdering,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_board_size: 200,
            threshold_window: 11,
            threshold_offset: 2.0,
            close_radius: 2,
            approx_epsilon_ratio: 0.02,
            corner_ordering: CornerOrdering::SumDiff,
        }
    }
}

/// Mean-luminance band (0-255, exclusive) treated as an empty square.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub empty_lower: f32,
    pub empty_upper: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            empty_lower: 90.0,
            empty_upper: 170.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the UCI engine binary
    pub path: String,
    pub threads: u32,
    pub hash_mb: u32,
    pub handshake_timeout_ms: u64,
    /// Extra time granted after the search budget before `stop` is sent
    pub stop_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: "stockfish".to_string(),
            threads: 2,
            hash_mb: 32,
            handshake_timeout_ms: 5_000,
            stop_grace_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub depth: u32,
    pub time_limit_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            depth: 18,
            time_limit_ms: 2_000,
        }
    }
}

impl SearchConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }
}

impl Config {
    /// Loads the config file at `path`, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AnalyzerError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AnalyzerError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Applies `STOCKFISH_PATH`, `ANALYZER_DEPTH` and `ANALYZER_TIME_MS` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env`] with an injectable lookup. Unparsable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("STOCKFISH_PATH") {
            self.engine.path = path;
        }
        if let Some(depth) = lookup("ANALYZER_DEPTH").and_then(|v| v.parse().ok()) {
            self.search.depth = depth;
        }
        if let Some(ms) = lookup("ANALYZER_TIME_MS").and_then(|v| v.parse().ok()) {
            self.search.time_limit_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let d = &self.detector;
        if d.threshold_window < 3 || d.threshold_window % 2 == 0 {
            return Err(AnalyzerError::Config(format!(
                "threshold_window must be odd and >= 3, got {}",
                d.threshold_window
            )));
        }
        if !(d.approx_epsilon_ratio > 0.0) {
            return Err(AnalyzerError::Config("approx_epsilon_ratio must be positive".into()));
        }
        let c = &self.classifier;
        if c.empty_lower >= c.empty_upper {
            return Err(AnalyzerError::Config(format!(
                "empty luminance band is inverted ({} >= {})",
                c.empty_lower, c.empty_upper
            )));
        }
        if self.engine.threads == 0 || self.engine.hash_mb == 0 {
            return Err(AnalyzerError::Config("engine threads and hash must be positive".into()));
        }
        if self.search.depth == 0 || self.search.time_limit_ms == 0 {
            return Err(AnalyzerError::Config("search depth and time limit must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.detector.min_board_size, 200);
        assert_eq!(config.detector.threshold_window, 11);
        assert_eq!(config.detector.close_radius, 2);
        assert_eq!(config.classifier.empty_lower, 90.0);
        assert_eq!(config.classifier.empty_upper, 170.0);
        assert_eq!(config.engine.threads, 2);
        assert_eq!(config.engine.hash_mb, 32);
        assert_eq!(config.search.depth, 18);
        assert_eq!(config.search.time_limit(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "search": { "depth": 12 }, "detector": { "corner_ordering": "angular" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.search.depth, 12);
        assert_eq!(config.search.time_limit_ms, 2_000);
        assert_eq!(config.detector.corner_ordering, CornerOrdering::Angular);
        assert_eq!(config.engine.path, "stockfish");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("boardscan-missing-config-does-not-exist.json");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.scan_interval_secs, 10);
        assert_eq!(config.search.depth, 18);
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("boardscan-config-{}.json", std::process::id()));
        let mut config = Config::default();
        config.scan_interval_secs = 3;
        config.engine.hash_mb = 64;
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "STOCKFISH_PATH" => Some("/opt/sf".to_string()),
            "ANALYZER_DEPTH" => Some("not a number".to_string()),
            "ANALYZER_TIME_MS" => Some("750".to_string()),
            _ => None,
        });
        assert_eq!(config.engine.path, "/opt/sf");
        assert_eq!(config.search.depth, 18);
        assert_eq!(config.search.time_limit_ms, 750);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.detector.threshold_window = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier.empty_lower = 200.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.search.depth = 0;
        assert!(matches!(config.validate(), Err(AnalyzerError::Config(_))));
    }
}
