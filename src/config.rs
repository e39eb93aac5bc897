//! Config module.
//! Loads engine/search/tablebase settings from a JSON file with serde.
//! Every field has a default, so a missing file or a partial one is fine.
//! Precedence: CLI flags > `ZUGZWANG_ENGINE` env var > file > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::tablebase::{LICHESS_TABLEBASE_URL, MAX_TABLEBASE_PIECES};
use crate::worker::WorkerSettings;

pub const DEFAULT_CONFIG_PATH: &str = "zugzwang.json";
pub const ENGINE_ENV: &str = "ZUGZWANG_ENGINE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub search: SearchConfig,
    pub maintenance: MaintenanceConfig,
    pub tablebase: TablebaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub max_init_attempts: u32,
    pub hash_mb: Option<u32>,
    pub threads: Option<u32>,
    /// Extra `setoption` pairs, applied after Hash and Threads.
    pub options: BTreeMap<String, String>,
    pub restart_on_crash: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stockfish"),
            args: Vec::new(),
            handshake_timeout_ms: 10_000,
            max_init_attempts: 3,
            hash_mb: Some(64),
            threads: Some(1),
            options: BTreeMap::new(),
            restart_on_crash: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub move_time_ms: u64,
    pub eval_depth: u32,
    pub eval_timeout_ms: u64,
    pub multi_pv: u32,
    /// Slack added to every request timer on top of the search limit.
    pub timeout_buffer_ms: u64,
    pub sync_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            move_time_ms: 1_000,
            eval_depth: 15,
            eval_timeout_ms: 10_000,
            multi_pv: 3,
            timeout_buffer_ms: 500,
            sync_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub sweep_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            stale_after_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablebaseConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_ms: u64,
    pub max_pieces: usize,
}

impl Default for TablebaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: LICHESS_TABLEBASE_URL.to_string(),
            timeout_ms: 3_000,
            max_pieces: MAX_TABLEBASE_PIECES,
        }
    }
}

impl Config {
    /// Handshake, attempt limit and `setoption` list for the worker.
    pub fn worker_settings(&self) -> WorkerSettings {
        let mut options = Vec::new();
        if let Some(hash) = self.engine.hash_mb {
            options.push(("Hash".to_string(), hash.to_string()));
        }
        if let Some(threads) = self.engine.threads {
            options.push(("Threads".to_string(), threads.to_string()));
        }
        options.extend(
            self.engine
                .options
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );

        WorkerSettings {
            handshake_timeout: Duration::from_millis(self.engine.handshake_timeout_ms),
            max_init_attempts: self.engine.max_init_attempts,
            options,
        }
    }

    pub fn move_time(&self) -> Duration {
        Duration::from_millis(self.search.move_time_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.search.eval_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.search.sync_timeout_ms)
    }

    pub fn timeout_buffer(&self) -> Duration {
        Duration::from_millis(self.search.timeout_buffer_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance.sweep_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.maintenance.stale_after_ms)
    }

    pub fn tablebase_timeout(&self) -> Duration {
        Duration::from_millis(self.tablebase.timeout_ms)
    }

    /// Replaces the engine path when an override is present.
    pub fn with_engine_override(mut self, path: Option<String>) -> Self {
        if let Some(path) = path.filter(|p| !p.trim().is_empty()) {
            debug!(%path, "engine path overridden");
            self.engine.path = PathBuf::from(path);
        }
        self
    }
}

/// Reads the config file, falling back to defaults when it does not exist,
/// then applies the `ZUGZWANG_ENGINE` override.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        config
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };
    Ok(config.with_engine_override(std::env::var(ENGINE_ENV).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("zugzwang-{}-{}.json", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"search": {"eval_depth": 20}, "tablebase": {"enabled": false}}"#).unwrap();
        assert_eq!(config.search.eval_depth, 20);
        assert_eq!(config.search.move_time_ms, 1_000);
        assert!(!config.tablebase.enabled);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = temp_file("load", r#"{"engine": {"path": "/opt/sf", "hash_mb": 128}}"#);
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.engine.hash_mb, Some(128));
        assert_eq!(config.engine.threads, Some(1));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/zugzwang.json")).unwrap();
        assert_eq!(config.search, SearchConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let path = temp_file("bad", "{ not json");
        let err = load_config(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_engine_override() {
        let config = Config::default().with_engine_override(Some("/usr/games/stockfish".into()));
        assert_eq!(config.engine.path, PathBuf::from("/usr/games/stockfish"));

        let config = Config::default().with_engine_override(Some("  ".into()));
        assert_eq!(config.engine.path, PathBuf::from("stockfish"));
    }

    #[test]
    fn test_worker_settings_option_order() {
        let mut config = Config::default();
        config.engine.options.insert("SyzygyPath".into(), "/tb".into());
        config.engine.options.insert("MultiPV".into(), "1".into());

        let settings = config.worker_settings();
        let names: Vec<&str> = settings.options.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Hash", "Threads", "MultiPV", "SyzygyPath"]);
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_init_attempts, 3);
    }
}
