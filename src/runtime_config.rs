// =============================================================================
// Runtime Configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Every field carries a serde default so an older config file keeps
// loading after new fields appear. Persistence uses tmp + rename so a
// crash mid-write never corrupts the file. Environment variables override
// the file where operations need a knob without an edit.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::execution::ExecutionConfig;

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_store_path() -> String {
    "nexus_terminal.db".to_string()
}

fn default_master_path() -> String {
    "api-scrip-master-detailed.csv".to_string()
}

fn default_max_feed_targets() -> usize {
    300
}

fn default_pending_sweep_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed -----------------------------------------------------------

    /// Master switch for the vendor feed (admin kill-switch persists here).
    #[serde(default = "default_true")]
    pub live_feed_enabled: bool,

    /// Global cap on wire targets (LIVE_FEED_MAX_TARGETS overrides).
    #[serde(default = "default_max_feed_targets")]
    pub max_feed_targets: usize,

    /// Index underlyings that get the wide ±50 strike window.
    #[serde(default)]
    pub wide_window_indices: Vec<String>,

    // --- Execution ------------------------------------------------------

    /// Admin kill-switch for order entry.
    #[serde(default)]
    pub order_entry_blocked: bool,

    /// Seconds between pending-order sweeps.
    #[serde(default = "default_pending_sweep_secs")]
    pub pending_sweep_secs: u64,

    /// Latency/slippage/timeout parameters per exchange.
    #[serde(default)]
    pub execution: ExecutionConfig,

    // --- Paths & surface ------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_master_path")]
    pub instrument_master_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            live_feed_enabled: true,
            max_feed_targets: default_max_feed_targets(),
            wide_window_indices: Vec::new(),
            order_entry_blocked: false,
            pending_sweep_secs: default_pending_sweep_secs(),
            execution: ExecutionConfig::default(),
            bind_addr: default_bind_addr(),
            store_path: default_store_path(),
            instrument_master_path: default_master_path(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Atomic save: write a tmp sibling, then rename over the target.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }

    /// Environment overrides applied after load.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("LIVE_FEED_MAX_TARGETS") {
            if let Ok(parsed) = value.parse() {
                self.max_feed_targets = parsed;
            }
        }
        if let Ok(value) = std::env::var("NEXUS_BIND_ADDR") {
            if !value.trim().is_empty() {
                self.bind_addr = value;
            }
        }
        if let Ok(value) = std::env::var("NEXUS_STORE_PATH") {
            if !value.trim().is_empty() {
                self.store_path = value;
            }
        }
        if let Ok(value) = std::env::var("NEXUS_SCRIP_MASTER") {
            if !value.trim().is_empty() {
                self.instrument_master_path = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.live_feed_enabled);
        assert!(!cfg.order_entry_blocked);
        assert_eq!(cfg.max_feed_targets, 300);
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
        assert!(cfg.wide_window_indices.is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "max_feed_targets": 120, "wide_window_indices": ["NIFTY"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_feed_targets, 120);
        assert_eq!(cfg.wide_window_indices, vec!["NIFTY"]);
        assert!(cfg.live_feed_enabled);
        assert_eq!(cfg.pending_sweep_secs, 2);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_feed_targets, cfg2.max_feed_targets);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
    }

    #[test]
    fn atomic_save_round_trips_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.max_feed_targets = 150;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.max_feed_targets, 150);
        // The tmp sibling never survives.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
