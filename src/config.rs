//! TOML configuration for flowgnn.
//!
//! Every section is optional. A missing file, section or key falls back to the
//! compiled-in default, so an empty file is a valid configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "FLOWGNN_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/flowgnn/flowgnn.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGnnConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlowGnnConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded flowgnn configuration");
        Ok(config)
    }

    /// First loadable file among [`Self::search_path`], else defaults.
    pub fn load_or_default() -> Self {
        let candidates = Self::search_path(std::env::var_os(CONFIG_ENV));
        for path in &candidates {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unusable config file"),
            }
        }
        debug!(tried = candidates.len(), "no config file loaded, using compiled-in defaults");
        Self::default()
    }

    /// Files to try, most specific first: the `$FLOWGNN_CONFIG` override
    /// (always tried), then the system file if it exists.
    pub fn search_path(env_override: Option<OsString>) -> Vec<PathBuf> {
        let system = Path::new(SYSTEM_CONFIG_PATH);
        env_override
            .map(PathBuf::from)
            .into_iter()
            .chain(system.exists().then(|| system.to_path_buf()))
            .collect()
    }

    /// An explicit `--config` path must load; otherwise use the layered lookup.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP ingestion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// SQLite database for ingested traces.
    pub db_path: PathBuf,
    /// Commands queued to the trainer before ingestion applies backpressure.
    pub trainer_queue: usize,
    /// Largest accepted export body, after decompression.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            db_path: PathBuf::from("flowgnn.db"),
            trainer_queue: 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Graph network and optimizer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_dim: usize,
    pub dropout: f32,
    pub learning_rate: f32,
    pub weight_decay: f32,
    /// Seeds weight init, dropout and the label embedding tables.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 16,
            dropout: 0.5,
            learning_rate: 0.01,
            weight_decay: 5e-4,
            seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    pub embedding_dim: usize,
    /// Distinct labels per kind. Running out is a hard error.
    pub capacity: usize,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            embedding_dim: crate::graph::EMBEDDING_DIM,
            capacity: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Offline k-NN classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Neighbours per row, the row itself included.
    pub k: usize,
    pub epochs: usize,
    /// Epochs without loss improvement before stopping early.
    pub patience: usize,
    pub use_diversity_index: bool,
    pub diversity_window_secs: u64,
    /// Diversity worker threads. 0 picks the number of CPUs.
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            k: 5,
            epochs: 30,
            patience: 3,
            use_diversity_index: true,
            diversity_window_secs: 10,
            workers: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = FlowGnnConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8000");
        assert_eq!(cfg.server.db_path, PathBuf::from("flowgnn.db"));

        assert_eq!(cfg.model.hidden_dim, 16);
        assert_eq!(cfg.model.dropout, 0.5);
        assert_eq!(cfg.model.learning_rate, 0.01);
        assert_eq!(cfg.model.weight_decay, 5e-4);

        assert_eq!(cfg.vocabulary.embedding_dim, 16);
        assert_eq!(cfg.vocabulary.capacity, 1000);

        assert_eq!(cfg.batch.k, 5);
        assert_eq!(cfg.batch.epochs, 30);
        assert_eq!(cfg.batch.patience, 3);
        assert_eq!(cfg.batch.diversity_window_secs, 10);
        assert!(cfg.batch.use_diversity_index);

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"
db_path = "/var/lib/flowgnn/traces.db"

[model]
hidden_dim = 32
dropout = 0.2
seed = 7

[vocabulary]
capacity = 4096

[batch]
k = 8
use_diversity_index = false
workers = 4

[logging]
level = "debug"
json = true
"#;
        let cfg: FlowGnnConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.server.db_path, PathBuf::from("/var/lib/flowgnn/traces.db"));
        assert_eq!(cfg.model.hidden_dim, 32);
        assert_eq!(cfg.model.dropout, 0.2);
        assert_eq!(cfg.model.seed, 7);
        // Unset keys inside a present section keep their defaults.
        assert_eq!(cfg.model.learning_rate, 0.01);
        assert_eq!(cfg.vocabulary.capacity, 4096);
        assert_eq!(cfg.vocabulary.embedding_dim, 16);
        assert_eq!(cfg.batch.k, 8);
        assert!(!cfg.batch.use_diversity_index);
        assert_eq!(cfg.batch.workers, 4);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: FlowGnnConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8000");
        assert_eq!(cfg.batch.epochs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgnn.toml");
        std::fs::write(&path, "[batch]\nk = 3\n").unwrap();

        let cfg = FlowGnnConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.batch.k, 3);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = FlowGnnConfig::resolve(Some(Path::new("/nonexistent/flowgnn.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_search_path_puts_override_first() {
        let paths = FlowGnnConfig::search_path(Some(OsString::from("/tmp/override.toml")));
        assert_eq!(paths[0], PathBuf::from("/tmp/override.toml"));
        assert!(paths.len() <= 2);

        let without = FlowGnnConfig::search_path(None);
        assert_eq!(without.len(), paths.len() - 1);
        assert!(without.iter().all(|p| p == Path::new(SYSTEM_CONFIG_PATH)));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[model\nhidden_dim = ").unwrap();
        assert!(FlowGnnConfig::load(&path).is_err());
    }
}
