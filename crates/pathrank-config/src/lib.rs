use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PATHRANK_DIR_NAME: &str = ".pathrank";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_FOLD_BATCH_LIMIT: usize = 1000;
pub const DEFAULT_RANK_BATCH_SIZE: usize = 500;
pub const DEFAULT_RETAINED_RANK_GENERATIONS: usize = 2;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PathrankConfig {
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Reference sets claimed per aggregation call.
    #[serde(default = "default_fold_batch_limit")]
    pub fold_batch_limit: usize,
    /// Path count inputs consumed per rank-writer call.
    #[serde(default = "default_rank_batch_size")]
    pub rank_batch_size: usize,
    /// Generations of rank records kept per base key, the current one included.
    #[serde(default = "default_retained_rank_generations")]
    pub retained_rank_generations: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            fold_batch_limit: DEFAULT_FOLD_BATCH_LIMIT,
            rank_batch_size: DEFAULT_RANK_BATCH_SIZE,
            retained_rank_generations: DEFAULT_RETAINED_RANK_GENERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn pathrank_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(PATHRANK_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    pathrank_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PathrankConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(PathrankConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PathrankConfig = toml::from_str(&raw)?;
    Ok(parsed)
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PathrankConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(pathrank_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = PathrankConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Reports values that [`normalize_config`] would have to clamp.
pub fn validate_config(config: &PathrankConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.ranking.fold_batch_limit == 0 {
        warnings.push(ConfigWarning {
            code: "ranking.fold_batch_limit",
            message: "fold_batch_limit is 0, aggregation would never claim references; using 1"
                .to_owned(),
        });
    }
    if config.ranking.rank_batch_size == 0 {
        warnings.push(ConfigWarning {
            code: "ranking.rank_batch_size",
            message: "rank_batch_size is 0, ranks would never be written; using 1".to_owned(),
        });
    }
    if config.ranking.retained_rank_generations == 0 {
        warnings.push(ConfigWarning {
            code: "ranking.retained_rank_generations",
            message: "retained_rank_generations is 0, the current generation is always kept; using 1"
                .to_owned(),
        });
    }
    if config.storage.busy_timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "storage.busy_timeout_ms",
            message: format!(
                "busy_timeout_ms is 0, concurrent workers would fail immediately; using {DEFAULT_BUSY_TIMEOUT_MS}"
            ),
        });
    }

    warnings
}

pub fn normalize_config(mut config: PathrankConfig) -> PathrankConfig {
    config.ranking.fold_batch_limit = config.ranking.fold_batch_limit.max(1);
    config.ranking.rank_batch_size = config.ranking.rank_batch_size.max(1);
    config.ranking.retained_rank_generations = config.ranking.retained_rank_generations.max(1);
    if config.storage.busy_timeout_ms == 0 {
        config.storage.busy_timeout_ms = DEFAULT_BUSY_TIMEOUT_MS;
    }

    config
}

fn default_fold_batch_limit() -> usize {
    DEFAULT_FOLD_BATCH_LIMIT
}

fn default_rank_batch_size() -> usize {
    DEFAULT_RANK_BATCH_SIZE
}

fn default_retained_rank_generations() -> usize {
    DEFAULT_RETAINED_RANK_GENERATIONS
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
