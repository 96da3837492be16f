//! Application configuration for linkflow.
//!
//! User config lives at `~/.linkflow/linkflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkflowError, Result};
use crate::types::Stage;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "linkflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".linkflow";

/// Longest retry delay or task budget accepted from a config file (one year).
pub const MAX_CONFIGURED_SECS: u64 = 365 * 24 * 3600;

// ---------------------------------------------------------------------------
// Config structs (matching linkflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Item store location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sweeper cadence.
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Pipeline-wide retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Link classification rules.
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Per-stage retry, budget, and back-pressure settings.
    #[serde(default)]
    pub stages: StagesConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.linkflow/linkflow.db".into()
}

/// `[sweeper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Maximum items repaired per sweep kind per pass.
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            batch_size: default_sweep_batch(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}
fn default_sweep_batch() -> u32 {
    100
}

/// `[retry]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Optional cap on failed attempts across all stages of one item.
    /// Unset means only the per-stage caps apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_max_attempts: Option<u32>,
}

/// `[classification]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Regexes that mark a link as a job posting.
    #[serde(default = "default_job_patterns")]
    pub job_patterns: Vec<String>,

    /// Regexes that mark a link as a feed post.
    #[serde(default = "default_post_patterns")]
    pub post_patterns: Vec<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            job_patterns: default_job_patterns(),
            post_patterns: default_post_patterns(),
        }
    }
}

fn default_job_patterns() -> Vec<String> {
    vec![r"^https?://(www\.)?linkedin\.com/jobs".into()]
}
fn default_post_patterns() -> Vec<String> {
    vec![
        r"^https?://(www\.)?linkedin\.com/posts".into(),
        r"^https?://(www\.)?linkedin\.com/feed/update".into(),
    ]
}

/// `[stages]` section with one table per claimable stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_acquisition")]
    pub acquisition: StageConfig,

    #[serde(default = "default_normalization")]
    pub normalization: StageConfig,

    #[serde(default = "default_extraction")]
    pub extraction: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            acquisition: default_acquisition(),
            normalization: default_normalization(),
            extraction: default_extraction(),
        }
    }
}

impl StagesConfig {
    /// Settings for one stage.
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Acquisition => &self.acquisition,
            Stage::Normalization => &self.normalization,
            Stage::Extraction => &self.extraction,
        }
    }
}

/// `[stages.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Failed attempts allowed before the item is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay in seconds.
    pub base_delay_secs: u64,
    /// Growth factor between successive retry delays.
    pub multiplier: f64,
    /// Ceiling on any single retry delay, in seconds.
    pub max_delay_secs: u64,
    /// Seconds a worker may hold a claim before the sweeper reclaims it.
    pub task_budget_secs: u64,
    /// Pending items at which upstream admission into this stage pauses.
    /// Unset disables back-pressure for the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_threshold: Option<u64>,
}

// The acquisition stage is the slow, rate-limited one: long budget, long
// backoff, tight backlog.
fn default_acquisition() -> StageConfig {
    StageConfig {
        max_attempts: 5,
        base_delay_secs: 60,
        multiplier: 2.0,
        max_delay_secs: 3600,
        task_budget_secs: 600,
        backlog_threshold: Some(200),
    }
}
fn default_normalization() -> StageConfig {
    StageConfig {
        max_attempts: 3,
        base_delay_secs: 10,
        multiplier: 2.0,
        max_delay_secs: 600,
        task_budget_secs: 120,
        backlog_threshold: Some(500),
    }
}
fn default_extraction() -> StageConfig {
    StageConfig {
        max_attempts: 3,
        base_delay_secs: 30,
        multiplier: 2.0,
        max_delay_secs: 1800,
        task_budget_secs: 300,
        backlog_threshold: Some(500),
    }
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, derived from the config file)
// ---------------------------------------------------------------------------

/// Runtime policy for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub task_budget: Duration,
    pub backlog_threshold: Option<u64>,
}

impl From<&StageConfig> for StagePolicy {
    fn from(config: &StageConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            multiplier: config.multiplier,
            max_delay: Duration::from_secs(config.max_delay_secs),
            task_budget: Duration::from_secs(config.task_budget_secs),
            backlog_threshold: config.backlog_threshold,
        }
    }
}

/// Runtime engine configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stages: BTreeMap<Stage, StagePolicy>,
    pub pipeline_max_attempts: Option<u32>,
    pub sweep_interval: Duration,
    pub sweep_batch: u32,
    pub job_patterns: Vec<String>,
    pub post_patterns: Vec<String>,
}

impl PipelineConfig {
    /// Policy for a stage. Every stage always has one.
    pub fn stage(&self, stage: Stage) -> &StagePolicy {
        &self.stages[&stage]
    }

    /// Replace one stage's policy (builder style, handy in tests).
    pub fn with_stage(mut self, stage: Stage, policy: StagePolicy) -> Self {
        self.stages.insert(stage, policy);
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            stages: Stage::ALL
                .into_iter()
                .map(|stage| (stage, StagePolicy::from(config.stages.get(stage))))
                .collect(),
            pipeline_max_attempts: config.retry.pipeline_max_attempts,
            sweep_interval: Duration::from_secs(config.sweeper.interval_secs),
            sweep_batch: config.sweeper.batch_size,
            job_patterns: config.classification.job_patterns.clone(),
            post_patterns: config.classification.post_patterns.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.linkflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LinkflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.linkflow/linkflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LinkflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        LinkflowError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LinkflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LinkflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LinkflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings the retry and back-pressure logic cannot honor.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for stage in Stage::ALL {
        let s = config.stages.get(stage);
        if s.max_attempts == 0 {
            return Err(LinkflowError::config(format!(
                "stages.{stage}.max_attempts must be at least 1"
            )));
        }
        if !s.multiplier.is_finite() || s.multiplier < 1.0 {
            return Err(LinkflowError::config(format!(
                "stages.{stage}.multiplier must be >= 1.0, got {}",
                s.multiplier
            )));
        }
        if s.base_delay_secs > s.max_delay_secs {
            return Err(LinkflowError::config(format!(
                "stages.{stage}.base_delay_secs exceeds max_delay_secs"
            )));
        }
        if s.task_budget_secs == 0 {
            return Err(LinkflowError::config(format!(
                "stages.{stage}.task_budget_secs must be positive"
            )));
        }
        for (field, secs) in [
            ("base_delay_secs", s.base_delay_secs),
            ("max_delay_secs", s.max_delay_secs),
            ("task_budget_secs", s.task_budget_secs),
        ] {
            if secs > MAX_CONFIGURED_SECS {
                return Err(LinkflowError::config(format!(
                    "stages.{stage}.{field} must be at most {MAX_CONFIGURED_SECS}, got {secs}"
                )));
            }
        }
    }
    if config.retry.pipeline_max_attempts == Some(0) {
        return Err(LinkflowError::config(
            "retry.pipeline_max_attempts must be at least 1 when set",
        ));
    }
    if config.sweeper.interval_secs == 0 {
        return Err(LinkflowError::config("sweeper.interval_secs must be positive"));
    }
    Ok(())
}

/// Expand a leading `~` in the configured database path.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = &config.database.path;
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| LinkflowError::config("could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(raw))
}
