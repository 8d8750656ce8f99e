//! Configuration system for Odyssey.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.odyssey/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OdysseyConfig {
    /// Attribution run settings.
    #[serde(default)]
    pub attribution: AttributionConfig,
    /// Dataset settings.
    #[serde(default)]
    pub data: DataConfig,
    /// Report rendering settings.
    #[serde(default)]
    pub report: ReportConfig,
    /// Input file locations.
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Riemann rule used to discretise the integration path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiemannRule {
    Left,
    #[default]
    Right,
    Middle,
    Trapezoid,
}

/// Which scalar of the classifier output is attributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTarget {
    /// Raw logit of the target class.
    #[default]
    Logit,
    /// Softmax probability of the target class, clipped to `[eps, 1 - eps]`.
    Probability,
}

/// Reference input that attribution is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineKind {
    /// Non-special concepts replaced by `[PAD]`.
    #[default]
    Padding,
    /// Non-special concepts replaced by `[MASK]`.
    Mask,
    /// All-zero embedding.
    Zero,
}

/// Baseline provider configuration. Carries the seed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    #[serde(default)]
    pub kind: BaselineKind,
    /// Number of baselines drawn for expected gradients.
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            kind: BaselineKind::default(),
            num_samples: default_num_samples(),
            seed: default_seed(),
        }
    }
}

fn default_num_samples() -> usize {
    20
}

fn default_seed() -> u64 {
    23
}

/// Attribution run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Number of interpolation steps for integrated gradients.
    #[serde(default = "default_n_steps")]
    pub n_steps: usize,
    #[serde(default)]
    pub rule: RiemannRule,
    /// Class index whose score is attributed.
    #[serde(default = "default_target_class")]
    pub target_class: usize,
    #[serde(default)]
    pub score_target: ScoreTarget,
    #[serde(default = "default_clip_epsilon")]
    pub clip_epsilon: f64,
    /// Normalise token scores by their L2 norm before aggregation.
    #[serde(default = "default_true")]
    pub normalize_tokens: bool,
    #[serde(default)]
    pub baseline: BaselineConfig,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            n_steps: default_n_steps(),
            rule: RiemannRule::default(),
            target_class: default_target_class(),
            score_target: ScoreTarget::default(),
            clip_epsilon: default_clip_epsilon(),
            normalize_tokens: true,
            baseline: BaselineConfig::default(),
        }
    }
}

fn default_n_steps() -> usize {
    50
}

fn default_target_class() -> usize {
    1
}

fn default_clip_epsilon() -> f64 {
    1e-6
}

fn default_true() -> bool {
    true
}

/// Dataset settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Task whose label column is used.
    #[serde(default = "default_task")]
    pub task: String,
    /// Label value meaning "missing".
    #[serde(default = "default_nan_indicator")]
    pub nan_indicator: i64,
    /// Maximum number of examples attributed per run.
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            task: default_task(),
            nan_indicator: default_nan_indicator(),
            max_examples: default_max_examples(),
        }
    }
}

fn default_max_len() -> usize {
    2048
}

fn default_task() -> String {
    "mortality_1month".to_string()
}

fn default_nan_indicator() -> i64 {
    -1
}

fn default_max_examples() -> usize {
    100
}

/// Report rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_task_name")]
    pub task_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            task_name: default_task_name(),
        }
    }
}

fn default_max_rows() -> usize {
    10
}

fn default_task_name() -> String {
    "Mortality Prediction".to_string()
}

/// Input file locations. Unset paths must be supplied on the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub data: Option<PathBuf>,
    #[serde(default)]
    pub vocab: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub model_config: Option<PathBuf>,
    /// Reference pool for expected-gradient baselines. Defaults to `data`.
    #[serde(default)]
    pub baseline_pool: Option<PathBuf>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `ODYSSEY_`)
/// 3. Workspace-local config (`.odyssey/config.toml`)
/// 4. User config (`config.toml` in the platform config dir)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&OdysseyConfig>,
) -> Result<OdysseyConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(OdysseyConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("ai", "odyssey", "odyssey") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".odyssey").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // ODYSSEY_ATTRIBUTION__N_STEPS, ODYSSEY_DATA__TASK, etc.
    figment = figment.merge(Env::prefixed("ODYSSEY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether a workspace-level or user-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("ai", "odyssey", "odyssey") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }

    if let Some(ws) = workspace {
        if ws.join(".odyssey").join("config.toml").exists() {
            return true;
        }
    }

    false
}
