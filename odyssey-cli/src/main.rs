//! Odyssey CLI: attribution reports for clinical-sequence classifiers.
//!
//! Every subcommand is a single batch run: load inputs, attribute, write the
//! report, exit.

mod commands;

use clap::Parser;
use odyssey_core::config::{
    AttributionConfig, BaselineKind, OdysseyConfig, RiemannRule, ScoreTarget,
};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Odyssey: gradient attribution for clinical-sequence classifiers
#[derive(Parser, Debug)]
#[command(name = "odyssey", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Render integrated-gradient token attributions
    Attribute {
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Render expected-gradient token attributions over sampled baselines
    Expected {
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        render: RenderArgs,
        /// Baselines drawn per example
        #[arg(short = 'k', long)]
        num_baselines: Option<usize>,
    },
    /// Batch-averaged attribution report as JSON
    Summary {
        #[command(flatten)]
        inputs: InputArgs,
        /// Aggregate per token or per embedding cell
        #[arg(long, value_enum, default_value = "tokens")]
        kind: SummaryKind,
        /// Add per-label mean token scores (every example needs a label)
        #[arg(long)]
        by_label: bool,
        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compare saved model predictions by ROC AUC
    Roc {
        /// Prediction files (`{"name", "labels", "scores"}` JSON)
        #[arg(required = true)]
        predictions: Vec<PathBuf>,
        /// Write one `<model>.csv` curve per model into this directory
        #[arg(long)]
        csv_dir: Option<PathBuf>,
    },
    /// Build a concept vocabulary from patient records
    Vocab {
        /// Patient records (JSON lines)
        data: PathBuf,
        /// Task names to register as task tokens (comma separated)
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,
        /// Vocabulary file to write
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write a randomly initialised reference classifier checkpoint
    InitModel {
        /// Model hyper-parameter YAML (defaults to `paths.model_config`)
        #[arg(long)]
        model_config: Option<PathBuf>,
        /// Model family inside the YAML
        #[arg(long, default_value = "bigbird")]
        family: String,
        /// Vocabulary file (defaults to `paths.vocab`)
        #[arg(long)]
        vocab: Option<PathBuf>,
        #[arg(long, default_value_t = 23)]
        seed: u64,
        /// Add sinusoidal age/time features to the embedding
        #[arg(long)]
        time_features: bool,
        /// Checkpoint file to write
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default `.odyssey/config.toml` into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

/// Input locations and attribution settings. Unset flags fall back to configuration.
#[derive(clap::Args, Debug, Clone, Default)]
struct InputArgs {
    /// Patient records (JSON lines)
    #[arg(long)]
    data: Option<PathBuf>,
    /// Vocabulary file (`{token: id}` JSON)
    #[arg(long)]
    vocab: Option<PathBuf>,
    /// Classifier checkpoint (JSON)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Records expected-gradient baselines are drawn from
    #[arg(long)]
    baseline_pool: Option<PathBuf>,
    /// Task whose labels are used
    #[arg(long)]
    task: Option<String>,
    #[arg(long)]
    max_len: Option<usize>,
    /// Maximum number of examples attributed
    #[arg(long)]
    max_examples: Option<usize>,
    /// Integration steps
    #[arg(long)]
    steps: Option<usize>,
    #[arg(long, value_enum)]
    rule: Option<RuleArg>,
    /// Class whose score is attributed
    #[arg(long)]
    target_class: Option<usize>,
    #[arg(long, value_enum)]
    score: Option<ScoreArg>,
    #[arg(long, value_enum)]
    baseline: Option<BaselineArg>,
    /// Seed for baseline sampling
    #[arg(long)]
    seed: Option<u64>,
}

impl InputArgs {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut OdysseyConfig) {
        let paths = &mut config.paths;
        for (flag, slot) in [
            (&self.data, &mut paths.data),
            (&self.vocab, &mut paths.vocab),
            (&self.checkpoint, &mut paths.checkpoint),
            (&self.baseline_pool, &mut paths.baseline_pool),
        ] {
            if let Some(path) = flag {
                *slot = Some(path.clone());
            }
        }

        let data = &mut config.data;
        if let Some(task) = &self.task {
            data.task = task.clone();
        }
        if let Some(max_len) = self.max_len {
            data.max_len = max_len;
        }
        if let Some(max_examples) = self.max_examples {
            data.max_examples = max_examples;
        }
        self.apply_attribution(&mut config.attribution);
    }

    fn apply_attribution(&self, attribution: &mut AttributionConfig) {
        if let Some(steps) = self.steps {
            attribution.n_steps = steps;
        }
        if let Some(rule) = self.rule {
            attribution.rule = rule.into();
        }
        if let Some(class) = self.target_class {
            attribution.target_class = class;
        }
        if let Some(score) = self.score {
            attribution.score_target = score.into();
        }
        if let Some(kind) = self.baseline {
            attribution.baseline.kind = kind.into();
        }
        if let Some(seed) = self.seed {
            attribution.baseline.seed = seed;
        }
    }
}

/// Rendering options shared by `attribute` and `expected`.
#[derive(clap::Args, Debug, Clone)]
struct RenderArgs {
    /// Number of examples rendered
    #[arg(long)]
    max_rows: Option<usize>,
    /// Heading shown above the rendering
    #[arg(long)]
    task_name: Option<String>,
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,
    /// Write the rendering here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Html,
    Json,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SummaryKind {
    Tokens,
    Embeddings,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum RuleArg {
    Left,
    Right,
    Middle,
    Trapezoid,
}

impl From<RuleArg> for RiemannRule {
    fn from(rule: RuleArg) -> Self {
        match rule {
            RuleArg::Left => RiemannRule::Left,
            RuleArg::Right => RiemannRule::Right,
            RuleArg::Middle => RiemannRule::Middle,
            RuleArg::Trapezoid => RiemannRule::Trapezoid,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreArg {
    Logit,
    Probability,
}

impl From<ScoreArg> for ScoreTarget {
    fn from(score: ScoreArg) -> Self {
        match score {
            ScoreArg::Logit => ScoreTarget::Logit,
            ScoreArg::Probability => ScoreTarget::Probability,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum BaselineArg {
    Padding,
    Mask,
    Zero,
}

impl From<BaselineArg> for BaselineKind {
    fn from(kind: BaselineArg) -> Self {
        match kind {
            BaselineArg::Padding => BaselineKind::Padding,
            BaselineArg::Mask => BaselineKind::Mask,
            BaselineArg::Zero => BaselineKind::Zero,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("ai", "odyssey", "odyssey")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "odyssey.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply_over_config() {
        let cli = Cli::parse_from([
            "odyssey",
            "expected",
            "--data",
            "records.jsonl",
            "--steps",
            "12",
            "--score",
            "probability",
            "--baseline",
            "mask",
            "-k",
            "7",
        ]);
        let Commands::Expected {
            inputs,
            num_baselines,
            render,
        } = cli.command
        else {
            panic!("expected the expected-gradients subcommand");
        };
        let mut config = OdysseyConfig::default();
        inputs.apply(&mut config);
        assert_eq!(config.paths.data, Some(PathBuf::from("records.jsonl")));
        assert_eq!(config.paths.vocab, None);
        assert_eq!(config.attribution.n_steps, 12);
        assert_eq!(config.attribution.score_target, ScoreTarget::Probability);
        assert_eq!(config.attribution.baseline.kind, BaselineKind::Mask);
        assert_eq!(config.attribution.baseline.seed, 23);
        assert_eq!(num_baselines, Some(7));
        assert_eq!(render.format, OutputFormat::Table);
    }
}
