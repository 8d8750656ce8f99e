//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, InputArgs, OutputFormat, RenderArgs, SummaryKind};
use anyhow::Context;
use odyssey_core::config::OdysseyConfig;
use odyssey_core::dataset::{Example, FinetuneDataset, PatientRecord, parse_records};
use odyssey_core::model_config::ModelConfigFile;
use odyssey_core::sequence::EncodedSequence;
use odyssey_core::tokenizer::ConceptTokenizer;
use odyssey_ml::eval::{ModelPredictions, compare_models};
use odyssey_ml::interpretability::{Interpreter, Rendering};
use odyssey_ml::model::EmbeddingClassifier;
use std::path::{Path, PathBuf};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Attribute { inputs, render } => {
            handle_render(inputs, render, Method::Integrated, workspace).await
        }
        Commands::Expected {
            inputs,
            render,
            num_baselines,
        } => handle_render(inputs, render, Method::Expected(num_baselines), workspace).await,
        Commands::Summary {
            inputs,
            kind,
            by_label,
            output,
        } => handle_summary(inputs, kind, by_label, output, workspace).await,
        Commands::Roc {
            predictions,
            csv_dir,
        } => handle_roc(predictions, csv_dir).await,
        Commands::Vocab {
            data,
            tasks,
            output,
        } => handle_vocab(data, tasks, output).await,
        Commands::InitModel {
            model_config,
            family,
            vocab,
            seed,
            time_features,
            output,
        } => {
            handle_init_model(
                model_config,
                &family,
                vocab,
                seed,
                time_features,
                output,
                workspace,
            )
            .await
        }
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

fn resolve_config(workspace: &Path, inputs: &InputArgs) -> anyhow::Result<OdysseyConfig> {
    let mut config = odyssey_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    inputs.apply(&mut config);
    Ok(config)
}

fn require<'a>(path: &'a Option<PathBuf>, name: &str) -> anyhow::Result<&'a Path> {
    path.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "No {name} file configured. Pass --{} or set paths.{name} in .odyssey/config.toml",
            name.replace('_', "-")
        )
    })
}

async fn read(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn read_records(path: &Path) -> anyhow::Result<Vec<PatientRecord>> {
    let content = read(path).await?;
    parse_records(&content).with_context(|| format!("Invalid records in {}", path.display()))
}

async fn write_output(output: Option<&Path>, text: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            tokio::fs::write(path, text)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => println!("{}", text),
    }
    Ok(())
}

/// Everything an attribution run needs, loaded up front.
struct Workload {
    tokenizer: ConceptTokenizer,
    model: EmbeddingClassifier,
    examples: Vec<Example>,
    pool: Vec<EncodedSequence>,
}

async fn load_workload(config: &OdysseyConfig) -> anyhow::Result<Workload> {
    let paths = &config.paths;
    let records = read_records(require(&paths.data, "data")?).await?;
    let tokenizer = ConceptTokenizer::from_json(&read(require(&paths.vocab, "vocab")?).await?)?;
    let checkpoint = require(&paths.checkpoint, "checkpoint")?;
    let model = EmbeddingClassifier::from_json(&read(checkpoint).await?)
        .with_context(|| format!("Invalid checkpoint {}", checkpoint.display()))?;
    if model.vocab_size() != tokenizer.vocab_size() {
        anyhow::bail!(
            "Checkpoint vocabulary ({}) does not match tokenizer vocabulary ({})",
            model.vocab_size(),
            tokenizer.vocab_size()
        );
    }

    let data = &config.data;
    let examples = FinetuneDataset::new(
        records,
        &tokenizer,
        data.task.clone(),
        data.max_len,
        data.nan_indicator,
    )
    .examples(data.max_examples)?;

    let pool = match &paths.baseline_pool {
        Some(path) => {
            let records = read_records(path).await?;
            FinetuneDataset::new(
                records,
                &tokenizer,
                data.task.clone(),
                data.max_len,
                data.nan_indicator,
            )
            .examples(usize::MAX)?
            .into_iter()
            .map(|e| e.sequence)
            .collect()
        }
        None => Vec::new(),
    };

    tracing::info!(
        examples = examples.len(),
        pool = pool.len(),
        task = %data.task,
        "Loaded attribution inputs"
    );
    Ok(Workload {
        tokenizer,
        model,
        examples,
        pool,
    })
}

/// Attribution estimator behind a rendering.
#[derive(Debug, Clone, Copy)]
enum Method {
    Integrated,
    /// Baselines per example; `None` uses `baseline.num_samples`.
    Expected(Option<usize>),
}

async fn handle_render(
    inputs: InputArgs,
    render: RenderArgs,
    method: Method,
    workspace: &Path,
) -> anyhow::Result<()> {
    let mut config = resolve_config(workspace, &inputs)?;
    if let Some(max_rows) = render.max_rows {
        config.report.max_rows = max_rows;
    }
    if let Some(task_name) = &render.task_name {
        config.report.task_name = task_name.clone();
    }
    let workload = load_workload(&config).await?;

    let report = config.report.clone();
    let attribution = config.attribution.clone();
    let num_samples = attribution.baseline.num_samples;
    let rendering = tokio::task::spawn_blocking(move || -> anyhow::Result<Rendering> {
        let interpreter = Interpreter::new(
            &workload.model,
            &workload.tokenizer,
            workload.examples,
            attribution,
        )?
        .with_reference_pool(workload.pool);
        let rendering = match method {
            Method::Integrated => {
                interpreter.visualize_integrated_gradients(report.max_rows, &report.task_name)?
            }
            Method::Expected(k) => interpreter.visualize_expected_gradients(
                report.max_rows,
                k.unwrap_or(num_samples),
                &report.task_name,
            )?,
        };
        Ok(rendering)
    })
    .await??;

    let text = match render.format {
        OutputFormat::Table => rendering.to_table(),
        OutputFormat::Html => rendering.to_html(),
        OutputFormat::Json => serde_json::to_string_pretty(&rendering)?,
    };
    write_output(render.output.as_deref(), &text).await
}

async fn handle_summary(
    inputs: InputArgs,
    kind: SummaryKind,
    by_label: bool,
    output: Option<PathBuf>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = resolve_config(workspace, &inputs)?;
    let workload = load_workload(&config).await?;
    let attribution = config.attribution.clone();

    let report = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let interpreter = Interpreter::new(
            &workload.model,
            &workload.tokenizer,
            workload.examples,
            attribution,
        )?;
        let report = match (kind, by_label) {
            (SummaryKind::Tokens, false) => interpreter.average_tokens_attr()?,
            (SummaryKind::Tokens, true) => interpreter.average_tokens_attr_by_label()?,
            (SummaryKind::Embeddings, false) => interpreter.average_embeddings_attr()?,
            (SummaryKind::Embeddings, true) => {
                anyhow::bail!("--by-label is only available for token summaries")
            }
        };
        Ok(report)
    })
    .await??;

    let json = serde_json::to_string_pretty(&report)?;
    write_output(output.as_deref(), &json).await
}

async fn handle_roc(predictions: Vec<PathBuf>, csv_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut models = Vec::with_capacity(predictions.len());
    for path in &predictions {
        let model = ModelPredictions::from_json(&read(path).await?)
            .with_context(|| format!("Invalid predictions in {}", path.display()))?;
        models.push(model);
    }
    let results = compare_models(&models)?;

    println!("{:<32} {:>8} {:>10} {:>10}", "Model", "AUC", "Positives", "Negatives");
    for r in &results {
        println!(
            "{:<32} {:>8.4} {:>10} {:>10}",
            r.name, r.auc, r.positives, r.negatives
        );
    }

    if let Some(dir) = csv_dir {
        tokio::fs::create_dir_all(&dir).await?;
        for r in &results {
            let path = dir.join(format!("{}.csv", csv_file_stem(&r.name)));
            tokio::fs::write(&path, r.curve.to_csv())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        println!("\nCurves written to {}", dir.display());
    }
    Ok(())
}

fn csv_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn handle_vocab(data: PathBuf, tasks: Vec<String>, output: PathBuf) -> anyhow::Result<()> {
    let records = read_records(&data).await?;
    let tokenizer = ConceptTokenizer::fit(records.iter().flat_map(|r| r.event_tokens.iter()))
        .with_task_tokens(&tasks);
    tokenizer.save(&output)?;
    let task_tokens = tokenizer.task_token_count();
    println!(
        "Wrote {} tokens ({} concepts, {} tasks) to {}",
        tokenizer.vocab_size(),
        tokenizer.vocab_size() - tokenizer.first_token_index() as usize - task_tokens,
        task_tokens,
        output.display()
    );
    Ok(())
}

async fn handle_init_model(
    model_config: Option<PathBuf>,
    family: &str,
    vocab: Option<PathBuf>,
    seed: u64,
    time_features: bool,
    output: PathBuf,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = resolve_config(workspace, &InputArgs::default())?;
    let model_config = model_config.or(config.paths.model_config);
    let vocab = vocab.or(config.paths.vocab);

    let yaml = read(require(&model_config, "model_config")?).await?;
    let families = ModelConfigFile::from_yaml_str(&yaml)?;
    let arch = &families.get(family)?.model;
    let tokenizer = ConceptTokenizer::from_json(&read(require(&vocab, "vocab")?).await?)?;

    let model = EmbeddingClassifier::random(arch, tokenizer.vocab_size(), seed)
        .with_time_features(time_features);
    model.save(&output)?;
    println!(
        "Wrote {} classifier (dim {}, {} labels, vocab {}) to {}",
        family,
        arch.embedding_size,
        arch.num_labels,
        tokenizer.vocab_size(),
        output.display()
    );
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".odyssey");
            tokio::fs::create_dir_all(&config_dir).await?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&OdysseyConfig::default())?;
            tokio::fs::write(&config_path, &toml_str).await?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = odyssey_core::config::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_csv_file_stem() {
        assert_eq!(csv_file_stem("bigbird-2048"), "bigbird-2048");
        assert_eq!(csv_file_stem("xgb/baseline v2"), "xgb_baseline_v2");
    }

    #[tokio::test]
    async fn test_vocab_registers_task_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("records.jsonl");
        std::fs::write(&data, r#"{"event_tokens": ["[CLS]", "I10"]}"#).unwrap();
        let vocab = dir.path().join("vocab.json");
        handle_vocab(data, vec!["c0".to_string()], vocab.clone())
            .await
            .unwrap();
        let tokenizer = ConceptTokenizer::load(&vocab).unwrap();
        assert_eq!(tokenizer.task_to_token("c0").unwrap(), "[C0]");
        assert_eq!(tokenizer.token_to_id("I10"), 7);
    }

    #[test]
    fn test_require_names_flag() {
        let err = require(&None, "baseline_pool").unwrap_err().to_string();
        assert!(err.contains("--baseline-pool"));
        assert!(err.contains("paths.baseline_pool"));
    }

    #[tokio::test]
    async fn test_config_init_then_show() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path()).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join(".odyssey/config.toml")).unwrap();
        let parsed: OdysseyConfig = toml::from_str(&written).unwrap();
        assert_eq!(parsed.attribution.n_steps, 50);
        assert_eq!(parsed.data.task, "mortality_1month");
    }

    #[tokio::test]
    async fn test_end_to_end_summary() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("records.jsonl");
        std::fs::write(
            &data,
            concat!(
                r#"{"patient_id": "a", "event_tokens": ["[CLS]", "I10", "E11"], "labels": {"mortality_1month": 1}}"#,
                "\n",
                r#"{"patient_id": "b", "event_tokens": ["[CLS]", "Z00"], "labels": {"mortality_1month": 0}}"#,
                "\n"
            ),
        )
        .unwrap();
        let vocab = dir.path().join("vocab.json");
        handle_vocab(data.clone(), Vec::new(), vocab.clone())
            .await
            .unwrap();

        let yaml = dir.path().join("model_config.yaml");
        std::fs::write(
            &yaml,
            "tiny:\n  model:\n    embedding_size: 4\n    type_vocab_size: 2\n    max_num_visits: 4\n",
        )
        .unwrap();
        let checkpoint = dir.path().join("model.json");
        handle_init_model(
            Some(yaml),
            "tiny",
            Some(vocab.clone()),
            3,
            false,
            checkpoint.clone(),
            dir.path(),
        )
        .await
        .unwrap();

        let inputs = InputArgs {
            data: Some(data),
            vocab: Some(vocab),
            checkpoint: Some(checkpoint),
            max_len: Some(4),
            steps: Some(5),
            ..Default::default()
        };
        let output = dir.path().join("summary.json");
        handle_summary(
            inputs,
            SummaryKind::Tokens,
            true,
            Some(output.clone()),
            dir.path(),
        )
        .await
        .unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(report["kind"], "tokens");
        assert_eq!(report["count"], 2);
        assert!(report["by_label"].get("1").is_some());
    }
}
