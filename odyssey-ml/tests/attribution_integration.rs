//! End-to-end attribution runs: records -> tokenizer -> dataset -> model -> reports.

use odyssey_core::config::{
    AttributionConfig, BaselineConfig, BaselineKind, RiemannRule, ScoreTarget,
};
use odyssey_core::dataset::{FinetuneDataset, parse_records};
use odyssey_core::error::OdysseyError;
use odyssey_core::model_config::ArchitectureConfig;
use odyssey_core::tokenizer::ConceptTokenizer;
use odyssey_ml::eval::{ModelPredictions, compare_models};
use odyssey_ml::interpretability::{IntegratedGradients, Interpreter, ReportKind};
use odyssey_ml::model::{ClassScore, EmbeddingClassifier, ModelProvider};

const RECORDS: &str = r#"
{"patient_id": "p1", "event_tokens": ["[CLS]", "[VS]", "I10", "E11", "[VE]"], "type_tokens": [1, 2, 3, 3, 4], "labels": {"mortality_1month": 1}}
{"patient_id": "p2", "event_tokens": ["[CLS]", "[VS]", "Z00", "[VE]"], "type_tokens": [1, 2, 3, 4], "labels": {"mortality_1month": 0}}
{"patient_id": "p3", "event_tokens": ["[CLS]", "[VS]", "I10", "I10", "Z00", "[VE]"], "labels": {"mortality_1month": 1}, "cutoffs": {"mortality_1month": 4}}
{"patient_id": "p4", "event_tokens": ["[CLS]", "[VS]", "E11", "[VE]"], "labels": {"mortality_1month": -1}}
"#;

const MAX_LEN: usize = 8;

fn fixture() -> (ConceptTokenizer, EmbeddingClassifier, Vec<odyssey_core::dataset::Example>) {
    let records = parse_records(RECORDS).unwrap();
    let tokenizer = ConceptTokenizer::fit(records.iter().flat_map(|r| r.event_tokens.iter()));
    let arch = ArchitectureConfig {
        embedding_size: 4,
        num_labels: 2,
        type_vocab_size: 9,
        max_num_visits: 16,
        ..Default::default()
    };
    let mut model = EmbeddingClassifier::random(&arch, tokenizer.vocab_size(), 5);
    // I10 drives mortality, Z00 argues against it.
    let i10 = tokenizer.token_to_id("I10") as usize;
    let z00 = tokenizer.token_to_id("Z00") as usize;
    model.concept_row_mut(i10).copy_from_slice(&[1.5, 0.0, 0.0, 0.0]);
    model.concept_row_mut(z00).copy_from_slice(&[-1.5, 0.0, 0.0, 0.0]);
    model.head_row_mut(1).copy_from_slice(&[2.0, 0.0, 0.0, 0.0]);

    let dataset = FinetuneDataset::new(records, &tokenizer, "mortality_1month", MAX_LEN, -1);
    let examples = dataset.examples(10).unwrap();
    (tokenizer, model, examples)
}

fn config() -> AttributionConfig {
    AttributionConfig {
        n_steps: 30,
        rule: RiemannRule::Right,
        target_class: 1,
        score_target: ScoreTarget::Logit,
        baseline: BaselineConfig {
            kind: BaselineKind::Padding,
            num_samples: 6,
            seed: 23,
        },
        ..Default::default()
    }
}

#[test]
fn dataset_feeds_interpreter() {
    let (tokenizer, model, examples) = fixture();
    assert_eq!(examples.len(), 4);
    assert_eq!(examples[3].label, None);
    // p3 sees only its first four events.
    assert_eq!(examples[2].sequence.num_valid(), 4);

    let interp = Interpreter::new(&model, &tokenizer, examples, config()).unwrap();
    let report = interp.average_tokens_attr().unwrap();
    assert_eq!(report.kind, ReportKind::Tokens);
    assert_eq!(report.shape, (MAX_LEN, 1));
    assert_eq!(report.count, 4);

    let i10 = report.by_token.iter().find(|t| t.token == "I10").unwrap();
    let z00 = report.by_token.iter().find(|t| t.token == "Z00").unwrap();
    assert!(i10.mean > 0.0);
    assert!(z00.mean < 0.0);
    let top: Vec<_> = report.top_tokens(2).iter().map(|t| t.token.as_str()).collect();
    assert!(top.contains(&"I10") && top.contains(&"Z00"));

    // Logit score of a mean-pooled linear head integrates exactly.
    assert!(report.mean_abs_convergence_delta < 1e-9);
}

#[test]
fn embedding_report_and_labels() {
    let (tokenizer, model, examples) = fixture();
    let interp = Interpreter::new(&model, &tokenizer, examples.clone(), config()).unwrap();
    let report = interp.average_embeddings_attr().unwrap();
    assert_eq!(report.kind, ReportKind::Embeddings);
    assert_eq!(report.shape, (MAX_LEN, 4));
    assert_eq!(report.mean.len(), MAX_LEN * 4);
    assert!(report.at(MAX_LEN, 0).is_none());

    assert!(matches!(
        interp.average_tokens_attr_by_label(),
        Err(OdysseyError::MissingLabel(_))
    ));

    let labelled: Vec<_> = examples.into_iter().filter(|e| e.label.is_some()).collect();
    let interp = Interpreter::new(&model, &tokenizer, labelled, config()).unwrap();
    let report = interp.average_tokens_attr_by_label().unwrap();
    assert_eq!(report.by_label.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn renderings_are_reproducible() {
    let (tokenizer, model, examples) = fixture();
    let interp = Interpreter::new(&model, &tokenizer, examples, config()).unwrap();

    let ig = interp.visualize_integrated_gradients(2, "Mortality Prediction").unwrap();
    assert_eq!(ig.rows.len(), 2);
    assert_eq!(ig.rows[0].tokens.len(), 5);
    assert_eq!(ig.rows[0].tokens[2].token, "I10");
    assert!(ig.to_html().contains("Mortality Prediction"));
    assert!(ig.to_table().contains("patient p1"));

    let a = interp.visualize_expected_gradients(3, 6, "Mortality Prediction").unwrap();
    let b = interp.visualize_expected_gradients(3, 6, "Mortality Prediction").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.rows.len(), 3);

    let json = serde_json::to_string(&a).unwrap();
    assert!(json.contains("\"method\":\"expected gradients\""));
}

#[test]
fn probability_completeness_improves_with_steps() {
    let (_tokenizer, model, examples) = fixture();
    let seq = &examples[0].sequence;
    let x = model.embed(seq).unwrap();
    let x0 = model
        .embed(&seq.with_concept_ids(vec![0; MAX_LEN]).unwrap())
        .unwrap();
    let f =
        ClassScore::new(&model, seq.attention_mask(), 1, ScoreTarget::Probability, 1e-6).unwrap();

    let coarse = IntegratedGradients::new(10, RiemannRule::Right)
        .unwrap()
        .attribute(&f, &x, &x0)
        .unwrap();
    let fine = IntegratedGradients::new(100, RiemannRule::Right)
        .unwrap()
        .attribute(&f, &x, &x0)
        .unwrap();
    assert!(fine.convergence_delta.abs() <= coarse.convergence_delta.abs());
    assert!(fine.convergence_delta.abs() < 0.01);
}

#[test]
fn checkpoint_roundtrip_and_roc() {
    let (tokenizer, model, examples) = fixture();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classifier.json");
    model.save(&path).unwrap();
    let loaded = EmbeddingClassifier::load(&path).unwrap();
    assert_eq!(loaded.vocab_size(), tokenizer.vocab_size());

    let labelled: Vec<_> = examples.iter().filter(|e| e.label.is_some()).collect();
    let predictions = ModelPredictions {
        name: "embedding-bag".into(),
        labels: labelled.iter().map(|e| e.label.unwrap_or_default()).collect(),
        scores: labelled
            .iter()
            .map(|e| loaded.predict_proba(&e.sequence).unwrap()[1])
            .collect(),
    };
    let results = compare_models(&[predictions]).unwrap();
    assert_eq!(results[0].auc, 1.0);
}
