//! Finetuning datasets built from JSON-lines patient records.
//!
//! Each line holds one patient: the event token sequence, the parallel
//! auxiliary token sequences, a `labels` map keyed by task name and optional
//! per-task cutoffs (number of events visible to the model for that task).

use crate::error::{OdysseyError, Result};
use crate::sequence::{Channels, EncodedSequence};
use crate::tokenizer::ConceptTokenizer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// One raw patient record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    #[serde(default)]
    pub patient_id: String,
    pub event_tokens: Vec<String>,
    #[serde(default)]
    pub type_tokens: Vec<u32>,
    #[serde(default)]
    pub age_tokens: Vec<u32>,
    #[serde(default)]
    pub time_tokens: Vec<u32>,
    #[serde(default)]
    pub visit_tokens: Vec<u32>,
    #[serde(default)]
    pub position_tokens: Vec<u32>,
    #[serde(default)]
    pub labels: HashMap<String, i64>,
    #[serde(default)]
    pub cutoffs: HashMap<String, usize>,
}

impl PatientRecord {
    /// Non-empty auxiliary channels must be as long as `event_tokens`.
    pub fn validate(&self) -> Result<()> {
        let len = self.event_tokens.len();
        for (name, channel) in [
            ("type_tokens", &self.type_tokens),
            ("age_tokens", &self.age_tokens),
            ("time_tokens", &self.time_tokens),
            ("visit_tokens", &self.visit_tokens),
            ("position_tokens", &self.position_tokens),
        ] {
            if !channel.is_empty() && channel.len() != len {
                return Err(OdysseyError::shape_mismatch(
                    format!("patient '{}' {name}", self.patient_id),
                    len,
                    channel.len(),
                ));
            }
        }
        Ok(())
    }
}

/// Read a JSON-lines file of patient records. Blank lines are skipped.
pub fn load_records(path: &Path) -> Result<Vec<PatientRecord>> {
    let content = std::fs::read_to_string(path)?;
    parse_records(&content)
}

pub fn parse_records(content: &str) -> Result<Vec<PatientRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: PatientRecord = serde_json::from_str(line).map_err(|e| {
            OdysseyError::dataset(format!("line {}: {}", line_no + 1, e))
        })?;
        record.validate()?;
        records.push(record);
    }
    tracing::debug!(count = records.len(), "Loaded patient records");
    Ok(records)
}

/// Cut a record to its first `cutoff` events, then keep the most recent `max_len`.
///
/// Auxiliary channels that are absent stay absent; [`encode_record`] fills them
/// with zeros. The record must already pass [`PatientRecord::validate`].
pub fn truncate_and_pad(
    record: &PatientRecord,
    cutoff: Option<usize>,
    max_len: usize,
) -> PatientRecord {
    let visible = cutoff
        .unwrap_or(record.event_tokens.len())
        .min(record.event_tokens.len());
    let start = visible.saturating_sub(max_len);

    let window = |channel: &Vec<u32>| -> Vec<u32> {
        if channel.is_empty() {
            Vec::new()
        } else {
            channel[start..visible].to_vec()
        }
    };

    PatientRecord {
        patient_id: record.patient_id.clone(),
        event_tokens: record.event_tokens[start..visible].to_vec(),
        type_tokens: window(&record.type_tokens),
        age_tokens: window(&record.age_tokens),
        time_tokens: window(&record.time_tokens),
        visit_tokens: window(&record.visit_tokens),
        position_tokens: window(&record.position_tokens),
        labels: record.labels.clone(),
        cutoffs: record.cutoffs.clone(),
    }
}

/// Encode a record into a fixed-length sequence padded to `max_len`.
pub fn encode_record(
    tokenizer: &ConceptTokenizer,
    record: &PatientRecord,
    cutoff: Option<usize>,
    max_len: usize,
) -> Result<EncodedSequence> {
    record.validate()?;
    let window = truncate_and_pad(record, cutoff, max_len);
    let encoding = tokenizer.encode(&window.event_tokens, max_len);

    let pad = |channel: Vec<u32>| -> Vec<u32> {
        let mut channel = if channel.is_empty() {
            vec![0; window.event_tokens.len()]
        } else {
            channel
        };
        channel.resize(max_len, 0);
        channel
    };

    let channels = Channels {
        type_ids: pad(window.type_tokens.clone()),
        ages: pad(window.age_tokens.clone()),
        time_stamps: pad(window.time_tokens.clone()),
        visit_orders: pad(window.position_tokens.clone()),
        visit_segments: pad(window.visit_tokens.clone()),
    };

    EncodedSequence::new(encoding.input_ids, encoding.attention_mask, channels)
}

/// A model-ready example with its (optional) label.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub patient_id: String,
    pub task: String,
    pub sequence: EncodedSequence,
    pub label: Option<i64>,
}

/// Single-task finetuning dataset.
pub struct FinetuneDataset<'a> {
    records: Vec<PatientRecord>,
    tokenizer: &'a ConceptTokenizer,
    task: String,
    max_len: usize,
    nan_indicator: i64,
}

impl<'a> FinetuneDataset<'a> {
    pub fn new(
        records: Vec<PatientRecord>,
        tokenizer: &'a ConceptTokenizer,
        task: impl Into<String>,
        max_len: usize,
        nan_indicator: i64,
    ) -> Self {
        Self {
            records,
            tokenizer,
            task: task.into(),
            max_len,
            nan_indicator,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Example at `idx`. A missing label or one equal to the nan indicator is `None`.
    pub fn get(&self, idx: usize) -> Result<Example> {
        let record = self.records.get(idx).ok_or_else(|| {
            OdysseyError::not_found(format!("example {idx} (dataset has {})", self.len()))
        })?;
        let cutoff = record.cutoffs.get(&self.task).copied();
        let sequence = encode_record(self.tokenizer, record, cutoff, self.max_len)?;
        let label = record
            .labels
            .get(&self.task)
            .copied()
            .filter(|&l| l != self.nan_indicator);

        Ok(Example {
            patient_id: record.patient_id.clone(),
            task: self.task.clone(),
            sequence,
            label,
        })
    }

    /// The first `limit` examples.
    pub fn examples(&self, limit: usize) -> Result<Vec<Example>> {
        (0..self.len().min(limit)).map(|i| self.get(i)).collect()
    }
}

/// One (record, task) pair with a present label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    pub index: usize,
    pub task: String,
    pub label: i64,
    pub cutoff: Option<usize>,
}

/// Index over (record, task) pairs for multi-task finetuning.
#[derive(Debug, Clone, Default)]
pub struct MultiTaskIndex {
    task_to_index: BTreeMap<String, Vec<DataPoint>>,
}

impl MultiTaskIndex {
    /// Build the index, skipping labels equal to `nan_indicator` or absent.
    pub fn build(records: &[PatientRecord], tasks: &[String], nan_indicator: i64) -> Self {
        let mut task_to_index: BTreeMap<String, Vec<DataPoint>> =
            tasks.iter().map(|t| (t.clone(), Vec::new())).collect();

        for (index, record) in records.iter().enumerate() {
            for task in tasks {
                let Some(&label) = record.labels.get(task) else {
                    continue;
                };
                if label == nan_indicator {
                    continue;
                }
                if let Some(points) = task_to_index.get_mut(task) {
                    points.push(DataPoint {
                        index,
                        task: task.clone(),
                        label,
                        cutoff: record.cutoffs.get(task).copied(),
                    });
                }
            }
        }

        Self { task_to_index }
    }

    /// Keep all positives and sample negatives so positives make up `ratio` of each task.
    pub fn balance_labels(&mut self, guide: &BTreeMap<String, f64>, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for (task, &ratio) in guide {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(OdysseyError::invalid_input(format!(
                    "positive ratio for '{task}' must be in (0, 1], got {ratio}"
                )));
            }
            let points = self
                .task_to_index
                .get_mut(task)
                .ok_or_else(|| OdysseyError::not_found(format!("task '{task}'")))?;

            let (positives, negatives): (Vec<_>, Vec<_>) =
                points.drain(..).partition(|p| p.label == 1);
            let negatives: Vec<_> = negatives.into_iter().filter(|p| p.label == 0).collect();

            let total_needed = (positives.len() as f64 / ratio) as usize;
            let keep = total_needed.saturating_sub(positives.len()).min(negatives.len());
            let kept: Vec<DataPoint> = negatives.choose_multiple(&mut rng, keep).cloned().collect();

            tracing::debug!(
                task = %task,
                positives = positives.len(),
                negatives_kept = kept.len(),
                "Balanced task labels"
            );
            points.extend(positives);
            points.extend(kept);
        }
        Ok(())
    }

    pub fn task(&self, task: &str) -> &[DataPoint] {
        self.task_to_index
            .get(task)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All data points, grouped by task in task-name order.
    pub fn datapoints(&self) -> impl Iterator<Item = &DataPoint> {
        self.task_to_index.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.task_to_index.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Multi-task finetuning dataset: one example per indexed (record, task) pair.
pub struct FinetuneMultiDataset<'a> {
    records: Vec<PatientRecord>,
    tokenizer: &'a ConceptTokenizer,
    index: Vec<DataPoint>,
    max_len: usize,
}

impl<'a> FinetuneMultiDataset<'a> {
    pub fn new(
        records: Vec<PatientRecord>,
        tokenizer: &'a ConceptTokenizer,
        index: &MultiTaskIndex,
        max_len: usize,
    ) -> Self {
        Self {
            records,
            tokenizer,
            index: index.datapoints().cloned().collect(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Example at `idx`, with the first event swapped for the task token.
    pub fn get(&self, idx: usize) -> Result<Example> {
        let point = self
            .index
            .get(idx)
            .ok_or_else(|| OdysseyError::not_found(format!("example {idx}")))?;
        let record = self.records.get(point.index).ok_or_else(|| {
            OdysseyError::dataset(format!("index points at missing record {}", point.index))
        })?;

        let mut tagged = record.clone();
        if let Some(first) = tagged.event_tokens.first_mut() {
            *first = self.tokenizer.task_to_token(&point.task)?;
        }
        let sequence = encode_record(self.tokenizer, &tagged, point.cutoff, self.max_len)?;
        Ok(Example {
            patient_id: record.patient_id.clone(),
            task: point.task.clone(),
            sequence,
            label: Some(point.label),
        })
    }
}
