//! Concept tokenizer: maps medical concept codes to ids and back.

use crate::error::{OdysseyError, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const MASK_TOKEN: &str = "[MASK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const VISIT_START_TOKEN: &str = "[VS]";
pub const VISIT_END_TOKEN: &str = "[VE]";
pub const REGISTER_TOKEN: &str = "[REG]";

/// Special tokens in id order; `[PAD]` is always id 0.
pub const SPECIAL_TOKENS: [&str; 7] = [
    PAD_TOKEN,
    UNK_TOKEN,
    MASK_TOKEN,
    CLS_TOKEN,
    VISIT_START_TOKEN,
    VISIT_END_TOKEN,
    REGISTER_TOKEN,
];

/// Output of [`ConceptTokenizer::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
}

/// Vocabulary-backed tokenizer over concept codes.
#[derive(Debug, Clone)]
pub struct ConceptTokenizer {
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<String>,
}

impl Default for ConceptTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConceptTokenizer {
    /// Tokenizer holding only the special tokens.
    pub fn new() -> Self {
        let id_to_token: Vec<String> = SPECIAL_TOKENS.iter().map(|t| t.to_string()).collect();
        let token_to_id = id_to_token
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            token_to_id,
            id_to_token,
        }
    }

    /// Build a vocabulary from concept codes. Codes are sorted so ids are stable.
    pub fn fit<I, S>(concepts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokenizer = Self::new();
        let unique: BTreeSet<String> = concepts
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .filter(|c| !SPECIAL_TOKENS.contains(&c.as_str()))
            .collect();
        for concept in unique {
            let id = tokenizer.id_to_token.len() as u32;
            tokenizer.token_to_id.insert(concept.clone(), id);
            tokenizer.id_to_token.push(concept);
        }
        tracing::debug!(vocab_size = tokenizer.vocab_size(), "Fitted concept tokenizer");
        tokenizer
    }

    /// Append one task token per task name, after the concepts.
    ///
    /// Task tokens replace the leading `[CLS]` in multi-task examples, so the
    /// same record encodes differently for each task.
    pub fn with_task_tokens<S: AsRef<str>>(mut self, tasks: &[S]) -> Self {
        for task in tasks {
            let token = task_token(task.as_ref());
            if self.token_to_id.contains_key(&token) {
                continue;
            }
            let id = self.id_to_token.len() as u32;
            self.token_to_id.insert(token.clone(), id);
            self.id_to_token.push(token);
        }
        self
    }

    /// Load a `{token: id}` JSON vocabulary.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let token_to_id: HashMap<String, u32> = serde_json::from_str(json)?;
        Self::from_vocab(token_to_id)
    }

    fn from_vocab(token_to_id: HashMap<String, u32>) -> Result<Self> {
        for (expected, token) in SPECIAL_TOKENS.iter().enumerate() {
            match token_to_id.get(*token) {
                Some(&id) if id as usize == expected => {}
                Some(&id) => {
                    return Err(OdysseyError::tokenizer(format!(
                        "special token {token} has id {id}, expected {expected}"
                    )));
                }
                None => {
                    return Err(OdysseyError::tokenizer(format!(
                        "vocabulary is missing special token {token}"
                    )));
                }
            }
        }

        let mut id_to_token = vec![String::new(); token_to_id.len()];
        for (token, &id) in &token_to_id {
            let slot = id_to_token.get_mut(id as usize).ok_or_else(|| {
                OdysseyError::tokenizer(format!("vocabulary ids are not contiguous (id {id})"))
            })?;
            if !slot.is_empty() {
                return Err(OdysseyError::tokenizer(format!("duplicate id {id}")));
            }
            *slot = token.clone();
        }

        Ok(Self {
            token_to_id,
            id_to_token,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.token_to_id)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn pad_token_id(&self) -> u32 {
        0
    }

    pub fn unk_token_id(&self) -> u32 {
        1
    }

    pub fn mask_token_id(&self) -> u32 {
        2
    }

    pub fn cls_token_id(&self) -> u32 {
        3
    }

    /// First id that belongs to a real concept.
    pub fn first_token_index(&self) -> u32 {
        SPECIAL_TOKENS.len() as u32
    }

    pub fn is_special(&self, id: u32) -> bool {
        (id as usize) < SPECIAL_TOKENS.len()
    }

    /// Task token for `task`, if the vocabulary holds one.
    pub fn task_to_token(&self, task: &str) -> Result<String> {
        let token = task_token(task);
        if self.token_to_id.contains_key(&token) {
            Ok(token)
        } else {
            Err(OdysseyError::tokenizer(format!("no task token {token} for task '{task}'")))
        }
    }

    /// Number of task tokens in the vocabulary.
    pub fn task_token_count(&self) -> usize {
        self.id_to_token
            .iter()
            .skip(SPECIAL_TOKENS.len())
            .filter(|t| is_task_token(t))
            .count()
    }

    pub fn token_to_id(&self, token: &str) -> u32 {
        self.token_to_id
            .get(token)
            .copied()
            .unwrap_or_else(|| self.unk_token_id())
    }

    /// Display string for an id; out-of-range ids decode to `[UNK]`.
    pub fn decode(&self, id: u32) -> &str {
        self.id_to_token
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    pub fn decode_all(&self, ids: &[u32]) -> Vec<String> {
        ids.iter().map(|&id| self.decode(id).to_string()).collect()
    }

    /// Encode tokens, truncating or right-padding with `[PAD]` to `max_len`.
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S], max_len: usize) -> Encoding {
        let mut input_ids: Vec<u32> = tokens
            .iter()
            .take(max_len)
            .map(|t| self.token_to_id(t.as_ref()))
            .collect();
        let mut attention_mask = vec![1u8; input_ids.len()];
        input_ids.resize(max_len, self.pad_token_id());
        attention_mask.resize(max_len, 0);
        Encoding {
            input_ids,
            attention_mask,
        }
    }
}

fn task_token(task: &str) -> String {
    format!("[{}]", task.to_uppercase())
}

fn is_task_token(token: &str) -> bool {
    token.len() > 2 && token.starts_with('[') && token.ends_with(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fit_assigns_ids_after_specials() {
        let tok = ConceptTokenizer::fit(["I10", "E11", "I10", "[CLS]"]);
        assert_eq!(tok.vocab_size(), SPECIAL_TOKENS.len() + 2);
        assert_eq!(tok.token_to_id("E11"), 7);
        assert_eq!(tok.token_to_id("I10"), 8);
        assert_eq!(tok.token_to_id("[CLS]"), 3);
        assert_eq!(tok.first_token_index(), 7);
    }

    #[test]
    fn test_encode_pads_and_masks() {
        let tok = ConceptTokenizer::fit(["A", "B"]);
        let enc = tok.encode(&["[CLS]", "A", "Z"], 5);
        assert_eq!(enc.input_ids, vec![3, 7, 1, 0, 0]);
        assert_eq!(enc.attention_mask, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_encode_truncates() {
        let tok = ConceptTokenizer::fit(["A", "B"]);
        let enc = tok.encode(&["A", "B", "A"], 2);
        assert_eq!(enc.input_ids, vec![7, 8]);
        assert_eq!(enc.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_decode() {
        let tok = ConceptTokenizer::fit(["A"]);
        assert_eq!(tok.decode(7), "A");
        assert_eq!(tok.decode(0), "[PAD]");
        assert_eq!(tok.decode(999), "[UNK]");
        assert_eq!(tok.decode_all(&[3, 7]), vec!["[CLS]", "A"]);
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let tok = ConceptTokenizer::fit(["A", "B", "C"]);
        tok.save(&path).unwrap();
        let loaded = ConceptTokenizer::load(&path).unwrap();
        assert_eq!(loaded.vocab_size(), tok.vocab_size());
        assert_eq!(loaded.decode(9), "C");
    }

    #[test]
    fn test_task_tokens_follow_concepts() {
        let tok = ConceptTokenizer::fit(["A", "B"]).with_task_tokens(&["mortality_1month", "c0"]);
        assert_eq!(tok.task_to_token("c0").unwrap(), "[C0]");
        assert_eq!(tok.token_to_id("[MORTALITY_1MONTH]"), 9);
        assert_eq!(tok.token_to_id("[C0]"), 10);
        assert_eq!(tok.token_to_id("A"), 7);
        assert_eq!(tok.task_token_count(), 2);
        assert!(matches!(tok.task_to_token("los_1week"), Err(OdysseyError::Tokenizer(_))));
    }

    #[test]
    fn test_task_tokens_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        ConceptTokenizer::fit(["A"])
            .with_task_tokens(&["c1"])
            .save(&path)
            .unwrap();
        let loaded = ConceptTokenizer::load(&path).unwrap();
        assert_eq!(loaded.task_to_token("c1").unwrap(), "[C1]");
        assert_eq!(loaded.task_token_count(), 1);
    }

    #[test]
    fn test_rejects_misplaced_special_token() {
        let json = r#"{"[PAD]": 1, "[UNK]": 0}"#;
        let err = ConceptTokenizer::from_json(json).unwrap_err();
        assert!(matches!(err, OdysseyError::Tokenizer(_)));
    }
}
