//! Encoded patient sequences: concept ids plus parallel auxiliary channels.

use crate::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};

/// Auxiliary channels that run parallel to the concept ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    pub type_ids: Vec<u32>,
    pub ages: Vec<u32>,
    pub time_stamps: Vec<u32>,
    pub visit_orders: Vec<u32>,
    pub visit_segments: Vec<u32>,
}

/// A tokenized sequence ready for the model.
///
/// Every channel has the same length as `concept_ids`. The value is
/// immutable after construction; derived sequences (baselines) are built
/// through [`EncodedSequence::with_concept_ids`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSequence {
    concept_ids: Vec<u32>,
    attention_mask: Vec<u8>,
    channels: Channels,
}

impl EncodedSequence {
    pub fn new(concept_ids: Vec<u32>, attention_mask: Vec<u8>, channels: Channels) -> Result<Self> {
        let len = concept_ids.len();
        let check = |name: &str, actual: usize| -> Result<()> {
            if actual != len {
                return Err(OdysseyError::shape_mismatch(
                    format!("sequence channel '{name}'"),
                    len,
                    actual,
                ));
            }
            Ok(())
        };
        check("attention_mask", attention_mask.len())?;
        check("type_ids", channels.type_ids.len())?;
        check("ages", channels.ages.len())?;
        check("time_stamps", channels.time_stamps.len())?;
        check("visit_orders", channels.visit_orders.len())?;
        check("visit_segments", channels.visit_segments.len())?;

        Ok(Self {
            concept_ids,
            attention_mask,
            channels,
        })
    }

    /// Sequence with only concept ids; every position attended, channels zeroed.
    pub fn from_concept_ids(concept_ids: Vec<u32>) -> Self {
        let len = concept_ids.len();
        Self {
            concept_ids,
            attention_mask: vec![1; len],
            channels: Channels {
                type_ids: vec![0; len],
                ages: vec![0; len],
                time_stamps: vec![0; len],
                visit_orders: vec![0; len],
                visit_segments: vec![0; len],
            },
        }
    }

    /// Copy of this sequence with different concept ids and the same channels.
    pub fn with_concept_ids(&self, concept_ids: Vec<u32>) -> Result<Self> {
        Self::new(concept_ids, self.attention_mask.clone(), self.channels.clone())
    }

    pub fn len(&self) -> usize {
        self.concept_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concept_ids.is_empty()
    }

    pub fn concept_ids(&self) -> &[u32] {
        &self.concept_ids
    }

    pub fn attention_mask(&self) -> &[u8] {
        &self.attention_mask
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Number of attended (non-padding) positions.
    pub fn num_valid(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }
}
