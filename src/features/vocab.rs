//! Append-only label vocabulary with a fixed-capacity embedding table.
//!
//! Each [`LabelKind`] has its own index space. The first distinct value seen
//! gets index 0, the next gets 1, and so on; indices are never reused or
//! removed. Embedding rows are drawn once from a seeded RNG at construction,
//! so a value's vector is stable for the life of the vocabulary.
//!
//! `embed` takes `&mut self`: the existence check and the insertion can't be
//! interleaved with another caller, which is what keeps index assignment
//! gap-free.

use std::collections::HashMap;
use std::fmt;

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VocabularyError {
    /// Capacity is a configuration choice; running out is not recoverable.
    #[error("{kind} vocabulary is full ({capacity} labels); cannot add {value:?}")]
    CapacityExceeded {
        kind: LabelKind,
        capacity: usize,
        value: String,
    },
}

/// Which index space a label belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    Pod,
    Namespace,
    SourcePort,
    DestinationPort,
}

impl LabelKind {
    pub const ALL: [LabelKind; 4] = [
        LabelKind::Pod,
        LabelKind::Namespace,
        LabelKind::SourcePort,
        LabelKind::DestinationPort,
    ];

    fn slot(self) -> usize {
        match self {
            LabelKind::Pod => 0,
            LabelKind::Namespace => 1,
            LabelKind::SourcePort => 2,
            LabelKind::DestinationPort => 3,
        }
    }
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelKind::Pod => write!(f, "pod"),
            LabelKind::Namespace => write!(f, "namespace"),
            LabelKind::SourcePort => write!(f, "source_port"),
            LabelKind::DestinationPort => write!(f, "destination_port"),
        }
    }
}

#[derive(Debug, Clone)]
struct LabelTable {
    indices: HashMap<String, usize>,
    embeddings: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct LabelVocabulary {
    embedding_dim: usize,
    capacity: usize,
    tables: Vec<LabelTable>,
}

impl LabelVocabulary {
    /// Pre-allocate `capacity` rows of width `embedding_dim` for every kind.
    pub fn new(embedding_dim: usize, capacity: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let tables = LabelKind::ALL
            .iter()
            .map(|_| LabelTable {
                indices: HashMap::new(),
                embeddings: Array2::from_shape_fn((capacity, embedding_dim), |_| {
                    rng.gen_range(-1.0f32..1.0)
                }),
            })
            .collect();

        Self {
            embedding_dim,
            capacity,
            tables,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index for `value`, assigning the next free one on first sight.
    pub fn intern(&mut self, kind: LabelKind, value: &str) -> Result<usize, VocabularyError> {
        let capacity = self.capacity;
        let table = &mut self.tables[kind.slot()];
        if let Some(&index) = table.indices.get(value) {
            return Ok(index);
        }

        let next = table.indices.len();
        if next >= capacity {
            return Err(VocabularyError::CapacityExceeded {
                kind,
                capacity,
                value: value.to_string(),
            });
        }
        table.indices.insert(value.to_string(), next);
        Ok(next)
    }

    /// Embedding row for `value`, growing the vocabulary if needed.
    pub fn embed(
        &mut self,
        kind: LabelKind,
        value: &str,
    ) -> Result<ArrayView1<'_, f32>, VocabularyError> {
        let index = self.intern(kind, value)?;
        Ok(self.tables[kind.slot()].embeddings.row(index))
    }

    /// Index for `value` without inserting it.
    pub fn index_of(&self, kind: LabelKind, value: &str) -> Option<usize> {
        self.tables[kind.slot()].indices.get(value).copied()
    }

    pub fn len(&self, kind: LabelKind) -> usize {
        self.tables[kind.slot()].indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.indices.is_empty())
    }

    /// Number of distinct labels per kind, for stats reporting.
    pub fn sizes(&self) -> Vec<(LabelKind, usize)> {
        LabelKind::ALL.iter().map(|&k| (k, self.len(k))).collect()
    }
}
