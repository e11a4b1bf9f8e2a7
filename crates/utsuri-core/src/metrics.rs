//! Chunk-level precision/recall/F1 and token accuracy.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tagging::{Chunk, TagVocab};

/// Evaluation scores, all in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Metrics {
    /// `{acc, precision, recall, f1}` mapping.
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("acc", self.accuracy),
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1", self.f1),
        ])
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .to_map()
            .iter()
            .map(|(k, v)| format!("{k} {:04.2}", v * 100.0))
            .collect();
        write!(f, "{}", parts.join(" - "))
    }
}

/// Accumulates gold/predicted sequences and produces [`Metrics`].
#[derive(Debug, Clone, Default)]
pub struct ChunkCounter {
    correct_preds: usize,
    total_preds: usize,
    total_correct: usize,
    correct_tokens: usize,
    total_tokens: usize,
}

impl ChunkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sentence. Extra positions in the longer sequence are ignored.
    pub fn update(&mut self, gold: &[u32], pred: &[u32], vocab: &TagVocab) {
        let n = gold.len().min(pred.len());
        let (gold, pred) = (&gold[..n], &pred[..n]);

        self.correct_tokens += gold.iter().zip(pred).filter(|(g, p)| g == p).count();
        self.total_tokens += n;

        let gold_chunks: HashSet<Chunk> = vocab.chunks(gold).into_iter().collect();
        let pred_chunks: HashSet<Chunk> = vocab.chunks(pred).into_iter().collect();
        self.correct_preds += gold_chunks.intersection(&pred_chunks).count();
        self.total_preds += pred_chunks.len();
        self.total_correct += gold_chunks.len();
    }

    pub fn finish(&self) -> Metrics {
        let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
        let precision = ratio(self.correct_preds, self.total_preds);
        let recall = ratio(self.correct_preds, self.total_correct);
        let f1 = if self.correct_preds > 0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Metrics {
            accuracy: ratio(self.correct_tokens, self.total_tokens),
            precision,
            recall,
            f1,
        }
    }
}

/// Token accuracy of one batch of predictions.
pub fn token_accuracy<'a>(pairs: impl IntoIterator<Item = (&'a [u32], &'a [u32])>) -> f32 {
    let (correct, total) = pairs.into_iter().fold((0usize, 0usize), |(c, t), (gold, pred)| {
        let hits = gold.iter().zip(pred).filter(|(g, p)| g == p).count();
        (c + hits, t + gold.len().min(pred.len()))
    });
    if total == 0 { 0.0 } else { correct as f32 / total as f32 }
}
