//! # Partial Weight Transfer
//!
//! Restores the subset of a freshly built graph that also exists, with the
//! same name and shape, in a source checkpoint. Everything else keeps its
//! fresh values. A label projection sized for a different tag set is the
//! typical casualty, and that is the point: it is skipped, never an error.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::checkpoint::{CheckpointIndex, list_checkpoint_variables, load_checkpoint, resolve_checkpoint};
use crate::error::{Result, UtsuriError};
use crate::param::ParamStore;

/// What happened to one target parameter during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Same name and shape in the source; values will be copied.
    Restored,
    /// No source parameter with this name.
    SkippedNoMatch,
    /// The source has this name with a different shape.
    SkippedShapeMismatch {
        source: Vec<usize>,
        target: Vec<usize>,
    },
}

/// Per-parameter outcomes of one resolution, keyed by target name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    outcomes: BTreeMap<String, TransferOutcome>,
}

impl TransferReport {
    pub fn outcome(&self, name: &str) -> Option<&TransferOutcome> {
        self.outcomes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TransferOutcome)> {
        self.outcomes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn restored(&self) -> Vec<&str> {
        self.matching(|o| matches!(o, TransferOutcome::Restored))
    }

    pub fn skipped_no_match(&self) -> Vec<&str> {
        self.matching(|o| matches!(o, TransferOutcome::SkippedNoMatch))
    }

    pub fn skipped_shape_mismatch(&self) -> Vec<&str> {
        self.matching(|o| matches!(o, TransferOutcome::SkippedShapeMismatch { .. }))
    }

    /// Every target parameter was restored.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, TransferOutcome::Restored))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn matching(&self, pred: impl Fn(&TransferOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Result of matching a target parameter set against a source index.
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    /// Target name -> source name, only for restorable parameters.
    mapping: BTreeMap<String, String>,
    report: TransferReport,
}

/// Match target parameters against a source checkpoint index by name and shape.
pub fn resolve<'a>(
    source: &CheckpointIndex,
    target: impl IntoIterator<Item = (&'a str, &'a [usize])>,
) -> TransferPlan {
    let mut plan = TransferPlan::default();
    for (name, shape) in target {
        let outcome = match source.get(name) {
            None => TransferOutcome::SkippedNoMatch,
            Some(info) if info.shape.as_slice() != shape => TransferOutcome::SkippedShapeMismatch {
                source: info.shape.clone(),
                target: shape.to_vec(),
            },
            Some(_) => {
                plan.mapping.insert(name.to_string(), name.to_string());
                TransferOutcome::Restored
            }
        };
        debug!(name, ?outcome, "resolved transfer");
        plan.report.outcomes.insert(name.to_string(), outcome);
    }
    plan
}

impl TransferPlan {
    pub fn mapping(&self) -> &BTreeMap<String, String> {
        &self.mapping
    }

    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    pub fn into_report(self) -> TransferReport {
        self.report
    }

    /// Copy the resolved subset from `checkpoint` into `params`.
    ///
    /// Parameters outside the mapping are left untouched. Returns the number
    /// of parameters written.
    pub fn restore(&self, params: &ParamStore, checkpoint: impl AsRef<Path>) -> Result<usize> {
        let path = resolve_checkpoint(checkpoint)?;
        let tensors = load_checkpoint(&path, params.device())?;
        for (target, source) in &self.mapping {
            let values = tensors.get(source).ok_or_else(|| UtsuriError::CorruptCheckpoint {
                path: path.clone(),
                reason: format!("indexed tensor {source:?} has no payload"),
            })?;
            params.assign(target, values)?;
        }
        Ok(self.mapping.len())
    }
}

/// Index `checkpoint`, resolve against `params`, and restore the overlap.
pub fn transfer_from_checkpoint(
    params: &ParamStore,
    checkpoint: impl AsRef<Path>,
) -> Result<TransferReport> {
    let checkpoint = checkpoint.as_ref();
    let index = list_checkpoint_variables(checkpoint)?;
    let plan = resolve(&index, params.shapes());
    let restored = plan.restore(params, checkpoint)?;
    let report = plan.into_report();
    info!(
        checkpoint = %checkpoint.display(),
        restored,
        no_match = report.skipped_no_match().len(),
        shape_mismatch = report.skipped_shape_mismatch().len(),
        "transferred weights from source checkpoint"
    );
    Ok(report)
}

/// Restore every parameter from `checkpoint`, failing if any is missing.
pub fn restore_all(params: &ParamStore, checkpoint: impl AsRef<Path>) -> Result<()> {
    let path = resolve_checkpoint(checkpoint)?;
    let index = list_checkpoint_variables(&path)?;
    let plan = resolve(&index, params.shapes());
    if !plan.report().is_complete() {
        let missing: Vec<&str> = plan
            .report()
            .iter()
            .filter(|(_, o)| !matches!(o, TransferOutcome::Restored))
            .map(|(name, _)| name)
            .collect();
        return Err(UtsuriError::CorruptCheckpoint {
            path,
            reason: format!("cannot restore parameters {missing:?}"),
        });
    }
    plan.restore(params, &path)?;
    info!(checkpoint = %path.display(), "reloaded trained model");
    Ok(())
}
