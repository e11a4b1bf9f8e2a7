//! # Partitioned Optimizer Group
//!
//! Trainable parameters are split into the base and adaptation partitions
//! declared on each parameter. Each partition gets its own optimizer: the base
//! one runs at `lr`, the adaptation one at `lr * psi`. When clipping is
//! enabled each partition is clipped to the threshold on its own global norm,
//! so large adaptation gradients never shrink the base update or vice versa.
//!
//! A step is atomic: one backward pass, every new value and optimizer slot
//! computed for both partitions, and only then written back.

use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utsuri_core::{Param, ParamStore, Partition, Result, UtsuriError};

/// Update rule shared by both partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adagrad,
    RmsProp,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = UtsuriError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(UtsuriError::Configuration(format!(
                "unknown optimizer {other:?} (expected sgd, adagrad, rmsprop or adam)"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adagrad => "adagrad",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Adam => "adam",
        };
        f.write_str(name)
    }
}

const ADAGRAD_INITIAL_ACCUMULATOR: f64 = 0.1;
const RMSPROP_DECAY: f64 = 0.9;
const RMSPROP_EPSILON: f64 = 1e-10;
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

/// Square root of the summed squared entries of every tensor.
pub fn global_norm(tensors: &[Tensor]) -> Result<f64> {
    let mut total = 0.0f64;
    for t in tensors {
        total += t.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(total.sqrt())
}

/// Rescale `grads` so their global norm is at most `clip_norm`.
///
/// Returns the clipped gradients and the global norm before clipping.
pub fn clip_by_global_norm(grads: Vec<Tensor>, clip_norm: f64) -> Result<(Vec<Tensor>, f64)> {
    let norm = global_norm(&grads)?;
    if norm <= clip_norm || norm == 0.0 {
        return Ok((grads, norm));
    }
    let scale = clip_norm / norm;
    let clipped = grads
        .iter()
        .map(|g| g.affine(scale, 0.0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok((clipped, norm))
}

/// Per-parameter optimizer state.
#[derive(Debug, Clone)]
enum Slots {
    None,
    Accumulator(Tensor),
    Moments { m: Tensor, v: Tensor },
}

impl Slots {
    fn init(kind: OptimizerKind, var: &Var) -> Result<Self> {
        let shape = var.dims();
        let device = var.device();
        Ok(match kind {
            OptimizerKind::Sgd => Slots::None,
            OptimizerKind::Adagrad => {
                Slots::Accumulator(Tensor::full(ADAGRAD_INITIAL_ACCUMULATOR as f32, shape, device)?)
            }
            OptimizerKind::RmsProp => Slots::Accumulator(Tensor::ones(shape, DType::F32, device)?),
            OptimizerKind::Adam => Slots::Moments {
                m: Tensor::zeros(shape, DType::F32, device)?,
                v: Tensor::zeros(shape, DType::F32, device)?,
            },
        })
    }
}

/// Observed quantities of one partition for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PartitionStats {
    /// Parameters that received a gradient this step.
    pub params: usize,
    pub learning_rate: f64,
    /// Global norm of the raw gradients.
    pub grad_norm: f64,
    /// Global norm of the gradients actually applied.
    pub applied_norm: f64,
}

/// Outcome of one [`PartitionedOptimizer::step`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepReport {
    pub loss: f32,
    pub base: PartitionStats,
    pub adaptation: PartitionStats,
}

struct Staged {
    index: usize,
    value: Tensor,
    slots: Slots,
}

struct PartitionOptimizer {
    kind: OptimizerKind,
    lr_scale: f64,
    names: Vec<String>,
    vars: Vec<Var>,
    slots: Vec<Slots>,
    steps: i32,
}

impl PartitionOptimizer {
    fn new(kind: OptimizerKind, lr_scale: f64, params: &[&Param]) -> Result<Self> {
        let vars: Vec<Var> = params.iter().map(|p| p.var().clone()).collect();
        let slots = vars
            .iter()
            .map(|v| Slots::init(kind, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            lr_scale,
            names: params.iter().map(|p| p.name().to_string()).collect(),
            vars,
            slots,
            steps: 0,
        })
    }

    /// Compute the next values of every parameter with a gradient, without
    /// touching the live storage.
    fn stage(&self, grads: &GradStore, lr: f64, clip_norm: f64) -> Result<(Vec<Staged>, PartitionStats)> {
        let lr = lr * self.lr_scale;
        let mut stats = PartitionStats {
            learning_rate: lr,
            ..PartitionStats::default()
        };

        let (indices, raw): (Vec<usize>, Vec<Tensor>) = self
            .vars
            .iter()
            .enumerate()
            .filter_map(|(i, var)| grads.get(var.as_tensor()).map(|g| (i, g.detach())))
            .unzip();
        if indices.is_empty() {
            return Ok((Vec::new(), stats));
        }

        let (applied, grad_norm) = if clip_norm > 0.0 {
            clip_by_global_norm(raw, clip_norm)?
        } else {
            let norm = global_norm(&raw)?;
            (raw, norm)
        };
        stats.params = indices.len();
        stats.grad_norm = grad_norm;
        stats.applied_norm = if clip_norm > 0.0 {
            global_norm(&applied)?
        } else {
            grad_norm
        };

        let t = self.steps + 1;
        let mut staged = Vec::with_capacity(indices.len());
        for (index, grad) in indices.into_iter().zip(applied) {
            let (value, slots) = self.update(index, &grad, lr, t)?;
            staged.push(Staged { index, value, slots });
        }
        Ok((staged, stats))
    }

    fn update(&self, index: usize, grad: &Tensor, lr: f64, t: i32) -> Result<(Tensor, Slots)> {
        let param = self.vars[index].as_tensor().detach();
        let (delta, slots) = match (&self.slots[index], self.kind) {
            (Slots::None, OptimizerKind::Sgd) => (grad.affine(lr, 0.0)?, Slots::None),
            (Slots::Accumulator(acc), OptimizerKind::Adagrad) => {
                let acc = (acc + grad.sqr()?)?;
                let delta = (grad / acc.sqrt()?)?.affine(lr, 0.0)?;
                (delta, Slots::Accumulator(acc))
            }
            (Slots::Accumulator(ms), OptimizerKind::RmsProp) => {
                let ms = (ms.affine(RMSPROP_DECAY, 0.0)? + grad.sqr()?.affine(1.0 - RMSPROP_DECAY, 0.0)?)?;
                let delta = (grad / (&ms + RMSPROP_EPSILON)?.sqrt()?)?.affine(lr, 0.0)?;
                (delta, Slots::Accumulator(ms))
            }
            (Slots::Moments { m, v }, OptimizerKind::Adam) => {
                let m = (m.affine(ADAM_BETA1, 0.0)? + grad.affine(1.0 - ADAM_BETA1, 0.0)?)?;
                let v = (v.affine(ADAM_BETA2, 0.0)? + grad.sqr()?.affine(1.0 - ADAM_BETA2, 0.0)?)?;
                let lr_t = lr * (1.0 - ADAM_BETA2.powi(t)).sqrt() / (1.0 - ADAM_BETA1.powi(t));
                let delta = (&m / (v.sqrt()? + ADAM_EPSILON)?)?.affine(lr_t, 0.0)?;
                (delta, Slots::Moments { m, v })
            }
            _ => {
                return Err(UtsuriError::Configuration(format!(
                    "optimizer state of {} does not match {}",
                    self.names[index], self.kind
                )));
            }
        };
        Ok(((param - delta)?, slots))
    }

    /// Reject staged values that could not be written back.
    fn check(&self, staged: &[Staged]) -> Result<()> {
        for Staged { index, value, .. } in staged {
            let var = &self.vars[*index];
            if value.shape() != var.shape() {
                return Err(candle_core::Error::ShapeMismatchBinaryOp {
                    lhs: var.shape().clone(),
                    rhs: value.shape().clone(),
                    op: "commit",
                }
                .into());
            }
        }
        Ok(())
    }

    fn commit(&mut self, staged: Vec<Staged>) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }
        for Staged { index, value, slots } in staged {
            self.vars[index].set(&value)?;
            self.slots[index] = slots;
        }
        self.steps += 1;
        Ok(())
    }
}

/// Two optimizers, one per partition, applied as a single step.
pub struct PartitionedOptimizer {
    kind: OptimizerKind,
    clip_norm: f64,
    base: PartitionOptimizer,
    adaptation: PartitionOptimizer,
}

impl PartitionedOptimizer {
    /// Build the group over the current trainable set of `params`.
    ///
    /// `kind` is parsed before any optimizer state is allocated, so an
    /// unknown name fails without side effects.
    pub fn build(kind: &str, params: &ParamStore, psi: f64, clip_norm: f64) -> Result<Self> {
        let kind: OptimizerKind = kind.parse()?;
        let (base, adaptation) = params.partitioned();
        if psi <= 0.0 {
            warn!(psi, "adaptation learning rate is not positive");
        }
        info!(
            optimizer = %kind,
            base = base.len(),
            adaptation = adaptation.len(),
            psi,
            clip_norm,
            "built partitioned optimizer"
        );
        for p in &adaptation {
            debug!(name = p.name(), "adaptation parameter");
        }
        Ok(Self {
            kind,
            clip_norm,
            base: PartitionOptimizer::new(kind, 1.0, &base)?,
            adaptation: PartitionOptimizer::new(kind, psi, &adaptation)?,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Names of the parameters in `partition`.
    pub fn members(&self, partition: Partition) -> &[String] {
        match partition {
            Partition::Base => &self.base.names,
            Partition::Adaptation => &self.adaptation.names,
        }
    }

    /// Write both partitions back. Both are checked before either is
    /// written, so a failure leaves every parameter and slot untouched.
    fn commit(&mut self, base: Vec<Staged>, adaptation: Vec<Staged>) -> Result<()> {
        self.base.check(&base)?;
        self.adaptation.check(&adaptation)?;
        self.base.commit(base)?;
        self.adaptation.commit(adaptation)
    }

    /// Backpropagate `loss` once and update both partitions at learning rate `lr`.
    pub fn step(&mut self, loss: &Tensor, lr: f64) -> Result<StepReport> {
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let grads = loss.backward()?;

        let (base_staged, base) = self.base.stage(&grads, lr, self.clip_norm)?;
        let (adapt_staged, adaptation) = self.adaptation.stage(&grads, lr, self.clip_norm)?;
        self.commit(base_staged, adapt_staged)?;

        debug!(
            loss = loss_value,
            base_norm = base.applied_norm,
            adaptation_norm = adaptation.applied_norm,
            "optimizer step"
        );
        Ok(StepReport {
            loss: loss_value,
            base,
            adaptation,
        })
    }
}

impl fmt::Debug for PartitionedOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedOptimizer")
            .field("kind", &self.kind)
            .field("clip_norm", &self.clip_norm)
            .field("base", &self.base.names.len())
            .field("adaptation", &self.adaptation.names.len())
            .finish()
    }
}
