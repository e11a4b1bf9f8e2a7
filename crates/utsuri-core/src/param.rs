//! # Parameters
//!
//! Named, shaped, mutable tensors owned by one computation context. Every
//! parameter carries the optimizer partition it belongs to, declared when the
//! parameter is created rather than inferred later from its name.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use oorandom::Rand32;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, UtsuriError};

/// Optimizer partition of a trainable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Shared representation parameters.
    Base,
    /// Domain-specific parameters (adaptation layers, transitions, projection).
    Adaptation,
}

impl Partition {
    /// Name fragments that mark a parameter as domain-specific.
    pub const ADAPTATION_MARKERS: &'static [&'static str] = &["adapt", "transition", "proj/"];

    /// Classify a parameter by name.
    ///
    /// Used for parameters whose partition was not declared, e.g. names read
    /// back from a foreign checkpoint. Parameters created through
    /// [`ParamStore::declare`] carry an explicit partition instead.
    pub fn from_name(name: &str) -> Self {
        if Self::ADAPTATION_MARKERS.iter().any(|m| name.contains(m)) {
            Partition::Adaptation
        } else {
            Partition::Base
        }
    }
}

/// How a parameter gets its initial (and re-initialized) values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    /// Square identity matrix. Falls back to zeros for non-square shapes.
    Identity,
    /// Glorot/Xavier uniform: `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// `U(-limit, limit)`.
    Uniform(f32),
}

impl Initializer {
    /// Draw fresh values for a parameter of the given shape.
    pub fn sample(&self, dims: &[usize], device: &Device, rng: &mut Rand32) -> Result<Tensor> {
        let numel: usize = dims.iter().product();
        let values = match *self {
            Initializer::Zeros => vec![0.0f32; numel],
            Initializer::Identity => match dims {
                [rows, cols] if rows == cols => {
                    let mut values = vec![0.0f32; numel];
                    for i in 0..*rows {
                        values[i * cols + i] = 1.0;
                    }
                    values
                }
                _ => vec![0.0f32; numel],
            },
            Initializer::GlorotUniform => {
                let (fan_in, fan_out) = match dims {
                    [] => (1, 1),
                    [n] => (*n, *n),
                    [.., rows, cols] => (*rows, *cols),
                };
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                uniform(numel, limit, rng)
            }
            Initializer::Uniform(limit) => uniform(numel, limit, rng),
        };
        Ok(Tensor::from_vec(values, dims, device)?)
    }
}

fn uniform(numel: usize, limit: f32, rng: &mut Rand32) -> Vec<f32> {
    (0..numel)
        .map(|_| (rng.rand_float() * 2.0 - 1.0) * limit)
        .collect()
}

/// A single named parameter.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    partition: Partition,
    initializer: Initializer,
    trainable: bool,
    var: Var,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn initializer(&self) -> Initializer {
        self.initializer
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Shared handle to the underlying storage.
    ///
    /// Clones of a `Var` alias the same buffer, so writes through
    /// [`Var::set`] are visible to every model layer holding a clone.
    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Whether this parameter lives in `scope` (the scope itself or anything below it).
    pub fn in_scope(&self, scope: &str) -> bool {
        let scope = scope.trim_end_matches('/');
        self.name == scope
            || self
                .name
                .strip_prefix(scope)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Flattened copy of the current values.
    pub fn values(&self) -> Result<Vec<f32>> {
        Ok(self
            .var
            .as_tensor()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }
}

/// Registry of all parameters of one model graph.
///
/// Names are unique; iteration follows declaration order.
pub struct ParamStore {
    device: Device,
    params: Vec<Param>,
    index: HashMap<String, usize>,
    rng: Rand32,
}

impl ParamStore {
    pub fn new(device: Device, seed: u64) -> Self {
        Self {
            device,
            params: Vec::new(),
            index: HashMap::new(),
            rng: Rand32::new(seed),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Create and register a trainable parameter with fresh values.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        dims: &[usize],
        partition: Partition,
        initializer: Initializer,
    ) -> Result<Var> {
        self.declare_with(name, dims, partition, initializer, true)
    }

    /// Create and register a parameter, optionally excluded from optimization.
    pub fn declare_with(
        &mut self,
        name: impl Into<String>,
        dims: &[usize],
        partition: Partition,
        initializer: Initializer,
        trainable: bool,
    ) -> Result<Var> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(UtsuriError::DuplicateParameter(name));
        }
        let values = initializer.sample(dims, &self.device, &mut self.rng)?;
        let var = Var::from_tensor(&values)?;
        debug!(%name, ?dims, ?partition, trainable, "declared parameter");
        self.index.insert(name.clone(), self.params.len());
        self.params.push(Param {
            name,
            partition,
            initializer,
            trainable,
            var: var.clone(),
        });
        Ok(var)
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `(name, shape)` pairs of every parameter.
    pub fn shapes(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.params.iter().map(|p| (p.name(), p.dims()))
    }

    pub fn trainable(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.trainable)
    }

    /// Split the trainable set into `(base, adaptation)`.
    pub fn partitioned(&self) -> (Vec<&Param>, Vec<&Param>) {
        self.trainable()
            .partition(|p| p.partition == Partition::Base)
    }

    /// Overwrite a parameter's values. The shape must match.
    pub fn assign(&self, name: &str, values: &Tensor) -> Result<()> {
        let param = self
            .get(name)
            .ok_or_else(|| UtsuriError::UnknownParameter(name.to_string()))?;
        let values = values
            .to_dtype(param.var.dtype())?
            .to_device(&self.device)?;
        param.var.set(&values)?;
        Ok(())
    }

    /// Draw fresh values for every parameter in `scope`. Returns how many were reset.
    pub fn reinitialize_scope(&mut self, scope: &str) -> Result<usize> {
        let mut count = 0;
        for param in self.params.iter().filter(|p| p.in_scope(scope)) {
            let values = param
                .initializer
                .sample(param.var.dims(), &self.device, &mut self.rng)?;
            param.var.set(&values)?;
            count += 1;
        }
        debug!(scope, count, "reinitialized scope");
        Ok(count)
    }

    /// Deep copy of every parameter, keyed by name.
    ///
    /// Copies are detached from the live storage, so later updates do not
    /// leak into a snapshot taken earlier.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        self.params
            .iter()
            .map(|p| Ok((p.name.clone(), p.var.as_tensor().copy()?)))
            .collect()
    }
}
