//! # Computation Context
//!
//! The single owner of a model's parameter storage. Graph construction,
//! optimizer steps, restores and re-initialization all go through one
//! `Session`, which hands out exclusive access per step.

use candle_core::Device;
use tracing::info;

use crate::error::{Result, UtsuriError};
use crate::param::ParamStore;

/// Something that allocates its parameters in a [`ParamStore`] and returns
/// the resulting model graph.
pub trait GraphBuilder {
    type Graph;

    fn build(&self, params: &mut ParamStore) -> Result<Self::Graph>;
}

/// Long-lived computation context for one model instance.
pub struct Session {
    params: ParamStore,
    closed: bool,
}

impl Session {
    /// Create an empty context on `device`. `seed` drives every initializer.
    pub fn new(device: Device, seed: u64) -> Self {
        info!(?device, "initializing computation context");
        Self {
            params: ParamStore::new(device, seed),
            closed: false,
        }
    }

    pub fn device(&self) -> &Device {
        self.params.device()
    }

    /// Allocate a graph's parameters with fresh values.
    pub fn build<B: GraphBuilder>(&mut self, builder: &B) -> Result<B::Graph> {
        self.ensure_open()?;
        builder.build(&mut self.params)
    }

    /// Execute one step with exclusive access to the parameters.
    pub fn run<T>(&mut self, step: impl FnOnce(&mut ParamStore) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        step(&mut self.params)
    }

    /// Read-only view of the parameters.
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Re-draw every parameter under `scope` from its initializer.
    pub fn reinitialize_scope(&mut self, scope: &str) -> Result<usize> {
        let count = self.run(|params| params.reinitialize_scope(scope))?;
        info!(scope, count, "reinitialized weights");
        Ok(count)
    }

    /// Close the context. Subsequent steps fail with [`UtsuriError::ContextClosed`].
    pub fn close(&mut self) {
        if !self.closed {
            info!("closing computation context");
            self.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(UtsuriError::ContextClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Initializer, Partition};

    struct TwoLayers;

    impl GraphBuilder for TwoLayers {
        type Graph = usize;

        fn build(&self, params: &mut ParamStore) -> Result<usize> {
            params.declare("hidden/W", &[3, 3], Partition::Base, Initializer::GlorotUniform)?;
            params.declare("proj/W", &[3, 2], Partition::Adaptation, Initializer::GlorotUniform)?;
            Ok(params.len())
        }
    }

    #[test]
    fn test_build_allocates_parameters() {
        let mut session = Session::new(Device::Cpu, 0);
        let count = session.build(&TwoLayers).unwrap();
        assert_eq!(count, 2);
        assert!(session.params().get("proj/W").is_some());
    }

    #[test]
    fn test_run_after_close_fails() {
        let mut session = Session::new(Device::Cpu, 0);
        session.build(&TwoLayers).unwrap();
        session.close();
        assert!(session.is_closed());
        let err = session.run(|params| Ok(params.len())).unwrap_err();
        assert!(matches!(err, UtsuriError::ContextClosed));
    }

    #[test]
    fn test_same_seed_builds_identical_graphs() {
        let mut a = Session::new(Device::Cpu, 11);
        let mut b = Session::new(Device::Cpu, 11);
        a.build(&TwoLayers).unwrap();
        b.build(&TwoLayers).unwrap();
        for (pa, pb) in a.params().iter().zip(b.params().iter()) {
            assert_eq!(pa.values().unwrap(), pb.values().unwrap());
        }
    }
}
