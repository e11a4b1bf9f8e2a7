//! # Utsuri Trainer
//!
//! Domain-adaptive training on top of `utsuri-core`: run configuration, the
//! partitioned optimizer group, the early-stopping training loop and the
//! model lifecycle that ties them to checkpoints on disk.

pub mod config;
pub mod lifecycle;
pub mod optim;
pub mod trainer;

pub use config::Config;
pub use lifecycle::{AdaptationRun, ModelLifecycle, PREDICTIONS_FILE, run_adaptation};
pub use optim::{
    OptimizerKind, PartitionStats, PartitionedOptimizer, StepReport, clip_by_global_norm,
    global_norm,
};
pub use trainer::{
    LoopState, PassResult, PassRunner, Schedule, StopReason, TrainingLoop, TrainingState,
    TrainingSummary,
};
