//! Training loop with early stopping and learning-rate decay.
//!
//! Each pass runs one epoch, scores the held-out set and decides whether to
//! persist. A score at least as good as the best so far persists (ties favor
//! the latest pass); worse scores count towards the patience budget. The
//! learning rate decays after every pass either way.

use serde::Serialize;
use tracing::info;
use utsuri_core::Result;

use crate::config::Config;

/// Controller state after the latest transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Running,
    Improved,
    Stalled,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Too many consecutive passes without improvement.
    Patience,
    /// The pass budget ran out.
    MaxPasses,
}

/// What one epoch produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassResult {
    /// Held-out score; higher is better.
    pub score: f64,
    /// Per-batch training loss.
    pub loss_history: Vec<f32>,
    /// Per-batch training metric (token accuracy).
    pub metric_history: Vec<f32>,
}

/// The work the loop delegates: running an epoch and persisting a snapshot.
pub trait PassRunner {
    fn run_pass(&mut self, pass: usize, lr: f64) -> Result<PassResult>;

    fn persist(&mut self, pass: usize, score: f64) -> Result<()>;
}

/// Pass budget, patience and learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub max_passes: usize,
    /// Consecutive non-improving passes that stop training once reached.
    pub patience: usize,
    pub lr: f64,
    pub lr_decay: f64,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_passes: config.nepochs,
            patience: config.nepoch_no_imprv,
            lr: config.lr,
            lr_decay: config.lr_decay,
        }
    }
}

/// Mutable bookkeeping of one call to [`TrainingLoop::run`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingState {
    pub state: LoopState,
    pub best_score: f64,
    pub no_improvement: usize,
    pub lr: f64,
    pub pass: usize,
}

impl TrainingState {
    fn new(lr: f64) -> Self {
        Self {
            state: LoopState::Running,
            best_score: 0.0,
            no_improvement: 0,
            lr,
            pass: 0,
        }
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSummary {
    /// Batch losses of the improving passes, concatenated.
    pub loss_history: Vec<f32>,
    /// Batch metrics of each improving pass.
    pub metric_history: Vec<Vec<f32>>,
    pub best_score: f64,
    pub passes_run: usize,
    /// Zero-based indices of the passes that persisted.
    pub improved_passes: Vec<usize>,
    pub stop_reason: StopReason,
    pub final_lr: f64,
}

pub struct TrainingLoop {
    schedule: Schedule,
    state: TrainingState,
}

impl TrainingLoop {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            state: TrainingState::new(schedule.lr),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Apply one held-out score to the state machine and return the new state.
    pub fn observe(&mut self, score: f64) -> LoopState {
        let state = &mut self.state;
        state.lr *= self.schedule.lr_decay;
        state.state = if score >= state.best_score {
            state.best_score = score;
            state.no_improvement = 0;
            LoopState::Improved
        } else {
            state.no_improvement += 1;
            if state.no_improvement >= self.schedule.patience {
                LoopState::Stopped
            } else {
                LoopState::Stalled
            }
        };
        state.state
    }

    /// Run passes until patience or the pass budget is exhausted.
    ///
    /// State is reset at the start of every call. An error from the runner
    /// aborts the run; snapshots persisted before it stay on disk.
    pub fn run<R: PassRunner>(&mut self, runner: &mut R) -> Result<TrainingSummary> {
        self.state = TrainingState::new(self.schedule.lr);
        let mut loss_history = Vec::new();
        let mut metric_history = Vec::new();
        let mut improved_passes = Vec::new();
        let mut stop_reason = StopReason::MaxPasses;
        let mut passes_run = 0;

        for pass in 0..self.schedule.max_passes {
            self.state.pass = pass;
            self.state.state = LoopState::Running;
            info!("Epoch {} out of {}", pass + 1, self.schedule.max_passes);

            let result = runner.run_pass(pass, self.state.lr)?;
            passes_run += 1;

            match self.observe(result.score) {
                LoopState::Improved => {
                    runner.persist(pass, result.score)?;
                    info!(score = result.score, "new best score");
                    loss_history.extend(result.loss_history);
                    metric_history.push(result.metric_history);
                    improved_passes.push(pass);
                }
                LoopState::Stopped => {
                    info!(
                        "early stopping {} epochs without improvement",
                        self.state.no_improvement
                    );
                    stop_reason = StopReason::Patience;
                    break;
                }
                _ => {}
            }
        }
        self.state.state = LoopState::Stopped;

        Ok(TrainingSummary {
            loss_history,
            metric_history,
            best_score: self.state.best_score,
            passes_run,
            improved_passes,
            stop_reason,
            final_lr: self.state.lr,
        })
    }
}
