//! # Utsuri
//!
//! Cross-domain named-entity recognition: train a BiLSTM-CRF tagger on a
//! source domain, transfer the weights that still fit into a model for a new
//! label set, and fine-tune with separate learning rates for shared and
//! domain-specific parameters.
//!
//! This crate re-exports [`utsuri_core`] and [`utsuri_trainer`].
//!
//! ```rust,no_run
//! use std::path::Path;
//! use utsuri::{Config, run_adaptation};
//!
//! let config = Config::load("configs/source.json").unwrap().for_target_domain("twitter");
//! let run = run_adaptation(config, Some(Path::new("results/source/model.weights")), Some("proj")).unwrap();
//! println!("f1 {:.2}", run.metrics.f1 * 100.0);
//! ```

pub use utsuri_core::*;
pub use utsuri_trainer::*;
