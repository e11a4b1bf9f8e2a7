//! Run configuration.
//!
//! One explicit object handed to every component; nothing here touches
//! process-wide state. Loaded from JSON, every field optional.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utsuri_core::{Result, UtsuriError};

use crate::optim::OptimizerKind;

/// Hyper-parameters and file locations of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Data
    pub filename_train: PathBuf,
    pub filename_dev: PathBuf,
    pub filename_test: PathBuf,
    pub filename_words: PathBuf,
    pub filename_tags: PathBuf,
    /// GloVe-format text embeddings. Random init when absent.
    pub filename_embeddings: Option<PathBuf>,
    /// Cap on sentences read per dataset.
    pub max_iter: Option<usize>,

    // Outputs
    pub dir_model: PathBuf,
    pub dir_output: PathBuf,
    pub path_log: PathBuf,

    /// Device ids; the first one is used. Empty means CPU.
    pub gpu_ids: Vec<usize>,

    // Optimization
    pub lr_method: String,
    pub lr: f64,
    pub lr_decay: f64,
    /// Global-norm clip threshold per partition; `<= 0` disables clipping.
    pub clip: f64,
    /// Learning-rate multiplier of the adaptation partition.
    pub psi: f64,
    pub nepochs: usize,
    /// Early-stopping patience.
    pub nepoch_no_imprv: usize,
    pub batch_size: usize,

    // Architecture
    pub dim_word: usize,
    pub hidden_size_lstm: usize,
    pub train_embeddings: bool,
    pub lowercase: bool,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filename_train: PathBuf::from("data/source/train.txt"),
            filename_dev: PathBuf::from("data/source/dev.txt"),
            filename_test: PathBuf::from("data/source/test.txt"),
            filename_words: PathBuf::from("data/source/words.txt"),
            filename_tags: PathBuf::from("data/source/tags.txt"),
            filename_embeddings: None,
            max_iter: None,
            dir_model: PathBuf::from("results/source/model.weights"),
            dir_output: PathBuf::from("results/source"),
            path_log: PathBuf::from("results/source/log.txt"),
            gpu_ids: vec![0],
            lr_method: "adam".to_string(),
            lr: 0.001,
            lr_decay: 0.9,
            clip: -1.0,
            psi: 1.0,
            nepochs: 15,
            nepoch_no_imprv: 3,
            batch_size: 20,
            dim_word: 300,
            hidden_size_lstm: 300,
            train_embeddings: false,
            lowercase: true,
            seed: 42,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn with_optimizer(mut self, lr_method: impl Into<String>) -> Self {
        self.lr_method = lr_method.into();
        self
    }

    pub fn with_learning_rate(mut self, lr: f64, lr_decay: f64) -> Self {
        self.lr = lr;
        self.lr_decay = lr_decay;
        self
    }

    pub fn with_clip(mut self, clip: f64) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_psi(mut self, psi: f64) -> Self {
        self.psi = psi;
        self
    }

    /// Set the pass budget and early-stopping patience.
    pub fn with_schedule(mut self, nepochs: usize, nepoch_no_imprv: usize) -> Self {
        self.nepochs = nepochs;
        self.nepoch_no_imprv = nepoch_no_imprv;
        self
    }

    pub fn with_dims(mut self, dim_word: usize, hidden_size_lstm: usize) -> Self {
        self.dim_word = dim_word;
        self.hidden_size_lstm = hidden_size_lstm;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Point every input and output path below `root`, keeping file names.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        for path in self.paths_mut() {
            *path = root.join(&*path);
        }
        if let Some(embeddings) = &mut self.filename_embeddings {
            *embeddings = root.join(&*embeddings);
        }
        self
    }

    fn paths_mut(&mut self) -> [&mut PathBuf; 8] {
        [
            &mut self.filename_train,
            &mut self.filename_dev,
            &mut self.filename_test,
            &mut self.filename_words,
            &mut self.filename_tags,
            &mut self.dir_model,
            &mut self.dir_output,
            &mut self.path_log,
        ]
    }

    /// Reject settings that would only fail later, after the graph is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(UtsuriError::Configuration(msg));

        self.lr_method.parse::<OptimizerKind>()?;
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return invalid(format!("lr must be positive, got {}", self.lr));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return invalid(format!("lr_decay must be in (0, 1], got {}", self.lr_decay));
        }
        if !self.clip.is_finite() {
            return invalid(format!("clip must be finite, got {}", self.clip));
        }
        if !(self.psi.is_finite() && self.psi >= 0.0) {
            return invalid(format!("psi must be a non-negative number, got {}", self.psi));
        }
        if self.psi == 0.0 {
            warn!("psi is 0: adaptation parameters will not be updated");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if self.nepochs == 0 {
            return invalid("nepochs must be at least 1".to_string());
        }
        if self.nepoch_no_imprv == 0 {
            return invalid("nepoch_no_imprv must be at least 1".to_string());
        }
        if self.dim_word == 0 || self.hidden_size_lstm == 0 {
            return invalid("dim_word and hidden_size_lstm must be positive".to_string());
        }

        let required = [
            ("filename_train", &self.filename_train),
            ("filename_dev", &self.filename_dev),
            ("filename_test", &self.filename_test),
            ("filename_words", &self.filename_words),
            ("filename_tags", &self.filename_tags),
            ("dir_model", &self.dir_model),
            ("dir_output", &self.dir_output),
            ("path_log", &self.path_log),
        ];
        for (name, path) in required {
            if path.as_os_str().is_empty() {
                return invalid(format!("{name} must not be empty"));
            }
        }
        if self
            .filename_embeddings
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return invalid("filename_embeddings must not be empty when set".to_string());
        }
        Ok(())
    }

    /// Device named by the first entry of `gpu_ids`, or the CPU.
    pub fn device(&self) -> Result<Device> {
        match self.gpu_ids.first() {
            Some(&id) => Ok(Device::cuda_if_available(id)?),
            None => Ok(Device::Cpu),
        }
    }

    /// Derive the configuration of a target-domain run from this one.
    ///
    /// Splits are read from `datasets/<name>/{train,dev,test}`; vocabulary,
    /// model, output and log locations swap their `source` segment for `target`.
    pub fn for_target_domain(&self, dataset_name: &str) -> Self {
        let mut target = self.clone();
        let split = |file: &str| PathBuf::from("datasets").join(dataset_name).join(file);
        target.filename_train = split("train");
        target.filename_dev = split("dev");
        target.filename_test = split("test");

        for path in [
            &mut target.filename_words,
            &mut target.filename_tags,
            &mut target.dir_model,
            &mut target.dir_output,
            &mut target.path_log,
        ] {
            *path = to_target(path);
        }
        target.filename_embeddings = target.filename_embeddings.as_deref().map(to_target);
        target
    }
}

fn to_target(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace("source", "target"))
}
