//! # Model Lifecycle
//!
//! Owns the computation context of one model and walks it through
//! build, optional transfer from a source checkpoint, re-initialization of the
//! label projection, training, evaluation and inference.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use utsuri_core::checkpoint::save_checkpoint;
use utsuri_core::metrics::token_accuracy;
use utsuri_core::model::PROJECTION_SCOPE;
use utsuri_core::vocab::load_trimmed_embeddings;
use utsuri_core::{
    BiLstmCrfTagger, ChunkCounter, Dataset, Metrics, Result, SequenceTagger, Session, TagProcessor,
    TagVocab, TaggerConfig, TransferReport, UtsuriError, Vocab, WordProcessor, minibatches,
    restore_all, transfer_from_checkpoint,
};

use crate::config::Config;
use crate::optim::PartitionedOptimizer;
use crate::trainer::{PassResult, PassRunner, Schedule, TrainingLoop, TrainingSummary};

/// File written by [`ModelLifecycle::predict_file`].
pub const PREDICTIONS_FILE: &str = "predictions.txt";

/// Everything a full adaptation run produced.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationRun {
    /// Restored parameter names, when a source checkpoint was given.
    pub restored: Option<Vec<String>>,
    pub reinitialized: usize,
    pub summary: TrainingSummary,
    pub metrics: Metrics,
}

pub struct ModelLifecycle {
    config: Config,
    session: Session,
    tagger: BiLstmCrfTagger,
    tags: TagVocab,
    words: Arc<WordProcessor>,
    tag_ids: Arc<TagProcessor>,
}

impl ModelLifecycle {
    /// Validate `config`, load its vocabularies and build a fresh graph.
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let words = Vocab::load(&config.filename_words)?;
        let tags = Vocab::load(&config.filename_tags)?;
        Self::from_parts(config, words, tags)
    }

    /// Build a fresh graph from already loaded vocabularies.
    pub fn from_parts(config: Config, words: Vocab, tags: Vocab) -> Result<Self> {
        config.validate()?;
        if words.is_empty() || tags.is_empty() {
            return Err(UtsuriError::Configuration(
                "word and tag vocabularies must not be empty".to_string(),
            ));
        }

        let pretrained_embeddings = match &config.filename_embeddings {
            Some(path) => Some(load_trimmed_embeddings(path, &words, config.dim_word)?),
            None => None,
        };

        let words = Arc::new(words);
        let tags = Arc::new(tags);
        let tag_vocab = TagVocab::from_vocab(&tags);
        let word_processor = Arc::new(WordProcessor::new(Arc::clone(&words), config.lowercase, true)?);

        let mut session = Session::new(config.device()?, config.seed);
        let tagger = session.build(&TaggerConfig {
            vocab_size: words.len(),
            tags: tag_vocab.clone(),
            dim_word: config.dim_word,
            hidden_size_lstm: config.hidden_size_lstm,
            train_embeddings: config.train_embeddings,
            pretrained_embeddings,
        })?;
        info!(
            words = words.len(),
            tags = tag_vocab.len(),
            parameters = session.params().len(),
            "built model"
        );

        Ok(Self {
            config,
            session,
            tagger,
            tags: tag_vocab,
            words: word_processor,
            tag_ids: Arc::new(TagProcessor::new(tags)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tagger(&self) -> &BiLstmCrfTagger {
        &self.tagger
    }

    /// Labeled dataset over `path` using this model's vocabularies.
    pub fn dataset(&self, path: impl Into<PathBuf>) -> Dataset {
        Dataset::new(
            path,
            self.words.clone(),
            self.tag_ids.clone(),
            self.config.max_iter,
        )
    }

    /// The configured train, dev and test splits.
    pub fn datasets(&self) -> (Dataset, Dataset, Dataset) {
        (
            self.dataset(&self.config.filename_train),
            self.dataset(&self.config.filename_dev),
            self.dataset(&self.config.filename_test),
        )
    }

    /// Restore every parameter that also exists, with the same shape, in `source`.
    pub fn transfer_from(&mut self, source: impl AsRef<Path>) -> Result<TransferReport> {
        let source = source.as_ref();
        self.session
            .run(|params| transfer_from_checkpoint(params, source))
    }

    /// Draw fresh values for every parameter under `scope`.
    pub fn reinitialize_weights(&mut self, scope: &str) -> Result<usize> {
        self.session.reinitialize_scope(scope)
    }

    /// Train with early stopping; snapshots go to `dir_model`.
    pub fn train(&mut self, train: &Dataset, dev: &Dataset) -> Result<TrainingSummary> {
        let config = &self.config;
        let optimizer = self.session.run(|params| {
            PartitionedOptimizer::build(&config.lr_method, params, config.psi, config.clip)
        })?;

        let mut runner = EpochRunner {
            session: &mut self.session,
            tagger: &self.tagger,
            tags: &self.tags,
            optimizer,
            train,
            dev,
            batch_size: config.batch_size,
            dir_model: &config.dir_model,
        };
        let summary = TrainingLoop::new(Schedule::from_config(config)).run(&mut runner)?;
        info!(
            best_score = summary.best_score,
            passes = summary.passes_run,
            stop = ?summary.stop_reason,
            "training finished"
        );
        Ok(summary)
    }

    /// Reload every parameter from the latest snapshot in `dir_model`.
    pub fn restore_latest(&mut self) -> Result<()> {
        let dir_model = &self.config.dir_model;
        self.session.run(|params| restore_all(params, dir_model))
    }

    /// Reload the persisted snapshot from `dir_model` and score `test`.
    pub fn evaluate(&mut self, test: &Dataset) -> Result<Metrics> {
        self.restore_latest()?;
        info!("Testing model over test set");
        let metrics = run_evaluate(&self.tagger, &self.tags, test, self.config.batch_size)?;
        info!("{metrics}");
        Ok(metrics)
    }

    /// Score `dataset` with the current in-memory parameters.
    pub fn run_evaluate(&self, dataset: &Dataset) -> Result<Metrics> {
        run_evaluate(&self.tagger, &self.tags, dataset, self.config.batch_size)
    }

    /// Tag one tokenized sentence.
    pub fn predict_words(&self, words: &[&str]) -> Result<Vec<String>> {
        use utsuri_core::TokenProcessor;

        let sentence = utsuri_core::Sentence {
            words: words.iter().map(|w| w.to_string()).collect(),
            word_ids: words
                .iter()
                .map(|w| self.words.process(w))
                .collect::<Result<_>>()?,
            tag_ids: Vec::new(),
        };
        let predicted = self.tagger.predict(std::slice::from_ref(&sentence))?;
        predicted
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|id| self.tag_name(id))
            .collect()
    }

    /// Tag an unlabeled CoNLL file and write `word tag` lines to
    /// `output_dir/predictions.txt`. Returns the written path.
    pub fn predict_file(&self, input: impl Into<PathBuf>, output_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dataset = Dataset::unlabeled(input, self.words.clone(), self.config.max_iter);
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(PREDICTIONS_FILE);
        let mut writer = BufWriter::new(File::create(&path)?);

        let mut sentences = 0usize;
        for batch in minibatches(dataset.iter()?, self.config.batch_size) {
            let batch = batch?;
            let predicted = self.tagger.predict(&batch)?;
            for (sentence, tags) in batch.iter().zip(predicted) {
                for (word, tag) in sentence.words.iter().zip(tags) {
                    writeln!(writer, "{word} {}", self.tag_name(tag)?)?;
                }
                writeln!(writer)?;
                sentences += 1;
            }
        }
        writer.flush()?;

        info!(path = %path.display(), sentences, "wrote predictions");
        Ok(path)
    }

    /// Close the computation context; later operations fail.
    pub fn close(&mut self) {
        self.session.close();
    }

    fn tag_name(&self, id: u32) -> Result<String> {
        self.tags
            .name(id)
            .map(str::to_string)
            .ok_or_else(|| UtsuriError::Configuration(format!("tag id {id} out of range")))
    }
}

/// Build, optionally transfer from `source`, re-initialize `reinit_scope`,
/// train on the configured splits and evaluate on the test split.
pub fn run_adaptation(
    config: Config,
    source: Option<&Path>,
    reinit_scope: Option<&str>,
) -> Result<AdaptationRun> {
    let mut lifecycle = ModelLifecycle::build(config)?;

    let restored = match source {
        Some(source) => {
            let report = lifecycle.transfer_from(source)?;
            Some(report.restored().into_iter().map(str::to_string).collect())
        }
        None => None,
    };
    let reinitialized = match (source, reinit_scope) {
        (Some(_), Some(scope)) => lifecycle.reinitialize_weights(scope)?,
        (Some(_), None) => lifecycle.reinitialize_weights(PROJECTION_SCOPE)?,
        (None, _) => 0,
    };

    let (train, dev, test) = lifecycle.datasets();
    let summary = lifecycle.train(&train, &dev)?;
    let metrics = lifecycle.evaluate(&test)?;
    lifecycle.close();

    Ok(AdaptationRun {
        restored,
        reinitialized,
        summary,
        metrics,
    })
}

fn run_evaluate(
    tagger: &BiLstmCrfTagger,
    tags: &TagVocab,
    dataset: &Dataset,
    batch_size: usize,
) -> Result<Metrics> {
    let mut counter = ChunkCounter::new();
    for batch in minibatches(dataset.iter()?, batch_size) {
        let batch = batch?;
        let predicted = tagger.predict(&batch)?;
        for (sentence, pred) in batch.iter().zip(&predicted) {
            counter.update(&sentence.tag_ids, pred, tags);
        }
    }
    Ok(counter.finish())
}

struct EpochRunner<'a> {
    session: &'a mut Session,
    tagger: &'a BiLstmCrfTagger,
    tags: &'a TagVocab,
    optimizer: PartitionedOptimizer,
    train: &'a Dataset,
    dev: &'a Dataset,
    batch_size: usize,
    dir_model: &'a Path,
}

impl PassRunner for EpochRunner<'_> {
    fn run_pass(&mut self, pass: usize, lr: f64) -> Result<PassResult> {
        let mut loss_history = Vec::new();
        let mut metric_history = Vec::new();

        for (step, batch) in minibatches(self.train.iter()?, self.batch_size).enumerate() {
            let batch = batch?;
            let tagger = self.tagger;
            let optimizer = &mut self.optimizer;
            let report = self.session.run(|_| {
                let loss = tagger.loss(&batch)?;
                optimizer.step(&loss, lr)
            })?;

            let predicted = tagger.predict(&batch)?;
            let accuracy = token_accuracy(
                batch
                    .iter()
                    .zip(&predicted)
                    .map(|(s, p)| (s.tag_ids.as_slice(), p.as_slice())),
            );
            debug!(pass, step, loss = report.loss, accuracy, "batch");
            loss_history.push(report.loss);
            metric_history.push(accuracy);
        }

        let metrics = run_evaluate(self.tagger, self.tags, self.dev, self.batch_size)?;
        info!("{metrics}");
        Ok(PassResult {
            score: metrics.f1,
            loss_history,
            metric_history,
        })
    }

    fn persist(&mut self, pass: usize, score: f64) -> Result<()> {
        let dir_model = self.dir_model;
        self.session
            .run(|params| save_checkpoint(dir_model, params, pass, score))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utsuri_core::TransferOutcome;
    use tempfile::{TempDir, tempdir};

    const TRAIN: &str = "John B-PER\nlives O\nin O\nParis B-LOC\n\n\
                         Mary B-PER\nSmith I-PER\nvisited O\nBerlin B-LOC\n\n\
                         Paris B-LOC\nis O\nbig O\n";
    const DEV: &str = "Mary B-PER\nlives O\nin O\nBerlin B-LOC\n";

    fn write_domain(root: &Path, domain: &str, tags: &[&str]) {
        let data = root.join("data").join(domain);
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("train.txt"), TRAIN).unwrap();
        fs::write(data.join("dev.txt"), DEV).unwrap();
        fs::write(data.join("test.txt"), DEV).unwrap();
        Vocab::from_tokens([
            "$UNK$", "$NUM$", "john", "lives", "in", "paris", "mary", "smith", "visited", "berlin",
            "is", "big",
        ])
        .save(data.join("words.txt"))
        .unwrap();
        Vocab::from_tokens(tags.iter().copied())
            .save(data.join("tags.txt"))
            .unwrap();
    }

    fn config(root: &Path) -> Config {
        let mut config = Config::new()
            .with_optimizer("sgd")
            .with_learning_rate(0.1, 0.9)
            .with_schedule(2, 1)
            .with_dims(4, 3)
            .with_batch_size(2)
            .with_seed(5)
            .with_root(root);
        config.gpu_ids = Vec::new();
        config.train_embeddings = true;
        config
    }

    fn target_config(root: &Path) -> Config {
        let mut target = config(root);
        for path in [
            &mut target.filename_train,
            &mut target.filename_dev,
            &mut target.filename_test,
            &mut target.filename_words,
            &mut target.filename_tags,
            &mut target.dir_model,
            &mut target.dir_output,
            &mut target.path_log,
        ] {
            *path = PathBuf::from(path.to_string_lossy().replace("source", "target"));
        }
        target.with_seed(6)
    }

    fn trained_source() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        write_domain(dir.path(), "source", &["B-LOC", "B-PER", "I-PER", "O"]);
        let config = config(dir.path());
        let dir_model = config.dir_model.clone();

        let mut source = ModelLifecycle::build(config).unwrap();
        let (train, dev, _) = source.datasets();
        let summary = source.train(&train, &dev).unwrap();
        assert!(!summary.improved_passes.is_empty());
        (dir, dir_model)
    }

    #[test]
    fn test_build_rejects_invalid_config_before_loading() {
        let config = Config::new().with_optimizer("nadam").with_root("/nonexistent");
        let err = ModelLifecycle::build(config).err().expect("invalid config");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_training_persists_snapshot() {
        let (_dir, dir_model) = trained_source();
        assert!(dir_model.join(utsuri_core::checkpoint::MANIFEST_FILE).is_file());
        assert!(utsuri_core::latest_checkpoint(&dir_model).is_ok());
    }

    #[test]
    fn test_transfer_skips_resized_projection() {
        let (dir, source_model) = trained_source();
        write_domain(dir.path(), "target", &["B-LOC", "B-ORG", "B-PER", "I-PER", "O"]);

        let mut target = ModelLifecycle::build(target_config(dir.path())).unwrap();
        let report = target.transfer_from(&source_model).unwrap();

        assert_eq!(report.outcome("words/_word_embeddings"), Some(&TransferOutcome::Restored));
        assert_eq!(report.outcome("bi-lstm/fw/kernel"), Some(&TransferOutcome::Restored));
        assert!(matches!(
            report.outcome("proj/W"),
            Some(TransferOutcome::SkippedShapeMismatch { .. })
        ));
        assert!(matches!(
            report.outcome("crf/transitions"),
            Some(TransferOutcome::SkippedShapeMismatch { .. })
        ));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_reinitialized_projection_differs_from_restored() {
        let (dir, source_model) = trained_source();
        write_domain(dir.path(), "target", &["B-LOC", "B-PER", "I-PER", "O"]);

        let mut target = ModelLifecycle::build(target_config(dir.path())).unwrap();
        let report = target.transfer_from(&source_model).unwrap();
        assert!(report.is_complete());

        let restored: Vec<Vec<f32>> = ["proj/W", "proj/b"]
            .iter()
            .map(|n| target.session().params().get(n).unwrap().values().unwrap())
            .collect();
        assert_eq!(target.reinitialize_weights("proj").unwrap(), 2);

        for (name, before) in ["proj/W", "proj/b"].iter().zip(&restored) {
            let after = target.session().params().get(name).unwrap().values().unwrap();
            assert_ne!(&after, before, "{name}");
            assert!(after.iter().any(|v| *v != 0.0), "{name}");
        }
        // Outside the scope the restored values survive.
        let lstm = target.session().params().get("bi-lstm/bw/kernel").unwrap();
        let source = utsuri_core::load_checkpoint(&source_model, &candle_core::Device::Cpu).unwrap();
        assert_eq!(
            lstm.values().unwrap(),
            source["bi-lstm/bw/kernel"].flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_restore_is_deterministic() {
        let (dir, source_model) = trained_source();
        write_domain(dir.path(), "target", &["B-LOC", "B-PER", "I-PER", "O"]);

        let mut a = ModelLifecycle::build(target_config(dir.path())).unwrap();
        let mut b = ModelLifecycle::build(target_config(dir.path()).with_seed(99)).unwrap();
        a.transfer_from(&source_model).unwrap();
        a.transfer_from(&source_model).unwrap();
        b.transfer_from(&source_model).unwrap();
        for (pa, pb) in a.session().params().iter().zip(b.session().params().iter()) {
            assert_eq!(pa.values().unwrap(), pb.values().unwrap(), "{}", pa.name());
        }
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let dir = tempdir().unwrap();
        write_domain(dir.path(), "source", &["B-LOC", "B-PER", "I-PER", "O"]);
        let mut lifecycle = ModelLifecycle::build(config(dir.path())).unwrap();
        let err = lifecycle.transfer_from(dir.path().join("missing")).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_evaluate_and_predict() {
        let (dir, _) = trained_source();
        let mut lifecycle = ModelLifecycle::build(config(dir.path())).unwrap();
        let (_, _, test) = lifecycle.datasets();

        let metrics = lifecycle.evaluate(&test).unwrap();
        for value in metrics.to_map().values() {
            assert!((0.0..=1.0).contains(value));
        }

        let input = dir.path().join("raw.txt");
        fs::write(&input, "Mary\nvisited\nParis\n\nJohn\n").unwrap();
        let output = lifecycle.predict_file(&input, dir.path().join("out")).unwrap();
        assert!(output.ends_with(PREDICTIONS_FILE));
        let written = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("Mary "));
        assert_eq!(lines[3], "");

        let tags = lifecycle.predict_words(&["John", "lives"]).unwrap();
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_evaluate_without_snapshot_fails() {
        let dir = tempdir().unwrap();
        write_domain(dir.path(), "source", &["B-LOC", "B-PER", "I-PER", "O"]);
        let mut lifecycle = ModelLifecycle::build(config(dir.path())).unwrap();
        let (_, _, test) = lifecycle.datasets();
        assert!(lifecycle.evaluate(&test).unwrap_err().is_io());
    }

    #[test]
    fn test_closed_lifecycle_rejects_work() {
        let dir = tempdir().unwrap();
        write_domain(dir.path(), "source", &["B-LOC", "B-PER", "I-PER", "O"]);
        let mut lifecycle = ModelLifecycle::build(config(dir.path())).unwrap();
        lifecycle.close();
        let (train, dev, _) = lifecycle.datasets();
        assert!(matches!(
            lifecycle.train(&train, &dev).unwrap_err(),
            UtsuriError::ContextClosed
        ));
    }

    #[test]
    fn test_run_adaptation_end_to_end() {
        let (dir, source_model) = trained_source();
        write_domain(dir.path(), "target", &["B-LOC", "B-ORG", "B-PER", "I-PER", "O"]);

        let run = run_adaptation(target_config(dir.path()), Some(source_model.as_path()), None).unwrap();
        let restored = run.restored.unwrap();
        assert!(restored.iter().any(|n| n == "bi-lstm/fw/kernel"));
        assert!(!restored.iter().any(|n| n.starts_with("proj/")));
        assert_eq!(run.reinitialized, 2);
        assert!(run.summary.passes_run >= 1);
        assert!((0.0..=1.0).contains(&run.metrics.f1));
    }
}
