//! Data loading for CoNLL-style tagged text.
//!
//! One token per line, word in the first column and tag in the last; a blank
//! line or a `-DOCSTART-` line ends a sentence. Files are streamed: every
//! call to [`Dataset::iter`] reopens the file, so a dataset can be consumed
//! once per training pass without holding it in memory.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, UtsuriError};
use crate::vocab::TokenProcessor;

/// A single sentence: raw words plus their ids (and tag ids when labeled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub words: Vec<String>,
    pub word_ids: Vec<u32>,
    /// Empty for unlabeled data.
    pub tag_ids: Vec<u32>,
}

impl Sentence {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn is_labeled(&self) -> bool {
        !self.tag_ids.is_empty()
    }
}

/// Lazily read, re-iterable sentence source.
#[derive(Clone)]
pub struct Dataset {
    path: PathBuf,
    words: Arc<dyn TokenProcessor>,
    tags: Option<Arc<dyn TokenProcessor>>,
    max_iter: Option<usize>,
}

impl Dataset {
    /// A labeled dataset. `max_iter` caps the number of sentences yielded.
    pub fn new(
        path: impl Into<PathBuf>,
        words: Arc<dyn TokenProcessor>,
        tags: Arc<dyn TokenProcessor>,
        max_iter: Option<usize>,
    ) -> Self {
        Self {
            path: path.into(),
            words,
            tags: Some(tags),
            max_iter,
        }
    }

    /// An unlabeled dataset; only the first column of each line is read.
    pub fn unlabeled(
        path: impl Into<PathBuf>,
        words: Arc<dyn TokenProcessor>,
        max_iter: Option<usize>,
    ) -> Self {
        Self {
            path: path.into(),
            words,
            tags: None,
            max_iter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_labeled(&self) -> bool {
        self.tags.is_some()
    }

    /// Open the file and stream its sentences.
    pub fn iter(&self) -> Result<SentenceIter> {
        let file = File::open(&self.path)?;
        Ok(SentenceIter {
            lines: BufReader::new(file).lines(),
            dataset: self.clone(),
            line_no: 0,
            emitted: 0,
            done: false,
        })
    }

    /// Number of sentences (after the `max_iter` cap). Reads the whole file.
    pub fn count(&self) -> Result<usize> {
        self.iter()?.try_fold(0, |n, s| s.map(|_| n + 1))
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("labeled", &self.is_labeled())
            .field("max_iter", &self.max_iter)
            .finish()
    }
}

/// Streaming iterator over a [`Dataset`].
pub struct SentenceIter {
    lines: Lines<BufReader<File>>,
    dataset: Dataset,
    line_no: usize,
    emitted: usize,
    done: bool,
}

impl SentenceIter {
    fn error(&self, reason: impl Into<String>) -> UtsuriError {
        UtsuriError::Dataset {
            path: self.dataset.path.clone(),
            line: self.line_no,
            reason: reason.into(),
        }
    }

    fn push_token(&self, line: &str, sentence: &mut Sentence) -> Result<()> {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let word = columns[0];
        let word_id = self.dataset.words.process(word).map_err(|e| self.error(e.to_string()))?;

        if let Some(tags) = &self.dataset.tags {
            if columns.len() < 2 {
                return Err(self.error("expected `word ... tag` columns"));
            }
            let tag = columns[columns.len() - 1];
            let tag_id = tags.process(tag).map_err(|e| self.error(e.to_string()))?;
            sentence.tag_ids.push(tag_id);
        }

        sentence.words.push(word.to_string());
        sentence.word_ids.push(word_id);
        Ok(())
    }

    fn finish(&mut self, sentence: Sentence) -> Option<Result<Sentence>> {
        self.emitted += 1;
        if self.dataset.max_iter.is_some_and(|max| self.emitted >= max) {
            self.done = true;
        }
        Some(Ok(sentence))
    }
}

impl Iterator for SentenceIter {
    type Item = Result<Sentence>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.dataset.max_iter == Some(0) {
            return None;
        }

        let mut sentence = Sentence {
            words: Vec::new(),
            word_ids: Vec::new(),
            tag_ids: Vec::new(),
        };

        loop {
            let Some(line) = self.lines.next() else {
                self.done = true;
                return if sentence.is_empty() {
                    None
                } else {
                    self.finish(sentence)
                };
            };
            self.line_no += 1;

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let line = line.trim();

            if line.is_empty() || line.starts_with("-DOCSTART-") {
                if !sentence.is_empty() {
                    return self.finish(sentence);
                }
                continue;
            }

            if let Err(e) = self.push_token(line, &mut sentence) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Group a sentence stream into batches of at most `batch_size`.
pub fn minibatches<I>(sentences: I, batch_size: usize) -> Minibatches<I>
where
    I: Iterator<Item = Result<Sentence>>,
{
    Minibatches {
        inner: sentences,
        batch_size: batch_size.max(1),
    }
}

pub struct Minibatches<I> {
    inner: I,
    batch_size: usize,
}

impl<I> Iterator for Minibatches<I>
where
    I: Iterator<Item = Result<Sentence>>,
{
    type Item = Result<Vec<Sentence>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for sentence in self.inner.by_ref() {
            match sentence {
                Ok(s) => batch.push(s),
                Err(e) => return Some(Err(e)),
            }
            if batch.len() == self.batch_size {
                break;
            }
        }
        if batch.is_empty() { None } else { Some(Ok(batch)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{TagProcessor, Vocab, WordProcessor};
    use std::fs;
    use tempfile::tempdir;

    const CONLL: &str = "-DOCSTART- -X- O\n\
                         \n\
                         John NNP B-PER\n\
                         lives VBZ O\n\
                         in IN O\n\
                         Paris NNP B-LOC\n\
                         \n\
                         Mary NNP B-PER\n\
                         \n\
                         \n\
                         Oslo NNP B-LOC\n";

    fn processors() -> (Arc<dyn TokenProcessor>, Arc<dyn TokenProcessor>) {
        let words = Arc::new(Vocab::from_tokens(["$UNK$", "$NUM$", "john", "paris", "mary"]));
        let tags = Arc::new(Vocab::from_tokens(["O", "B-PER", "B-LOC"]));
        (
            Arc::new(WordProcessor::new(words, true, true).unwrap()),
            Arc::new(TagProcessor::new(tags)),
        )
    }

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_reads_sentences() {
        let (_dir, path) = write(CONLL);
        let (words, tags) = processors();
        let dataset = Dataset::new(&path, words, tags, None);

        let sentences: Vec<Sentence> = dataset.iter().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].words, vec!["John", "lives", "in", "Paris"]);
        assert_eq!(sentences[0].word_ids, vec![2, 0, 0, 3]);
        assert_eq!(sentences[0].tag_ids, vec![1, 0, 0, 2]);
        assert_eq!(sentences[2].words, vec!["Oslo"]);
    }

    #[test]
    fn test_is_reiterable() {
        let (_dir, path) = write(CONLL);
        let (words, tags) = processors();
        let dataset = Dataset::new(&path, words, tags, None);
        assert_eq!(dataset.count().unwrap(), 3);
        assert_eq!(dataset.count().unwrap(), 3);
    }

    #[test]
    fn test_max_iter_caps_sentences() {
        let (_dir, path) = write(CONLL);
        let (words, tags) = processors();
        let dataset = Dataset::new(&path, words, tags, Some(2));
        assert_eq!(dataset.count().unwrap(), 2);
    }

    #[test]
    fn test_unknown_tag_reports_line() {
        let (_dir, path) = write("John B-PER\nWalks B-ACTION\n");
        let (words, tags) = processors();
        let dataset = Dataset::new(&path, words, tags, None);
        let err = dataset.iter().unwrap().next().unwrap().unwrap_err();
        assert!(matches!(err, UtsuriError::Dataset { line: 2, .. }));
    }

    #[test]
    fn test_unlabeled_reads_first_column() {
        let (_dir, path) = write("John\nlives\n\nMary\n");
        let (words, _) = processors();
        let dataset = Dataset::unlabeled(&path, words, None);
        let sentences: Vec<Sentence> = dataset.iter().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(sentences.len(), 2);
        assert!(!sentences[0].is_labeled());
    }

    #[test]
    fn test_missing_file() {
        let (words, tags) = processors();
        let dataset = Dataset::new("/nonexistent/train.txt", words, tags, None);
        let err = dataset.iter().err().expect("missing file must fail");
        assert!(err.is_io());
    }

    #[test]
    fn test_minibatches() {
        let (_dir, path) = write(CONLL);
        let (words, tags) = processors();
        let dataset = Dataset::new(&path, words, tags, None);
        let batches: Vec<Vec<Sentence>> = minibatches(dataset.iter().unwrap(), 2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }
}
