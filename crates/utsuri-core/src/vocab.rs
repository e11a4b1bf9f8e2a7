//! # Vocabularies
//!
//! Word and tag vocabularies are plain text files, one entry per line, where
//! the line number is the id. Processors turn raw tokens into ids.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{Result, UtsuriError};

/// Unknown-word placeholder.
pub const UNK: &str = "$UNK$";
/// Placeholder for numeric tokens.
pub const NUM: &str = "$NUM$";

/// Ordered token list with reverse lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocab {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocab {
    /// Build from tokens in id order. Later duplicates are ignored.
    pub fn from_tokens<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        let mut vocab = Vocab::default();
        for token in tokens {
            vocab.insert(token.into());
        }
        vocab
    }

    /// Load a vocabulary file (one token per line).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut vocab = Vocab::default();
        for line in reader.lines() {
            let line = line?;
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            if !vocab.insert(token.to_string()) {
                warn!(path = %path.display(), token, "duplicate vocabulary entry ignored");
            }
        }
        info!(path = %path.display(), size = vocab.len(), "loaded vocabulary");
        Ok(vocab)
    }

    /// Write one token per line.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        for token in &self.tokens {
            writeln!(writer, "{token}")?;
        }
        writer.flush()?;
        info!(path = %path.display(), size = self.len(), "wrote vocabulary");
        Ok(())
    }

    fn insert(&mut self, token: String) -> bool {
        if self.index.contains_key(&token) {
            return false;
        }
        self.index.insert(token.clone(), self.tokens.len() as u32);
        self.tokens.push(token);
        true
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Maps a raw token to an id.
pub trait TokenProcessor: Send + Sync {
    fn process(&self, raw: &str) -> Result<u32>;
}

impl<F> TokenProcessor for F
where
    F: Fn(&str) -> Result<u32> + Send + Sync,
{
    fn process(&self, raw: &str) -> Result<u32> {
        self(raw)
    }
}

/// Word normalization and lookup.
#[derive(Debug, Clone)]
pub struct WordProcessor {
    vocab: Arc<Vocab>,
    lowercase: bool,
    allow_unk: bool,
    number: Regex,
}

impl WordProcessor {
    pub fn new(vocab: Arc<Vocab>, lowercase: bool, allow_unk: bool) -> Result<Self> {
        Ok(Self {
            vocab,
            lowercase,
            allow_unk,
            number: number_pattern()?,
        })
    }

    /// Normalized form used for lookup: optional lowercasing, numbers to [`NUM`].
    pub fn normalize(&self, raw: &str) -> String {
        normalize_word(raw, self.lowercase, &self.number)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }
}

impl TokenProcessor for WordProcessor {
    fn process(&self, raw: &str) -> Result<u32> {
        let word = self.normalize(raw);
        match self.vocab.get(&word) {
            Some(id) => Ok(id),
            None if self.allow_unk => self.vocab.get(UNK).ok_or(UtsuriError::UnknownToken {
                vocab: "words",
                token: word,
            }),
            None => Err(UtsuriError::UnknownToken {
                vocab: "words",
                token: word,
            }),
        }
    }
}

/// Tag lookup. Unknown tags are always an error.
#[derive(Debug, Clone)]
pub struct TagProcessor {
    vocab: Arc<Vocab>,
}

impl TagProcessor {
    pub fn new(vocab: Arc<Vocab>) -> Self {
        Self { vocab }
    }
}

impl TokenProcessor for TagProcessor {
    fn process(&self, raw: &str) -> Result<u32> {
        self.vocab.get(raw).ok_or_else(|| UtsuriError::UnknownToken {
            vocab: "tags",
            token: raw.to_string(),
        })
    }
}

fn number_pattern() -> Result<Regex> {
    Ok(Regex::new(r"^[+-]?\d+(?:[.,]\d+)*$")?)
}

fn normalize_word(raw: &str, lowercase: bool, number: &Regex) -> String {
    if number.is_match(raw) {
        return NUM.to_string();
    }
    if lowercase {
        raw.to_lowercase()
    } else {
        raw.to_string()
    }
}

/// Collect the word and tag vocabularies of CoNLL files.
///
/// Words are normalized the same way [`WordProcessor`] normalizes them, and
/// the word vocabulary always contains [`UNK`] and [`NUM`]. Both vocabularies
/// are sorted so rebuilding from the same data gives the same ids.
pub fn build_vocabs<P: AsRef<Path>>(paths: &[P], lowercase: bool) -> Result<(Vocab, Vocab)> {
    let number = number_pattern()?;
    let mut words = BTreeSet::new();
    let mut tags = BTreeSet::new();

    for path in paths {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with("-DOCSTART-") {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if let (Some(word), Some(tag)) = (columns.first(), columns.last()) {
                words.insert(normalize_word(word, lowercase, &number));
                if columns.len() > 1 {
                    tags.insert(tag.to_string());
                }
            }
        }
    }

    words.insert(UNK.to_string());
    words.insert(NUM.to_string());
    info!(words = words.len(), tags = tags.len(), "built vocabularies");
    Ok((Vocab::from_tokens(words), Vocab::from_tokens(tags)))
}

/// Read GloVe-format text embeddings (`word v1 v2 ...`) into a row-major
/// `[vocab.len(), dim]` matrix. Rows for words absent from the file stay zero.
pub fn load_trimmed_embeddings(path: impl AsRef<Path>, vocab: &Vocab, dim: usize) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut matrix = vec![0.0f32; vocab.len() * dim];
    let mut found = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else { continue };
        let Some(id) = vocab.get(word) else { continue };

        let values = parts
            .map(str::parse::<f32>)
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| UtsuriError::Dataset {
                path: path.to_path_buf(),
                line: line_no + 1,
                reason: e.to_string(),
            })?;
        if values.len() != dim {
            return Err(UtsuriError::Dataset {
                path: path.to_path_buf(),
                line: line_no + 1,
                reason: format!("expected {dim} dimensions, got {}", values.len()),
            });
        }
        let row = id as usize * dim;
        matrix[row..row + dim].copy_from_slice(&values);
        found += 1;
    }

    info!(path = %path.display(), found, vocab = vocab.len(), "loaded embeddings");
    Ok(matrix)
}
