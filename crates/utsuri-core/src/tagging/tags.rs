//! # BIO Tags for Named Entity Recognition
//!
//! Tag sets come from the tags file of a domain, so the scheme is parsed
//! from strings rather than fixed at compile time. `B-X` begins an entity of
//! type `X`, `I-X` continues it, `O` is outside any entity.

use std::collections::HashMap;
use std::fmt;

use crate::vocab::Vocab;

/// Tag string for tokens outside any entity.
pub const OUTSIDE: &str = "O";

/// A parsed BIO tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    Begin(String),
    Inside(String),
    Outside,
}

impl Tag {
    /// Parse a tag string.
    ///
    /// Prefixes other than `B-` (e.g. `E-`, `S-`) and bare labels are read as
    /// `Inside`, which is how conlleval chunks them: they extend a running
    /// entity of the same type and start a new one otherwise.
    pub fn parse(raw: &str) -> Self {
        if raw == OUTSIDE {
            return Tag::Outside;
        }
        match raw.split_once('-') {
            Some(("B", ty)) => Tag::Begin(ty.to_string()),
            Some((_, ty)) => Tag::Inside(ty.to_string()),
            None => Tag::Inside(raw.to_string()),
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, Tag::Begin(_))
    }

    pub fn is_inside(&self) -> bool {
        matches!(self, Tag::Inside(_))
    }

    /// Entity type, `None` for `O`.
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Tag::Begin(ty) | Tag::Inside(ty) => Some(ty.as_str()),
            Tag::Outside => None,
        }
    }

    /// Check if transitioning from `from` tag to `to` tag is valid.
    pub fn is_valid_transition(from: &Tag, to: &Tag) -> bool {
        match (from, to) {
            // Can't have I-* without preceding B-* or I-*
            (Tag::Outside, Tag::Inside(_)) => false,
            // Can't continue a different entity type
            (Tag::Begin(a) | Tag::Inside(a), Tag::Inside(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Begin(ty) => write!(f, "B-{ty}"),
            Tag::Inside(ty) => write!(f, "I-{ty}"),
            Tag::Outside => write!(f, "{OUTSIDE}"),
        }
    }
}

/// An extracted entity span `[start, end)` in token indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
}

/// Ordered tag set of one domain.
#[derive(Debug, Clone)]
pub struct TagVocab {
    names: Vec<String>,
    tags: Vec<Tag>,
    index: HashMap<String, u32>,
}

impl TagVocab {
    pub fn new<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        let names: Vec<String> = names.into_iter().map(|s| s.as_ref().to_string()).collect();
        let tags = names.iter().map(|n| Tag::parse(n)).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        Self { names, tags, index }
    }

    pub fn from_vocab(vocab: &Vocab) -> Self {
        Self::new(vocab.tokens())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: u32) -> Option<&str> {
        self.names.get(idx as usize).map(String::as_str)
    }

    pub fn tag(&self, idx: u32) -> Option<&Tag> {
        self.tags.get(idx as usize)
    }

    /// Whether any tag carries a `B-` prefix.
    ///
    /// Without one the set is IO-scheme (`I-X` or bare `X`), where an entity
    /// may start right after `O` or after an entity of another type.
    pub fn has_begin_tags(&self) -> bool {
        self.tags.iter().any(Tag::is_begin)
    }

    /// `mask[prev][curr]` is true when `prev -> curr` is allowed.
    ///
    /// IO-scheme sets allow every transition.
    pub fn transition_mask(&self) -> Vec<Vec<bool>> {
        if !self.has_begin_tags() {
            return vec![vec![true; self.len()]; self.len()];
        }
        self.tags
            .iter()
            .map(|from| {
                self.tags
                    .iter()
                    .map(|to| Tag::is_valid_transition(from, to))
                    .collect()
            })
            .collect()
    }

    /// Entity spans of a tag index sequence.
    ///
    /// A chunk starts at a `B-X`, or at any `X` tag that follows a tag of a
    /// different type; it ends at `O` or at the start of the next chunk.
    pub fn chunks(&self, seq: &[u32]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut current: Option<(String, usize)> = None;

        for (i, &idx) in seq.iter().enumerate() {
            let tag = self.tag(idx).unwrap_or(&Tag::Outside);
            match tag.entity_type() {
                None => {
                    if let Some((ty, start)) = current.take() {
                        chunks.push(Chunk { entity_type: ty, start, end: i });
                    }
                }
                Some(ty) => {
                    let continues = !tag.is_begin()
                        && current.as_ref().is_some_and(|(cur, _)| cur == ty);
                    if !continues {
                        if let Some((cur, start)) = current.take() {
                            chunks.push(Chunk { entity_type: cur, start, end: i });
                        }
                        current = Some((ty.to_string(), i));
                    }
                }
            }
        }

        if let Some((ty, start)) = current {
            chunks.push(Chunk { entity_type: ty, start, end: seq.len() });
        }
        chunks
    }
}
