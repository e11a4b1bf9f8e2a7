pub mod tags;
pub mod viterbi;

pub use tags::{Chunk, OUTSIDE, Tag, TagVocab};
pub use viterbi::ViterbiDecoder;
