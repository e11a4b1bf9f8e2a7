//! # Utsuri Core
//!
//! Building blocks for moving a sequence tagger from one domain to another:
//! a parameter store with declared optimizer partitions, checkpoint indexing
//! and partial weight transfer, CoNLL data loading, chunk metrics, and a
//! BiLSTM-CRF tagger.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use utsuri_core::{Session, TaggerConfig, TagVocab, transfer_from_checkpoint};
//!
//! let mut session = Session::new(Device::Cpu, 42);
//! let tagger = session
//!     .build(&TaggerConfig {
//!         vocab_size: 10_000,
//!         tags: TagVocab::new(["O", "B-PER", "I-PER"]),
//!         dim_word: 100,
//!         hidden_size_lstm: 100,
//!         train_embeddings: false,
//!         pretrained_embeddings: None,
//!     })
//!     .unwrap();
//!
//! let report = transfer_from_checkpoint(session.params(), "results/source/model.weights").unwrap();
//! println!("restored {:?}", report.restored());
//! # drop(tagger);
//! ```
pub mod checkpoint;
pub mod context;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod param;
pub mod tagging;
pub mod transfer;
pub mod vocab;

// Re-export primary API
pub use checkpoint::{
    CheckpointIndex, CheckpointManifest, VariableInfo, latest_checkpoint, list_checkpoint_variables,
    load_checkpoint, save_checkpoint,
};
pub use context::{GraphBuilder, Session};
pub use data::{Dataset, Sentence, minibatches};
pub use error::{Result, UtsuriError};
pub use metrics::{ChunkCounter, Metrics};
pub use model::{BiLstmCrfTagger, SequenceTagger, TaggerConfig};
pub use param::{Initializer, Param, ParamStore, Partition};
pub use tagging::{Chunk, Tag, TagVocab, ViterbiDecoder};
pub use transfer::{TransferOutcome, TransferPlan, TransferReport, restore_all, transfer_from_checkpoint};
pub use vocab::{TagProcessor, TokenProcessor, Vocab, WordProcessor};
