//! # Checkpoints
//!
//! A model directory holds exactly one "latest" snapshot: a safetensors file
//! with every parameter, plus a `checkpoint.json` manifest naming it. Each
//! save writes a new snapshot, repoints the manifest, then removes the
//! previous snapshot. Snapshots are never modified after they are written.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::tensor::Metadata;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, UtsuriError};
use crate::param::ParamStore;

/// Manifest file name inside a model directory.
pub const MANIFEST_FILE: &str = "checkpoint.json";

/// Upper bound on a snapshot's JSON header, as enforced by safetensors itself.
const MAX_HEADER_LEN: u64 = 100_000_000;

/// Shape and element type of a persisted parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// Every parameter persisted in a checkpoint, by name.
pub type CheckpointIndex = BTreeMap<String, VariableInfo>;

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Snapshot file name, relative to the model directory.
    pub latest: String,
    /// Training pass that produced the snapshot.
    pub pass: usize,
    /// Held-out score at that pass.
    pub score: f64,
}

/// Enumerate the parameters stored in a checkpoint without touching any model.
///
/// `path` may be a snapshot file or a model directory (resolved through its
/// manifest).
pub fn list_checkpoint_variables(path: impl AsRef<Path>) -> Result<CheckpointIndex> {
    let path = resolve_checkpoint(path)?;
    let header = read_header(&path)?;

    let index: CheckpointIndex = header
        .tensors()
        .into_iter()
        .map(|(name, tensor)| {
            let info = VariableInfo {
                shape: tensor.shape.clone(),
                dtype: format!("{:?}", tensor.dtype),
            };
            (name, info)
        })
        .collect();

    debug!(path = %path.display(), variables = index.len(), "indexed checkpoint");
    Ok(index)
}

/// Read the length prefix and JSON header of a snapshot, leaving the tensor
/// payload on disk. Offsets past the end of the file mean a truncated write.
fn read_header(path: &Path) -> Result<Metadata> {
    let corrupt = |reason: String| UtsuriError::CorruptCheckpoint {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)
        .map_err(|e| corrupt(format!("missing header length: {e}")))?;
    let header_len = u64::from_le_bytes(prefix);
    if header_len > MAX_HEADER_LEN || header_len + 8 > file_len {
        return Err(corrupt(format!(
            "header length {header_len} does not fit in a {file_len}-byte file"
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header).map_err(|e| corrupt(e.to_string()))?;
    let metadata: Metadata = serde_json::from_slice(&header).map_err(|e| corrupt(e.to_string()))?;

    let payload_len = file_len - 8 - header_len;
    let payload_end = metadata
        .tensors()
        .values()
        .map(|info| info.data_offsets.1 as u64)
        .max()
        .unwrap_or(0);
    if payload_end > payload_len {
        return Err(corrupt(format!(
            "tensor data ends at byte {payload_end} but the payload has {payload_len}"
        )));
    }
    Ok(metadata)
}

/// Map a file or model directory to a concrete snapshot file.
pub fn resolve_checkpoint(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_dir() {
        latest_checkpoint(path)
    } else if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(UtsuriError::CheckpointNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// Read the manifest of a model directory.
pub fn read_manifest(dir: impl AsRef<Path>) -> Result<CheckpointManifest> {
    let dir = dir.as_ref();
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(UtsuriError::CheckpointNotFound {
            path: dir.to_path_buf(),
        });
    }
    let content = fs::read_to_string(&manifest_path)?;
    serde_json::from_str(&content).map_err(|e| UtsuriError::CorruptCheckpoint {
        path: manifest_path,
        reason: e.to_string(),
    })
}

/// Most recent snapshot in a model directory.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let manifest = read_manifest(dir)?;
    let path = dir.join(&manifest.latest);
    if !path.is_file() {
        return Err(UtsuriError::CheckpointNotFound { path });
    }
    Ok(path)
}

/// Persist every parameter as the new latest snapshot of `dir`.
///
/// Creates `dir` if needed. Returns the snapshot path.
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    params: &ParamStore,
    pass: usize,
    score: f64,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let previous = read_manifest(dir).ok();
    let file_name = format!("model-{pass:04}.safetensors");
    let path = dir.join(&file_name);

    let tensors: HashMap<String, Tensor> = params.snapshot()?;
    let staging = dir.join(format!("{file_name}.tmp"));
    candle_core::safetensors::save(&tensors, &staging)?;
    fs::rename(&staging, &path)?;

    let manifest = CheckpointManifest {
        latest: file_name.clone(),
        pass,
        score,
    };
    let staging = dir.join(format!("{MANIFEST_FILE}.tmp"));
    fs::write(&staging, serde_json::to_string_pretty(&manifest)?)?;
    fs::rename(&staging, dir.join(MANIFEST_FILE))?;

    if let Some(previous) = previous.filter(|p| p.latest != file_name) {
        let stale = dir.join(&previous.latest);
        if stale.is_file() {
            fs::remove_file(&stale)?;
        }
    }

    info!(path = %path.display(), pass, score, "saved checkpoint");
    Ok(path)
}

/// Load every tensor of a snapshot onto `device`.
pub fn load_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = resolve_checkpoint(path)?;
    candle_core::safetensors::load(&path, device).map_err(|e| UtsuriError::CorruptCheckpoint {
        path,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Initializer, Partition};
    use tempfile::tempdir;

    fn store() -> ParamStore {
        let mut store = ParamStore::new(Device::Cpu, 3);
        store
            .declare("A", &[10], Partition::Base, Initializer::GlorotUniform)
            .unwrap();
        store
            .declare("proj/W", &[4, 3], Partition::Adaptation, Initializer::GlorotUniform)
            .unwrap();
        store
    }

    #[test]
    fn test_index_lists_names_and_shapes() {
        let dir = tempdir().unwrap();
        let path = save_checkpoint(dir.path(), &store(), 0, 0.5).unwrap();

        let index = list_checkpoint_variables(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index["A"].shape, vec![10]);
        assert_eq!(index["proj/W"].shape, vec![4, 3]);
        assert_eq!(index["A"].dtype, "F32");

        // Directory lookups go through the manifest.
        assert_eq!(list_checkpoint_variables(dir.path()).unwrap(), index);
    }

    #[test]
    fn test_missing_checkpoint_is_io_error() {
        let dir = tempdir().unwrap();
        let err = list_checkpoint_variables(dir.path().join("nope.safetensors")).unwrap_err();
        assert!(err.is_io());
        assert!(matches!(err, UtsuriError::CheckpointNotFound { .. }));

        // Empty model directory: no manifest.
        let err = latest_checkpoint(dir.path()).unwrap_err();
        assert!(matches!(err, UtsuriError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_corrupt_header_is_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        fs::write(&path, b"definitely not a safetensors header").unwrap();
        let err = list_checkpoint_variables(&path).unwrap_err();
        assert!(err.is_io());
        assert!(matches!(err, UtsuriError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = save_checkpoint(dir.path(), &store(), 0, 0.5).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let err = list_checkpoint_variables(&path).unwrap_err();
        assert!(matches!(err, UtsuriError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_short_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.safetensors");
        fs::write(&path, b"abc").unwrap();
        let err = list_checkpoint_variables(&path).unwrap_err();
        assert!(matches!(err, UtsuriError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_only_latest_snapshot_is_kept() {
        let dir = tempdir().unwrap();
        let params = store();
        let first = save_checkpoint(dir.path(), &params, 0, 0.5).unwrap();
        let second = save_checkpoint(dir.path(), &params, 1, 0.6).unwrap();

        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(latest_checkpoint(dir.path()).unwrap(), second);

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(manifest.pass, 1);
        assert_eq!(manifest.score, 0.6);
    }

    #[test]
    fn test_save_creates_model_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("results").join("model.weights");
        save_checkpoint(&nested, &store(), 3, 0.1).unwrap();
        assert!(nested.join(MANIFEST_FILE).is_file());
    }

    #[test]
    fn test_load_round_trips_values() {
        let dir = tempdir().unwrap();
        let params = store();
        let path = save_checkpoint(dir.path(), &params, 0, 0.0).unwrap();
        let loaded = load_checkpoint(&path, &Device::Cpu).unwrap();
        let saved = loaded["proj/W"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(saved, params.get("proj/W").unwrap().values().unwrap());
    }
}
