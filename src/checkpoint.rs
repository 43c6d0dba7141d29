use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RewindError;
use crate::state::FullState;

/// Upper bound on the decompressed size of a checkpoint we are willing to load.
const MAX_CHECKPOINT_BYTES: u64 = 10 << 20;
const CHECKPOINT_EXTENSION: &str = "json.zst";

/// Durable full-state checkpoints.
///
/// Layout: `<root>/<app dir>/<content hash>.json.zst`. The file name is derived
/// from the uncompressed payload, so identical states share one file and a
/// written file never changes. Files are never deleted here.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `state` and returns the storage reference (relative path with
    /// forward slashes) to record on the snapshot.
    pub fn spill(&self, state: &FullState) -> crate::Result<String> {
        let raw = serde_json::to_vec(state)?;
        let digest = Sha256::digest(&raw);
        let name = format!("{}.{}", hex::encode(&digest[..16]), CHECKPOINT_EXTENSION);
        let dir_name = app_dir_name(&state.app_id);
        let reference = format!("{}/{}", dir_name, name);

        let dir = self.root.join(&dir_name);
        fs::create_dir_all(&dir).map_err(|e| storage_error("create checkpoint directory", &dir, e))?;

        let path = dir.join(&name);
        if path.exists() {
            debug!("Checkpoint {} already present, reusing", reference);
            return Ok(reference);
        }

        let compressed = zstd::encode_all(raw.as_slice(), zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(|e| RewindError::Storage(format!("compress checkpoint {}: {}", reference, e)))?;
        atomic_write(&path, &compressed)?;
        debug!("Wrote checkpoint {} ({} -> {} bytes)", reference, raw.len(), compressed.len());
        Ok(reference)
    }

    pub fn load(&self, reference: &str) -> crate::Result<FullState> {
        let path = self.resolve_reference(reference)?;
        let file = fs::File::open(&path).map_err(|e| storage_error("open checkpoint", &path, e))?;
        let decoder = zstd::Decoder::new(file).map_err(|e| storage_error("open checkpoint stream", &path, e))?;

        let mut raw = Vec::new();
        decoder
            .take(MAX_CHECKPOINT_BYTES + 1)
            .read_to_end(&mut raw)
            .map_err(|e| storage_error("decompress checkpoint", &path, e))?;
        if raw.len() as u64 > MAX_CHECKPOINT_BYTES {
            return Err(RewindError::Storage(format!(
                "checkpoint {} exceeds {} bytes",
                reference, MAX_CHECKPOINT_BYTES
            )));
        }
        let state: FullState = serde_json::from_slice(&raw)
            .map_err(|e| RewindError::Storage(format!("decode checkpoint {}: {}", reference, e)))?;
        Ok(state)
    }

    fn resolve_reference(&self, reference: &str) -> crate::Result<PathBuf> {
        let mut path = self.root.clone();
        for part in reference.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(RewindError::Storage(format!("invalid checkpoint reference: {}", reference)));
            }
            path.push(part);
        }
        Ok(path)
    }
}

/// Directory name for an application id; ids contain `:` which some
/// filesystems reject.
fn app_dir_name(app_id: &str) -> String {
    app_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> RewindError {
    RewindError::Storage(format!("{} {}: {}", action, path.display(), err))
}

// Writes to a temporary sibling and renames into place so readers never see a
// partially written checkpoint.
fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    use rand::{thread_rng, Rng};

    let parent = path
        .parent()
        .ok_or_else(|| RewindError::Storage(format!("invalid checkpoint path: {}", path.display())))?;
    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".tmp_checkpoint.{}.tmp", suffix));

    fs::write(&tmp, bytes).map_err(|e| storage_error("write checkpoint", &tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(storage_error("finalize checkpoint", path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ObservedAppState, Rect, WindowDescriptor};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state() -> FullState {
        let mut s = ObservedAppState::new(r"C:\Apps\Editor.exe", 7);
        s.windows.push(WindowDescriptor::new(11, Rect::new(1, 2, 300, 400)));
        s.open_files.push(r"C:\notes.txt".into());
        s.plugin_data.insert("editor".into(), json!({"workspace": "notes"}));
        s
    }

    #[test]
    fn test_spill_and_load() {
        let tmp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp_dir.path());
        let state = sample_state();

        let reference = store.spill(&state).unwrap();
        assert!(reference.ends_with(".json.zst"));
        assert!(!reference.contains(':'));
        assert!(tmp_dir.path().join(&reference).exists());

        let loaded = store.load(&reference).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_identical_states_share_a_file() {
        let tmp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp_dir.path());
        let state = sample_state();

        let first = store.spill(&state).unwrap();
        let second = store.spill(&state).unwrap();
        assert_eq!(first, second);

        let dir = tmp_dir.path().join(first.split('/').next().unwrap());
        assert_eq!(fs::read_dir(dir).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_checkpoint_is_a_storage_error() {
        let tmp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp_dir.path());
        let err = store.load("editor.exe_0000/deadbeef.json.zst").unwrap_err();
        assert!(matches!(err, RewindError::Storage(_)));
    }

    #[test]
    fn test_reference_cannot_escape_root() {
        let tmp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp_dir.path());
        assert!(store.load("../outside.json.zst").is_err());
        assert!(store.load("a//b.json.zst").is_err());
    }

    #[test]
    fn test_spill_fails_when_root_is_a_file() {
        let tmp_dir = TempDir::new().unwrap();
        let blocker = tmp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let store = CheckpointStore::new(&blocker);
        let err = store.spill(&sample_state()).unwrap_err();
        assert!(matches!(err, RewindError::Storage(_)));
    }
}
