//! Durable TaskResult records.
//!
//! Epistemic foundation:
//! - K_i: One record per (chunk, stage), written once, never overwritten
//! - K_i: Records land via temp file + rename, so readers never see a torn one
//! - B_i: A record may already exist from an interrupted run → persist is a no-op

use crate::checkpoint::write_atomic;
use crate::graph::StageName;
use crate::models::{PipelineError, Result, TaskResult};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable store of stage outputs keyed by (chunk index, stage name).
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Durably store a result. Returns `false` if one already existed for
    /// the key, in which case the stored record is left untouched.
    async fn persist(&self, result: &TaskResult) -> Result<bool>;

    /// Fetch the stored result for a pair.
    async fn get(&self, chunk_index: usize, stage_name: &StageName) -> Result<Option<TaskResult>>;

    /// All stored results, ordered by chunk index then stage name.
    async fn list(&self) -> Result<Vec<TaskResult>>;

    /// Whether a result exists for the pair.
    async fn contains(&self, chunk_index: usize, stage_name: &StageName) -> Result<bool> {
        Ok(self.get(chunk_index, stage_name).await?.is_some())
    }
}

/// One JSON file per result under `<run dir>/results/`.
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    /// Open (creating if needed) the results directory.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| PipelineError::storage("creating results dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, chunk_index: usize, stage_name: &StageName) -> PathBuf {
        self.dir
            .join(format!("{chunk_index:06}_{}.json", file_key(stage_name)))
    }
}

/// Escape a stage name into a portable file-name component.
///
/// Letters, digits, `_` and `-` pass through; every other byte becomes
/// `%XX`, so distinct names always map to distinct keys.
fn file_key(stage_name: &StageName) -> String {
    let mut key = String::with_capacity(stage_name.as_str().len());
    for c in stage_name.as_str().chars() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            key.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                key.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    key
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn persist(&self, result: &TaskResult) -> Result<bool> {
        let path = self.path_for(result.chunk_index, &result.stage_name);
        if path.exists() {
            debug!(
                chunk = result.chunk_index,
                stage = %result.stage_name,
                "Result already persisted"
            );
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(result)
            .map_err(|e| PipelineError::Serialization(format!("task result: {e}")))?;
        write_atomic(&path, &bytes)?;

        debug!(chunk = result.chunk_index, stage = %result.stage_name, "Result persisted");
        Ok(true)
    }

    async fn get(&self, chunk_index: usize, stage_name: &StageName) -> Result<Option<TaskResult>> {
        let path = self.path_for(chunk_index, stage_name);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::storage(format!("reading {}", path.display()), e)),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| PipelineError::CorruptState(format!("{}: {e}", path.display())))
    }

    async fn list(&self) -> Result<Vec<TaskResult>> {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = Path::new(&dir).join("[0-9]*_*.json");
        let pattern_str = pattern.to_string_lossy();

        let paths: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| PipelineError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read(&path)
                .map_err(|e| PipelineError::storage(format!("reading {}", path.display()), e))?;
            let result: TaskResult = serde_json::from_slice(&content)
                .map_err(|e| PipelineError::CorruptState(format!("{}: {e}", path.display())))?;
            results.push(result);
        }

        results.sort_by(|a, b| {
            (a.chunk_index, &a.stage_name).cmp(&(b.chunk_index, &b.stage_name))
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(chunk: usize, stage: &str, text: &str) -> TaskResult {
        TaskResult::new(chunk, StageName::new(stage).unwrap(), text.to_string())
    }

    #[tokio::test]
    async fn test_persist_and_get() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path()).unwrap();

        assert!(store.persist(&result(2, "Risk", "ok")).await.unwrap());
        assert!(dir.path().join("000002_Risk.json").exists());

        let stage = StageName::new("Risk").unwrap();
        let stored = store.get(2, &stage).await.unwrap().unwrap();
        assert_eq!(stored.output_text, "ok");
        assert!(store.contains(2, &stage).await.unwrap());
        assert!(store.get(3, &stage).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path()).unwrap();

        assert!(store.persist(&result(0, "A", "first")).await.unwrap());
        assert!(!store.persist(&result(0, "A", "second")).await.unwrap());

        let stored = store
            .get(0, &StageName::new("A").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.output_text, "first");
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path()).unwrap();

        store.persist(&result(10, "B", "x")).await.unwrap();
        store.persist(&result(2, "C", "x")).await.unwrap();
        store.persist(&result(2, "A", "x")).await.unwrap();

        let keys: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.chunk_index, r.stage_name.to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![(2, "A".to_string()), (2, "C".to_string()), (10, "B".to_string())]
        );
    }

    #[test]
    fn test_file_key_escapes_separators() {
        let key = |name: &str| file_key(&StageName::new(name).unwrap());
        assert_eq!(key("Risk_Factors-v2"), "Risk_Factors-v2");
        assert_eq!(key("Financial Statements"), "Financial%20Statements");
        assert_eq!(key("a/b"), "a%2Fb");
        assert_eq!(key("../up"), "%2E%2E%2Fup");
        assert_ne!(key("a b"), key("a%20b"));
    }

    #[tokio::test]
    async fn test_spaced_stage_names_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path()).unwrap();

        assert!(store.persist(&result(1, "Financial Statements Expert", "ok")).await.unwrap());
        assert!(store.persist(&result(1, "Risk/Factors", "ok")).await.unwrap());
        assert!(dir.path().join("000001_Financial%20Statements%20Expert.json").exists());

        let stage = StageName::new("Risk/Factors").unwrap();
        assert_eq!(store.get(1, &stage).await.unwrap().unwrap().output_text, "ok");
        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.stage_name.to_string())
            .collect();
        assert_eq!(names, vec!["Financial Statements Expert", "Risk/Factors"]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileResultStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("000000_A.json"), "nope").unwrap();

        let err = store.list().await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptState(_)));
    }
}
