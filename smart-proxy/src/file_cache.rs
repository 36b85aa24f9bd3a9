use crate::cache::StrategyCache;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::PoisonError;
use std::sync::RwLock;
use tracing::warn;

const STRATEGY_FILE_VERSION: u8 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StrategyFile {
    version: u8,
    strategies: BTreeMap<String, String>,
}

/// Strategy cache persisted as JSON so discovered strategies survive restarts.
///
/// Reads are served from memory. Every mutation rewrites the whole file through a temp file and
/// rename, so a crash never leaves a half-written cache behind. `put` blocks on that file I/O;
/// the resolver issues its writes from the blocking pool.
pub struct FileStrategyCache {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStrategyCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load_strategies(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let file = StrategyFile {
            version: STRATEGY_FILE_VERSION,
            strategies: entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&file).context("failed to serialize strategies")?;
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.write_all(&json)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            tmp.sync_all()
                .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileStrategyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStrategyCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StrategyCache for FileStrategyCache {
    fn get(&self, key: &str) -> String {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn put(&self, key: &str, value: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let changed = if value.is_empty() {
            entries.remove(key).is_some()
        } else {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if !changed {
            return;
        }
        // Persist while holding the write lock so file order matches memory order.
        if let Err(err) = self.persist(&entries) {
            let path = self.path.display();
            warn!("failed to persist strategy cache to {path}: {err:#}");
        }
    }
}

fn load_strategies(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read(path)
        .with_context(|| format!("failed to read strategy cache at {}", path.display()))?;
    let mut parsed: StrategyFile = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse strategy cache at {}", path.display()))?;
    anyhow::ensure!(
        parsed.version <= STRATEGY_FILE_VERSION,
        "strategy cache version {} is newer than supported version {}",
        parsed.version,
        STRATEGY_FILE_VERSION
    );
    parsed.strategies.retain(|_, value| !value.is_empty());
    Ok(parsed.strategies)
}
