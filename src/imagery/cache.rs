use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Fingerprint, ImageFormat};
use crate::{error::CacheError, scenario::validate_id};

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub fingerprint: Fingerprint,
    pub bytes: Bytes,
    pub format: ImageFormat,
}

/// Content-addressed image files under `<root>/<scenario>/<fingerprint>.<ext>`.
/// Entries are write-once: the first writer for a key wins.
pub struct ImageCache {
    root: PathBuf,
    max_entries_per_scenario: Option<usize>,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>, max_entries_per_scenario: Option<usize>) -> Self {
        Self { root: root.into(), max_entries_per_scenario }
    }

    fn scenario_dir(&self, scenario_id: &str) -> Result<PathBuf, CacheError> {
        validate_id(scenario_id).map_err(|_| CacheError::InvalidScenario(scenario_id.to_string()))?;
        Ok(self.root.join(scenario_id))
    }

    pub async fn get(&self, scenario_id: &str, fingerprint: &Fingerprint) -> Result<Option<CachedImage>, CacheError> {
        let dir = self.scenario_dir(scenario_id)?;
        for format in ImageFormat::CACHEABLE {
            let path = entry_path(&dir, fingerprint, format);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    return Ok(Some(CachedImage {
                        fingerprint: fingerprint.clone(),
                        bytes: Bytes::from(bytes),
                        format,
                    }))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Stores `bytes` unless the key already exists, and returns whatever the
    /// cache holds for the key afterwards.
    pub async fn put(
        &self,
        scenario_id: &str,
        fingerprint: &Fingerprint,
        bytes: Bytes,
        format: ImageFormat,
    ) -> Result<CachedImage, CacheError> {
        if let Some(existing) = self.get(scenario_id, fingerprint).await? {
            return Ok(existing);
        }

        let dir = self.scenario_dir(scenario_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = entry_path(&dir, fingerprint, format);
        let tmp_path = dir.join(format!(".{}.{}.tmp", fingerprint, Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &bytes).await?;

        // A hard link only succeeds when the target is absent, which makes the
        // publish step create-if-missing.
        let linked = tokio::fs::hard_link(&tmp_path, &final_path).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let stored = match linked {
            Ok(()) => {
                info!("💾 Cached image {}", final_path.display());
                CachedImage { fingerprint: fingerprint.clone(), bytes, format }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Lost cache write race for {}", fingerprint);
                let existing = tokio::fs::read(&final_path).await?;
                CachedImage { fingerprint: fingerprint.clone(), bytes: Bytes::from(existing), format }
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(max) = self.max_entries_per_scenario {
            self.evict_oldest(&dir, max).await?;
        }
        Ok(stored)
    }

    async fn evict_oldest(&self, dir: &Path, max: usize) -> Result<(), CacheError> {
        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if is_tmp {
                continue;
            }
            let modified = entry.metadata().await?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, path));
        }

        if entries.len() <= max {
            return Ok(());
        }
        entries.sort();
        let excess = entries.len() - max;
        for (_, path) in entries.into_iter().take(excess) {
            info!("🧹 Evicting cached image {}", path.display());
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn entry_path(dir: &Path, fingerprint: &Fingerprint, format: ImageFormat) -> PathBuf {
    dir.join(format!("{}.{}", fingerprint, format.extension()))
}
