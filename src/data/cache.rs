use std::path::{Path, PathBuf};

use crate::error::Result;

/// Local mirror of remote objects, keyed by remote node id.
///
/// Files shard into a three-level tree derived from the id's first six
/// characters, the same naming the remote store uses server-side:
/// `<root>/<id[0:2]>/<id[2:4]>/<id[4:6]>/<id>/<id>.data`. Ids shorter than
/// six characters fall back to the unsharded root.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, id: &str) -> PathBuf {
        if id.len() < 6 {
            return self.root.clone();
        }
        self.root
            .join(&id[0..2])
            .join(&id[2..4])
            .join(&id[4..6])
            .join(id)
    }

    pub fn file_for(&self, id: &str) -> PathBuf {
        self.dir_for(id).join(format!("{id}.data"))
    }

    /// Path of the cached file if it exists.
    pub fn lookup(&self, id: &str) -> Option<PathBuf> {
        let path = self.file_for(id);
        path.is_file().then_some(path)
    }

    /// Move a local file into the cache under `id`. Returns the cache path.
    pub fn insert(&self, src: &Path, id: &str) -> Result<PathBuf> {
        let dir = self.dir_for(id);
        std::fs::create_dir_all(&dir)?;
        let dest = self.file_for(id);
        std::fs::rename(src, &dest)?;
        tracing::debug!(id, path = %dest.display(), "File moved into cache");
        Ok(dest)
    }

    /// Symlink the cached file for `id` into `dest`, instead of transferring.
    pub fn link_into(&self, id: &str, dest: &Path) -> Result<PathBuf> {
        let cached = self.file_for(id);
        std::os::unix::fs::symlink(&cached, dest)?;
        tracing::debug!(id, link = %dest.display(), "Cache hit, linked into work dir");
        Ok(cached)
    }
}
