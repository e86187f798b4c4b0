use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::data::cache::Cache;
use crate::data::store::{ObjectStore, PutFileRequest};
use crate::error::{Result, SchedulerError};
use crate::model::{IoDescriptor, Workunit};

/// Stages workunit inputs into the working directory and commits outputs to
/// the remote store, going through the local cache on both sides.
///
/// The mover only reads workunit and IO data; it never touches scheduling
/// state. All of its network calls happen in the context of a leased
/// workunit, outside the scheduler lock.
pub struct DataMover {
    store: Arc<dyn ObjectStore>,
    cache: Option<Cache>,
    work_root: PathBuf,
    upload_retry_backoff: Duration,
}

impl DataMover {
    pub fn new(store: Arc<dyn ObjectStore>, config: &SchedulerConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Cache::new(config.cache.data_root.clone()));
        Self {
            store,
            cache,
            work_root: config.work_root.clone(),
            upload_retry_backoff: config.upload_retry_backoff,
        }
    }

    /// Create the unit's working directory, wiping any leftover from a
    /// previous attempt.
    pub async fn prepare_work_dir(&self, work: &Workunit) -> Result<PathBuf> {
        let dir = work.work_dir(&self.work_root);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Stage every input (and predata) file of the workunit into its working
    /// directory. Rank 0 consults the cache first and links on a hit; any
    /// other rank always fetches its partition. Returns total bytes moved
    /// over the network. The first hard error aborts the phase; bytes already
    /// moved ride along on the error (`SchedulerError::bytes_moved`).
    pub async fn stage_inputs(&self, work: &Workunit) -> Result<u64> {
        let work_dir = work.work_dir(&self.work_root);
        let mut moved = 0;
        for io in &work.inputs {
            match self.stage_one(work, io, &work_dir, work.id.rank).await {
                Ok(n) => moved += n,
                Err(e) => return Err(self.abort_phase(work, "stage", moved, e)),
            }
        }
        // predata is shared reference data, never partitioned
        for io in &work.predata {
            match self.stage_one(work, io, &work_dir, 0).await {
                Ok(n) => moved += n,
                Err(e) => return Err(self.abort_phase(work, "stage", moved, e)),
            }
        }
        Ok(moved)
    }

    /// Log a data-phase abort with the bytes moved so far and attach the
    /// count to the error.
    fn abort_phase(
        &self,
        work: &Workunit,
        phase: &str,
        bytes: u64,
        err: SchedulerError,
    ) -> SchedulerError {
        tracing::warn!(workunit = %work.id, phase, bytes, error = %err, "Data phase aborted");
        err.with_bytes_moved(bytes)
    }

    async fn stage_one(
        &self,
        work: &Workunit,
        io: &IoDescriptor,
        work_dir: &Path,
        rank: u32,
    ) -> Result<u64> {
        let mut moved = 0;
        if io.transfer.has_file() {
            let dest = work_dir.join(&io.name);
            let cache_hit = if rank == 0 {
                self.cache
                    .as_ref()
                    .filter(|c| c.lookup(&io.node).is_some())
            } else {
                None
            };
            match cache_hit {
                Some(cache) => {
                    // cache hit: link instead of transferring
                    cache.link_into(&io.node, &dest)?;
                    tracing::info!(workunit = %work.id, file = %io.name, "Input staged from cache");
                }
                None => {
                    let url = if rank == 0 {
                        io.data_url()
                    } else {
                        format!(
                            "{}&index={}&part={}",
                            io.data_url(),
                            work.index_type(),
                            work.part()
                        )
                    };
                    tracing::debug!(workunit = %work.id, url = %url, "Fetching input");
                    let n = self
                        .store
                        .fetch(&url, work.data_token.as_deref(), &dest, io.uncompress.as_deref())
                        .await
                        .map_err(|e| {
                            SchedulerError::transfer(
                                work.id.to_string(),
                                &io.name,
                                &url,
                                e.to_string(),
                            )
                        })?;
                    moved += n;
                    tracing::info!(workunit = %work.id, file = %io.name, bytes = n, "Input staged");
                }
            }
        }

        // companion attribute file: write the remote node's metadata as JSON
        if let Some(attr_file) = &io.attr_file {
            let node = self
                .store
                .node_info(&io.host, &io.node, work.data_token.as_deref())
                .await
                .map_err(|e| {
                    SchedulerError::transfer(
                        work.id.to_string(),
                        attr_file,
                        io.node_url(),
                        e.to_string(),
                    )
                })?;
            let attr_path = work_dir.join(attr_file);
            let json = serde_json::to_vec(&node.attributes)?;
            tokio::fs::write(&attr_path, json).await?;
            tracing::debug!(workunit = %work.id, path = %attr_path.display(), "Input attributes written");
        }
        Ok(moved)
    }

    /// Commit every declared output of the workunit to the remote store,
    /// then relocate uploaded files into the cache when caching is enabled.
    /// Returns total bytes committed. The first hard error aborts the phase;
    /// bytes already committed ride along on the error.
    pub async fn commit_outputs(&self, work: &Workunit) -> Result<u64> {
        let work_dir = work.work_dir(&self.work_root);
        let mut committed = 0;
        for io in &work.outputs {
            match self.commit_one(work, io, &work_dir).await {
                Ok(n) => committed += n,
                Err(e) => return Err(self.abort_phase(work, "commit", committed, e)),
            }
        }
        Ok(committed)
    }

    async fn commit_one(&self, work: &Workunit, io: &IoDescriptor, work_dir: &Path) -> Result<u64> {
        let local_path = match &io.directory {
            Some(dir) => work_dir.join(dir).join(&io.name),
            None => work_dir.join(&io.name),
        };
        // rename to the canonical upload filename when one is declared
        let upload_path = match &io.store_filename {
            Some(name) => {
                let renamed = local_path.with_file_name(name);
                if local_path.exists() {
                    tokio::fs::rename(&local_path, &renamed).await?;
                }
                renamed
            }
            None => local_path,
        };

        let mut bytes = 0;
        let file = if io.transfer.has_file() {
            match tokio::fs::metadata(&upload_path).await {
                Err(_) if io.optional => {
                    tracing::debug!(workunit = %work.id, file = %io.name, "Optional output missing, skipped");
                    return Ok(0);
                }
                Err(_) => {
                    return Err(SchedulerError::data_integrity(
                        work.id.to_string(),
                        format!("output {} not generated", io.name),
                    ));
                }
                Ok(meta) if io.nonzero && meta.len() == 0 => {
                    return Err(SchedulerError::data_integrity(
                        work.id.to_string(),
                        format!("output {} is zero-sized but non-zero required", io.name),
                    ));
                }
                Ok(meta) => {
                    bytes = meta.len();
                    Some(upload_path.clone())
                }
            }
        } else {
            None
        };

        // attribute file uploads only when present and non-empty
        let attr_file = match &io.attr_file {
            Some(name) => {
                let path = work_dir.join(name);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() > 0 => Some(path),
                    _ => None,
                }
            }
            None => None,
        };

        let mut form_options = io.form_options.clone();
        if let Some(parent_name) = form_options.get("parent_name").cloned() {
            if let Some(parent) = work.inputs.iter().find(|i| i.name == parent_name) {
                form_options.insert("parent_node".to_string(), parent.node.clone());
            }
        }

        let req = PutFileRequest {
            host: io.host.clone(),
            node: io.node.clone(),
            rank: work.id.rank,
            file,
            attr_file,
            transfer: io.transfer,
            form_options,
            node_attr: io.node_attr.clone(),
            token: work.data_token.clone(),
        };

        tracing::info!(workunit = %work.id, file = %io.name, node = %io.node, "Pushing output");
        if let Err(first) = self.store.put_file(&req).await {
            // only transient store failures get the single retry
            if !first.is_transient() {
                return Err(SchedulerError::transfer(
                    work.id.to_string(),
                    &io.name,
                    io.node_url(),
                    first.to_string(),
                ));
            }
            tracing::warn!(workunit = %work.id, file = %io.name, error = %first, "Upload failed, retrying once");
            tokio::time::sleep(self.upload_retry_backoff).await;
            self.store.put_file(&req).await.map_err(|e| {
                SchedulerError::transfer(
                    work.id.to_string(),
                    &io.name,
                    io.node_url(),
                    e.to_string(),
                )
            })?;
        }

        // secondary index build is best-effort
        if let Some(index) = &io.index {
            if let Err(e) = self
                .store
                .build_index(&io.host, &io.node, index, work.data_token.as_deref())
                .await
            {
                tracing::error!(workunit = %work.id, node = %io.node, index = %index, error = %e, "Index build failed");
            }
        }

        // relocate the uploaded file into the cache; failure is not fatal
        if let (Some(cache), Some(path)) = (&self.cache, &req.file) {
            if let Err(e) = cache.insert(path, &io.node) {
                tracing::error!(workunit = %work.id, node = %io.node, error = %e, "Cache insert failed");
            }
        }
        Ok(bytes)
    }
}
