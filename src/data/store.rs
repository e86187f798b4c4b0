use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, SchedulerError};
use crate::model::TransferKind;

/// Metadata of a remote node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Everything needed to push one file (or a remote-side copy/update) to the
/// object store. The form options are opaque to the scheduler.
#[derive(Debug, Clone)]
pub struct PutFileRequest {
    pub host: String,
    pub node: String,
    pub rank: u32,
    /// Local file to upload; None for no-file and copy/update IOs.
    pub file: Option<PathBuf>,
    /// Companion attribute file, already checked present and non-empty.
    pub attr_file: Option<PathBuf>,
    pub transfer: TransferKind,
    pub form_options: HashMap<String, String>,
    pub node_attr: Option<serde_json::Value>,
    pub token: Option<String>,
}

/// Client side of the remote object store protocol. The wire format is the
/// store's own contract; this seam exists so the data mover can be exercised
/// against an in-memory store in tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download `url` into `dest`, optionally decompressing. Returns the
    /// number of bytes moved over the network.
    async fn fetch(
        &self,
        url: &str,
        token: Option<&str>,
        dest: &Path,
        uncompress: Option<&str>,
    ) -> Result<u64>;

    async fn put_file(&self, req: &PutFileRequest) -> Result<()>;

    async fn node_info(&self, host: &str, node: &str, token: Option<&str>) -> Result<NodeInfo>;

    /// Ask the store to build a secondary index on a node.
    async fn build_index(
        &self,
        host: &str,
        node: &str,
        index: &str,
        token: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct NodeEnvelope {
    data: NodeInfo,
}

/// HTTP implementation of the object store protocol. Tokens travel as
/// bearer-style `Authorization: OAuth <token>` headers.
pub struct HttpObjectStore {
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn authorized(
        &self,
        req: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match token {
            Some(t) => req.header("Authorization", format!("OAuth {t}")),
            None => req,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(
        &self,
        url: &str,
        token: Option<&str>,
        dest: &Path,
        uncompress: Option<&str>,
    ) -> Result<u64> {
        let resp = self.authorized(self.client.get(url), token).send().await?;
        if !resp.status().is_success() {
            return Err(SchedulerError::Store(format!(
                "fetch {url}: status {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?;
        let moved = body.len() as u64;
        let data = match uncompress {
            Some("gzip") => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(|e| {
                    SchedulerError::Store(format!("fetch {url}: gzip decode: {e}"))
                })?;
                out
            }
            Some(other) => {
                return Err(SchedulerError::Store(format!(
                    "fetch {url}: unsupported compression {other}"
                )))
            }
            None => body.to_vec(),
        };
        tokio::fs::write(dest, data).await?;
        Ok(moved)
    }

    async fn put_file(&self, req: &PutFileRequest) -> Result<()> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in &req.form_options {
            form = form.text(key.clone(), value.clone());
        }
        if let Some(attr) = &req.node_attr {
            form = form.text("attributes_str", attr.to_string());
        }
        if let Some(attr_path) = &req.attr_file {
            let bytes = tokio::fs::read(attr_path).await?;
            form = form.part(
                "attributes",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name_of(attr_path)),
            );
        }
        if let Some(path) = &req.file {
            let bytes = tokio::fs::read(path).await?;
            // partial uploads of a partitioned task are keyed by rank
            let part_name = if req.rank > 0 {
                req.rank.to_string()
            } else {
                "upload".to_string()
            };
            form = form.part(
                part_name,
                reqwest::multipart::Part::bytes(bytes).file_name(file_name_of(path)),
            );
        }

        let url = format!("{}/node/{}", req.host, req.node);
        let resp = self
            .authorized(self.client.put(&url), req.token.as_deref())
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SchedulerError::Store(format!(
                "put {url}: status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn node_info(&self, host: &str, node: &str, token: Option<&str>) -> Result<NodeInfo> {
        let url = format!("{host}/node/{node}");
        let resp = self.authorized(self.client.get(&url), token).send().await?;
        if !resp.status().is_success() {
            return Err(SchedulerError::Store(format!(
                "get {url}: status {}",
                resp.status()
            )));
        }
        let envelope: NodeEnvelope = resp.json().await?;
        Ok(envelope.data)
    }

    async fn build_index(
        &self,
        host: &str,
        node: &str,
        index: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let url = format!("{host}/node/{node}/index/{index}");
        let resp = self.authorized(self.client.put(&url), token).send().await?;
        if !resp.status().is_success() {
            return Err(SchedulerError::Store(format!(
                "put {url}: status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}
