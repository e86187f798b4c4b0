use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How an IO descriptor moves its payload. Exactly one mode applies per IO:
/// a regular file transfer, no file at all, or a remote-side copy/update
/// that never touches the local filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    File,
    NoFile,
    Copy,
    Update,
}

impl TransferKind {
    /// True when a local file is transferred for this IO.
    pub fn has_file(self) -> bool {
        matches!(self, TransferKind::File)
    }
}

/// One named input, output, or predata file of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoDescriptor {
    /// Logical name; also the local filename inside the working directory.
    pub name: String,
    /// Base URL of the remote object store host.
    pub host: String,
    /// Remote node identifier.
    pub node: String,
    /// Optional subdirectory under the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Canonical upload filename; the local file is renamed to this before
    /// upload when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_filename: Option<String>,
    /// Companion attribute file, uploaded alongside outputs and written as
    /// local JSON for inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_file: Option<String>,
    pub transfer: TransferKind,
    /// Missing local file is skipped rather than failing the workunit.
    #[serde(default)]
    pub optional: bool,
    /// Zero-byte local file fails the workunit.
    #[serde(default)]
    pub nonzero: bool,
    /// Decompression to apply after download (e.g. "gzip").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompress: Option<String>,
    /// Secondary index to request on the remote node after upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Free-form upload form options. `parent_name` is resolved to a
    /// `parent_node` from the same-named input at upload time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub form_options: HashMap<String, String>,
    /// Metadata attached to the remote node on upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_attr: Option<serde_json::Value>,
}

impl IoDescriptor {
    /// A plain file transfer descriptor; the common case.
    pub fn file(
        name: impl Into<String>,
        host: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            node: node.into(),
            directory: None,
            store_filename: None,
            attr_file: None,
            transfer: TransferKind::File,
            optional: false,
            nonzero: false,
            uncompress: None,
            index: None,
            form_options: HashMap::new(),
            node_attr: None,
        }
    }

    pub fn with_transfer(mut self, transfer: TransferKind) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn nonzero(mut self) -> Self {
        self.nonzero = true;
        self
    }

    pub fn with_attr_file(mut self, attr_file: impl Into<String>) -> Self {
        self.attr_file = Some(attr_file.into());
        self
    }

    pub fn with_form_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form_options.insert(key.into(), value.into());
        self
    }

    /// Download URL for the whole object.
    pub fn data_url(&self) -> String {
        format!("{}/node/{}?download", self.host, self.node)
    }

    /// URL of the remote node itself.
    pub fn node_url(&self) -> String {
        format!("{}/node/{}", self.host, self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_format() {
        let io = IoDescriptor::file("reads.fq", "http://store.example.com:7445", "abc123");
        assert_eq!(
            io.data_url(),
            "http://store.example.com:7445/node/abc123?download"
        );
        assert_eq!(io.node_url(), "http://store.example.com:7445/node/abc123");
    }

    #[test]
    fn transfer_kind_has_file() {
        assert!(TransferKind::File.has_file());
        assert!(!TransferKind::NoFile.has_file());
        assert!(!TransferKind::Copy.has_file());
        assert!(!TransferKind::Update.has_file());
    }

    #[test]
    fn builders() {
        let io = IoDescriptor::file("out.txt", "http://h", "n1")
            .optional()
            .nonzero()
            .with_attr_file("out.txt.attr")
            .with_form_option("parent_name", "in.txt");
        assert!(io.optional);
        assert!(io.nonzero);
        assert_eq!(io.attr_file.as_deref(), Some("out.txt.attr"));
        assert_eq!(
            io.form_options.get("parent_name").map(String::as_str),
            Some("in.txt")
        );
    }
}
