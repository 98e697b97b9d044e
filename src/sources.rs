//! Document sources.
//!
//! A [`DocumentSource`] advertises documents and returns their raw bytes.
//! Text extraction happens later in the pipeline, so sources never look at
//! content.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::config::Config;
use crate::connector_drive::DriveSource;
use crate::connector_fs::FilesystemSource;
use crate::models::DocumentRef;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Short connector name used in logs and `hrag sources`.
    fn name(&self) -> &str;

    /// Every document currently available, sorted by `source_id`.
    async fn list_documents(&self) -> Result<Vec<DocumentRef>>;

    /// Raw bytes of one listed document.
    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>>;
}

/// Build every configured connector. Connectors that cannot start (missing
/// root, missing credentials) are skipped with a warning.
pub fn build_sources(config: &Config) -> Vec<Arc<dyn DocumentSource>> {
    let mut sources: Vec<Arc<dyn DocumentSource>> = Vec::new();

    if let Some(fs_config) = &config.connectors.filesystem {
        match FilesystemSource::new(fs_config) {
            Ok(source) => sources.push(Arc::new(source)),
            Err(e) => warn!(connector = "filesystem", error = %e, "Skipping connector"),
        }
    }

    if let Some(drive_config) = &config.connectors.drive {
        match DriveSource::new(drive_config) {
            Ok(source) => sources.push(Arc::new(source)),
            Err(e) => warn!(connector = "drive", error = %e, "Skipping connector"),
        }
    }

    sources
}

pub fn list_sources(config: &Config) -> Result<()> {
    let fs_status = match &config.connectors.filesystem {
        Some(fs_config) => {
            if fs_config.root.exists() {
                ("OK", true)
            } else {
                ("NOT CONFIGURED (root does not exist)", false)
            }
        }
        None => ("NOT CONFIGURED", false),
    };

    let drive_status = match &config.connectors.drive {
        Some(_) => {
            if std::env::var("GOOGLE_DRIVE_TOKEN").is_ok() {
                ("OK", true)
            } else {
                ("NOT CONFIGURED (GOOGLE_DRIVE_TOKEN unset)", false)
            }
        }
        None => ("NOT CONFIGURED", false),
    };

    println!("{:<16} {:<12} HEALTHY", "CONNECTOR", "STATUS");
    println!("{:<16} {:<12} {}", "filesystem", fs_status.0, fs_status.1);
    println!("{:<16} {:<12} {}", "drive", drive_status.0, drive_status.1);

    Ok(())
}

/// A source held entirely in memory. Used by tests and by callers that
/// already have document bytes at hand.
#[derive(Default)]
pub struct InMemorySource {
    docs: Mutex<BTreeMap<String, (DocumentRef, Vec<u8>)>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn put(&self, doc: DocumentRef, bytes: impl Into<Vec<u8>>) {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.source_id.clone(), (doc, bytes.into()));
    }

    /// Convenience for plain-text documents.
    pub fn put_text(&self, source_id: &str, text: &str) {
        self.put(
            DocumentRef {
                source_id: source_id.to_string(),
                filename: source_id.to_string(),
                source_url: None,
                content_type: crate::extract::MIME_TEXT.to_string(),
            },
            text.as_bytes().to_vec(),
        );
    }

    pub fn remove(&self, source_id: &str) {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source_id);
    }
}

#[async_trait]
impl DocumentSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRef>> {
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|(doc, _)| doc.clone())
            .collect())
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        match self
            .docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&doc.source_id)
        {
            Some((_, bytes)) => Ok(bytes.clone()),
            None => bail!("document not found: {}", doc.source_id),
        }
    }
}
