//! Google Drive connector.
//!
//! Lists the files of one Drive folder (optionally descending into
//! sub-folders) through the Drive v3 REST API and downloads them with
//! `alt=media`. Authentication is a bearer token from
//! `GOOGLE_DRIVE_TOKEN`; token acquisition is left to the caller.
//!
//! Documents are identified as `gdrive:<file id>` and carry the Drive web
//! link as their `source_url`, which flows into citations.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::DriveConnectorConfig;
use crate::extract::{MIME_MARKDOWN, MIME_PDF, MIME_TEXT};
use crate::models::DocumentRef;
use crate::sources::DocumentSource;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ID_PREFIX: &str = "gdrive:";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    web_view_link: Option<String>,
}

pub struct DriveSource {
    client: reqwest::Client,
    api_base: String,
    folder_id: String,
    recursive: bool,
    token: String,
}

impl DriveSource {
    /// Build from config, reading the token from `GOOGLE_DRIVE_TOKEN`.
    pub fn new(config: &DriveConnectorConfig) -> Result<Self> {
        let token = std::env::var("GOOGLE_DRIVE_TOKEN")
            .context("GOOGLE_DRIVE_TOKEN is not set")?;
        Self::with_token(config, token)
    }

    pub fn with_token(config: &DriveConnectorConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            folder_id: config.folder_id.clone(),
            recursive: config.recursive,
            token,
        })
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("q", folder_query(folder_id)),
                (
                    "fields",
                    "nextPageToken,files(id,name,mimeType,webViewLink)".to_string(),
                ),
                ("pageSize", "1000".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(format!("{}/files", self.api_base))
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await
                .context("Drive files.list request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("Drive files.list error {}: {}", status, body);
            }

            let page: FileList = response
                .json()
                .await
                .context("Invalid Drive files.list response")?;
            debug!(folder_id, files = page.files.len(), "Listed Drive page");
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }
}

fn folder_query(folder_id: &str) -> String {
    format!(
        "'{}' in parents and trashed = false",
        folder_id.replace('\\', "\\\\").replace('\'', "\\'")
    )
}

fn supported_mime(mime: &str) -> Option<&'static str> {
    match mime {
        MIME_PDF => Some(MIME_PDF),
        MIME_TEXT => Some(MIME_TEXT),
        MIME_MARKDOWN => Some(MIME_MARKDOWN),
        _ => None,
    }
}

fn to_document(file: DriveFile) -> Option<DocumentRef> {
    let content_type = supported_mime(&file.mime_type)?;
    let source_url = file
        .web_view_link
        .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id));
    Some(DocumentRef {
        source_id: format!("{}{}", ID_PREFIX, file.id),
        filename: file.name,
        source_url: Some(source_url),
        content_type: content_type.to_string(),
    })
}

#[async_trait]
impl DocumentSource for DriveSource {
    fn name(&self) -> &str {
        "drive"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRef>> {
        let mut docs = Vec::new();
        let mut folders = vec![self.folder_id.clone()];
        let mut seen = std::collections::HashSet::new();

        while let Some(folder) = folders.pop() {
            if !seen.insert(folder.clone()) {
                continue;
            }
            for file in self.list_folder(&folder).await? {
                if file.mime_type == FOLDER_MIME {
                    if self.recursive {
                        folders.push(file.id);
                    }
                    continue;
                }
                if let Some(doc) = to_document(file) {
                    docs.push(doc);
                }
            }
        }

        docs.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(docs)
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        let Some(file_id) = doc.source_id.strip_prefix(ID_PREFIX) else {
            bail!("Not a Drive document: {}", doc.source_id);
        };
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await
            .with_context(|| format!("Drive download failed for {}", doc.source_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Drive download error {} for {}: {}", status, doc.source_id, body);
        }
        Ok(response.bytes().await?.to_vec())
    }
}
