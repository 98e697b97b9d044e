use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::extract::content_type_for;
use crate::models::DocumentRef;
use crate::sources::DocumentSource;

/// Documents under a local directory, identified by their relative path.
pub struct FilesystemSource {
    root: PathBuf,
    include_set: GlobSet,
    exclude_set: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemSource {
    pub fn new(config: &FilesystemConnectorConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!(
                "Filesystem connector root does not exist: {}",
                config.root.display()
            );
        }

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: config.root.clone(),
            include_set: build_globset(&config.include_globs)?,
            exclude_set: build_globset(&default_excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn scan(&self) -> Result<Vec<DocumentRef>> {
        let mut docs = Vec::new();

        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            // Glob and id matching use forward slashes on every platform.
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude_set.is_match(&rel_str) || !self.include_set.is_match(&rel_str) {
                continue;
            }

            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| rel_str.clone());
            let content_type = content_type_for(&filename)
                .unwrap_or("application/octet-stream")
                .to_string();

            docs.push(DocumentRef {
                source_id: rel_str,
                filename,
                source_url: None,
                content_type,
            });
        }

        // Sort for deterministic ordering
        docs.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        Ok(docs)
    }
}

#[async_trait]
impl DocumentSource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRef>> {
        self.scan()
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        let path = self.root.join(&doc.source_id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: PathBuf) -> FilesystemConnectorConfig {
        FilesystemConnectorConfig {
            root,
            include_globs: vec!["**/*.pdf".to_string(), "**/*.txt".to_string()],
            exclude_globs: vec!["drafts/**".to_string()],
            follow_symlinks: false,
        }
    }

    #[tokio::test]
    async fn test_lists_matching_files_sorted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("reports")).unwrap();
        std::fs::create_dir_all(root.join("drafts")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("reports/q2.pdf"), b"%PDF").unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::write(root.join("image.png"), b"png").unwrap();
        std::fs::write(root.join("drafts/wip.pdf"), b"%PDF").unwrap();
        std::fs::write(root.join(".git/config.txt"), b"x").unwrap();

        let source = FilesystemSource::new(&config(root.to_path_buf())).unwrap();
        let docs = source.list_documents().await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "reports/q2.pdf"]);
        assert_eq!(docs[1].filename, "q2.pdf");
        assert_eq!(docs[1].content_type, "application/pdf");

        let bytes = source.fetch(&docs[0]).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let result = FilesystemSource::new(&config(PathBuf::from("/definitely/not/here")));
        assert!(result.is_err());
    }
}
