//! Local filesystem provider
//!
//! Serves a media library from a directory on disk, published under a fixed
//! base URL. Directory scanning and file timestamps are the only metadata.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::info;

use super::paths;
use super::{
    prepare_upload, DeleteResult, FileEntry, FileListResult, FolderEntry, LocalConfig, MediaOptions, ProviderError,
    ProviderType, StorageProvider, UploadResult,
};

const MAX_PATH_LEN: usize = 4096;

pub struct LocalProvider {
    config: LocalConfig,
    options: MediaOptions,
}

impl LocalProvider {
    pub fn new(config: LocalConfig, options: MediaOptions) -> Self {
        Self { config, options }
    }

    /// Resolve a relative key below the media root, rejecting traversal
    fn resolve(&self, relative: &str) -> Result<(String, PathBuf), ProviderError> {
        if relative.len() > MAX_PATH_LEN {
            return Err(ProviderError::InvalidArgument("Path exceeds 4096 character limit".to_string()));
        }
        if relative.contains('\0') {
            return Err(ProviderError::InvalidArgument("Path contains null bytes".to_string()));
        }
        let normalized = paths::normalize_dir(relative)?;
        let full = if normalized.is_empty() {
            self.config.root.clone()
        } else {
            self.config.root.join(&normalized)
        };
        Ok((normalized, full))
    }

    fn url_for(&self, key: &str) -> String {
        paths::public_url(&self.config.base_url, key)
    }

    fn key_for(&self, url: &str, provider_key: Option<&str>) -> Result<(String, PathBuf), ProviderError> {
        let key = paths::resolve_key(url, provider_key, &self.config.base_url)?;
        let (key, path) = self.resolve(&key)?;
        if key.is_empty() {
            return Err(ProviderError::InvalidArgument("File key is empty".to_string()));
        }
        Ok((key, path))
    }
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn ensure_dir(path: &Path) -> Result<(), ProviderError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ProviderError::InvalidArgument(format!("Path is not a directory: {}", path.display()))),
        Err(_) => Err(ProviderError::InvalidArgument(format!("Path does not exist: {}", path.display()))),
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    async fn list(&mut self, path: &str, _album: Option<&str>) -> Result<FileListResult, ProviderError> {
        let (relative, dir) = self.resolve(path)?;
        ensure_dir(&dir).await?;

        let mut result = FileListResult::default();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            // Follows symlinks
            let meta = match tokio::fs::metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let key = paths::join_key(&[&relative, &name]);

            if meta.is_dir() {
                result.folders.push(FolderEntry { name, path: key });
            } else if meta.is_file() && self.options.is_allowed(&name) {
                let url = self.url_for(&key);
                result.files.push(FileEntry {
                    thumbnail_url: paths::is_image_name(&name).then(|| url.clone()),
                    url,
                    size_bytes: meta.len(),
                    mtime: modified_secs(&meta),
                    provider_key: Some(key),
                    name,
                });
            }
        }

        result.folders.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        result.sort_by_mtime_desc();
        Ok(result)
    }

    async fn upload(
        &mut self,
        local_path: &Path,
        file_name: &str,
        target_path: &str,
    ) -> Result<UploadResult, ProviderError> {
        let (relative, dir) = self.resolve(target_path)?;
        let prepared = prepare_upload(&self.options, ProviderType::Local, local_path, file_name).await?;

        tokio::fs::create_dir_all(&dir).await?;
        let dest = paths::unique_path(&dir, &prepared.name).await;
        tokio::fs::copy(&prepared.path, &dest).await?;

        let stored = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| prepared.name.clone());
        let url = self.url_for(&paths::join_key(&[&relative, &stored]));
        info!("Stored {} as {}", file_name, dest.display());

        Ok(UploadResult::success(url.clone(), stored.clone())
            .with_thumbnail(paths::is_image_name(&stored).then_some(url))
            .with_compressed(prepared.compressed))
    }

    async fn test_connection(&mut self) -> Result<(), ProviderError> {
        ensure_dir(&self.config.root)
            .await
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))
    }

    fn supports_rename(&self) -> bool {
        true
    }

    async fn rename(
        &mut self,
        url: &str,
        new_base_name: &str,
        provider_key: Option<&str>,
    ) -> Result<UploadResult, ProviderError> {
        let (old_key, old_path) = self.key_for(url, provider_key)?;
        let new_key = paths::renamed_key(&old_key, new_base_name)?;
        let new_name = paths::base_name(&new_key).to_string();

        if new_key == old_key {
            let same = if url.trim().is_empty() { self.url_for(&old_key) } else { url.to_string() };
            return Ok(UploadResult::success(same, new_name));
        }

        let (_, new_path) = self.resolve(&new_key)?;
        if tokio::fs::try_exists(&new_path).await.unwrap_or(false) {
            return Err(ProviderError::InvalidArgument(format!("A file named {} already exists", new_name)));
        }
        tokio::fs::rename(&old_path, &new_path).await?;
        info!("Renamed {} -> {}", old_key, new_key);

        let url = self.url_for(&new_key);
        Ok(UploadResult::success(url.clone(), new_name.clone())
            .with_thumbnail(paths::is_image_name(&new_name).then_some(url)))
    }

    fn supports_delete(&self) -> bool {
        true
    }

    async fn delete(&mut self, url: &str, provider_key: Option<&str>) -> Result<DeleteResult, ProviderError> {
        let (key, path) = self.key_for(url, provider_key)?;
        tokio::fs::remove_file(&path).await?;
        info!("Deleted {}", key);
        Ok(DeleteResult::success())
    }
}
