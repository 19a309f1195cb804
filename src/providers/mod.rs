//! Storage Providers Module
//!
//! This module provides a unified abstraction layer over the media backends.
//! All providers implement the `StorageProvider` trait, allowing callers to
//! browse, upload, rename and delete media without knowing where it lives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           StorageProvider Trait             │
//! │   list, upload, rename?, delete?, albums?   │
//! └─────────────────────────────────────────────┘
//!                      │
//!    ┌───────┬─────────┼─────────┬────────┐
//!    ▼       ▼         ▼         ▼        ▼
//! ┌─────┐ ┌─────┐  ┌─────┐  ┌───────┐ ┌──────┐
//! │Local│ │ COS │  │ OSS │  │ UpYun │ │ Lsky │
//! └─────┘ └─────┘  └─────┘  └───────┘ └──────┘
//!            │        │         │         │
//!         signing  signing   signing  negotiator
//!            └────────┴────┬────┴─────────┘
//!                      transport
//! ```

pub mod types;
pub mod signing;
pub mod transport;
pub mod negotiator;
pub mod paths;
pub mod listing;
pub mod local;
pub mod cos;
pub mod oss;
pub mod upyun;
pub mod lsky;

pub use types::*;
pub use local::LocalProvider;
pub use cos::CosProvider;
pub use oss::OssProvider;
pub use upyun::UpyunProvider;
pub use lsky::LskyProvider;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::compressor::compress_for_upload;
use crate::settings::{CompressionSettings, Settings};
use transport::{HttpTransport, Transport};

/// Unified storage provider trait
///
/// Every media backend implements this trait. `rename`, `delete` and `albums`
/// are optional capabilities: callers check `supports_*` first, and the
/// default implementations answer `NotSupported`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider type identifier
    fn provider_type(&self) -> ProviderType;

    /// Get display name for this provider instance
    fn display_name(&self) -> String {
        self.provider_type().to_string()
    }

    /// List folders and allowed files below `path`.
    ///
    /// `album` narrows the listing on providers with an album filter and is
    /// ignored elsewhere.
    async fn list(&mut self, path: &str, album: Option<&str>) -> Result<FileListResult, ProviderError>;

    /// Compress (when eligible) and upload `local_path` as `file_name` into `target_path`
    async fn upload(
        &mut self,
        local_path: &Path,
        file_name: &str,
        target_path: &str,
    ) -> Result<UploadResult, ProviderError>;

    /// Cheapest authenticated call, used to validate credentials
    async fn test_connection(&mut self) -> Result<(), ProviderError>;

    // Optional capabilities - providers can override these

    fn supports_rename(&self) -> bool {
        false
    }

    /// Rename a file, keeping its directory and extension
    async fn rename(
        &mut self,
        _url: &str,
        _new_base_name: &str,
        _provider_key: Option<&str>,
    ) -> Result<UploadResult, ProviderError> {
        Err(ProviderError::NotSupported("rename".to_string()))
    }

    fn supports_delete(&self) -> bool {
        false
    }

    async fn delete(&mut self, _url: &str, _provider_key: Option<&str>) -> Result<DeleteResult, ProviderError> {
        Err(ProviderError::NotSupported("delete".to_string()))
    }

    fn supports_albums(&self) -> bool {
        false
    }

    async fn albums(&mut self) -> Result<Vec<Album>, ProviderError> {
        Err(ProviderError::NotSupported("albums".to_string()))
    }
}

/// Settings every adapter needs besides its own credentials
#[derive(Debug, Clone)]
pub struct MediaOptions {
    pub allowed_extensions: Vec<String>,
    pub compression: CompressionSettings,
    pub thumbnail_width: u32,
    pub metadata_timeout: Duration,
    pub upload_timeout: Duration,
}

impl MediaOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            allowed_extensions: settings.allowed_extensions.clone(),
            compression: settings.compression.clone(),
            thumbnail_width: settings.thumbnail_width,
            metadata_timeout: Duration::from_secs(settings.timeouts.metadata_secs.max(1)),
            upload_timeout: Duration::from_secs(settings.timeouts.upload_secs.max(1)),
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        paths::has_allowed_extension(name, &self.allowed_extensions)
    }
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Deletes a pipeline artifact when dropped
struct ArtifactGuard(Option<PathBuf>);

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed upload artifact {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove upload artifact {}: {}", path.display(), e),
            }
        }
    }
}

/// A file ready to be sent: compressed when that paid off, named for storage.
///
/// The compressed artifact (if any) is removed when this value is dropped,
/// on success and failure alike.
pub struct PreparedUpload {
    pub path: PathBuf,
    /// Sanitized storage name; extension follows the output format
    pub name: String,
    pub mime: String,
    pub compressed: bool,
    _artifact: ArtifactGuard,
}

impl PreparedUpload {
    pub async fn read(&self) -> Result<Vec<u8>, ProviderError> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

/// Validate, compress and name an upload for `provider`.
pub async fn prepare_upload(
    options: &MediaOptions,
    provider: ProviderType,
    local_path: &Path,
    file_name: &str,
) -> Result<PreparedUpload, ProviderError> {
    let original = paths::base_name(file_name.trim());
    if original.is_empty() {
        return Err(ProviderError::InvalidArgument("File name is empty".to_string()));
    }
    if !options.is_allowed(original) {
        return Err(ProviderError::InvalidArgument(format!("File type not allowed: {}", original)));
    }
    if !tokio::fs::metadata(local_path).await.map(|m| m.is_file()).unwrap_or(false) {
        return Err(ProviderError::InvalidArgument(format!(
            "Upload source not found: {}",
            local_path.display()
        )));
    }

    let outcome = compress_for_upload(&options.compression, provider, local_path, original).await;
    if let Some(ref reason) = outcome.reason {
        debug!("Uploading {} uncompressed: {}", original, reason);
    }

    let format = if outcome.compressed { outcome.format.as_deref() } else { None };
    let name = paths::upload_name(original, format)?;
    let artifact = outcome.compressed.then(|| outcome.output_path.clone());

    Ok(PreparedUpload {
        mime: paths::mime_for(&name),
        path: outcome.output_path,
        name,
        compressed: outcome.compressed,
        _artifact: ArtifactGuard(artifact),
    })
}

/// Entry of `availableProviders()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_album_filter: Option<bool>,
}

/// Provider factory for creating provider instances
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create a new provider instance from settings, with a real HTTP transport
    pub fn create(settings: &Settings, provider: ProviderType) -> Result<Box<dyn StorageProvider>, ProviderError> {
        let options = MediaOptions::from_settings(settings);
        let transport = |verify_tls: bool| -> Result<Arc<dyn Transport>, ProviderError> {
            Ok(Arc::new(HttpTransport::new(verify_tls)?))
        };
        match provider {
            ProviderType::Local => {
                let config = LocalConfig::from_settings(settings)?;
                Ok(Box::new(LocalProvider::new(config, options)))
            }
            ProviderType::Cos => {
                let config = CosConfig::from_settings(settings)?;
                let transport = transport(config.verify_tls)?;
                Ok(Box::new(CosProvider::new(config, options, transport)))
            }
            ProviderType::Oss => {
                let config = OssConfig::from_settings(settings)?;
                let transport = transport(config.verify_tls)?;
                Ok(Box::new(OssProvider::new(config, options, transport)))
            }
            ProviderType::Upyun => {
                let config = UpyunConfig::from_settings(settings)?;
                let transport = transport(config.verify_tls)?;
                Ok(Box::new(UpyunProvider::new(config, options, transport)))
            }
            ProviderType::Lsky => {
                let config = LskyConfig::from_settings(settings)?;
                let transport = transport(config.verify_tls)?;
                Ok(Box::new(LskyProvider::new(config, options, transport)))
            }
        }
    }

    /// Whether every required credential of `provider` is set
    pub fn is_configured(settings: &Settings, provider: ProviderType) -> bool {
        match provider {
            ProviderType::Local => LocalConfig::from_settings(settings).is_ok(),
            ProviderType::Cos => CosConfig::from_settings(settings).is_ok(),
            ProviderType::Oss => OssConfig::from_settings(settings).is_ok(),
            ProviderType::Upyun => UpyunConfig::from_settings(settings).is_ok(),
            ProviderType::Lsky => LskyConfig::from_settings(settings).is_ok(),
        }
    }

    /// Configured providers, in display order
    pub fn available(settings: &Settings) -> Vec<ProviderInfo> {
        ProviderType::ALL
            .iter()
            .filter(|p| Self::is_configured(settings, **p))
            .map(|p| ProviderInfo {
                key: p.key().to_string(),
                name: p.to_string(),
                has_album_filter: p.has_album_filter().then_some(true),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_requires_every_credential() {
        let mut settings = Settings::default();
        assert!(ProviderFactory::available(&settings).is_empty());

        settings.lsky.url = "img.example.com".to_string();
        settings.lsky.token = "1|abc".to_string();
        settings.upyun.operator = "editor".to_string();
        settings.upyun.password = "pw".to_string();
        settings.upyun.bucket = "media".to_string();
        // domain missing, so UpYun stays unavailable

        let available = ProviderFactory::available(&settings);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].key, "lsky");
        assert_eq!(available[0].has_album_filter, Some(true));

        let json = serde_json::to_value(&available).unwrap();
        assert_eq!(json[0]["hasAlbumFilter"], true);
    }

    #[test]
    fn test_factory_reports_missing_configuration() {
        let settings = Settings::default();
        for provider in ProviderType::ALL {
            assert!(matches!(
                ProviderFactory::create(&settings, provider),
                Err(ProviderError::NotConfigured(_))
            ));
        }
    }

    #[test]
    fn test_factory_builds_configured_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.local.root = dir.path().to_string_lossy().to_string();
        settings.local.base_url = "https://example.com/media".to_string();
        let provider = ProviderFactory::create(&settings, ProviderType::Local).unwrap();
        assert_eq!(provider.provider_type(), ProviderType::Local);
        assert!(provider.supports_rename());
        assert!(provider.supports_delete());
        assert!(!provider.supports_albums());
    }

    #[tokio::test]
    async fn test_prepare_upload_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("upload.tmp");
        std::fs::write(&src, b"data").unwrap();
        let options = MediaOptions::default();

        let err = prepare_upload(&options, ProviderType::Cos, &src, "  ").await.err().unwrap();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
        let err = prepare_upload(&options, ProviderType::Cos, &src, "shell.php").await.err().unwrap();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
        let missing = dir.path().join("missing.tmp");
        let err = prepare_upload(&options, ProviderType::Cos, &missing, "a.jpg").await.err().unwrap();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_prepare_upload_passes_small_files_through() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("phpA1b2C3");
        std::fs::write(&src, b"%PDF-1.4 small").unwrap();

        let prepared = prepare_upload(&MediaOptions::default(), ProviderType::Oss, &src, "Annual Report.pdf")
            .await
            .unwrap();
        assert_eq!(prepared.path, src);
        assert_eq!(prepared.name, "Annual-Report.pdf");
        assert_eq!(prepared.mime, "application/pdf");
        assert!(!prepared.compressed);
        drop(prepared);
        // The caller's file is not a pipeline artifact
        assert!(src.exists());
    }

    #[test]
    fn test_artifact_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.mdk-1.webp");
        std::fs::write(&artifact, b"x").unwrap();
        drop(ArtifactGuard(Some(artifact.clone())));
        assert!(!artifact.exists());
        drop(ArtifactGuard(Some(artifact)));
    }
}
