//! Shared types for storage providers
//!
//! This module contains all shared types used across the storage backends,
//! including per-provider configuration structs, the normalized list/upload
//! result shapes, and the error type.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::settings::Settings;

/// Supported storage provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Local filesystem below a configured root directory
    Local,
    /// Tencent COS style object storage (path/time-window HMAC)
    Cos,
    /// Aliyun OSS style object storage (canonicalized-resource HMAC)
    Oss,
    /// UpYun style REST file service (operator HMAC)
    Upyun,
    /// Lsky Pro image hosting (bearer token, v1/v2 API generations)
    Lsky,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Local => write!(f, "Local Media"),
            ProviderType::Cos => write!(f, "Tencent COS"),
            ProviderType::Oss => write!(f, "Aliyun OSS"),
            ProviderType::Upyun => write!(f, "UpYun"),
            ProviderType::Lsky => write!(f, "Lsky Pro"),
        }
    }
}

impl ProviderType {
    /// Every provider, in the order they are offered to callers.
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Local,
        ProviderType::Cos,
        ProviderType::Oss,
        ProviderType::Upyun,
        ProviderType::Lsky,
    ];

    /// Stable lowercase key used in settings and operation payloads
    pub fn key(&self) -> &'static str {
        match self {
            ProviderType::Local => "local",
            ProviderType::Cos => "cos",
            ProviderType::Oss => "oss",
            ProviderType::Upyun => "upyun",
            ProviderType::Lsky => "lsky",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.key() == key.trim().to_lowercase())
    }

    /// Whether listing can be narrowed by an album id
    pub fn has_album_filter(&self) -> bool {
        matches!(self, ProviderType::Lsky)
    }

    /// Image hosts mishandle transparency, so uploads to them are flattened to JPEG.
    pub fn is_image_host(&self) -> bool {
        matches!(self, ProviderType::Lsky)
    }
}

fn required(value: &str, what: &str, provider: ProviderType) -> Result<String, ProviderError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::NotConfigured(format!("{} is required for {}", what, provider)));
    }
    Ok(trimmed.to_string())
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Ensure a configured domain carries a scheme.
fn with_scheme(domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
    }
}

/// Local filesystem configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Directory that holds the media library
    pub root: PathBuf,
    /// Public URL that maps to `root`
    pub base_url: String,
}

impl LocalConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let section = &settings.local;
        let root = required(&section.root, "Media root directory", ProviderType::Local)?;
        let base_url = required(&section.base_url, "Public base URL", ProviderType::Local)?;
        Ok(Self {
            root: PathBuf::from(root),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// COS-specific configuration
#[derive(Debug, Clone)]
pub struct CosConfig {
    pub secret_id: String,
    /// Secret key (SecretString for memory zeroization)
    pub secret_key: SecretString,
    /// Bucket name including the APPID suffix (e.g. media-1250000000)
    pub bucket: String,
    pub region: String,
    /// Custom CDN domain used for public URLs
    pub domain: Option<String>,
    /// Key prefix every operation is confined to
    pub prefix: String,
    pub verify_tls: bool,
}

impl CosConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let section = &settings.cos;
        Ok(Self {
            secret_id: required(&section.secret_id, "SecretId", ProviderType::Cos)?,
            secret_key: required(&section.secret_key, "SecretKey", ProviderType::Cos)?.into(),
            bucket: required(&section.bucket, "Bucket", ProviderType::Cos)?,
            region: required(&section.region, "Region", ProviderType::Cos)?,
            domain: optional(&section.domain),
            prefix: section.prefix.trim().trim_matches('/').to_string(),
            verify_tls: section.verify_tls,
        })
    }

    pub fn host(&self) -> String {
        format!("{}.cos.{}.myqcloud.com", self.bucket, self.region)
    }

    /// Base URL that public object URLs are built from
    pub fn public_base(&self) -> String {
        match self.domain {
            Some(ref domain) => with_scheme(domain),
            None => format!("https://{}", self.host()),
        }
    }
}

/// OSS-specific configuration
#[derive(Debug, Clone)]
pub struct OssConfig {
    pub access_key_id: String,
    pub access_key_secret: SecretString,
    pub bucket: String,
    /// Region endpoint without bucket (e.g. oss-cn-hangzhou.aliyuncs.com)
    pub endpoint: String,
    pub domain: Option<String>,
    pub prefix: String,
    pub verify_tls: bool,
}

impl OssConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let section = &settings.oss;
        let endpoint = required(&section.endpoint, "Endpoint", ProviderType::Oss)?;
        let endpoint = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            access_key_id: required(&section.access_key_id, "AccessKey ID", ProviderType::Oss)?,
            access_key_secret: required(&section.access_key_secret, "AccessKey Secret", ProviderType::Oss)?.into(),
            bucket: required(&section.bucket, "Bucket", ProviderType::Oss)?,
            endpoint,
            domain: optional(&section.domain),
            prefix: section.prefix.trim().trim_matches('/').to_string(),
            verify_tls: section.verify_tls,
        })
    }

    pub fn host(&self) -> String {
        format!("{}.{}", self.bucket, self.endpoint)
    }

    pub fn public_base(&self) -> String {
        match self.domain {
            Some(ref domain) => with_scheme(domain),
            None => format!("https://{}", self.host()),
        }
    }
}

/// UpYun-specific configuration
#[derive(Debug, Clone)]
pub struct UpyunConfig {
    pub operator: String,
    /// Operator password; the signing key is its MD5 digest
    pub password: SecretString,
    /// Service (bucket) name
    pub bucket: String,
    /// Bound domain; UpYun has no default public host for a service
    pub domain: String,
    pub prefix: String,
    pub verify_tls: bool,
}

impl UpyunConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let section = &settings.upyun;
        Ok(Self {
            operator: required(&section.operator, "Operator", ProviderType::Upyun)?,
            password: required(&section.password, "Operator password", ProviderType::Upyun)?.into(),
            bucket: required(&section.bucket, "Service name", ProviderType::Upyun)?,
            domain: with_scheme(&required(&section.domain, "Bound domain", ProviderType::Upyun)?),
            prefix: section.prefix.trim().trim_matches('/').to_string(),
            verify_tls: section.verify_tls,
        })
    }
}

/// Lsky Pro configuration
#[derive(Debug, Clone)]
pub struct LskyConfig {
    /// Site root, e.g. https://img.example.com
    pub url: String,
    /// Personal access token (sent as Bearer)
    pub token: SecretString,
    /// Default album for uploads and listing
    pub album_id: Option<String>,
    /// Pinned storage/strategy id; resolved through the API when absent
    pub storage_id: Option<String>,
    pub verify_tls: bool,
}

impl LskyConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let section = &settings.lsky;
        let url = with_scheme(&required(&section.url, "Site URL", ProviderType::Lsky)?);
        let token = required(&section.token, "API token", ProviderType::Lsky)?;
        // Tokens are often pasted together with the scheme from the docs
        let token = token.trim_start_matches("Bearer ").trim().to_string();
        Ok(Self {
            url,
            token: token.into(),
            album_id: optional(&section.album_id),
            storage_id: optional(&section.storage_id),
            verify_tls: section.verify_tls,
        })
    }
}

/// A folder inside a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    /// Path relative to the provider's configured prefix, no leading slash
    pub path: String,
}

/// Remote file entry
///
/// Unified representation of a media file across all providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub size_bytes: u64,
    /// Modification time as Unix seconds (0 when the provider does not report one)
    pub mtime: i64,
    /// Provider-native identifier (object key or numeric id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_key: Option<String>,
}

/// Normalized listing result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListResult {
    pub folders: Vec<FolderEntry>,
    pub files: Vec<FileEntry>,
}

impl FileListResult {
    /// Newest first; ties keep provider order.
    pub fn sort_by_mtime_desc(&mut self) {
        self.files.sort_by(|a, b| b.mtime.cmp(&a.mtime));
    }
}

/// Normalized upload/rename result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl UploadResult {
    pub fn success(url: String, name: String) -> Self {
        Self {
            ok: true,
            url: Some(url),
            name: Some(name),
            thumbnail_url: None,
            compressed: None,
            msg: None,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            url: None,
            name: None,
            thumbnail_url: None,
            compressed: None,
            msg: Some(msg.into()),
        }
    }

    pub fn with_thumbnail(mut self, thumbnail_url: Option<String>) -> Self {
        self.thumbnail_url = thumbnail_url;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = Some(compressed);
        self
    }
}

/// Result of a delete (or any other outcome-only operation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl DeleteResult {
    pub fn success() -> Self {
        Self { ok: true, msg: None }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self { ok: false, msg: Some(msg.into()) }
    }
}

/// An album on an image host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
}

/// Provider error type
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Remote rejected the request (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProviderError {
    /// HTTP status of a remote rejection, if this is one
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProviderError::RemoteRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Reduce a raw error body to the provider's own message.
///
/// Understands JSON `{message|msg|error}` and XML `<Message>`/`<Code>` bodies,
/// otherwise returns a truncated single-line snippet.
pub fn sanitize_api_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response".to_string();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for field in ["message", "msg", "error"] {
            match value.get(field) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(serde_json::Value::Object(inner)) => {
                    if let Some(serde_json::Value::String(s)) = inner.get("message") {
                        return s.clone();
                    }
                }
                _ => {}
            }
        }
    }

    if trimmed.starts_with('<') {
        for tag in ["Message", "Code"] {
            if let Some(text) = extract_xml_tag(trimmed, tag) {
                return text;
            }
        }
    }

    let single_line: String = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() > 200 {
        let cut: String = single_line.chars().take(200).collect();
        format!("{}...", cut)
    } else {
        single_line
    }
}

/// Extract the text of the first `<tag>` element.
pub(crate) fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let text = xml[start..end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
