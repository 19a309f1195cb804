// Mediadock Settings Module
// Persistent provider credentials and pipeline tuning

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::providers::ProviderError;

/// Whole-application settings document.
///
/// Loaded once per process (or per request) and passed by reference into
/// every provider constructor; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Extensions (lowercase, no dot) that listings keep
    pub allowed_extensions: Vec<String>,
    pub compression: CompressionSettings,
    /// Width requested from on-the-fly thumbnail URLs
    pub thumbnail_width: u32,
    pub timeouts: TimeoutSettings,
    pub local: LocalSettings,
    pub cos: CosSettings,
    pub oss: OssSettings,
    pub upyun: UpyunSettings,
    pub lsky: LskySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allowed_extensions: [
                "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "ico",
                "mp4", "webm", "mp3", "pdf", "zip",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            compression: CompressionSettings::default(),
            thumbnail_width: 300,
            timeouts: TimeoutSettings::default(),
            local: LocalSettings::default(),
            cos: CosSettings::default(),
            oss: OssSettings::default(),
            upyun: UpyunSettings::default(),
            lsky: LskySettings::default(),
        }
    }
}

/// Upload compression tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Encoder quality shared by every attempt (1-100)
    pub quality: u8,
    /// Longer edge cap in pixels
    pub max_dimension: u32,
    /// Files below this size are uploaded untouched
    pub min_bytes: u64,
    /// Soft memory ceiling the decoder budget is computed against
    pub memory_limit_mb: u64,
    /// Highest value the soft ceiling may be raised to
    pub memory_hard_cap_mb: u64,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: 80,
            max_dimension: 1080,
            min_bytes: 50 * 1024,
            memory_limit_mb: 128,
            memory_hard_cap_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Listing, rename, delete and negotiation calls
    pub metadata_secs: u64,
    pub upload_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { metadata_secs: 30, upload_secs: 180 }
    }
}

fn default_verify_tls() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub root: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CosSettings {
    pub secret_id: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub domain: String,
    pub prefix: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl Default for CosSettings {
    fn default() -> Self {
        Self {
            secret_id: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            region: String::new(),
            domain: String::new(),
            prefix: String::new(),
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OssSettings {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub bucket: String,
    pub endpoint: String,
    pub domain: String,
    pub prefix: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl Default for OssSettings {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            access_key_secret: String::new(),
            bucket: String::new(),
            endpoint: String::new(),
            domain: String::new(),
            prefix: String::new(),
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpyunSettings {
    pub operator: String,
    pub password: String,
    pub bucket: String,
    pub domain: String,
    pub prefix: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl Default for UpyunSettings {
    fn default() -> Self {
        Self {
            operator: String::new(),
            password: String::new(),
            bucket: String::new(),
            domain: String::new(),
            prefix: String::new(),
            verify_tls: true,
        }
    }
}

/// Self-hosted Lsky instances frequently run behind self-signed certificates,
/// so `verify_tls` is the knob for that rather than a blanket default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LskySettings {
    pub url: String,
    pub token: String,
    pub album_id: String,
    pub storage_id: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl Default for LskySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            album_id: String::new(),
            storage_id: String::new(),
            verify_tls: true,
        }
    }
}

/// Get the settings file path
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("mediadock")
        .join("settings.json")
}

/// Load settings from `path`, falling back to defaults when the file is absent.
pub fn load_settings_from(path: &Path) -> Result<Settings, ProviderError> {
    if !path.exists() {
        debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&content)
        .map_err(|e| ProviderError::NotConfigured(format!("Invalid settings file {}: {}", path.display(), e)))?;
    settings.normalize();
    info!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to `path`, creating parent directories as needed
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| ProviderError::ParseError(format!("Failed to serialize settings: {}", e)))?;
    fs::write(path, content)?;
    info!("Saved settings to {}", path.display());
    Ok(())
}

impl Settings {
    /// Clamp tuning values into their valid ranges and lowercase extensions.
    pub fn normalize(&mut self) {
        self.compression.quality = self.compression.quality.clamp(1, 100);
        if self.compression.max_dimension == 0 {
            self.compression.max_dimension = CompressionSettings::default().max_dimension;
        }
        if self.compression.memory_hard_cap_mb < self.compression.memory_limit_mb {
            self.compression.memory_hard_cap_mb = self.compression.memory_limit_mb;
        }
        if self.thumbnail_width == 0 {
            self.thumbnail_width = 300;
        }
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
    }
}
