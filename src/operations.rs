//! Operations - the inbound surface of the media library
//!
//! Every caller request is one [`Operation`] value. [`dispatch`] builds a fresh
//! adapter for it, checks optional capabilities, and turns every outcome into
//! the normalized JSON shapes (`ok` + payload, or `ok:false` + `msg`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::providers::{
    DeleteResult, ProviderError, ProviderFactory, ProviderType, StorageProvider, UploadResult,
};
use crate::settings::Settings;

// ============ Request/Response Types ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Operation {
    List {
        provider: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        album: Option<String>,
    },
    Upload {
        provider: String,
        /// Local temp file holding the uploaded bytes
        file: PathBuf,
        /// Name the user gave the file
        name: String,
        #[serde(default)]
        path: String,
        /// Remove `file` once the upload finished, whatever the outcome
        #[serde(default)]
        remove_source: bool,
    },
    UploadMany {
        provider: String,
        files: Vec<UploadItem>,
        #[serde(default)]
        path: String,
        #[serde(default)]
        remove_source: bool,
    },
    Rename {
        provider: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        key: Option<String>,
        new_name: String,
    },
    Delete {
        provider: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        key: Option<String>,
    },
    DeleteMany {
        provider: String,
        items: Vec<DeleteItem>,
    },
    Albums {
        provider: String,
    },
    Test {
        provider: String,
    },
    Providers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub file: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteItem {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Outcome of a multi-file operation; `ok` only when every item succeeded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult<T> {
    pub ok: bool,
    pub items: Vec<T>,
}

impl<T> BatchResult<T> {
    pub fn from_items(items: Vec<T>, item_ok: impl Fn(&T) -> bool) -> Self {
        Self { ok: items.iter().all(&item_ok), items }
    }
}

// ============ Dispatch ============

fn failure(err: &ProviderError) -> Value {
    json!({ "ok": false, "msg": err.to_string() })
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "ok": false, "msg": e.to_string() }))
}

/// Value with `"ok": true` merged into its top-level object
fn success<T: Serialize>(value: &T) -> Value {
    let mut value = to_value(value);
    if let Value::Object(ref mut map) = value {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    value
}

fn open(settings: &Settings, key: &str) -> Result<Box<dyn StorageProvider>, ProviderError> {
    let provider = ProviderType::from_key(key)
        .ok_or_else(|| ProviderError::InvalidArgument(format!("Unknown provider: {}", key)))?;
    ProviderFactory::create(settings, provider)
}

/// Run one operation to completion and return its normalized JSON result
pub async fn dispatch(settings: &Settings, operation: Operation) -> Value {
    match operation {
        Operation::Providers => to_value(&ProviderFactory::available(settings)),
        Operation::List { provider, path, album } => {
            match list(settings, &provider, &path, album.as_deref()).await {
                Ok(v) => v,
                Err(e) => failure(&e),
            }
        }
        Operation::Upload { provider, file, name, path, remove_source } => {
            let result = match open(settings, &provider) {
                Ok(mut adapter) => upload_one(adapter.as_mut(), &file, &name, &path).await,
                Err(e) => UploadResult::failure(e.to_string()),
            };
            if remove_source {
                remove_temp(&file).await;
            }
            to_value(&result)
        }
        Operation::UploadMany { provider, files, path, remove_source } => {
            let batch = upload_many(settings, &provider, &files, &path).await;
            if remove_source {
                for item in &files {
                    remove_temp(&item.file).await;
                }
            }
            to_value(&batch)
        }
        Operation::Rename { provider, url, key, new_name } => {
            let result = match open(settings, &provider) {
                Ok(mut adapter) => rename(adapter.as_mut(), &url, key.as_deref(), &new_name).await,
                Err(e) => UploadResult::failure(e.to_string()),
            };
            to_value(&result)
        }
        Operation::Delete { provider, url, key } => {
            let result = match open(settings, &provider) {
                Ok(mut adapter) => delete_one(adapter.as_mut(), &url, key.as_deref()).await,
                Err(e) => DeleteResult::failure(e.to_string()),
            };
            to_value(&result)
        }
        Operation::DeleteMany { provider, items } => to_value(&delete_many(settings, &provider, &items).await),
        Operation::Albums { provider } => match albums(settings, &provider).await {
            Ok(v) => v,
            Err(e) => failure(&e),
        },
        Operation::Test { provider } => {
            let outcome = match open(settings, &provider) {
                Ok(mut adapter) => adapter.test_connection().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => to_value(&DeleteResult::success()),
                Err(e) => failure(&e),
            }
        }
    }
}

// ============ Handlers ============

async fn list(settings: &Settings, provider: &str, path: &str, album: Option<&str>) -> Result<Value, ProviderError> {
    let mut adapter = open(settings, provider)?;
    let result = adapter.list(path, album).await?;
    info!("Listed {} folders, {} files from {}", result.folders.len(), result.files.len(), adapter.display_name());
    Ok(success(&result))
}

async fn albums(settings: &Settings, provider: &str) -> Result<Value, ProviderError> {
    let mut adapter = open(settings, provider)?;
    if !adapter.supports_albums() {
        return Err(ProviderError::NotSupported(format!("{} has no albums", adapter.display_name())));
    }
    let albums = adapter.albums().await?;
    Ok(json!({ "ok": true, "albums": albums }))
}

async fn upload_one(adapter: &mut dyn StorageProvider, file: &Path, name: &str, path: &str) -> UploadResult {
    match adapter.upload(file, name, path).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Upload of {} to {} failed: {}", name, adapter.display_name(), e);
            UploadResult::failure(e.to_string())
        }
    }
}

async fn rename(adapter: &mut dyn StorageProvider, url: &str, key: Option<&str>, new_name: &str) -> UploadResult {
    if !adapter.supports_rename() {
        return UploadResult::failure(
            ProviderError::NotSupported(format!("{} cannot rename files", adapter.display_name())).to_string(),
        );
    }
    if new_name.trim().is_empty() {
        return UploadResult::failure(ProviderError::InvalidArgument("New name is empty".to_string()).to_string());
    }
    match adapter.rename(url, new_name, key).await {
        Ok(result) => result,
        Err(e) => UploadResult::failure(e.to_string()),
    }
}

async fn delete_one(adapter: &mut dyn StorageProvider, url: &str, key: Option<&str>) -> DeleteResult {
    if !adapter.supports_delete() {
        return DeleteResult::failure(
            ProviderError::NotSupported(format!("{} cannot delete files", adapter.display_name())).to_string(),
        );
    }
    match adapter.delete(url, key).await {
        Ok(result) => result,
        Err(e) => DeleteResult::failure(e.to_string()),
    }
}

/// Upload files one at a time through a single adapter instance
pub async fn upload_many(
    settings: &Settings,
    provider: &str,
    files: &[UploadItem],
    path: &str,
) -> BatchResult<UploadResult> {
    let items = match open(settings, provider) {
        Ok(mut adapter) => {
            let mut items = Vec::with_capacity(files.len());
            for item in files {
                items.push(upload_one(adapter.as_mut(), &item.file, &item.name, path).await);
            }
            items
        }
        Err(e) => files.iter().map(|_| UploadResult::failure(e.to_string())).collect(),
    };
    BatchResult::from_items(items, |r| r.ok)
}

/// Delete items one at a time through a single adapter instance
pub async fn delete_many(settings: &Settings, provider: &str, targets: &[DeleteItem]) -> BatchResult<DeleteResult> {
    let items = match open(settings, provider) {
        Ok(mut adapter) => {
            let mut items = Vec::with_capacity(targets.len());
            for target in targets {
                items.push(delete_one(adapter.as_mut(), &target.url, target.key.as_deref()).await);
            }
            items
        }
        Err(e) => targets.iter().map(|_| DeleteResult::failure(e.to_string())).collect(),
    };
    BatchResult::from_items(items, |r| r.ok)
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}
