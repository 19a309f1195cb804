//! Lsky Pro image hosting provider
//!
//! Lsky deployments in the wild run one of two incompatible API generations
//! (v1 `strategy_id`, v2 `storage_id`), so every call goes through the
//! [`Negotiator`]. The storage id and the winning endpoints are cached on the
//! instance only; build a fresh provider per request context.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::listing::parse_iso8601;
use super::negotiator::{status_ok, EndpointAttempt, Negotiation, Negotiator, ParameterShape};
use super::transport::{FilePart, HttpRequest, RequestBody, Transport};
use super::{
    prepare_upload, Album, DeleteResult, FileEntry, FileListResult, LskyConfig, MediaOptions, PreparedUpload,
    ProviderError, ProviderType, StorageProvider, UploadResult,
};

/// Used when neither the profile nor the storage list names a storage
pub const DEFAULT_STORAGE_ID: &str = "1";
const MAX_LIST_PAGES: u64 = 20;

fn lsky_log(msg: &str) {
    info!("[LSKY] {}", msg);
}

fn upload_candidates() -> Vec<EndpointAttempt> {
    vec![
        EndpointAttempt::new(Method::POST, "/api/v2/upload", ParameterShape::StorageId),
        EndpointAttempt::new(Method::POST, "/api/v1/upload", ParameterShape::StrategyId),
        EndpointAttempt::new(Method::POST, "/api/v1/upload", ParameterShape::Bare),
    ]
}

fn profile_candidates() -> Vec<EndpointAttempt> {
    vec![EndpointAttempt::get("/api/v2/user/profile"), EndpointAttempt::get("/api/v1/profile")]
}

fn storage_candidates() -> Vec<EndpointAttempt> {
    vec![EndpointAttempt::get("/api/v2/group"), EndpointAttempt::get("/api/v1/strategies")]
}

fn list_candidates() -> Vec<EndpointAttempt> {
    vec![EndpointAttempt::get("/api/v2/user/photos"), EndpointAttempt::get("/api/v1/images")]
}

fn album_candidates() -> Vec<EndpointAttempt> {
    vec![EndpointAttempt::get("/api/v2/user/albums"), EndpointAttempt::get("/api/v1/albums")]
}

fn delete_candidates(key: &str) -> Vec<EndpointAttempt> {
    let key = urlencoding::encode(key);
    vec![
        EndpointAttempt::new(Method::DELETE, &format!("/api/v1/images/{}", key), ParameterShape::Bare),
        EndpointAttempt::new(Method::DELETE, "/api/v2/user/photos", ParameterShape::Bare),
    ]
}

/// Move a previously successful candidate to the front
fn prefer(winner: Option<&EndpointAttempt>, mut candidates: Vec<EndpointAttempt>) -> Vec<EndpointAttempt> {
    if let Some(winner) = winner {
        if let Some(pos) = candidates.iter().position(|c| c == winner) {
            let first = candidates.remove(pos);
            candidates.insert(0, first);
        }
    }
    candidates
}

fn is_v1(attempt: &EndpointAttempt) -> bool {
    attempt.path.starts_with("/api/v1")
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_at<'v>(item: &'v Value, pointers: &[&str]) -> Option<&'v str> {
    pointers
        .iter()
        .find_map(|p| item.pointer(p).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Default storage named by a profile payload
pub fn storage_from_profile(payload: &Value) -> Option<String> {
    [
        "/data/storage_id",
        "/data/default_storage_id",
        "/data/strategy_id",
        "/data/default_strategy_id",
        "/data/group/default_storage_id",
    ]
    .iter()
    .find_map(|p| payload.pointer(p).and_then(id_string))
}

/// First storage of a storage/strategy list payload
pub fn first_storage(payload: &Value) -> Option<String> {
    ["/data/storages", "/data/strategies", "/data"]
        .iter()
        .filter_map(|p| payload.pointer(p).and_then(Value::as_array))
        .find_map(|items| items.iter().find_map(|item| item.get("id").and_then(id_string)))
}

/// Whether a failure means the storage/strategy id we sent is unknown
pub fn is_missing_storage(error: &ProviderError) -> bool {
    let msg = error.to_string().to_lowercase();
    let names_storage = ["strategy", "storage", "策略", "储存", "存储"].iter().any(|w| msg.contains(w));
    let missing = ["not exist", "not found", "invalid", "不存在"].iter().any(|w| msg.contains(w));
    names_storage && missing
}

fn item_mtime(item: &Value) -> i64 {
    if let Some(ts) = item.get("timestamp").and_then(Value::as_i64) {
        return ts;
    }
    if let Some(date) = item.get("date").and_then(Value::as_str) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(date.trim(), "%Y-%m-%d %H:%M:%S") {
            return dt.and_utc().timestamp();
        }
    }
    item.get("created_at").and_then(Value::as_str).map(parse_iso8601).unwrap_or(0)
}

/// v1 reports sizes in KiB, v2 in bytes
fn item_size(item: &Value, v1: bool) -> u64 {
    let raw = item.get("size").and_then(Value::as_f64).unwrap_or(0.0);
    if v1 {
        (raw * 1024.0).round() as u64
    } else {
        raw as u64
    }
}

pub struct LskyProvider {
    config: LskyConfig,
    options: MediaOptions,
    transport: Arc<dyn Transport>,
    resolved_storage_id: Option<String>,
    upload_endpoint: Option<EndpointAttempt>,
    list_endpoint: Option<EndpointAttempt>,
}

impl LskyProvider {
    pub fn new(config: LskyConfig, options: MediaOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            options,
            transport,
            resolved_storage_id: None,
            upload_endpoint: None,
            list_endpoint: None,
        }
    }

    fn negotiator(&self) -> Negotiator<'_> {
        Negotiator::new(self.transport.as_ref(), &self.config.url, self.options.metadata_timeout)
    }

    /// Authenticated request for a candidate, with an optional query string
    fn authed(&self, attempt: &EndpointAttempt, query: &str, timeout: Duration) -> HttpRequest {
        let url = if query.is_empty() {
            format!("{}{}", self.config.url, attempt.path)
        } else {
            format!("{}{}?{}", self.config.url, attempt.path, query)
        };
        HttpRequest::new(attempt.method.clone(), url, timeout)
            .header("Authorization", format!("Bearer {}", self.config.token.expose_secret()))
            .header("Accept", "application/json")
    }

    async fn get_json(&self, candidates: &[EndpointAttempt], query: &str) -> Result<Negotiation, ProviderError> {
        let timeout = self.options.metadata_timeout;
        self.negotiator()
            .negotiate(candidates, |attempt| Ok(self.authed(attempt, query, timeout)), status_ok)
            .await
    }

    /// Storage id for uploads: cached, pinned in config, or resolved via the API
    async fn storage_id(&mut self) -> String {
        if let Some(ref id) = self.resolved_storage_id {
            return id.clone();
        }
        if let Some(ref id) = self.config.storage_id {
            self.resolved_storage_id = Some(id.clone());
            return id.clone();
        }
        self.resolve_storage_id().await
    }

    /// Ask the server for the default storage: profile first, then the storage list
    async fn resolve_storage_id(&mut self) -> String {
        let from_profile = match self.get_json(&profile_candidates(), "").await {
            Ok(n) => storage_from_profile(&n.payload),
            Err(e) => {
                debug!("Lsky profile lookup failed: {}", e);
                None
            }
        };
        let id = match from_profile {
            Some(id) => Some(id),
            None => match self.get_json(&storage_candidates(), "").await {
                Ok(n) => first_storage(&n.payload),
                Err(e) => {
                    debug!("Lsky storage list lookup failed: {}", e);
                    None
                }
            },
        };
        let id = id.unwrap_or_else(|| DEFAULT_STORAGE_ID.to_string());
        lsky_log(&format!("Using storage id {}", id));
        self.resolved_storage_id = Some(id.clone());
        id
    }

    async fn send_upload(
        &self,
        prepared: &PreparedUpload,
        data: &[u8],
        storage_id: &str,
    ) -> Result<Negotiation, ProviderError> {
        let candidates = prefer(self.upload_endpoint.as_ref(), upload_candidates());
        let timeout = self.options.upload_timeout;
        let build = |attempt: &EndpointAttempt| -> Result<HttpRequest, ProviderError> {
            let mut fields = Vec::new();
            if let Some(field) = attempt.shape.field() {
                fields.push((field.to_string(), storage_id.to_string()));
            }
            if let Some(ref album) = self.config.album_id {
                fields.push(("album_id".to_string(), album.clone()));
            }
            let file = FilePart {
                field: "file".to_string(),
                file_name: prepared.name.clone(),
                mime: prepared.mime.clone(),
                data: data.to_vec(),
            };
            Ok(self.authed(attempt, "", timeout).body(RequestBody::Multipart { fields, file }))
        };
        self.negotiator().negotiate(&candidates, build, status_ok).await
    }

    fn entry_from(&self, item: &Value, v1: bool) -> Option<FileEntry> {
        let name = str_at(item, &["/origin_name", "/name", "/filename"])?.to_string();
        if !self.options.is_allowed(&name) {
            return None;
        }
        let url = str_at(item, &["/links/url", "/public_url", "/url"])?.to_string();
        let thumbnail_url = str_at(item, &["/links/thumbnail_url", "/thumbnail_url"]).map(str::to_string);
        let provider_key = ["key", "id"]
            .iter()
            .find_map(|k| item.get(*k).and_then(id_string));
        Some(FileEntry {
            name,
            url,
            thumbnail_url,
            size_bytes: item_size(item, v1),
            mtime: item_mtime(item),
            provider_key,
        })
    }

    /// Walk the image list, optionally narrowed to one album
    async fn collect(&mut self, album: Option<&str>) -> Result<FileListResult, ProviderError> {
        let mut result = FileListResult::default();
        let mut page: u64 = 1;

        loop {
            let mut query = format!("page={}", page);
            if let Some(album) = album {
                query.push_str(&format!("&album_id={}", urlencoding::encode(album)));
            }
            // Later pages stay on the generation that answered the first one
            let candidates = match (page, self.list_endpoint.clone()) {
                (1, winner) => prefer(winner.as_ref(), list_candidates()),
                (_, Some(winner)) => vec![winner],
                (_, None) => list_candidates(),
            };
            let negotiation = self.get_json(&candidates, &query).await?;
            let v1 = is_v1(&negotiation.attempt);
            self.list_endpoint = Some(negotiation.attempt);

            let data = &negotiation.payload["data"];
            let items = data.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
            result.files.extend(items.iter().filter_map(|item| self.entry_from(item, v1)));

            let last_page = data.get("last_page").and_then(Value::as_u64).unwrap_or(page);
            if items.is_empty() || page >= last_page || page >= MAX_LIST_PAGES {
                break;
            }
            page += 1;
        }

        result.sort_by_mtime_desc();
        Ok(result)
    }

    /// Image id for a delete: the given key, or a lookup of `url` in the listing
    async fn image_key(&mut self, url: &str, provider_key: Option<&str>) -> Result<String, ProviderError> {
        if let Some(key) = provider_key.map(str::trim).filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        let url = url.trim();
        if url.is_empty() {
            return Err(ProviderError::InvalidArgument("No file URL or key given".to_string()));
        }
        let listing = self.collect(None).await?;
        listing
            .files
            .into_iter()
            .find(|f| f.url == url || f.thumbnail_url.as_deref() == Some(url))
            .and_then(|f| f.provider_key)
            .ok_or_else(|| ProviderError::InvalidArgument(format!("No image found for {}", url)))
    }
}

#[async_trait]
impl StorageProvider for LskyProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Lsky
    }

    /// Lsky has no folders; `path` is ignored and `album` filters instead.
    async fn list(&mut self, _path: &str, album: Option<&str>) -> Result<FileListResult, ProviderError> {
        let album = album
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.album_id.clone());
        self.collect(album.as_deref()).await
    }

    async fn upload(
        &mut self,
        local_path: &Path,
        file_name: &str,
        _target_path: &str,
    ) -> Result<UploadResult, ProviderError> {
        let prepared = prepare_upload(&self.options, ProviderType::Lsky, local_path, file_name).await?;
        let data = prepared.read().await?;
        let storage_id = self.storage_id().await;

        let negotiation = match self.send_upload(&prepared, &data, &storage_id).await {
            Err(e) if is_missing_storage(&e) => {
                warn!("Lsky rejected storage id {}: {}", storage_id, e);
                let storage_id = self.resolve_storage_id().await;
                self.send_upload(&prepared, &data, &storage_id).await?
            }
            other => other?,
        };
        self.upload_endpoint = Some(negotiation.attempt.clone());

        let data = &negotiation.payload["data"];
        let url = str_at(data, &["/links/url", "/public_url", "/url"])
            .ok_or_else(|| ProviderError::ParseError("Upload response has no image URL".to_string()))?
            .to_string();
        let thumbnail = str_at(data, &["/links/thumbnail_url", "/thumbnail_url"]).map(str::to_string);
        let name = str_at(data, &["/origin_name", "/name"]).unwrap_or(&prepared.name).to_string();
        lsky_log(&format!("Uploaded {} via {}", name, negotiation.attempt.path));

        Ok(UploadResult::success(url, name)
            .with_thumbnail(thumbnail)
            .with_compressed(prepared.compressed))
    }

    async fn test_connection(&mut self) -> Result<(), ProviderError> {
        self.get_json(&profile_candidates(), "").await.map(|_| ())
    }

    fn supports_delete(&self) -> bool {
        true
    }

    async fn delete(&mut self, url: &str, provider_key: Option<&str>) -> Result<DeleteResult, ProviderError> {
        let key = self.image_key(url, provider_key).await?;
        let timeout = self.options.metadata_timeout;
        let build = |attempt: &EndpointAttempt| -> Result<HttpRequest, ProviderError> {
            let request = self.authed(attempt, "", timeout);
            Ok(if is_v1(attempt) {
                request
            } else {
                let id = key.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(key.as_str()));
                request.body(RequestBody::Json(Value::Array(vec![id])))
            })
        };
        self.negotiator()
            .negotiate(&delete_candidates(&key), build, |v| v.is_null() || status_ok(v))
            .await?;
        lsky_log(&format!("Deleted image {}", key));
        Ok(DeleteResult::success())
    }

    fn supports_albums(&self) -> bool {
        true
    }

    async fn albums(&mut self) -> Result<Vec<Album>, ProviderError> {
        let mut albums = Vec::new();
        let mut page: u64 = 1;
        loop {
            let negotiation = self.get_json(&album_candidates(), &format!("page={}", page)).await?;
            let data = &negotiation.payload["data"];
            let items = data
                .get("data")
                .and_then(Value::as_array)
                .or_else(|| data.as_array())
                .cloned()
                .unwrap_or_default();
            albums.extend(items.iter().filter_map(|item| {
                Some(Album {
                    id: item.get("id").and_then(id_string)?,
                    name: str_at(item, &["/name"]).unwrap_or_default().to_string(),
                })
            }));
            let last_page = data.get("last_page").and_then(Value::as_u64).unwrap_or(page);
            if items.is_empty() || page >= last_page || page >= MAX_LIST_PAGES {
                break;
            }
            page += 1;
        }
        Ok(albums)
    }
}
