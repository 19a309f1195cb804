//! Aliyun OSS provider
//!
//! Virtual-hosted bucket access (`{bucket}.{endpoint}`) signed with the
//! canonicalized-resource HMAC-SHA1 scheme. Each request carries a `Date`
//! header that is part of the string to sign.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::listing::{bucket_listing, parse_list_bucket, ListBucketPage};
use super::paths;
use super::signing::{oss_authorization, SigningContext};
use super::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use super::{
    prepare_upload, DeleteResult, FileListResult, MediaOptions, OssConfig, ProviderError, ProviderType,
    StorageProvider, UploadResult,
};

const MAX_LIST_PAGES: usize = 50;
const PAGE_SIZE: &str = "1000";

pub struct OssProvider {
    config: OssConfig,
    options: MediaOptions,
    transport: Arc<dyn Transport>,
}

/// Optional pieces of a signed OSS request
#[derive(Default)]
struct OssCall<'a> {
    params: Vec<(&'a str, String)>,
    content_type: Option<String>,
    /// `x-oss-*` headers, signed as canonicalized headers
    oss_headers: Vec<(String, String)>,
    body: Option<RequestBody>,
}

impl OssProvider {
    pub fn new(config: OssConfig, options: MediaOptions, transport: Arc<dyn Transport>) -> Self {
        Self { config, options, transport }
    }

    fn public_url(&self, key: &str) -> String {
        paths::public_url(&self.config.public_base(), key)
    }

    fn thumbnail_url(&self, url: &str) -> String {
        format!("{}?x-oss-process=image/resize,w_{}", url, self.options.thumbnail_width)
    }

    fn dir_key(&self, path: &str) -> Result<String, ProviderError> {
        let relative = paths::normalize_dir(path)?;
        Ok(paths::join_key(&[&self.config.prefix, &relative]))
    }

    fn resolve_key(&self, url: &str, provider_key: Option<&str>) -> Result<String, ProviderError> {
        paths::resolve_key(url, provider_key, &self.config.public_base())
    }

    async fn request(
        &self,
        method: Method,
        key: &str,
        call: OssCall<'_>,
        timeout: Duration,
    ) -> Result<HttpResponse, ProviderError> {
        let content_type = call.content_type.unwrap_or_default();
        let mut ctx = SigningContext::now(method.as_str(), &format!("/{}", key)).content_type(&content_type);
        for (k, v) in &call.oss_headers {
            ctx = ctx.header(k, v);
        }
        let authorization = oss_authorization(
            &ctx,
            &self.config.bucket,
            &self.config.access_key_id,
            self.config.access_key_secret.expose_secret(),
        )?;

        let mut url = format!("https://{}/{}", self.config.host(), paths::encode_key(key));
        if !call.params.is_empty() {
            let query = call
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{}?{}", url, query);
        }

        let mut request = HttpRequest::new(method, url, timeout)
            .header("Date", ctx.http_date())
            .header("Authorization", authorization)
            .body(call.body.unwrap_or(RequestBody::Empty));
        if !content_type.is_empty() {
            request = request.header("Content-Type", content_type);
        }
        for (k, v) in call.oss_headers {
            request = request.header(&k, v);
        }
        self.transport.execute(request).await
    }

    async fn list_page(&self, prefix: &str, marker: Option<&str>, max_keys: &str) -> Result<ListBucketPage, ProviderError> {
        let mut params = vec![
            ("delimiter", "/".to_string()),
            ("max-keys", max_keys.to_string()),
            ("prefix", prefix.to_string()),
        ];
        if let Some(marker) = marker {
            params.push(("marker", marker.to_string()));
        }
        let call = OssCall { params, ..Default::default() };
        let response = self.request(Method::GET, "", call, self.options.metadata_timeout).await?;
        parse_list_bucket(&response.text())
    }

    async fn delete_key(&self, key: &str) -> Result<(), ProviderError> {
        self.request(Method::DELETE, key, OssCall::default(), self.options.metadata_timeout)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for OssProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Oss
    }

    async fn list(&mut self, path: &str, _album: Option<&str>) -> Result<FileListResult, ProviderError> {
        let dir_key = self.dir_key(path)?;
        let prefix = if dir_key.is_empty() { String::new() } else { format!("{}/", dir_key) };

        let mut pages = Vec::new();
        let mut marker: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page = self.list_page(&prefix, marker.as_deref(), PAGE_SIZE).await?;
            marker = page.continuation();
            pages.push(page);
            if marker.is_none() {
                break;
            }
            debug!("OSS listing continues after {:?}", marker);
        }

        Ok(bucket_listing(
            &pages,
            &self.config.prefix,
            &dir_key,
            &self.options,
            |key| self.public_url(key),
            |url| self.thumbnail_url(url),
        ))
    }

    async fn upload(
        &mut self,
        local_path: &Path,
        file_name: &str,
        target_path: &str,
    ) -> Result<UploadResult, ProviderError> {
        let dir_key = self.dir_key(target_path)?;
        let prepared = prepare_upload(&self.options, ProviderType::Oss, local_path, file_name).await?;
        let key = paths::join_key(&[&dir_key, &prepared.name]);

        let call = OssCall {
            content_type: Some(prepared.mime.clone()),
            body: Some(RequestBody::Bytes(prepared.read().await?)),
            ..Default::default()
        };
        self.request(Method::PUT, &key, call, self.options.upload_timeout).await?;
        info!("Uploaded {} to OSS as {}", file_name, key);

        let url = self.public_url(&key);
        let thumbnail = paths::is_image_name(&prepared.name).then(|| self.thumbnail_url(&url));
        Ok(UploadResult::success(url, prepared.name.clone())
            .with_thumbnail(thumbnail)
            .with_compressed(prepared.compressed))
    }

    async fn test_connection(&mut self) -> Result<(), ProviderError> {
        let prefix = if self.config.prefix.is_empty() { String::new() } else { format!("{}/", self.config.prefix) };
        self.list_page(&prefix, None, "1").await.map(|_| ())
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
        let old_key = self.resolve_key(url, provider_key)?;
        let new_key = paths::renamed_key(&old_key, new_base_name)?;
        let new_name = paths::base_name(&new_key).to_string();

        if new_key == old_key {
            let same = if url.trim().is_empty() { self.public_url(&old_key) } else { url.to_string() };
            return Ok(UploadResult::success(same, new_name));
        }

        let copy_source = format!("/{}/{}", self.config.bucket, paths::encode_key(&old_key));
        let call = OssCall {
            oss_headers: vec![("x-oss-copy-source".to_string(), copy_source)],
            ..Default::default()
        };
        self.request(Method::PUT, &new_key, call, self.options.metadata_timeout).await?;
        self.delete_key(&old_key).await?;
        info!("Renamed OSS object {} -> {}", old_key, new_key);

        let url = self.public_url(&new_key);
        let thumbnail = paths::is_image_name(&new_name).then(|| self.thumbnail_url(&url));
        Ok(UploadResult::success(url, new_name).with_thumbnail(thumbnail))
    }

    fn supports_delete(&self) -> bool {
        true
    }

    async fn delete(&mut self, url: &str, provider_key: Option<&str>) -> Result<DeleteResult, ProviderError> {
        let key = self.resolve_key(url, provider_key)?;
        self.delete_key(&key).await?;
        info!("Deleted OSS object {}", key);
        Ok(DeleteResult::success())
    }
}
