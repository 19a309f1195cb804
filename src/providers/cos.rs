//! Tencent COS provider
//!
//! Virtual-hosted bucket access (`{bucket}.cos.{region}.myqcloud.com`),
//! every request signed with the `q-sign-*` HMAC-SHA1 scheme. Rename is a
//! server-side copy followed by a delete.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::listing::{bucket_listing, parse_list_bucket, ListBucketPage};
use super::paths;
use super::signing::{cos_authorization, SigningContext};
use super::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use super::{
    prepare_upload, CosConfig, DeleteResult, FileListResult, MediaOptions, ProviderError, ProviderType,
    StorageProvider, UploadResult,
};

/// Upper bound on listing pages fetched for one directory
const MAX_LIST_PAGES: usize = 50;
const PAGE_SIZE: &str = "1000";

pub struct CosProvider {
    config: CosConfig,
    options: MediaOptions,
    transport: Arc<dyn Transport>,
}

impl CosProvider {
    pub fn new(config: CosConfig, options: MediaOptions, transport: Arc<dyn Transport>) -> Self {
        Self { config, options, transport }
    }

    fn public_url(&self, key: &str) -> String {
        paths::public_url(&self.config.public_base(), key)
    }

    fn thumbnail_url(&self, url: &str) -> String {
        format!("{}?imageMogr2/thumbnail/{}x", url, self.options.thumbnail_width)
    }

    /// Full object key for a directory relative to the configured prefix
    fn dir_key(&self, path: &str) -> Result<String, ProviderError> {
        let relative = paths::normalize_dir(path)?;
        Ok(paths::join_key(&[&self.config.prefix, &relative]))
    }

    fn resolve_key(&self, url: &str, provider_key: Option<&str>) -> Result<String, ProviderError> {
        paths::resolve_key(url, provider_key, &self.config.public_base())
    }

    /// Sign and send one request against object `key` ("" for the bucket root)
    async fn request(
        &self,
        method: Method,
        key: &str,
        params: &[(&str, String)],
        headers: Vec<(String, String)>,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<HttpResponse, ProviderError> {
        let host = self.config.host();
        let mut ctx = SigningContext::now(method.as_str(), &format!("/{}", key)).header("host", &host);
        for (k, v) in params {
            ctx = ctx.param(k, v);
        }
        for (k, v) in &headers {
            ctx = ctx.header(k, v);
        }
        let authorization = cos_authorization(
            &ctx,
            &self.config.secret_id,
            self.config.secret_key.expose_secret(),
        )?;

        let mut url = format!("https://{}/{}", host, paths::encode_key(key));
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{}?{}", url, query);
        }

        let mut request = HttpRequest::new(method, url, timeout)
            .header("Authorization", authorization)
            .body(body);
        for (k, v) in headers {
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
        let response = self
            .request(Method::GET, "", &params, Vec::new(), RequestBody::Empty, self.options.metadata_timeout)
            .await?;
        parse_list_bucket(&response.text())
    }

    async fn delete_key(&self, key: &str) -> Result<(), ProviderError> {
        self.request(Method::DELETE, key, &[], Vec::new(), RequestBody::Empty, self.options.metadata_timeout)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for CosProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Cos
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
            debug!("COS listing continues after {:?}", marker);
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
        let prepared = prepare_upload(&self.options, ProviderType::Cos, local_path, file_name).await?;
        let key = paths::join_key(&[&dir_key, &prepared.name]);
        let data = prepared.read().await?;

        self.request(
            Method::PUT,
            &key,
            &[],
            vec![("Content-Type".to_string(), prepared.mime.clone())],
            RequestBody::Bytes(data),
            self.options.upload_timeout,
        )
        .await?;
        info!("Uploaded {} to COS as {}", file_name, key);

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

        let copy_source = format!("{}/{}", self.config.host(), paths::encode_key(&old_key));
        self.request(
            Method::PUT,
            &new_key,
            &[],
            vec![("x-cos-copy-source".to_string(), copy_source)],
            RequestBody::Empty,
            self.options.metadata_timeout,
        )
        .await?;
        self.delete_key(&old_key).await?;
        info!("Renamed COS object {} -> {}", old_key, new_key);

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
        info!("Deleted COS object {}", key);
        Ok(DeleteResult::success())
    }
}
