//! UpYun REST provider
//!
//! Talks to `v0.api.upyun.com/{service}` with operator HMAC signatures.
//! Listings are tab-delimited plain text (`name\tN|F\tsize\tmtime` per line),
//! paginated through the `x-upyun-list-iter` header. Rename is a native move.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::paths;
use super::signing::{md5_hex, upyun_authorization, SigningContext};
use super::transport::{HttpRequest, HttpResponse, RequestBody, Transport};
use super::{
    prepare_upload, DeleteResult, FileEntry, FileListResult, FolderEntry, MediaOptions, ProviderError, ProviderType,
    StorageProvider, UploadResult, UpyunConfig,
};

const API_HOST: &str = "https://v0.api.upyun.com";
/// Iterator value UpYun returns once the listing is exhausted
pub const LIST_END_MARKER: &str = "g2gCZAAEbmV4dGQAA2VvZg";
const MAX_LIST_PAGES: usize = 50;
const PAGE_SIZE: &str = "1000";

/// One line of a REST listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpyunItem {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
}

/// Parse a tab-delimited listing body. Malformed lines are skipped.
pub fn parse_listing(body: &str) -> Vec<UpyunItem> {
    body.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let kind = fields.next()?.trim();
            let size = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            let mtime = fields.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
            if name.is_empty() {
                return None;
            }
            Some(UpyunItem {
                name: name.to_string(),
                is_dir: kind == "F",
                size,
                mtime,
            })
        })
        .collect()
}

pub struct UpyunProvider {
    config: UpyunConfig,
    options: MediaOptions,
    transport: Arc<dyn Transport>,
}

impl UpyunProvider {
    pub fn new(config: UpyunConfig, options: MediaOptions, transport: Arc<dyn Transport>) -> Self {
        Self { config, options, transport }
    }

    fn public_url(&self, key: &str) -> String {
        paths::public_url(&self.config.domain, key)
    }

    fn thumbnail_url(&self, url: &str) -> String {
        format!("{}!/fw/{}", url, self.options.thumbnail_width)
    }

    fn dir_key(&self, path: &str) -> Result<String, ProviderError> {
        let relative = paths::normalize_dir(path)?;
        Ok(paths::join_key(&[&self.config.prefix, &relative]))
    }

    fn resolve_key(&self, url: &str, provider_key: Option<&str>) -> Result<String, ProviderError> {
        // Drop an image-processing suffix such as `!/fw/300`
        let url = url.split("!/").next().unwrap_or(url);
        paths::resolve_key(url, provider_key, &self.config.domain)
    }

    /// Request URI: `/{service}/{key}`, with a trailing slash for directories
    fn uri(&self, key: &str, is_dir: bool) -> String {
        let mut uri = format!("/{}", self.config.bucket);
        if !key.is_empty() {
            uri.push('/');
            uri.push_str(&paths::encode_key(key));
        }
        if is_dir {
            uri.push('/');
        }
        uri
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<HttpResponse, ProviderError> {
        let content_md5 = body.as_ref().map(|b| md5_hex(b));
        let ctx = SigningContext::now(method.as_str(), uri).content_md5(content_md5.clone());
        let authorization = upyun_authorization(&ctx, &self.config.operator, self.config.password.expose_secret())?;

        let mut request = HttpRequest::new(method, format!("{}{}", API_HOST, uri), timeout)
            .header("Date", ctx.http_date())
            .header("Authorization", authorization);
        if let Some(md5) = content_md5 {
            request = request.header("Content-MD5", md5);
        }
        for (k, v) in headers {
            request = request.header(&k, v);
        }
        if let Some(bytes) = body {
            request = request.body(RequestBody::Bytes(bytes));
        }
        self.transport.execute(request).await
    }

    async fn list_page(&self, dir_key: &str, iter: Option<&str>, limit: &str) -> Result<(Vec<UpyunItem>, Option<String>), ProviderError> {
        let mut headers = vec![("x-list-limit".to_string(), limit.to_string())];
        if let Some(iter) = iter {
            headers.push(("x-list-iter".to_string(), iter.to_string()));
        }
        let uri = self.uri(dir_key, true);
        let response = self
            .request(Method::GET, &uri, headers, None, self.options.metadata_timeout)
            .await?;
        let next = response
            .header("x-upyun-list-iter")
            .map(str::to_string)
            .filter(|iter| !iter.is_empty() && iter != LIST_END_MARKER);
        Ok((parse_listing(&response.text()), next))
    }
}

#[async_trait]
impl StorageProvider for UpyunProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Upyun
    }

    async fn list(&mut self, path: &str, _album: Option<&str>) -> Result<FileListResult, ProviderError> {
        let dir_key = self.dir_key(path)?;
        let mut result = FileListResult::default();
        let mut iter: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let (items, next) = self.list_page(&dir_key, iter.as_deref(), PAGE_SIZE).await?;
            for item in items {
                let key = paths::join_key(&[&dir_key, &item.name]);
                if item.is_dir {
                    let relative = key
                        .strip_prefix(self.config.prefix.as_str())
                        .map(|r| r.trim_start_matches('/'))
                        .unwrap_or(&key);
                    result.folders.push(FolderEntry { path: relative.to_string(), name: item.name });
                } else if self.options.is_allowed(&item.name) {
                    let url = self.public_url(&key);
                    result.files.push(FileEntry {
                        thumbnail_url: paths::is_image_name(&item.name).then(|| self.thumbnail_url(&url)),
                        url,
                        size_bytes: item.size,
                        mtime: item.mtime,
                        provider_key: Some(key),
                        name: item.name,
                    });
                }
            }
            match next {
                Some(next) => {
                    debug!("UpYun listing continues at {}", next);
                    iter = Some(next);
                }
                None => break,
            }
        }

        result.sort_by_mtime_desc();
        Ok(result)
    }

    async fn upload(
        &mut self,
        local_path: &Path,
        file_name: &str,
        target_path: &str,
    ) -> Result<UploadResult, ProviderError> {
        let dir_key = self.dir_key(target_path)?;
        let prepared = prepare_upload(&self.options, ProviderType::Upyun, local_path, file_name).await?;
        let key = paths::join_key(&[&dir_key, &prepared.name]);
        let data = prepared.read().await?;

        let uri = self.uri(&key, false);
        self.request(
            Method::PUT,
            &uri,
            vec![("Content-Type".to_string(), prepared.mime.clone())],
            Some(data),
            self.options.upload_timeout,
        )
        .await?;
        info!("Uploaded {} to UpYun as {}", file_name, key);

        let url = self.public_url(&key);
        let thumbnail = paths::is_image_name(&prepared.name).then(|| self.thumbnail_url(&url));
        Ok(UploadResult::success(url, prepared.name.clone())
            .with_thumbnail(thumbnail)
            .with_compressed(prepared.compressed))
    }

    async fn test_connection(&mut self) -> Result<(), ProviderError> {
        let root = self.config.prefix.clone();
        self.list_page(&root, None, "1").await.map(|_| ())
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

        let uri = self.uri(&new_key, false);
        let headers = vec![
            ("X-Upyun-Move-Source".to_string(), self.uri(&old_key, false)),
            ("Content-Length".to_string(), "0".to_string()),
        ];
        self.request(Method::PUT, &uri, headers, None, self.options.metadata_timeout)
            .await?;
        info!("Moved UpYun file {} -> {}", old_key, new_key);

        let url = self.public_url(&new_key);
        let thumbnail = paths::is_image_name(&new_name).then(|| self.thumbnail_url(&url));
        Ok(UploadResult::success(url, new_name).with_thumbnail(thumbnail))
    }

    fn supports_delete(&self) -> bool {
        true
    }

    async fn delete(&mut self, url: &str, provider_key: Option<&str>) -> Result<DeleteResult, ProviderError> {
        let key = self.resolve_key(url, provider_key)?;
        let uri = self.uri(&key, false);
        self.request(Method::DELETE, &uri, Vec::new(), None, self.options.metadata_timeout)
            .await?;
        info!("Deleted UpYun file {}", key);
        Ok(DeleteResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::transport::mock::MockTransport;

    fn provider(transport: &Arc<MockTransport>) -> UpyunProvider {
        let config = UpyunConfig {
            operator: "editor".to_string(),
            password: "password".to_string().into(),
            bucket: "media".to_string(),
            domain: "https://media.example.com".to_string(),
            prefix: "site".to_string(),
            verify_tls: true,
        };
        UpyunProvider::new(config, MediaOptions::default(), transport.clone())
    }

    #[test]
    fn test_parse_listing() {
        let items = parse_listing("a.jpg\tN\t1024\t1700000000\n2024\tF\t0\t1690000000\n\nbroken\n");
        assert_eq!(
            items,
            vec![
                UpyunItem { name: "a.jpg".into(), is_dir: false, size: 1024, mtime: 1700000000 },
                UpyunItem { name: "2024".into(), is_dir: true, size: 0, mtime: 1690000000 },
            ]
        );
    }

    #[tokio::test]
    async fn test_list_follows_iterator_until_end_marker() {
        let transport = Arc::new(MockTransport::new());
        transport
            .reply_with(
                HttpResponse::new(200, "old.png\tN\t10\t1600000000\n2024\tF\t0\t0")
                    .with_header("x-upyun-list-iter", "c2Vjb25k"),
            )
            .reply_with(
                HttpResponse::new(200, "new.jpg\tN\t20\t1700000000\nnotes.txt\tN\t5\t1800000000")
                    .with_header("x-upyun-list-iter", LIST_END_MARKER),
            );

        let result = provider(&transport).list("", None).await.unwrap();
        assert_eq!(result.folders, vec![FolderEntry { name: "2024".into(), path: "2024".into() }]);
        let names: Vec<_> = result.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["new.jpg", "old.png"]);
        assert_eq!(result.files[0].url, "https://media.example.com/site/new.jpg");
        assert_eq!(result.files[0].thumbnail_url.as_deref(), Some("https://media.example.com/site/new.jpg!/fw/300"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "https://v0.api.upyun.com/media/site/");
        assert_eq!(requests[0].header_value("x-list-iter"), None);
        assert_eq!(requests[1].header_value("x-list-iter"), Some("c2Vjb25k"));
        assert!(requests[0].header_value("Authorization").unwrap().starts_with("UPYUN editor:"));
        assert_eq!(requests[0].header_value("Content-MD5"), None);
    }

    #[tokio::test]
    async fn test_upload_signs_body_md5() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(200, "");
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("incoming");
        std::fs::write(&src, b"ID3 audio").unwrap();

        let result = provider(&transport).upload(&src, "theme song.mp3", "audio").await.unwrap();
        assert_eq!(result.url.as_deref(), Some("https://media.example.com/site/audio/theme-song.mp3"));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "https://v0.api.upyun.com/media/site/audio/theme-song.mp3");
        assert_eq!(request.header_value("Content-MD5"), Some(md5_hex(b"ID3 audio").as_str()));
    }

    #[tokio::test]
    async fn test_uploaded_file_appears_in_listing() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(200, "");
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("incoming");
        std::fs::write(&src, b"%PDF-1.7 board minutes").unwrap();

        let mut p = provider(&transport);
        let uploaded = p.upload(&src, "Board Minutes.pdf", "docs").await.unwrap();

        let put = transport.requests()[0].clone();
        let sent = match put.body {
            RequestBody::Bytes(ref b) => b.len(),
            ref other => panic!("unexpected body {:?}", other),
        };
        let stored = put.url.rsplit('/').next().unwrap().to_string();
        assert_eq!(stored, "Board-Minutes.pdf");

        transport.reply_with(
            HttpResponse::new(200, format!("{}\tN\t{}\t1700000000\narchive\tF\t0\t1600000000", stored, sent))
                .with_header("x-upyun-list-iter", LIST_END_MARKER),
        );
        let listing = p.list("docs", None).await.unwrap();
        assert_eq!(listing.folders, vec![FolderEntry { name: "archive".into(), path: "docs/archive".into() }]);
        assert_eq!(listing.files.len(), 1);
        let entry = &listing.files[0];
        assert_eq!(Some(entry.name.as_str()), uploaded.name.as_deref());
        assert_eq!(Some(entry.url.as_str()), uploaded.url.as_deref());
        assert_eq!(entry.size_bytes, 22);
        assert_eq!(entry.thumbnail_url, None);
        assert_eq!(entry.provider_key.as_deref(), Some("site/docs/Board-Minutes.pdf"));
        assert_eq!(transport.requests()[1].url, "https://v0.api.upyun.com/media/site/docs/");
    }

    #[tokio::test]
    async fn test_rename_moves_in_place() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(200, "");
        let result = provider(&transport)
            .rename("https://media.example.com/site/a.jpg!/fw/300", "b", None)
            .await
            .unwrap();
        assert_eq!(result.url.as_deref(), Some("https://media.example.com/site/b.jpg"));

        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::PUT);
        assert_eq!(request.url, "https://v0.api.upyun.com/media/site/b.jpg");
        assert_eq!(request.header_value("X-Upyun-Move-Source"), Some("/media/site/a.jpg"));
    }

    #[tokio::test]
    async fn test_delete_and_noop_rename() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(200, "");
        let mut p = provider(&transport);

        let url = "https://media.example.com/site/a.jpg";
        assert_eq!(p.rename(url, "a", None).await.unwrap().url.as_deref(), Some(url));
        assert_eq!(transport.call_count(), 0);

        assert!(p.delete(url, None).await.unwrap().ok);
        assert_eq!(transport.requests()[0].method, Method::DELETE);
        assert!(matches!(p.delete("", None).await, Err(ProviderError::InvalidArgument(_))));
        assert_eq!(transport.call_count(), 1);
    }
}
