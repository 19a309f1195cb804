//! Request signing engines
//!
//! Pure functions that compute the authorization material each remote
//! provider verifies. No network or disk I/O happens here; every engine is
//! deterministic for a given [`SigningContext`] and secret.
//!
//! - COS: path/time-window HMAC-SHA1, emitted as a `q-sign-*` structured string
//! - OSS: canonicalized-resource HMAC-SHA1, emitted as `OSS id:signature`
//! - UpYun: `&`-joined HMAC-SHA1 keyed by MD5(password), emitted as `UPYUN operator:signature`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use super::ProviderError;

type HmacSha1 = Hmac<Sha1>;

/// Seconds a COS signature is valid before `now` (clock skew allowance)
pub const COS_SIGN_SKEW_SECS: i64 = 60;
/// Seconds a COS signature stays valid after `now`
pub const COS_SIGN_TTL_SECS: i64 = 3600;

/// Everything an engine needs to know about one request.
///
/// Built fresh for every request: signatures embed a validity window.
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub method: String,
    /// Canonical path or resource, starting with `/`
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub content_type: String,
    pub content_md5: Option<String>,
    /// Unix seconds the request is signed at
    pub timestamp: i64,
}

impl SigningContext {
    pub fn new(method: &str, path: &str, timestamp: i64) -> Self {
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        Self {
            method: method.to_uppercase(),
            path,
            params: Vec::new(),
            headers: Vec::new(),
            content_type: String::new(),
            content_md5: None,
            timestamp,
        }
    }

    /// Context stamped with the current wall clock
    pub fn now(method: &str, path: &str) -> Self {
        Self::new(method, path, Utc::now().timestamp())
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn content_md5(mut self, md5: Option<String>) -> Self {
        self.content_md5 = md5.filter(|m| !m.is_empty());
        self
    }

    /// RFC 7231 date for the context timestamp
    pub fn http_date(&self) -> String {
        http_date(self.timestamp)
    }
}

/// Format Unix seconds as an RFC 7231 HTTP-date
pub fn http_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| ProviderError::NotConfigured(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn require(value: &str, what: &str) -> Result<(), ProviderError> {
    if value.trim().is_empty() {
        return Err(ProviderError::NotConfigured(format!("{} is missing", what)));
    }
    Ok(())
}

/// Lowercase-key, encoded `k=v&k=v` string plus the `;`-joined key list.
fn cos_canonical_pairs(pairs: &[(String, String)]) -> (String, String) {
    let sorted: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k.to_lowercase()).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let keys = sorted.keys().cloned().collect::<Vec<_>>().join(";");
    (joined, keys)
}

/// COS `HttpString`: `method\npath\nparams\nheaders\n`
pub fn cos_http_string(ctx: &SigningContext) -> String {
    let (params, _) = cos_canonical_pairs(&ctx.params);
    let (headers, _) = cos_canonical_pairs(&ctx.headers);
    format!("{}\n{}\n{}\n{}\n", ctx.method.to_lowercase(), ctx.path, params, headers)
}

/// Compute the COS `Authorization` value.
pub fn cos_authorization(
    ctx: &SigningContext,
    secret_id: &str,
    secret_key: &str,
) -> Result<String, ProviderError> {
    require(secret_id, "COS SecretId")?;
    require(secret_key, "COS SecretKey")?;

    let key_time = format!(
        "{};{}",
        ctx.timestamp - COS_SIGN_SKEW_SECS,
        ctx.timestamp + COS_SIGN_TTL_SECS
    );
    let sign_key = hex::encode(hmac_sha1(secret_key.as_bytes(), key_time.as_bytes())?);

    let (_, param_list) = cos_canonical_pairs(&ctx.params);
    let (_, header_list) = cos_canonical_pairs(&ctx.headers);

    let http_string_hash = hex::encode(Sha1::digest(cos_http_string(ctx).as_bytes()));
    let string_to_sign = format!("sha1\n{}\n{}\n", key_time, http_string_hash);
    let signature = hex::encode(hmac_sha1(sign_key.as_bytes(), string_to_sign.as_bytes())?);

    Ok(format!(
        "q-sign-algorithm=sha1&q-ak={}&q-sign-time={}&q-key-time={}&q-header-list={}&q-url-param-list={}&q-signature={}",
        secret_id, key_time, key_time, header_list, param_list, signature
    ))
}

/// OSS string to sign.
///
/// `METHOD\n{content-md5}\n{content-type}\n{date}\n{x-oss-* headers}/{bucket}{resource}`;
/// without `x-oss-*` headers and Content-MD5 this is exactly
/// `METHOD\n\n{content-type}\n{date}\n/{bucket}{resource}`.
pub fn oss_string_to_sign(ctx: &SigningContext, bucket: &str) -> String {
    let oss_headers: BTreeMap<String, String> = ctx
        .headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| k.starts_with("x-oss-"))
        .collect();
    let canonical_headers: String = oss_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    format!(
        "{}\n{}\n{}\n{}\n{}/{}{}",
        ctx.method,
        ctx.content_md5.as_deref().unwrap_or(""),
        ctx.content_type,
        ctx.http_date(),
        canonical_headers,
        bucket,
        ctx.path
    )
}

/// Compute the OSS `Authorization` header value.
pub fn oss_authorization(
    ctx: &SigningContext,
    bucket: &str,
    access_key_id: &str,
    access_key_secret: &str,
) -> Result<String, ProviderError> {
    require(access_key_id, "OSS AccessKey ID")?;
    require(access_key_secret, "OSS AccessKey Secret")?;
    let string_to_sign = oss_string_to_sign(ctx, bucket);
    let signature = BASE64.encode(hmac_sha1(access_key_secret.as_bytes(), string_to_sign.as_bytes())?);
    Ok(format!("OSS {}:{}", access_key_id, signature))
}

/// UpYun string to sign: `METHOD&URI&DATE`, plus `&MD5` only when a body hash exists.
pub fn upyun_string_to_sign(ctx: &SigningContext) -> String {
    let mut parts = vec![ctx.method.clone(), ctx.path.clone(), ctx.http_date()];
    if let Some(ref md5) = ctx.content_md5 {
        parts.push(md5.clone());
    }
    parts.join("&")
}

/// Compute the UpYun `Authorization` header value.
pub fn upyun_authorization(
    ctx: &SigningContext,
    operator: &str,
    password: &str,
) -> Result<String, ProviderError> {
    require(operator, "UpYun operator")?;
    require(password, "UpYun operator password")?;
    let key = hex::encode(Md5::digest(password.as_bytes()));
    let signature = BASE64.encode(hmac_sha1(key.as_bytes(), upyun_string_to_sign(ctx).as_bytes())?);
    Ok(format!("UPYUN {}:{}", operator, signature))
}

/// Hex MD5 of a body, as UpYun expects in `Content-MD5`
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOV_14_2023: i64 = 1_700_000_000;
    const COS_HOST: &str = "media-1250000000.cos.ap-guangzhou.myqcloud.com";

    #[test]
    fn test_http_date() {
        assert_eq!(http_date(NOV_14_2023), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn test_cos_put_vector() {
        let ctx = SigningContext::new("PUT", "/uploads/photo.jpg", NOV_14_2023 + 60)
            .header("Host", COS_HOST)
            .header("Content-Type", "image/jpeg");
        let auth = cos_authorization(&ctx, "AKIDexample", "SKexample").unwrap();
        assert_eq!(
            auth,
            "q-sign-algorithm=sha1&q-ak=AKIDexample&q-sign-time=1700000000;1700003660\
             &q-key-time=1700000000;1700003660&q-header-list=content-type;host\
             &q-url-param-list=&q-signature=71fbf9b288ca52d358392bf366dccde826a93ce2"
        );
    }

    #[test]
    fn test_cos_list_vector_sorts_params() {
        let ctx = SigningContext::new("GET", "/", NOV_14_2023 + 60)
            .param("prefix", "uploads/")
            .param("delimiter", "/")
            .param("max-keys", "1000")
            .header("Host", COS_HOST);
        let auth = cos_authorization(&ctx, "AKIDexample", "SKexample").unwrap();
        assert!(auth.contains("&q-url-param-list=delimiter;max-keys;prefix&"));
        assert!(auth.ends_with("&q-signature=3f467cd942513f76e46146c4028bee24e23ebd24"));
        for field in ["q-sign-algorithm=", "q-ak=", "q-sign-time=", "q-key-time=", "q-header-list=", "q-url-param-list=", "q-signature="] {
            assert!(auth.contains(field), "missing {}", field);
        }
    }

    #[test]
    fn test_cos_http_string_encodes_values() {
        let ctx = SigningContext::new("GET", "/", 0).param("Prefix", "a b/");
        assert_eq!(cos_http_string(&ctx), "get\n/\nprefix=a%20b%2F\n\n");
    }

    #[test]
    fn test_cos_signature_changes_with_any_input() {
        let base = SigningContext::new("PUT", "/uploads/photo.jpg", NOV_14_2023).header("Host", COS_HOST);
        let reference = cos_authorization(&base, "AKIDexample", "SKexample").unwrap();
        let other_path = SigningContext { path: "/uploads/photo.jpeg".to_string(), ..base.clone() };
        let other_time = SigningContext { timestamp: NOV_14_2023 + 1, ..base.clone() };
        assert_ne!(reference, cos_authorization(&other_path, "AKIDexample", "SKexample").unwrap());
        assert_ne!(reference, cos_authorization(&other_time, "AKIDexample", "SKexample").unwrap());
        assert_ne!(reference, cos_authorization(&base, "AKIDexample", "SKexamplf").unwrap());
    }

    #[test]
    fn test_cos_missing_secret_is_configuration_error() {
        let ctx = SigningContext::new("GET", "/", NOV_14_2023);
        assert!(matches!(cos_authorization(&ctx, "AKID", " "), Err(ProviderError::NotConfigured(_))));
    }

    #[test]
    fn test_oss_vector() {
        let ctx = SigningContext::new("PUT", "/uploads/photo.jpg", NOV_14_2023).content_type("image/jpeg");
        assert_eq!(
            oss_string_to_sign(&ctx, "media"),
            "PUT\n\nimage/jpeg\nTue, 14 Nov 2023 22:13:20 GMT\n/media/uploads/photo.jpg"
        );
        assert_eq!(
            oss_authorization(&ctx, "media", "LTAIexample", "OSSsecret").unwrap(),
            "OSS LTAIexample:i3B1jtKbF2si9nLrsf1XS8BgKb4="
        );
    }

    #[test]
    fn test_oss_copy_source_header_is_canonicalized() {
        let ctx = SigningContext::new("PUT", "/uploads/new.jpg", NOV_14_2023)
            .header("X-OSS-Copy-Source", "/media/uploads/photo.jpg")
            .header("Host", "media.oss-cn-hangzhou.aliyuncs.com");
        assert_eq!(
            oss_string_to_sign(&ctx, "media"),
            "PUT\n\n\nTue, 14 Nov 2023 22:13:20 GMT\nx-oss-copy-source:/media/uploads/photo.jpg\n/media/uploads/new.jpg"
        );
        assert_eq!(
            oss_authorization(&ctx, "media", "LTAIexample", "OSSsecret").unwrap(),
            "OSS LTAIexample:TDCUNDH2qUzmEQISW+NhGf8osJM="
        );
    }

    #[test]
    fn test_upyun_without_body_ends_at_date() {
        let ctx = SigningContext::new("GET", "/media-bucket/uploads/", NOV_14_2023).content_md5(None);
        let sts = upyun_string_to_sign(&ctx);
        assert_eq!(sts, "GET&/media-bucket/uploads/&Tue, 14 Nov 2023 22:13:20 GMT");
        assert!(!sts.ends_with('&'));
        assert_eq!(
            upyun_authorization(&ctx, "editor", "upyun-pass").unwrap(),
            "UPYUN editor:MhMr6++JXrF0f7FeDky/nfN0Gj4="
        );
    }

    #[test]
    fn test_upyun_empty_md5_is_omitted_not_blank() {
        let with_empty = SigningContext::new("GET", "/b/", NOV_14_2023).content_md5(Some(String::new()));
        let without = SigningContext::new("GET", "/b/", NOV_14_2023);
        assert_eq!(upyun_string_to_sign(&with_empty), upyun_string_to_sign(&without));
    }

    #[test]
    fn test_upyun_with_body_hash() {
        let ctx = SigningContext::new("PUT", "/media-bucket/uploads/photo.jpg", NOV_14_2023)
            .content_md5(Some(md5_hex(b"")));
        assert_eq!(
            upyun_string_to_sign(&ctx),
            "PUT&/media-bucket/uploads/photo.jpg&Tue, 14 Nov 2023 22:13:20 GMT&d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            upyun_authorization(&ctx, "editor", "upyun-pass").unwrap(),
            "UPYUN editor:PWvYtegllZw3urttySqVg8ikWv4="
        );
    }
}
