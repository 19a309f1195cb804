//! Shared HTTP transport for every remote provider.
//!
//! `Transport::execute` is the only place a request leaves the process. It
//! applies the per-request timeout, the provider's TLS verification policy and
//! a bounded redirect policy, and turns any non-2xx answer into
//! `ProviderError::RemoteRejected` with the provider's own message.
//!
//! It never retries; fallback across endpoints belongs to the negotiator.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{sanitize_api_error, ProviderError};

/// Maximum redirects followed before giving up
const MAX_REDIRECTS: usize = 5;
/// Connection establishment timeout, independent of the total budget
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// A file attached to a multipart body
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

impl RequestBody {
    pub fn form_value(&self, key: &str) -> Option<&str> {
        match self {
            RequestBody::Form(fields) | RequestBody::Multipart { fields, .. } => fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    fn push_field(&mut self, key: &str, value: &str) {
        match self {
            RequestBody::Form(fields) | RequestBody::Multipart { fields, .. } => {
                fields.retain(|(k, _)| k != key);
                fields.push((key.to_string(), value.to_string()));
            }
            RequestBody::Empty => {
                *self = RequestBody::Form(vec![(key.to_string(), value.to_string())]);
            }
            _ => {}
        }
    }
}

/// One outbound request, fully described
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout,
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Add or replace a form field (used to attach a scraped CSRF token)
    pub fn with_form_field(mut self, key: &str, value: &str) -> Self {
        self.body.push_field(key, value);
        self
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: HashMap::new(), body: body.into() }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value, ProviderError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProviderError::ParseError(format!("Invalid JSON response: {}", e)))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(|v| v.as_str())
    }
}

/// Turn a non-2xx response into a typed rejection.
pub fn check_status(response: HttpResponse) -> Result<HttpResponse, ProviderError> {
    if (200..300).contains(&response.status) {
        Ok(response)
    } else {
        Err(ProviderError::RemoteRejected {
            status: response.status,
            message: sanitize_api_error(&response.text()),
        })
    }
}

/// Encode pairs as `application/x-www-form-urlencoded`
pub fn encode_form(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a request; `Ok` only for 2xx responses.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// `verify_tls = false` accepts self-signed certificates for this provider only.
    pub fn new(verify_tls: bool) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(concat!("mediadock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn build(&self, request: HttpRequest) -> Result<reqwest::RequestBuilder, ProviderError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout);

        for (key, value) in &request.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ProviderError::InvalidArgument(format!("Invalid header name {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProviderError::InvalidArgument(format!("Invalid header value for {}: {}", key, e)))?;
            builder = builder.header(name, value);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Form(fields) => builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encode_form(&fields)),
            RequestBody::Json(value) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| ProviderError::ParseError(format!("Failed to encode JSON body: {}", e)))?;
                builder.header(CONTENT_TYPE, "application/json").body(bytes)
            }
            RequestBody::Multipart { fields, file } => {
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                let part = reqwest::multipart::Part::bytes(file.data)
                    .file_name(file.file_name)
                    .mime_str(&file.mime)
                    .map_err(|e| ProviderError::InvalidArgument(format!("Invalid MIME type: {}", e)))?;
                builder.multipart(form.part(file.field, part))
            }
        };
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let response = self.build(request)?.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::NetworkError(format!("{} {} timed out", method, url))
            } else {
                ProviderError::NetworkError(format!("{} {} failed: {}", method, url, e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_lowercase(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::NetworkError(format!("Failed to read response body: {}", e)))?
            .to_vec();

        debug!("HTTP {} {} -> {}", method, url, status);
        check_status(HttpResponse { status, headers, body })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport: replays queued answers and records every request.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockTransport {
        replies: Mutex<VecDeque<Result<HttpResponse, ProviderError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response; non-2xx statuses surface as `RemoteRejected`.
        pub fn reply(&self, status: u16, body: &str) -> &Self {
            self.reply_with(HttpResponse::new(status, body.as_bytes().to_vec()))
        }

        pub fn reply_with(&self, response: HttpResponse) -> &Self {
            self.replies.lock().unwrap().push_back(check_status(response));
            self
        }

        pub fn fail(&self, error: ProviderError) -> &Self {
            self.replies.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::NetworkError("no scripted reply".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_passes_2xx() {
        let ok = check_status(HttpResponse::new(204, Vec::new())).unwrap();
        assert_eq!(ok.status, 204);
    }

    #[test]
    fn test_check_status_parses_xml_error() {
        let err = check_status(HttpResponse::new(
            403,
            "<Error><Code>SignatureDoesNotMatch</Code><Message>The request signature we calculated does not match</Message></Error>",
        ))
        .unwrap_err();
        match err {
            ProviderError::RemoteRejected { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "The request signature we calculated does not match");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_check_status_parses_json_error() {
        let err = check_status(HttpResponse::new(401, r#"{"msg":"operator auth failed","code":40100005}"#)).unwrap_err();
        assert_eq!(err.http_status(), Some(401));
        assert!(err.to_string().contains("operator auth failed"));
    }

    #[test]
    fn test_encode_form() {
        let fields = vec![
            ("_token".to_string(), "a b&c".to_string()),
            ("strategy_id".to_string(), "1".to_string()),
        ];
        assert_eq!(encode_form(&fields), "_token=a%20b%26c&strategy_id=1");
    }

    #[test]
    fn test_with_form_field_replaces_existing() {
        let request = HttpRequest::new(Method::POST, "https://x/api", Duration::from_secs(1))
            .body(RequestBody::Form(vec![("_token".into(), "old".into())]))
            .with_form_field("_token", "new");
        assert_eq!(request.body.form_value("_token"), Some("new"));

        let bare = HttpRequest::new(Method::POST, "https://x/api", Duration::from_secs(1)).with_form_field("k", "v");
        assert_eq!(bare.body.form_value("k"), Some("v"));
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200, Vec::new()).with_header("X-Upyun-List-Iter", "abc");
        assert_eq!(response.header("x-upyun-list-iter"), Some("abc"));
    }

    #[test]
    fn test_http_transport_builds_with_either_tls_policy() {
        assert!(HttpTransport::new(true).is_ok());
        assert!(HttpTransport::new(false).is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_replays_in_order() {
        let transport = mock::MockTransport::new();
        transport.reply(404, "missing").reply(200, "ok");
        let req = || HttpRequest::new(Method::GET, "https://x/", Duration::from_secs(1));
        assert_eq!(transport.execute(req()).await.unwrap_err().http_status(), Some(404));
        assert_eq!(transport.execute(req()).await.unwrap().text(), "ok");
        assert!(transport.execute(req()).await.is_err());
        assert_eq!(transport.call_count(), 3);
    }
}
