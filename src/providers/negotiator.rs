//! Endpoint/protocol negotiation
//!
//! Some providers (Lsky Pro in particular) ship several incompatible API
//! generations. The negotiator walks an ordered candidate list, sends one
//! request per candidate and stops at the first response whose JSON body
//! satisfies the provider's success predicate. Failures of any kind move on
//! to the next candidate; only the last candidate's error is surfaced once the
//! list is exhausted. Every candidate is attempted at most once.

use regex::Regex;
use reqwest::Method;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::transport::{HttpRequest, HttpResponse, Transport};
use super::ProviderError;

/// HTTP status Laravel answers with on a CSRF token mismatch
pub const CSRF_MISMATCH_STATUS: u16 = 419;

/// Pages a legacy deployment embeds its CSRF token in
const CSRF_PAGES: &[&str] = &["/", "/login", "/upload"];

/// How the target storage is named in a request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterShape {
    /// v2 API: `storage_id`
    StorageId,
    /// v1 API: `strategy_id`
    StrategyId,
    /// No storage parameter; the server applies the account default
    Bare,
}

impl ParameterShape {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ParameterShape::StorageId => Some("storage_id"),
            ParameterShape::StrategyId => Some("strategy_id"),
            ParameterShape::Bare => None,
        }
    }
}

/// One candidate endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttempt {
    pub method: Method,
    pub path: String,
    pub shape: ParameterShape,
}

impl EndpointAttempt {
    pub fn new(method: Method, path: &str, shape: ParameterShape) -> Self {
        Self { method, path: path.to_string(), shape }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path, ParameterShape::Bare)
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub payload: Value,
    /// The candidate that succeeded; callers may cache it
    pub attempt: EndpointAttempt,
    /// Index of the winning candidate in the list
    pub index: usize,
}

/// Success predicate shared by both Lsky generations:
/// v1 answers `status: true`, v2 answers `status: "success"`.
pub fn status_ok(payload: &Value) -> bool {
    match payload.get("status") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("success"),
        _ => false,
    }
}

/// JSON body of a response; an empty body reads as `null`
fn payload_of(response: &HttpResponse) -> Result<Value, ProviderError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        Ok(Value::Null)
    } else {
        response.json()
    }
}

fn payload_message(payload: &Value) -> String {
    payload
        .get("message")
        .or_else(|| payload.get("msg"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or("request was not accepted")
        .to_string()
}

fn csrf_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"<meta\s+name=["']csrf-token["']\s+content=["']([^"']+)["']"#,
            r#"name=["']_token["']\s+value=["']([^"']+)["']"#,
            r#"["']csrf_token["']\s*:\s*["']([^"']+)["']"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Pull a CSRF token out of an HTML page
pub fn scrape_csrf_token(html: &str) -> Option<String> {
    csrf_patterns()
        .iter()
        .find_map(|re| re.captures(html).and_then(|c| c.get(1)).map(|m| m.as_str().to_string()))
}

pub struct Negotiator<'a> {
    transport: &'a dyn Transport,
    base_url: &'a str,
    timeout: Duration,
}

impl<'a> Negotiator<'a> {
    pub fn new(transport: &'a dyn Transport, base_url: &'a str, timeout: Duration) -> Self {
        Self { transport, base_url: base_url.trim_end_matches('/'), timeout }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Try each candidate in order until one satisfies `success`.
    pub async fn negotiate<F>(
        &self,
        candidates: &[EndpointAttempt],
        build: F,
        success: fn(&Value) -> bool,
    ) -> Result<Negotiation, ProviderError>
    where
        F: Fn(&EndpointAttempt) -> Result<HttpRequest, ProviderError>,
    {
        let mut last_error =
            ProviderError::InvalidArgument("no endpoint candidates to negotiate".to_string());

        for (index, attempt) in candidates.iter().enumerate() {
            let request = match build(attempt) {
                Ok(request) => request,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            debug!("Negotiating candidate {} {} {:?}", index + 1, attempt.path, attempt.shape);
            let payload = match self.send(request).await.and_then(|r| payload_of(&r)) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("Candidate {} failed: {}", attempt.path, e);
                    last_error = e;
                    continue;
                }
            };

            if success(&payload) {
                return Ok(Negotiation { payload, attempt: attempt.clone(), index });
            }

            debug!("Candidate {} answered without success status", attempt.path);
            last_error = ProviderError::RemoteRejected {
                status: 200,
                message: payload_message(&payload),
            };
        }

        Err(last_error)
    }

    /// Execute one request; on a CSRF mismatch scrape a token and retry exactly once.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        match self.transport.execute(request.clone()).await {
            Err(e) if e.http_status() == Some(CSRF_MISMATCH_STATUS) => {
                let token = match self.fetch_csrf_token().await {
                    Some(token) => token,
                    None => return Err(e),
                };
                debug!("Retrying {} with scraped CSRF token", request.url);
                let retry = request
                    .header("X-CSRF-TOKEN", token.clone())
                    .with_form_field("_token", &token);
                self.transport.execute(retry).await
            }
            other => other,
        }
    }

    async fn fetch_csrf_token(&self) -> Option<String> {
        for page in CSRF_PAGES {
            let request = HttpRequest::new(Method::GET, self.url(page), self.timeout)
                .header("Accept", "text/html");
            match self.transport.execute(request).await {
                Ok(response) => {
                    if let Some(token) = scrape_csrf_token(&response.text()) {
                        return Some(token);
                    }
                }
                Err(e) => debug!("CSRF page {} unavailable: {}", page, e),
            }
        }
        None
    }
}
