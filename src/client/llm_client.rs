//! HTTP stage invoker for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI API schema is the de facto standard
//! - K_i: Aggregators (OpenRouter) and on-prem (vLLM, Ollama) all support it
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Throttling and outages are classified, not retried, here

use crate::client::{InvokeError, StageInvoker};
use crate::models::{EndpointConfig, PipelineError, expand_env_vars, expand_headers};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// LLM client for any OpenAI-compatible endpoint.
///
/// The stage template is sent as the system message and the chunk text as
/// the user message. Each `invoke` is exactly one HTTP request.
pub struct LLMClient {
    client: reqwest::Client,
    /// Base URL for the API
    base_url: String,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Model ID
    model: String,
    /// Custom headers to include in requests
    custom_headers: HashMap<String, String>,
    /// Request timeout
    timeout: Duration,
    max_tokens: u32,
    temperature: f64,
    // Usage tracking
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
}

impl LLMClient {
    /// Create a client from endpoint configuration.
    pub fn from_config(config: &EndpointConfig, api_key: Option<String>) -> Result<Self, PipelineError> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|k| expand_env_vars(&k)),
            model: config.model.clone(),
            custom_headers: expand_headers(&config.headers),
            timeout,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build headers for a request.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(ref api_key) = self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    /// Get total tokens tracked as (input, output).
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl StageInvoker for LLMClient {
    async fn invoke(&self, stage_prompt: &str, chunk_text: &str) -> Result<String, InvokeError> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![Message::system(stage_prompt), Message::user(chunk_text)],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout(self.timeout)
                } else {
                    InvokeError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| InvokeError::permanent(format!("Failed to parse response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| InvokeError::permanent("No choices in response"))?;

        if let Some(usage) = body.usage {
            self.total_input_tokens
                .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.total_output_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }

        debug!(
            model = %self.model,
            duration_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );
        Ok(content)
    }
}

/// Longest provider backoff hint honoured.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Read a `retry-after` header given in seconds, capped at [`MAX_RETRY_AFTER`].
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|hint| hint.min(MAX_RETRY_AFTER))
}

/// Map a non-success HTTP status to an invocation error.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> InvokeError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return InvokeError::Throttled { retry_after };
    }

    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    // 408 and 5xx clear on their own; every other 4xx is the request's fault.
    let transient = status == StatusCode::REQUEST_TIMEOUT || status.is_server_error();

    InvokeError::Rejected {
        status: Some(status.as_u16()),
        message,
        permanent: !transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_throttled() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "",
        );
        assert_eq!(
            err,
            InvokeError::Throttled {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_classify_client_error_is_permanent() {
        let body = r#"{"error": {"message": "maximum context length exceeded"}}"#;
        let err = classify_status(StatusCode::BAD_REQUEST, None, body);
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Rejected (status 400): maximum context length exceeded"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("2.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(2500)));
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("-1"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_caps_huge_hints() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1e30"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));
        headers.insert("retry-after", HeaderValue::from_static("inf"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_from_config_trims_base_url() {
        let config = EndpointConfig {
            base_url: "http://localhost:11434/v1/".to_string(),
            ..Default::default()
        };
        let client = LLMClient::from_config(&config, None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434/v1");
        assert!(client.headers().get(AUTHORIZATION).is_none());
        assert_eq!(client.total_tokens(), (0, 0));
    }
}
