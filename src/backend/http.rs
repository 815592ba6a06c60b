//! JSON-over-HTTP generation backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{GenerationBackend, GenerationOutput};
use crate::error::BackendError;
use crate::scheduler::job::AssetSpec;

/// Client for a generation service exposing `POST {base_url}/v1/generate`.
pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    spec: &'a AssetSpec,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl HttpBackend {
    /// Creates a backend for `base_url` (e.g. "http://localhost:8080").
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Maps a non-success HTTP status to a typed backend failure.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> BackendError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            BackendError::InvalidRequest(message)
        }
        s if s.is_server_error() => {
            BackendError::Unavailable(format!("HTTP {}: {}", s.as_u16(), message))
        }
        s => BackendError::Transport(format!("HTTP {}: {}", s.as_u16(), message)),
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(
        &self,
        model_id: &str,
        spec: &AssetSpec,
    ) -> Result<GenerationOutput, BackendError> {
        let url = format!("{}/v1/generate", self.base_url);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&ApiRequest {
                model: model_id,
                spec,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        let status = http_response.status();
        if !status.is_success() {
            let retry_after =
                parse_retry_after(http_response.headers().get(reqwest::header::RETRY_AFTER));
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(classify_status(status, retry_after, &body));
        }

        http_response
            .json::<GenerationOutput>()
            .await
            .map_err(|e| BackendError::Transport(format!("Failed to parse response: {}", e)))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{AssetParams, AssetType};

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), ""),
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, None, ""),
            BackendError::Timeout
        );
        assert_eq!(
            classify_status(
                StatusCode::BAD_REQUEST,
                None,
                r#"{"error":{"message":"prompt rejected"}}"#
            ),
            BackendError::InvalidRequest("prompt rejected".into())
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None, "overloaded"),
            BackendError::Unavailable(msg) if msg.contains("503")
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            BackendError::Transport(_)
        ));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let backend = HttpBackend::new(
            "http://localhost:8080/".into(),
            Some("key".into()),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(backend.base_url(), "http://localhost:8080");
        assert!(backend.has_api_key());
    }

    #[tokio::test]
    async fn test_connection_error_is_transport() {
        // Nothing listens on port 1.
        let backend =
            HttpBackend::new("http://127.0.0.1:1".into(), None, Duration::from_secs(2)).expect("client");
        let spec = AssetSpec::new(0, "city at night", AssetParams::default_for(AssetType::Image));

        let err = backend.generate("m1", &spec).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_) | BackendError::Timeout));
    }
}
