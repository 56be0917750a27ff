//! HTTP backend for a `generateContent`-style endpoint
//!
//! One [`HttpBackend`] per model; the adapter holds them in fallback order.
//!
//! # Status mapping
//!
//! | response | error |
//! |---|---|
//! | connect/timeout, 408, 429, 5xx | `Unavailable` |
//! | other 4xx | `Rejected` |
//! | `promptFeedback.blockReason`, zero candidates | `Refused` |
//! | undecodable body | `Malformed` |

use crate::backend::{Candidate, Fragment, GenerationBackend, GenerationRequest, RawResponse};
use crate::error::BackendError;
use async_trait::async_trait;
use atelier_asset::Payload;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Header carrying the API key
const API_KEY_HEADER: &str = "x-goog-api-key";

/// One model behind an HTTP generation endpoint
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: Url,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("url", &self.url.as_str())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Create a backend for `model` under `endpoint`
    ///
    /// # Errors
    /// Returns `BackendError::Misconfigured` if the endpoint is not a valid
    /// base URL or the HTTP client cannot be built
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let model = model.into();
        let url = model_url(endpoint, &model)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Misconfigured(e.to_string()))?;
        Ok(Self {
            client,
            url,
            model,
            api_key: api_key.into(),
        })
    }

    /// Request URL
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn model_url(endpoint: &str, model: &str) -> Result<Url, BackendError> {
    let base = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{endpoint}/")
    };
    Url::parse(&base)
        .and_then(|u| u.join(&format!("models/{model}:generateContent")))
        .map_err(|e| BackendError::Misconfigured(format!("invalid endpoint {endpoint}: {e}")))
}

/// Encode a request body
#[must_use]
pub fn encode_request(request: &GenerationRequest) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": request.instruction },
                {
                    "inline_data": {
                        "mime_type": request.source.mime_type(),
                        "data": STANDARD.encode(request.source.bytes()),
                    }
                }
            ]
        }],
        "generationConfig": {
            "responseModalities": ["TEXT", "IMAGE"]
        }
    })
}

/// Decode a response body into fragments
///
/// # Errors
/// Returns `BackendError::Malformed` when the body has no recognisable shape
pub fn decode_response(body: &Value) -> Result<RawResponse, BackendError> {
    let object = body
        .as_object()
        .ok_or_else(|| BackendError::Malformed("response is not an object".into()))?;

    let block_reason = object
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(candidates) = object.get("candidates") else {
        return Ok(RawResponse {
            candidates: Vec::new(),
            block_reason,
        });
    };
    let candidates = candidates
        .as_array()
        .ok_or_else(|| BackendError::Malformed("candidates is not an array".into()))?;

    let mut decoded = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array);
        let Some(parts) = parts else {
            // Finished without content, e.g. finishReason SAFETY
            continue;
        };

        let mut fragments = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                fragments.push(Fragment::Text(text.to_string()));
            } else if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
                let Some(data) = inline.get("data").and_then(Value::as_str) else {
                    tracing::warn!("skipping inline image without data");
                    continue;
                };
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                match STANDARD.decode(data) {
                    Ok(bytes) => fragments.push(Fragment::Binary(Payload::new(bytes, mime))),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping undecodable inline image");
                    }
                }
            }
        }
        decoded.push(Candidate { fragments });
    }

    Ok(RawResponse {
        candidates: decoded,
        block_reason,
    })
}

fn map_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let message: String = body.chars().take(200).collect();
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        BackendError::Unavailable(format!("{status}: {message}"))
    } else {
        BackendError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: &GenerationRequest) -> Result<RawResponse, BackendError> {
        tracing::debug!(model = %self.model, task = request.task.label(), "calling generation endpoint");

        let response = self
            .client
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&encode_request(request))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        decode_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Task;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_is_built_under_endpoint() {
        let backend = HttpBackend::new(
            "https://gen.example.com/v1beta",
            "image-pro",
            "k",
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(
            backend.url().as_str(),
            "https://gen.example.com/v1beta/models/image-pro:generateContent"
        );
        assert!(HttpBackend::new("not a url", "m", "k", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn request_inlines_source_as_base64() {
        let request = GenerationRequest {
            task: Task::Analyze,
            source: Payload::png(b"abc".to_vec()),
            instruction: "classify".into(),
        };
        let body = encode_request(&request);
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "classify");
        assert_eq!(parts[1]["inline_data"]["data"], "YWJj");
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
    }

    #[test]
    fn decodes_interleaved_parts() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "{\"category\":\"top\"}" },
                    { "inlineData": { "mimeType": "image/webp", "data": "YWJj" } }
                ]}
            }]
        });
        let raw = decode_response(&body).unwrap();
        let fragments = raw.into_fragments().unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(
            fragments[1],
            Fragment::Binary(Payload::new(b"abc".to_vec(), "image/webp"))
        );
    }

    #[test]
    fn inline_part_without_data_is_skipped() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "mimeType": "image/png" } },
                    { "inlineData": { "mimeType": "image/png", "data": "YWJj" } }
                ]}
            }]
        });
        let fragments = decode_response(&body).unwrap().into_fragments().unwrap();
        assert_eq!(fragments, vec![Fragment::Binary(Payload::png(b"abc".to_vec()))]);
    }

    #[test]
    fn block_reason_becomes_refusal() {
        let body = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = decode_response(&body).unwrap().into_fragments().unwrap_err();
        assert_eq!(
            err,
            BackendError::Refused {
                reason: "SAFETY".into()
            }
        );

        let body = json!({ "candidates": [{ "finishReason": "SAFETY" }] });
        assert!(decode_response(&body).unwrap().into_fragments().is_err());
    }

    #[test]
    fn non_object_body_is_malformed() {
        assert!(matches!(
            decode_response(&json!([1, 2])),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn status_mapping() {
        assert!(map_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_transport());
        assert!(map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transport());
        assert_eq!(
            map_status(reqwest::StatusCode::BAD_REQUEST, "bad image"),
            BackendError::Rejected {
                status: 400,
                message: "bad image".into()
            }
        );
    }
}
