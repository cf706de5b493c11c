use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use futures_util::TryStreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkChoice, ChunkDelta,
};
use crate::upstream::CompiledRule;

use super::{
    Adapter, CarriedResponse, Endpoint, ProxyRequest, UpstreamError, filter_request_headers,
    filter_response_headers, parse_error_message, sse_response,
};

/// Transparent reverse proxy for OpenAI-compatible upstreams. Rewrites the
/// model field and the authorization header, forwards everything else
/// untouched, and classifies upstream failures for the retry loop.
pub struct TransparentAdapter {
    server: String,
    key: String,
    client: Client,
    rule: Arc<CompiledRule>,
}

impl TransparentAdapter {
    pub fn new(server: String, key: String, client: Client, rule: Arc<CompiledRule>) -> Result<Self> {
        reqwest::Url::parse(&server)?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            key,
            client,
            rule,
        })
    }

    fn outbound_key<'a>(&'a self, req: &'a ProxyRequest) -> &'a str {
        req.user_key().unwrap_or(&self.key)
    }

    fn target_url(&self, req: &ProxyRequest) -> String {
        match &req.query {
            Some(q) => format!("{}{}?{}", self.server, req.path, q),
            None => format!("{}{}", self.server, req.path),
        }
    }
}

#[async_trait]
impl Adapter for TransparentAdapter {
    async fn serve(&self, req: &ProxyRequest) -> Result<Response<Body>, UpstreamError> {
        let mut body = req.body.clone();

        if Endpoint::has_model(&req.path) && req.has_body() && !body.is_empty() {
            // non-JSON bodies (multipart uploads) are forwarded untouched
            if let Some((rewritten, fallback)) = rewrite_model(&self.rule, &body) {
                body = rewritten;
                if fallback {
                    return self.serve_stream_fallback(req, &body).await;
                }
            }
        }

        let mut headers = filter_request_headers(&req.headers);
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.outbound_key(req)))
            .map_err(|e| UpstreamError::retry(format!("invalid outbound key: {e}")))?;
        headers.insert(HeaderName::from_static("authorization"), auth);

        let url = self.target_url(req);
        debug!("forwarding {} {} to {}", req.method, req.path, url);

        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .headers(headers);
        if req.has_body() {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| UpstreamError::retry(format!("upstream request failed: {e}")))?;

        let status = resp.status();
        let resp_headers = filter_response_headers(resp.headers());

        match classify_status(status) {
            StatusClass::Pass => {
                let mut builder = Response::builder().status(status);
                for (name, value) in resp_headers.iter() {
                    builder = builder.header(name, value);
                }
                let stream = resp.bytes_stream().map_err(std::io::Error::other);
                Ok(builder
                    .body(Body::from_stream(stream))
                    .unwrap_or_else(|_| Response::new(Body::empty())))
            }
            class => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| UpstreamError::retry(format!("read upstream body: {e}")))?;
                let message = parse_error_message(status, &bytes);

                let retryable = match class {
                    StatusClass::RetryNoResponse => true,
                    StatusClass::RetryCarried => true,
                    StatusClass::RetryCarriedIf(needle) => {
                        contains_bytes(&bytes, needle.as_bytes())
                    }
                    StatusClass::Pass => unreachable!(),
                };

                if !retryable {
                    let mut builder = Response::builder().status(status);
                    for (name, value) in resp_headers.iter() {
                        builder = builder.header(name, value);
                    }
                    return Ok(builder
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| Response::new(Body::empty())));
                }

                if matches!(class, StatusClass::RetryNoResponse) {
                    Err(UpstreamError::retry(message))
                } else {
                    Err(UpstreamError::carried(message, CarriedResponse {
                        status,
                        headers: resp_headers,
                        body: bytes,
                    }))
                }
            }
        }
    }
}

impl TransparentAdapter {
    /// Models that reject streaming: perform one non-streaming POST and
    /// synthesize the SSE frames the client asked for.
    async fn serve_stream_fallback(
        &self,
        req: &ProxyRequest,
        body: &[u8],
    ) -> Result<Response<Body>, UpstreamError> {
        let mut chat: ChatCompletionRequest = serde_json::from_slice(body)
            .map_err(|e| UpstreamError::retry(format!("decode chat request: {e}")))?;

        let include_usage = chat
            .stream_options
            .as_ref()
            .is_some_and(|o| o.include_usage);

        chat.stream = false;
        chat.stream_options = None;
        for message in &mut chat.messages {
            if message.role == "system" {
                message.role = "user".to_string();
            }
        }

        let url = format!("{}/v1/chat/completions", self.server);
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header(
                "authorization",
                format!("Bearer {}", self.outbound_key(req)),
            )
            .json(&chat)
            .send()
            .await
            .map_err(|e| UpstreamError::retry(format!("upstream request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            warn!(
                "non-stream fallback request failed: {}",
                parse_error_message(status, &bytes)
            );
            return Err(UpstreamError::retry(parse_error_message(status, &bytes)));
        }

        let completion: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::retry(format!("decode upstream response: {e}")))?;

        let frames = synthesize_sse(&completion, include_usage);
        Ok(sse_response(Body::from(frames)))
    }
}

enum StatusClass {
    /// Forward unchanged.
    Pass,
    /// Retry; the response is dropped (5xx).
    RetryNoResponse,
    /// Retry carrying the response for possible verbatim forwarding.
    RetryCarried,
    /// Retry carrying the response only when the body contains the marker.
    RetryCarriedIf(&'static str),
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status.as_u16() >= 500 {
        return StatusClass::RetryNoResponse;
    }
    match status.as_u16() {
        // Azure reports content filtering as a 400
        400 => StatusClass::RetryCarriedIf("content_filter"),
        403 => StatusClass::RetryCarried,
        // Azure reports a missing model deployment as a 404
        404 => StatusClass::RetryCarriedIf("DeploymentNotFound"),
        401 | 429 => StatusClass::RetryCarried,
        _ => StatusClass::Pass,
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Apply the rule's model replacement to the raw body. Returns the new body
/// and whether the streaming fallback must take over (rewritten model is an
/// `o1-` one and the caller asked for a stream). `None` when the body is not
/// a JSON object.
fn rewrite_model(rule: &CompiledRule, body: &[u8]) -> Option<(bytes::Bytes, bool)> {
    let mut parsed: serde_json::Value = serde_json::from_slice(body).ok()?;

    let model = parsed
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let new_model = rule.replace_model(&model);
    let wants_stream = parsed
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    if let Some(obj) = parsed.as_object_mut() {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(new_model.clone()),
        );
    }

    let out = serde_json::to_vec(&parsed).ok()?;
    Some((out.into(), new_model.starts_with("o1-") && wants_stream))
}

/// Render the synthesized SSE frames for a non-streaming completion: one
/// delta frame per the single response, an optional usage frame, `[DONE]`.
fn synthesize_sse(completion: &ChatCompletionResponse, include_usage: bool) -> String {
    let chunk = ChatCompletionChunk {
        id: completion.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: completion.created,
        model: completion.model.clone(),
        choices: completion
            .choices
            .iter()
            .map(|choice| ChunkChoice {
                index: choice.index,
                delta: ChunkDelta {
                    role: Some(choice.message.role.clone()),
                    content: Some(choice.message.text_content()),
                    extra: choice.message.extra.clone(),
                },
                finish_reason: choice.finish_reason.clone(),
            })
            .collect(),
        usage: None,
    };

    let mut out = String::new();
    if let Ok(data) = serde_json::to_string(&chunk) {
        out.push_str(&format!("data: {data}\n\n"));
    }

    if include_usage {
        let usage_chunk = ChatCompletionChunk {
            id: format!("{}-usage", completion.id),
            object: "chat.completion.chunk".to_string(),
            created: completion.created,
            model: completion.model.clone(),
            choices: Vec::new(),
            usage: Some(completion.usage.clone()),
        };
        if let Ok(data) = serde_json::to_string(&usage_chunk) {
            out.push_str(&format!("data: {data}\n\n"));
        }
    }

    out.push_str("data: [DONE]\n\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::config::{ModelRewrite, Rule};

    fn rule_with_rewrite(src: &str, dst: &str) -> CompiledRule {
        CompiledRule::new(Rule {
            rewrite: vec![ModelRewrite {
                src: src.to_string(),
                dst: dst.to_string(),
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rewrite_replaces_model_in_place() {
        let rule = rule_with_rewrite("gpt-4", "gpt-4-turbo");
        let body = br#"{"model":"gpt-4","messages":[],"temperature":0.5}"#;
        let (out, fallback) = rewrite_model(&rule, body).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["model"], "gpt-4-turbo");
        assert_eq!(parsed["temperature"], 0.5);
        assert!(!fallback);
    }

    #[test]
    fn rewrite_triggers_fallback_for_streamed_o1() {
        let rule = rule_with_rewrite("gpt-4", "o1-mini");
        let body = br#"{"model":"gpt-4","stream":true}"#;
        let (_, fallback) = rewrite_model(&rule, body).unwrap();
        assert!(fallback);

        let body = br#"{"model":"gpt-4","stream":false}"#;
        let (_, fallback) = rewrite_model(&rule, body).unwrap();
        assert!(!fallback);
    }

    #[test]
    fn rewrite_skips_non_json_bodies() {
        let rule = rule_with_rewrite("gpt-4", "gpt-4-turbo");
        assert!(rewrite_model(&rule, b"--boundary\r\nbinary").is_none());
    }

    #[test]
    fn synthesized_frames_end_with_done() {
        let completion: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","created":1,"model":"o1-mini",
                "choices":[{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
        )
        .unwrap();

        let frames = synthesize_sse(&completion, false);
        assert_eq!(frames.matches("data: ").count(), 2);
        assert!(frames.contains(r#""content":"hello""#));
        assert!(frames.ends_with("data: [DONE]\n\n"));

        let frames = synthesize_sse(&completion, true);
        assert_eq!(frames.matches("data: ").count(), 3);
        assert!(frames.contains(r#""choices":[]"#));
        assert!(frames.contains(r#""total_tokens":5"#));
    }

    #[test]
    fn status_classification_table() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            StatusClass::RetryNoResponse
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StatusClass::RetryCarried
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            StatusClass::RetryCarried
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            StatusClass::RetryCarriedIf("content_filter")
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            StatusClass::RetryCarriedIf("DeploymentNotFound")
        ));
        assert!(matches!(
            classify_status(StatusCode::OK),
            StatusClass::Pass
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            StatusClass::Pass
        ));
    }
}
