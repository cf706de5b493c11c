use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Response, StatusCode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::upstream::CompiledRule;

pub mod anthropic;
pub mod coze;
pub mod openai;

/// Kind of upstream channel a rule speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    OpenAi,
    Coze,
    Anthropic,
}

/// OpenAI-compatible endpoints that carry a `model` field in their body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletion,
    Completion,
    ImageGeneration,
    ImageEdit,
    ImageVariation,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Moderation,
    Embedding,
}

impl Endpoint {
    /// Classify a request path. Trailing slashes are ignored.
    pub fn from_path(path: &str) -> Option<Endpoint> {
        match path.trim_end_matches('/') {
            "/v1/chat/completions" => Some(Endpoint::ChatCompletion),
            "/v1/completions" => Some(Endpoint::Completion),
            "/v1/images/generations" => Some(Endpoint::ImageGeneration),
            "/v1/images/edits" => Some(Endpoint::ImageEdit),
            "/v1/images/variations" => Some(Endpoint::ImageVariation),
            "/v1/audio/speech" => Some(Endpoint::AudioSpeech),
            "/v1/audio/transcriptions" => Some(Endpoint::AudioTranscription),
            "/v1/audio/translations" => Some(Endpoint::AudioTranslation),
            "/v1/moderations" => Some(Endpoint::Moderation),
            "/v1/embeddings" => Some(Endpoint::Embedding),
            _ => None,
        }
    }

    pub fn has_model(path: &str) -> bool {
        Endpoint::from_path(path).is_some()
    }

    pub fn needs_moderation(path: &str) -> bool {
        matches!(
            Endpoint::from_path(path),
            Some(Endpoint::ChatCompletion | Endpoint::Completion)
        )
    }
}

/// The inbound request, buffered once so it can be replayed across retries.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn has_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::OPTIONS && self.method != Method::HEAD
    }

    /// Client-supplied key that overrides the rule key for this request.
    pub fn user_key(&self) -> Option<&str> {
        self.headers
            .get("x-user-key")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
    }
}

/// An upstream response preserved alongside a retryable error, forwarded
/// verbatim to the client if every candidate fails.
#[derive(Debug, Clone)]
pub struct CarriedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CarriedResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in self.headers.iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Failure of one upstream attempt. Every variant is retryable; the
/// dispatcher decides what to do once the pool is exhausted.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{message}")]
    Retry { message: String },
    #[error("{message}")]
    RetryWithResponse {
        message: String,
        response: CarriedResponse,
    },
}

impl UpstreamError {
    pub fn retry(message: impl Into<String>) -> Self {
        UpstreamError::Retry {
            message: message.into(),
        }
    }

    pub fn carried(message: impl Into<String>, response: CarriedResponse) -> Self {
        UpstreamError::RetryWithResponse {
            message: message.into(),
            response,
        }
    }

}

/// Per-upstream request handler. An adapter either produces the client
/// response or reports a retryable failure, never both; once it has returned
/// a response the dispatcher will not retry the attempt.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn serve(&self, req: &ProxyRequest) -> Result<Response<Body>, UpstreamError>;
}

/// Outbound HTTP clients, long-lived and connection-pooled. Rules flagged
/// `proxy: true` use the SOCKS5 client when one is configured.
#[derive(Clone)]
pub struct HttpClients {
    direct: Client,
    socks: Option<Client>,
}

impl HttpClients {
    pub fn build(socks5: &str) -> Result<Self> {
        let direct = tuned(Client::builder()).build()?;
        let socks = if socks5.is_empty() {
            None
        } else {
            let addr = if socks5.contains("://") {
                socks5.to_string()
            } else {
                format!("socks5://{socks5}")
            };
            Some(
                tuned(Client::builder())
                    .proxy(reqwest::Proxy::all(&addr)?)
                    .build()?,
            )
        };
        Ok(Self { direct, socks })
    }

    #[cfg(test)]
    pub fn direct_only() -> Self {
        Self {
            direct: Client::new(),
            socks: None,
        }
    }

    pub fn for_rule(&self, proxy: bool) -> &Client {
        if proxy && let Some(socks) = &self.socks {
            return socks;
        }
        &self.direct
    }
}

fn tuned(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    builder
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(100)
}

/// Construct the adapter for one (server, key) pair of a rule.
pub fn build_adapter(
    rule: &Arc<CompiledRule>,
    server_index: usize,
    key_index: usize,
    clients: &HttpClients,
) -> Result<Box<dyn Adapter>> {
    let server = rule.rule.servers[server_index].clone();
    let key = rule.rule.keys[key_index].clone();
    let client = clients.for_rule(rule.rule.proxy).clone();

    Ok(match rule.rule.channel {
        ChannelType::OpenAi => Box::new(openai::TransparentAdapter::new(
            server,
            key,
            client,
            rule.clone(),
        )?),
        ChannelType::Coze => Box::new(coze::CozeAdapter::new(server, key, client)),
        ChannelType::Anthropic => Box::new(anthropic::AnthropicAdapter::new(server, key, client)),
    })
}

/// Format an upstream error body as `[status] [code] message`, looking up
/// `error.message` / top-level `message` and `code` / `error.code`.
pub fn parse_error_message(status: StatusCode, body: &[u8]) -> String {
    if body.is_empty() {
        return format!(
            "[{}] {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
    }

    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            return format!(
                "[{}] {}",
                status.as_u16(),
                String::from_utf8_lossy(&body[..body.len().min(200)])
            );
        }
    };

    let message = match parsed.get("error") {
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => parsed
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
    };

    let code = parsed
        .get("code")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            parsed
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
        });

    match code {
        Some(code) if !code.is_empty() => format!("[{}] [{}] {}", status.as_u16(), code, message),
        _ => format!("[{}] {}", status.as_u16(), message),
    }
}

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// Strip host, content-length and hop-by-hop headers before forwarding.
pub fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if name_lower == "host"
            || name_lower == "content-length"
            || is_hop_by_hop_header(&name_lower)
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Strip hop-by-hop headers plus content-length/content-encoding: reqwest may
/// have decompressed the body, so the original values no longer apply.
pub fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Wrap an SSE body with the standard event-stream headers.
pub(crate) fn sse_response(body: Body) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub(crate) fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Incremental splitter for SSE payloads that may arrive as partial frames.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk and return every newly completed line, `\r` trimmed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            out.push(text.trim_end_matches(['\n', '\r']).to_string());
        }
        out
    }
}

/// Extract the `data:` payload of an SSE line, if it is one.
pub(crate) fn sse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_classification_ignores_trailing_slash() {
        assert_eq!(
            Endpoint::from_path("/v1/chat/completions/"),
            Some(Endpoint::ChatCompletion)
        );
        assert_eq!(
            Endpoint::from_path("/v1/embeddings"),
            Some(Endpoint::Embedding)
        );
        assert_eq!(Endpoint::from_path("/v1/responses"), None);
    }

    #[test]
    fn moderation_covers_chat_and_completion_only() {
        assert!(Endpoint::needs_moderation("/v1/chat/completions"));
        assert!(Endpoint::needs_moderation("/v1/completions/"));
        assert!(!Endpoint::needs_moderation("/v1/embeddings"));
    }

    #[test]
    fn error_message_prefers_error_object() {
        let body = br#"{"error":{"message":"rate limited","code":"rate_limit"}}"#;
        assert_eq!(
            parse_error_message(StatusCode::TOO_MANY_REQUESTS, body),
            "[429] [rate_limit] rate limited"
        );
    }

    #[test]
    fn error_message_falls_back_to_top_level() {
        let body = br#"{"message":"boom","code":"oops"}"#;
        assert_eq!(
            parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, body),
            "[500] [oops] boom"
        );
    }

    #[test]
    fn error_message_handles_string_error_and_empty_body() {
        assert_eq!(
            parse_error_message(StatusCode::FORBIDDEN, br#"{"error":"denied"}"#),
            "[403] denied"
        );
        assert_eq!(
            parse_error_message(StatusCode::BAD_GATEWAY, b""),
            "[502] Bad Gateway"
        );
    }

    #[test]
    fn line_buffer_reassembles_partial_frames() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"data: {\"a\":"), Vec::<String>::new());
        assert_eq!(buf.push(b"1}\r\ndata: done\n"), vec![
            "data: {\"a\":1}".to_string(),
            "data: done".to_string()
        ]);
        assert_eq!(sse_data_line("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data_line(": comment"), None);
    }
}
