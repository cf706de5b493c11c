use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::Response;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::openai::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ChunkChoice, ChunkDelta, MessageContent, Usage,
};

use super::{
    Adapter, Endpoint, LineBuffer, ProxyRequest, UpstreamError, parse_error_message,
    sse_data_line, sse_response, unix_timestamp,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Translates OpenAI chat completions to the Anthropic Messages API. Like the
/// Coze adapter it serves only the chat completion endpoint.
pub struct AnthropicAdapter {
    server: String,
    key: String,
    client: Client,
}

impl AnthropicAdapter {
    pub fn new(server: String, key: String, client: Client) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            key,
            client,
        }
    }

    fn outbound_key<'a>(&'a self, req: &'a ProxyRequest) -> &'a str {
        req.user_key().unwrap_or(&self.key)
    }

    async fn post_messages(
        &self,
        req: &ProxyRequest,
        payload: &MessagesRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.client
            .post(format!("{}/v1/messages", self.server))
            .header("content-type", "application/json")
            .header("x-api-key", self.outbound_key(req))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamError::retry(format!("anthropic request failed: {e}")))
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    async fn serve(&self, req: &ProxyRequest) -> Result<Response<Body>, UpstreamError> {
        if Endpoint::from_path(&req.path) != Some(Endpoint::ChatCompletion) {
            warn!("unsupported endpoint for anthropic: {}", req.path);
            return Err(UpstreamError::retry("unsupported endpoint for anthropic"));
        }

        let chat: ChatCompletionRequest = serde_json::from_slice(&req.body)
            .map_err(|e| UpstreamError::retry(format!("decode request failed: {e}")))?;

        if chat.stream {
            self.stream(req, chat).await
        } else {
            self.completion(req, chat).await
        }
    }
}

impl AnthropicAdapter {
    async fn completion(
        &self,
        req: &ProxyRequest,
        chat: ChatCompletionRequest,
    ) -> Result<Response<Body>, UpstreamError> {
        let payload = to_messages_request(&chat, false);
        let resp = self.post_messages(req, &payload).await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let message = parse_error_message(status, &bytes);
            warn!("anthropic request failed: {message}");
            return Err(UpstreamError::retry(message));
        }

        let message: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::retry(format!("decode anthropic response failed: {e}")))?;

        let completion = to_completion(&chat, &message);
        let body = serde_json::to_vec(&completion)
            .map_err(|e| UpstreamError::retry(format!("encode response failed: {e}")))?;

        Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())))
    }

    async fn stream(
        &self,
        req: &ProxyRequest,
        chat: ChatCompletionRequest,
    ) -> Result<Response<Body>, UpstreamError> {
        let payload = to_messages_request(&chat, true);
        let resp = self.post_messages(req, &payload).await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let message = parse_error_message(status, &bytes);
            warn!("anthropic stream request failed: {message}");
            return Err(UpstreamError::retry(message));
        }

        let model = chat.model.clone();
        let mut upstream = resp.bytes_stream();
        let mut lines = LineBuffer::default();

        // Same commit rule as the Coze adapter: retryable until the first
        // text delta, graceful close afterwards.
        let mut first: Option<String> = None;
        let mut pending: Vec<String> = Vec::new();
        while first.is_none() {
            let chunk = match upstream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("anthropic stream read failed before first frame: {e}");
                    return Err(UpstreamError::retry(format!("read anthropic stream: {e}")));
                }
                None => {
                    return Ok(sse_response(Body::from("data: [DONE]\n\n")));
                }
            };

            let mut batch = lines.push(&chunk).into_iter();
            for line in batch.by_ref() {
                match parse_event_line(&line) {
                    AnthropicEvent::Error(msg) => {
                        warn!("anthropic chat failed: {msg}");
                        return Err(UpstreamError::retry(format!(
                            "anthropic chat failed: {msg}"
                        )));
                    }
                    AnthropicEvent::Text(text) => {
                        first = Some(text);
                        break;
                    }
                    AnthropicEvent::Stop(_) | AnthropicEvent::Ignore => {}
                }
            }
            pending = batch.collect();
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let first = first.expect("loop exits only with a first delta");
        let _ = tx
            .send(Ok(Bytes::from(frame(&text_chunk(0, &model, Some("assistant"), &first)))))
            .await;

        tokio::spawn(async move {
            let mut index = 1usize;

            if emit_lines(pending, &mut index, &model, &tx).await.is_err() {
                return;
            }

            loop {
                let chunk = match upstream.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        warn!("anthropic stream read failed: {e}");
                        let _ = tx
                            .send(Ok(Bytes::from(frame(&finish_chunk(&model, "stop")))))
                            .await;
                        break;
                    }
                    None => break,
                };

                if emit_lines(lines.push(&chunk), &mut index, &model, &tx)
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
        });

        Ok(sse_response(Body::from_stream(ReceiverStream::new(rx))))
    }
}

enum AnthropicEvent {
    Text(String),
    Stop(String),
    Error(String),
    Ignore,
}

fn parse_event_line(line: &str) -> AnthropicEvent {
    let Some(data) = sse_data_line(line) else {
        return AnthropicEvent::Ignore;
    };
    if data.is_empty() {
        return AnthropicEvent::Ignore;
    }

    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
        return AnthropicEvent::Ignore;
    };

    match event.kind.as_str() {
        "content_block_delta" if event.delta.kind == "text_delta" => {
            AnthropicEvent::Text(event.delta.text)
        }
        // message_stop follows the final message_delta; the finish chunk is
        // driven by the stop_reason so it is emitted exactly once.
        "message_delta" => match event.delta.stop_reason {
            Some(reason) => AnthropicEvent::Stop(map_stop_reason(&reason)),
            None => AnthropicEvent::Ignore,
        },
        "error" => AnthropicEvent::Error(event.error.message),
        _ => AnthropicEvent::Ignore,
    }
}

async fn emit_lines(
    batch: Vec<String>,
    index: &mut usize,
    model: &str,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ()> {
    for line in batch {
        match parse_event_line(&line) {
            AnthropicEvent::Error(msg) => {
                warn!("anthropic chat failed mid-stream: {msg}");
                let _ = tx
                    .send(Ok(Bytes::from(frame(&finish_chunk(model, "stop")))))
                    .await;
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                return Err(());
            }
            AnthropicEvent::Text(text) => {
                let data = frame(&text_chunk(*index, model, None, &text));
                *index += 1;
                if tx.send(Ok(Bytes::from(data))).await.is_err() {
                    return Err(());
                }
            }
            AnthropicEvent::Stop(reason) => {
                if tx
                    .send(Ok(Bytes::from(frame(&finish_chunk(model, &reason)))))
                    .await
                    .is_err()
                {
                    return Err(());
                }
            }
            AnthropicEvent::Ignore => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<MessagesMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct MessagesMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MessagesResponse {
    id: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: StreamDelta,
    error: StreamError,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: String,
    text: String,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StreamError {
    message: String,
}

/// System messages are lifted into the `system` field; every other role maps
/// to user except assistant turns.
fn to_messages_request(chat: &ChatCompletionRequest, stream: bool) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in &chat.messages {
        let text = message.text_content();
        if message.role == "system" {
            system_parts.push(text);
            continue;
        }
        messages.push(MessagesMessage {
            role: if message.role == "assistant" {
                "assistant".to_string()
            } else {
                "user".to_string()
            },
            content: text,
        });
    }

    MessagesRequest {
        model: chat.model.clone(),
        max_tokens: chat
            .extra
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: system_parts.join("\n"),
        messages,
        stream,
        temperature: chat.extra.get("temperature").and_then(Value::as_f64),
        top_p: chat.extra.get("top_p").and_then(Value::as_f64),
    }
}

fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

fn to_completion(chat: &ChatCompletionRequest, message: &MessagesResponse) -> ChatCompletionResponse {
    let text: String = message
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect();

    ChatCompletionResponse {
        id: message.id.clone(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: chat.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(MessageContent::Text(text)),
                extra: Map::new(),
            },
            finish_reason: message.stop_reason.as_deref().map(map_stop_reason),
        }],
        usage: Usage {
            prompt_tokens: message.usage.input_tokens,
            completion_tokens: message.usage.output_tokens,
            total_tokens: message.usage.input_tokens + message.usage.output_tokens,
            extra: Map::new(),
        },
        extra: Map::new(),
    }
}

fn text_chunk(index: usize, model: &str, role: Option<&str>, text: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: index.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: role.map(|r| r.to_string()),
                content: Some(text.to_string()),
                extra: Map::new(),
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

fn finish_chunk(model: &str, reason: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "final".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(reason.to_string()),
        }],
        usage: None,
    }
}

fn frame(chunk: &ChatCompletionChunk) -> String {
    match serde_json::to_string(chunk) {
        Ok(data) => format!("data: {data}\n\n"),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chat(raw: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn system_messages_are_lifted() {
        let req = to_messages_request(
            &chat(serde_json::json!({
                "model": "claude-3-opus",
                "max_tokens": 100,
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                    {"role": "tool", "content": "result"}
                ]
            })),
            false,
        );

        assert_eq!(req.system, "be brief");
        assert_eq!(req.max_tokens, 100);
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.messages[1].role, "assistant");
        assert_eq!(req.messages[2].role, "user");
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let req = to_messages_request(
            &chat(serde_json::json!({
                "model": "claude-3-haiku",
                "messages": [{"role": "user", "content": "hi"}]
            })),
            true,
        );
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(req.stream);
    }

    #[test]
    fn completion_mapping_joins_text_blocks() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{"id":"msg_1","content":[{"type":"text","text":"hel"},{"type":"text","text":"lo"}],
                "stop_reason":"end_turn","usage":{"input_tokens":10,"output_tokens":4}}"#,
        )
        .unwrap();
        let chat = chat(serde_json::json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let completion = to_completion(&chat, &resp);
        assert_eq!(completion.choices[0].message.text_content(), "hello");
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.total_tokens, 14);
        assert_eq!(completion.model, "claude-3-opus");
    }

    #[test]
    fn stream_event_classification() {
        assert!(matches!(
            parse_event_line(r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#),
            AnthropicEvent::Text(t) if t == "hi"
        ));
        assert!(matches!(
            parse_event_line(r#"data: {"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":3}}"#),
            AnthropicEvent::Stop(r) if r == "length"
        ));
        assert!(matches!(
            parse_event_line(r#"data: {"type":"message_stop"}"#),
            AnthropicEvent::Ignore
        ));
        assert!(matches!(
            parse_event_line(r#"data: {"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#),
            AnthropicEvent::Error(m) if m == "busy"
        ));
        assert!(matches!(
            parse_event_line("event: content_block_delta"),
            AnthropicEvent::Ignore
        ));
    }
}
