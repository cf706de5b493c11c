use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::Response;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkChoice, ChunkDelta, MessageContent, Usage,
};
use crate::token::message_token_count;

use super::{
    Adapter, Endpoint, LineBuffer, ProxyRequest, UpstreamError, sse_data_line, sse_response,
    unix_timestamp,
};

const COZE_CHAT_PATH: &str = "/open_api/v2/chat";

/// Translates OpenAI chat completions to the Coze v2 chat API and maps the
/// responses back. Only the chat completion endpoint is supported; anything
/// else is handed back to the dispatcher for the next candidate.
pub struct CozeAdapter {
    url: String,
    key: String,
    client: Client,
}

impl CozeAdapter {
    pub fn new(server: String, key: String, client: Client) -> Self {
        let server = server.trim_end_matches('/').to_string();
        let url = if server.ends_with(COZE_CHAT_PATH) {
            server
        } else {
            format!("{server}{COZE_CHAT_PATH}")
        };
        Self { url, key, client }
    }

    fn outbound_key<'a>(&'a self, req: &'a ProxyRequest) -> &'a str {
        req.user_key().unwrap_or(&self.key)
    }
}

#[async_trait]
impl Adapter for CozeAdapter {
    async fn serve(&self, req: &ProxyRequest) -> Result<Response<Body>, UpstreamError> {
        if Endpoint::from_path(&req.path) != Some(Endpoint::ChatCompletion) {
            warn!("unsupported endpoint for coze: {}", req.path);
            return Err(UpstreamError::retry("unsupported endpoint for coze"));
        }

        let chat: ChatCompletionRequest = serde_json::from_slice(&req.body)
            .map_err(|e| UpstreamError::retry(format!("decode request failed: {e}")))?;
        if chat.messages.is_empty() {
            return Err(UpstreamError::retry("chat request has no messages"));
        }

        if chat.stream {
            self.stream(req, chat).await
        } else {
            self.completion(req, chat).await
        }
    }
}

impl CozeAdapter {
    async fn completion(
        &self,
        req: &ProxyRequest,
        chat: ChatCompletionRequest,
    ) -> Result<Response<Body>, UpstreamError> {
        let coze_req = to_coze_request(&chat, false);

        let resp = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header(
                "authorization",
                format!("Bearer {}", self.outbound_key(req)),
            )
            .json(&coze_req)
            .send()
            .await
            .map_err(|e| UpstreamError::retry(format!("coze request failed: {e}")))?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpstreamError::retry(format!(
                "coze request failed: {}",
                resp.status()
            )));
        }

        let coze_resp: CozeResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::retry(format!("decode coze response failed: {e}")))?;
        if coze_resp.code != 0 {
            return Err(UpstreamError::retry(format!(
                "coze chat failed: {}",
                coze_resp.msg
            )));
        }

        debug!("coze non-stream response: {} messages", coze_resp.messages.len());

        let completion = to_completion(&chat, &coze_resp.messages);
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
        let coze_req = to_coze_request(&chat, true);

        let resp = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header(
                "authorization",
                format!("Bearer {}", self.outbound_key(req)),
            )
            .json(&coze_req)
            .send()
            .await
            .map_err(|e| UpstreamError::retry(format!("coze request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            warn!(
                "coze stream request failed: {} {}",
                status,
                String::from_utf8_lossy(&body[..body.len().min(200)])
            );
            return Err(UpstreamError::retry(format!(
                "coze request failed: {status}"
            )));
        }

        let model = chat.model.clone();
        let mut upstream = resp.bytes_stream();
        let mut lines = LineBuffer::default();

        // Decode until the first answer event so that failures before any
        // output remain retryable. After this point the response is
        // committed and stream errors close it gracefully instead.
        let mut first: Option<CozeMessage> = None;
        let mut pending: Vec<String> = Vec::new();
        while first.is_none() {
            let chunk = match upstream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("coze stream read failed before first frame: {e}");
                    return Err(UpstreamError::retry(format!("read coze stream: {e}")));
                }
                // EOF without any answer: emit an empty, well-formed stream.
                None => {
                    return Ok(sse_response(Body::from("data: [DONE]\n\n")));
                }
            };

            let mut batch = lines.push(&chunk).into_iter();
            for line in batch.by_ref() {
                match parse_event_line(&line) {
                    Err(e) => {
                        warn!("decode coze event failed before first frame: {e}");
                        return Err(UpstreamError::retry(format!("decode coze event: {e}")));
                    }
                    Ok(CozeEvent::Error(msg)) => {
                        warn!("coze chat failed: {msg}");
                        return Err(UpstreamError::retry(format!("coze chat failed: {msg}")));
                    }
                    Ok(CozeEvent::Answer(message)) => {
                        first = Some(message);
                        break;
                    }
                    Ok(CozeEvent::Ignore) => {}
                }
            }
            // lines already split out of the chunk that carried the first
            // answer still belong to the committed stream
            pending = batch.collect();
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let first = first.expect("loop exits only with a first answer");
        let _ = tx.send(Ok(Bytes::from(frame(&answer_chunk(0, &model, &first))))).await;

        tokio::spawn(async move {
            let mut index = 1usize;

            if emit_lines(pending, &mut index, &model, &tx).await.is_err() {
                return;
            }

            loop {
                let chunk = match upstream.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        warn!("coze stream read failed: {e}");
                        // Close out the committed stream instead of retrying.
                        let _ = tx.send(Ok(Bytes::from(frame(&stop_chunk(&model))))).await;
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

enum CozeEvent {
    Answer(CozeMessage),
    Error(String),
    Ignore,
}

fn parse_event_line(line: &str) -> Result<CozeEvent, serde_json::Error> {
    let Some(data) = sse_data_line(line) else {
        return Ok(CozeEvent::Ignore);
    };
    if data.is_empty() {
        return Ok(CozeEvent::Ignore);
    }

    let event: CozeResponse = serde_json::from_str(data)?;
    if event.event == "error" {
        return Ok(CozeEvent::Error(event.error_information.msg));
    }
    if event.event == "message" && event.message.kind == "answer" {
        return Ok(CozeEvent::Answer(event.message));
    }
    Ok(CozeEvent::Ignore)
}

/// Translate a batch of decoded lines into chunk frames. `Err` means the
/// stream was terminated (stop chunk + `[DONE]` already sent or the client
/// went away) and the caller must stop.
async fn emit_lines(
    batch: Vec<String>,
    index: &mut usize,
    model: &str,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ()> {
    for line in batch {
        match parse_event_line(&line) {
            Err(e) => {
                warn!("decode coze event failed: {e}");
                let _ = tx.send(Ok(Bytes::from(frame(&stop_chunk(model))))).await;
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                return Err(());
            }
            Ok(CozeEvent::Error(msg)) => {
                warn!("coze chat failed mid-stream: {msg}");
                let _ = tx.send(Ok(Bytes::from(frame(&stop_chunk(model))))).await;
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                return Err(());
            }
            Ok(CozeEvent::Answer(message)) => {
                let data = frame(&answer_chunk(*index, model, &message));
                *index += 1;
                if tx.send(Ok(Bytes::from(data))).await.is_err() {
                    return Err(());
                }
            }
            Ok(CozeEvent::Ignore) => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct CozeRequest {
    bot_id: String,
    user: String,
    query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<CozeMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CozeResponse {
    messages: Vec<CozeMessage>,
    code: i64,
    msg: String,
    // stream events
    event: String,
    message: CozeMessage,
    error_information: CozeErrorInformation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CozeMessage {
    role: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    kind: String,
    content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    content_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CozeErrorInformation {
    msg: String,
}

fn to_coze_message(message: &ChatMessage) -> CozeMessage {
    CozeMessage {
        role: message.role.clone(),
        kind: if message.role == "assistant" {
            "answer".to_string()
        } else {
            String::new()
        },
        content: message.text_content(),
        content_type: "text".to_string(),
    }
}

/// The bot id rides in the model field; the last message is the query and,
/// in stream mode, the rest become the chat history.
fn to_coze_request(chat: &ChatCompletionRequest, stream: bool) -> CozeRequest {
    let history = if stream {
        &chat.messages[..chat.messages.len() - 1]
    } else {
        &chat.messages[..]
    };

    CozeRequest {
        bot_id: chat.model.clone(),
        user: "apiuser".to_string(),
        query: chat
            .messages
            .last()
            .map(|m| m.text_content())
            .unwrap_or_default(),
        chat_history: history.iter().map(to_coze_message).collect(),
        stream,
    }
}

fn to_completion(chat: &ChatCompletionRequest, messages: &[CozeMessage]) -> ChatCompletionResponse {
    let choices: Vec<ChatChoice> = messages
        .iter()
        .filter(|m| m.kind == "answer")
        .enumerate()
        .map(|(i, m)| ChatChoice {
            index: i as u32,
            message: ChatMessage {
                role: m.role.clone(),
                content: Some(MessageContent::Text(m.content.clone())),
                extra: Default::default(),
            },
            finish_reason: None,
        })
        .collect();

    // Coze reports no usage; estimate it from the transcript.
    let mut transcript = chat.messages.clone();
    transcript.extend(messages.iter().map(|m| ChatMessage {
        role: m.role.clone(),
        content: Some(MessageContent::Text(m.content.clone())),
        extra: Default::default(),
    }));

    let input_tokens = message_token_count(&chat.messages, &chat.model);
    let mut total_tokens = message_token_count(&transcript, &chat.model);
    if total_tokens < input_tokens {
        total_tokens = input_tokens + 200;
    }

    ChatCompletionResponse {
        model: chat.model.clone(),
        choices,
        usage: Usage {
            prompt_tokens: input_tokens as u32,
            completion_tokens: (total_tokens - input_tokens) as u32,
            total_tokens: total_tokens as u32,
            extra: Default::default(),
        },
        id: String::new(),
        object: String::new(),
        created: 0,
        extra: Default::default(),
    }
}

fn answer_chunk(index: usize, model: &str, message: &CozeMessage) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: index.to_string(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some(message.role.clone()),
                content: Some(message.content.clone()),
                extra: Default::default(),
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

fn stop_chunk(model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "final".to_string(),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some("stop".to_string()),
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

    fn chat(messages: &[(&str, &str)], stream: bool) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "bot-42",
            "stream": stream,
            "messages": messages
                .iter()
                .map(|(role, content)| serde_json::json!({"role": role, "content": content}))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn stream_request_splits_query_from_history() {
        let req = to_coze_request(&chat(&[("user", "a"), ("assistant", "b"), ("user", "c")], true), true);
        assert_eq!(req.bot_id, "bot-42");
        assert_eq!(req.query, "c");
        assert_eq!(req.chat_history.len(), 2);
        assert_eq!(req.chat_history[1].kind, "answer");
        assert!(req.stream);
    }

    #[test]
    fn non_stream_request_keeps_full_history() {
        let req = to_coze_request(&chat(&[("user", "a"), ("user", "b")], false), false);
        assert_eq!(req.query, "b");
        assert_eq!(req.chat_history.len(), 2);
    }

    #[test]
    fn completion_keeps_only_answer_messages() {
        let chat = chat(&[("user", "hello")], false);
        let messages = vec![
            CozeMessage {
                role: "assistant".to_string(),
                kind: "follow_up".to_string(),
                content: "next?".to_string(),
                content_type: "text".to_string(),
            },
            CozeMessage {
                role: "assistant".to_string(),
                kind: "answer".to_string(),
                content: "hi there".to_string(),
                content_type: "text".to_string(),
            },
        ];

        let completion = to_completion(&chat, &messages);
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].message.text_content(), "hi there");
        assert!(completion.usage.total_tokens >= completion.usage.prompt_tokens);
    }

    #[test]
    fn chunk_frames_are_sse_lines() {
        let msg = CozeMessage {
            role: "assistant".to_string(),
            kind: "answer".to_string(),
            content: "partial".to_string(),
            content_type: "text".to_string(),
        };
        let data = frame(&answer_chunk(3, "bot-42", &msg));
        assert!(data.starts_with("data: {"));
        assert!(data.ends_with("\n\n"));
        assert!(data.contains(r#""content":"partial""#));
        assert!(data.contains(r#""id":"3""#));
    }

    #[test]
    fn stream_event_deserializes() {
        let raw = r#"{"event":"message","message":{"role":"assistant","type":"answer","content":"!","content_type":"text"},"is_finish":false,"index":0,"conversation_id":"123"}"#;
        let ev: CozeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.event, "message");
        assert_eq!(ev.message.kind, "answer");
        assert_eq!(ev.message.content, "!");
    }
}
