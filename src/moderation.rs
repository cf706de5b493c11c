use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::openai::{ChatCompletionRequest, MessageContent};

const MODERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("moderation request failed({code}): {message}")]
    Api { code: String, message: String },
    #[error("moderation request timed out")]
    Timeout,
}

/// Client of an OpenAI-shaped `/v1/moderations` endpoint. Calls carry a
/// tight deadline so a slow moderation service cannot stall dispatch.
pub struct ModerationClient {
    server: String,
    key: String,
    model: String,
    client: Client,
}

impl ModerationClient {
    pub fn new(server: &str, key: &str, model: &str, client: Client) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            key: key.to_string(),
            model: model.to_string(),
            client,
        }
    }

    pub fn request_for_chat(&self, chat: &ChatCompletionRequest) -> ModerationRequest {
        let mut input = Vec::new();
        for message in &chat.messages {
            match &message.content {
                Some(MessageContent::Text(text)) if !text.is_empty() => {
                    input.push(ModerationInput::text(text));
                }
                Some(MessageContent::Parts(parts)) => {
                    for part in parts {
                        if part.kind == "text" {
                            if let Some(text) = &part.text {
                                input.push(ModerationInput::text(text));
                            }
                        } else if part.kind == "image_url"
                            && let Some(image) = &part.image_url
                            && !image.url.is_empty()
                        {
                            input.push(ModerationInput::image(&image.url));
                        }
                    }
                }
                _ => {}
            }
        }

        ModerationRequest {
            input,
            model: self.model.clone(),
        }
    }

    pub async fn check(
        &self,
        request: &ModerationRequest,
    ) -> Result<ModerationResponse, ModerationError> {
        let send = async {
            let resp = self
                .client
                .post(format!("{}/v1/moderations", self.server))
                .header("authorization", format!("Bearer {}", self.key))
                .json(request)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.bytes().await.unwrap_or_default();
                let parsed: ModerationErrorResponse =
                    serde_json::from_slice(&body).unwrap_or_default();
                return Err(ModerationError::Api {
                    code: if parsed.error.code.is_empty() {
                        status.as_u16().to_string()
                    } else {
                        parsed.error.code
                    },
                    message: if parsed.error.message.is_empty() {
                        String::from_utf8_lossy(&body[..body.len().min(200)]).to_string()
                    } else {
                        parsed.error.message
                    },
                });
            }

            Ok(resp.json::<ModerationResponse>().await?)
        };

        tokio::time::timeout(MODERATION_TIMEOUT, send)
            .await
            .map_err(|_| ModerationError::Timeout)?
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationRequest {
    pub input: Vec<ModerationInput>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationInput {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ModerationImageUrl>,
}

impl ModerationInput {
    fn text(text: &str) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.to_string()),
            image_url: None,
        }
    }

    fn image(url: &str) -> Self {
        Self {
            kind: "image_url".to_string(),
            text: None,
            image_url: Some(ModerationImageUrl {
                url: url.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModerationResponse {
    pub id: String,
    pub model: String,
    pub results: Vec<ModerationResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModerationResult {
    pub flagged: bool,
    pub categories: HashMap<String, bool>,
    pub category_scores: HashMap<String, f64>,
}

impl ModerationResponse {
    /// Whether any category of any result scores at or above the threshold.
    pub fn flagged(&self, threshold: f64) -> bool {
        self.results
            .iter()
            .flat_map(|r| r.category_scores.values())
            .any(|score| *score >= threshold)
    }

    /// Every category scoring at or above the threshold, sorted for stable
    /// output.
    pub fn flagged_categories(&self, threshold: f64) -> Vec<String> {
        let mut out: Vec<String> = self
            .results
            .iter()
            .flat_map(|r| r.category_scores.iter())
            .filter(|(_, score)| **score >= threshold)
            .map(|(category, _)| category.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ModerationErrorResponse {
    error: ModerationApiError,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ModerationApiError {
    message: String,
    code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn response(scores: &[(&str, f64)]) -> ModerationResponse {
        ModerationResponse {
            results: vec![ModerationResult {
                flagged: false,
                categories: HashMap::new(),
                category_scores: scores
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn flagged_compares_scores_to_threshold() {
        let resp = response(&[("hate", 0.9), ("violence", 0.2)]);
        assert!(resp.flagged(0.7));
        assert!(!resp.flagged(0.95));
        assert_eq!(resp.flagged_categories(0.7), vec!["hate"]);
        assert!(resp.flagged_categories(0.95).is_empty());
    }

    #[test]
    fn chat_conversion_collects_text_and_images() {
        let chat: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"gpt-4","messages":[
                {"role":"user","content":"plain"},
                {"role":"user","content":[
                    {"type":"text","text":"part"},
                    {"type":"image_url","image_url":{"url":"https://x/a.png"}}
                ]},
                {"role":"assistant","content":""}
            ]}"#,
        )
        .unwrap();

        let client =
            ModerationClient::new("https://api.openai.com/", "sk", "omni-moderation-latest", Client::new());
        let req = client.request_for_chat(&chat);

        assert_eq!(req.model, "omni-moderation-latest");
        assert_eq!(req.input.len(), 3);
        assert_eq!(req.input[0].text.as_deref(), Some("plain"));
        assert_eq!(req.input[1].text.as_deref(), Some("part"));
        assert_eq!(
            req.input[2].image_url.as_ref().map(|u| u.url.as_str()),
            Some("https://x/a.png")
        );
    }
}
