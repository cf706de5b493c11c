//! Token estimation for upstreams that report no usage of their own.

use tiktoken_rs::{CoreBPE, tokenizer};

use crate::openai::{ChatMessage, MessageContent};

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Estimated token cost of one image part. Vendor models price images very
/// differently; these are the coarse published figures.
fn image_tokens(model: &str, detail: Option<&str>) -> usize {
    if model == "glm-4v" {
        return 1047;
    }
    if model.starts_with("claude-") {
        // tokens = width × height / 750, assume a mid-size image
        return 1000;
    }
    match detail {
        Some("low") => 65,
        // high and auto both resolve to high-res tiling: 16 crops of 129
        _ => 129 * 16,
    }
}

/// Estimate the token count of a chat transcript. Mirrors the usual
/// tiktoken accounting: a fixed per-message overhead, role + content
/// encodings, and a 3-token reply primer. Image parts are still priced by
/// the real model name.
pub fn message_token_count(messages: &[ChatMessage], model: &str) -> usize {
    // Anything but the exactly-known chat families is counted with the
    // gpt-3.5 encoding.
    let family = if model == "gpt-3.5-turbo" || model == "gpt-4" {
        model
    } else {
        "gpt-3.5-turbo"
    };

    let bpe = bpe_for_model(family);
    let tokens_per_message = if family.starts_with("gpt-3.5-turbo") {
        4
    } else {
        3
    };

    let mut num_tokens = 0usize;
    for message in messages {
        num_tokens += tokens_per_message;
        match &message.content {
            Some(MessageContent::Text(text)) => {
                num_tokens += bpe.encode_with_special_tokens(text).len();
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    if part.kind == "image_url" {
                        num_tokens +=
                            image_tokens(model, part.image_url.as_ref().and_then(|u| u.detail.as_deref()));
                    } else if let Some(text) = &part.text {
                        num_tokens += bpe.encode_with_special_tokens(text).len();
                    }
                }
            }
            None => {}
        }
        num_tokens += bpe.encode_with_special_tokens(&message.role).len();
    }
    num_tokens + 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(raw: serde_json::Value) -> Vec<ChatMessage> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn plain_text_count_matches_manual_accounting() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "hello world"}
        ]));
        let bpe = bpe_for_model("gpt-4");
        let expected = 3
            + bpe.encode_with_special_tokens("hello world").len()
            + bpe.encode_with_special_tokens("user").len()
            + 3;
        assert_eq!(message_token_count(&msgs, "gpt-4"), expected);
    }

    #[test]
    fn gpt35_carries_larger_message_overhead() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "x"}
        ]));
        let gpt4 = message_token_count(&msgs, "gpt-4");
        let gpt35 = message_token_count(&msgs, "gpt-3.5-turbo");
        assert_eq!(gpt35, gpt4 + 1);
    }

    #[test]
    fn other_models_are_counted_like_gpt35() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "hello world"}
        ]));
        let baseline = message_token_count(&msgs, "gpt-3.5-turbo");
        // models tiktoken knows under a different encoding still collapse
        // to the gpt-3.5 accounting, as do arbitrary bot aliases
        assert_eq!(message_token_count(&msgs, "gpt-4o"), baseline);
        assert_eq!(message_token_count(&msgs, "o1-mini"), baseline);
        assert_eq!(message_token_count(&msgs, "coze-bot-7342"), baseline);
        assert_ne!(message_token_count(&msgs, "gpt-4"), baseline);
    }

    #[test]
    fn image_parts_use_fixed_costs() {
        let low = messages(serde_json::json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://x/a.png", "detail": "low"}}
            ]}
        ]));
        let high = messages(serde_json::json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}}
            ]}
        ]));
        let diff = message_token_count(&high, "gpt-4") - message_token_count(&low, "gpt-4");
        assert_eq!(diff, 129 * 16 - 65);
    }

    #[test]
    fn vendor_models_price_images_differently() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://x/a.png"}}
            ]}
        ]));
        assert!(message_token_count(&msgs, "glm-4v") > 1000);
        assert!(message_token_count(&msgs, "claude-3-opus") >= 1000);
    }
}
