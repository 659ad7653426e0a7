//! Conversation adapters for the Anthropic Messages API and OpenAI Chat Completions.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use facetalk_core::config::LlmConfig;
use facetalk_core::session::ChatMessage;

use crate::{Conversation, StageContext};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Pick the adapter for the configured provider.
pub fn build_conversation(
    config: Option<LlmConfig>,
    client: reqwest::Client,
) -> Result<Arc<dyn Conversation>> {
    let Some(config) = config else {
        return Ok(Arc::new(AnthropicConversation::new(None, client)));
    };
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicConversation::new(Some(config), client))),
        "openai" => Ok(Arc::new(OpenAiConversation::new(config, client))),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    }
}

fn wire_messages(history: &[ChatMessage]) -> Vec<Value> {
    history
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

/// Request body for `POST /v1/messages`.
pub fn anthropic_body(config: &LlmConfig, history: &[ChatMessage]) -> Value {
    json!({
        "model": config.model(),
        "max_tokens": config.max_tokens(),
        "temperature": config.temperature(),
        "system": config.system_prompt(),
        "messages": wire_messages(history),
    })
}

/// Concatenate the text blocks of a Messages API response.
pub fn parse_anthropic_reply(body: &Value) -> Result<String> {
    let blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow::anyhow!("Response has no content blocks"))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.trim().is_empty() {
        anyhow::bail!("Model returned an empty reply");
    }
    Ok(text.trim().to_string())
}

/// Request body for `POST /v1/chat/completions`.
pub fn openai_body(config: &LlmConfig, history: &[ChatMessage]) -> Value {
    let mut messages = vec![json!({"role": "system", "content": config.system_prompt()})];
    messages.extend(wire_messages(history));
    json!({
        "model": config.model(),
        "max_tokens": config.max_tokens(),
        "temperature": config.temperature(),
        "messages": messages,
    })
}

pub fn parse_openai_reply(body: &Value) -> Result<String> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Response has no message content"))?;

    if text.trim().is_empty() {
        anyhow::bail!("Model returned an empty reply");
    }
    Ok(text.trim().to_string())
}

async fn post_json(request: reqwest::RequestBuilder, body: &Value) -> Result<Value> {
    let resp = request.json(body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("LLM API error {status}: {text}");
    }
    Ok(resp.json().await?)
}

pub struct AnthropicConversation {
    config: Option<LlmConfig>,
    client: reqwest::Client,
}

impl AnthropicConversation {
    pub fn new(config: Option<LlmConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Conversation for AnthropicConversation {
    async fn reply(&self, history: &[ChatMessage], ctx: &StageContext) -> Result<String> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("LLM is not configured"))?;
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No Anthropic API key configured"))?;

        let base = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com");
        let body = anthropic_body(config, history);

        debug!(
            session_id = %ctx.session_id,
            model = config.model(),
            messages = history.len(),
            "Requesting reply"
        );

        let request = self
            .client
            .post(format!("{}/v1/messages", base.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);

        let response = post_json(request, &body).await?;
        parse_anthropic_reply(&response)
    }
}

pub struct OpenAiConversation {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiConversation {
    pub fn new(config: LlmConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Conversation for OpenAiConversation {
    async fn reply(&self, history: &[ChatMessage], ctx: &StageContext) -> Result<String> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No OpenAI API key configured"))?;

        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com");
        let body = openai_body(&self.config, history);

        debug!(
            session_id = %ctx.session_id,
            model = self.config.model(),
            messages = history.len(),
            "Requesting reply"
        );

        let request = self
            .client
            .post(format!("{}/v1/chat/completions", base.trim_end_matches('/')))
            .bearer_auth(api_key);

        let response = post_json(request, &body).await?;
        parse_openai_reply(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_config(provider: &str) -> LlmConfig {
        serde_json::from_value(json!({"provider": provider})).unwrap()
    }

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
            ChatMessage::user("how are you?"),
        ]
    }

    #[test]
    fn test_anthropic_body_shape() {
        let body = anthropic_body(&llm_config("anthropic"), &history());
        assert_eq!(body["max_tokens"], 2000);
        assert!(body["system"].as_str().unwrap().contains("avatar"));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn test_openai_body_prepends_system() {
        let body = openai_body(&llm_config("openai"), &history());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["content"], "how are you?");
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_parse_anthropic_reply() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Doing "},
                {"type": "text", "text": "well."}
            ]
        });
        assert_eq!(parse_anthropic_reply(&body).unwrap(), "Doing well.");
        assert!(parse_anthropic_reply(&json!({"content": []})).is_err());
    }

    #[test]
    fn test_parse_openai_reply() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": " Sure! "}}]});
        assert_eq!(parse_openai_reply(&body).unwrap(), "Sure!");
        assert!(parse_openai_reply(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_build_conversation_provider_selection() {
        let client = reqwest::Client::new();
        assert!(build_conversation(Some(llm_config("openai")), client.clone()).is_ok());
        assert!(build_conversation(None, client.clone()).is_ok());
        assert!(build_conversation(Some(llm_config("mystery")), client).is_err());
    }
}
