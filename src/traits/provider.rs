use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call sampling controls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }
}

/// A tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string as emitted by the model. Callers parse it
    /// and must tolerate malformed payloads.
    pub arguments: String,
}

/// The model's response: text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Internal reasoning trace from thinking models. Logged, never shown.
    pub reasoning: Option<String>,
}

/// LLM client — sends messages (and optionally tool definitions) to a model,
/// gets back text and/or tool calls.
///
/// `messages` and `tools` use the OpenAI wire shapes as `serde_json::Value`;
/// every tool_call id the model emits must be answered with exactly one tool
/// result message on the next call, even when the handler failed.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Tool-calling completion.
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse>;

    /// Plain text completion. Default delegates to `complete` with no tools.
    async fn generate_text(
        &self,
        model: &str,
        messages: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<String> {
        let response = self.complete(model, messages, &[], options).await?;
        response
            .content
            .ok_or_else(|| anyhow::anyhow!("model returned no text content"))
    }

    /// Completion over messages containing `image_url` content parts.
    async fn generate_multimodal(
        &self,
        model: &str,
        messages: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<String>;
}
