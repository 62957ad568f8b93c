use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::traits::{ChatOptions, LlmClient, ProviderResponse, ToolCall};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl Drop for OpenAiCompatibleClient {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

/// Validate the base URL for security. HTTPS is required for remote hosts to
/// protect the API key in transit; plain HTTP is allowed only for localhost.
fn validate_base_url(base_url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("invalid api_url '{base_url}': {e}"))?;
    let host = parsed.host_str().unwrap_or("");

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if is_localhost {
                warn!(
                    "Using unencrypted HTTP for local model server at '{}'",
                    base_url
                );
                Ok(())
            } else {
                anyhow::bail!("HTTP is not allowed for remote api_url '{base_url}'; use HTTPS")
            }
        }
        other => anyhow::bail!("unsupported URL scheme '{other}' in api_url '{base_url}'"),
    }
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        validate_base_url(base_url)?;
        Ok(Self {
            client: crate::providers::build_http_client(REQUEST_TIMEOUT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn build_body(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        options: &ChatOptions,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    async fn request(&self, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let snippet: String = text.chars().take(300).collect();
            anyhow::bail!("model API returned {status}: {snippet}");
        }
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("malformed model API response: {e}"))
    }

    fn parse_response(value: &Value) -> anyhow::Result<ProviderResponse> {
        let message = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| anyhow::anyhow!("model API response has no choices"))?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        // Some gateways surface thinking traces under reasoning_content.
        let reasoning = message
            .get("reasoning_content")
            .or_else(|| message.get("reasoning"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|tc| {
                        let function = tc.get("function")?;
                        Some(ToolCall {
                            id: tc.get("id")?.as_str()?.to_string(),
                            name: function.get("name")?.as_str()?.to_string(),
                            arguments: function
                                .get("arguments")
                                .and_then(|a| a.as_str())
                                .unwrap_or("{}")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            content,
            tool_calls,
            reasoning,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse> {
        let body = self.build_body(model, messages, tools, options);
        let value = self.request(&body).await?;
        let response = Self::parse_response(&value)?;
        debug!(
            model,
            has_content = response.content.is_some(),
            tool_calls = response.tool_calls.len(),
            "completion received"
        );
        Ok(response)
    }

    async fn generate_multimodal(
        &self,
        model: &str,
        messages: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<String> {
        // image_url content parts ride the same chat-completions endpoint.
        let body = self.build_body(model, messages, &[], options);
        let value = self.request(&body).await?;
        Self::parse_response(&value)?
            .content
            .ok_or_else(|| anyhow::anyhow!("multimodal completion returned no text"))
    }
}
