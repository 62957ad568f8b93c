mod openai_compatible;

pub use openai_compatible::OpenAiCompatibleClient;

use std::time::Duration;

/// Shared HTTP client builder for provider implementations.
pub(crate) fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(Into::into)
}
