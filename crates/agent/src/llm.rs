use anyhow::Result;
use async_trait::async_trait;

/// Text-in, text-out language model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}
