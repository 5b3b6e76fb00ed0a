use anyhow::Result;
use async_trait::async_trait;

/// Speech-to-text for raw caller audio. Providers that transcribe on their
/// side deliver text instead and never reach this.
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}
