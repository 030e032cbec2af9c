//! LLM completion capability used for synthesis and classification

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Receiver side of an incremental token stream.
///
/// Fragments are sent in arrival order; a closed receiver is not an error
/// for the producer.
pub type TokenSink = mpsc::UnboundedSender<String>;

/// Text completion backend (OpenRouter or any other provider)
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Complete `user_prompt` under `system_prompt` and return the full text
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// Complete while forwarding partial tokens to `sink`.
    ///
    /// Returns the full text. Backends without native streaming emit the
    /// whole completion as one fragment.
    async fn complete_streaming(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        sink: TokenSink,
    ) -> Result<String> {
        let text = self.complete(system_prompt, user_prompt).await?;
        let _ = sink.send(text.clone());
        Ok(text)
    }

    /// Get the backend type for debugging/logging
    fn backend_type(&self) -> &str;
}
