//! Completion-provider seam.
//!
//! Concrete LLM clients (HTTP, local) live outside the crate; the deep
//! research engine talks to this trait only.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM provider error: {0}")]
    Provider(String),
    #[error("LLM call timed out after {0}s")]
    Timeout(u64),
    #[error("LLM returned an empty response")]
    Empty,
}

/// Token estimate used for all budget arithmetic: `ceil(len / 3)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(3)
}

/// An LLM capable of plain text completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Complete `prompt` under `system`, generating at most `max_tokens`.
    /// Implementations enforce their own per-call timeout and surface it as
    /// [`LlmError::Timeout`].
    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        max_tokens: usize,
    ) -> Result<String, LlmError>;

    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}
