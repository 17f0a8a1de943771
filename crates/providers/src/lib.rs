pub mod client;
pub mod openai;
pub mod stream;

use async_trait::async_trait;
use paynav_core::{ChatMessage, LLMResponse, Result, StreamDelta};
use serde_json::Value;
use tokio::sync::mpsc;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Run one completion, forwarding text and tool-call starts to `deltas` as
    /// they arrive. Tool calls are only returned once fully assembled.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<LLMResponse>;
}

pub use openai::OpenAIProvider;
