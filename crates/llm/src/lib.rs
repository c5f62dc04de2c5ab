use std::sync::Arc;

pub mod decoder;
pub mod frame;
mod http;
mod provider;
pub mod request;

pub use decoder::{FrameIssue, StreamDecoder, StreamEvent, StreamedTurn, TurnOutcome};
pub use frame::{ErrorCode, Frame, ServerFault};
pub use http::{HTTP_PROVIDER_ID, HttpChatProvider};
pub use provider::{
    ChatProvider, DEFAULT_REQUEST_TIMEOUT, EventSink, ProviderConfig, ProviderError,
    ProviderResult,
};
pub use request::{ChatRequest, ContentPart, RequestMessage, RequestRole};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn ChatProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = HTTP_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        HTTP_PROVIDER_ID | "openai" | "openrouter" => Ok(Arc::new(HttpChatProvider::new(config)?)),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
