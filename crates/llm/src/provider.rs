use std::time::Duration;

use snafu::Snafu;

use super::decoder::{StreamEvent, StreamedTurn};
use super::frame::ErrorCode;
use super::request::ChatRequest;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    /// Full URL of the chat-completions endpoint.
    pub endpoint: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model: model.into().trim().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Callback receiving decoder progress while a response streams in.
pub type EventSink<'a> = dyn FnMut(StreamEvent<'_>) + Send + 'a;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("chat request has no content to send"))]
    EmptyRequest { stage: &'static str },
    #[snafu(display("failed to build HTTP client"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to spawn provider worker thread"))]
    ThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize provider runtime"))]
    RuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("provider worker thread panicked"))]
    WorkerPanicked { stage: &'static str },
    #[snafu(display("could not reach {endpoint}: {source}"))]
    Connect {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("request timed out after {}s", after.as_secs_f32()))]
    Timeout {
        stage: &'static str,
        after: Duration,
    },
    #[snafu(display("failed to read response stream: {source}"))]
    StreamRead {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("server returned status {status}: {message}"))]
    ServerStatus {
        stage: &'static str,
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },
}

impl ProviderError {
    /// True when the request never produced a usable response.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::BuildClient { .. }
                | Self::ThreadSpawn { .. }
                | Self::RuntimeInit { .. }
                | Self::WorkerPanicked { .. }
                | Self::Connect { .. }
                | Self::Timeout { .. }
                | Self::StreamRead { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;
    fn model(&self) -> &str;
    /// Sends `request` and decodes the streamed reply, reporting progress to
    /// `on_event`. Frame-level problems end up in the returned turn; only
    /// transport and status failures are errors.
    fn stream_chat(
        &self,
        request: &ChatRequest,
        on_event: &mut EventSink<'_>,
    ) -> ProviderResult<StreamedTurn>;
}
