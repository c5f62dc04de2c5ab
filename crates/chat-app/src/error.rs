use std::path::PathBuf;

use parley_llm::ProviderError;
use parley_storage::StorageError;
use snafu::Snafu;

use super::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("Please enter a message or upload a file before sending."))]
    EmptyInput { stage: &'static str },
    #[snafu(display("no chat session is selected"))]
    NoActiveSession { stage: &'static str },
    #[snafu(display("no API key configured; set PARLEY_API_KEY or OPEN_ROUTER_API_KEY"))]
    ProviderUnavailable { stage: &'static str },
    #[snafu(display("'{name}' is not an accepted file type (accepted: {accepted})"))]
    UnsupportedFileType {
        stage: &'static str,
        name: String,
        accepted: String,
    },
    #[snafu(display("failed to read attachment {path:?}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to save attachment to {path:?}: {source}"))]
    SaveAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("no session named '{name}'"))]
    SessionNotFound { stage: &'static str, name: String },
    #[snafu(display("{source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("terminal I/O failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    /// True when the request never reached a usable response.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Provider { source, .. } if source.is_network())
    }
}

pub type AppResult<T> = Result<T, AppError>;
