use std::fmt;

use chrono::{DateTime, FixedOffset};
use parley_llm::{FrameIssue, ProviderError};
use parley_storage::{Attachment, MessageRecord};

use super::error::AppError;

pub const ERROR_TITLE: &str = "❌ Error";
pub const STREAMING_ERROR_TITLE: &str = "❌ Streaming Error";
pub const TIMEOUT_MESSAGE: &str = "Request timed out. Please try again.";

const HEADING_TIME_FORMAT: &str = "%A, %d %B %Y %H.%M.%S %:z";

/// `"<name> - Monday, 19 October 2026 14.05.09 +07:00"`
pub fn speaker_heading(name: &str, timestamp: &DateTime<FixedOffset>) -> String {
    format!("{name} - {}", timestamp.format(HEADING_TIME_FORMAT))
}

/// User-facing error with an optional second line, e.g. a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub title: &'static str,
    pub subtitle: Option<String>,
    pub message: String,
}

impl ErrorNotice {
    pub fn new(title: &'static str, message: impl Into<String>) -> Self {
        Self {
            title,
            subtitle: None,
            message: message.into(),
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    pub fn from_issue(issue: &FrameIssue) -> Self {
        match issue {
            FrameIssue::Server { message, .. } => Self::new(ERROR_TITLE, message.as_str()),
            FrameIssue::Decode { message } => Self::new(STREAMING_ERROR_TITLE, message.as_str()),
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::Provider { source, .. } => Self::from_provider_error(source),
            other => Self::new(ERROR_TITLE, other.to_string()),
        }
    }

    fn from_provider_error(error: &ProviderError) -> Self {
        match error {
            ProviderError::Timeout { .. } => Self::new(ERROR_TITLE, TIMEOUT_MESSAGE),
            ProviderError::ServerStatus {
                status,
                code,
                message,
                ..
            } => {
                let code = code
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| status.to_string());
                Self::new(ERROR_TITLE, message.as_str()).with_subtitle(format!("Status Code: {code}"))
            }
            other => Self::new(ERROR_TITLE, other.to_string()),
        }
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.title)?;
        if let Some(subtitle) = self.subtitle.as_deref().filter(|subtitle| !subtitle.is_empty()) {
            write!(formatter, "\n{subtitle}")?;
        }
        if !self.message.is_empty() {
            write!(formatter, "\n{}", self.message)?;
        }
        Ok(())
    }
}

/// How an attachment is shown in the transcript: PDFs are offered for
/// download, everything else is treated as an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentView {
    Download { label: String },
    Image { name: String, mime_type: String, size_bytes: usize },
}

impl AttachmentView {
    pub fn for_attachment(attachment: &Attachment) -> Self {
        if attachment.is_pdf() {
            Self::Download {
                label: format!("📄 Download {}", attachment.name),
            }
        } else {
            Self::Image {
                name: attachment.name.clone(),
                mime_type: attachment.mime_type.clone(),
                size_bytes: attachment.data.len(),
            }
        }
    }
}

impl fmt::Display for AttachmentView {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download { label } => formatter.write_str(label),
            Self::Image {
                name,
                mime_type,
                size_bytes,
            } => write!(formatter, "🖼 {name} ({mime_type}, {size_bytes} bytes)"),
        }
    }
}

/// Heading, text and attachment lines of one transcript entry.
pub fn render_message(message: &MessageRecord) -> String {
    let mut lines = vec![speaker_heading(&message.name, &message.timestamp)];
    if !message.content.is_empty() {
        lines.push(message.content.clone());
    }
    lines.extend(
        message
            .files
            .iter()
            .map(|file| AttachmentView::for_attachment(file).to_string()),
    );
    lines.join("\n")
}
