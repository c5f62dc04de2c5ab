use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    DecodeAttachmentDataSnafu, DecodeAttachmentsSnafu, EncodeAttachmentsSnafu, StorageResult,
};

pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// A binary file bound to one message.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Wraps a freshly uploaded file. The MIME type is inferred from the
    /// filename when the uploader did not report one.
    pub fn from_upload(name: impl Into<String>, mime_type: Option<&str>, data: Vec<u8>) -> Self {
        let name = name.into();
        let mime_type = match mime_type.map(str::trim) {
            Some(reported) if !reported.is_empty() => reported.to_string(),
            _ => guess_mime_type(&name),
        };

        Self {
            name,
            mime_type,
            data,
        }
    }

    /// Rebuilds an attachment from its persisted form.
    pub fn from_stored(stored: StoredAttachment) -> StorageResult<Self> {
        let data = STANDARD
            .decode(stored.data.as_bytes())
            .context(DecodeAttachmentDataSnafu {
                stage: "attachment-decode-data",
                name: stored.name.clone(),
            })?;

        Ok(Self {
            name: stored.name,
            mime_type: stored.mimetype,
            data,
        })
    }

    pub fn to_stored(&self) -> StoredAttachment {
        StoredAttachment {
            name: self.name.clone(),
            mimetype: self.mime_type.clone(),
            data: STANDARD.encode(&self.data),
        }
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case(PDF_MIME_TYPE)
    }

    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Payloads can be megabytes; print their size only.
        formatter
            .debug_struct("Attachment")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.data.len())
            .finish()
    }
}

/// Row-level JSON shape of one attachment inside `messages.files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub name: String,
    pub mimetype: String,
    pub data: String,
}

pub fn guess_mime_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or(FALLBACK_MIME_TYPE)
        .to_string()
}

/// Serializes attachments for the `files` column; `None` when there are none.
pub fn encode_attachments(files: &[Attachment]) -> StorageResult<Option<String>> {
    if files.is_empty() {
        return Ok(None);
    }

    let stored = files.iter().map(Attachment::to_stored).collect::<Vec<_>>();
    serde_json::to_string(&stored)
        .map(Some)
        .context(EncodeAttachmentsSnafu {
            stage: "attachment-encode-list",
        })
}

pub fn decode_attachments(raw: Option<&str>) -> StorageResult<Vec<Attachment>> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(Vec::new());
    };

    let stored: Vec<StoredAttachment> =
        serde_json::from_str(raw).context(DecodeAttachmentsSnafu {
            stage: "attachment-decode-list",
        })?;
    stored.into_iter().map(Attachment::from_stored).collect()
}
