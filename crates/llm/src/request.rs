use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

const PDF_MIME_TYPE: &str = "application/pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestRole {
    User,
    Assistant,
}

/// One part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Inlines a file as a base64 data URL. PDFs go out as `file` parts,
    /// everything else as `image_url`.
    pub fn attachment(name: &str, mime_type: &str, data: &[u8]) -> Self {
        let url = data_url(mime_type, data);
        if mime_type.eq_ignore_ascii_case(PDF_MIME_TYPE) {
            Self::File {
                file: FileData {
                    filename: name.to_string(),
                    file_data: url,
                },
            }
        } else {
            Self::ImageUrl {
                image_url: ImageUrl { url },
            }
        }
    }
}

pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMessage {
    pub role: RequestRole,
    pub content: Vec<ContentPart>,
}

/// Body of a streaming chat-completions POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }

    /// Request holding a single user turn. Empty text is left out so a
    /// file-only message carries just its attachment parts.
    pub fn single_user_turn<'a>(
        model: impl Into<String>,
        text: &str,
        attachments: impl IntoIterator<Item = (&'a str, &'a str, &'a [u8])>,
    ) -> Self {
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentPart::text(text));
        }
        content.extend(
            attachments
                .into_iter()
                .map(|(name, mime_type, data)| ContentPart::attachment(name, mime_type, data)),
        );

        Self::new(
            model,
            vec![RequestMessage {
                role: RequestRole::User,
                content,
            }],
        )
    }

    pub fn is_empty(&self) -> bool {
        self.messages.iter().all(|message| message.content.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_and_attachments_serialize_as_typed_parts() {
        let pdf: &[u8] = b"%PDF";
        let png: &[u8] = &[0x89, b'P', b'N', b'G'];
        let request = ChatRequest::single_user_turn(
            "openai/gpt-4.1",
            "describe these",
            [
                ("doc.pdf", "application/pdf", pdf),
                ("pic.png", "image/png", png),
            ],
        );

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "openai/gpt-4.1",
                "stream": true,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "describe these"},
                        {"type": "file", "file": {
                            "filename": "doc.pdf",
                            "file_data": "data:application/pdf;base64,JVBERg=="
                        }},
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw=="}}
                    ]
                }]
            })
        );
    }

    #[test]
    fn empty_text_is_omitted() {
        let request = ChatRequest::single_user_turn("m", "", [("a.jpg", "image/jpeg", &b"x"[..])]);
        let content = &request.messages[0].content;
        assert_eq!(content.len(), 1);
        assert!(matches!(content[0], ContentPart::ImageUrl { .. }));

        let blank = ChatRequest::single_user_turn("m", "", std::iter::empty());
        assert!(blank.is_empty());
    }

    #[test]
    fn pdf_detection_ignores_case() {
        let part = ContentPart::attachment("x.pdf", "Application/PDF", b"");
        assert!(matches!(part, ContentPart::File { ref file } if file.filename == "x.pdf"));
    }
}
