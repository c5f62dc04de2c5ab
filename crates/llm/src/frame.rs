use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Line prefix carrying an event payload.
pub const DATA_PREFIX: &str = "data: ";
/// Payload that ends a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const UNKNOWN_SERVER_ERROR: &str = "unknown server error";

/// Error code reported by the API; providers send either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(code) => write!(formatter, "{code}"),
            Self::Text(code) => formatter.write_str(code),
        }
    }
}

/// Error object carried by the API, either in-stream or as a non-2xx body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFault {
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl ServerFault {
    pub fn from_value(error: &Value) -> Self {
        match error {
            Value::Object(fields) => {
                let message = match fields.get("message") {
                    Some(Value::String(message)) => message.clone(),
                    Some(Value::Null) | None => UNKNOWN_SERVER_ERROR.to_string(),
                    Some(other) => other.to_string(),
                };
                let code = fields
                    .get("code")
                    .filter(|code| !code.is_null())
                    .and_then(|code| serde_json::from_value::<ErrorCode>(code.clone()).ok());
                Self { message, code }
            }
            Value::String(message) => Self {
                message: message.clone(),
                code: None,
            },
            other => Self {
                message: other.to_string(),
                code: None,
            },
        }
    }

    /// Parses a `{"error": {...}}` document; `None` when it has no error object.
    pub fn from_body(body: &str) -> Option<Self> {
        let value = serde_json::from_str::<Value>(body).ok()?;
        value
            .get("error")
            .filter(|error| !error.is_null())
            .map(Self::from_value)
    }
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Done,
    /// `choices[0].delta.content` was present and non-null.
    Delta(String),
    /// A well-formed chunk without text: no choices, empty choices, no delta or no content.
    NoContent,
    ServerError(ServerFault),
    Malformed(String),
}

impl Frame {
    /// Extracts the payload of a `data: ` line; other lines carry no frame.
    pub fn payload_of(line: &str) -> Option<&str> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return None;
        }
        line.strip_prefix(DATA_PREFIX)
    }

    pub fn parse(payload: &str) -> Self {
        if payload == DONE_SENTINEL {
            return Self::Done;
        }

        let value = match serde_json::from_str::<Value>(payload) {
            Ok(value) => value,
            Err(error) => return Self::Malformed(format!("JSON decode error: {error}")),
        };

        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            return Self::ServerError(ServerFault::from_value(error));
        }

        match serde_json::from_value::<ChunkPayload>(value) {
            Ok(chunk) => chunk.into_frame(),
            Err(error) => Self::Malformed(format!("unexpected frame shape: {error}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ChunkPayload {
    /// Only the first choice is read; later ones may have any shape.
    fn into_frame(self) -> Frame {
        let Some(first) = self.choices.and_then(|choices| choices.into_iter().next()) else {
            return Frame::NoContent;
        };

        match serde_json::from_value::<ChunkChoice>(first) {
            Ok(choice) => choice
                .delta
                .and_then(|delta| delta.content)
                .map_or(Frame::NoContent, Frame::Delta),
            Err(error) => Frame::Malformed(format!("unexpected frame shape: {error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_data_lines_carry_payloads() {
        assert_eq!(Frame::payload_of("data: {}"), Some("{}"));
        assert_eq!(Frame::payload_of("data: [DONE]\r"), Some("[DONE]"));
        assert_eq!(Frame::payload_of(""), None);
        assert_eq!(Frame::payload_of("   "), None);
        assert_eq!(Frame::payload_of(": keep-alive"), None);
        assert_eq!(Frame::payload_of("event: message"), None);
        assert_eq!(Frame::payload_of("data:{}"), None);
    }

    #[test]
    fn delta_content_is_extracted() {
        let frame = Frame::parse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert_eq!(frame, Frame::Delta("Hel".to_string()));

        let empty = Frame::parse(r#"{"choices":[{"delta":{"content":""}}]}"#);
        assert_eq!(empty, Frame::Delta(String::new()));
    }

    #[test]
    fn later_choices_are_not_decoded() {
        let frame =
            Frame::parse(r#"{"choices":[{"delta":{"content":"A"}},{"delta":{"content":7}}]}"#);
        assert_eq!(frame, Frame::Delta("A".to_string()));

        let broken_first = Frame::parse(r#"{"choices":[{"delta":{"content":7}}]}"#);
        assert!(matches!(broken_first, Frame::Malformed(_)));
    }

    #[test]
    fn chunks_without_text_are_silent() {
        for payload in [
            r#"{"id":"gen-1"}"#,
            r#"{"choices":null}"#,
            r#"{"choices":[]}"#,
            r#"{"choices":[{"index":0}]}"#,
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#,
        ] {
            assert_eq!(Frame::parse(payload), Frame::NoContent, "{payload}");
        }
    }

    #[test]
    fn error_objects_become_server_errors() {
        let frame = Frame::parse(r#"{"error":{"message":"rate limited","code":429}}"#);
        assert_eq!(
            frame,
            Frame::ServerError(ServerFault {
                message: "rate limited".to_string(),
                code: Some(ErrorCode::Number(429)),
            })
        );

        let textual = Frame::parse(r#"{"error":{"message":"bad key","code":"invalid_api_key"}}"#);
        assert!(matches!(
            textual,
            Frame::ServerError(ServerFault { code: Some(ErrorCode::Text(ref code)), .. })
                if code == "invalid_api_key"
        ));

        let bare = Frame::parse(r#"{"error":{}}"#);
        assert!(matches!(
            bare,
            Frame::ServerError(ServerFault { ref message, code: None }) if message == UNKNOWN_SERVER_ERROR
        ));
    }

    #[test]
    fn null_error_field_falls_through_to_choices() {
        let frame = Frame::parse(r#"{"error":null,"choices":[{"delta":{"content":"ok"}}]}"#);
        assert_eq!(frame, Frame::Delta("ok".to_string()));
    }

    #[test]
    fn undecodable_payloads_are_malformed() {
        assert!(matches!(Frame::parse("not-json"), Frame::Malformed(ref message) if message.starts_with("JSON decode error")));
        assert!(matches!(Frame::parse("42"), Frame::Malformed(_)));
        assert!(matches!(
            Frame::parse(r#"{"choices":[{"delta":{"content":5}}]}"#),
            Frame::Malformed(ref message) if message.starts_with("unexpected frame shape")
        ));
    }

    #[test]
    fn fault_from_error_body() {
        let fault =
            ServerFault::from_body(r#"{"error":{"message":"No credits","code":402}}"#).unwrap();
        assert_eq!(fault.message, "No credits");
        assert_eq!(fault.code.map(|code| code.to_string()).as_deref(), Some("402"));
        assert!(ServerFault::from_body("<html>oops</html>").is_none());
        assert!(ServerFault::from_body(r#"{"detail":"x"}"#).is_none());
    }
}
