use std::time::Duration;

use futures::StreamExt;
use snafu::{ResultExt, ensure};

use super::decoder::{StreamDecoder, StreamedTurn};
use super::frame::ServerFault;
use super::provider::{
    BuildClientSnafu, ChatProvider, ConnectSnafu, EmptyRequestSnafu, EventSink,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderResult, RuntimeInitSnafu,
    ServerStatusSnafu, StreamReadSnafu, ThreadSpawnSnafu, TimeoutSnafu, WorkerPanickedSnafu,
};
use super::request::ChatRequest;

pub const HTTP_PROVIDER_ID: &str = "openai-compatible";

/// Streams chat completions from an OpenAI-compatible HTTP endpoint.
pub struct HttpChatProvider {
    config: ProviderConfig,
}

impl HttpChatProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "http-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn stream_async(
        &self,
        request: &ChatRequest,
        on_event: &mut EventSink<'_>,
    ) -> ProviderResult<StreamedTurn> {
        let timeout = self.config.request_timeout;
        // The client is tied to the runtime driving this call.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "http-build-client",
            })?;

        tracing::debug!(
            endpoint = %self.config.endpoint,
            model = %request.model,
            "sending chat request"
        );
        let pending = client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send();
        let response = with_timeout(timeout, "http-await-response", pending)
            .await?
            .map_err(|source| self.send_error(source))?;

        let status = response.status();
        if !status.is_success() {
            let body = with_timeout(timeout, "http-read-error-body", response.text())
                .await?
                .context(StreamReadSnafu {
                    stage: "http-read-error-body",
                })?;
            let (message, code) = match ServerFault::from_body(&body) {
                Some(fault) => (fault.message, fault.code),
                None if body.trim().is_empty() => (status.to_string(), None),
                None => (body.trim().to_string(), None),
            };
            tracing::warn!(status = status.as_u16(), message = %message, "chat request rejected");
            return ServerStatusSnafu {
                stage: "http-check-status",
                status: status.as_u16(),
                code,
                message,
            }
            .fail();
        }

        let mut body = response.bytes_stream();
        let mut decoder = StreamDecoder::new();
        while !decoder.is_finished() {
            let Some(chunk) = with_timeout(timeout, "http-read-chunk", body.next()).await? else {
                break;
            };
            let chunk = chunk.context(StreamReadSnafu {
                stage: "http-read-chunk",
            })?;
            decoder.push_chunk(&chunk, &mut *on_event);
        }

        let turn = decoder.finish_with(&mut *on_event);
        tracing::debug!(
            chars = turn.text.chars().count(),
            issues = turn.issues.len(),
            saw_done = turn.saw_done,
            "chat stream finished"
        );
        Ok(turn)
    }

    fn send_error(&self, source: reqwest::Error) -> ProviderError {
        if source.is_timeout() {
            return ProviderError::Timeout {
                stage: "http-connect",
                after: self.config.request_timeout,
            };
        }

        ProviderError::Connect {
            stage: "http-send",
            endpoint: self.config.endpoint.clone(),
            source,
        }
    }
}

impl ChatProvider for HttpChatProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn stream_chat(
        &self,
        request: &ChatRequest,
        on_event: &mut EventSink<'_>,
    ) -> ProviderResult<StreamedTurn> {
        ensure!(
            !request.is_empty(),
            EmptyRequestSnafu {
                stage: "http-validate-request",
            }
        );

        // Callers are synchronous and may already sit inside a runtime, so the
        // request runs on a scoped worker thread with its own runtime.
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("chat-provider-http".to_string())
                .spawn_scoped(scope, move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .context(RuntimeInitSnafu {
                            stage: "http-runtime-build",
                        })?;
                    runtime.block_on(self.stream_async(request, on_event))
                })
                .context(ThreadSpawnSnafu {
                    stage: "http-spawn-worker",
                })?;

            match worker.join() {
                Ok(result) => result,
                Err(_) => WorkerPanickedSnafu {
                    stage: "http-join-worker",
                }
                .fail(),
            }
        })
    }
}

async fn with_timeout<F: Future>(
    after: Duration,
    stage: &'static str,
    future: F,
) -> ProviderResult<F::Output> {
    match tokio::time::timeout(after, future).await {
        Ok(output) => Ok(output),
        Err(_) => TimeoutSnafu { stage, after }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    use super::*;
    use crate::decoder::{StreamEvent, TurnOutcome};
    use crate::frame::ErrorCode;

    /// Serves one canned response and hands back the raw request it received.
    fn serve_once(
        respond: impl FnOnce(&mut TcpStream) + Send + 'static,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!(
            "http://{}/api/v1/chat/completions",
            listener.local_addr().unwrap()
        );
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            respond(&mut stream);
            request
        });
        (endpoint, handle)
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let end_of_head = line == "\r\n";
            head.push_str(&line);
            if end_of_head {
                break;
            }
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();
        head + &String::from_utf8(body).unwrap()
    }

    fn respond_with(
        status: &'static str,
        content_type: &'static str,
        body: String,
    ) -> impl FnOnce(&mut TcpStream) + Send + 'static {
        move |stream| {
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
    }

    fn provider(endpoint: &str, timeout: Duration) -> HttpChatProvider {
        let config = ProviderConfig::new(HTTP_PROVIDER_ID, " sk-test ", endpoint, "test/model")
            .with_request_timeout(timeout);
        HttpChatProvider::new(config).unwrap()
    }

    fn hello_request() -> ChatRequest {
        ChatRequest::single_user_turn("test/model", "hi", std::iter::empty())
    }

    #[test]
    fn streams_deltas_and_sends_bearer_json() {
        let body = [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            ": processing",
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
            "",
        ]
        .join("\n");
        let (endpoint, server) = serve_once(respond_with("200 OK", "text/event-stream", body));

        let mut previews = Vec::new();
        let turn = provider(&endpoint, Duration::from_secs(5))
            .stream_chat(&hello_request(), &mut |event| {
                if let StreamEvent::Delta { text, .. } = event {
                    previews.push(text.to_string());
                }
            })
            .unwrap();

        assert_eq!(turn.text, "Hello");
        assert_eq!(turn.outcome, TurnOutcome::Complete);
        assert!(turn.saw_done);
        assert_eq!(previews, ["Hel", "Hello"]);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /api/v1/chat/completions HTTP/1.1\r\n"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test\r\n"));
        let (_, json) = request.split_once("\r\n\r\n").unwrap();
        let json: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(json["model"], "test/model");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn error_status_surfaces_code_and_message() {
        let body = r#"{"error":{"message":"Rate limit exceeded","code":429}}"#.to_string();
        let (endpoint, server) = serve_once(respond_with(
            "429 Too Many Requests",
            "application/json",
            body,
        ));

        let error = provider(&endpoint, Duration::from_secs(5))
            .stream_chat(&hello_request(), &mut |_| {})
            .unwrap_err();
        server.join().unwrap();

        assert!(!error.is_network());
        assert!(matches!(
            error,
            ProviderError::ServerStatus {
                status: 429,
                code: Some(ErrorCode::Number(429)),
                ref message,
                ..
            } if message == "Rate limit exceeded"
        ));
    }

    #[test]
    fn unparseable_error_body_keeps_raw_text() {
        let (endpoint, server) = serve_once(respond_with(
            "502 Bad Gateway",
            "text/plain",
            "upstream down".to_string(),
        ));

        let error = provider(&endpoint, Duration::from_secs(5))
            .stream_chat(&hello_request(), &mut |_| {})
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(
            error,
            ProviderError::ServerStatus { status: 502, code: None, ref message, .. }
                if message == "upstream down"
        ));
    }

    #[test]
    fn in_stream_error_frame_is_not_a_request_failure() {
        let body = [
            r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
            r#"data: {"error":{"message":"overloaded","code":"server_busy"}}"#,
            "",
        ]
        .join("\n");
        let (endpoint, server) = serve_once(respond_with("200 OK", "text/event-stream", body));

        let turn = provider(&endpoint, Duration::from_secs(5))
            .stream_chat(&hello_request(), &mut |_| {})
            .unwrap();
        server.join().unwrap();

        assert_eq!(turn.text, "partial");
        assert!(!turn.saw_done);
        assert_eq!(
            turn.outcome,
            TurnOutcome::ServerError {
                message: "overloaded".to_string(),
                code: Some(ErrorCode::Text("server_busy".to_string())),
            }
        );
    }

    #[test]
    fn slow_server_times_out() {
        let (endpoint, server) = serve_once(|stream| {
            std::thread::sleep(Duration::from_millis(1_500));
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
        });

        let error = provider(&endpoint, Duration::from_millis(200))
            .stream_chat(&hello_request(), &mut |_| {})
            .unwrap_err();
        server.join().unwrap();

        assert!(error.is_timeout());
        assert!(error.is_network());
    }

    #[test]
    fn stalled_body_times_out_after_first_frame() {
        let (endpoint, server) = serve_once(|stream| {
            let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n";
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            let chunk = format!("{head}{:x}\r\n{frame}\r\n", frame.len());
            stream.write_all(chunk.as_bytes()).unwrap();
            stream.flush().unwrap();
            std::thread::sleep(Duration::from_millis(1_500));
            let _ = stream.write_all(b"0\r\n\r\n");
        });

        let mut fragments = Vec::new();
        let error = provider(&endpoint, Duration::from_millis(300))
            .stream_chat(&hello_request(), &mut |event| {
                if let StreamEvent::Delta { fragment, .. } = event {
                    fragments.push(fragment.to_string());
                }
            })
            .unwrap_err();
        server.join().unwrap();

        assert_eq!(fragments, ["Hel"]);
        assert!(error.is_timeout());
        assert!(matches!(
            error,
            ProviderError::Timeout {
                stage: "http-read-chunk",
                ..
            }
        ));
    }

    #[test]
    fn refused_connection_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/v1/chat", listener.local_addr().unwrap());
        drop(listener);

        let error = provider(&endpoint, Duration::from_secs(2))
            .stream_chat(&hello_request(), &mut |_| {})
            .unwrap_err();

        assert!(error.is_network());
        assert!(matches!(error, ProviderError::Connect { .. }));
    }

    #[test]
    fn missing_api_key_is_rejected_up_front() {
        let result = HttpChatProvider::new(ProviderConfig::new("openrouter", "  ", "http://x", "m"));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn empty_request_is_rejected_before_sending() {
        let provider = provider("http://127.0.0.1:9/unused", Duration::from_secs(1));
        let request = ChatRequest::single_user_turn("m", "", std::iter::empty());
        let error = provider.stream_chat(&request, &mut |_| {}).unwrap_err();
        assert!(matches!(error, ProviderError::EmptyRequest { .. }));
    }
}
