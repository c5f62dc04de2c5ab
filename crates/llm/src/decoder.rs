use std::fmt;

use super::frame::{ErrorCode, Frame, ServerFault};

/// Problem reported by a single frame. None of these end the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIssue {
    Server {
        message: String,
        code: Option<ErrorCode>,
    },
    Decode {
        message: String,
    },
}

impl FrameIssue {
    pub fn message(&self) -> &str {
        match self {
            Self::Server { message, .. } | Self::Decode { message } => message,
        }
    }
}

impl fmt::Display for FrameIssue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server {
                message,
                code: Some(code),
            } => write!(formatter, "server error {code}: {message}"),
            Self::Server { message, code: None } => write!(formatter, "server error: {message}"),
            Self::Decode { message } => write!(formatter, "decode error: {message}"),
        }
    }
}

impl From<ServerFault> for FrameIssue {
    fn from(fault: ServerFault) -> Self {
        Self::Server {
            message: fault.message,
            code: fault.code,
        }
    }
}

/// Progress reported while a stream is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// `fragment` was just appended; `text` is the whole buffer so far.
    Delta { fragment: &'a str, text: &'a str },
    Issue(&'a FrameIssue),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Complete,
    ServerError {
        message: String,
        code: Option<ErrorCode>,
    },
    DecodeError {
        message: String,
    },
}

/// Final result of one decoded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedTurn {
    pub text: String,
    pub outcome: TurnOutcome,
    /// Every frame issue in arrival order.
    pub issues: Vec<FrameIssue>,
    /// False when the connection closed without `[DONE]`.
    pub saw_done: bool,
}

impl StreamedTurn {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Complete)
    }
}

/// Incremental decoder for a `data:`-line event stream.
///
/// The decoder does no I/O. Callers push raw body chunks as they arrive and
/// receive [`StreamEvent`]s through a callback; lines may be split across
/// chunks at any byte. Once `[DONE]` is seen, further input is ignored.
///
/// A malformed or error-carrying frame is reported and skipped: text
/// accumulated before and after it is kept.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    text: String,
    issues: Vec<FrameIssue>,
    saw_done: bool,
    frame_count: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a whole pull-based sequence of chunks. The sequence ending
    /// counts as the end of the stream.
    pub fn decode_chunks<I, C>(chunks: I, mut on_event: impl FnMut(StreamEvent<'_>)) -> StreamedTurn
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut decoder = Self::new();
        for chunk in chunks {
            decoder.push_chunk(chunk.as_ref(), &mut on_event);
            if decoder.is_finished() {
                break;
            }
        }
        decoder.finish_with(on_event)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn issues(&self) -> &[FrameIssue] {
        &self.issues
    }

    /// True once `[DONE]` has been observed.
    pub fn is_finished(&self) -> bool {
        self.saw_done
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn push_chunk(&mut self, chunk: &[u8], mut on_event: impl FnMut(StreamEvent<'_>)) {
        if self.saw_done {
            return;
        }

        self.pending.extend_from_slice(chunk);
        while let Some((line_end, terminator_len)) = self.next_line_end() {
            let line = self
                .pending
                .drain(..line_end + terminator_len)
                .collect::<Vec<_>>();
            self.push_raw_line(&line[..line_end], &mut on_event);
            if self.saw_done {
                self.pending.clear();
                break;
            }
        }
    }

    /// Position and length of the first `\n`, `\r\n` or lone `\r` terminator.
    /// A `\r` at the end of the buffer is held until the next byte shows
    /// whether a `\n` follows.
    fn next_line_end(&self) -> Option<(usize, usize)> {
        let index = self
            .pending
            .iter()
            .position(|byte| matches!(byte, b'\n' | b'\r'))?;
        if self.pending[index] == b'\n' {
            return Some((index, 1));
        }
        match self.pending.get(index + 1) {
            Some(b'\n') => Some((index, 2)),
            Some(_) => Some((index, 1)),
            None => None,
        }
    }

    /// Feeds one complete line (without its terminator).
    pub fn push_line(&mut self, line: &str) -> Option<StreamEvent<'_>> {
        if self.saw_done {
            return None;
        }

        let payload = Frame::payload_of(line)?;
        self.frame_count += 1;

        match Frame::parse(payload) {
            Frame::Done => {
                self.saw_done = true;
                Some(StreamEvent::Done)
            }
            Frame::Delta(fragment) => {
                let start = self.text.len();
                self.text.push_str(&fragment);
                Some(StreamEvent::Delta {
                    fragment: &self.text[start..],
                    text: &self.text,
                })
            }
            Frame::NoContent => None,
            Frame::ServerError(fault) => Some(self.record_issue(fault.into())),
            Frame::Malformed(message) => Some(self.record_issue(FrameIssue::Decode { message })),
        }
    }

    pub fn finish(self) -> StreamedTurn {
        self.finish_with(|_| {})
    }

    /// Processes any unterminated trailing line, then closes the stream.
    pub fn finish_with(mut self, mut on_event: impl FnMut(StreamEvent<'_>)) -> StreamedTurn {
        if !self.saw_done && !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.push_raw_line(&line, &mut on_event);
        }

        if !self.saw_done {
            tracing::debug!(
                frame_count = self.frame_count,
                "stream closed without done sentinel"
            );
        }

        let outcome = summarize_outcome(&self.issues);
        StreamedTurn {
            text: self.text,
            outcome,
            issues: self.issues,
            saw_done: self.saw_done,
        }
    }

    fn push_raw_line(&mut self, raw: &[u8], on_event: &mut impl FnMut(StreamEvent<'_>)) {
        match std::str::from_utf8(raw) {
            Ok(line) => {
                if let Some(event) = self.push_line(line) {
                    on_event(event);
                }
            }
            Err(error) => {
                let issue = self.record_issue(FrameIssue::Decode {
                    message: format!("stream line is not valid UTF-8: {error}"),
                });
                on_event(issue);
            }
        }
    }

    fn record_issue(&mut self, issue: FrameIssue) -> StreamEvent<'_> {
        tracing::warn!(frame = self.frame_count, issue = %issue, "stream frame reported a problem");
        self.issues.push(issue);
        StreamEvent::Issue(&self.issues[self.issues.len() - 1])
    }
}

// Server faults outrank decode faults; within a class the latest one wins.
fn summarize_outcome(issues: &[FrameIssue]) -> TurnOutcome {
    let last_server = issues.iter().rev().find_map(|issue| match issue {
        FrameIssue::Server { message, code } => Some(TurnOutcome::ServerError {
            message: message.clone(),
            code: code.clone(),
        }),
        FrameIssue::Decode { .. } => None,
    });
    if let Some(outcome) = last_server {
        return outcome;
    }

    issues
        .iter()
        .rev()
        .find_map(|issue| match issue {
            FrameIssue::Decode { message } => Some(TurnOutcome::DecodeError {
                message: message.clone(),
            }),
            FrameIssue::Server { .. } => None,
        })
        .unwrap_or(TurnOutcome::Complete)
}
