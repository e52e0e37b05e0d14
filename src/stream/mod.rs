//! NDJSON stream parser
//!
//! Turns the line-delimited status objects of a `/query` stream into
//! [`StreamEvent`]s. Lines that are blank, not JSON, or carry an unknown
//! status are skipped; `complete` and `error` end the sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transport::{LineStream, TransportError};

/// Progress of one generation request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The server accepted the request (only surfaced when enabled)
    Processing,
    /// Text generated so far
    Generating { partial: String },
    /// Final text; terminal
    Complete { full: String },
    /// Generation failed; terminal
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

/// Parser behavior switches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Emit [`StreamEvent::Processing`] instead of swallowing `processing` lines
    pub emit_processing: bool,
}

/// Why a single line produced no event. Logged, never surfaced.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("blank line")]
    Blank,
    #[error("not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing status field")]
    MissingStatus,
}

const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// Decode one line. `Ok(None)` means the line was valid but carries no event.
pub fn decode_line(line: &str, options: ParserOptions) -> Result<Option<StreamEvent>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Blank);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingStatus)?;
    let text = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);

    let event = match status {
        "processing" if options.emit_processing => Some(StreamEvent::Processing),
        "processing" => None,
        "generating" => Some(StreamEvent::Generating {
            partial: text("partial").unwrap_or_default(),
        }),
        "complete" => Some(StreamEvent::Complete {
            full: text("response").unwrap_or_default(),
        }),
        "error" => Some(StreamEvent::Error {
            message: text("error").unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
        }),
        other => {
            tracing::debug!("Ignoring unknown stream status: {}", other);
            None
        }
    };
    Ok(event)
}

/// Decode a line, logging and dropping anything unusable
pub fn parse_line(line: &str, options: ParserOptions) -> Option<StreamEvent> {
    match decode_line(line, options) {
        Ok(event) => event,
        Err(ParseError::Blank) => None,
        Err(e) => {
            tracing::debug!("Skipping stream line: {}", e);
            None
        }
    }
}

/// Synchronous event sequence over already-received lines
pub struct Events<I> {
    lines: I,
    options: ParserOptions,
    done: bool,
}

/// Parse a line sequence lazily; the sequence stops after the first terminal event
pub fn parse_lines<I, S>(lines: I, options: ParserOptions) -> Events<I::IntoIter>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Events {
        lines: lines.into_iter(),
        options,
        done: false,
    }
}

impl<I, S> Iterator for Events<I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        for line in self.lines.by_ref() {
            if let Some(event) = parse_line(line.as_ref(), self.options) {
                self.done = event.is_terminal();
                return Some(event);
            }
        }
        self.done = true;
        None
    }
}

/// Events read from a live [`LineStream`].
///
/// Finite and not restartable: after a terminal event, a transport error or
/// the end of the body, `next_event` keeps returning `None`.
pub struct EventStream {
    lines: LineStream,
    options: ParserOptions,
    done: bool,
}

impl EventStream {
    pub fn new(lines: LineStream, options: ParserOptions) -> Self {
        Self {
            lines,
            options,
            done: false,
        }
    }

    /// Next event, a transport failure, or `None` when the sequence is over
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, TransportError>> {
        if self.done {
            return None;
        }
        while let Some(line) = self.lines.next_line().await {
            match line {
                Ok(line) => {
                    if let Some(event) = parse_line(&line, self.options) {
                        if event.is_terminal() {
                            self.finish();
                        }
                        return Some(Ok(event));
                    }
                }
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        None
    }

    /// True once no further events will be produced
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn cancel(&self) {
        self.lines.cancel();
    }

    fn finish(&mut self) {
        self.done = true;
        // Release the connection as soon as the outcome is known
        self.lines.cancel();
    }
}
