//! Content-Length message framing for the LSP base protocol.
//!
//! The [`Framer`] is an incremental decoder: it accepts bytes in whatever
//! chunks the transport hands over and emits one JSON value per complete
//! frame, buffering partial headers and bodies across calls.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header names are matched case-sensitively. `Content-Type` is optional on
//! input and always written on output. The space after `:` is optional.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum message size (100MB) to prevent OOM from malicious/buggy clients.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_TYPE_HEADER: &str = "Content-Type: application/vscode-jsonrpc; charset=utf-8";

/// Framing errors. All of them are fatal: once the byte count is lost the
/// stream cannot be re-synchronized.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Message body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// Decoder states. Each frame walks through them in order; the header
/// states loop once per header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NeedHeaderName,
    NeedHeaderValueSpace,
    NeedHeaderValue,
    NeedHeaderValueWrap,
    CheckHeader,
    DropPreBody,
    NeedBody,
    Finish,
}

/// Incremental byte-stream to JSON message decoder.
///
/// # Example
///
/// ```
/// use tags_lsp::framing::{encode, Framer};
/// use serde_json::json;
///
/// let bytes = encode(&json!({"jsonrpc": "2.0", "method": "exit"})).unwrap();
/// let mut framer = Framer::new();
/// let mut messages = Vec::new();
/// for byte in &bytes {
///     framer.execute(std::slice::from_ref(byte), |m| messages.push(m)).unwrap();
/// }
/// assert_eq!(messages, vec![json!({"jsonrpc": "2.0", "method": "exit"})]);
/// ```
#[derive(Debug)]
pub struct Framer {
    state: State,
    /// Partial header name or value, finalized on `:` or `\r`.
    scratch: Vec<u8>,
    /// Name of the header whose value is being read.
    name: Option<String>,
    headers: Vec<(String, String)>,
    content_length: usize,
    body: Vec<u8>,
    max_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    /// Framer rejecting bodies larger than `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: State::NeedHeaderName,
            scratch: Vec::new(),
            name: None,
            headers: Vec::new(),
            content_length: 0,
            body: Vec::new(),
            max_size,
        }
    }

    /// Feed `data` into the decoder, invoking `on_message` once per complete
    /// frame. Returns the number of messages decoded by this call.
    ///
    /// Partial frames are kept until the next call.
    pub fn execute<F>(&mut self, mut data: &[u8], mut on_message: F) -> Result<usize, FrameError>
    where
        F: FnMut(Value),
    {
        let mut decoded = 0;

        loop {
            if data.is_empty() && !self.can_advance_without_input() {
                break;
            }

            let consumed = match self.state {
                State::NeedHeaderName => self.on_header_name(data)?,
                State::NeedHeaderValueSpace => self.on_header_value_space(data),
                State::NeedHeaderValue => self.on_header_value(data)?,
                State::NeedHeaderValueWrap => self.on_header_value_wrap(data)?,
                State::CheckHeader => self.on_check_header(data),
                State::DropPreBody => self.on_drop_pre_body(data)?,
                State::NeedBody => self.on_body(data),
                State::Finish => {
                    let message = self.on_finish()?;
                    on_message(message);
                    decoded += 1;
                    0
                }
            };

            data = &data[consumed..];
        }

        Ok(decoded)
    }

    /// True while no frame is partially buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::NeedHeaderName && self.scratch.is_empty() && self.headers.is_empty()
    }

    fn can_advance_without_input(&self) -> bool {
        match self.state {
            State::NeedBody => self.body.len() == self.content_length,
            State::Finish => true,
            _ => false,
        }
    }

    fn on_header_name(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        for (i, &byte) in data.iter().enumerate() {
            match byte {
                b':' => {
                    self.scratch.extend_from_slice(&data[..i]);
                    let name = String::from_utf8(std::mem::take(&mut self.scratch))
                        .map_err(|_| FrameError::MalformedHeader("non UTF-8 header name".into()))?;
                    self.name = Some(name);
                    self.state = State::NeedHeaderValueSpace;
                    return Ok(i + 1);
                }
                b'\r' | b'\n' => {
                    self.scratch.extend_from_slice(&data[..i]);
                    return Err(FrameError::MalformedHeader(format!(
                        "header line without ':' ({:?})",
                        String::from_utf8_lossy(&self.scratch)
                    )));
                }
                _ => {}
            }
        }

        self.scratch.extend_from_slice(data);
        Ok(data.len())
    }

    fn on_header_value_space(&mut self, data: &[u8]) -> usize {
        let skipped = data.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        if skipped < data.len() {
            self.state = State::NeedHeaderValue;
        }
        skipped
    }

    fn on_header_value(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        for (i, &byte) in data.iter().enumerate() {
            match byte {
                b'\r' => {
                    self.scratch.extend_from_slice(&data[..i]);
                    let value = String::from_utf8(std::mem::take(&mut self.scratch))
                        .map_err(|_| FrameError::MalformedHeader("non UTF-8 header value".into()))?;
                    let name = self.name.take().unwrap_or_default();
                    self.headers.push((name, value.trim_end().to_string()));
                    self.state = State::NeedHeaderValueWrap;
                    return Ok(i + 1);
                }
                b'\n' => {
                    return Err(FrameError::MalformedHeader(
                        "bare line feed in header value".into(),
                    ));
                }
                _ => {}
            }
        }

        self.scratch.extend_from_slice(data);
        Ok(data.len())
    }

    fn on_header_value_wrap(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        if data[0] != b'\n' {
            return Err(FrameError::MalformedHeader(
                "carriage return not followed by line feed".into(),
            ));
        }
        self.state = State::CheckHeader;
        Ok(1)
    }

    fn on_check_header(&mut self, data: &[u8]) -> usize {
        if data[0] == b'\r' {
            self.state = State::DropPreBody;
            1
        } else {
            self.state = State::NeedHeaderName;
            0
        }
    }

    fn on_drop_pre_body(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        if data[0] != b'\n' {
            return Err(FrameError::MalformedHeader(
                "blank line not terminated by line feed".into(),
            ));
        }

        // Last occurrence wins if the header is repeated
        let value = self
            .headers
            .iter()
            .rev()
            .find(|(name, _)| name == CONTENT_LENGTH)
            .map(|(_, value)| value.as_str())
            .ok_or(FrameError::MissingContentLength)?;

        let size: usize = value
            .trim()
            .parse()
            .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;

        if size > self.max_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_size,
            });
        }

        self.content_length = size;
        self.body = Vec::with_capacity(size);
        self.state = State::NeedBody;
        Ok(1)
    }

    fn on_body(&mut self, data: &[u8]) -> usize {
        let wanted = self.content_length - self.body.len();
        let take = wanted.min(data.len());
        self.body.extend_from_slice(&data[..take]);
        if self.body.len() == self.content_length {
            self.state = State::Finish;
        }
        take
    }

    fn on_finish(&mut self) -> Result<Value, FrameError> {
        let message = serde_json::from_slice(&self.body).map_err(FrameError::InvalidJson)?;
        self.reset();
        Ok(message)
    }

    fn reset(&mut self) {
        self.state = State::NeedHeaderName;
        self.scratch.clear();
        self.name = None;
        self.headers.clear();
        self.content_length = 0;
        self.body = Vec::new();
    }
}

/// Wrap an already serialized body in LSP framing headers.
pub fn frame_body(body: &[u8]) -> Vec<u8> {
    let header = format!(
        "{}: {}\r\n{}\r\n\r\n",
        CONTENT_LENGTH,
        body.len(),
        CONTENT_TYPE_HEADER
    );

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Serialize `message` and frame it for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    Ok(frame_body(&body))
}
