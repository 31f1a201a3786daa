//! Wire protocol parser and response generator.
//!
//! Every frame is a single tag byte followed by a payload and a line
//! terminator (`\n`, optionally preceded by `\r`):
//!
//! ```text
//! U{"login":"alice","pass":"pw"}\n     sign up
//! I{"login":"alice","pass":"pw"}\n     sign in
//! M{"rec":"bob","msg":"hi"}\n          direct message
//! S<raw bytes>\n                       broadcast
//! P{"func":"double"}\n                 register a function
//! C{"func":"double","data":"MjE="}\n   call a function (data is base64)
//! R\n                                  become a call handler
//! D<raw bytes>\n                       reply to the call in flight
//! ```
//!
//! Server frames use `O` and `E` for acknowledgements, `M` for delivered
//! messages, `C` for compute requests sent to a handler and `D` for the
//! reply relayed back to a caller.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};

/// Sign-up and sign-in payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub pass: String,
}

/// Direct message payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectMessage {
    #[serde(rename = "rec")]
    pub receiver: String,
    #[serde(rename = "msg")]
    pub text: String,
}

/// Function registration payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostQuery {
    #[serde(rename = "func")]
    pub function: String,
}

/// Remote call payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CalcQuery {
    #[serde(rename = "func")]
    pub function: String,
    #[serde(default, deserialize_with = "from_base64")]
    pub data: Bytes,
}

fn from_base64<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SignUp(Credentials),
    SignIn(Credentials),
    Message(DirectMessage),
    Stream(Bytes),
    Post(PostQuery),
    Calc(CalcQuery),
    Ready,
    Done(Bytes),
}

impl Request {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SignUp(_) => "SIGNUP",
            Request::SignIn(_) => "SIGNIN",
            Request::Message(_) => "MESSAGE",
            Request::Stream(_) => "STREAM",
            Request::Post(_) => "POST",
            Request::Calc(_) => "CALC",
            Request::Ready => "READY",
            Request::Done(_) => "DONE",
        }
    }

    /// Whether the request may be issued before signing in
    pub fn is_authenticating(&self) -> bool {
        matches!(self, Request::SignUp(_) | Request::SignIn(_))
    }
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    /// Tag byte does not name a request
    #[error("wrong message type")]
    UnknownTag(u8),
    /// Payload is not valid JSON for its tag
    #[error("server can't unmarshal message content")]
    InvalidPayload(#[source] serde_json::Error),
    /// Call data would break the line framing towards the handler
    #[error("call data must not contain line breaks")]
    LineBreakInData,
}

impl ProtocolError {
    /// Whether the connection should be dropped after reporting the error
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::FrameTooLarge(_) | ProtocolError::InvalidPayload(_) => true,
            ProtocolError::UnknownTag(_) | ProtocolError::LineBreakInData => false,
        }
    }
}

/// A raw frame: tag byte plus payload with the terminator stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Decode the payload according to the tag's schema
    pub fn decode(&self) -> Result<Request, ProtocolError> {
        let payload = &self.payload[..];
        match self.tag {
            b'U' => Ok(Request::SignUp(json(payload)?)),
            b'I' => Ok(Request::SignIn(json(payload)?)),
            b'M' => Ok(Request::Message(json(payload)?)),
            b'S' => Ok(Request::Stream(self.payload.clone())),
            b'P' => Ok(Request::Post(json(payload)?)),
            b'C' => {
                let query: CalcQuery = json(payload)?;
                if query.data.iter().any(|&b| b == b'\n') {
                    return Err(ProtocolError::LineBreakInData);
                }
                Ok(Request::Calc(query))
            }
            b'R' => Ok(Request::Ready),
            b'D' => Ok(Request::Done(self.payload.clone())),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(ProtocolError::InvalidPayload)
}

/// Result of parsing a frame
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed frame with bytes consumed
    Complete(Frame, usize),
    /// Bare line terminator between frames, skip this many bytes
    Skip(usize),
    /// Need more data to complete the frame
    Incomplete,
    /// Parse error
    Error(ProtocolError),
}

/// Parser for the tag/line framing
pub struct Parser;

impl Parser {
    /// Parse one frame from the start of the buffer
    pub fn parse(buffer: &[u8], max_frame_size: usize) -> ParseResult {
        match buffer.first() {
            None => return ParseResult::Incomplete,
            Some(b'\n') => return ParseResult::Skip(1),
            Some(b'\r') => match buffer.get(1) {
                None => return ParseResult::Incomplete,
                Some(b'\n') => return ParseResult::Skip(2),
                Some(_) => {}
            },
            Some(_) => {}
        }

        // The line starts after the tag byte
        let line_end = match find_lf(&buffer[1..]) {
            Some(pos) => pos + 1,
            None if buffer.len() >= max_frame_size => {
                return ParseResult::Error(ProtocolError::FrameTooLarge(max_frame_size))
            }
            None => return ParseResult::Incomplete,
        };

        let consumed = line_end + 1;
        if consumed > max_frame_size {
            return ParseResult::Error(ProtocolError::FrameTooLarge(max_frame_size));
        }

        let mut payload_end = line_end;
        if payload_end > 1 && buffer[payload_end - 1] == b'\r' {
            payload_end -= 1;
        }

        let frame = Frame {
            tag: buffer[0],
            payload: Bytes::copy_from_slice(&buffer[1..payload_end]),
        };
        ParseResult::Complete(frame, consumed)
    }
}

/// Find the first `\n` in buffer
fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}

/// Outgoing message delivered to a direct-message receiver
#[derive(Debug, Serialize)]
struct Delivered<'a> {
    from: &'a str,
    msg: &'a str,
}

/// Response generator for server frames
pub struct Response;

impl Response {
    /// Success acknowledgement
    pub fn ok(text: &str) -> Bytes {
        Self::ack(b'O', text)
    }

    /// Error acknowledgement
    pub fn error(text: &str) -> Bytes {
        Self::ack(b'E', text)
    }

    /// Compute request sent to a handler
    pub fn compute(data: &[u8]) -> Bytes {
        Self::raw(b'C', data)
    }

    /// Call reply relayed to the caller
    pub fn done(answer: &[u8]) -> Bytes {
        Self::raw(b'D', answer)
    }

    /// Broadcast payload delivered to other sessions
    pub fn broadcast(payload: &[u8]) -> Bytes {
        Self::raw(b'M', payload)
    }

    /// Direct message delivered to its receiver, tagged with the sender
    pub fn direct(from: &str, text: &str) -> Bytes {
        // Serializing two string fields cannot fail
        let body = serde_json::to_vec(&Delivered { from, msg: text }).unwrap_or_default();
        Self::raw(b'M', &body)
    }

    fn ack(tag: u8, text: &str) -> Bytes {
        let text = single_line(text);
        let mut buf = BytesMut::with_capacity(text.len() + 3);
        buf.put_u8(tag);
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.freeze()
    }

    fn raw(tag: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 2);
        buf.put_u8(tag);
        buf.extend_from_slice(payload);
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

/// Strip characters that would end the acknowledgement line early
pub fn single_line(s: &str) -> String {
    s.chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{000A}' | '\u{000B}' | '\u{000C}' | '\u{000D}' | '\u{0085}' | '\u{2028}' | '\u{2029}'
            )
        })
        .collect()
}
