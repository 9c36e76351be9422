//! Framed message codec for the controller ↔ gate protocol.
//!
//! A frame is an 8-character lowercase hexadecimal length followed by exactly
//! that many bytes of UTF-8 JSON. The JSON decodes to a two-element array
//! `[type, body]` where `type` names the message and `body` is an object.
//! There are no separators between frames and no escaping.
//!
//! The codec is strict: unknown message names, non-array envelopes, and
//! truncated headers are all fatal to the session that observed them (the
//! process carries on and spawns a fresh session on next demand).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the hexadecimal frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Default ceiling for a single frame body (64 MiB).
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Errors produced while encoding or decoding protocol frames.
///
/// All decode errors poison the session they occurred on; none are fatal to
/// the process.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The stream ended mid-header (1-7 bytes) or mid-body.
    #[error("Truncated frame: got {got} bytes of {expected}")]
    Truncation {
        /// Bytes actually received
        got: usize,
        /// Bytes the frame needed
        expected: usize,
    },

    /// The 8-byte header was not lowercase hexadecimal.
    #[error("Bad frame length header: {0:?}")]
    BadLengthHeader(String),

    /// The declared body length exceeds the configured ceiling.
    #[error("Frame of {length} bytes exceeds the {max} byte ceiling")]
    OversizeFrame {
        /// Declared body length
        length: usize,
        /// Configured ceiling
        max: usize,
    },

    /// The body was not valid JSON.
    #[error("Frame body is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),

    /// The JSON was not a `[type, body]` pair of string and object.
    #[error("Frame envelope is not a [type, body] pair: {0}")]
    BadEnvelope(String),

    /// Underlying I/O failure while reading or writing frames.
    #[error("Frame IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Message Model
// ============================================================================

/// Body of a `Module` request: run a classic module on the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRequest {
    /// Module name (short or fully qualified)
    pub module_name: String,
    /// Base64 module bytes when shipped inline; otherwise the gate resolves
    /// the name against its bundled catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Arguments for the module
    #[serde(default)]
    pub module_args: Map<String, Value>,
}

/// Body of an `FTLModule` request: run an FTL-native module on the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtlModuleRequest {
    /// Module name
    pub module_name: String,
    /// Base64-encoded portable module source
    pub module: String,
    /// Arguments for the module
    #[serde(default)]
    pub module_args: Map<String, Value>,
}

/// Body of an error-class reply (`Error` / `GateSystemError`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable message
    pub message: String,
    /// Remote traceback when one was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// A protocol message, tagged by its wire name.
///
/// The set is closed: anything else on the wire decodes to
/// [`CodecError::BadEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake, sent by both sides. The body is opaque capabilities.
    Hello(Map<String, Value>),
    /// Controller → gate: run a classic module.
    Module(ModuleRequest),
    /// Gate → controller: classic module output.
    ModuleResult {
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },
    /// Controller → gate: run an FTL-native module.
    FtlModule(FtlModuleRequest),
    /// Gate → controller: FTL-native module result value.
    FtlModuleResult {
        /// The value returned by the module
        result: Value,
    },
    /// Gate → controller: the named module is not in the bundled catalog.
    ModuleNotFound {
        /// Explanation naming the module
        message: String,
    },
    /// Gate → controller: module execution raised an error.
    Error(ErrorReply),
    /// Gate → controller: the gate runtime itself failed.
    GateSystemError(ErrorReply),
    /// Controller → gate: finish up and exit.
    Shutdown,
    /// Gate → controller: acknowledgement of shutdown, followed by EOF.
    Goodbye,
}

impl Message {
    /// The wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::Module(_) => "Module",
            Message::ModuleResult { .. } => "ModuleResult",
            Message::FtlModule(_) => "FTLModule",
            Message::FtlModuleResult { .. } => "FTLModuleResult",
            Message::ModuleNotFound { .. } => "ModuleNotFound",
            Message::Error(_) => "Error",
            Message::GateSystemError(_) => "GateSystemError",
            Message::Shutdown => "Shutdown",
            Message::Goodbye => "Goodbye",
        }
    }

    /// An empty-bodied handshake message.
    pub fn hello() -> Self {
        Message::Hello(Map::new())
    }

    /// Serialize this message's body to a JSON object.
    fn body(&self) -> Result<Value, CodecError> {
        let body = match self {
            Message::Hello(caps) => Value::Object(caps.clone()),
            Message::Module(req) => serde_json::to_value(req)?,
            Message::ModuleResult { stdout, stderr } => serde_json::json!({
                "stdout": stdout,
                "stderr": stderr,
            }),
            Message::FtlModule(req) => serde_json::to_value(req)?,
            Message::FtlModuleResult { result } => serde_json::json!({ "result": result }),
            Message::ModuleNotFound { message } => serde_json::json!({ "message": message }),
            Message::Error(reply) | Message::GateSystemError(reply) => {
                serde_json::to_value(reply)?
            }
            Message::Shutdown | Message::Goodbye => Value::Object(Map::new()),
        };
        Ok(body)
    }

    /// Reassemble a message from its wire name and body object.
    fn from_parts(kind: &str, body: Map<String, Value>) -> Result<Self, CodecError> {
        let body = Value::Object(body);
        let msg = match kind {
            "Hello" => match body {
                Value::Object(caps) => Message::Hello(caps),
                _ => unreachable!(),
            },
            "Module" => Message::Module(serde_json::from_value(body)?),
            "ModuleResult" => {
                #[derive(Deserialize)]
                struct Body {
                    #[serde(default)]
                    stdout: String,
                    #[serde(default)]
                    stderr: String,
                }
                let b: Body = serde_json::from_value(body)?;
                Message::ModuleResult {
                    stdout: b.stdout,
                    stderr: b.stderr,
                }
            }
            "FTLModule" => Message::FtlModule(serde_json::from_value(body)?),
            "FTLModuleResult" => {
                #[derive(Deserialize)]
                struct Body {
                    result: Value,
                }
                let b: Body = serde_json::from_value(body)?;
                Message::FtlModuleResult { result: b.result }
            }
            "ModuleNotFound" => {
                #[derive(Deserialize)]
                struct Body {
                    #[serde(default)]
                    message: String,
                }
                let b: Body = serde_json::from_value(body)?;
                Message::ModuleNotFound { message: b.message }
            }
            "Error" => Message::Error(serde_json::from_value(body)?),
            "GateSystemError" => Message::GateSystemError(serde_json::from_value(body)?),
            "Shutdown" => Message::Shutdown,
            "Goodbye" => Message::Goodbye,
            other => {
                return Err(CodecError::BadEnvelope(format!(
                    "unknown message type '{other}'"
                )))
            }
        };
        Ok(msg)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Length-prefixed JSON frame codec for gate sessions.
///
/// Implements [`Encoder`]/[`Decoder`] so it can drive `FramedRead` /
/// `FramedWrite` on any byte stream: SSH channel pipes, subprocess stdio, or
/// an in-memory duplex in tests.
#[derive(Debug, Clone)]
pub struct GateCodec {
    max_frame: usize,
}

impl GateCodec {
    /// Create a codec with the default 64 MiB frame ceiling.
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Create a codec with a custom frame ceiling.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for GateCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the 8-byte lowercase hex header into a body length.
fn parse_header(header: &[u8]) -> Result<usize, CodecError> {
    debug_assert_eq!(header.len(), HEADER_LEN);
    let text = std::str::from_utf8(header)
        .map_err(|_| CodecError::BadLengthHeader(String::from_utf8_lossy(header).into_owned()))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::BadLengthHeader(text.to_string()));
    }
    usize::from_str_radix(text, 16).map_err(|_| CodecError::BadLengthHeader(text.to_string()))
}

impl Decoder for GateCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN);
            return Ok(None);
        }

        let length = parse_header(&src[..HEADER_LEN])?;
        if length > self.max_frame {
            return Err(CodecError::OversizeFrame {
                length,
                max: self.max_frame,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(length);

        let value: Value = serde_json::from_slice(&body)?;
        let (kind, body) = match value {
            Value::Array(mut parts) if parts.len() == 2 => {
                let body = parts.pop().expect("len checked");
                let kind = parts.pop().expect("len checked");
                match (kind, body) {
                    (Value::String(kind), Value::Object(body)) => (kind, body),
                    (kind, body) => {
                        return Err(CodecError::BadEnvelope(format!(
                            "expected [string, object], got [{}, {}]",
                            type_name(&kind),
                            type_name(&body)
                        )))
                    }
                }
            }
            other => {
                return Err(CodecError::BadEnvelope(format!(
                    "expected a 2-element array, got {}",
                    type_name(&other)
                )))
            }
        };

        Message::from_parts(&kind, body).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.is_empty() {
            // Clean EOF on a frame boundary.
            return Ok(None);
        }
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None => Err(CodecError::Truncation {
                got: src.len(),
                expected: if src.len() < HEADER_LEN {
                    HEADER_LEN
                } else {
                    HEADER_LEN + parse_header(&src[..HEADER_LEN])?
                },
            }),
        }
    }
}

impl Encoder<Message> for GateCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = encode_message(&item, self.max_frame)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

/// Encode a message into a complete frame (header + body).
pub fn encode_message(msg: &Message, max_frame: usize) -> Result<Vec<u8>, CodecError> {
    let envelope = Value::Array(vec![Value::String(msg.kind().to_string()), msg.body()?]);
    let body = serde_json::to_vec(&envelope)?;
    if body.len() > max_frame {
        return Err(CodecError::OversizeFrame {
            length: body.len(),
            max: max_frame,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(format!("{:08x}", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_one(bytes: &[u8]) -> Result<Option<Message>, CodecError> {
        let mut codec = GateCodec::new();
        let mut buf = BytesMut::from(bytes);
        codec.decode(&mut buf)
    }

    #[test]
    fn test_round_trip_hello() {
        let frame = encode_message(&Message::hello(), DEFAULT_MAX_FRAME).unwrap();
        assert!(frame.starts_with(b"0000"));
        let decoded = decode_one(&frame).unwrap().unwrap();
        assert_eq!(decoded, Message::hello());
    }

    #[test]
    fn test_round_trip_module() {
        let mut args = Map::new();
        args.insert("cmd".to_string(), Value::String("echo pong".to_string()));
        let msg = Message::Module(ModuleRequest {
            module_name: "command".to_string(),
            module: None,
            module_args: args,
        });
        let frame = encode_message(&msg, DEFAULT_MAX_FRAME).unwrap();
        let decoded = decode_one(&frame).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_header_is_lowercase_hex() {
        let msg = Message::ModuleResult {
            stdout: "x".repeat(300),
            stderr: String::new(),
        };
        let frame = encode_message(&msg, DEFAULT_MAX_FRAME).unwrap();
        let header = std::str::from_utf8(&frame[..HEADER_LEN]).unwrap();
        assert_eq!(header, format!("{:08x}", frame.len() - HEADER_LEN));
        assert_eq!(header, header.to_lowercase());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = GateCodec::new();
        let mut buf = BytesMut::from(&b"0000"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_header_at_eof_is_truncation() {
        let mut codec = GateCodec::new();
        let mut buf = BytesMut::from(&b"0000"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncation { got: 4, .. }));
    }

    #[test]
    fn test_clean_eof() {
        let mut codec = GateCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_length_header() {
        let err = decode_one(b"zzzzzzzz{}").unwrap_err();
        assert!(matches!(err, CodecError::BadLengthHeader(_)));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = GateCodec::with_max_frame(16);
        let mut buf = BytesMut::from(&b"00000100"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::OversizeFrame {
                length: 256,
                max: 16
            }
        ));
    }

    #[test]
    fn test_empty_body_is_legal() {
        // ["Shutdown",{}] is 15 bytes; a zero-length *body* frame is also
        // accepted by the header parser even though no message fits in it.
        let frame = encode_message(&Message::Shutdown, DEFAULT_MAX_FRAME).unwrap();
        let decoded = decode_one(&frame).unwrap().unwrap();
        assert_eq!(decoded, Message::Shutdown);
        assert_eq!(parse_header(b"00000000").unwrap(), 0);
    }

    #[test]
    fn test_bad_envelope_not_array() {
        let body = br#"{"not": "an array"}"#;
        let mut frame = format!("{:08x}", body.len()).into_bytes();
        frame.extend_from_slice(body);
        let err = decode_one(&frame).unwrap_err();
        assert!(matches!(err, CodecError::BadEnvelope(_)));
    }

    #[test]
    fn test_bad_envelope_wrong_arity() {
        let body = br#"["Hello",{},"extra"]"#;
        let mut frame = format!("{:08x}", body.len()).into_bytes();
        frame.extend_from_slice(body);
        let err = decode_one(&frame).unwrap_err();
        assert!(matches!(err, CodecError::BadEnvelope(_)));
    }

    #[test]
    fn test_unknown_message_type() {
        let body = br#"["Bogus",{}]"#;
        let mut frame = format!("{:08x}", body.len()).into_bytes();
        frame.extend_from_slice(body);
        let err = decode_one(&frame).unwrap_err();
        assert!(matches!(err, CodecError::BadEnvelope(_)));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut codec = GateCodec::new();
        let mut buf = BytesMut::new();
        let a = encode_message(&Message::hello(), DEFAULT_MAX_FRAME).unwrap();
        let b = encode_message(&Message::Goodbye, DEFAULT_MAX_FRAME).unwrap();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::hello());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Goodbye);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
