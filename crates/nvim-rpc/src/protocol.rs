//! msgpack-rpc message model and framing.
//!
//! Every frame is a single self-delimiting msgpack array; there is no
//! length prefix.
//!
//! ```text
//! [0, seq: u32, method: str|int, params: array]   request
//! [1, seq: u32, error: any|nil, result: any|nil]  response
//! [2, method: str|int, params: array]             notification
//! ```

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use bytes::BytesMut;
use rmpv::Value;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REQUEST: u64 = 0;
pub const RESPONSE: u64 = 1;
pub const NOTIFY: u64 = 2;

/// A remote method, addressed either by name or by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Name(String),
    Id(u64),
}

impl Method {
    /// Key used to look the method up in a handler registry.
    pub fn key(&self) -> String {
        match self {
            Method::Name(name) => name.clone(),
            Method::Id(id) => id.to_string(),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => s
                .into_str()
                .map(Method::Name)
                .ok_or_else(|| RpcError::protocol("method name is not valid UTF-8")),
            Value::Integer(n) => n
                .as_u64()
                .map(Method::Id)
                .ok_or_else(|| RpcError::protocol("method id is negative")),
            other => Err(RpcError::protocol(format!(
                "method must be a string or integer, got {}",
                other
            ))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Method::Name(name) => Value::from(name.as_str()),
            Method::Id(id) => Value::from(*id),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Name(name) => write!(f, "{}", name),
            Method::Id(id) => write!(f, "#{}", id),
        }
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Method::Name(name.to_string())
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Method::Name(name)
    }
}

impl From<u64> for Method {
    fn from(id: u64) -> Self {
        Method::Id(id)
    }
}

/// One decoded msgpack-rpc frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        seq: u32,
        method: Method,
        params: Vec<Value>,
    },
    Response {
        seq: u32,
        /// `None` when the peer sent nil.
        error: Option<Value>,
        result: Value,
    },
    Notification {
        method: Method,
        params: Vec<Value>,
    },
}

impl Message {
    /// Interpret a decoded msgpack value as a message.
    pub fn from_value(value: Value) -> Result<Self> {
        let fields = match value {
            Value::Array(fields) => fields,
            other => {
                return Err(RpcError::protocol(format!(
                    "message must be an array, got {}",
                    other
                )))
            }
        };

        let mut fields = fields.into_iter();
        let kind = fields
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcError::protocol("message is missing its kind tag"))?;

        match kind {
            REQUEST => {
                let (seq, method, params) = match (fields.next(), fields.next(), fields.next()) {
                    (Some(seq), Some(method), Some(params)) => (seq, method, params),
                    _ => return Err(RpcError::protocol("request must have 4 fields")),
                };
                Ok(Message::Request {
                    seq: parse_seq(seq)?,
                    method: Method::from_value(method)?,
                    params: parse_params(params)?,
                })
            }
            RESPONSE => {
                let (seq, error, result) = match (fields.next(), fields.next(), fields.next()) {
                    (Some(seq), Some(error), Some(result)) => (seq, error, result),
                    _ => return Err(RpcError::protocol("response must have 4 fields")),
                };
                Ok(Message::Response {
                    seq: parse_seq(seq)?,
                    error: if error.is_nil() { None } else { Some(error) },
                    result,
                })
            }
            NOTIFY => {
                let (method, params) = match (fields.next(), fields.next()) {
                    (Some(method), Some(params)) => (method, params),
                    _ => return Err(RpcError::protocol("notification must have 3 fields")),
                };
                Ok(Message::Notification {
                    method: Method::from_value(method)?,
                    params: parse_params(params)?,
                })
            }
            other => Err(RpcError::protocol(format!("unknown message kind {}", other))),
        }
    }

    /// Convert to the msgpack array that goes on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request {
                seq,
                method,
                params,
            } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(*seq),
                method.to_value(),
                Value::Array(params.clone()),
            ]),
            Message::Response { seq, error, result } => Value::Array(vec![
                Value::from(RESPONSE),
                Value::from(*seq),
                error.clone().unwrap_or(Value::Nil),
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFY),
                method.to_value(),
                Value::Array(params.clone()),
            ]),
        }
    }

    /// Encode into msgpack bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())
            .map_err(|e| RpcError::protocol(format!("failed to encode message: {}", e)))?;
        Ok(buf)
    }
}

fn parse_seq(value: Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| RpcError::protocol(format!("invalid sequence id {}", value)))
}

fn parse_params(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(RpcError::protocol(format!(
            "params must be an array, got {}",
            other
        ))),
    }
}

/// Incremental decoder that turns a byte stream into msgpack values.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
    scanner: FrameScanner,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(RpcConfig::READ_BUFFER_SIZE),
            scanner: FrameScanner::default(),
        }
    }

    /// Append raw bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete value, or `None` if more bytes are needed.
    ///
    /// The frame boundary is found first, so a value is parsed only once
    /// all of its bytes have arrived.
    pub fn decode(&mut self) -> Result<Option<Value>> {
        let Some(len) = self.scanner.scan(&self.buf)? else {
            if self.buf.len() > RpcConfig::MAX_MESSAGE_SIZE {
                return Err(RpcError::protocol(format!(
                    "message size exceeds maximum {}",
                    RpcConfig::MAX_MESSAGE_SIZE
                )));
            }
            return Ok(None);
        };

        let frame = self.buf.split_to(len);
        Ok(Some(rmpv::decode::read_value(&mut &frame[..])?))
    }

    async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<usize> {
        self.buf.reserve(RpcConfig::READ_BUFFER_SIZE);
        Ok(reader.read_buf(&mut self.buf).await?)
    }
}

/// Resumable walk over msgpack headers that finds where the first value in
/// a buffer ends.
///
/// Progress is kept between calls, so every byte of a frame is looked at
/// once no matter how many reads it arrives in.
#[derive(Debug, Default)]
struct FrameScanner {
    /// End of the last value walked in the current frame.
    offset: usize,
    /// Values still to walk; 0 before a frame starts.
    remaining: u64,
}

impl FrameScanner {
    fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        if self.remaining == 0 {
            self.remaining = 1;
        }
        while self.remaining > 0 {
            let rest = &buf[self.offset..];
            if rest.is_empty() {
                return Ok(None);
            }
            let Some((header, body, children)) = value_header(rest)? else {
                return Ok(None);
            };
            if rest.len() < header + body {
                return Ok(None);
            }
            self.offset += header + body;
            self.remaining = self.remaining - 1 + children;
        }

        let len = self.offset;
        *self = Self::default();
        Ok(Some(len))
    }
}

/// Header size, payload size and nested value count of the value starting
/// at `bytes[0]`, or `None` if its length field is not buffered yet.
fn value_header(bytes: &[u8]) -> Result<Option<(usize, usize, u64)>> {
    let marker = bytes[0];
    let scalar = |header: usize| Ok(Some((header, 0, 0)));
    match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => scalar(1),
        0x80..=0x8f => Ok(Some((1, 0, 2 * u64::from(marker & 0x0f)))),
        0x90..=0x9f => Ok(Some((1, 0, u64::from(marker & 0x0f)))),
        0xa0..=0xbf => Ok(Some((1, usize::from(marker & 0x1f), 0))),
        0xc1 => Err(RpcError::protocol("reserved msgpack marker 0xc1")),
        // bin and str
        0xc4 | 0xd9 => Ok(sized(bytes, 1, 0)),
        0xc5 | 0xda => Ok(sized(bytes, 2, 0)),
        0xc6 | 0xdb => Ok(sized(bytes, 4, 0)),
        // ext: the type byte follows the length
        0xc7 => Ok(sized(bytes, 1, 1)),
        0xc8 => Ok(sized(bytes, 2, 1)),
        0xc9 => Ok(sized(bytes, 4, 1)),
        0xca => scalar(5),
        0xcb => scalar(9),
        0xcc | 0xd0 => scalar(2),
        0xcd | 0xd1 => scalar(3),
        0xce | 0xd2 => scalar(5),
        0xcf | 0xd3 => scalar(9),
        // fixext 1/2/4/8/16
        0xd4 => scalar(3),
        0xd5 => scalar(4),
        0xd6 => scalar(6),
        0xd7 => scalar(10),
        0xd8 => scalar(18),
        0xdc => Ok(counted(bytes, 2, 1)),
        0xdd => Ok(counted(bytes, 4, 1)),
        0xde => Ok(counted(bytes, 2, 2)),
        0xdf => Ok(counted(bytes, 4, 2)),
    }
}

/// Big-endian length field of `width` bytes after the marker.
fn length_field(bytes: &[u8], width: usize) -> Option<u64> {
    let field = bytes.get(1..1 + width)?;
    Some(field.iter().fold(0, |n, b| (n << 8) | u64::from(*b)))
}

fn sized(bytes: &[u8], width: usize, extra: usize) -> Option<(usize, usize, u64)> {
    let len = length_field(bytes, width)?;
    Some((1 + width + extra, len as usize, 0))
}

fn counted(bytes: &[u8], width: usize, per_entry: u64) -> Option<(usize, usize, u64)> {
    let count = length_field(bytes, width)?;
    Some((1 + width, 0, count * per_entry))
}

/// Read the next msgpack value from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection between frames).
pub async fn read_value<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut MessageDecoder,
) -> Result<Option<Value>> {
    loop {
        if let Some(value) = decoder.decode()? {
            return Ok(Some(value));
        }
        if decoder.fill(reader).await? == 0 {
            if decoder.buffered() == 0 {
                return Ok(None);
            }
            return Err(RpcError::Io {
                message: format!(
                    "connection closed with {} bytes of an incomplete message buffered",
                    decoder.buffered()
                ),
            });
        }
    }
}

/// Read and interpret the next message.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut MessageDecoder,
) -> Result<Option<Message>> {
    match read_value(reader, decoder).await? {
        Some(value) => Message::from_value(value).map(Some),
        None => Ok(None),
    }
}

/// Encode and write a single message, flushing the writer.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
