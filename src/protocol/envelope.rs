//! Envelopes carried inside frames
//!
//! Each envelope is a flat sequence of tagged fields:
//!
//! ```text
//! u8 tag | u32 length (BE) | length bytes of value
//! ```
//!
//! Integers are fixed-width big-endian inside their value, nested messages
//! (headers, auth) are a field whose value is another field sequence. Unknown
//! tags are skipped so newer peers can add fields.

use crate::error::ProxyError;
use crate::protocol::headers::Headers;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use bytes::BufMut;
use http::Method;
use std::io::Cursor;

/// A message that can be serialised into a frame body.
pub trait Envelope: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError>;
}

/// Builder for a tagged field sequence.
#[derive(Debug, Default)]
pub(crate) struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bytes(&mut self, tag: u8, value: &[u8]) -> &mut Self {
        self.buf.put_u8(tag);
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub(crate) fn string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.bytes(tag, value.as_bytes())
    }

    pub(crate) fn u16(&mut self, tag: u8, value: u16) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub(crate) fn u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.bytes(tag, &[value])
    }

    pub(crate) fn i64(&mut self, tag: u8, value: i64) -> &mut Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    pub(crate) fn message<E: Envelope>(&mut self, tag: u8, value: &E) -> &mut Self {
        self.bytes(tag, &value.to_bytes())
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Iterator over the `(tag, value)` pairs of a field sequence.
pub(crate) struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(u8, &'a [u8]), ProxyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 5 {
            self.rest = &[];
            return Some(Err(ProxyError::Decode("Truncated field header".into())));
        }

        let tag = self.rest[0];
        let len = BigEndian::read_u32(&self.rest[1..5]) as usize;
        let body = &self.rest[5..];
        if body.len() < len {
            self.rest = &[];
            return Some(Err(ProxyError::Decode(format!(
                "Field {} truncated: {} < {}",
                tag,
                body.len(),
                len
            ))));
        }

        let (value, tail) = body.split_at(len);
        self.rest = tail;
        Some(Ok((tag, value)))
    }
}

pub(crate) fn read_string(tag: u8, value: &[u8]) -> Result<String, ProxyError> {
    String::from_utf8(value.to_vec())
        .map_err(|_| ProxyError::Decode(format!("Field {} is not valid UTF-8", tag)))
}

fn read_fixed<T>(
    tag: u8,
    value: &[u8],
    width: usize,
    read: impl FnOnce(&mut Cursor<&[u8]>) -> std::io::Result<T>,
) -> Result<T, ProxyError> {
    if value.len() != width {
        return Err(ProxyError::Decode(format!(
            "Field {} has width {}, expected {}",
            tag,
            value.len(),
            width
        )));
    }
    read(&mut Cursor::new(value)).map_err(|e| ProxyError::Decode(e.to_string()))
}

fn read_u8(tag: u8, value: &[u8]) -> Result<u8, ProxyError> {
    read_fixed(tag, value, 1, |c| c.read_u8())
}

fn read_u16(tag: u8, value: &[u8]) -> Result<u16, ProxyError> {
    read_fixed(tag, value, 2, |c| c.read_u16::<BigEndian>())
}

fn read_i64(tag: u8, value: &[u8]) -> Result<i64, ProxyError> {
    read_fixed(tag, value, 8, |c| c.read_i64::<BigEndian>())
}

fn missing(envelope: &str, field: &str) -> ProxyError {
    ProxyError::Decode(format!("{} is missing {}", envelope, field))
}

/// HTTP version of the relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HttpVersion {
    Http10 = 1,
    #[default]
    Http11 = 2,
    Http2 = 3,
}

impl TryFrom<u8> for HttpVersion {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HttpVersion::Http10),
            2 => Ok(HttpVersion::Http11),
            3 => Ok(HttpVersion::Http2),
            _ => Err(ProxyError::Decode(format!("Unknown HTTP version: {}", value))),
        }
    }
}

impl From<http::Version> for HttpVersion {
    fn from(version: http::Version) -> Self {
        match version {
            http::Version::HTTP_10 | http::Version::HTTP_09 => HttpVersion::Http10,
            http::Version::HTTP_2 | http::Version::HTTP_3 => HttpVersion::Http2,
            _ => HttpVersion::Http11,
        }
    }
}

/// Plain HTTP request relayed on the HTTP leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub absolute_uri: String,
    pub scheme: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

impl Envelope for Request {
    fn to_bytes(&self) -> Vec<u8> {
        FieldWriter::new()
            .string(1, self.method.as_str())
            .string(2, &self.absolute_uri)
            .string(3, &self.scheme)
            .u8(4, self.version as u8)
            .message(5, &self.headers)
            .finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut method = None;
        let mut absolute_uri = None;
        let mut scheme = String::from("http");
        let mut version = HttpVersion::default();
        let mut headers = Headers::default();

        for field in Fields::new(data) {
            let (tag, value) = field?;
            match tag {
                1 => {
                    method = Some(Method::from_bytes(value).map_err(|_| {
                        ProxyError::Decode(format!(
                            "Invalid method: {}",
                            String::from_utf8_lossy(value)
                        ))
                    })?)
                }
                2 => absolute_uri = Some(read_string(tag, value)?),
                3 => scheme = read_string(tag, value)?,
                4 => version = HttpVersion::try_from(read_u8(tag, value)?)?,
                5 => headers = Headers::from_bytes(value)?,
                _ => {}
            }
        }

        Ok(Self {
            method: method.ok_or_else(|| missing("Request", "method"))?,
            absolute_uri: absolute_uri.ok_or_else(|| missing("Request", "absolute_uri"))?,
            scheme,
            version,
            headers,
        })
    }
}

/// Upstream response relayed back on the HTTP leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub status_message: Option<String>,
    pub headers: Headers,
}

impl Envelope for Response {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.u16(1, self.status_code);
        if let Some(message) = &self.status_message {
            writer.string(2, message);
        }
        writer.message(3, &self.headers).finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut status_code = None;
        let mut status_message = None;
        let mut headers = Headers::default();

        for field in Fields::new(data) {
            let (tag, value) = field?;
            match tag {
                1 => status_code = Some(read_u16(tag, value)?),
                2 => status_message = Some(read_string(tag, value)?),
                3 => headers = Headers::from_bytes(value)?,
                _ => {}
            }
        }

        Ok(Self {
            status_code: status_code.ok_or_else(|| missing("Response", "status_code"))?,
            status_message,
            headers,
        })
    }
}

/// Tunnel request sent first on the CONNECT leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub headers: Headers,
    /// Embedded here because the CONNECT leg has no header channel.
    pub auth: Option<ProxyAuthentication>,
}

impl Envelope for ConnectRequest {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer
            .string(1, &self.host)
            .u16(2, self.port)
            .message(3, &self.headers);
        if let Some(auth) = &self.auth {
            writer.message(4, auth);
        }
        writer.finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut host = None;
        let mut port = None;
        let mut headers = Headers::default();
        let mut auth = None;

        for field in Fields::new(data) {
            let (tag, value) = field?;
            match tag {
                1 => host = Some(read_string(tag, value)?),
                2 => port = Some(read_u16(tag, value)?),
                3 => headers = Headers::from_bytes(value)?,
                4 => auth = Some(ProxyAuthentication::from_bytes(value)?),
                _ => {}
            }
        }

        Ok(Self {
            host: host.ok_or_else(|| missing("ConnectRequest", "host"))?,
            port: port.ok_or_else(|| missing("ConnectRequest", "port"))?,
            headers,
            auth,
        })
    }
}

/// Reply to a [`ConnectRequest`]; code 200 turns the connection into a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub code: u16,
    pub msg: Option<String>,
}

impl ConnectResult {
    pub fn ok() -> Self {
        Self { code: 200, msg: None }
    }

    pub fn failed(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: Some(msg.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

impl Envelope for ConnectResult {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        writer.u16(1, self.code);
        if let Some(msg) = &self.msg {
            writer.string(2, msg);
        }
        writer.finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut code = None;
        let mut msg = None;

        for field in Fields::new(data) {
            let (tag, value) = field?;
            match tag {
                1 => code = Some(read_u16(tag, value)?),
                2 => msg = Some(read_string(tag, value)?),
                _ => {}
            }
        }

        Ok(Self {
            code: code.ok_or_else(|| missing("ConnectResult", "code"))?,
            msg,
        })
    }
}

/// Signed proof that the sender holds a registered secret key
///
/// Absent fields decode as empty or zero; [`crate::auth::SecretTable::verify`]
/// rejects those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyAuthentication {
    pub secret_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub nonce: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Envelope for ProxyAuthentication {
    fn to_bytes(&self) -> Vec<u8> {
        FieldWriter::new()
            .string(1, &self.secret_id)
            .i64(2, self.timestamp)
            .bytes(3, &self.nonce)
            .bytes(4, &self.signature)
            .finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut auth = ProxyAuthentication::default();
        for field in Fields::new(data) {
            let (tag, value) = field?;
            match tag {
                1 => auth.secret_id = read_string(tag, value)?,
                2 => auth.timestamp = read_i64(tag, value)?,
                3 => auth.nonce = value.to_vec(),
                4 => auth.signature = value.to_vec(),
                _ => {}
            }
        }
        Ok(auth)
    }
}
