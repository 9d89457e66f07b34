//! Request payloads.
//!
//! A [`Payload`] is the request handed to
//! [`Connection::send`](crate::Connection::send): a header block terminated by
//! a blank line, followed by an opaque body. Payloads are built from bytes or
//! text, from an [`http::Request`], or from any [`AsyncRead`] with
//! [`Payload::stream`]. Other values need to be converted to one of these by
//! the caller.

use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderName, HeaderValue};
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};

use crate::session::CRLF;

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Errors from editing a payload.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PayloadError {
    /// The payload is a stream, so its head can't be edited in place.
    #[error("cannot edit the head of a streaming payload")]
    Streaming,

    /// The payload has no terminated request line.
    #[error("payload has no request line")]
    MissingRequestLine,
}

/// A request to send over a connection.
pub struct Payload {
    inner: Inner,
}

enum Inner {
    Full(Bytes),
    Stream(BoxReader),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Full(bytes) => f.debug_tuple("Payload::Full").field(bytes).finish(),
            Inner::Stream(_) => f.debug_tuple("Payload::Stream").finish(),
        }
    }
}

impl Payload {
    /// A fully buffered payload.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Full(bytes.into()),
        }
    }

    /// A payload read from an async byte stream.
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            inner: Inner::Stream(Box::pin(reader)),
        }
    }

    /// An empty payload.
    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    /// The payload bytes, if the payload is fully buffered.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.inner {
            Inner::Full(bytes) => Some(bytes),
            Inner::Stream(_) => None,
        }
    }

    /// True if the payload is read from a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner, Inner::Stream(_))
    }

    /// Insert a header line directly after the request line.
    ///
    /// Only fully buffered payloads can be edited.
    pub fn insert_header(
        self,
        name: &HeaderName,
        value: &HeaderValue,
    ) -> Result<Self, PayloadError> {
        let Inner::Full(bytes) = self.inner else {
            return Err(PayloadError::Streaming);
        };

        let split = bytes
            .windows(CRLF.len())
            .position(|window| window == CRLF)
            .map(|idx| idx + CRLF.len())
            .ok_or(PayloadError::MissingRequestLine)?;

        let mut amended = BytesMut::with_capacity(bytes.len() + name.as_str().len() + value.len() + 4);
        amended.extend_from_slice(&bytes[..split]);
        extend_header(&mut amended, name, value);
        amended.extend_from_slice(&bytes[split..]);
        Ok(Self::full(amended.freeze()))
    }

    pub(crate) fn into_reader(self) -> BufReader<BoxReader> {
        let reader: BoxReader = match self.inner {
            Inner::Full(bytes) => Box::pin(std::io::Cursor::new(bytes)),
            Inner::Stream(reader) => reader,
        };
        BufReader::new(reader)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::full(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::full(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::full(text)
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Self::full(text)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Self::full(bytes)
    }
}

/// Render a request as an HTTP/1.x request head followed by its body.
///
/// A `host` header is added from the URI authority, and a `content-length`
/// header for non-empty bodies, unless the request already carries them.
impl<B> From<http::Request<B>> for Payload
where
    B: Into<Bytes>,
{
    fn from(request: http::Request<B>) -> Self {
        let (parts, body) = request.into_parts();
        let body: Bytes = body.into();

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");

        let mut head = BytesMut::new();
        head.extend_from_slice(parts.method.as_str().as_bytes());
        head.extend_from_slice(b" ");
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" ");
        head.extend_from_slice(format!("{:?}", parts.version).as_bytes());
        head.extend_from_slice(CRLF);

        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                head.extend_from_slice(b"host: ");
                head.extend_from_slice(authority.as_str().as_bytes());
                head.extend_from_slice(CRLF);
            }
        }

        for (name, value) in parts.headers.iter() {
            extend_header(&mut head, name, value);
        }

        if !body.is_empty() && !parts.headers.contains_key(CONTENT_LENGTH) {
            head.extend_from_slice(b"content-length: ");
            head.extend_from_slice(body.len().to_string().as_bytes());
            head.extend_from_slice(CRLF);
        }

        head.extend_from_slice(CRLF);
        head.extend_from_slice(&body);
        Self::full(head.freeze())
    }
}

fn extend_header(buf: &mut BytesMut, name: &HeaderName, value: &HeaderValue) {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use http::header::AUTHORIZATION;
    use tokio::io::AsyncReadExt as _;

    use super::*;

    async fn drain(payload: Payload) -> Vec<u8> {
        let mut out = Vec::new();
        payload.into_reader().read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn buffered_and_streamed_payloads() {
        let payload = Payload::from("GET / HTTP/1.1\r\n\r\n");
        assert!(!payload.is_stream());
        assert_eq!(drain(payload).await, b"GET / HTTP/1.1\r\n\r\n");

        let payload = Payload::stream(&b"PUT / HTTP/1.1\r\n\r\ndata"[..]);
        assert!(payload.is_stream());
        assert!(payload.as_bytes().is_none());
        assert_eq!(drain(payload).await, b"PUT / HTTP/1.1\r\n\r\ndata");
    }

    #[tokio::test]
    async fn render_http_request() {
        let request = http::Request::post("http://example.com:8080/rpc?v=2")
            .header("accept", "application/json")
            .body("{}")
            .unwrap();

        let rendered = drain(Payload::from(request)).await;
        assert_eq!(
            String::from_utf8(rendered).unwrap(),
            "POST /rpc?v=2 HTTP/1.1\r\n\
             host: example.com:8080\r\n\
             accept: application/json\r\n\
             content-length: 2\r\n\
             \r\n\
             {}"
        );
    }

    #[tokio::test]
    async fn render_request_keeps_explicit_host() {
        let request = http::Request::get("/")
            .header(HOST, "api.internal")
            .body(Bytes::new())
            .unwrap();

        let rendered = drain(Payload::from(request)).await;
        assert_eq!(rendered, b"GET / HTTP/1.1\r\nhost: api.internal\r\n\r\n");
    }

    #[test]
    fn insert_header_after_request_line() {
        let payload = Payload::from("GET / HTTP/1.1\r\nhost: a\r\n\r\n")
            .insert_header(&AUTHORIZATION, &HeaderValue::from_static("Bearer abc"))
            .unwrap();

        assert_eq!(
            payload.as_bytes().unwrap().as_ref(),
            b"GET / HTTP/1.1\r\nauthorization: Bearer abc\r\nhost: a\r\n\r\n"
        );
    }

    #[test]
    fn insert_header_rejects_streams_and_fragments() {
        let value = HeaderValue::from_static("x");

        let err = Payload::stream(&b""[..])
            .insert_header(&AUTHORIZATION, &value)
            .unwrap_err();
        assert_eq!(err, PayloadError::Streaming);

        let err = Payload::from("GET /")
            .insert_header(&AUTHORIZATION, &value)
            .unwrap_err();
        assert_eq!(err, PayloadError::MissingRequestLine);
    }
}
