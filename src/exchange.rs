//! Exchange records and response values.

use bytes::Bytes;
use http::{Extensions, HeaderMap, StatusCode, Version};

/// Record of the request side of one exchange, handed to hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    head: Bytes,
    body_offset: u64,
}

impl Exchange {
    pub(crate) fn new(head: Bytes) -> Self {
        let body_offset = head.len() as u64;
        Self { head, body_offset }
    }

    /// The raw header block that was written, including the blank line.
    pub fn head(&self) -> &Bytes {
        &self.head
    }

    /// Offset into the request payload at which the body began.
    pub fn body_offset(&self) -> u64 {
        self.body_offset
    }
}

/// The response value threaded through the receive hooks.
///
/// A response starts out holding only the raw header block. Hooks may fill
/// in the parsed status line and headers (see
/// [`hooks::parse_head`](crate::hooks::parse_head)), replace the body, or
/// attach arbitrary typed values through [`extensions`](Response::extensions).
#[derive(Debug)]
pub struct Response {
    head: Bytes,
    status: Option<StatusCode>,
    version: Option<Version>,
    headers: HeaderMap,
    body: Option<Bytes>,
    extensions: Extensions,
}

impl Response {
    /// A response holding only the raw header block.
    pub fn new(head: impl Into<Bytes>) -> Self {
        Self {
            head: head.into(),
            status: None,
            version: None,
            headers: HeaderMap::new(),
            body: None,
            extensions: Extensions::new(),
        }
    }

    /// The raw header block as received, including the blank line.
    pub fn head(&self) -> &Bytes {
        &self.head
    }

    /// The header block as text, if it is valid UTF-8.
    pub fn head_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.head).ok()
    }

    /// The status code, if a hook has parsed one.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Set the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// The protocol version, if a hook has parsed one.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Set the protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }

    /// Parsed header fields. Empty unless a hook filled them in.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the parsed header fields.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The response body, or `None` when no body was read.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    /// Take the body out of the response.
    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    /// Typed values attached by hooks.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access to the typed values attached by hooks.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Convert into an [`http::Response`], if a status has been parsed.
    ///
    /// A missing body becomes an empty one.
    pub fn into_http(self) -> Option<http::Response<Bytes>> {
        let status = self.status?;
        let mut response = http::Response::new(self.body.unwrap_or_default());
        *response.status_mut() = status;
        *response.version_mut() = self.version.unwrap_or(Version::HTTP_11);
        *response.headers_mut() = self.headers;
        *response.extensions_mut() = self.extensions;
        Some(response)
    }
}
