//! HTTP/1.1 request parsing using the [`httparse`] crate.

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A parsed HTTP/1.1 request.
///
/// The request target is split at the first `?` into [`path`](Self::path) and
/// [`raw_query`](Self::raw_query). Neither half is percent-decoded or otherwise
/// normalized: the cache key is built from exactly the bytes the client sent.
///
/// # Examples
///
/// ```
/// use cachegate::http::Request;
///
/// let raw = b"GET /products?sort=name%20asc HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/products");
/// assert_eq!(request.raw_query(), Some("sort=name%20asc"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Builds a bodyless HTTP/1.1 request for `target` (path plus optional
    /// `?query`) without going through the wire parser.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            query,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Parses a request head from `buf`.
    ///
    /// Returns the request together with the offset at which the body starts.
    /// Body bytes present in `buf` past that offset are copied into the request.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] when the header block has not fully arrived.
    /// - [`RequestError::Parse`] when the bytes are not valid HTTP/1.x.
    /// - [`RequestError::MissingField`] when method, target or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw.method {
            Some(m) => m.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let target = raw
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        let (path, query) = split_target(target);

        Ok((
            Self {
                method,
                path,
                query,
                version,
                headers: header_map,
                body: Bytes::copy_from_slice(&buf[body_offset..]),
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string without the leading `?`, if the target had one.
    ///
    /// `Some("")` is returned for a target ending in a bare `?`.
    pub fn raw_query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// HTTP/1.1 keeps the connection open unless told otherwise; HTTP/1.0 closes
    /// it unless `Connection: keep-alive` is present.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_products_request() {
        let raw = b"GET /products HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/products");
        assert_eq!(req.raw_query(), None);
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn query_is_kept_raw() {
        let raw = b"GET /products?q=a+b&tag=%41 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.raw_query(), Some("q=a+b&tag=%41"));
    }

    #[test]
    fn bare_question_mark_yields_empty_query() {
        let req = Request::new(Method::Get, "/products?");
        assert_eq!(req.path(), "/products");
        assert_eq!(req.raw_query(), Some(""));
    }

    #[test]
    fn partial_head_is_incomplete() {
        let raw = b"GET /products HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn http10_closes_by_default() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_offset_and_length() {
        let raw = b"POST /products HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(2));
        assert_eq!(&raw[offset..], b"{}");
        assert_eq!(req.body().as_ref(), b"{}");
    }
}
