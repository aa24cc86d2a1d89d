//! HTTP transport abstraction and the tracing decorator built on it
//!
//! A [`Transport`] turns a [`Request`] into a [`Response`] whose body is read
//! through a [`ResponseBody`]. [`TracedTransport`] wraps any transport and
//! records a trace per call without changing what the caller observes.

mod body;
mod capture;
mod http_client;
mod traced;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use body::{BufferedBody, ChunkedBody, ResponseBody};
pub use capture::CapturingBody;
pub use http_client::ReqwestTransport;
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode, Url};
pub use traced::{TracedTransport, TracerOptions};

/// Low-level cause of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Request did not finish in time
    Timeout,
    /// Connection could not be established
    Connect,
    /// Request could not be built or sent
    Request,
    /// Response body could not be read
    Body,
    /// Response body could not be decoded
    Decode,
    /// Anything else
    Other,
}

impl TransportErrorKind {
    /// Name recorded as the error code of a failed trace
    pub fn name(self) -> &'static str {
        match self {
            Self::Timeout => "TimeoutError",
            Self::Connect => "ConnectError",
            Self::Request => "RequestError",
            Self::Body => "BodyError",
            Self::Decode => "DecodeError",
            Self::Other => "TransportError",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of the wire below HTTP; the only error a traced call surfaces
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<reqwest::Error>,
}

impl TransportError {
    /// Create an error without an underlying cause
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Kind of failure
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the request timed out
    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }

    /// Whether the connection could not be established
    pub fn is_connect(&self) -> bool {
        self.kind == TransportErrorKind::Connect
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() {
            TransportErrorKind::Body
        } else if err.is_decode() {
            TransportErrorKind::Decode
        } else if err.is_request() || err.is_builder() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };

        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Outbound HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

impl Request {
    /// Create a request with no headers and an empty body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// JSON `POST` request
    pub fn post_json<T: Serialize + ?Sized>(url: Url, payload: &T) -> crate::Result<Self> {
        let mut request = Self::new(Method::POST, url);
        request.body = Bytes::from(serde_json::to_vec(payload)?);
        request.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(request)
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// HTTP response with a lazily read body
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Box<dyn ResponseBody>,
}

impl Response {
    /// Assemble a response from its parts
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        url: Url,
        body: impl ResponseBody + 'static,
    ) -> Self {
        Self {
            status,
            headers,
            url,
            body: Box::new(body),
        }
    }

    /// Response whose body is already in memory
    pub fn from_bytes(
        status: StatusCode,
        headers: HeaderMap,
        url: Url,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(status, headers, url, BufferedBody::new(body.into()))
    }

    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL of the response
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Read the whole body
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        self.body.read_all().await
    }

    /// Read the whole body as text, replacing invalid UTF-8
    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read the whole body and deserialize it as JSON
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::new(TransportErrorKind::Decode, e.to_string()))
    }

    /// Next chunk of the body, `None` once it is exhausted
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.body.next_chunk().await
    }

    /// Body as a stream of chunks; the stream ends after the first error
    pub fn bytes_stream(self) -> BoxStream<'static, Result<Bytes, TransportError>> {
        Box::pin(stream::unfold(Some(self.body), |state| async move {
            let mut body = state?;
            match body.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        }))
    }

    pub(crate) fn map_body(
        self,
        f: impl FnOnce(Box<dyn ResponseBody>) -> Box<dyn ResponseBody>,
    ) -> Self {
        Self {
            status: self.status,
            headers: self.headers,
            url: self.url,
            body: f(self.body),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Something that performs HTTP requests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the response head with an unread body
    async fn handle_request(&self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn handle_request(&self, request: Request) -> Result<Response, TransportError> {
        (**self).handle_request(request).await
    }
}
