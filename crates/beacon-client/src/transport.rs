// Narrow seams for the pluggable pieces: the realtime transport, the HTTP
// client behind the request facade, and token minting.
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use beacon_wire::{ErrorInfo, RawFrame};

/// Events a transport posts into the connection actor's inbox.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport finished its handshake and can carry frames.
    Opened,
    Frame(RawFrame),
    /// Orderly close, with the peer's reason when one was supplied.
    Closed(Option<ErrorInfo>),
    Error(ErrorInfo),
}

/// One active bidirectional pipe to the broker.
///
/// The connection actor is the only caller; a transport never outlives the
/// connection attempt that dialed it.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: RawFrame) -> Result<(), ErrorInfo>;

    /// Tear the transport down. Must be idempotent and synchronous; no
    /// events may be delivered after it returns.
    fn destroy(&mut self);
}

/// Dials transports. `dial` may return before the handshake completes; the
/// transport reports readiness by posting [`TransportEvent::Opened`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn Transport>, ErrorInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// First header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers with the given name, case-insensitively.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP execution seam behind the request facade. Pooling, TLS, and base-url
/// handling live in the implementation.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ErrorInfo>;
}

/// Token minting seam. Called before the first connect when no token is
/// configured and again whenever the broker reports an expired token.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn token(&self) -> Result<String, ErrorInfo>;
}
