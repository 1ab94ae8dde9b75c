//! Stateless request/response facade.
//!
//! # Purpose
//! History, presence, stats, time, and REST publish over a narrow
//! [`HttpClient`] seam. Uses only the codec pipeline, never the connection
//! state machine, so it works without a realtime connection. Bodies travel
//! in the configured wire format; pagination follows RFC-5988 `Link`
//! headers.
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

use beacon_codec::{self as codec, ChannelOptions};
use beacon_wire::{ErrorInfo, Message, PresenceMessage, WireFormat};

use crate::config::ClientOptions;
use crate::error::{Error, Result, code};
use crate::transport::{HttpClient, HttpRequest, HttpResponse};

pub(crate) mod pagination;

pub use pagination::{PageRequest, PaginatedResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forwards,
    Backwards,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Forwards => "forwards",
            Direction::Backwards => "backwards",
        }
    }
}

/// Time-bounded query for history and stats endpoints.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub direction: Option<Direction>,
}

impl HistoryQuery {
    fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("start".into(), start.timestamp_millis().to_string()));
        }
        if let Some(end) = self.end {
            params.push(("end".into(), end.timestamp_millis().to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(direction) = self.direction {
            params.push(("direction".into(), direction.as_str().into()));
        }
        params
    }
}

/// The stateless client surface.
pub struct Rest {
    http: Arc<dyn HttpClient>,
    options: ClientOptions,
}

impl Rest {
    pub fn new(options: ClientOptions, http: Arc<dyn HttpClient>) -> Self {
        Self { http, options }
    }

    pub fn format(&self) -> WireFormat {
        self.options.format
    }

    /// Broker time, for clock-skew-free history bounds.
    pub async fn time(&self) -> Result<DateTime<Utc>> {
        let response = self.execute(HttpRequest::get("/time")).await?;
        let stamps: Vec<i64> = self.decode_body(&response.body)?;
        let millis = stamps
            .first()
            .copied()
            .ok_or_else(|| Error::ProtocolViolation("empty time response".into()))?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| Error::ProtocolViolation(format!("time out of range: {millis}")))
    }

    /// Publish over REST; payloads run through the same encode pipeline as
    /// realtime publishes.
    pub async fn publish(
        &self,
        channel: &str,
        mut messages: Vec<Message>,
        options: &ChannelOptions,
    ) -> Result<()> {
        for message in &mut messages {
            codec::encode_message(message, options, self.options.format)?;
        }
        let body = self.encode_body(&messages)?;
        let request = HttpRequest::post(format!("/channels/{channel}/messages"), body)
            .header("content-type", self.options.format.content_type());
        self.execute(request).await?;
        Ok(())
    }

    pub async fn history(
        &self,
        channel: &str,
        query: &HistoryQuery,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<Message>> {
        let request = PageRequest {
            path: format!("/channels/{channel}/history"),
            params: query.params(),
        };
        self.history_page(&request, options).await
    }

    /// Re-issue a history page relation (`first`/`next`/`previous`/
    /// `current`).
    pub async fn history_page(
        &self,
        page: &PageRequest,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<Message>> {
        self.request_page(page, |body| {
            let mut messages: Vec<Message> = self.decode_body(body)?;
            for message in &mut messages {
                if let Err(err) = codec::decode_message(message, options, self.options.format) {
                    warn!(error = %err, "history message decode degraded");
                }
            }
            Ok(messages)
        })
        .await
    }

    /// Members currently present on a channel, via the REST surface.
    pub async fn presence(
        &self,
        channel: &str,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<PresenceMessage>> {
        let request = PageRequest::new(format!("/channels/{channel}/presence"));
        self.presence_page(&request, options).await
    }

    pub async fn presence_page(
        &self,
        page: &PageRequest,
        options: &ChannelOptions,
    ) -> Result<PaginatedResult<PresenceMessage>> {
        self.request_page(page, |body| {
            let mut entries: Vec<PresenceMessage> = self.decode_body(body)?;
            for entry in &mut entries {
                if let Err(err) = codec::decode_presence(entry, options, self.options.format) {
                    warn!(error = %err, "presence decode degraded");
                }
            }
            Ok(entries)
        })
        .await
    }

    /// Account statistics as opaque structured records.
    pub async fn stats(&self, query: &HistoryQuery) -> Result<PaginatedResult<serde_json::Value>> {
        let request = PageRequest {
            path: "/stats".into(),
            params: query.params(),
        };
        self.stats_page(&request).await
    }

    pub async fn stats_page(
        &self,
        page: &PageRequest,
    ) -> Result<PaginatedResult<serde_json::Value>> {
        self.request_page(page, |body| self.decode_body(body)).await
    }

    async fn request_page<T>(
        &self,
        page: &PageRequest,
        decode: impl Fn(&Bytes) -> Result<Vec<T>>,
    ) -> Result<PaginatedResult<T>> {
        let mut request = HttpRequest::get(page.path.clone());
        request.params = page.params.clone();
        let response = self.execute(request).await?;
        let links = pagination::parse_link_headers(response.headers_named("link"), &page.path);
        let items = decode(&response.body)?;
        Ok(PaginatedResult::new(items, links))
    }

    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        request = request.header("accept", self.options.format.content_type());
        if let Some(token) = &self.options.token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = self
            .http
            .execute(request)
            .await
            .map_err(Error::Transport)?;
        if response.status >= 400 {
            return Err(Error::from_error_info(self.response_error(&response)));
        }
        Ok(response)
    }

    /// Prefer the error descriptor in the body; fall back to the status.
    fn response_error(&self, response: &HttpResponse) -> ErrorInfo {
        if let Ok(mut info) = serde_json::from_slice::<ErrorInfo>(&response.body)
            && info.code != 0
        {
            if info.status_code == 0 {
                info.status_code = i32::from(response.status);
            }
            return info;
        }
        let code = match response.status {
            401 | 403 => code::AUTH_FAILURE,
            _ => code::BAD_REQUEST,
        };
        ErrorInfo::new(
            code,
            i32::from(response.status),
            format!("request failed with status {}", response.status),
        )
    }

    fn encode_body<T: serde::Serialize>(&self, value: &T) -> Result<Bytes> {
        match self.options.format {
            WireFormat::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|err| Error::ProtocolViolation(format!("request body: {err}"))),
            WireFormat::Packed => rmp_serde::to_vec_named(value)
                .map(Bytes::from)
                .map_err(|err| Error::ProtocolViolation(format!("request body: {err}"))),
        }
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &Bytes) -> Result<Vec<T>> {
        match self.options.format {
            WireFormat::Json => serde_json::from_slice(body)
                .map_err(|err| Error::ProtocolViolation(format!("response body: {err}"))),
            WireFormat::Packed => rmp_serde::from_slice(body)
                .map_err(|err| Error::ProtocolViolation(format!("response body: {err}"))),
        }
    }
}
