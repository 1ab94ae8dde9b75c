// Client defaults and configuration layering: compiled defaults, then
// environment overrides, then an optional yaml override file.
use std::fs;
use std::time::Duration;

use serde::Deserialize;

use beacon_wire::WireFormat;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_DISCONNECTED_RETRY_MS: u64 = 15_000;
pub(crate) const DEFAULT_SUSPENDED_RETRY_MS: u64 = 30_000;
pub(crate) const DEFAULT_CONNECTION_STATE_TTL_MS: u64 = 120_000;
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const DEFAULT_HEARTBEAT_GRACE_MS: u64 = 5_000;
pub(crate) const DEFAULT_SEND_QUEUE_LIMIT: usize = 256;
pub(crate) const DEFAULT_ACK_QUEUE_LIMIT: usize = 1024;
pub(crate) const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;
pub(crate) const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Primary realtime endpoint, e.g. `wss://realtime.example.com`.
    pub endpoint: String,
    /// Hosts tried in rotation when the primary keeps failing.
    pub fallback_hosts: Vec<String>,
    /// Static credential; superseded by an `AuthProvider` when one is set.
    pub token: Option<String>,
    pub client_id: Option<String>,
    /// Wire format for the connection; fixed for its lifetime.
    pub format: WireFormat,
    pub connect_timeout: Duration,
    /// Deadline for user-facing operations (attach, publish, close, pages).
    pub request_timeout: Duration,
    pub disconnected_retry: Duration,
    pub suspended_retry: Duration,
    /// How long broker-side connection state outlives the transport; the
    /// `Connected` frame may revise this.
    pub connection_state_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    /// Publishes queued while not connected before the oldest is failed.
    pub send_queue_limit: usize,
    /// In-flight unacked publishes before the oldest is failed.
    pub ack_queue_limit: usize,
    /// Per-subscriber buffered messages before lagging subscribers miss.
    pub subscriber_queue: usize,
}

impl ClientOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fallback_hosts: Vec::new(),
            token: None,
            client_id: None,
            format: WireFormat::Json,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            disconnected_retry: Duration::from_millis(DEFAULT_DISCONNECTED_RETRY_MS),
            suspended_retry: Duration::from_millis(DEFAULT_SUSPENDED_RETRY_MS),
            connection_state_ttl: Duration::from_millis(DEFAULT_CONNECTION_STATE_TTL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_grace: Duration::from_millis(DEFAULT_HEARTBEAT_GRACE_MS),
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
            ack_queue_limit: DEFAULT_ACK_QUEUE_LIMIT,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }

    /// Defaults, then `BEACON_*` environment variables, then an optional yaml
    /// override file (explicit path or `BEACON_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(
        endpoint: impl Into<String>,
        config_path: Option<&str>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let mut options = Self::from_env(endpoint);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("BEACON_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientOptionsOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut options);
        }
        Ok(options)
    }

    pub fn from_env(endpoint: impl Into<String>) -> Self {
        let mut options = Self::new(endpoint);
        if let Ok(value) = std::env::var("BEACON_TOKEN")
            && !value.is_empty()
        {
            options.token = Some(value);
        }
        if let Ok(value) = std::env::var("BEACON_CLIENT_ID")
            && !value.is_empty()
        {
            options.client_id = Some(value);
        }
        if let Some(value) = std::env::var("BEACON_FORMAT")
            .ok()
            .and_then(|value| parse_format(&value))
        {
            options.format = value;
        }
        if let Ok(value) = std::env::var("BEACON_FALLBACK_HOSTS")
            && !value.is_empty()
        {
            options.fallback_hosts = value.split(',').map(|host| host.trim().to_owned()).collect();
        }
        if let Some(value) = read_u64_env("BEACON_CONNECT_TIMEOUT_MS") {
            options.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_REQUEST_TIMEOUT_MS") {
            options.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_DISCONNECTED_RETRY_MS") {
            options.disconnected_retry = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_SUSPENDED_RETRY_MS") {
            options.suspended_retry = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_CONNECTION_STATE_TTL_MS") {
            options.connection_state_ttl = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_HEARTBEAT_INTERVAL_MS") {
            options.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("BEACON_HEARTBEAT_GRACE_MS") {
            options.heartbeat_grace = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("BEACON_SEND_QUEUE_LIMIT") {
            options.send_queue_limit = value;
        }
        if let Some(value) = read_usize_env("BEACON_ACK_QUEUE_LIMIT") {
            options.ack_queue_limit = value;
        }
        if let Some(value) = read_usize_env("BEACON_SUBSCRIBER_QUEUE") {
            options.subscriber_queue = value;
        }
        options
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientOptionsOverride {
    endpoint: Option<String>,
    fallback_hosts: Option<Vec<String>>,
    token: Option<String>,
    client_id: Option<String>,
    format: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    disconnected_retry_ms: Option<u64>,
    suspended_retry_ms: Option<u64>,
    connection_state_ttl_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_grace_ms: Option<u64>,
    send_queue_limit: Option<usize>,
    ack_queue_limit: Option<usize>,
    subscriber_queue: Option<usize>,
}

impl ClientOptionsOverride {
    fn apply(&self, options: &mut ClientOptions) {
        if let Some(value) = &self.endpoint
            && !value.is_empty()
        {
            options.endpoint = value.clone();
        }
        if let Some(value) = &self.fallback_hosts {
            options.fallback_hosts = value.clone();
        }
        if let Some(value) = &self.token
            && !value.is_empty()
        {
            options.token = Some(value.clone());
        }
        if let Some(value) = &self.client_id
            && !value.is_empty()
        {
            options.client_id = Some(value.clone());
        }
        if let Some(value) = self.format.as_deref().and_then(parse_format) {
            options.format = value;
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            options.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            options.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.disconnected_retry_ms
            && value > 0
        {
            options.disconnected_retry = Duration::from_millis(value);
        }
        if let Some(value) = self.suspended_retry_ms
            && value > 0
        {
            options.suspended_retry = Duration::from_millis(value);
        }
        if let Some(value) = self.connection_state_ttl_ms
            && value > 0
        {
            options.connection_state_ttl = Duration::from_millis(value);
        }
        if let Some(value) = self.heartbeat_interval_ms
            && value > 0
        {
            options.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.heartbeat_grace_ms
            && value > 0
        {
            options.heartbeat_grace = Duration::from_millis(value);
        }
        if let Some(value) = self.send_queue_limit
            && value > 0
        {
            options.send_queue_limit = value;
        }
        if let Some(value) = self.ack_queue_limit
            && value > 0
        {
            options.ack_queue_limit = value;
        }
        if let Some(value) = self.subscriber_queue
            && value > 0
        {
            options.subscriber_queue = value;
        }
    }
}

fn parse_format(value: &str) -> Option<WireFormat> {
    match value {
        "json" => Some(WireFormat::Json),
        "packed" | "msgpack" => Some(WireFormat::Packed),
        _ => None,
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = ClientOptions::new("wss://realtime.example.com");
        assert_eq!(options.format, WireFormat::Json);
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.send_queue_limit, DEFAULT_SEND_QUEUE_LIMIT);
        assert!(options.fallback_hosts.is_empty());
    }

    #[test]
    fn yaml_override_applies_guarded_fields() {
        let mut options = ClientOptions::new("wss://realtime.example.com");
        let override_cfg: ClientOptionsOverride = serde_yaml::from_str(
            "format: msgpack\nheartbeat_interval_ms: 5000\nsend_queue_limit: 0\n",
        )
        .expect("yaml");
        override_cfg.apply(&mut options);
        assert_eq!(options.format, WireFormat::Packed);
        assert_eq!(options.heartbeat_interval, Duration::from_secs(5));
        // Zero values are rejected rather than disabling the queue bound.
        assert_eq!(options.send_queue_limit, DEFAULT_SEND_QUEUE_LIMIT);
    }

    #[test]
    fn format_parser_accepts_both_spellings() {
        assert_eq!(parse_format("json"), Some(WireFormat::Json));
        assert_eq!(parse_format("packed"), Some(WireFormat::Packed));
        assert_eq!(parse_format("msgpack"), Some(WireFormat::Packed));
        assert_eq!(parse_format("xml"), None);
    }
}
