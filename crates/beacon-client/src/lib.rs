//! Realtime pub/sub client.
//!
//! # Purpose
//! Connects to a broker over a pluggable bidirectional transport, attaches
//! to named channels, publishes with acknowledgement tracking, receives
//! messages and presence, and issues stateless history/stats queries over
//! the request facade.
//!
//! # Design notes
//! All connection and channel protocol state lives in a single actor task
//! fed by one inbox; user handles are cheap clones that post commands and
//! await oneshot completions. Transports, HTTP, and token minting are
//! consumed through the narrow traits in [`transport`].
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use beacon_codec::{
    AesCbcCipher, ChannelMode, ChannelOptions, Cipher, CipherParams, Error as CodecError,
};
pub use beacon_wire::{
    Action, ConnectionDetails, Data, ErrorInfo, Message, PresenceAction, PresenceMessage,
    ProtocolMessage, RawFrame, WireFormat,
};

pub use crate::channel::{Channel, ChannelState, ChannelStateChange, Channels};
pub use crate::config::ClientOptions;
pub use crate::conn::{ConnectionState, ConnectionStateChange};
pub use crate::error::{Error, Result, code};
pub use crate::rest::{Direction, HistoryQuery, PageRequest, PaginatedResult, Rest};
pub use crate::transport::{
    AuthProvider, Dialer, HttpClient, HttpMethod, HttpRequest, HttpResponse, Transport,
    TransportEvent,
};

mod channel;
mod config;
mod conn;
mod error;
mod rest;
mod transport;

#[cfg(test)]
mod testing;

use crate::conn::actor::{ActorEvent, Command, ConnectionInfo};

/// Handle to one realtime connection.
///
/// Cloning is cheap; all clones share the same connection actor. The
/// connection outlives the handles only until the last clone (and channel)
/// is dropped.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<ActorEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    state_events: broadcast::Sender<ConnectionStateChange>,
    info: Arc<ConnectionInfo>,
    channels: Channels,
    request_timeout: Duration,
}

impl Client {
    pub fn new(options: ClientOptions, dialer: Arc<dyn Dialer>) -> Self {
        Self::build(options, dialer, None)
    }

    /// A client that mints and renews tokens through the given provider.
    pub fn with_auth(
        options: ClientOptions,
        dialer: Arc<dyn Dialer>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self::build(options, dialer, Some(auth))
    }

    fn build(
        options: ClientOptions,
        dialer: Arc<dyn Dialer>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        let request_timeout = options.request_timeout;
        let subscriber_queue = options.subscriber_queue;
        let parts = conn::actor::spawn(options, dialer, auth);
        let channels = Channels {
            map: parts.registry,
            commands: parts.commands.clone(),
            request_timeout,
            subscriber_queue,
        };
        Self {
            commands: parts.commands,
            state_rx: parts.state_rx,
            state_events: parts.state_events,
            info: parts.info,
            channels,
            request_timeout,
        }
    }

    /// Start connecting; resolves once the connection reaches `Connected`,
    /// or fails with the definitive error. The connect timeout inside the
    /// state machine bounds the wait.
    pub async fn connect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(ActorEvent::Command(Command::Connect { done: Some(done) }))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Close the connection; resolves when `Closed` is reached. All
    /// outstanding operation handles fail with `Disconnected`.
    pub async fn close(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(ActorEvent::Command(Command::Close { done: Some(done) }))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches the given state.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Connection state changes in transition order.
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_events.subscribe()
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Shorthand for `channels().get(name)`.
    pub fn channel(&self, name: &str) -> Channel {
        self.channels.get(name)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.info.id.read().expect("info lock").clone()
    }

    /// The opaque resume key of the current connection, if any.
    pub fn connection_key(&self) -> Option<String> {
        self.info.key.read().expect("info lock").clone()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
