//! Named channels: user-facing handles and the registry.
//!
//! # Purpose
//! A channel is a named stream on the broker. The user-facing [`Channel`]
//! handle carries only the channel name, shared subscription fan-out, and a
//! handle to the connection actor's inbox; the actor owns all channel
//! protocol state, so there are no reference cycles between the connection
//! and its channels.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use beacon_codec::ChannelOptions;
use beacon_wire::{Data, ErrorInfo, Message, PresenceAction, PresenceMessage};

use crate::conn::actor::{ActorEvent, Command};
use crate::error::{Error, Result};

pub(crate) mod presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }
}

/// Channel state change delivered to listeners, in transition order.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
}

/// State shared between a channel's user handles and the connection actor.
pub(crate) struct ChannelShared {
    pub name: Arc<str>,
    pub state: watch::Sender<ChannelState>,
    pub state_events: broadcast::Sender<ChannelStateChange>,
    pub messages: broadcast::Sender<Message>,
    pub presence_events: broadcast::Sender<PresenceMessage>,
    pub options: RwLock<ChannelOptions>,
}

impl ChannelShared {
    pub(crate) fn new(name: &str, options: ChannelOptions, queue: usize) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Initialized);
        let (state_events, _) = broadcast::channel(queue.max(1));
        let (messages, _) = broadcast::channel(queue.max(1));
        let (presence_events, _) = broadcast::channel(queue.max(1));
        Arc::new(Self {
            name: Arc::from(name),
            state,
            state_events,
            messages,
            presence_events,
            options: RwLock::new(options),
        })
    }

    pub(crate) fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: ChannelState, reason: Option<ErrorInfo>) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                channel = %self.name,
                from = previous.as_str(),
                to = next.as_str(),
                "channel state change"
            );
            let _ = self.state_events.send(ChannelStateChange {
                previous,
                current: next,
                reason,
            });
        }
    }

    pub(crate) fn options(&self) -> ChannelOptions {
        self.options.read().expect("options lock").clone()
    }
}

/// Handle to a named channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) commands: mpsc::Sender<ActorEvent>,
    pub(crate) request_timeout: Duration,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.current_state()
    }

    /// Replace the channel options; affects future publishes and decodes.
    pub fn set_options(&self, options: ChannelOptions) {
        *self.shared.options.write().expect("options lock") = options;
    }

    /// Attach to the channel. Resolves once the broker confirms, fails on a
    /// definitive error or the configured deadline.
    pub async fn attach(&self) -> Result<()> {
        self.request(|done| Command::Attach {
            name: self.shared.name.to_string(),
            done,
        })
        .await
    }

    pub async fn detach(&self) -> Result<()> {
        self.request(|done| Command::Detach {
            name: self.shared.name.to_string(),
            done,
        })
        .await
    }

    /// Publish a single named message.
    pub async fn publish(&self, name: impl Into<String>, data: impl Into<Data>) -> Result<()> {
        self.publish_batch(vec![Message::new(name, data)]).await
    }

    pub async fn publish_message(&self, message: Message) -> Result<()> {
        self.publish_batch(vec![message]).await
    }

    /// Publish a batch as one protocol frame, acknowledged as a unit.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        self.request(|done| Command::Publish {
            name: self.shared.name.to_string(),
            messages,
            done,
        })
        .await
    }

    /// Subscribe to messages delivered on this channel, in frame order.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.messages.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.shared.presence_events.subscribe()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.shared.state_events.subscribe()
    }

    /// Current presence members; waits for an in-progress sync to finish.
    pub async fn presence_members(&self) -> Result<Vec<PresenceMessage>> {
        self.request(|done| Command::PresenceGet {
            name: self.shared.name.to_string(),
            done,
        })
        .await
    }

    pub async fn presence_enter(&self, data: impl Into<Data>) -> Result<()> {
        self.presence_send(PresenceAction::Enter, data.into()).await
    }

    pub async fn presence_update(&self, data: impl Into<Data>) -> Result<()> {
        self.presence_send(PresenceAction::Update, data.into()).await
    }

    pub async fn presence_leave(&self) -> Result<()> {
        self.presence_send(PresenceAction::Leave, Data::None).await
    }

    async fn presence_send(&self, action: PresenceAction, data: Data) -> Result<()> {
        let message = PresenceMessage::new(action, data);
        self.request(|done| Command::PresenceSend {
            name: self.shared.name.to_string(),
            message,
            done,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(ActorEvent::Command(build(done)))
            .await
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(result)) => result,
        }
    }
}

/// The channel registry: name → channel, created on first reference.
#[derive(Clone)]
pub struct Channels {
    pub(crate) map: Arc<RwLock<HashMap<String, Arc<ChannelShared>>>>,
    pub(crate) commands: mpsc::Sender<ActorEvent>,
    pub(crate) request_timeout: Duration,
    pub(crate) subscriber_queue: usize,
}

impl Channels {
    pub fn get(&self, name: &str) -> Channel {
        self.get_with_options(name, ChannelOptions::default())
    }

    /// Fetch or create a channel; options apply on creation, or replace the
    /// existing channel's options when it already exists.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> Channel {
        let shared = {
            let map = self.map.read().expect("registry lock");
            map.get(name).cloned()
        };
        let shared = match shared {
            Some(existing) => {
                *existing.options.write().expect("options lock") = options;
                existing
            }
            None => {
                let mut map = self.map.write().expect("registry lock");
                map.entry(name.to_string())
                    .or_insert_with(|| ChannelShared::new(name, options, self.subscriber_queue))
                    .clone()
            }
        };
        Channel {
            shared,
            commands: self.commands.clone(),
            request_timeout: self.request_timeout,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.map
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Detach and drop the channel. The name can be recreated afterwards.
    pub async fn release(&self, name: &str) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(ActorEvent::Command(Command::Release {
                name: name.to_string(),
                done,
            }))
            .await
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(result)) => result,
        }
    }
}

/// Actor-side channel bookkeeping: the authoritative state machine copy,
/// pending completions, and the presence set.
pub(crate) struct ChannelCore {
    pub shared: Arc<ChannelShared>,
    pub state: ChannelState,
    /// Re-attach after reconnects until the user detaches explicitly.
    pub desired_attached: bool,
    pub released: bool,
    pub channel_serial: Option<String>,
    pub pending_attach: Vec<oneshot::Sender<Result<()>>>,
    pub pending_detach: Vec<oneshot::Sender<Result<()>>>,
    pub pending_presence_get: Vec<oneshot::Sender<Result<Vec<PresenceMessage>>>>,
    pub presence: presence::PresenceMap,
    pub release_done: Option<oneshot::Sender<Result<()>>>,
}

impl ChannelCore {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> Self {
        Self {
            shared,
            state: ChannelState::Initialized,
            desired_attached: false,
            released: false,
            channel_serial: None,
            pending_attach: Vec::new(),
            pending_detach: Vec::new(),
            pending_presence_get: Vec::new(),
            presence: presence::PresenceMap::default(),
            release_done: None,
        }
    }

    pub(crate) fn set_state(&mut self, next: ChannelState, reason: Option<ErrorInfo>) {
        self.state = next;
        self.shared.set_state(next, reason);
    }

    /// Fail every parked completion with the given error.
    pub(crate) fn fail_pending(&mut self, error: &Error) {
        for done in self.pending_attach.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
        for done in self.pending_detach.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
        for done in self.pending_presence_get.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
    }

    pub(crate) fn resolve_presence_gets(&mut self) {
        let members = self.presence.members();
        for done in self.pending_presence_get.drain(..) {
            let _ = done.send(Ok(members.clone()));
        }
    }
}
