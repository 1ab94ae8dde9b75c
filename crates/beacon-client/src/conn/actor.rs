//! Connection actor.
//!
//! # Purpose
//! Serializes everything that touches the connection (user commands,
//! transport events, timer firings) through one inbox and executes the
//! effects the pure state machine returns. The actor is the only writer of
//! the transport, the acknowledgement tracker, and channel protocol state.
//!
//! # Design notes
//! Timers and dial attempts run as spawned tasks that post back into the
//! inbox, so the loop never blocks on anything but `recv`. Transport events
//! carry the dial attempt that produced them; events from a superseded
//! transport are dropped on arrival.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use beacon_codec::{self as codec, ChannelMode, ChannelOptions};
use beacon_wire::{
    self as wire, Action, ConnectionDetails, ErrorInfo, FLAG_HAS_PRESENCE, FLAG_MODE_PRESENCE,
    FLAG_MODE_PRESENCE_SUBSCRIBE, FLAG_MODE_PUBLISH, FLAG_MODE_SUBSCRIBE, Message,
    PresenceMessage, ProtocolMessage,
};

use crate::channel::{ChannelCore, ChannelShared, ChannelState};
use crate::config::ClientOptions;
use crate::conn::ack::{AckTracker, PendingPublish};
use crate::conn::state::{ConnectionState, ConnectionStateChange};
use crate::conn::{Effect, StateInput, TimerKind, transition};
use crate::error::{self, Error, Result, code};
use crate::transport::{AuthProvider, Dialer, Transport, TransportEvent};

/// User-initiated operations posted into the actor inbox.
pub(crate) enum Command {
    Connect {
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Close {
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Attach {
        name: String,
        done: oneshot::Sender<Result<()>>,
    },
    Detach {
        name: String,
        done: oneshot::Sender<Result<()>>,
    },
    Publish {
        name: String,
        messages: Vec<Message>,
        done: oneshot::Sender<Result<()>>,
    },
    PresenceSend {
        name: String,
        message: PresenceMessage,
        done: oneshot::Sender<Result<()>>,
    },
    PresenceGet {
        name: String,
        done: oneshot::Sender<Result<Vec<PresenceMessage>>>,
    },
    Release {
        name: String,
        done: oneshot::Sender<Result<()>>,
    },
}

pub(crate) enum ActorEvent {
    Command(Command),
    Dialed {
        attempt: u64,
        result: std::result::Result<Box<dyn Transport>, ErrorInfo>,
        token: Option<String>,
    },
    Transport {
        attempt: u64,
        event: TransportEvent,
    },
    Timer {
        kind: TimerKind,
        generation: u64,
    },
}

/// Connection identity readable from user threads.
#[derive(Default)]
pub(crate) struct ConnectionInfo {
    pub id: RwLock<Option<String>>,
    pub key: RwLock<Option<String>>,
}

pub(crate) struct ActorParts {
    pub commands: mpsc::Sender<ActorEvent>,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub state_events: broadcast::Sender<ConnectionStateChange>,
    pub info: Arc<ConnectionInfo>,
    pub registry: Arc<RwLock<HashMap<String, Arc<ChannelShared>>>>,
}

pub(crate) fn spawn(
    options: ClientOptions,
    dialer: Arc<dyn Dialer>,
    auth: Option<Arc<dyn AuthProvider>>,
) -> ActorParts {
    let (commands, inbox) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Initialized);
    let (state_events, _) = broadcast::channel(64);
    let info = Arc::new(ConnectionInfo::default());
    let registry: Arc<RwLock<HashMap<String, Arc<ChannelShared>>>> =
        Arc::new(RwLock::new(HashMap::new()));

    let tracker = AckTracker::new(options.ack_queue_limit);
    let actor = ConnectionActor {
        inbox,
        inbox_tx: commands.downgrade(),
        options,
        dialer,
        auth,
        state: ConnectionState::Initialized,
        state_tx,
        state_events: state_events.clone(),
        info: Arc::clone(&info),
        transport: None,
        attempt: 0,
        opened_pending: false,
        timers: HashMap::new(),
        timer_generation: 0,
        retries: 0,
        host_cursor: 0,
        token: None,
        renew_token: false,
        connection_id: None,
        connection_key: None,
        connection_serial: None,
        connection_details: None,
        resume_attempted: false,
        last_error: None,
        next_msg_serial: 0,
        tracker,
        queued: VecDeque::new(),
        pending_connects: Vec::new(),
        pending_closes: Vec::new(),
        registry: Arc::clone(&registry),
        cores: HashMap::new(),
    };
    tokio::spawn(actor.run());

    ActorParts {
        commands,
        state_rx,
        state_events,
        info,
        registry,
    }
}

struct TimerEntry {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

struct QueuedPublish {
    frame: ProtocolMessage,
    done: oneshot::Sender<Result<()>>,
}

pub(crate) struct ConnectionActor {
    inbox: mpsc::Receiver<ActorEvent>,
    inbox_tx: mpsc::WeakSender<ActorEvent>,
    options: ClientOptions,
    dialer: Arc<dyn Dialer>,
    auth: Option<Arc<dyn AuthProvider>>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    state_events: broadcast::Sender<ConnectionStateChange>,
    info: Arc<ConnectionInfo>,
    transport: Option<Box<dyn Transport>>,
    /// Dial attempt counter; transport events from older attempts are stale.
    attempt: u64,
    /// Opened arrived before the dial task returned the transport.
    opened_pending: bool,
    timers: HashMap<TimerKind, TimerEntry>,
    timer_generation: u64,
    retries: u32,
    host_cursor: usize,
    token: Option<String>,
    renew_token: bool,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    connection_details: Option<ConnectionDetails>,
    resume_attempted: bool,
    last_error: Option<ErrorInfo>,
    next_msg_serial: i64,
    tracker: AckTracker,
    queued: VecDeque<QueuedPublish>,
    pending_connects: Vec<oneshot::Sender<Result<()>>>,
    pending_closes: Vec<oneshot::Sender<Result<()>>>,
    registry: Arc<RwLock<HashMap<String, Arc<ChannelShared>>>>,
    cores: HashMap<String, ChannelCore>,
}

impl ConnectionActor {
    async fn run(mut self) {
        while let Some(event) = self.inbox.recv().await {
            match event {
                ActorEvent::Command(command) => self.handle_command(command).await,
                ActorEvent::Dialed {
                    attempt,
                    result,
                    token,
                } => self.handle_dialed(attempt, result, token).await,
                ActorEvent::Transport { attempt, event } => {
                    self.handle_transport(attempt, event).await;
                }
                ActorEvent::Timer { kind, generation } => {
                    self.handle_timer(kind, generation).await;
                }
            }
        }
        // Every user handle is gone; tear down whatever is still running.
        self.destroy_transport();
        for (_, entry) in self.timers.drain() {
            entry.handle.abort();
        }
    }

    // ---- state machine driving -------------------------------------------

    /// Feed one input through the transition table and execute the effects.
    /// Returns false when the input is not handled in the current state.
    async fn apply_input(&mut self, input: StateInput<'_>, reason: Option<ErrorInfo>) -> bool {
        let Some(step) = transition(self.state, &input) else {
            return false;
        };
        let frame: Option<ProtocolMessage> = match &input {
            StateInput::Frame(frame) => Some((*frame).clone()),
            _ => None,
        };
        let previous = self.state;
        self.state = step.next;
        let reason = reason.or_else(|| frame.as_ref().and_then(|frame| frame.error.clone()));
        for effect in step.effects {
            self.apply_effect(effect, frame.as_ref(), reason.as_ref()).await;
        }
        if previous != self.state {
            debug!(
                from = previous.as_str(),
                to = self.state.as_str(),
                "connection state change"
            );
            self.state_tx.send_replace(self.state);
            let _ = self.state_events.send(ConnectionStateChange {
                previous,
                current: self.state,
                reason: reason.clone(),
            });
            self.after_transition(previous, reason);
        }
        true
    }

    fn after_transition(&mut self, _previous: ConnectionState, reason: Option<ErrorInfo>) {
        match self.state {
            ConnectionState::Closed => {
                for done in self.pending_closes.drain(..) {
                    let _ = done.send(Ok(()));
                }
                for done in self.pending_connects.drain(..) {
                    let _ = done.send(Err(Error::Closed));
                }
            }
            ConnectionState::Failed => {
                let info = reason.unwrap_or_else(|| {
                    ErrorInfo::new(code::CONNECT_REFUSED, 500, "connection failed")
                });
                self.last_error = Some(info.clone());
                let err = Error::from_error_info(info);
                for done in self.pending_connects.drain(..) {
                    let _ = done.send(Err(err.clone()));
                }
                metrics::counter!("beacon_client_connection_failures_total").increment(1);
            }
            _ => {}
        }
    }

    async fn apply_effect(
        &mut self,
        effect: Effect,
        frame: Option<&ProtocolMessage>,
        reason: Option<&ErrorInfo>,
    ) {
        match effect {
            Effect::Dial => self.start_dial(),
            Effect::SendConnect => self.send_connect().await,
            Effect::SendClose => {
                self.send_frame(&ProtocolMessage::new(Action::Close)).await;
            }
            Effect::SendHeartbeat => {
                self.send_frame(&ProtocolMessage::new(Action::Heartbeat)).await;
            }
            Effect::DestroyTransport => self.destroy_transport(),
            Effect::ClearConnectionKey => {
                self.connection_key = None;
                self.connection_serial = None;
                self.resume_attempted = false;
                *self.info.key.write().expect("info lock") = None;
            }
            Effect::ResetRetries => {
                self.retries = 0;
                self.host_cursor = 0;
            }
            Effect::ArmTimer(kind) => {
                if kind == TimerKind::Retry {
                    self.retries = self.retries.saturating_add(1);
                }
                self.arm_timer(kind);
            }
            Effect::CancelTimer(kind) => self.cancel_timer(kind),
            Effect::RecordConnected => self.record_connected(frame).await,
            Effect::FailPending => self.fail_pending(&Error::disconnected()),
            Effect::PauseChannels => {
                // Channels keep their state across a resumable drop; user
                // operations queue until the connection returns.
                debug!(reason = ?reason, "connection paused, channels retained");
            }
            Effect::SuspendChannels => self.suspend_channels(reason),
            Effect::FailChannels => self.fail_channels(reason),
            Effect::DetachChannels => self.detach_channels(),
            Effect::ResumeChannels => self.reattach_channels().await,
        }
    }

    // ---- dialing ----------------------------------------------------------

    fn start_dial(&mut self) {
        self.attempt += 1;
        self.opened_pending = false;
        let attempt = self.attempt;
        self.resume_attempted = self.connection_key.is_some();
        let url = self.connect_url();
        let dialer = Arc::clone(&self.dialer);
        let auth = self.auth.clone();
        let existing = self.token.clone().or_else(|| self.options.token.clone());
        let renew = std::mem::take(&mut self.renew_token);
        let Some(tx) = self.inbox_tx.upgrade() else {
            return;
        };

        // Forward transport events into the inbox, tagged with the attempt.
        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(64);
        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward
                    .send(ActorEvent::Transport { attempt, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let token = if let Some(auth) = &auth
                && (renew || existing.is_none())
            {
                match auth.token().await {
                    Ok(token) => Some(token),
                    Err(info) => {
                        let _ = tx
                            .send(ActorEvent::Dialed {
                                attempt,
                                result: Err(info),
                                token: None,
                            })
                            .await;
                        return;
                    }
                }
            } else {
                existing
            };
            let url = match &token {
                Some(token) => format!("{url}&access_token={token}"),
                None => url,
            };
            let result = dialer.dial(&url, event_tx).await;
            let _ = tx.send(ActorEvent::Dialed {
                attempt,
                result,
                token,
            })
            .await;
        });
    }

    fn connect_url(&self) -> String {
        let host = if self.host_cursor == 0 || self.options.fallback_hosts.is_empty() {
            self.options.endpoint.as_str()
        } else {
            let index = (self.host_cursor - 1) % self.options.fallback_hosts.len();
            self.options.fallback_hosts[index].as_str()
        };
        let format = match self.options.format {
            wire::WireFormat::Json => "json",
            wire::WireFormat::Packed => "msgpack",
        };
        let mut url = format!("{host}/connect?format={format}");
        if let Some(client_id) = &self.options.client_id {
            url.push_str("&client_id=");
            url.push_str(client_id);
        }
        if let Some(key) = &self.connection_key {
            url.push_str("&resume=");
            url.push_str(key);
            if let Some(serial) = self.connection_serial {
                url.push_str(&format!("&connection_serial={serial}"));
            }
        }
        url
    }

    async fn handle_dialed(
        &mut self,
        attempt: u64,
        result: std::result::Result<Box<dyn Transport>, ErrorInfo>,
        token: Option<String>,
    ) {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            if let Ok(mut transport) = result {
                transport.destroy();
            }
            return;
        }
        if let Some(token) = token {
            self.token = Some(token);
        }
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                if self.opened_pending {
                    self.opened_pending = false;
                    self.apply_input(StateInput::TransportOpened, None).await;
                }
            }
            Err(info) => {
                self.host_cursor = self.host_cursor.wrapping_add(1);
                let recoverable = !error::is_fatal(&info);
                if error::is_token_error(&info) {
                    self.renew_token = true;
                }
                warn!(error = %info, recoverable, "dial failed");
                self.apply_input(StateInput::DialFailed { recoverable }, Some(info))
                    .await;
            }
        }
    }

    async fn send_connect(&mut self) {
        let mut frame = ProtocolMessage::new(Action::Connect);
        if self.resume_attempted {
            frame.connection_key = self.connection_key.clone();
            frame.connection_serial = self.connection_serial;
        }
        self.send_frame(&frame).await;
    }

    // ---- transport events -------------------------------------------------

    async fn handle_transport(&mut self, attempt: u64, event: TransportEvent) {
        if attempt != self.attempt {
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.transport.is_some() {
                    self.apply_input(StateInput::TransportOpened, None).await;
                } else {
                    self.opened_pending = true;
                }
            }
            TransportEvent::Frame(raw) => match wire::decode_frame(&raw, self.options.format) {
                Ok(frame) => {
                    self.handle_frame(frame).await;
                }
                Err(err) => {
                    self.protocol_violation(Error::ProtocolViolation(err.to_string()))
                        .await;
                }
            },
            TransportEvent::Closed(reason) => {
                self.apply_input(StateInput::TransportClosed, reason).await;
            }
            TransportEvent::Error(info) => {
                let recoverable = !error::is_fatal(&info);
                if error::is_token_error(&info) {
                    self.renew_token = true;
                }
                self.apply_input(StateInput::TransportFailed { recoverable }, Some(info))
                    .await;
            }
        }
    }

    /// Route one decoded frame. Returns false when the state machine did not
    /// handle it (normatively: always, in `Closed`).
    pub(crate) async fn handle_frame(&mut self, frame: ProtocolMessage) -> bool {
        if let Some(info) = &frame.error
            && error::is_token_error(info)
        {
            self.renew_token = true;
        }
        // An Error frame naming a channel is scoped to that channel and never
        // feeds the connection machine.
        if frame.action == Action::Error && frame.channel.is_some() {
            if self.state == ConnectionState::Closed {
                return false;
            }
            self.on_channel_error(&frame);
            return true;
        }
        if !self.apply_input(StateInput::Frame(&frame), None).await {
            debug!(
                action = ?frame.action,
                state = self.state.as_str(),
                "frame not handled"
            );
            return false;
        }
        match frame.action {
            Action::Ack => {
                let serial = frame.msg_serial.unwrap_or(0);
                let count = frame.count.unwrap_or(1);
                if let Err(err) = self.tracker.ack(serial, count) {
                    self.protocol_violation(err).await;
                }
            }
            Action::Nack => {
                let serial = frame.msg_serial.unwrap_or(0);
                let count = frame.count.unwrap_or(1);
                let info = frame.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(code::BAD_REQUEST, 400, "publish rejected")
                });
                if let Err(err) = self.tracker.nack(serial, count, info) {
                    self.protocol_violation(err).await;
                }
            }
            Action::Attached => self.on_attached(&frame),
            Action::Detached => self.on_detached(&frame).await,
            Action::Message => self.on_message(frame),
            Action::Presence => self.on_presence(frame),
            Action::Sync => self.on_sync(frame),
            _ => {}
        }
        true
    }

    /// An unrecoverable protocol error: fail the connection outright.
    async fn protocol_violation(&mut self, err: Error) {
        let info = err.error_info();
        warn!(error = %err, "protocol violation, failing connection");
        for kind in [
            TimerKind::ConnectTimeout,
            TimerKind::Retry,
            TimerKind::StateTtl,
            TimerKind::CloseTimeout,
            TimerKind::HeartbeatIdle,
            TimerKind::HeartbeatGrace,
        ] {
            self.cancel_timer(kind);
        }
        self.destroy_transport();
        self.fail_pending(&err);
        self.fail_channels(Some(&info));
        let previous = self.state;
        self.state = ConnectionState::Failed;
        if previous != ConnectionState::Failed {
            self.state_tx.send_replace(self.state);
            let _ = self.state_events.send(ConnectionStateChange {
                previous,
                current: self.state,
                reason: Some(info.clone()),
            });
            self.after_transition(previous, Some(info));
        }
    }

    // ---- timers -----------------------------------------------------------

    fn arm_timer(&mut self, kind: TimerKind) {
        // The suspend clock measures total disconnection time; re-arming
        // would reset it.
        if kind == TimerKind::StateTtl && self.timers.contains_key(&kind) {
            return;
        }
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let delay = self.timer_duration(kind);
        let Some(tx) = self.inbox_tx.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ActorEvent::Timer { kind, generation }).await;
        });
        if let Some(old) = self.timers.insert(kind, TimerEntry { generation, handle }) {
            old.handle.abort();
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(entry) = self.timers.remove(&kind) {
            entry.handle.abort();
        }
    }

    fn timer_duration(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::ConnectTimeout => self.options.connect_timeout,
            TimerKind::Retry => match self.state {
                ConnectionState::Suspended => self.options.suspended_retry,
                _ => backoff(self.options.disconnected_retry, self.retries),
            },
            TimerKind::StateTtl => self
                .connection_details
                .as_ref()
                .and_then(|details| details.connection_state_ttl)
                .map(Duration::from_millis)
                .unwrap_or(self.options.connection_state_ttl),
            TimerKind::CloseTimeout => self.options.request_timeout,
            TimerKind::HeartbeatIdle => self.options.heartbeat_interval,
            TimerKind::HeartbeatGrace => self.options.heartbeat_grace,
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind, generation: u64) {
        match self.timers.get(&kind) {
            Some(entry) if entry.generation == generation => {
                self.timers.remove(&kind);
            }
            _ => return,
        }
        let reason = match kind {
            TimerKind::ConnectTimeout => Some(ErrorInfo::new(
                code::TIMEOUT,
                504,
                "timed out waiting for the connection handshake",
            )),
            TimerKind::HeartbeatGrace => Some(ErrorInfo::new(
                code::DISCONNECTED,
                503,
                "no heartbeat response within the idle window",
            )),
            _ => None,
        };
        self.apply_input(StateInput::Timer(kind), reason).await;
    }

    // ---- connected bookkeeping -------------------------------------------

    async fn record_connected(&mut self, frame: Option<&ProtocolMessage>) {
        let Some(frame) = frame else {
            return;
        };
        let details = frame.connection_details.clone();
        let new_id = frame.connection_id.clone();
        let resumed =
            self.resume_attempted && new_id.is_some() && new_id == self.connection_id;
        self.connection_id = new_id;
        self.connection_key = details
            .as_ref()
            .and_then(|details| details.connection_key.clone())
            .or_else(|| frame.connection_key.clone());
        self.connection_serial = frame.connection_serial;
        self.connection_details = details;
        self.resume_attempted = false;
        *self.info.id.write().expect("info lock") = self.connection_id.clone();
        *self.info.key.write().expect("info lock") = self.connection_key.clone();

        if resumed {
            debug!(
                pending = self.tracker.len(),
                "connection resumed, replaying unacked publishes"
            );
            for frame in self.tracker.frames_for_resend() {
                self.send_frame(&frame).await;
            }
        } else {
            if !self.tracker.is_empty() {
                self.tracker.fail_all(&Error::disconnected());
            }
            self.next_msg_serial = 0;
        }
        metrics::counter!("beacon_client_connected_total").increment(1);

        for done in self.pending_connects.drain(..) {
            let _ = done.send(Ok(()));
        }
        while let Some(queued) = self.queued.pop_front() {
            self.track_and_send(queued.frame, queued.done).await;
        }
    }

    /// Assign the next serial, enter the tracker, and put the frame on the
    /// wire.
    async fn track_and_send(
        &mut self,
        mut frame: ProtocolMessage,
        done: oneshot::Sender<Result<()>>,
    ) {
        let serial = self.next_msg_serial;
        self.next_msg_serial += 1;
        frame.msg_serial = Some(serial);
        self.tracker.push(PendingPublish {
            msg_serial: serial,
            count: 1,
            frame: frame.clone(),
            completion: done,
        });
        self.send_frame(&frame).await;
    }

    async fn send_frame(&mut self, frame: &ProtocolMessage) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match wire::encode_frame(frame, self.options.format) {
            Ok(raw) => {
                if let Err(info) = transport.send(raw).await {
                    warn!(error = %info, "transport send failed");
                    // Processed as an inbox event to keep effect execution
                    // non-reentrant.
                    if let Some(tx) = self.inbox_tx.upgrade() {
                        let _ = tx.try_send(ActorEvent::Transport {
                            attempt: self.attempt,
                            event: TransportEvent::Error(info),
                        });
                    }
                }
            }
            Err(err) => warn!(error = %err, "frame encode failed"),
        }
    }

    fn destroy_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.opened_pending = false;
    }

    /// Fail the tracker and the not-yet-sent queue.
    fn fail_pending(&mut self, err: &Error) {
        self.tracker.fail_all(err);
        for queued in self.queued.drain(..) {
            let _ = queued.done.send(Err(err.clone()));
        }
    }

    // ---- channel routing --------------------------------------------------

    fn core_mut(&mut self, name: &str) -> &mut ChannelCore {
        if !self.cores.contains_key(name) {
            let shared = {
                let map = self.registry.read().expect("registry lock");
                map.get(name).cloned()
            };
            let shared = shared.unwrap_or_else(|| {
                let shared = ChannelShared::new(
                    name,
                    ChannelOptions::default(),
                    self.options.subscriber_queue,
                );
                self.registry
                    .write()
                    .expect("registry lock")
                    .insert(name.to_string(), Arc::clone(&shared));
                shared
            });
            self.cores
                .insert(name.to_string(), ChannelCore::new(shared));
        }
        self.cores.get_mut(name).expect("core just inserted")
    }

    fn on_channel_error(&mut self, frame: &ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            return;
        };
        let info = frame.error.clone().unwrap_or_else(|| {
            ErrorInfo::new(code::CHANNEL_FAILED, 400, "channel error")
        });
        let core = self.core_mut(&name);
        core.set_state(ChannelState::Failed, Some(info.clone()));
        core.fail_pending(&Error::ChannelFailed(info));
        core.presence.clear();
    }

    fn on_attached(&mut self, frame: &ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            return;
        };
        let has_presence = frame.has_flag(FLAG_HAS_PRESENCE);
        let channel_serial = frame.channel_serial.clone();
        let reason = frame.error.clone();
        let core = self.core_mut(&name);
        core.channel_serial = channel_serial;
        core.desired_attached = true;
        core.set_state(ChannelState::Attached, reason);
        for done in core.pending_attach.drain(..) {
            let _ = done.send(Ok(()));
        }
        if has_presence {
            core.presence.start_sync();
        } else {
            core.presence.clear();
            core.resolve_presence_gets();
        }
    }

    async fn on_detached(&mut self, frame: &ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            return;
        };
        let connected = self.state == ConnectionState::Connected;
        let reason = frame.error.clone();
        let core = self.core_mut(&name);
        if core.released {
            core.set_state(ChannelState::Detached, reason);
            if let Some(done) = core.release_done.take() {
                let _ = done.send(Ok(()));
            }
            self.cores.remove(&name);
            self.registry
                .write()
                .expect("registry lock")
                .remove(&name);
            return;
        }
        if core.state == ChannelState::Attaching {
            // Attach rejected.
            let info = reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(code::CHANNEL_FAILED, 400, "attach rejected")
            });
            core.set_state(ChannelState::Failed, Some(info.clone()));
            let err = Error::ChannelFailed(info);
            core.fail_pending(&err);
            return;
        }
        if !core.pending_detach.is_empty() {
            core.desired_attached = false;
            core.set_state(ChannelState::Detached, reason);
            core.presence.clear();
            for done in core.pending_detach.drain(..) {
                let _ = done.send(Ok(()));
            }
            return;
        }
        // Server-initiated detach: re-attach if the user still wants in.
        core.set_state(ChannelState::Detached, reason);
        core.presence.clear();
        let reattach = core.desired_attached;
        if reattach && connected {
            self.send_attach(&name).await;
        }
    }

    fn on_message(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.as_deref() else {
            return;
        };
        let Some(core) = self.cores.get_mut(name) else {
            return;
        };
        let options = core.shared.options();
        let format = self.options.format;
        for mut message in frame.messages.unwrap_or_default() {
            if let Err(err) = codec::decode_message(&mut message, &options, format) {
                // Degraded delivery: partial decode, unconsumed labels kept.
                warn!(channel = %core.shared.name, error = %err, "message decode degraded");
                metrics::counter!("beacon_client_decode_errors_total").increment(1);
            }
            let _ = core.shared.messages.send(message);
        }
    }

    fn on_presence(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.as_deref() else {
            return;
        };
        let Some(core) = self.cores.get_mut(name) else {
            return;
        };
        let options = core.shared.options();
        let format = self.options.format;
        for mut entry in frame.presence.unwrap_or_default() {
            if let Err(err) = codec::decode_presence(&mut entry, &options, format) {
                warn!(channel = %core.shared.name, error = %err, "presence decode degraded");
            }
            core.presence.apply(&entry);
            let _ = core.shared.presence_events.send(entry);
        }
    }

    fn on_sync(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.as_deref() else {
            return;
        };
        let Some(core) = self.cores.get_mut(name) else {
            return;
        };
        if core.presence.in_sync() {
            core.presence.start_sync();
        }
        let options = core.shared.options();
        let format = self.options.format;
        for mut entry in frame.presence.unwrap_or_default() {
            if let Err(err) = codec::decode_presence(&mut entry, &options, format) {
                warn!(channel = %core.shared.name, error = %err, "presence decode degraded");
            }
            core.presence.apply(&entry);
            let _ = core.shared.presence_events.send(entry);
        }
        // The sync is finished when the serial carries no continuation
        // cursor.
        let complete = frame
            .channel_serial
            .as_deref()
            .is_none_or(|serial| serial.is_empty() || serial.ends_with(':'));
        if complete {
            core.presence.end_sync();
            core.resolve_presence_gets();
        }
    }

    // ---- channel lifecycle driven by connection state ---------------------

    async fn send_attach(&mut self, name: &str) {
        let core = self.core_mut(name);
        let options = core.shared.options();
        // A prior serial lets the broker resume the channel's backlog.
        let channel_serial = core.channel_serial.clone();
        core.set_state(ChannelState::Attaching, None);
        let mut frame = ProtocolMessage::with_channel(Action::Attach, name);
        frame.channel_serial = channel_serial;
        frame.flags = mode_flags(&options.modes);
        self.send_frame(&frame).await;
    }

    async fn reattach_channels(&mut self) {
        let names: Vec<String> = self
            .cores
            .iter()
            .filter(|(_, core)| core.desired_attached && !core.released)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.send_attach(&name).await;
        }
    }

    fn suspend_channels(&mut self, reason: Option<&ErrorInfo>) {
        let info = reason.cloned().unwrap_or_else(|| {
            ErrorInfo::new(code::SUSPENDED, 503, "connection suspended")
        });
        for core in self.cores.values_mut() {
            if matches!(
                core.state,
                ChannelState::Attaching | ChannelState::Attached
            ) {
                core.set_state(ChannelState::Suspended, Some(info.clone()));
            }
            core.fail_pending(&Error::ChannelSuspended);
        }
    }

    fn fail_channels(&mut self, reason: Option<&ErrorInfo>) {
        let info = reason.cloned().unwrap_or_else(|| {
            ErrorInfo::new(code::CHANNEL_FAILED, 500, "connection failed")
        });
        for core in self.cores.values_mut() {
            if !matches!(core.state, ChannelState::Detached | ChannelState::Failed) {
                core.set_state(ChannelState::Failed, Some(info.clone()));
            }
            core.fail_pending(&Error::ChannelFailed(info.clone()));
            core.presence.clear();
        }
    }

    fn detach_channels(&mut self) {
        for core in self.cores.values_mut() {
            if !matches!(core.state, ChannelState::Detached | ChannelState::Failed) {
                core.set_state(ChannelState::Detached, None);
            }
            core.fail_pending(&Error::Closed);
            core.presence.clear();
            if let Some(done) = core.release_done.take() {
                let _ = done.send(Ok(()));
            }
        }
    }

    // ---- commands ---------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done } => {
                if self.state == ConnectionState::Connected {
                    if let Some(done) = done {
                        let _ = done.send(Ok(()));
                    }
                    return;
                }
                let handled = self.apply_input(StateInput::Connect, None).await;
                if let Some(done) = done {
                    if handled && self.state != ConnectionState::Failed {
                        self.pending_connects.push(done);
                    } else {
                        let _ = done.send(Err(Error::Closed));
                    }
                }
            }
            Command::Close { done } => {
                if self.state == ConnectionState::Closed {
                    if let Some(done) = done {
                        let _ = done.send(Ok(()));
                    }
                    return;
                }
                let transport_active = self.transport.is_some();
                self.apply_input(StateInput::Close { transport_active }, None)
                    .await;
                if let Some(done) = done {
                    if self.state == ConnectionState::Closed {
                        let _ = done.send(Ok(()));
                    } else {
                        self.pending_closes.push(done);
                    }
                }
            }
            Command::Attach { name, done } => self.handle_attach(name, done).await,
            Command::Detach { name, done } => self.handle_detach(name, done).await,
            Command::Publish {
                name,
                messages,
                done,
            } => self.handle_publish(name, messages, done).await,
            Command::PresenceSend {
                name,
                message,
                done,
            } => self.handle_presence_send(name, message, done).await,
            Command::PresenceGet { name, done } => {
                self.handle_presence_get(name, done).await;
            }
            Command::Release { name, done } => self.handle_release(name, done).await,
        }
    }

    async fn handle_attach(&mut self, name: String, done: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing => {
                let _ = done.send(Err(Error::Closed));
                return;
            }
            ConnectionState::Suspended => {
                let _ = done.send(Err(Error::ChannelSuspended));
                return;
            }
            ConnectionState::Failed => {
                let info = self.last_error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(code::CONNECT_REFUSED, 500, "connection failed")
                });
                let _ = done.send(Err(Error::ConnectRefused(info)));
                return;
            }
            _ => {}
        }
        let connected = self.state == ConnectionState::Connected;
        let core = self.core_mut(&name);
        core.desired_attached = true;
        match core.state {
            ChannelState::Attached if connected => {
                let _ = done.send(Ok(()));
            }
            ChannelState::Attaching => {
                core.pending_attach.push(done);
            }
            _ => {
                core.pending_attach.push(done);
                if connected {
                    self.send_attach(&name).await;
                } else if self.state == ConnectionState::Initialized {
                    // Attaching from cold implies connecting first.
                    self.apply_input(StateInput::Connect, None).await;
                }
            }
        }
    }

    async fn handle_detach(&mut self, name: String, done: oneshot::Sender<Result<()>>) {
        let connected = self.state == ConnectionState::Connected;
        let core = self.core_mut(&name);
        core.desired_attached = false;
        match core.state {
            ChannelState::Detached | ChannelState::Initialized | ChannelState::Failed => {
                let _ = done.send(Ok(()));
            }
            _ if connected => {
                core.pending_detach.push(done);
                core.set_state(ChannelState::Detaching, None);
                let frame = ProtocolMessage::with_channel(Action::Detach, name.as_str());
                self.send_frame(&frame).await;
            }
            _ => {
                // Nothing to negotiate without a connection.
                core.set_state(ChannelState::Detached, None);
                core.presence.clear();
                let _ = done.send(Ok(()));
            }
        }
    }

    async fn handle_publish(
        &mut self,
        name: String,
        mut messages: Vec<Message>,
        done: oneshot::Sender<Result<()>>,
    ) {
        let format = self.options.format;
        let client_id = self.options.client_id.clone();
        let core = self.core_mut(&name);
        if core.state == ChannelState::Failed {
            let _ = done.send(Err(Error::ChannelFailed(ErrorInfo::new(
                code::CHANNEL_FAILED,
                400,
                "channel is failed",
            ))));
            return;
        }
        let options = core.shared.options();
        if !options.modes.is_empty() && !options.modes.contains(&ChannelMode::Publish) {
            let _ = done.send(Err(Error::ChannelFailed(ErrorInfo::new(
                code::BAD_REQUEST,
                400,
                "channel modes do not permit publishing",
            ))));
            return;
        }
        for message in &mut messages {
            if message.client_id.is_none() {
                message.client_id = client_id.clone();
            }
            if let Err(err) = codec::encode_message(message, &options, format) {
                // An encode failure rejects this publish and nothing else.
                let _ = done.send(Err(err.into()));
                return;
            }
        }
        let mut frame = ProtocolMessage::with_channel(Action::Message, name.as_str());
        frame.messages = Some(messages);
        self.dispatch_publish(frame, done).await;
    }

    async fn handle_presence_send(
        &mut self,
        name: String,
        mut message: PresenceMessage,
        done: oneshot::Sender<Result<()>>,
    ) {
        let format = self.options.format;
        if message.client_id.is_none() {
            message.client_id = self.options.client_id.clone();
        }
        if message.client_id.is_none() {
            let _ = done.send(Err(Error::ChannelFailed(ErrorInfo::new(
                code::BAD_REQUEST,
                400,
                "presence requires a client id",
            ))));
            return;
        }
        let core = self.core_mut(&name);
        let options = core.shared.options();
        if !options.modes.is_empty() && !options.modes.contains(&ChannelMode::Presence) {
            let _ = done.send(Err(Error::ChannelFailed(ErrorInfo::new(
                code::BAD_REQUEST,
                400,
                "channel modes do not permit presence",
            ))));
            return;
        }
        if let Err(err) = codec::encode_presence(&mut message, &options, format) {
            let _ = done.send(Err(err.into()));
            return;
        }
        let mut frame = ProtocolMessage::with_channel(Action::Presence, name.as_str());
        frame.presence = Some(vec![message]);
        self.dispatch_publish(frame, done).await;
    }

    /// Send now when connected, queue when the connection is on its way,
    /// fail outright otherwise.
    async fn dispatch_publish(
        &mut self,
        frame: ProtocolMessage,
        done: oneshot::Sender<Result<()>>,
    ) {
        match self.state {
            ConnectionState::Connected => self.track_and_send(frame, done).await,
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {
                if self.queued.len() >= self.options.send_queue_limit
                    && let Some(oldest) = self.queued.pop_front()
                {
                    metrics::counter!("beacon_client_send_queue_overflow_total").increment(1);
                    let _ = oldest.done.send(Err(Error::QueueOverflow));
                }
                self.queued.push_back(QueuedPublish { frame, done });
                metrics::gauge!("beacon_client_send_queue_len").set(self.queued.len() as f64);
            }
            ConnectionState::Suspended => {
                let _ = done.send(Err(Error::ChannelSuspended));
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                let _ = done.send(Err(Error::Closed));
            }
            ConnectionState::Failed => {
                let info = self.last_error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(code::CONNECT_REFUSED, 500, "connection failed")
                });
                let _ = done.send(Err(Error::ConnectRefused(info)));
            }
        }
    }

    async fn handle_presence_get(
        &mut self,
        name: String,
        done: oneshot::Sender<Result<Vec<PresenceMessage>>>,
    ) {
        let connected = self.state == ConnectionState::Connected;
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing => {
                let _ = done.send(Err(Error::Closed));
                return;
            }
            ConnectionState::Suspended => {
                let _ = done.send(Err(Error::ChannelSuspended));
                return;
            }
            ConnectionState::Failed => {
                let _ = done.send(Err(Error::disconnected()));
                return;
            }
            _ => {}
        }
        let core = self.core_mut(&name);
        if core.state == ChannelState::Attached && core.presence.in_sync() {
            let _ = done.send(Ok(core.presence.members()));
            return;
        }
        core.pending_presence_get.push(done);
        core.desired_attached = true;
        if connected && core.state != ChannelState::Attaching {
            self.send_attach(&name).await;
        } else if self.state == ConnectionState::Initialized {
            self.apply_input(StateInput::Connect, None).await;
        }
    }

    async fn handle_release(&mut self, name: String, done: oneshot::Sender<Result<()>>) {
        let connected = self.state == ConnectionState::Connected;
        let Some(core) = self.cores.get_mut(&name) else {
            self.registry
                .write()
                .expect("registry lock")
                .remove(&name);
            let _ = done.send(Ok(()));
            return;
        };
        core.released = true;
        core.desired_attached = false;
        if connected
            && matches!(
                core.state,
                ChannelState::Attached | ChannelState::Attaching
            )
        {
            core.release_done = Some(done);
            core.set_state(ChannelState::Detaching, None);
            let frame = ProtocolMessage::with_channel(Action::Detach, name.as_str());
            self.send_frame(&frame).await;
        } else {
            core.set_state(ChannelState::Detached, None);
            self.cores.remove(&name);
            self.registry
                .write()
                .expect("registry lock")
                .remove(&name);
            let _ = done.send(Ok(()));
        }
    }
}

fn mode_flags(modes: &[ChannelMode]) -> u32 {
    let mut flags = 0;
    for mode in modes {
        flags |= match mode {
            ChannelMode::Presence => FLAG_MODE_PRESENCE,
            ChannelMode::Publish => FLAG_MODE_PUBLISH,
            ChannelMode::Subscribe => FLAG_MODE_SUBSCRIBE,
            ChannelMode::PresenceSubscribe => FLAG_MODE_PRESENCE_SUBSCRIBE,
        };
    }
    flags
}

/// Exponential backoff with jitter, capped at sixteen times the base.
fn backoff(base: Duration, retries: u32) -> Duration {
    let shift = retries.saturating_sub(1).min(4);
    let scaled = base.saturating_mul(1 << shift);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(scaled.as_secs_f64() * jitter)
}
