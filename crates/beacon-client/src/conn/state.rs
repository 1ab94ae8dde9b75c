//! Connection state machine.
//!
//! # Purpose
//! The pure transition function `(state, input) -> (state, effects)` behind
//! the connection actor. Transitions carry an ordered effect list (dial,
//! send frame, arm timer, destroy transport, ...) that the actor executes;
//! keeping the function free of I/O makes the table directly testable.
//!
//! # Design notes
//! A `None` return means the input is not handled in the current state: the
//! actor drops it. This is normative for `Closed`, where every inbound frame
//! is ignored.
use beacon_wire::{Action, ErrorInfo, ProtocolMessage};

use crate::error::is_fatal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Connection state change delivered to listeners, in transition order.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    ConnectTimeout,
    Retry,
    StateTtl,
    CloseTimeout,
    HeartbeatIdle,
    HeartbeatGrace,
}

#[derive(Debug)]
pub(crate) enum StateInput<'a> {
    /// User called `connect()`.
    Connect,
    /// User called `close()`.
    Close { transport_active: bool },
    /// The dial task failed before producing a transport.
    DialFailed { recoverable: bool },
    /// The transport finished its handshake.
    TransportOpened,
    /// The transport closed without a prior error.
    TransportClosed,
    /// The transport reported an error.
    TransportFailed { recoverable: bool },
    /// A decoded protocol frame arrived.
    Frame(&'a ProtocolMessage),
    /// An armed timer fired.
    Timer(TimerKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Start a transport dial (resume decided by the stored connection key).
    Dial,
    /// Send the Connect frame over the freshly opened transport.
    SendConnect,
    SendClose,
    SendHeartbeat,
    DestroyTransport,
    ClearConnectionKey,
    ResetRetries,
    ArmTimer(TimerKind),
    CancelTimer(TimerKind),
    /// Capture ids/serials/details from the Connected frame, resolve or fail
    /// the tracker per resume outcome, and drain queued sends.
    RecordConnected,
    /// Fail the tracker and queued sends with `Disconnected`.
    FailPending,
    /// Connection lost but resumable: channels keep state, operations queue.
    PauseChannels,
    /// Connection state expired: channels drop to their suspended sub-state.
    SuspendChannels,
    /// Fatal connection error: channels fail with the frame's reason.
    FailChannels,
    /// Orderly shutdown: channels detach.
    DetachChannels,
    /// Connected (again): re-attach channels that want to be attached.
    ResumeChannels,
}

#[derive(Debug)]
pub(crate) struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

fn to(next: ConnectionState, effects: Vec<Effect>) -> Option<Transition> {
    Some(Transition { next, effects })
}

fn stay(state: ConnectionState) -> Option<Transition> {
    to(state, Vec::new())
}

use Effect::*;
use TimerKind::*;

/// The transition table. Entry/exit obligations are folded into each edge,
/// so an edge's effect list is complete on its own.
pub(crate) fn transition(state: ConnectionState, input: &StateInput) -> Option<Transition> {
    use ConnectionState::*;
    match (state, input) {
        // Closed ignores every inbound frame; connect() is the only way out.
        (Closed, StateInput::Connect) => {
            to(Connecting, vec![Dial, ArmTimer(ConnectTimeout)])
        }
        (Closed, StateInput::Close { .. }) => stay(Closed),
        (Closed, _) => None,

        (Initialized, StateInput::Connect) => {
            to(Connecting, vec![Dial, ArmTimer(ConnectTimeout)])
        }
        (Initialized, StateInput::Close { .. }) => to(
            Closed,
            vec![ClearConnectionKey, FailPending, DetachChannels],
        ),
        // A Close frame before any transport exists is treated as a no-op.
        (Initialized, StateInput::Frame(frame)) if frame.action == Action::Close => {
            stay(Initialized)
        }
        (Initialized, _) => None,

        (Connecting, StateInput::TransportOpened) => {
            to(Connecting, vec![SendConnect])
        }
        (Connecting, StateInput::Frame(frame)) => match frame.action {
            Action::Connected => to(
                Connected,
                vec![
                    CancelTimer(ConnectTimeout),
                    CancelTimer(StateTtl),
                    ResetRetries,
                    RecordConnected,
                    ArmTimer(HeartbeatIdle),
                    ResumeChannels,
                ],
            ),
            Action::Error => {
                if frame.error.as_ref().is_some_and(is_fatal) {
                    to(
                        Failed,
                        vec![
                            CancelTimer(ConnectTimeout),
                            CancelTimer(StateTtl),
                            DestroyTransport,
                            FailPending,
                            FailChannels,
                        ],
                    )
                } else {
                    to(
                        Disconnected,
                        vec![
                            CancelTimer(ConnectTimeout),
                            DestroyTransport,
                            ArmTimer(Retry),
                            ArmTimer(StateTtl),
                            PauseChannels,
                        ],
                    )
                }
            }
            Action::Disconnected => to(
                Disconnected,
                vec![
                    CancelTimer(ConnectTimeout),
                    DestroyTransport,
                    ArmTimer(Retry),
                    ArmTimer(StateTtl),
                    PauseChannels,
                ],
            ),
            _ => None,
        },
        (Connecting, StateInput::DialFailed { recoverable })
        | (Connecting, StateInput::TransportFailed { recoverable }) => {
            if *recoverable {
                to(
                    Disconnected,
                    vec![
                        CancelTimer(ConnectTimeout),
                        DestroyTransport,
                        ArmTimer(Retry),
                        ArmTimer(StateTtl),
                        PauseChannels,
                    ],
                )
            } else {
                to(
                    Failed,
                    vec![
                        CancelTimer(ConnectTimeout),
                        CancelTimer(StateTtl),
                        DestroyTransport,
                        FailPending,
                        FailChannels,
                    ],
                )
            }
        }
        (Connecting, StateInput::TransportClosed) => to(
            Disconnected,
            vec![
                CancelTimer(ConnectTimeout),
                DestroyTransport,
                ArmTimer(Retry),
                ArmTimer(StateTtl),
                PauseChannels,
            ],
        ),
        (Connecting, StateInput::Timer(ConnectTimeout)) => to(
            Failed,
            vec![
                CancelTimer(StateTtl),
                DestroyTransport,
                FailPending,
                FailChannels,
            ],
        ),
        // The suspend clock may expire mid-attempt; the attempt continues as
        // a fresh connection.
        (Connecting, StateInput::Timer(StateTtl)) => {
            to(Connecting, vec![ClearConnectionKey])
        }
        (Connecting, StateInput::Close { transport_active }) => {
            close_transition(*transport_active, vec![CancelTimer(ConnectTimeout)])
        }
        (Connecting, StateInput::Connect) => stay(Connecting),
        (Connecting, _) => None,

        (Connected, StateInput::Frame(frame)) => match frame.action {
            Action::Disconnected | Action::Disconnect => to(
                Disconnected,
                vec![
                    CancelTimer(HeartbeatIdle),
                    CancelTimer(HeartbeatGrace),
                    DestroyTransport,
                    ArmTimer(Retry),
                    ArmTimer(StateTtl),
                    PauseChannels,
                ],
            ),
            Action::Error => {
                if frame.error.as_ref().is_some_and(is_fatal) {
                    to(
                        Failed,
                        vec![
                            CancelTimer(HeartbeatIdle),
                            CancelTimer(HeartbeatGrace),
                            DestroyTransport,
                            FailPending,
                            FailChannels,
                        ],
                    )
                } else {
                    to(
                        Disconnected,
                        vec![
                            CancelTimer(HeartbeatIdle),
                            CancelTimer(HeartbeatGrace),
                            DestroyTransport,
                            ArmTimer(Retry),
                            ArmTimer(StateTtl),
                            PauseChannels,
                        ],
                    )
                }
            }
            // Any other frame is connection activity: reset the idle window.
            _ => to(
                Connected,
                vec![CancelTimer(HeartbeatGrace), ArmTimer(HeartbeatIdle)],
            ),
        },
        (Connected, StateInput::Close { transport_active }) => close_transition(
            *transport_active,
            vec![CancelTimer(HeartbeatIdle), CancelTimer(HeartbeatGrace)],
        ),
        (Connected, StateInput::TransportClosed)
        | (Connected, StateInput::TransportFailed { .. }) => to(
            Disconnected,
            vec![
                CancelTimer(HeartbeatIdle),
                CancelTimer(HeartbeatGrace),
                DestroyTransport,
                ArmTimer(Retry),
                ArmTimer(StateTtl),
                PauseChannels,
            ],
        ),
        (Connected, StateInput::Timer(HeartbeatIdle)) => to(
            Connected,
            vec![SendHeartbeat, ArmTimer(HeartbeatGrace)],
        ),
        (Connected, StateInput::Timer(HeartbeatGrace)) => to(
            Disconnected,
            vec![
                CancelTimer(HeartbeatIdle),
                DestroyTransport,
                ArmTimer(Retry),
                ArmTimer(StateTtl),
                PauseChannels,
            ],
        ),
        (Connected, StateInput::Connect) => stay(Connected),
        (Connected, _) => None,

        (Disconnected, StateInput::Timer(Retry)) => to(
            Connecting,
            vec![Dial, ArmTimer(ConnectTimeout)],
        ),
        (Disconnected, StateInput::Timer(StateTtl)) => to(
            Suspended,
            vec![
                CancelTimer(Retry),
                ClearConnectionKey,
                SuspendChannels,
                ArmTimer(Retry),
            ],
        ),
        (Disconnected, StateInput::Connect) => to(
            Connecting,
            vec![CancelTimer(Retry), Dial, ArmTimer(ConnectTimeout)],
        ),
        (Disconnected, StateInput::Close { .. }) => to(
            Closed,
            vec![
                CancelTimer(Retry),
                CancelTimer(StateTtl),
                DestroyTransport,
                ClearConnectionKey,
                FailPending,
                DetachChannels,
            ],
        ),
        (Disconnected, _) => None,

        (Suspended, StateInput::Timer(Retry)) => to(
            Connecting,
            vec![Dial, ArmTimer(ConnectTimeout)],
        ),
        (Suspended, StateInput::Connect) => to(
            Connecting,
            vec![CancelTimer(Retry), Dial, ArmTimer(ConnectTimeout)],
        ),
        (Suspended, StateInput::Close { .. }) => to(
            Closed,
            vec![
                CancelTimer(Retry),
                ClearConnectionKey,
                FailPending,
                DetachChannels,
            ],
        ),
        (Suspended, _) => None,

        (Closing, StateInput::Frame(frame)) => match frame.action {
            Action::Closed => to(
                Closed,
                vec![
                    CancelTimer(CloseTimeout),
                    DestroyTransport,
                    ClearConnectionKey,
                    FailPending,
                    DetachChannels,
                ],
            ),
            // Late frames during an orderly shutdown are irrelevant.
            _ => stay(Closing),
        },
        (Closing, StateInput::Timer(CloseTimeout))
        | (Closing, StateInput::TransportClosed)
        | (Closing, StateInput::TransportFailed { .. }) => to(
            Closed,
            vec![
                CancelTimer(CloseTimeout),
                DestroyTransport,
                ClearConnectionKey,
                FailPending,
                DetachChannels,
            ],
        ),
        (Closing, StateInput::Close { .. }) => stay(Closing),
        (Closing, _) => None,

        (Failed, StateInput::Connect) => {
            to(Connecting, vec![Dial, ArmTimer(ConnectTimeout)])
        }
        (Failed, StateInput::Close { .. }) => {
            to(Closed, vec![ClearConnectionKey])
        }
        (Failed, _) => None,
    }
}

fn close_transition(transport_active: bool, mut effects: Vec<Effect>) -> Option<Transition> {
    if transport_active {
        effects.extend([SendClose, ArmTimer(CloseTimeout)]);
        to(ConnectionState::Closing, effects)
    } else {
        effects.extend([ClearConnectionKey, FailPending, DetachChannels]);
        to(ConnectionState::Closed, effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use ConnectionState::*;

    fn frame(action: Action) -> ProtocolMessage {
        ProtocolMessage::new(action)
    }

    fn error_frame(error_code: i32) -> ProtocolMessage {
        let mut frame = ProtocolMessage::new(Action::Error);
        frame.error = Some(ErrorInfo::new(error_code, 400, "boom"));
        frame
    }

    #[test]
    fn connect_dials_and_arms_timeout() {
        let transition = transition(Initialized, &StateInput::Connect).expect("handled");
        assert_eq!(transition.next, Connecting);
        assert_eq!(
            transition.effects,
            vec![Dial, ArmTimer(ConnectTimeout)]
        );
    }

    #[test]
    fn connected_frame_completes_the_handshake() {
        let connected = frame(Action::Connected);
        let result =
            transition(Connecting, &StateInput::Frame(&connected)).expect("handled");
        assert_eq!(result.next, Connected);
        assert!(result.effects.contains(&RecordConnected));
        assert!(result.effects.contains(&ResetRetries));
        assert!(result.effects.contains(&ArmTimer(HeartbeatIdle)));
    }

    #[test]
    fn fatal_error_while_connecting_fails_the_connection() {
        let fatal = error_frame(40_005);
        let result = transition(Connecting, &StateInput::Frame(&fatal)).expect("handled");
        assert_eq!(result.next, Failed);
        assert!(result.effects.contains(&DestroyTransport));
        assert!(result.effects.contains(&FailChannels));
    }

    #[test]
    fn token_expiry_while_connecting_is_recoverable() {
        let expired = error_frame(code::TOKEN_EXPIRED);
        let result = transition(Connecting, &StateInput::Frame(&expired)).expect("handled");
        assert_eq!(result.next, Disconnected);
        assert!(result.effects.contains(&ArmTimer(Retry)));
    }

    #[test]
    fn recoverable_dial_failure_backs_off() {
        let result = transition(
            Connecting,
            &StateInput::DialFailed { recoverable: true },
        )
        .expect("handled");
        assert_eq!(result.next, Disconnected);
        assert!(result.effects.contains(&ArmTimer(Retry)));
        assert!(result.effects.contains(&PauseChannels));
    }

    #[test]
    fn connect_timeout_is_terminal() {
        let result =
            transition(Connecting, &StateInput::Timer(ConnectTimeout)).expect("handled");
        assert_eq!(result.next, Failed);
    }

    #[test]
    fn server_disconnect_enters_retry_loop() {
        let disconnect = frame(Action::Disconnect);
        let result = transition(Connected, &StateInput::Frame(&disconnect)).expect("handled");
        assert_eq!(result.next, Disconnected);
        assert!(result.effects.contains(&DestroyTransport));
        assert!(result.effects.contains(&ArmTimer(StateTtl)));
    }

    #[test]
    fn inbound_activity_resets_the_idle_window() {
        let message = frame(Action::Message);
        let result = transition(Connected, &StateInput::Frame(&message)).expect("handled");
        assert_eq!(result.next, Connected);
        assert_eq!(
            result.effects,
            vec![CancelTimer(HeartbeatGrace), ArmTimer(HeartbeatIdle)]
        );
    }

    #[test]
    fn idle_expiry_sends_heartbeat_then_grace_expiry_disconnects() {
        let idle = transition(Connected, &StateInput::Timer(HeartbeatIdle)).expect("handled");
        assert_eq!(idle.next, Connected);
        assert_eq!(idle.effects, vec![SendHeartbeat, ArmTimer(HeartbeatGrace)]);

        let grace =
            transition(Connected, &StateInput::Timer(HeartbeatGrace)).expect("handled");
        assert_eq!(grace.next, Disconnected);
        assert!(grace.effects.contains(&DestroyTransport));
    }

    #[test]
    fn retry_timer_reconnects_and_ttl_suspends() {
        let retry = transition(Disconnected, &StateInput::Timer(Retry)).expect("handled");
        assert_eq!(retry.next, Connecting);
        assert!(retry.effects.contains(&Dial));

        let ttl = transition(Disconnected, &StateInput::Timer(StateTtl)).expect("handled");
        assert_eq!(ttl.next, Suspended);
        assert!(ttl.effects.contains(&SuspendChannels));
        assert!(ttl.effects.contains(&ClearConnectionKey));
        assert!(ttl.effects.contains(&ArmTimer(Retry)));
    }

    #[test]
    fn close_with_transport_negotiates_then_closes() {
        let closing = transition(
            Connected,
            &StateInput::Close {
                transport_active: true,
            },
        )
        .expect("handled");
        assert_eq!(closing.next, Closing);
        assert!(closing.effects.contains(&SendClose));
        assert!(closing.effects.contains(&ArmTimer(CloseTimeout)));

        let closed_frame = frame(Action::Closed);
        let closed =
            transition(Closing, &StateInput::Frame(&closed_frame)).expect("handled");
        assert_eq!(closed.next, Closed);
        assert!(closed.effects.contains(&DestroyTransport));
        assert!(closed.effects.contains(&ClearConnectionKey));
    }

    #[test]
    fn close_without_transport_goes_straight_to_closed() {
        let result = transition(
            Connecting,
            &StateInput::Close {
                transport_active: false,
            },
        )
        .expect("handled");
        assert_eq!(result.next, Closed);
        assert!(result.effects.contains(&ClearConnectionKey));
    }

    #[test]
    fn close_timeout_forces_closed() {
        let result = transition(Closing, &StateInput::Timer(CloseTimeout)).expect("handled");
        assert_eq!(result.next, Closed);
    }

    #[test]
    fn closed_ignores_every_protocol_action() {
        for action in Action::ALL {
            let incoming = frame(action);
            assert!(
                transition(Closed, &StateInput::Frame(&incoming)).is_none(),
                "{action:?} must not be handled in Closed"
            );
        }
    }

    #[test]
    fn closed_connect_reopens_and_close_is_a_noop() {
        let reopened = transition(Closed, &StateInput::Connect).expect("handled");
        assert_eq!(reopened.next, Connecting);

        let noop = transition(
            Closed,
            &StateInput::Close {
                transport_active: false,
            },
        )
        .expect("handled");
        assert_eq!(noop.next, Closed);
        assert!(noop.effects.is_empty());
    }

    #[test]
    fn close_frame_in_initialized_is_a_noop() {
        let close = frame(Action::Close);
        let result = transition(Initialized, &StateInput::Frame(&close)).expect("handled");
        assert_eq!(result.next, Initialized);
        assert!(result.effects.is_empty());
    }

    #[test]
    fn suspended_retries_fresh_connections() {
        let result = transition(Suspended, &StateInput::Timer(Retry)).expect("handled");
        assert_eq!(result.next, Connecting);
        assert!(result.effects.contains(&Dial));
    }

    #[test]
    fn failed_can_reconnect() {
        let result = transition(Failed, &StateInput::Connect).expect("handled");
        assert_eq!(result.next, Connecting);
    }
}
