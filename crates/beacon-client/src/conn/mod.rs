// Connection plumbing: the pure state machine, the actor that executes its
// effects, and the acknowledgement tracker the actor drives.
pub(crate) mod ack;
pub(crate) mod actor;
mod state;

pub use state::{ConnectionState, ConnectionStateChange};
pub(crate) use state::{Effect, StateInput, TimerKind, transition};
