//! The message-driven abstraction stack for a leader-driven uniform consensus instance: perfect
//! links, best-effort broadcast, the eventually-perfect failure detector, the eventual leader
//! detector, epoch change, epoch consensus, uniform consensus, and the application glue that
//! talks to the external hub.
//!
//! Everything here follows the single-threaded-dispatcher model of §5: one thread owns and
//! mutates all abstraction state for a given system-id; abstractions communicate only by
//! enqueueing [consensus_pb::Message] values, never by direct calls.

pub mod abstractions;
mod context;
mod dispatcher;
mod instance;
mod metrics;
pub mod net;
pub mod node;

pub use consensus_pb::Error;
pub use context::{Context, NetHandle};
pub use dispatcher::{Abstraction, Dispatcher};
pub use instance::Instance;
pub use metrics::{register_biometrics, register_monitors};
