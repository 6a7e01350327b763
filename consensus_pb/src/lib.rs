//! consensus_pb provides the wire messages for the leader-driven uniform consensus stack:
//! perfect links, best-effort broadcast, the eventually-perfect failure detector, the eventual
//! leader detector, epoch change, epoch consensus, and uniform consensus, plus the envelope used
//! to talk to the external hub.

use std::fmt::Debug;

use prototk_derive::Message;

use one_two_eight::{generate_id, generate_id_prototk};

use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Reference value for Δ, the initial and incremental step of the EPFD's adaptive timeout, in
/// milliseconds.
pub const DEFAULT_DELTA_MS: u64 = 100;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id!(SystemId, "system:");
generate_id_prototk!(SystemId);

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(656384, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(656385, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(656386, message)]
    IoError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(656387, message)]
    BootstrapError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::IoError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

///////////////////////////////////////////// ProcessId /////////////////////////////////////////////

/// Identity of one participant in the membership.  Per the reference implementation, equality and
/// hashing are defined by `port` alone: two `ProcessId`s with the same port are the same process
/// even if `host`/`rank` differ, and ELD's suspicion bookkeeping depends on this convention.
#[derive(Clone, Debug, Default, Message)]
pub struct ProcessId {
    #[prototk(1, string)]
    pub host: String,
    #[prototk(2, uint32)]
    pub port: u32,
    #[prototk(3, uint32)]
    pub rank: u32,
}

impl ProcessId {
    pub fn new(host: impl Into<String>, port: u32, rank: u32) -> Self {
        Self {
            host: host.into(),
            port,
            rank,
        }
    }
}

impl PartialEq for ProcessId {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
    }
}

impl Eq for ProcessId {}

impl std::hash::Hash for ProcessId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.port.hash(state);
    }
}

impl PartialOrd for ProcessId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank.cmp(&other.rank)
    }
}

///////////////////////////////////////////////// Value /////////////////////////////////////////////

/// A proposable value.  `defined == false` represents the bottom value; `data` holds an
/// application-chosen encoding (the reference stack uses little-endian integers, but any byte
/// string is acceptable since the protocol never interprets `data` itself).
#[derive(Clone, Debug, Default, Eq, PartialEq, Message)]
pub struct Value {
    #[prototk(1, Bool)]
    pub defined: bool,
    #[prototk(2, bytes)]
    pub data: Vec<u8>,
}

impl Value {
    pub const fn undefined() -> Self {
        Self {
            defined: false,
            data: Vec::new(),
        }
    }

    pub fn defined(data: impl Into<Vec<u8>>) -> Self {
        Self {
            defined: true,
            data: data.into(),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self::defined(v.to_le_bytes().to_vec())
    }

    pub fn as_i64(&self) -> Option<i64> {
        if !self.defined {
            return None;
        }
        let bytes: [u8; 8] = self.data.clone().try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }
}

///////////////////////////////////////////////// EpState ////////////////////////////////////////////

/// The last value some process accepted, paired with the epoch timestamp it was accepted under.
#[derive(Clone, Debug, Default, Eq, PartialEq, Message)]
pub struct EpState {
    #[prototk(1, uint64)]
    pub value_timestamp: u64,
    #[prototk(2, message)]
    pub value: Value,
}

impl EpState {
    pub const fn bottom() -> Self {
        Self {
            value_timestamp: 0,
            value: Value::undefined(),
        }
    }
}

///////////////////////////////////////////////// Message ////////////////////////////////////////////

/// The complete recognized set of messages exchanged within and between nodes.  Purely-internal
/// events (e.g. `EpfdTimeout`) share this enum with on-the-wire events (e.g. `EcNewEpoch`) so that
/// the dispatcher's queue, the abstractions' handlers, and the network codec all speak one
/// vocabulary — precisely the shape the reference `paxos_pb` messages take for the Paxos phases.
#[derive(Clone, Debug, Message)]
pub enum Message {
    #[prototk(1, message)]
    NetworkMessage(NetworkMessage),
    #[prototk(2, message)]
    AppRegistration(AppRegistration),
    #[prototk(3, message)]
    AppPropose(AppPropose),
    #[prototk(4, message)]
    AppDecide(AppDecide),
    #[prototk(5, message)]
    UcPropose(UcPropose),
    #[prototk(6, message)]
    UcDecide(UcDecide),
    #[prototk(7, message)]
    EcNewEpoch(EcNewEpoch),
    #[prototk(8, message)]
    EcNack(EcNack),
    #[prototk(9, message)]
    EcStartEpoch(EcStartEpoch),
    #[prototk(10, message)]
    EpPropose(EpPropose),
    #[prototk(11, message)]
    EpRead(EpRead),
    #[prototk(12, message)]
    EpState(EpStateMsg),
    #[prototk(13, message)]
    EpWrite(EpWrite),
    #[prototk(14, message)]
    EpAccept(EpAccept),
    #[prototk(15, message)]
    EpDecided(EpDecided),
    #[prototk(16, message)]
    EpDecide(EpDecide),
    #[prototk(17, message)]
    EpAbort(EpAbort),
    #[prototk(18, message)]
    EpAborted(EpAborted),
    #[prototk(19, message)]
    BebBroadcast(BebBroadcast),
    #[prototk(20, message)]
    BebDeliver(BebDeliver),
    #[prototk(21, message)]
    PlSend(PlSend),
    #[prototk(22, message)]
    PlDeliver(PlDeliver),
    #[prototk(23, message)]
    EldTrust(EldTrust),
    #[prototk(24, message)]
    EpfdTimeout(EpfdTimeout),
    #[prototk(25, message)]
    EpfdHeartbeatRequest(EpfdHeartbeatRequest),
    #[prototk(26, message)]
    EpfdHeartbeatReply(EpfdHeartbeatReply),
    #[prototk(27, message)]
    EpfdSuspect(EpfdSuspect),
    #[prototk(28, message)]
    EpfdRestore(EpfdRestore),
}

impl Default for Message {
    fn default() -> Self {
        Self::EcNack(EcNack::default())
    }
}

/// Wraps an inner [Message] with the sender information a receiver needs to resolve a
/// [ProcessId].  `abstraction_id` is carried for observability only (see the reference
/// implementation's routing note); dispatch is by message type, never by this tag.
#[derive(Clone, Debug, Default, Message)]
pub struct NetworkMessage {
    #[prototk(1, message)]
    pub message: Box<Message>,
    #[prototk(2, string)]
    pub sender_host: String,
    #[prototk(3, uint32)]
    pub sender_listening_port: u32,
    #[prototk(4, string)]
    pub abstraction_id: String,
    #[prototk(5, message)]
    pub system_id: SystemId,
}

#[derive(Clone, Debug, Default, Message)]
pub struct AppRegistration {
    #[prototk(1, string)]
    pub owner: String,
    #[prototk(2, uint32)]
    pub index: u32,
}

#[derive(Clone, Debug, Default, Message)]
pub struct AppPropose {
    #[prototk(1, message)]
    pub system_id: SystemId,
    #[prototk(2, message)]
    pub processes: Vec<ProcessId>,
    #[prototk(3, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct AppDecide {
    #[prototk(1, message)]
    pub system_id: SystemId,
    #[prototk(2, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct UcPropose {
    #[prototk(1, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct UcDecide {
    #[prototk(1, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EcNewEpoch {
    #[prototk(1, uint64)]
    pub ets: u64,
}

/// No-payload negative acknowledgement for an `EcNewEpoch` whose `trusted` didn't match.
#[derive(Clone, Debug, Default, Message)]
pub struct EcNack {}

#[derive(Clone, Debug, Default, Message)]
pub struct EcStartEpoch {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, message)]
    pub leader: ProcessId,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpPropose {
    #[prototk(1, message)]
    pub value: Value,
}

/// Carries `ets` so a receiver can tell which epoch consensus instance a read belongs to; a
/// process whose active epoch does not match silently drops the message (see EP idempotence,
/// §8 property 6).
#[derive(Clone, Debug, Default, Message)]
pub struct EpRead {
    #[prototk(1, uint64)]
    pub ets: u64,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpStateMsg {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, message)]
    pub state: EpState,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpWrite {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpAccept {
    #[prototk(1, uint64)]
    pub ets: u64,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpDecided {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpDecide {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, message)]
    pub value: Value,
}

/// No-payload signal that an epoch consensus instance has been abandoned.
#[derive(Clone, Debug, Default, Message)]
pub struct EpAbort {}

#[derive(Clone, Debug, Default, Message)]
pub struct EpAborted {
    #[prototk(1, uint64)]
    pub ets: u64,
    #[prototk(2, uint64)]
    pub value_timestamp: u64,
    #[prototk(3, message)]
    pub value: Value,
}

#[derive(Clone, Debug, Default, Message)]
pub struct BebBroadcast {
    #[prototk(1, message)]
    pub message: Box<Message>,
}

#[derive(Clone, Debug, Default, Message)]
pub struct BebDeliver {
    #[prototk(1, message)]
    pub sender: ProcessId,
    #[prototk(2, message)]
    pub message: Box<Message>,
}

#[derive(Clone, Debug, Default, Message)]
pub struct PlSend {
    #[prototk(1, message)]
    pub destination: ProcessId,
    #[prototk(2, message)]
    pub message: Box<Message>,
}

#[derive(Clone, Debug, Default, Message)]
pub struct PlDeliver {
    #[prototk(1, message)]
    pub sender: ProcessId,
    #[prototk(2, message)]
    pub message: Box<Message>,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EldTrust {
    #[prototk(1, message)]
    pub process: ProcessId,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpfdSuspect {
    #[prototk(1, message)]
    pub process: ProcessId,
}

#[derive(Clone, Debug, Default, Message)]
pub struct EpfdRestore {
    #[prototk(1, message)]
    pub process: ProcessId,
}

/// No-payload local timer tick, self-injected by the heartbeat timer thread.
#[derive(Clone, Debug, Default, Message)]
pub struct EpfdTimeout {}

/// No-payload heartbeat request, broadcast to every member each timer period.
#[derive(Clone, Debug, Default, Message)]
pub struct EpfdHeartbeatRequest {}

/// No-payload heartbeat reply, sent back to whoever asked.
#[derive(Clone, Debug, Default, Message)]
pub struct EpfdHeartbeatReply {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_equality_is_port_only() {
        let a = ProcessId::new("host-a", 5011, 1);
        let b = ProcessId::new("host-b", 5011, 99);
        assert_eq!(a, b);
        let c = ProcessId::new("host-a", 5012, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn value_round_trips_i64() {
        let v = Value::from_i64(42);
        assert_eq!(v.as_i64(), Some(42));
        assert!(Value::undefined().as_i64().is_none());
    }

    #[test]
    fn ep_state_bottom_is_undefined() {
        let bottom = EpState::bottom();
        assert_eq!(bottom.value_timestamp, 0);
        assert!(!bottom.value.defined);
    }
}
