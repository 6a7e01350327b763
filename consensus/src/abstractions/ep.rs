//! Epoch consensus (§4.7): one instance per `(system, ets)`. UC owns exactly one live instance at
//! a time, replacing it in the dispatcher on every epoch change (§9's note on discarding halted
//! instances) rather than keeping history around.
//!
//! Every wire message this abstraction cares about (`EP_READ`/`EP_STATE`/`EP_WRITE`/`EP_ACCEPT`/
//! `EP_DECIDED`) carries its own `ets`; a message for a different epoch than the one this instance
//! is currently running is claimed (so it does not pile up unclaimed in the queue) but otherwise
//! produces no effect, which is also how a halted instance behaves after `EP_ABORT` (§8 property
//! 6, EP idempotence).

use std::collections::{HashMap, HashSet};

use biometrics::Counter;
use consensus_pb::{
    BebBroadcast, EpAbort, EpAborted, EpAccept, EpDecide, EpDecided, EpRead, EpState, EpStateMsg,
    EpWrite, Message, PlSend, ProcessId, Value,
};
use indicio::{clue, INFO};

use crate::metrics::LOGGING;
use crate::{Abstraction, Context};

static READS_BROADCAST: Counter = Counter::new("consensus.ep.reads_broadcast");
static WRITES_BROADCAST: Counter = Counter::new("consensus.ep.writes_broadcast");
static DECISIONS_BROADCAST: Counter = Counter::new("consensus.ep.decisions_broadcast");
static ABORTED: Counter = Counter::new("consensus.ep.aborted");
static STALE_MESSAGES_DROPPED: Counter = Counter::new("consensus.ep.stale_messages_dropped");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&READS_BROADCAST);
    collector.register_counter(&WRITES_BROADCAST);
    collector.register_counter(&DECISIONS_BROADCAST);
    collector.register_counter(&ABORTED);
    collector.register_counter(&STALE_MESSAGES_DROPPED);
}

pub struct EpochConsensus {
    ets: u64,
    leader: ProcessId,
    tmp_val: Value,
    state: EpState,
    states: HashMap<u32, EpState>,
    accepted: HashSet<u32>,
    halted: bool,
}

impl EpochConsensus {
    pub fn new(ets: u64, leader: ProcessId, initial_state: EpState) -> Self {
        Self {
            ets,
            leader,
            tmp_val: Value::undefined(),
            state: initial_state,
            states: HashMap::new(),
            accepted: HashSet::new(),
            halted: false,
        }
    }
}

impl Abstraction for EpochConsensus {
    fn name(&self) -> &'static str {
        "ep"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        match message {
            Message::EpPropose(propose) => {
                if self.halted {
                    return true;
                }
                self.tmp_val = propose.value.clone();
                READS_BROADCAST.click();
                ctx.enqueue(Message::BebBroadcast(BebBroadcast {
                    message: Box::new(Message::EpRead(EpRead { ets: self.ets })),
                }));
                true
            }
            Message::EpAbort(_) => {
                if !self.halted {
                    self.halted = true;
                    ABORTED.click();
                    clue!(LOGGING, INFO, {
                        ep: {
                            abort: self.ets,
                        },
                    });
                    ctx.enqueue(Message::EpAborted(EpAborted {
                        ets: self.ets,
                        value_timestamp: self.state.value_timestamp,
                        value: self.state.value.clone(),
                    }));
                }
                true
            }
            Message::BebDeliver(deliver) => self.handle_beb_deliver(ctx, deliver),
            Message::PlDeliver(deliver) => self.handle_pl_deliver(ctx, deliver),
            _ => false,
        }
    }
}

impl EpochConsensus {
    fn handle_beb_deliver(&mut self, ctx: &mut Context, deliver: &consensus_pb::BebDeliver) -> bool {
        match deliver.message.as_ref() {
            Message::EpRead(read) => {
                if !self.is_current(read.ets) || self.halted || deliver.sender.port != self.leader.port {
                    STALE_MESSAGES_DROPPED.click();
                    return true;
                }
                ctx.enqueue(Message::PlSend(PlSend {
                    destination: self.leader.clone(),
                    message: Box::new(Message::EpState(EpStateMsg {
                        ets: self.ets,
                        state: self.state.clone(),
                    })),
                }));
                true
            }
            Message::EpWrite(write) => {
                if !self.is_current(write.ets) || self.halted || deliver.sender.port != self.leader.port
                {
                    STALE_MESSAGES_DROPPED.click();
                    return true;
                }
                self.state = EpState {
                    value_timestamp: self.ets,
                    value: write.value.clone(),
                };
                ctx.enqueue(Message::PlSend(PlSend {
                    destination: self.leader.clone(),
                    message: Box::new(Message::EpAccept(EpAccept { ets: self.ets })),
                }));
                true
            }
            Message::EpDecided(decided) => {
                if !self.is_current(decided.ets) || self.halted || deliver.sender.port != self.leader.port
                {
                    STALE_MESSAGES_DROPPED.click();
                    return true;
                }
                ctx.enqueue(Message::EpDecide(EpDecide {
                    ets: self.ets,
                    value: decided.value.clone(),
                }));
                true
            }
            _ => false,
        }
    }

    fn handle_pl_deliver(&mut self, ctx: &mut Context, deliver: &consensus_pb::PlDeliver) -> bool {
        match deliver.message.as_ref() {
            Message::EpState(state_msg) => {
                if !self.is_current(state_msg.ets) || self.halted || ctx.me.port != self.leader.port {
                    STALE_MESSAGES_DROPPED.click();
                    return true;
                }
                self.states.insert(deliver.sender.port, state_msg.state.clone());
                if ctx.is_quorum(self.states.len()) {
                    if let Some(best) = self.states.values().max_by_key(|s| s.value_timestamp) {
                        if best.value.defined {
                            self.tmp_val = best.value.clone();
                        }
                    }
                    self.states.clear();
                    WRITES_BROADCAST.click();
                    ctx.enqueue(Message::BebBroadcast(BebBroadcast {
                        message: Box::new(Message::EpWrite(EpWrite {
                            ets: self.ets,
                            value: self.tmp_val.clone(),
                        })),
                    }));
                }
                true
            }
            Message::EpAccept(accept) => {
                if !self.is_current(accept.ets) || self.halted || ctx.me.port != self.leader.port {
                    STALE_MESSAGES_DROPPED.click();
                    return true;
                }
                self.accepted.insert(deliver.sender.port);
                if ctx.is_quorum(self.accepted.len()) {
                    self.accepted.clear();
                    DECISIONS_BROADCAST.click();
                    ctx.enqueue(Message::BebBroadcast(BebBroadcast {
                        message: Box::new(Message::EpDecided(EpDecided {
                            ets: self.ets,
                            value: self.tmp_val.clone(),
                        })),
                    }));
                }
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, ets: u64) -> bool {
        ets == self.ets
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use consensus_pb::SystemId;

    use super::*;
    use crate::context::NetHandle;

    struct NopNet;
    impl NetHandle for NopNet {
        fn send(&self, _system_id: &SystemId, _destination: &ProcessId, _message: Message) {}
    }

    fn members() -> Vec<ProcessId> {
        vec![
            ProcessId::new("a", 1, 1),
            ProcessId::new("b", 2, 2),
            ProcessId::new("c", 3, 3),
        ]
    }

    fn state_msg(sender: &ProcessId, ets: u64, ts: u64, value: Value) -> Message {
        Message::PlDeliver(consensus_pb::PlDeliver {
            sender: sender.clone(),
            message: Box::new(Message::EpState(EpStateMsg {
                ets,
                state: EpState { value_timestamp: ts, value },
            })),
        })
    }

    #[test]
    fn write_is_broadcast_only_after_a_quorum_of_states() {
        let membership = members();
        let leader = membership[0].clone();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut ep = EpochConsensus::new(1, leader.clone(), EpState::bottom());
        let mut ctx = Context::new(&mut queue, &membership, leader.clone(), SystemId::default(), &net);

        ep.tmp_val = Value::from_i64(7);
        let first = Message::PlDeliver(consensus_pb::PlDeliver {
            sender: membership[0].clone(),
            message: Box::new(Message::EpState(EpStateMsg { ets: 1, state: EpState::bottom() })),
        });
        assert!(ep.handle(&mut ctx, &first));
        assert!(queue.is_empty(), "one reply out of three is not a quorum");

        let second = state_msg(&membership[1], 1, 0, Value::undefined());
        assert!(ep.handle(&mut ctx, &second));
        assert!(!queue.is_empty(), "two of three replies is a strict majority");
        match queue.pop_back().unwrap() {
            Message::BebBroadcast(b) => assert!(matches!(*b.message, Message::EpWrite(_))),
            other => panic!("expected BebBroadcast(EpWrite), got {other:?}"),
        }
    }

    #[test]
    fn quorum_read_prefers_the_highest_timestamped_defined_value() {
        let membership = members();
        let leader = membership[0].clone();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut ep = EpochConsensus::new(5, leader.clone(), EpState::bottom());
        let mut ctx = Context::new(&mut queue, &membership, leader.clone(), SystemId::default(), &net);
        ep.tmp_val = Value::from_i64(1);

        ep.handle(&mut ctx, &state_msg(&membership[0], 5, 0, Value::undefined()));
        ep.handle(&mut ctx, &state_msg(&membership[1], 5, 3, Value::from_i64(42)));
        match queue.pop_back().unwrap() {
            Message::BebBroadcast(b) => match *b.message {
                Message::EpWrite(w) => assert_eq!(w.value.as_i64(), Some(42)),
                other => panic!("expected EpWrite, got {other:?}"),
            },
            other => panic!("expected BebBroadcast, got {other:?}"),
        }
    }

    #[test]
    fn aborted_instance_is_idempotent() {
        let membership = members();
        let leader = membership[0].clone();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut ep = EpochConsensus::new(2, leader.clone(), EpState::bottom());
        let mut ctx = Context::new(&mut queue, &membership, leader.clone(), SystemId::default(), &net);

        assert!(ep.handle(&mut ctx, &Message::EpAbort(EpAbort {})));
        assert_eq!(queue.len(), 1, "EpAborted is emitted exactly once");
        queue.clear();

        // A second EpAbort, and any further EP traffic for this ets, produce no output.
        assert!(ep.handle(&mut ctx, &Message::EpAbort(EpAbort {})));
        assert!(queue.is_empty());

        assert!(ep.handle(&mut ctx, &state_msg(&membership[1], 2, 0, Value::from_i64(9))));
        assert!(queue.is_empty());

        let read = Message::BebDeliver(consensus_pb::BebDeliver {
            sender: leader.clone(),
            message: Box::new(Message::EpRead(EpRead { ets: 2 })),
        });
        assert!(ep.handle(&mut ctx, &read));
        assert!(queue.is_empty());
    }
}
