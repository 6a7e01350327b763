//! Uniform consensus (§4.8): sequences epoch-consensus instances behind leader changes and
//! surfaces the first decision reached.
//!
//! UC owns its epoch-consensus instance directly rather than registering it as a sibling in the
//! dispatcher: replacing it on every epoch change is then a plain field assignment (the old,
//! halted instance is simply dropped), which is the simplest way to honor §9's note that a halted
//! EP instance should not be kept around once its successor replaces it. Every message UC sees is
//! offered to the current epoch-consensus instance first — composing the two behind the same
//! `Abstraction` trait needs no special case in the dispatcher.

use biometrics::Counter;
use consensus_pb::{EpAbort, EpState, Message, ProcessId, UcDecide, Value};
use indicio::{clue, INFO};

use super::ep::EpochConsensus;
use crate::metrics::LOGGING;
use crate::{Abstraction, Context};

static PROPOSALS_ISSUED: Counter = Counter::new("consensus.uc.proposals_issued");
static EPOCHS_REPLACED: Counter = Counter::new("consensus.uc.epochs_replaced");
static DECISIONS_EMITTED: Counter = Counter::new("consensus.uc.decisions_emitted");
static STALE_EPOCH_EVENTS_DROPPED: Counter =
    Counter::new("consensus.uc.stale_epoch_events_dropped");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PROPOSALS_ISSUED);
    collector.register_counter(&EPOCHS_REPLACED);
    collector.register_counter(&DECISIONS_EMITTED);
    collector.register_counter(&STALE_EPOCH_EVENTS_DROPPED);
}

pub struct UniformConsensus {
    val: Value,
    /// Set the moment a `UcPropose` arrives, distinct from `val.defined`: §8's S6 scenario
    /// proposes `Value::undefined()` and still expects the read/write round to run and decide
    /// undefined, so "has a proposal" and "the proposal is a defined value" cannot be conflated.
    has_proposal: bool,
    proposed: bool,
    decided: bool,
    ets: u64,
    l: ProcessId,
    newts: u64,
    newl: Option<ProcessId>,
    current_ep: EpochConsensus,
}

impl UniformConsensus {
    pub fn new(membership: &[ProcessId]) -> Self {
        let l = membership
            .iter()
            .min_by_key(|p| p.rank)
            .cloned()
            .unwrap_or_default();
        let current_ep = EpochConsensus::new(0, l.clone(), EpState::bottom());
        Self {
            val: Value::undefined(),
            has_proposal: false,
            proposed: false,
            decided: false,
            ets: 0,
            l,
            newts: 0,
            newl: None,
            current_ep,
        }
    }

    fn attempt_propose(&mut self, ctx: &mut Context) {
        if self.l.port == ctx.me.port && self.has_proposal && !self.proposed {
            self.proposed = true;
            PROPOSALS_ISSUED.click();
            ctx.enqueue(Message::EpPropose(consensus_pb::EpPropose {
                value: self.val.clone(),
            }));
        }
    }
}

impl Abstraction for UniformConsensus {
    fn name(&self) -> &'static str {
        "uc"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        if self.current_ep.handle(ctx, message) {
            return true;
        }
        match message {
            Message::UcPropose(propose) => {
                self.val = propose.value.clone();
                self.has_proposal = true;
                self.attempt_propose(ctx);
                true
            }
            Message::EcStartEpoch(start) => {
                self.newts = start.ets;
                self.newl = Some(start.leader.clone());
                ctx.enqueue(Message::EpAbort(EpAbort {}));
                true
            }
            Message::EpAborted(aborted) => {
                if aborted.ets != self.ets {
                    STALE_EPOCH_EVENTS_DROPPED.click();
                    return true;
                }
                self.ets = self.newts;
                if let Some(newl) = self.newl.take() {
                    self.l = newl;
                }
                self.proposed = false;
                EPOCHS_REPLACED.click();
                clue!(LOGGING, INFO, {
                    uc: {
                        new_epoch: self.ets,
                        leader: self.l.port,
                    },
                });
                self.current_ep = EpochConsensus::new(
                    self.ets,
                    self.l.clone(),
                    EpState {
                        value_timestamp: aborted.value_timestamp,
                        value: aborted.value.clone(),
                    },
                );
                self.attempt_propose(ctx);
                true
            }
            Message::EpDecide(decide) => {
                if decide.ets != self.ets || self.decided {
                    STALE_EPOCH_EVENTS_DROPPED.click();
                    return true;
                }
                self.decided = true;
                DECISIONS_EMITTED.click();
                clue!(LOGGING, INFO, {
                    uc: {
                        decide: true,
                    },
                });
                ctx.enqueue(Message::UcDecide(UcDecide {
                    value: decide.value.clone(),
                }));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use consensus_pb::{EpDecide, SystemId};

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

    #[test]
    fn a_stale_decide_is_ignored_and_a_second_decide_never_fires() {
        let membership = members();
        let me = membership[0].clone();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut uc = UniformConsensus::new(&membership);
        uc.ets = 7;
        let mut ctx = Context::new(&mut queue, &membership, me.clone(), SystemId::default(), &net);

        // A late decision for a long-past epoch must not surface as UcDecide.
        let stale = Message::EpDecide(EpDecide { ets: 5, value: Value::from_i64(1) });
        assert!(uc.handle(&mut ctx, &stale));
        assert!(queue.is_empty());
        assert!(!uc.decided);

        // A current-epoch decide does surface, exactly once (Integrity, §8 property 3).
        let current = Message::EpDecide(EpDecide { ets: 7, value: Value::from_i64(99) });
        assert!(uc.handle(&mut ctx, &current));
        assert_eq!(queue.len(), 1);
        match queue.pop_back().unwrap() {
            Message::UcDecide(decide) => assert_eq!(decide.value.as_i64(), Some(99)),
            other => panic!("expected UcDecide, got {other:?}"),
        }
        assert!(uc.decided);

        // Repeating it produces no second UcDecide.
        assert!(uc.handle(&mut ctx, &current));
        assert!(queue.is_empty());
    }

    #[test]
    fn propose_waits_for_self_to_be_leader() {
        let membership = members();
        let me = membership[1].clone();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut uc = UniformConsensus::new(&membership);
        // UC's `l` starts at the min-rank member (membership[0]), so `me` (rank 2) is not yet
        // leader: proposing must not emit EpPropose until an epoch change makes `me` the leader.
        let mut ctx = Context::new(&mut queue, &membership, me.clone(), SystemId::default(), &net);
        uc.handle(&mut ctx, &Message::UcPropose(consensus_pb::UcPropose { value: Value::from_i64(3) }));
        assert!(queue.is_empty());
    }
}
