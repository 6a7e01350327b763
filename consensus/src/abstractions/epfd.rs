//! Eventually perfect failure detector (§4.4): an adaptive heartbeat timer drives suspicion,
//! strictly serialized through the dispatcher so the timer thread never touches `alive`/
//! `suspected` itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use biometrics::Counter;
use consensus_pb::{
    EpfdHeartbeatReply, EpfdHeartbeatRequest, EpfdRestore, EpfdSuspect, Message, PlSend, ProcessId,
    DEFAULT_DELTA_MS,
};
use indicio::{clue, INFO};

use crate::metrics::LOGGING;
use crate::{Abstraction, Context};

static TICKS_PROCESSED: Counter = Counter::new("consensus.epfd.ticks_processed");
static SUSPICIONS_RAISED: Counter = Counter::new("consensus.epfd.suspicions_raised");
static SUSPICIONS_CLEARED: Counter = Counter::new("consensus.epfd.suspicions_cleared");
static DELAY_INCREASED: Counter = Counter::new("consensus.epfd.delay_increased");
static HEARTBEATS_SENT: Counter = Counter::new("consensus.epfd.heartbeats_sent");
static HEARTBEATS_RECEIVED: Counter = Counter::new("consensus.epfd.heartbeats_received");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&TICKS_PROCESSED);
    collector.register_counter(&SUSPICIONS_RAISED);
    collector.register_counter(&SUSPICIONS_CLEARED);
    collector.register_counter(&DELAY_INCREASED);
    collector.register_counter(&HEARTBEATS_SENT);
    collector.register_counter(&HEARTBEATS_RECEIVED);
}

/// Eventually-perfect failure detector state. `alive`/`suspected` are keyed by port, matching
/// `ProcessId`'s port-only equality (§9).
pub struct EventuallyPerfectFailureDetector {
    alive: HashSet<u32>,
    suspected: HashSet<u32>,
    delay_ms: u64,
    delta_ms: u64,
    shared_delay: Arc<AtomicU64>,
}

impl EventuallyPerfectFailureDetector {
    pub fn new(membership: &[ProcessId], shared_delay: Arc<AtomicU64>) -> Self {
        let alive = membership.iter().map(|p| p.port).collect();
        shared_delay.store(DEFAULT_DELTA_MS, Ordering::SeqCst);
        Self {
            alive,
            suspected: HashSet::new(),
            delay_ms: DEFAULT_DELTA_MS,
            delta_ms: DEFAULT_DELTA_MS,
            shared_delay,
        }
    }

    fn tick(&mut self, ctx: &mut Context) {
        TICKS_PROCESSED.click();
        let intersection_nonempty = self.alive.iter().any(|p| self.suspected.contains(p));
        if intersection_nonempty {
            self.delay_ms += self.delta_ms;
            DELAY_INCREASED.click();
        }
        let members: Vec<_> = ctx.membership.to_vec();
        for member in &members {
            let in_alive = self.alive.contains(&member.port);
            let in_suspected = self.suspected.contains(&member.port);
            if !in_alive && !in_suspected {
                self.suspected.insert(member.port);
                SUSPICIONS_RAISED.click();
                clue!(LOGGING, INFO, {
                    epfd: {
                        suspect: member.port,
                    },
                });
                ctx.enqueue(Message::EpfdSuspect(EpfdSuspect {
                    process: member.clone(),
                }));
            } else if in_alive && in_suspected {
                self.suspected.remove(&member.port);
                SUSPICIONS_CLEARED.click();
                clue!(LOGGING, INFO, {
                    epfd: {
                        restore: member.port,
                    },
                });
                ctx.enqueue(Message::EpfdRestore(EpfdRestore {
                    process: member.clone(),
                }));
            }
            HEARTBEATS_SENT.click();
            ctx.enqueue(Message::PlSend(PlSend {
                destination: member.clone(),
                message: Box::new(Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {})),
            }));
        }
        self.alive.clear();
        self.shared_delay.store(self.delay_ms, Ordering::SeqCst);
    }
}

impl Abstraction for EventuallyPerfectFailureDetector {
    fn name(&self) -> &'static str {
        "epfd"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        match message {
            Message::EpfdTimeout(_) => {
                self.tick(ctx);
                true
            }
            Message::PlDeliver(deliver) => match deliver.message.as_ref() {
                Message::EpfdHeartbeatRequest(_) => {
                    ctx.enqueue(Message::PlSend(PlSend {
                        destination: deliver.sender.clone(),
                        message: Box::new(Message::EpfdHeartbeatReply(EpfdHeartbeatReply {})),
                    }));
                    true
                }
                Message::EpfdHeartbeatReply(_) => {
                    HEARTBEATS_RECEIVED.click();
                    self.alive.insert(deliver.sender.port);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use consensus_pb::PlDeliver;

    use super::*;
    use crate::context::NetHandle;

    struct NopNet;
    impl NetHandle for NopNet {
        fn send(&self, _system_id: &consensus_pb::SystemId, _destination: &ProcessId, _message: Message) {}
    }

    fn membership() -> Vec<ProcessId> {
        vec![
            ProcessId::new("a", 1, 1),
            ProcessId::new("b", 2, 2),
            ProcessId::new("c", 3, 3),
        ]
    }

    fn heartbeat_reply(from: &ProcessId) -> Message {
        Message::PlDeliver(PlDeliver {
            sender: from.clone(),
            message: Box::new(Message::EpfdHeartbeatReply(EpfdHeartbeatReply {})),
        })
    }

    #[test]
    fn a_process_missing_heartbeats_is_suspected_then_restored() {
        let membership = membership();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let shared_delay = Arc::new(AtomicU64::new(DEFAULT_DELTA_MS));
        let mut epfd = EventuallyPerfectFailureDetector::new(&membership, Arc::clone(&shared_delay));

        let mut ctx = Context::new(
            &mut queue,
            &membership,
            membership[0].clone(),
            consensus_pb::SystemId::default(),
            &net,
        );
        // All three reply in round 1: nobody suspected.
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[0]));
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[1]));
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[2]));
        epfd.tick(&mut ctx);
        assert!(!epfd.suspected.contains(&membership[2].port));

        // Round 2: port 3 goes silent.
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[0]));
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[1]));
        epfd.tick(&mut ctx);
        assert!(epfd.suspected.contains(&membership[2].port));
        let delay_after_suspect = shared_delay.load(Ordering::SeqCst);
        assert_eq!(delay_after_suspect, DEFAULT_DELTA_MS);

        // Round 3: port 3 replies again — EPFD restores it, but since it was both suspected and
        // alive this round, the adaptive delay must grow (property 8).
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[0]));
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[1]));
        epfd.handle(&mut ctx, &heartbeat_reply(&membership[2]));
        epfd.tick(&mut ctx);
        assert!(!epfd.suspected.contains(&membership[2].port));
        assert!(shared_delay.load(Ordering::SeqCst) > delay_after_suspect);
    }

    #[test]
    fn heartbeat_request_is_answered_with_a_reply() {
        let membership = membership();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let shared_delay = Arc::new(AtomicU64::new(DEFAULT_DELTA_MS));
        let mut epfd = EventuallyPerfectFailureDetector::new(&membership, shared_delay);
        let mut ctx = Context::new(
            &mut queue,
            &membership,
            membership[0].clone(),
            consensus_pb::SystemId::default(),
            &net,
        );
        let request = Message::PlDeliver(PlDeliver {
            sender: membership[1].clone(),
            message: Box::new(Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {})),
        });
        assert!(epfd.handle(&mut ctx, &request));
        assert_eq!(queue.len(), 1);
        match &queue[0] {
            Message::PlSend(send) => {
                assert_eq!(send.destination.port, membership[1].port);
                assert!(matches!(*send.message, Message::EpfdHeartbeatReply(_)));
            }
            other => panic!("expected PlSend, got {other:?}"),
        }
    }
}
