//! Best-effort broadcast (§4.3): fans a broadcast out over as many perfect-link sends as there are
//! members, and reassembles deliveries for the subset of message types that only ever travel by
//! broadcast.
//!
//! Per the open question in §9, dispatch does not rely on `abstraction_id` — every wire message
//! type is either always broadcast or always unicast, so matching on the inner [Message] variant
//! is sufficient and matches the reference stack's own routing.

use biometrics::Counter;
use consensus_pb::{BebDeliver, Message, PlSend};

use crate::{Abstraction, Context};

static BROADCASTS_FANNED_OUT: Counter = Counter::new("consensus.beb.broadcasts_fanned_out");
static DELIVERIES_REASSEMBLED: Counter = Counter::new("consensus.beb.deliveries_reassembled");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&BROADCASTS_FANNED_OUT);
    collector.register_counter(&DELIVERIES_REASSEMBLED);
}

/// The message types this protocol only ever sends via `BebBroadcast`, never via a direct
/// `PlSend`. Everything else that arrives as `PlDeliver` (heartbeats, `EC_NACK`, `EP_STATE`,
/// `EP_ACCEPT`) is point-to-point and is left for its own abstraction to consume directly.
fn is_broadcast_only(message: &Message) -> bool {
    matches!(
        message,
        Message::EcNewEpoch(_) | Message::EpRead(_) | Message::EpWrite(_) | Message::EpDecided(_)
    )
}

#[derive(Default)]
pub struct BestEffortBroadcast;

impl BestEffortBroadcast {
    pub fn new() -> Self {
        Self
    }
}

impl Abstraction for BestEffortBroadcast {
    fn name(&self) -> &'static str {
        "beb"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        match message {
            Message::BebBroadcast(broadcast) => {
                BROADCASTS_FANNED_OUT.click();
                let members: Vec<_> = ctx.membership.to_vec();
                for member in members {
                    ctx.enqueue(Message::PlSend(PlSend {
                        destination: member,
                        message: broadcast.message.clone(),
                    }));
                }
                true
            }
            Message::PlDeliver(deliver) if is_broadcast_only(&deliver.message) => {
                DELIVERIES_REASSEMBLED.click();
                ctx.enqueue(Message::BebDeliver(BebDeliver {
                    sender: deliver.sender.clone(),
                    message: deliver.message.clone(),
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

    use consensus_pb::{EcNack, EcNewEpoch, PlDeliver, ProcessId, SystemId};

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
    fn broadcast_fans_out_to_every_member_including_self() {
        let membership = members();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut beb = BestEffortBroadcast::new();
        let mut ctx = Context::new(&mut queue, &membership, membership[0].clone(), SystemId::default(), &net);

        let broadcast = Message::BebBroadcast(consensus_pb::BebBroadcast {
            message: Box::new(Message::EcNewEpoch(EcNewEpoch { ets: 1 })),
        });
        assert!(beb.handle(&mut ctx, &broadcast));
        assert_eq!(queue.len(), membership.len());
        let destinations: std::collections::HashSet<_> =
            queue.iter().map(|m| match m {
                Message::PlSend(send) => send.destination.port,
                other => panic!("expected PlSend, got {other:?}"),
            }).collect();
        assert_eq!(destinations.len(), membership.len());
    }

    #[test]
    fn only_the_designated_broadcast_types_are_reassembled() {
        let membership = members();
        let net = NopNet;
        let mut queue = VecDeque::new();
        let mut beb = BestEffortBroadcast::new();
        let mut ctx = Context::new(&mut queue, &membership, membership[0].clone(), SystemId::default(), &net);

        let tagged = Message::PlDeliver(PlDeliver {
            sender: membership[1].clone(),
            message: Box::new(Message::EcNewEpoch(EcNewEpoch { ets: 1 })),
        });
        assert!(beb.handle(&mut ctx, &tagged));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop_back().unwrap(), Message::BebDeliver(_)));

        let unicast_only = Message::PlDeliver(PlDeliver {
            sender: membership[1].clone(),
            message: Box::new(Message::EcNack(EcNack {})),
        });
        assert!(!beb.handle(&mut ctx, &unicast_only));
    }
}
