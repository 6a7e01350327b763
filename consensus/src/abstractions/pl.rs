//! Perfect link (§4.2): hands `PlSend` to the network layer, addressed by destination.

use biometrics::Counter;
use consensus_pb::{EpfdHeartbeatRequest, Message, PlDeliver, ProcessId};

use crate::{Abstraction, Context};

static SENDS_ISSUED: Counter = Counter::new("consensus.pl.sends_issued");
static SENDS_LOOPED_BACK: Counter = Counter::new("consensus.pl.sends_looped_back");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&SENDS_ISSUED);
    collector.register_counter(&SENDS_LOOPED_BACK);
}

/// Stateless: perfect link has no retained state of its own, only a name for dispatcher logging.
#[derive(Default)]
pub struct PerfectLink;

impl PerfectLink {
    pub fn new() -> Self {
        Self
    }
}

impl Abstraction for PerfectLink {
    fn name(&self) -> &'static str {
        "pl"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        let Message::PlSend(send) = message else {
            return false;
        };
        SENDS_ISSUED.click();
        if send.destination.port == ctx.me.port {
            SENDS_LOOPED_BACK.click();
            ctx.enqueue(Message::PlDeliver(PlDeliver {
                sender: ctx.me.clone(),
                message: send.message.clone(),
            }));
        } else {
            deliver(ctx, &send.destination, (*send.message).clone());
        }
        true
    }
}

fn deliver(ctx: &Context, destination: &ProcessId, message: Message) {
    ctx.transmit(destination, message);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use consensus_pb::SystemId;

    use super::*;
    use crate::context::NetHandle;

    #[derive(Default)]
    struct RecordingNet {
        sent: Mutex<Vec<(u32, Message)>>,
    }
    impl NetHandle for RecordingNet {
        fn send(&self, _system_id: &SystemId, destination: &ProcessId, message: Message) {
            self.sent.lock().unwrap().push((destination.port, message));
        }
    }

    fn members() -> Vec<ProcessId> {
        vec![ProcessId::new("a", 1, 1), ProcessId::new("b", 2, 2)]
    }

    #[test]
    fn a_send_to_self_loops_back_without_touching_the_network() {
        let membership = members();
        let net = RecordingNet::default();
        let mut queue = VecDeque::new();
        let mut pl = PerfectLink::new();
        let mut ctx = Context::new(&mut queue, &membership, membership[0].clone(), SystemId::default(), &net);

        let send = Message::PlSend(consensus_pb::PlSend {
            destination: membership[0].clone(),
            message: Box::new(Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {})),
        });
        assert!(pl.handle(&mut ctx, &send));
        assert!(net.sent.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 1);
        match queue.pop_back().unwrap() {
            Message::PlDeliver(deliver) => {
                assert_eq!(deliver.sender.port, membership[0].port);
                assert!(matches!(*deliver.message, Message::EpfdHeartbeatRequest(_)));
            }
            other => panic!("expected PlDeliver, got {other:?}"),
        }
    }

    #[test]
    fn a_send_to_a_peer_is_handed_to_the_network_layer() {
        let membership = members();
        let net = RecordingNet::default();
        let mut queue = VecDeque::new();
        let mut pl = PerfectLink::new();
        let mut ctx = Context::new(&mut queue, &membership, membership[0].clone(), SystemId::default(), &net);

        let send = Message::PlSend(consensus_pb::PlSend {
            destination: membership[1].clone(),
            message: Box::new(Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {})),
        });
        assert!(pl.handle(&mut ctx, &send));
        assert!(queue.is_empty());
        let sent = net.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, membership[1].port);
    }
}
