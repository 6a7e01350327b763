use std::collections::VecDeque;

use consensus_pb::{Message, ProcessId, SystemId};

/// Sends a single outbound [Message] to a destination process, on behalf of the perfect-link
/// abstraction.  Implemented by [crate::net::TcpNetHandle] for real nodes and by an in-memory
/// stand-in in tests; kept as a trait so the dispatcher loop never has to know whether it is
/// driving real sockets or a deterministic simulation.
pub trait NetHandle: Send + Sync {
    fn send(&self, system_id: &SystemId, destination: &ProcessId, message: Message);
}

/// The per-message handle an [crate::Abstraction] uses to talk to the rest of the system.  Per
/// §5, abstractions never call one another directly; every effect is either a message enqueued
/// onto the shared FIFO (re-examined by every abstraction in order, exactly like the message that
/// triggered it) or a send handed off to the network layer.
pub struct Context<'a> {
    queue: &'a mut VecDeque<Message>,
    pub membership: &'a [ProcessId],
    pub me: ProcessId,
    pub system_id: SystemId,
    net: &'a dyn NetHandle,
}

impl<'a> Context<'a> {
    pub fn new(
        queue: &'a mut VecDeque<Message>,
        membership: &'a [ProcessId],
        me: ProcessId,
        system_id: SystemId,
        net: &'a dyn NetHandle,
    ) -> Self {
        Self {
            queue,
            membership,
            me,
            system_id,
            net,
        }
    }

    /// Appends a message to the tail of the dispatcher's queue, to be offered to every
    /// abstraction in registration order on a future step.
    pub fn enqueue(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    /// A process is a quorum if it holds more than half of the membership; used identically by
    /// EC (majority of suspicions) and EP (majority of STATE/ACCEPT replies).
    pub fn is_quorum(&self, count: usize) -> bool {
        count * 2 > self.membership.len()
    }

    /// Used only by the perfect-link abstraction to hand a `PL_SEND` payload to the transport.
    pub(crate) fn transmit(&self, destination: &ProcessId, message: Message) {
        self.net.send(&self.system_id, destination, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopNet;
    impl NetHandle for NopNet {
        fn send(&self, _system_id: &SystemId, _destination: &ProcessId, _message: Message) {}
    }

    fn ctx(membership: &[ProcessId], net: &dyn NetHandle, queue: &mut VecDeque<Message>) -> Context {
        Context::new(queue, membership, membership[0].clone(), SystemId::default(), net)
    }

    #[test]
    fn quorum_needs_strict_majority() {
        let membership = vec![
            ProcessId::new("a", 1, 1),
            ProcessId::new("b", 2, 2),
            ProcessId::new("c", 3, 3),
        ];
        let net = NopNet;
        let mut queue = VecDeque::new();
        let context = ctx(&membership, &net, &mut queue);
        assert!(!context.is_quorum(0));
        assert!(!context.is_quorum(1));
        assert!(context.is_quorum(2));
        assert!(context.is_quorum(3));
    }

    #[test]
    fn quorum_with_even_membership_still_needs_strict_majority() {
        let membership = vec![
            ProcessId::new("a", 1, 1),
            ProcessId::new("b", 2, 2),
            ProcessId::new("c", 3, 3),
            ProcessId::new("d", 4, 4),
        ];
        let net = NopNet;
        let mut queue = VecDeque::new();
        let context = ctx(&membership, &net, &mut queue);
        assert!(!context.is_quorum(2));
        assert!(context.is_quorum(3));
    }
}
