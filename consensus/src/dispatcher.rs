use std::collections::VecDeque;
use std::sync::Arc;

use biometrics::Counter;
use consensus_pb::{Message, ProcessId, SystemId};
use indicio::{clue, INFO};
use tatl::{HeyListen, Stationary};

use crate::context::{Context, NetHandle};
use crate::metrics::LOGGING;

static MESSAGES_ENQUEUED: Counter = Counter::new("consensus.dispatcher.messages_enqueued");
static MESSAGES_UNCLAIMED: Counter = Counter::new("consensus.dispatcher.messages_unclaimed");
static STEPS_TAKEN: Counter = Counter::new("consensus.dispatcher.steps_taken");

/// Every recognized message type is claimed by exactly one abstraction in a fully-wired stack
/// (§4.1's "first-match" rule is equivalent to dispatch-by-type); an unclaimed message is either a
/// bug in the stack's wiring or a malformed frame, so this should never click in a healthy run.
static MESSAGES_UNCLAIMED_MONITOR: Stationary =
    Stationary::new("consensus.dispatcher.messages_unclaimed", &MESSAGES_UNCLAIMED);

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&MESSAGES_ENQUEUED);
    collector.register_counter(&MESSAGES_UNCLAIMED);
    collector.register_counter(&STEPS_TAKEN);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&MESSAGES_UNCLAIMED_MONITOR);
}

/// One layer of the protocol stack.  Implementations never touch another abstraction's state
/// directly; the only channel between them is the message queue a [Dispatcher] drives.
pub trait Abstraction: Send {
    /// Used only in log lines; has no bearing on dispatch order.
    fn name(&self) -> &'static str;

    /// Offered every message the dispatcher pops off the queue, in the order abstractions were
    /// registered.  Returns `true` to claim the message (it is consumed and offered to no one
    /// else) or `false` to let the next abstraction see it.  A message no abstraction claims is
    /// logged and dropped rather than left to accumulate forever.
    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool;
}

/// Drives one system-id's abstraction stack.  Owns the FIFO queue and runs entirely on whatever
/// thread calls [`Dispatcher::step`] — per §5, that is always the same thread for the lifetime of
/// the instance.
pub struct Dispatcher {
    abstractions: Vec<Box<dyn Abstraction>>,
    queue: VecDeque<Message>,
    membership: Vec<ProcessId>,
    me: ProcessId,
    system_id: SystemId,
    net: Arc<dyn NetHandle>,
}

impl Dispatcher {
    pub fn new(
        me: ProcessId,
        system_id: SystemId,
        membership: Vec<ProcessId>,
        net: Arc<dyn NetHandle>,
    ) -> Self {
        Self {
            abstractions: Vec::new(),
            queue: VecDeque::new(),
            membership,
            me,
            system_id,
            net,
        }
    }

    /// Adds an abstraction at the tail of the registration order.  Call in dependency order (PL
    /// first; APP/UC last) so that a message meant for a lower layer is never accidentally
    /// swallowed by a higher one that merely shares its wire shape.
    pub fn register(&mut self, abstraction: Box<dyn Abstraction>) {
        self.abstractions.push(abstraction);
    }

    /// Enqueues a message from outside the dispatcher loop (the network listener thread, the
    /// EPFD timer thread, or the hub client).
    pub fn push(&mut self, message: Message) {
        MESSAGES_ENQUEUED.click();
        self.queue.push_back(message);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pops and dispatches exactly one message.  Returns `false` when the queue was empty, so
    /// callers can distinguish "ran out of work" from "processed a message".
    pub fn step(&mut self) -> bool {
        let message = match self.queue.pop_front() {
            Some(message) => message,
            None => return false,
        };
        STEPS_TAKEN.click();
        let mut ctx = Context::new(
            &mut self.queue,
            &self.membership,
            self.me.clone(),
            self.system_id,
            self.net.as_ref(),
        );
        let mut handled = false;
        for abstraction in self.abstractions.iter_mut() {
            if abstraction.handle(&mut ctx, &message) {
                handled = true;
                break;
            }
        }
        if !handled {
            MESSAGES_UNCLAIMED.click();
            clue!(LOGGING, INFO, {
                dispatcher: {
                    unclaimed: format!("{:?}", message),
                },
            });
        }
        true
    }

    /// Runs [`Dispatcher::step`] until the queue drains.  Safe to call repeatedly: every enqueue
    /// (from the network thread or the timer thread) just gives it more to do next time.
    pub fn drain(&mut self) {
        while self.step() {}
    }
}
