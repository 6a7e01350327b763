//! Application glue (§4.9). Installing the process list, picking out `currentProcess`, and wiring
//! up the rest of the stack all happen once, before this abstraction is ever registered — see
//! [crate::instance::Instance::start], which is the bootstrap hook the reference design describes.
//! What is left to run *inside* the dispatcher loop is the other half of §4.9: forward the
//! eventual `UcDecide` back to the hub as an `AppDecide`.

use std::sync::Arc;

use biometrics::Counter;
use consensus_pb::{Message, SystemId};

use crate::net::HubHandle;
use crate::{Abstraction, Context};

static DECISIONS_FORWARDED: Counter = Counter::new("consensus.app.decisions_forwarded");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&DECISIONS_FORWARDED);
}

pub struct Application {
    system_id: SystemId,
    hub: Arc<dyn HubHandle>,
}

impl Application {
    pub fn new(system_id: SystemId, hub: Arc<dyn HubHandle>) -> Self {
        Self { system_id, hub }
    }
}

impl Abstraction for Application {
    fn name(&self) -> &'static str {
        "app"
    }

    fn handle(&mut self, _ctx: &mut Context, message: &Message) -> bool {
        let Message::UcDecide(decide) = message else {
            return false;
        };
        DECISIONS_FORWARDED.click();
        self.hub.send_decide(self.system_id, decide.value.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use consensus_pb::{EpfdTimeout, ProcessId, SystemId, UcDecide, Value};

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NopNet;
    impl crate::context::NetHandle for NopNet {
        fn send(&self, _system_id: &SystemId, _destination: &ProcessId, _message: Message) {}
    }

    #[derive(Default)]
    struct RecordingHub {
        decided: Mutex<Vec<Value>>,
        called: AtomicBool,
    }

    impl HubHandle for RecordingHub {
        fn send_decide(&self, _system_id: SystemId, value: Value) {
            self.called.store(true, Ordering::SeqCst);
            self.decided.lock().unwrap().push(value);
        }
    }

    #[test]
    fn forwards_uc_decide_and_claims_nothing_else() {
        let hub = Arc::new(RecordingHub::default());
        let mut app = Application::new(SystemId::default(), Arc::clone(&hub) as Arc<dyn HubHandle>);
        let membership = vec![ProcessId::new("h", 1, 1)];
        let mut queue = VecDeque::new();
        let net: Arc<dyn crate::context::NetHandle> = Arc::new(NopNet);
        let mut ctx = Context::new(
            &mut queue,
            &membership,
            membership[0].clone(),
            SystemId::default(),
            net.as_ref(),
        );

        assert!(!app.handle(&mut ctx, &Message::EpfdTimeout(EpfdTimeout {})));
        assert!(!hub.called.load(Ordering::SeqCst));

        let decide = Message::UcDecide(UcDecide {
            value: Value::from_i64(42),
        });
        assert!(app.handle(&mut ctx, &decide));
        assert_eq!(hub.decided.lock().unwrap().as_slice(), &[Value::from_i64(42)]);
    }
}
