//! Wires one system-id's full abstraction stack together and drives it (§4.9, §5).
//!
//! Construction order follows §4.9 exactly — PL, EPFD, ELD, BEB, EC, UC, then APP — and the
//! resulting [Dispatcher] is handed to two background threads: one repeatedly calls
//! [`Dispatcher::step`] (sleeping ~10ms between sweeps whenever nothing was queued, per §4.1), the
//! other exists solely to turn EPFD's adaptive delay into `EPFD_TIMEOUT` markers (§4.4's
//! concurrency note — the timer thread never touches abstraction state itself).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use consensus_pb::{
    EldTrust, EpfdTimeout, Message, ProcessId, SystemId, UcPropose, Value, DEFAULT_DELTA_MS,
};

use crate::abstractions::{app, beb, ec, eld, epfd, pl, uc};
use crate::context::NetHandle;
use crate::dispatcher::Dispatcher;
use crate::net::HubHandle;

/// How long the dispatch loop sleeps after a sweep that matched nothing, per §4.1.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// One running consensus instance: a dispatcher plus the threads that feed it. Dropping an
/// `Instance` stops both threads and joins them.
pub struct Instance {
    dispatcher: Arc<Mutex<Dispatcher>>,
    shared_delay_ms: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    dispatch_thread: Option<JoinHandle<()>>,
    epfd_thread: Option<JoinHandle<()>>,
}

impl Instance {
    /// Builds the stack for `system_id` over `membership`, seeds the dispatcher's queue with the
    /// initial `UcPropose{value}` (§4.9's "emit UcPropose{value}" bootstrap step), and starts the
    /// two background threads described above.
    pub fn start(
        me: ProcessId,
        system_id: SystemId,
        membership: Vec<ProcessId>,
        value: Value,
        net: Arc<dyn NetHandle>,
        hub: Arc<dyn HubHandle>,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(me.clone(), system_id, membership.clone(), net);

        let shared_delay_ms = Arc::new(AtomicU64::new(DEFAULT_DELTA_MS));
        dispatcher.register(Box::new(pl::PerfectLink::new()));
        dispatcher.register(Box::new(epfd::EventuallyPerfectFailureDetector::new(
            &membership,
            Arc::clone(&shared_delay_ms),
        )));
        let startup_leader = eld::argmax_rank(membership.iter()).unwrap_or_else(|| me.clone());
        dispatcher.register(Box::new(eld::EventualLeaderDetector::new(
            membership.clone(),
            startup_leader.clone(),
        )));
        dispatcher.register(Box::new(beb::BestEffortBroadcast::new()));
        dispatcher.register(Box::new(ec::EpochChange::new(&membership, &me)));
        dispatcher.register(Box::new(uc::UniformConsensus::new(&membership)));
        dispatcher.register(Box::new(app::Application::new(system_id, hub)));

        // ELD's rule (§4.5) is `trusted = argmax rank over (membership \ suspected)`, evaluated
        // the instant `suspected` changes. At construction `suspected` is empty, so the rule's
        // answer is already `startup_leader` — but nothing re-evaluates it until the first
        // suspicion toggle. Without this, EC (whose own `trusted` starts at min-rank per §4.6)
        // never learns who the real leader is until a failure happens to flip ELD's state, so a
        // fully healthy run would never start an epoch. Seed the EldTrust the rule would have
        // produced had it run once at t=0.
        dispatcher.push(Message::EldTrust(EldTrust {
            process: startup_leader,
        }));
        dispatcher.push(Message::UcPropose(UcPropose { value }));

        let dispatcher = Arc::new(Mutex::new(dispatcher));
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatch_thread = {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let made_progress = dispatcher.lock().unwrap().step();
                    if !made_progress {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
            })
        };

        let epfd_thread = {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = Arc::clone(&shutdown);
            let shared_delay_ms = Arc::clone(&shared_delay_ms);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let delay = shared_delay_ms.load(Ordering::SeqCst).max(1);
                    std::thread::sleep(Duration::from_millis(delay));
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    dispatcher.lock().unwrap().push(Message::EpfdTimeout(EpfdTimeout {}));
                }
            })
        };

        Self {
            dispatcher,
            shared_delay_ms,
            shutdown,
            dispatch_thread: Some(dispatch_thread),
            epfd_thread: Some(epfd_thread),
        }
    }

    /// Pushes a message onto this instance's queue. The only entry point the network listener
    /// thread uses to hand off an inbound `PlDeliver` (§5).
    pub fn push(&self, message: Message) {
        self.dispatcher.lock().unwrap().push(message);
    }

    /// The failure detector's current adaptive delay, exposed for observability and for tests of
    /// §8 property 8 (EPFD adaptivity).
    pub fn current_epfd_delay_ms(&self) -> u64 {
        self.shared_delay_ms.load(Ordering::SeqCst)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.dispatch_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.epfd_thread.take() {
            let _ = handle.join();
        }
    }
}
