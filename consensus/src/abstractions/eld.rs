//! Eventual leader detector (§4.5): trusts the highest-rank process not currently suspected.

use std::collections::HashSet;

use biometrics::Counter;
use consensus_pb::{EldTrust, Message, ProcessId};
use indicio::{clue, INFO};

use crate::metrics::LOGGING;
use crate::{Abstraction, Context};

static LEADER_CHANGES: Counter = Counter::new("consensus.eld.leader_changes");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&LEADER_CHANGES);
}

/// The highest-rank member of `candidates`, or `None` if `candidates` is empty. Used both by the
/// running detector and by bootstrap to compute the startup leader over the full membership.
pub fn argmax_rank<'a>(candidates: impl Iterator<Item = &'a ProcessId>) -> Option<ProcessId> {
    candidates.max_by_key(|p| p.rank).cloned()
}

pub struct EventualLeaderDetector {
    membership: Vec<ProcessId>,
    suspected: HashSet<u32>,
    trusted: ProcessId,
}

impl EventualLeaderDetector {
    /// `trusted` should be the value [argmax_rank] over the full membership computed at bootstrap
    /// — see the note in `abstractions::app` on why this crate emits a startup `EldTrust` rather
    /// than leaving every process to wait on the first suspicion toggle.
    pub fn new(membership: Vec<ProcessId>, trusted: ProcessId) -> Self {
        Self {
            membership,
            suspected: HashSet::new(),
            trusted,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = &ProcessId> {
        self.membership
            .iter()
            .filter(move |p| !self.suspected.contains(&p.port))
    }

    fn reevaluate(&mut self, ctx: &mut Context) {
        let candidate = match argmax_rank(self.candidates()) {
            Some(candidate) => candidate,
            // Every process is suspected: keep emitting the previous leader (§4.5 edge case).
            None => return,
        };
        if candidate.rank != self.trusted.rank {
            self.trusted = candidate.clone();
            LEADER_CHANGES.click();
            clue!(LOGGING, INFO, {
                eld: {
                    trust: candidate.port,
                },
            });
            ctx.enqueue(Message::EldTrust(EldTrust { process: candidate }));
        }
    }
}

impl Abstraction for EventualLeaderDetector {
    fn name(&self) -> &'static str {
        "eld"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        match message {
            Message::EpfdSuspect(suspect) => {
                self.suspected.insert(suspect.process.port);
                self.reevaluate(ctx);
                true
            }
            Message::EpfdRestore(restore) => {
                self.suspected.remove(&restore.process.port);
                self.reevaluate(ctx);
                true
            }
            _ => false,
        }
    }
}
