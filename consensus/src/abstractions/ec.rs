//! Epoch change (§4.6): turns leader-detector events into monotonically increasing epoch
//! timestamps, with a NACK round-trip so a stale or false leader backs off.

use biometrics::Counter;
use consensus_pb::{EcNack, EcNewEpoch, EcStartEpoch, Message, PlSend};
use indicio::{clue, INFO};

use crate::metrics::LOGGING;
use crate::{Abstraction, Context};

static EPOCHS_PROPOSED: Counter = Counter::new("consensus.ec.epochs_proposed");
static EPOCHS_STARTED: Counter = Counter::new("consensus.ec.epochs_started");
static NACKS_SENT: Counter = Counter::new("consensus.ec.nacks_sent");
static NACKS_RECEIVED: Counter = Counter::new("consensus.ec.nacks_received");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&EPOCHS_PROPOSED);
    collector.register_counter(&EPOCHS_STARTED);
    collector.register_counter(&NACKS_SENT);
    collector.register_counter(&NACKS_RECEIVED);
}

pub struct EpochChange {
    n: u64,
    last_ts: u64,
    ts: u64,
    trusted: consensus_pb::ProcessId,
}

impl EpochChange {
    pub fn new(membership: &[consensus_pb::ProcessId], me: &consensus_pb::ProcessId) -> Self {
        let trusted = membership
            .iter()
            .min_by_key(|p| p.rank)
            .cloned()
            .unwrap_or_else(|| me.clone());
        Self {
            n: membership.len() as u64,
            last_ts: 0,
            ts: me.rank as u64,
            trusted,
        }
    }

    fn propose_epoch(&mut self, ctx: &mut Context) {
        self.ts += self.n;
        EPOCHS_PROPOSED.click();
        ctx.enqueue(Message::BebBroadcast(consensus_pb::BebBroadcast {
            message: Box::new(Message::EcNewEpoch(EcNewEpoch { ets: self.ts })),
        }));
    }
}

impl Abstraction for EpochChange {
    fn name(&self) -> &'static str {
        "ec"
    }

    fn handle(&mut self, ctx: &mut Context, message: &Message) -> bool {
        match message {
            Message::EldTrust(trust) => {
                self.trusted = trust.process.clone();
                if self.trusted.port == ctx.me.port {
                    self.propose_epoch(ctx);
                }
                true
            }
            Message::BebDeliver(deliver) => {
                let Message::EcNewEpoch(new_epoch) = deliver.message.as_ref() else {
                    return false;
                };
                if deliver.sender.port == self.trusted.port && new_epoch.ets > self.last_ts {
                    self.last_ts = new_epoch.ets;
                    EPOCHS_STARTED.click();
                    clue!(LOGGING, INFO, {
                        ec: {
                            start_epoch: new_epoch.ets,
                            leader: deliver.sender.port,
                        },
                    });
                    ctx.enqueue(Message::EcStartEpoch(EcStartEpoch {
                        ets: new_epoch.ets,
                        leader: deliver.sender.clone(),
                    }));
                } else {
                    NACKS_SENT.click();
                    ctx.enqueue(Message::PlSend(PlSend {
                        destination: deliver.sender.clone(),
                        message: Box::new(Message::EcNack(EcNack {})),
                    }));
                }
                true
            }
            Message::PlDeliver(deliver) => {
                if !matches!(deliver.message.as_ref(), Message::EcNack(_)) {
                    return false;
                }
                NACKS_RECEIVED.click();
                if self.trusted.port == ctx.me.port {
                    self.propose_epoch(ctx);
                }
                true
            }
            _ => false,
        }
    }
}
