//! The node binary's runtime (§4.9 bootstrap, §6 hub interactions, §10.5 CLI).
//!
//! A node is three long-lived pieces wired together: a peer-listening socket that routes inbound
//! frames to the right [Instance] by system-id, a session held open with the hub that receives
//! `APP_PROPOSE` and sends `APP_REGISTRATION`, and the registry of instances that `APP_PROPOSE`
//! spawns. None of them touch an instance's abstraction state directly — only `Instance::push`
//! does that, keeping every instance single-threaded per §5.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use arrrg_derive::CommandLine;
use consensus_pb::{AppPropose, Error, Message, PlDeliver, ProcessId, SystemId};
use indicio::{clue, ALWAYS};
use zerror_core::ErrorCore;

use crate::instance::Instance;
use crate::metrics::LOGGING;
use crate::net::{self, HubClient, HubHandle, InstanceRouter, TcpNetHandle};

/// Command-line surface for one node: a node-port, the hub's address, and the owner/index pair
/// used at registration — per §6, "no other flags are part of the core."
#[derive(CommandLine, Clone, Debug, Eq, PartialEq)]
pub struct NodeOptions {
    #[arrrg(required, "Port this node listens on for peer connections.", "PORT")]
    pub port: u32,
    #[arrrg(required, "Host of the hub process.", "HOST")]
    pub hub_host: String,
    #[arrrg(required, "Port of the hub process.", "PORT")]
    pub hub_port: u32,
    #[arrrg(required, "Owner name reported at registration.", "OWNER")]
    pub owner: String,
    #[arrrg(optional, "Index reported at registration.", "INDEX")]
    pub index: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            port: 0,
            hub_host: String::new(),
            hub_port: 0,
            owner: String::new(),
            index: 0,
        }
    }
}

fn bootstrap_error(what: String) -> Error {
    clue!(LOGGING, ALWAYS, {
        node: {
            bootstrap_failed: what.clone(),
        },
    });
    Error::BootstrapError {
        core: ErrorCore::default(),
        what,
    }
}

/// Tracks every system-id this node is currently running an [Instance] for, so inbound
/// `NetworkMessage`s can be routed to the right dispatcher (§5's "dedicated per-node listener
/// thread ... identifies the owning instance by system-id").
struct InstanceRegistry {
    instances: Mutex<HashMap<SystemId, Arc<Instance>>>,
}

impl InstanceRegistry {
    fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, system_id: SystemId, instance: Arc<Instance>) {
        self.instances.lock().unwrap().insert(system_id, instance);
    }
}

impl InstanceRouter for InstanceRegistry {
    fn route(&self, system_id: SystemId, sender: ProcessId, message: Message) -> bool {
        let instances = self.instances.lock().unwrap();
        match instances.get(&system_id) {
            Some(instance) => {
                instance.push(Message::PlDeliver(PlDeliver {
                    sender,
                    message: Box::new(message),
                }));
                true
            }
            None => false,
        }
    }
}

/// Runs one node until the hub connection closes or a bootstrap step fails. Per §6: exit code 0
/// on clean shutdown (the hub closed the connection), a [Error::BootstrapError] on I/O bootstrap
/// failure — the caller's `main` is responsible for turning that into a nonzero exit code.
pub fn run(options: NodeOptions) -> Result<(), Error> {
    let me = ProcessId::new(String::new(), options.port, 0);

    let listener = TcpListener::bind(("0.0.0.0", options.port as u16))
        .map_err(|err| bootstrap_error(format!("bind to port {}: {err}", options.port)))?;

    let registry = Arc::new(InstanceRegistry::new());
    let router: Arc<dyn InstanceRouter> = registry.clone() as Arc<dyn InstanceRouter>;
    std::thread::spawn(move || net::serve(listener, router));

    let (hub_client, hub_reader) = HubClient::connect(&options.hub_host, options.hub_port)
        .map_err(|err| bootstrap_error(format!("connect to hub: {err}")))?;
    hub_client
        .register(options.owner.clone(), options.index)
        .map_err(|err| bootstrap_error(format!("register with hub: {err}")))?;
    let hub: Arc<dyn HubHandle> = Arc::new(hub_client);

    let net_handle: Arc<dyn crate::context::NetHandle> = Arc::new(TcpNetHandle::new(me.clone()));

    clue!(LOGGING, ALWAYS, {
        node: {
            started: options.port,
            owner: options.owner.clone(),
        },
    });

    HubClient::recv_loop(hub_reader, move |propose: AppPropose| {
        spawn_instance(me.clone(), propose, Arc::clone(&net_handle), Arc::clone(&hub), &registry);
    });

    Ok(())
}

/// On `AppPropose{systemId, processList, value}`: determine `currentProcess` by matching the
/// node's own port within `processList` (§4.9), then build and start the full stack for that
/// system-id.
fn spawn_instance(
    fallback_me: ProcessId,
    propose: AppPropose,
    net_handle: Arc<dyn crate::context::NetHandle>,
    hub: Arc<dyn HubHandle>,
    registry: &InstanceRegistry,
) {
    let me = propose
        .processes
        .iter()
        .find(|p| p.port == fallback_me.port)
        .cloned()
        .unwrap_or(fallback_me);
    clue!(LOGGING, ALWAYS, {
        node: {
            app_propose: propose.system_id.human_readable(),
            members: propose.processes.len(),
        },
    });
    let instance = Arc::new(Instance::start(
        me,
        propose.system_id,
        propose.processes,
        propose.value,
        net_handle,
        hub,
    ));
    registry.insert(propose.system_id, instance);
}
