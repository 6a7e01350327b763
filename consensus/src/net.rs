//! Plain-TCP transport for perfect links and the hub protocol.
//!
//! The protocol itself only needs point-to-point delivery with the guarantees §4.2 lists — no RPC
//! semantics, no TLS, no service discovery — so this deliberately does not reuse the reference
//! stack's `busyrpc`/`rpc_pb` machinery (built for request/response RPC over SSL). It reuses the
//! same wire idea those crates use (a length-prefixed, `prototk`-encoded frame) at a fraction of
//! the surface area.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use biometrics::Counter;
use buffertk::{stack_pack, Unpackable, Unpacker};
use consensus_pb::{AppDecide, AppRegistration, Message, NetworkMessage, ProcessId, SystemId, Value};
use indicio::{clue, INFO};

use crate::context::NetHandle;
use crate::metrics::LOGGING;

static FRAMES_SENT: Counter = Counter::new("consensus.net.frames_sent");
static FRAMES_SEND_FAILED: Counter = Counter::new("consensus.net.frames_send_failed");
static FRAMES_RECEIVED: Counter = Counter::new("consensus.net.frames_received");
static FRAMES_MALFORMED: Counter = Counter::new("consensus.net.frames_malformed");
static FRAMES_UNROUTABLE: Counter = Counter::new("consensus.net.frames_unroutable");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&FRAMES_SENT);
    collector.register_counter(&FRAMES_SEND_FAILED);
    collector.register_counter(&FRAMES_RECEIVED);
    collector.register_counter(&FRAMES_MALFORMED);
    collector.register_counter(&FRAMES_UNROUTABLE);
}

/// Writes a 4-byte big-endian length prefix followed by `body` to `stream`.
fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Reads one length-prefixed frame from `stream`, or `Ok(None)` on clean EOF between frames.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Resolves inbound `NetworkMessage`s to the `Dispatcher` of the instance they target.
pub trait InstanceRouter: Send + Sync {
    /// Looks up the instance for `system_id` and, if one exists, pushes a `PlDeliver` built from
    /// `sender` and `message` onto its queue.  Returns `false` if no instance with that system-id
    /// is registered (the frame is logged and dropped).
    fn route(&self, system_id: SystemId, sender: ProcessId, message: Message) -> bool;
}

/// Implements [NetHandle] by opening a fresh short-lived `TcpStream` per send, per §4.2's
/// "single TCP connection per send is the reference strategy". The perfect-link abstraction
/// short-circuits sends addressed to the local process before they ever reach this handle (see
/// `abstractions::pl`), so every call here dials a genuinely remote peer.
pub struct TcpNetHandle {
    me: ProcessId,
}

impl TcpNetHandle {
    pub fn new(me: ProcessId) -> Self {
        Self { me }
    }
}

impl NetHandle for TcpNetHandle {
    fn send(&self, system_id: &SystemId, destination: &ProcessId, message: Message) {
        let envelope = NetworkMessage {
            message: Box::new(message),
            sender_host: self.me.host.clone(),
            sender_listening_port: self.me.port,
            abstraction_id: String::new(),
            system_id: *system_id,
        };
        let body = stack_pack(&envelope).to_vec();
        let address = format!("{}:{}", destination.host, destination.port);
        match TcpStream::connect(&address) {
            Ok(mut stream) => match write_frame(&mut stream, &body) {
                Ok(()) => FRAMES_SENT.click(),
                Err(err) => {
                    FRAMES_SEND_FAILED.click();
                    clue!(LOGGING, INFO, {
                        net: {
                            send_failed: address,
                            error: err.to_string(),
                        },
                    });
                }
            },
            Err(err) => {
                FRAMES_SEND_FAILED.click();
                clue!(LOGGING, INFO, {
                    net: {
                        connect_failed: address,
                        error: err.to_string(),
                    },
                });
            }
        }
    }
}

/// Accepts inbound connections on one node's listening port and routes each frame's payload to
/// the instance named by its `system_id`, per §5's "dedicated per-node listener thread".
pub fn serve(listener: TcpListener, router: Arc<dyn InstanceRouter>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(_) => continue,
        };
        let router = Arc::clone(&router);
        std::thread::spawn(move || handle_connection(stream, router));
    }
}

fn handle_connection(mut stream: TcpStream, router: Arc<dyn InstanceRouter>) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(_) => return,
        };
        FRAMES_RECEIVED.click();
        let mut unpacker = Unpacker::new(&frame);
        let envelope: NetworkMessage = match unpacker.unpack() {
            Ok(envelope) => envelope,
            Err(_) => {
                FRAMES_MALFORMED.click();
                continue;
            }
        };
        let sender = ProcessId::new(envelope.sender_host, envelope.sender_listening_port, 0);
        if !router.route(envelope.system_id, sender, *envelope.message) {
            FRAMES_UNROUTABLE.click();
        }
    }
}

/// A [NetHandle] backed by direct channels to each peer's [Dispatcher], used by tests that want
/// to drive several instances deterministically without opening real sockets. Delivery is
/// immediate and in-process, but still produces a `PlDeliver` like a real send would.
pub struct LoopbackNetHandle {
    me: ProcessId,
    peers: std::sync::Mutex<std::collections::HashMap<u32, std::sync::mpsc::Sender<Message>>>,
}

impl LoopbackNetHandle {
    pub fn new(me: ProcessId) -> Self {
        Self {
            me,
            peers: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&self, port: u32, inbox: std::sync::mpsc::Sender<Message>) {
        self.peers.lock().unwrap().insert(port, inbox);
    }
}

impl NetHandle for LoopbackNetHandle {
    fn send(&self, _system_id: &SystemId, destination: &ProcessId, message: Message) {
        let peers = self.peers.lock().unwrap();
        if let Some(inbox) = peers.get(&destination.port) {
            let delivered = Message::PlDeliver(consensus_pb::PlDeliver {
                sender: self.me.clone(),
                message: Box::new(message),
            });
            let _ = inbox.send(delivered);
        }
    }
}

///////////////////////////////////////////// hub protocol //////////////////////////////////////////

/// What the `app` abstraction needs to talk to the hub: forwarding a decision. Kept as a trait so
/// tests can substitute an in-memory hub instead of a real connection.
pub trait HubHandle: Send + Sync {
    fn send_decide(&self, system_id: SystemId, value: Value);
}

/// A single long-lived connection to the hub, used for the whole `APP_REGISTRATION` /
/// `APP_PROPOSE` / `APP_DECIDE` exchange described in §6 — unlike [TcpNetHandle], which opens one
/// connection per perfect-link send, the hub protocol is a session the node holds open for its
/// lifetime.
pub struct HubClient {
    writer: Mutex<TcpStream>,
}

impl HubClient {
    /// Connects to the hub and returns both the client (for sends) and a reader half the caller
    /// drives on its own thread via [`HubClient::recv_loop`].
    pub fn connect(host: &str, port: u32) -> std::io::Result<(Self, TcpStream)> {
        let stream = TcpStream::connect((host, port as u16))?;
        let reader = stream.try_clone()?;
        Ok((
            Self {
                writer: Mutex::new(stream),
            },
            reader,
        ))
    }

    pub fn register(&self, owner: String, index: u32) -> std::io::Result<()> {
        self.send(Message::AppRegistration(AppRegistration { owner, index }))
    }

    fn send(&self, message: Message) -> std::io::Result<()> {
        let body = stack_pack(&message).to_vec();
        let mut stream = self.writer.lock().unwrap();
        write_frame(&mut stream, &body)
    }

    /// Reads `APP_PROPOSE` frames from the hub until the connection closes, calling `on_propose`
    /// for each one. Meant to run on its own thread for the life of the node.
    pub fn recv_loop(mut reader: TcpStream, mut on_propose: impl FnMut(consensus_pb::AppPropose)) {
        loop {
            let frame = match read_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(_) => return,
            };
            let mut unpacker = Unpacker::new(&frame);
            let message: Result<Message, _> = unpacker.unpack();
            match message {
                Ok(Message::AppPropose(propose)) => on_propose(propose),
                Ok(_) | Err(_) => continue,
            }
        }
    }
}

impl HubHandle for HubClient {
    fn send_decide(&self, system_id: SystemId, value: Value) {
        if let Err(err) = self.send(Message::AppDecide(AppDecide { system_id, value })) {
            clue!(LOGGING, INFO, {
                hub: {
                    send_decide_failed: err.to_string(),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use consensus_pb::{EpfdHeartbeatRequest, PlSend};

    use super::*;

    #[test]
    fn a_frame_round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            write_frame(&mut stream, b"hello world").unwrap();
        });
        let (mut server_side, _) = listener.accept().unwrap();
        let frame = read_frame(&mut server_side).unwrap().unwrap();
        assert_eq!(frame, b"hello world");
        client.join().unwrap();
    }

    #[test]
    fn loopback_net_handle_delivers_only_to_registered_peers() {
        let me = ProcessId::new("a", 1, 1);
        let net = LoopbackNetHandle::new(me.clone());
        let (tx, rx) = mpsc::channel();
        net.register(2, tx);

        let unregistered = ProcessId::new("b", 3, 3);
        net.send(
            &SystemId::default(),
            &unregistered,
            Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {}),
        );
        assert!(rx.try_recv().is_err());

        let registered = ProcessId::new("c", 2, 2);
        net.send(
            &SystemId::default(),
            &registered,
            Message::PlSend(PlSend {
                destination: registered.clone(),
                message: Box::new(Message::EpfdHeartbeatRequest(EpfdHeartbeatRequest {})),
            }),
        );
        match rx.recv().unwrap() {
            Message::PlDeliver(deliver) => assert_eq!(deliver.sender.port, me.port),
            other => panic!("expected PlDeliver, got {other:?}"),
        }
    }
}
