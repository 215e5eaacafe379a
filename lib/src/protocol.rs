//! Length-prefixed JSON-over-TCP peer protocol.
//!
//! Each connection gets a dedicated reader thread and a writer thread; the
//! writer drains an `mpsc` channel so callers never block on a slow peer's
//! socket.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

use crate::block::Block;
use crate::chainbuilder::{EventKind, EventQueue, Priority, SharedHead};
use crate::sha256::Hash;
use crate::transaction::Transaction;

/// Fixed socket read/write timeout. A peer that goes silent longer than this
/// is treated as dead rather than left to block a reader/writer thread forever.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// The wire message envelope: `{msg_type, msg_param}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msg_type", content = "msg_param", rename_all = "snake_case")]
pub enum Message {
    Block(Block),
    Transaction(Transaction),
    #[serde(rename = "getblock")]
    GetBlock(String),
    Peer(PeerAddr),
    #[serde(rename = "myport")]
    MyPort(u16),
    Id(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

/// Builds the fixed 40-byte handshake banner: `bl0ckch41n` + 30 hex chars of
/// the genesis block hash, so peers on incompatible networks reject each
/// other before exchanging a single real message.
pub fn handshake_banner(genesis_hash: &Hash) -> Vec<u8> {
    let hex = genesis_hash.to_hex();
    let mut banner = format!("{}{}", crate::config::HANDSHAKE_PREFIX, &hex[..30]).into_bytes();
    banner.push(b'\n');
    banner
}

pub fn verify_handshake_banner(received: &[u8], genesis_hash: &Hash) -> bool {
    received == handshake_banner(genesis_hash).as_slice()
}

/// Writes one length-prefixed JSON frame: ASCII length, `\n`, then the
/// UTF-8 JSON payload.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> io::Result<()> {
    let payload = serde_json::to_vec(message)?;
    writeln!(writer, "{}", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Reads exactly one length-prefixed JSON frame.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Message> {
    let mut length_buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        length_buf.push(byte[0]);
    }
    let length: usize = std::str::from_utf8(&length_buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad frame length"))?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Outbound handle for one peer connection: push a message onto its
/// writer-thread queue.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: String,
    outgoing: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn send(&self, message: Message) {
        let _ = self.outgoing.send(message);
    }
}

/// Performs the fixed handshake (banner, listening port, connection id,
/// current head and peer list) then spawns a reader and a writer thread for
/// steady-state traffic. `own_connection_ids` is the set of connection ids
/// this `Network` has itself generated; if a peer ever echoes one back, the
/// connection is to ourselves (e.g. a bootstrap address that loops back to
/// this same node) and both ends are closed.
#[allow(clippy::too_many_arguments)]
pub fn spawn_peer_connection(
    stream: TcpStream,
    addr: String,
    genesis_hash: Hash,
    listen_port: u16,
    shared_head: SharedHead,
    queue: std::sync::Arc<EventQueue>,
    peer_registry: std::sync::Arc<std::sync::Mutex<Vec<PeerHandle>>>,
    own_connection_ids: std::sync::Arc<std::sync::Mutex<HashSet<String>>>,
) -> io::Result<()> {
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    let mut handshake_writer = stream.try_clone()?;
    handshake_writer.write_all(&handshake_banner(&genesis_hash))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut received_banner = vec![0u8; handshake_banner(&genesis_hash).len()];
    reader.read_exact(&mut received_banner)?;
    if !verify_handshake_banner(&received_banner, &genesis_hash) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handshake banner mismatch: incompatible network",
        ));
    }

    let connection_id = Uuid::new_v4().to_string();
    own_connection_ids.lock().unwrap().insert(connection_id.clone());

    let (tx, rx) = mpsc::channel();
    let handle = PeerHandle {
        addr: addr.clone(),
        outgoing: tx.clone(),
    };
    // Announce our listening port, a fresh connection id (for self-connection
    // detection), and our current head.
    tx.send(Message::MyPort(listen_port)).ok();
    tx.send(Message::Id(connection_id)).ok();
    tx.send(Message::Block(shared_head.lock().unwrap().clone())).ok();
    peer_registry.lock().unwrap().push(handle);

    let mut writer_stream = stream.try_clone()?;
    let peer_id = next_peer_id();
    thread::Builder::new()
        .name(format!("peer-writer-{addr}"))
        .spawn(move || {
            while let Ok(message) = rx.recv() {
                if write_frame(&mut writer_stream, &message).is_err() {
                    break;
                }
            }
        })?;

    let reader_queue = queue.clone();
    let reader_registry = peer_registry.clone();
    let reader_addr = addr.clone();
    thread::Builder::new()
        .name(format!("peer-reader-{addr}"))
        .spawn(move || {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader) {
                    Ok(Message::Block(block)) => {
                        tracing::debug!(addr = %reader_addr, height = block.header.height, "received block");
                        reader_queue.push(Priority::Remote, EventKind::Block(block))
                    }
                    Ok(Message::Transaction(tx)) => {
                        reader_queue.push(Priority::Remote, EventKind::Transaction(tx))
                    }
                    Ok(Message::GetBlock(hex)) => {
                        tracing::debug!(addr = %reader_addr, %hex, "received getblock");
                        if let Ok(hash) = Hash::from_hex(&hex) {
                            reader_queue.push(Priority::Remote, EventKind::GetBlock(hash));
                        }
                    }
                    Ok(Message::Id(received_id)) => {
                        if own_connection_ids.lock().unwrap().contains(&received_id) {
                            tracing::warn!(addr = %reader_addr, "closing self-connection");
                            reader_registry.lock().unwrap().retain(|p| p.addr != reader_addr);
                            reader_queue.push(Priority::Remote, EventKind::Disconnected(peer_id));
                            break;
                        }
                    }
                    Ok(Message::Peer(_)) | Ok(Message::MyPort(_)) => {
                        // Gossip/handshake bookkeeping beyond self-connection
                        // detection is not consumed by the chain builder.
                    }
                    Err(_) => {
                        reader_registry.lock().unwrap().retain(|p| p.addr != reader_addr);
                        reader_queue.push(Priority::Remote, EventKind::Disconnected(peer_id));
                        break;
                    }
                }
            }
        })?;

    Ok(())
}

fn next_peer_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Owns the listener and the peer registry for one node, and implements
/// `Broadcaster` so a `ChainBuilder` can push blocks/transactions back out
/// over the wire without knowing anything about sockets.
pub struct Network {
    genesis_hash: Hash,
    listen_port: u16,
    max_peers: usize,
    shared_head: SharedHead,
    queue: std::sync::Arc<EventQueue>,
    peers: std::sync::Arc<std::sync::Mutex<Vec<PeerHandle>>>,
    own_connection_ids: std::sync::Arc<std::sync::Mutex<HashSet<String>>>,
}

impl Network {
    pub fn new(genesis_hash: Hash, listen_port: u16, max_peers: usize, queue: std::sync::Arc<EventQueue>) -> Self {
        Self::with_shared_head(genesis_hash, listen_port, max_peers, queue, crate::chainbuilder::new_shared_head())
    }

    /// Like `new`, but shares the given `SharedHead` cell with a
    /// `ChainBuilder` so handshakes always announce the true current head
    /// instead of a fixed genesis-only view.
    pub fn with_shared_head(
        genesis_hash: Hash,
        listen_port: u16,
        max_peers: usize,
        queue: std::sync::Arc<EventQueue>,
        shared_head: SharedHead,
    ) -> Self {
        Network {
            genesis_hash,
            listen_port,
            max_peers,
            shared_head,
            queue,
            peers: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            own_connection_ids: std::sync::Arc::new(std::sync::Mutex::new(HashSet::new())),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Binds `bind_addr` and spawns a dedicated accept thread; each accepted
    /// connection goes through the fixed handshake before joining the registry.
    pub fn listen(self: &std::sync::Arc<Self>, bind_addr: &str) -> io::Result<()> {
        let listener = std::net::TcpListener::bind(bind_addr)?;
        let this = self.clone();
        thread::Builder::new().name("peer-acceptor".into()).spawn(move || {
            for incoming in listener.incoming() {
                let Ok(stream) = incoming else { continue };
                let addr = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                if this.peer_count() >= this.max_peers {
                    tracing::warn!(%addr, "rejecting incoming connection: max_peers reached");
                    continue;
                }
                this.accept(stream, addr);
            }
        })?;
        Ok(())
    }

    /// Dials an outbound peer at `addr` (e.g. a configured bootstrap peer).
    pub fn connect(self: &std::sync::Arc<Self>, addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(addr)?;
        tracing::debug!(%addr, "dialed bootstrap peer, starting handshake");
        self.accept(stream, addr.to_string());
        Ok(())
    }

    fn accept(self: &std::sync::Arc<Self>, stream: TcpStream, addr: String) {
        let this = self.clone();
        let known_peers: Vec<String> = this.peers.lock().unwrap().iter().map(|p| p.addr.clone()).collect();
        match spawn_peer_connection(
            stream,
            addr.clone(),
            this.genesis_hash,
            this.listen_port,
            this.shared_head.clone(),
            this.queue.clone(),
            this.peers.clone(),
            this.own_connection_ids.clone(),
        ) {
            Ok(()) => {
                tracing::debug!(%addr, "handshake with peer succeeded");
                // Gossip what we already know about to the newcomer, and tell
                // existing peers about the newcomer. We only ever gossip
                // addresses here, never dial one automatically.
                if let Some(handle) = this.peers.lock().unwrap().iter().find(|p| p.addr == addr) {
                    for peer_addr in &known_peers {
                        if let Some((host, port)) = peer_addr.rsplit_once(':') {
                            if let Ok(port) = port.parse() {
                                handle.send(Message::Peer(PeerAddr {
                                    host: host.to_string(),
                                    port,
                                }));
                            }
                        }
                    }
                }
                this.broadcast_peer_addr(&addr);
            }
            Err(err) => tracing::warn!(%addr, %err, "handshake with peer failed"),
        }
    }

    fn broadcast_peer_addr(&self, addr: &str) {
        let Some((host, port)) = addr.rsplit_once(':') else { return };
        let Ok(port) = port.parse() else { return };
        let message = Message::Peer(PeerAddr {
            host: host.to_string(),
            port,
        });
        for peer in self.peers.lock().unwrap().iter() {
            if peer.addr != addr {
                peer.send(message.clone());
            }
        }
    }
}

impl crate::chainbuilder::Broadcaster for Network {
    fn broadcast_block(&self, block: &Block) {
        let message = Message::Block(block.clone());
        for peer in self.peers.lock().unwrap().iter() {
            peer.send(message.clone());
        }
    }

    fn broadcast_transaction(&self, tx: &Transaction) {
        let message = Message::Transaction(tx.clone());
        for peer in self.peers.lock().unwrap().iter() {
            peer.send(message.clone());
        }
    }

    fn request_block(&self, hash: Hash) {
        let message = Message::GetBlock(hash.to_hex());
        for peer in self.peers.lock().unwrap().iter() {
            peer.send(message.clone());
        }
    }
}

/// Lets an `Arc<Network>` (or any `Arc<dyn Broadcaster>`-compatible type) be
/// handed to both a `ChainBuilder` (which wants a `Box<dyn Broadcaster>`) and
/// a `Miner` (which wants an `Arc<dyn Broadcaster>`) from the same instance.
impl<T: crate::chainbuilder::Broadcaster + ?Sized> crate::chainbuilder::Broadcaster for Arc<T> {
    fn broadcast_block(&self, block: &Block) {
        (**self).broadcast_block(block)
    }
    fn broadcast_transaction(&self, tx: &Transaction) {
        (**self).broadcast_transaction(tx)
    }
    fn request_block(&self, hash: Hash) {
        (**self).request_block(hash)
    }
}
