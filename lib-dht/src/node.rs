//! The node: identity, sockets, both DHT instances and the owning loop.
//!
//! One task owns every mutable piece (routing tables, storage, call map,
//! scheduler). Public entry points push a command over a channel and get a
//! oneshot back, completed from the loop, so no state is ever touched from
//! two threads. Operations that span both IP families fan a task out per
//! DHT and aggregate the results before the caller's future resolves.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use lib_crypto::{cryptobox, signature, CryptoBox, Nonce};

use crate::config::NodeConfig;
use crate::constants;
use crate::crypto_cache::CryptoCache;
use crate::dht::Dht;
use crate::error::{codes, Error, Result};
use crate::id::Id;
use crate::lookup_option::LookupOption;
use crate::messages::{Body, LookupRequest, LookupResponse, Message, Request, Response};
use crate::node_info::{is_acceptable_source, Family, NodeInfo};
use crate::peer_info::PeerInfo;
use crate::rpccall::{CallState, RpcCall};
use crate::rpcserver::RpcServer;
use crate::scheduler::Scheduler;
use crate::storage::{DataStorage, MemoryStorage};
use crate::task::announce::{PeerAnnounceTask, ValueAnnounceTask};
use crate::task::node_lookup::NodeLookupTask;
use crate::task::peer_lookup::PeerLookupTask;
use crate::task::ping_refresh::PingRefreshTask;
use crate::task::value_lookup::ValueLookupTask;
use crate::task::{Followup, OpId, TaskKind};
use crate::time::now_millis;
use crate::token_man::TokenManager;
use crate::value::Value;

const FAMILIES: [Family; 2] = [Family::V4, Family::V6];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeStatus {
    Stopped,
    Initializing,
    Running,
}

enum Command {
    FindNode {
        target: Id,
        option: LookupOption,
        tx: oneshot::Sender<Result<Vec<NodeInfo>>>,
    },
    FindValue {
        target: Id,
        option: LookupOption,
        tx: oneshot::Sender<Result<Option<Value>>>,
    },
    StoreValue {
        value: Value,
        persistent: bool,
        tx: oneshot::Sender<Result<()>>,
    },
    FindPeer {
        target: Id,
        expected: usize,
        option: LookupOption,
        tx: oneshot::Sender<Result<Vec<PeerInfo>>>,
    },
    AnnouncePeer {
        peer: PeerInfo,
        persistent: bool,
        tx: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        node: NodeInfo,
        tx: oneshot::Sender<Result<()>>,
    },
    TableEntry {
        target: Id,
        tx: oneshot::Sender<Result<Option<TableEntry>>>,
    },
    Stop {
        tx: oneshot::Sender<()>,
    },
}

/// Snapshot of one routing table entry, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct TableEntry {
    pub node: NodeInfo,
    pub reachable: bool,
    pub failed_requests: i32,
}

#[derive(Clone, Copy, Debug)]
enum JobKind {
    CallTimeout { txid: i32 },
    DhtUpdate,
    CacheSweep,
    StorageExpire,
    Reannounce,
    PersistTables,
}

enum PendingOp {
    FindNode {
        remaining: usize,
        nodes: Vec<NodeInfo>,
        target: Id,
        tx: Option<oneshot::Sender<Result<Vec<NodeInfo>>>>,
    },
    FindValue {
        remaining: usize,
        best: Option<Value>,
        option: LookupOption,
        tx: Option<oneshot::Sender<Result<Option<Value>>>>,
    },
    FindPeer {
        remaining: usize,
        expected: usize,
        peers: Vec<PeerInfo>,
        tx: Option<oneshot::Sender<Result<Vec<PeerInfo>>>>,
    },
    Announce {
        remaining: usize,
        tx: Option<oneshot::Sender<Result<()>>>,
    },
}

enum OpContribution {
    Nodes(Vec<NodeInfo>),
    Value(Option<Value>),
    Peers(Vec<PeerInfo>),
    AnnounceDone,
}

struct Engine {
    id: Id,
    storage: Box<dyn DataStorage>,
    tokens: TokenManager,
    crypto: CryptoCache,
    scheduler: Scheduler<JobKind>,
    server: RpcServer,
    dht4: Option<Dht>,
    dht6: Option<Dht>,

    ops: HashMap<OpId, PendingOp>,
    next_op: OpId,
    bootstrap_txids: HashSet<i32>,

    status_tx: watch::Sender<NodeStatus>,
    running: bool,
}

/// A Kademlia DHT node.
pub struct Node {
    id: Id,
    keypair: signature::KeyPair,
    encryption_keypair: cryptobox::KeyPair,
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<NodeStatus>,
    bound4: Option<SocketAddr>,
    bound6: Option<SocketAddr>,
}

impl Node {
    /// Bind sockets, load or mint the identity, and start the node loop.
    /// Bind and identity failures are fatal.
    pub async fn start(config: NodeConfig) -> Result<Node> {
        Self::start_with_storage(config, Box::new(MemoryStorage::new())).await
    }

    /// Start with a caller-provided storage backend.
    pub async fn start_with_storage(
        config: NodeConfig,
        storage: Box<dyn DataStorage>,
    ) -> Result<Node> {
        let keypair = load_or_create_identity(config.data_dir.as_deref())?;
        let id = Id::from(keypair.public_key());
        let encryption_keypair = cryptobox::KeyPair::from_signature_keypair(&keypair);

        let addr4 = config.addr4.map(|ip| SocketAddr::new(ip, config.port));
        let addr6 = config.addr6.map(|ip| SocketAddr::new(ip, config.port));
        if addr4.is_none() && addr6.is_none() {
            return Err(Error::State("no address families configured"));
        }

        let server = RpcServer::bind(addr4, addr6).await?;
        let bound4 = server.bound_addr(Family::V4);
        let bound6 = server.bound_addr(Family::V6);

        let now = now_millis();
        let mut dht4 = bound4.map(|_| Dht::new(Family::V4, id));
        let mut dht6 = bound6.map(|_| Dht::new(Family::V6, id));
        if let Some(dir) = &config.data_dir {
            if let Some(dht) = dht4.as_mut() {
                dht.set_persist_path(dir.join("dht4.cache"), now);
            }
            if let Some(dht) = dht6.as_mut() {
                dht.set_persist_path(dir.join("dht6.cache"), now);
            }
        }
        for seed in &config.bootstrap {
            let dht = match seed.family() {
                Family::V4 => dht4.as_mut(),
                Family::V6 => dht6.as_mut(),
            };
            if let Some(dht) = dht {
                dht.add_bootstrap(seed.clone());
            }
        }

        let (status_tx, status_rx) = watch::channel(NodeStatus::Initializing);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let engine = Engine {
            id,
            storage,
            tokens: TokenManager::new(),
            crypto: CryptoCache::new(encryption_keypair.clone()),
            scheduler: Scheduler::new(),
            server,
            dht4,
            dht6,
            ops: HashMap::new(),
            next_op: 1,
            bootstrap_txids: HashSet::new(),
            status_tx,
            running: true,
        };

        tokio::spawn(run(engine, cmd_rx));
        info!(%id, ?bound4, ?bound6, "node started");

        Ok(Node {
            id,
            keypair,
            encryption_keypair,
            cmd_tx,
            status_rx,
            bound4,
            bound6,
        })
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bound_addr(&self, family: Family) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.bound4,
            Family::V6 => self.bound6,
        }
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_rx.borrow()
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::State("node is not running"))?;
        rx.await.map_err(|_| Error::State("node stopped"))?
    }

    /// Register a seed node and trigger a bootstrap round.
    pub async fn bootstrap(&self, node: NodeInfo) -> Result<()> {
        self.submit(|tx| Command::Bootstrap { node, tx }).await
    }

    /// The K closest reachable nodes to `target`.
    pub async fn find_node(&self, target: Id, option: LookupOption) -> Result<Vec<NodeInfo>> {
        self.submit(|tx| Command::FindNode { target, option, tx }).await
    }

    pub async fn find_value(&self, target: Id, option: LookupOption) -> Result<Option<Value>> {
        self.submit(|tx| Command::FindValue { target, option, tx }).await
    }

    /// Persist locally, then write to the K closest nodes.
    pub async fn store_value(&self, value: Value) -> Result<()> {
        self.store_value_opts(value, false).await
    }

    pub async fn store_value_opts(&self, value: Value, persistent: bool) -> Result<()> {
        self.submit(|tx| Command::StoreValue {
            value,
            persistent,
            tx,
        })
        .await
    }

    pub async fn find_peer(
        &self,
        target: Id,
        expected: usize,
        option: LookupOption,
    ) -> Result<Vec<PeerInfo>> {
        self.submit(|tx| Command::FindPeer {
            target,
            expected,
            option,
            tx,
        })
        .await
    }

    pub async fn announce_peer(&self, peer: PeerInfo) -> Result<()> {
        self.announce_peer_opts(peer, false).await
    }

    pub async fn announce_peer_opts(&self, peer: PeerInfo, persistent: bool) -> Result<()> {
        self.submit(|tx| Command::AnnouncePeer {
            peer,
            persistent,
            tx,
        })
        .await
    }

    /// The routing table's view of `target`, if it is known.
    pub async fn table_entry(&self, target: Id) -> Result<Option<TableEntry>> {
        self.submit(|tx| Command::TableEntry { target, tx }).await
    }

    /// Sign `data` with the node identity.
    pub fn sign(&self, data: &[u8]) -> [u8; signature::SIGNATURE_BYTES] {
        self.keypair.sign(data)
    }

    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        self.keypair.public_key().verify(data, sig).is_ok()
    }

    /// Box `plain` to `recipient` with the identity keys and the
    /// deterministic pairwise nonce.
    pub fn encrypt_to(&self, recipient: &Id, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = pairwise_nonce(&self.id, recipient);
        let ctx = CryptoBox::new(
            &recipient.to_encryption_key()?,
            self.encryption_keypair.private_key(),
        );
        Ok(ctx.encrypt(plain, &nonce)?)
    }

    pub fn decrypt_from(&self, sender: &Id, cipher: &[u8]) -> Result<Vec<u8>> {
        let nonce = pairwise_nonce(sender, &self.id);
        let ctx = CryptoBox::new(
            &sender.to_encryption_key()?,
            self.encryption_keypair.private_key(),
        );
        Ok(ctx.decrypt(cipher, &nonce)?)
    }

    /// Stop the loop, persisting the routing tables on the way out.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { tx }).await.is_err() {
            return Ok(()); // already stopped
        }
        let _ = rx.await;
        Ok(())
    }
}

fn pairwise_nonce(sender: &Id, recipient: &Id) -> Nonce {
    let digest = lib_crypto::hashing::sha256_multi(&[sender.as_bytes(), recipient.as_bytes()]);
    Nonce::from_bytes(&digest[..lib_crypto::cryptobox::NONCE_BYTES]).expect("digest long enough")
}

fn load_or_create_identity(data_dir: Option<&Path>) -> Result<signature::KeyPair> {
    let Some(dir) = data_dir else {
        return Ok(signature::KeyPair::random());
    };
    fs::create_dir_all(dir).map_err(Error::Network)?;

    let key_path = dir.join("key");
    if key_path.exists() {
        let raw = fs::read(&key_path).map_err(Error::Network)?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::State("corrupt identity key file"))?;
        return Ok(signature::KeyPair::from_seed(&seed));
    }

    let keypair = signature::KeyPair::random();
    fs::write(&key_path, keypair.private_key().as_bytes()).map_err(Error::Network)?;
    // operator-readable id next to the key
    let id = Id::from(keypair.public_key());
    fs::write(dir.join("id"), format!("{}\n", id)).map_err(Error::Network)?;
    Ok(keypair)
}

async fn recv_from(
    sock: &Option<Arc<UdpSocket>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn run(mut engine: Engine, mut cmd_rx: mpsc::Receiver<Command>) {
    let sock4 = engine.server.socket(Family::V4);
    let sock6 = engine.server.socket(Family::V6);
    let mut buf4 = vec![0u8; 65_536];
    let mut buf6 = vec![0u8; 65_536];

    let now = now_millis();
    engine
        .scheduler
        .add(now + constants::DHT_UPDATE_INTERVAL, JobKind::DhtUpdate);
    engine.scheduler.add(
        now + constants::CRYPTO_CACHE_EXPIRE_CHECK_INTERVAL,
        JobKind::CacheSweep,
    );
    engine
        .scheduler
        .add(now + constants::STORAGE_EXPIRE_INTERVAL, JobKind::StorageExpire);
    engine
        .scheduler
        .add(now + constants::STORAGE_EXPIRE_INTERVAL, JobKind::Reannounce);
    engine.scheduler.add(
        now + constants::ROUTING_TABLE_PERSIST_INTERVAL,
        JobKind::PersistTables,
    );

    let _ = engine.status_tx.send(NodeStatus::Running);

    // contact the configured seeds right away
    for family in FAMILIES {
        engine.start_bootstrap_round(family, true).await;
    }

    while engine.running {
        let now = now_millis();
        let sleep_for = engine
            .scheduler
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
            .unwrap_or(60_000);

        tokio::select! {
            maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                Some(cmd) => engine.handle_command(cmd).await,
                None => break,
            },
            recv = recv_from(&sock4, &mut buf4) => {
                if let Ok((len, from)) = recv {
                    engine.on_datagram(Family::V4, from, &buf4[..len]).await;
                }
            }
            recv = recv_from(&sock6, &mut buf6) => {
                if let Ok((len, from)) = recv {
                    engine.on_datagram(Family::V6, from, &buf6[..len]).await;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(sleep_for)) => {
                engine.run_jobs().await;
            }
        }
    }

    engine.shutdown().await;
}

impl Engine {
    fn dht_mut(&mut self, family: Family) -> Option<&mut Dht> {
        match family {
            Family::V4 => self.dht4.as_mut(),
            Family::V6 => self.dht6.as_mut(),
        }
    }

    fn dht_count(&self) -> usize {
        self.dht4.is_some() as usize + self.dht6.is_some() as usize
    }

    fn new_op(&mut self, op: PendingOp) -> OpId {
        let id = self.next_op;
        self.next_op += 1;
        self.ops.insert(id, op);
        id
    }

    async fn send_response(&mut self, to: Id, to_addr: SocketAddr, msg: Message) {
        let self_id = self.id;
        let now = now_millis();
        if let Err(e) = self
            .server
            .send_message(&mut self.crypto, &self_id, &to, &to_addr, &msg, now)
            .await
        {
            debug!(to = %to_addr, error = %e, "failed to send response");
        }
    }

    async fn on_datagram(&mut self, family: Family, from: SocketAddr, data: &[u8]) {
        let self_id = self.id;
        let now = now_millis();
        let (sender, message) =
            match self
                .server
                .decrypt_datagram(&mut self.crypto, &self_id, data, now)
            {
                Ok(parsed) => parsed,
                Err(e) => {
                    // crypto or parse failure: drop, never reply
                    debug!(%from, error = %e, "dropping undecodable datagram");
                    return;
                }
            };

        if sender == self.id {
            return;
        }

        debug!(%from, %sender, "received {}", message);
        let version = message.version;
        let txid = message.txid;

        match message.body {
            Body::Request(request) => {
                if txid == 0 {
                    let err = Message::error(0, codes::PROTOCOL_ERROR, "invalid transaction id");
                    self.send_response(sender, from, err).await;
                    return;
                }
                let reply = self.build_reply(family, &sender, &from, txid, request, now);
                match reply {
                    Ok(msg) => self.send_response(sender, from, msg).await,
                    Err((code, text)) => {
                        let err = Message::error(txid, code, text);
                        self.send_response(sender, from, err).await;
                    }
                }
                self.apply_received(family, sender, from, version, None).await;
            }
            Body::Response(response) => {
                self.on_response(family, sender, from, txid, version, response)
                    .await;
            }
            Body::Error(error) => {
                warn!(%from, code = error.code, message = %error.message, txid, "error reply");
                let matches = self
                    .server
                    .call(txid)
                    .map(|call| call.matches_id(&sender) && call.matches_addr(&from))
                    .unwrap_or(false);
                if matches {
                    let mut call = self.server.take_call(txid).expect("checked");
                    call.failed();
                    if let Some(task) = call.task() {
                        if let Some(dht) = self.dht_mut(family) {
                            dht.task_man.on_call_lost(task);
                        }
                    }
                    self.check_bootstrap_call(family, txid).await;
                }
                self.drive_tasks().await;
            }
        }
    }

    /// Build the reply for a request, or the error to send instead.
    fn build_reply(
        &mut self,
        family: Family,
        sender: &Id,
        from: &SocketAddr,
        txid: i32,
        request: Request,
        now: u64,
    ) -> std::result::Result<Message, (i32, String)> {
        match request {
            Request::Ping => Ok(Message::response(txid, Response::Ping)),
            Request::FindNode(lookup) => {
                let closer = self.closer_nodes(&lookup, now, sender, from, false);
                Ok(Message::response(txid, Response::FindNode(closer)))
            }
            Request::FindValue { lookup, seq } => {
                let mut closer = self.closer_nodes(&lookup, now, sender, from, true);
                let value = self.storage.get_value(&lookup.target).filter(|value| {
                    seq < 0 || value.sequence_number() < 0 || seq <= value.sequence_number()
                });
                if value.is_some() {
                    closer.nodes4.clear();
                    closer.nodes6.clear();
                }
                Ok(Message::response(
                    txid,
                    Response::FindValue {
                        lookup: closer,
                        value,
                    },
                ))
            }
            Request::StoreValue {
                token,
                value,
                expected_seq,
            } => {
                let value_id = value.id();
                if !self
                    .tokens
                    .verify_token(token, sender, from, &value_id, now)
                {
                    return Err((
                        codes::PROTOCOL_ERROR,
                        "invalid token for STORE VALUE request".into(),
                    ));
                }
                if !value.is_valid() {
                    return Err((codes::PROTOCOL_ERROR, "invalid value".into()));
                }
                self.storage
                    .put_value(value, expected_seq, false, false, now)
                    .map_err(|e| (e.wire_code(), e.to_string()))?;
                Ok(Message::response(txid, Response::StoreValue))
            }
            Request::FindPeer(lookup) => {
                let mut closer = self.closer_nodes(&lookup, now, sender, from, true);
                let peers = self
                    .storage
                    .get_peers(&lookup.target, constants::MAX_PEERS_PER_RESPONSE);
                let (mut peers4, mut peers6) = (Vec::new(), Vec::new());
                if !peers.is_empty() {
                    closer.nodes4.clear();
                    closer.nodes6.clear();
                    match family {
                        Family::V4 => peers4 = peers,
                        Family::V6 => peers6 = peers,
                    }
                }
                Ok(Message::response(
                    txid,
                    Response::FindPeer {
                        lookup: closer,
                        peers4,
                        peers6,
                    },
                ))
            }
            Request::AnnouncePeer { token, peer } => {
                if !is_acceptable_source(from) {
                    return Err((codes::PROTOCOL_ERROR, "bogon source address".into()));
                }
                if !self.tokens.verify_token(token, sender, from, peer.id(), now) {
                    return Err((
                        codes::PROTOCOL_ERROR,
                        "invalid token for ANNOUNCE PEER request".into(),
                    ));
                }
                // the announcer is the origin; re-bind and check the signature
                let peer = PeerInfo::of(
                    *peer.id(),
                    *peer.node_id(),
                    Some(*sender),
                    peer.port(),
                    peer.alternative_url().map(str::to_owned),
                    peer.signature().to_vec(),
                );
                if !peer.is_valid() {
                    return Err((codes::PROTOCOL_ERROR, "invalid peer announcement".into()));
                }
                self.storage.put_peer(peer, false, false, now);
                Ok(Message::response(txid, Response::AnnouncePeer))
            }
        }
    }

    /// The n4/n6 sections of a lookup response, plus a token if wanted.
    fn closer_nodes(
        &mut self,
        lookup: &LookupRequest,
        now: u64,
        sender: &Id,
        from: &SocketAddr,
        force_token: bool,
    ) -> LookupResponse {
        let mut out = LookupResponse::default();
        if lookup.want4 {
            if let Some(dht) = &self.dht4 {
                out.nodes4 = dht
                    .routing_table
                    .closest_nodes(&lookup.target, constants::MAX_ENTRIES_PER_BUCKET);
            }
        }
        if lookup.want6 {
            if let Some(dht) = &self.dht6 {
                out.nodes6 = dht
                    .routing_table
                    .closest_nodes(&lookup.target, constants::MAX_ENTRIES_PER_BUCKET);
            }
        }
        if force_token || lookup.want_token {
            out.token = self.tokens.generate_token(sender, from, &lookup.target, now);
        }
        out
    }

    async fn on_response(
        &mut self,
        family: Family,
        sender: Id,
        from: SocketAddr,
        txid: i32,
        version: u32,
        response: Response,
    ) {
        if txid == 0 {
            let err = Message::error(0, codes::PROTOCOL_ERROR, "invalid transaction id");
            self.send_response(sender, from, err).await;
            return;
        }

        let matches = match self.server.call(txid) {
            Some(call) => call.matches_id(&sender) && call.matches_addr(&from),
            None => false,
        };
        if !matches {
            warn!(%from, txid, "response does not match an outstanding call");
            // v6 multihoming produces honest mismatches worth diagnosing
            if family == Family::V6 && self.server.call(txid).is_some() {
                let err = Message::error(txid, codes::PROTOCOL_ERROR, "socket address mismatch");
                self.send_response(sender, from, err).await;
            }
            return;
        }

        let mut call = self.server.take_call(txid).expect("matched above");
        let now = now_millis();
        call.responded(now);
        self.server.on_valid_response(family, now);

        self.apply_received(family, sender, from, version, Some(&call)).await;

        if let Some(task) = call.task() {
            let responder = call.target().clone();
            let self_id = self.id;
            if let Some(dht) = self.dht_mut(family) {
                dht.task_man
                    .on_call_responded(task, &self_id, &responder, &response);
            }
        }
        self.check_bootstrap_call(family, txid).await;
        self.drive_tasks().await;
    }

    /// Route a verified sighting into the family's routing table and act on
    /// whatever the table wants done.
    async fn apply_received(
        &mut self,
        family: Family,
        sender: Id,
        from: SocketAddr,
        version: u32,
        call: Option<&RpcCall>,
    ) {
        if !is_acceptable_source(&from) {
            debug!(%from, "ignoring bogon source for routing table");
            return;
        }
        let now = now_millis();
        let actions = match self.dht_mut(family) {
            Some(dht) => dht.received(&sender, &from, version, call, now),
            None => return,
        };

        if let Some(node) = actions.verify {
            self.send_plain_call(family, node, Request::Ping).await;
        }
        if !actions.check_bucket.is_empty() {
            if let Some(dht) = self.dht_mut(family) {
                dht.task_man.add(
                    "bucket check after id change",
                    TaskKind::PingRefresh(PingRefreshTask::new(actions.check_bucket)),
                );
            }
        }
    }

    /// Send a call that belongs to no task (verification pings, bootstrap).
    async fn send_plain_call(&mut self, family: Family, target: NodeInfo, request: Request) -> Option<i32> {
        let self_id = self.id;
        let now = now_millis();
        let target_id = *target.id();
        let call = RpcCall::new(target, Message::request(request));
        match self
            .server
            .send_call(&mut self.crypto, &self_id, call, now)
            .await
        {
            Ok(txid) => {
                self.scheduler.add(
                    now + constants::RPC_CALL_TIMEOUT_BASE,
                    JobKind::CallTimeout { txid },
                );
                if let Some(dht) = self.dht_mut(family) {
                    dht.on_send(&target_id, now);
                }
                Some(txid)
            }
            Err(e) => {
                debug!(error = %e, "failed to send call");
                None
            }
        }
    }

    async fn start_bootstrap_round(&mut self, family: Family, force: bool) {
        let now = now_millis();
        let seeds = match self.dht_mut(family) {
            Some(dht) => dht.start_bootstrap(now, force),
            None => return,
        };
        if seeds.is_empty() {
            return;
        }
        let target = self.id;
        for seed in seeds {
            let request = Request::FindNode(LookupRequest::new(
                target,
                family == Family::V4,
                family == Family::V6,
            ));
            match self.send_plain_call(family, seed, request).await {
                Some(txid) => {
                    self.bootstrap_txids.insert(txid);
                }
                None => {
                    let round_over = self
                        .dht_mut(family)
                        .map(|dht| dht.bootstrap_call_done())
                        .unwrap_or(false);
                    if round_over {
                        self.fill_home_bucket(family).await;
                    }
                }
            }
        }
    }

    /// A bootstrap call reached a terminal state; finish the round when it
    /// was the last one out.
    async fn check_bootstrap_call(&mut self, family: Family, txid: i32) {
        if !self.bootstrap_txids.remove(&txid) {
            return;
        }
        let round_over = match self.dht_mut(family) {
            Some(dht) => dht.bootstrap_call_done(),
            None => false,
        };
        if round_over {
            self.fill_home_bucket(family).await;
        }
    }

    async fn fill_home_bucket(&mut self, family: Family) {
        let self_id = self.id;
        let seed = match self.dht_mut(family) {
            Some(dht) => dht
                .routing_table
                .closest_entries(&self_id, constants::MAX_ENTRIES_PER_BUCKET * 2),
            None => return,
        };
        if seed.is_empty() {
            return;
        }
        let mut task = NodeLookupTask::new(self_id, family, LookupOption::Conservative);
        task.lookup.add_candidates(&self_id, &seed);
        if let Some(dht) = self.dht_mut(family) {
            dht.task_man
                .add("bootstrap: fill home bucket", TaskKind::NodeLookup(task));
        }
        self.drive_tasks().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        let now = now_millis();
        match cmd {
            Command::Bootstrap { node, tx } => {
                let family = node.family();
                let added = match self.dht_mut(family) {
                    Some(dht) => {
                        dht.add_bootstrap(node);
                        true
                    }
                    None => false,
                };
                if added {
                    self.start_bootstrap_round(family, true).await;
                    let _ = tx.send(Ok(()));
                } else {
                    let _ = tx.send(Err(Error::State("no DHT for that address family")));
                }
            }
            Command::FindNode { target, option, tx } => {
                let op = self.new_op(PendingOp::FindNode {
                    remaining: self.dht_count(),
                    nodes: Vec::new(),
                    target,
                    tx: Some(tx),
                });
                self.start_lookups(op, |family, op| {
                    TaskKind::NodeLookup(NodeLookupTask::new(target, family, option).with_op(op))
                })
                .await;
            }
            Command::FindValue { target, option, tx } => {
                if option.local_first() {
                    if let Some(value) = self.storage.get_value(&target) {
                        let _ = tx.send(Ok(Some(value)));
                        return;
                    }
                }
                let op = self.new_op(PendingOp::FindValue {
                    remaining: self.dht_count(),
                    best: None,
                    option,
                    tx: Some(tx),
                });
                self.start_lookups(op, |family, op| {
                    TaskKind::ValueLookup(ValueLookupTask::new(target, family, option).with_op(op))
                })
                .await;
            }
            Command::StoreValue {
                value,
                persistent,
                tx,
            } => {
                if !value.is_valid() {
                    let _ = tx.send(Err(Error::Value("invalid value".into())));
                    return;
                }
                // local persistence comes first; the network write is
                // best-effort on top
                if let Err(e) = self
                    .storage
                    .put_value(value.clone(), -1, persistent, true, now)
                {
                    let _ = tx.send(Err(e));
                    return;
                }
                let target = value.id();
                let op = self.new_op(PendingOp::Announce {
                    remaining: self.dht_count(),
                    tx: Some(tx),
                });
                self.start_lookups(op, |family, op| {
                    TaskKind::NodeLookup(
                        NodeLookupTask::new(target, family, LookupOption::Conservative)
                            .with_op(op)
                            .with_followup(Followup::StoreValue(value.clone())),
                    )
                })
                .await;
            }
            Command::FindPeer {
                target,
                expected,
                option,
                tx,
            } => {
                if option.local_first() {
                    let local = self
                        .storage
                        .get_peers(&target, expected.max(constants::MAX_PEERS_PER_RESPONSE));
                    if !local.is_empty() && (expected == 0 || local.len() >= expected) {
                        let _ = tx.send(Ok(local));
                        return;
                    }
                }
                let op = self.new_op(PendingOp::FindPeer {
                    remaining: self.dht_count(),
                    expected,
                    peers: Vec::new(),
                    tx: Some(tx),
                });
                self.start_lookups(op, |family, op| {
                    TaskKind::PeerLookup(
                        PeerLookupTask::new(target, family, option, expected).with_op(op),
                    )
                })
                .await;
            }
            Command::AnnouncePeer {
                peer,
                persistent,
                tx,
            } => {
                if !peer.is_valid() {
                    let _ = tx.send(Err(Error::Value("invalid peer".into())));
                    return;
                }
                self.storage.put_peer(peer.clone(), persistent, true, now);
                let target = *peer.id();
                let op = self.new_op(PendingOp::Announce {
                    remaining: self.dht_count(),
                    tx: Some(tx),
                });
                self.start_lookups(op, |family, op| {
                    TaskKind::NodeLookup(
                        NodeLookupTask::new(target, family, LookupOption::Conservative)
                            .with_op(op)
                            .with_followup(Followup::AnnouncePeer(peer.clone())),
                    )
                })
                .await;
            }
            Command::TableEntry { target, tx } => {
                let mut found = None;
                for family in FAMILIES {
                    let Some(dht) = self.dht_mut(family) else {
                        continue;
                    };
                    if let Some(entry) = dht.routing_table.entry(&target) {
                        found = Some(TableEntry {
                            node: entry.node().clone(),
                            reachable: entry.is_reachable(),
                            failed_requests: entry.failed_requests(),
                        });
                        break;
                    }
                }
                let _ = tx.send(Ok(found));
            }
            Command::Stop { tx } => {
                self.running = false;
                let _ = tx.send(());
            }
        }
    }

    /// Start one task per live DHT, seeded from its routing table.
    async fn start_lookups(&mut self, op: OpId, mut make: impl FnMut(Family, OpId) -> TaskKind) {
        let self_id = self.id;
        for family in FAMILIES {
            let Some(dht) = self.dht_mut(family) else {
                continue;
            };
            let mut kind = make(family, op);
            let seed_target = match &kind {
                TaskKind::NodeLookup(t) => t.lookup.target,
                TaskKind::ValueLookup(t) => t.lookup.target,
                TaskKind::PeerLookup(t) => t.lookup.target,
                _ => self_id,
            };
            let seed = dht
                .routing_table
                .closest_entries(&seed_target, constants::MAX_ENTRIES_PER_BUCKET * 2);
            match &mut kind {
                TaskKind::NodeLookup(t) => t.lookup.add_candidates(&self_id, &seed),
                TaskKind::ValueLookup(t) => t.lookup.add_candidates(&self_id, &seed),
                TaskKind::PeerLookup(t) => t.lookup.add_candidates(&self_id, &seed),
                _ => {}
            }
            let name = format!("{} {}", kind.type_name(), seed_target);
            dht.task_man.add(name, kind);
        }
        self.drive_tasks().await;
    }

    /// Poll tasks, send their requests, reap finished ones. Runs a few
    /// rounds so a lookup finishing can start its announce immediately.
    async fn drive_tasks(&mut self) {
        for _ in 0..4 {
            let mut progressed = false;
            for family in FAMILIES {
                let requests = match self.dht_mut(family) {
                    Some(dht) => dht.task_man.poll(),
                    None => continue,
                };
                for outgoing in requests {
                    progressed = true;
                    let self_id = self.id;
                    let now = now_millis();
                    let target_id = *outgoing.target.id();
                    let call = RpcCall::new(outgoing.target, Message::request(outgoing.request))
                        .with_task(outgoing.task);
                    match self
                        .server
                        .send_call(&mut self.crypto, &self_id, call, now)
                        .await
                    {
                        Ok(txid) => {
                            self.scheduler.add(
                                now + constants::RPC_CALL_TIMEOUT_BASE,
                                JobKind::CallTimeout { txid },
                            );
                            if let Some(dht) = self.dht_mut(family) {
                                dht.on_send(&target_id, now);
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "task call send failed");
                            if let Some(dht) = self.dht_mut(family) {
                                dht.task_man.on_call_lost(outgoing.task);
                            }
                        }
                    }
                }
                if self.finish_tasks(family) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Reap finished tasks for one family. Returns true when any finished.
    fn finish_tasks(&mut self, family: Family) -> bool {
        let finished = match self.dht_mut(family) {
            Some(dht) => dht.task_man.take_finished(),
            None => return false,
        };
        let any = !finished.is_empty();

        for task in finished {
            // late responses for this task are no longer wanted
            self.server.cancel_calls_for_task(task.id);

            match task.kind {
                TaskKind::NodeLookup(t) => {
                    let closest = t.closest_set();
                    match t.followup {
                        Some(followup) => {
                            if closest.is_empty() {
                                // nowhere to write; local persistence already
                                // happened, count the branch as done
                                if let Some(op) = t.op {
                                    self.op_part_done(op, OpContribution::AnnounceDone);
                                }
                                continue;
                            }
                            let kind = match followup {
                                Followup::StoreValue(value) => {
                                    let mut announce = ValueAnnounceTask::new(closest, value);
                                    if let Some(op) = t.op {
                                        announce = announce.with_op(op);
                                    }
                                    TaskKind::ValueAnnounce(announce)
                                }
                                Followup::AnnouncePeer(peer) => {
                                    let mut announce = PeerAnnounceTask::new(closest, peer);
                                    if let Some(op) = t.op {
                                        announce = announce.with_op(op);
                                    }
                                    TaskKind::PeerAnnounce(announce)
                                }
                            };
                            if let Some(dht) = self.dht_mut(family) {
                                dht.task_man.add(task.name, kind);
                            }
                        }
                        None => {
                            if let Some(op) = t.op {
                                self.op_part_done(
                                    op,
                                    OpContribution::Nodes(t.lookup.closest_nodes()),
                                );
                            }
                        }
                    }
                }
                TaskKind::ValueLookup(mut t) => {
                    if let Some(op) = t.op {
                        self.op_part_done(op, OpContribution::Value(t.take_found()));
                    }
                }
                TaskKind::PeerLookup(mut t) => {
                    if let Some(op) = t.op {
                        self.op_part_done(op, OpContribution::Peers(t.take_found()));
                    }
                }
                TaskKind::ValueAnnounce(t) => {
                    if let Some(op) = t.op {
                        self.op_part_done(op, OpContribution::AnnounceDone);
                    }
                }
                TaskKind::PeerAnnounce(t) => {
                    if let Some(op) = t.op {
                        self.op_part_done(op, OpContribution::AnnounceDone);
                    }
                }
                TaskKind::PingRefresh(_) => {}
            }
        }
        any
    }

    /// Merge one task's outcome into its user operation; resolve the future
    /// when the last branch lands (or a first-hit option is satisfied).
    fn op_part_done(&mut self, op: OpId, contribution: OpContribution) {
        let Some(pending) = self.ops.get_mut(&op) else {
            return;
        };
        let complete = match (pending, contribution) {
            (
                PendingOp::FindNode {
                    remaining,
                    nodes,
                    target,
                    ..
                },
                OpContribution::Nodes(more),
            ) => {
                for node in more {
                    if !nodes.iter().any(|n| n.id() == node.id()) {
                        nodes.push(node);
                    }
                }
                let target = *target;
                nodes.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
                *remaining -= 1;
                *remaining == 0
            }
            (
                PendingOp::FindValue {
                    remaining,
                    best,
                    option,
                    ..
                },
                OpContribution::Value(found),
            ) => {
                if let Some(found) = found {
                    let better = match best {
                        Some(existing) => {
                            found.sequence_number() > existing.sequence_number()
                        }
                        None => true,
                    };
                    if better {
                        *best = Some(found);
                    }
                }
                *remaining -= 1;
                *remaining == 0 || (best.is_some() && option.stop_on_first_hit())
            }
            (
                PendingOp::FindPeer {
                    remaining,
                    expected,
                    peers,
                    ..
                },
                OpContribution::Peers(more),
            ) => {
                for peer in more {
                    if !peers
                        .iter()
                        .any(|p| p.node_id() == peer.node_id() && p.origin() == peer.origin())
                    {
                        peers.push(peer);
                    }
                }
                *remaining -= 1;
                *remaining == 0 || (*expected > 0 && peers.len() >= *expected)
            }
            (PendingOp::Announce { remaining, .. }, OpContribution::AnnounceDone) => {
                *remaining -= 1;
                *remaining == 0
            }
            _ => {
                warn!(op, "mismatched operation contribution");
                false
            }
        };

        if complete {
            if let Some(pending) = self.ops.remove(&op) {
                match pending {
                    PendingOp::FindNode { nodes, tx, .. } => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(nodes));
                        }
                    }
                    PendingOp::FindValue { best, tx, .. } => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(best));
                        }
                    }
                    PendingOp::FindPeer { peers, tx, .. } => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(peers));
                        }
                    }
                    PendingOp::Announce { tx, .. } => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
            }
        }
    }

    async fn run_jobs(&mut self) {
        loop {
            let now = now_millis();
            let Some(job) = self.scheduler.pop_expired(now) else {
                break;
            };
            match job {
                JobKind::CallTimeout { txid } => self.on_call_deadline(txid).await,
                JobKind::DhtUpdate => {
                    self.dht_update().await;
                    self.scheduler
                        .add(now + constants::DHT_UPDATE_INTERVAL, JobKind::DhtUpdate);
                }
                JobKind::CacheSweep => {
                    self.crypto.sweep(now);
                    self.scheduler.add(
                        now + constants::CRYPTO_CACHE_EXPIRE_CHECK_INTERVAL,
                        JobKind::CacheSweep,
                    );
                }
                JobKind::StorageExpire => {
                    self.storage.expire(now);
                    self.scheduler
                        .add(now + constants::STORAGE_EXPIRE_INTERVAL, JobKind::StorageExpire);
                }
                JobKind::Reannounce => {
                    self.reannounce_persistent(now).await;
                    self.scheduler
                        .add(now + constants::STORAGE_EXPIRE_INTERVAL, JobKind::Reannounce);
                }
                JobKind::PersistTables => {
                    for family in FAMILIES {
                        if let Some(dht) = self.dht_mut(family) {
                            dht.persist(now, false);
                        }
                    }
                    self.scheduler.add(
                        now + constants::ROUTING_TABLE_PERSIST_INTERVAL,
                        JobKind::PersistTables,
                    );
                }
            }
        }
    }

    /// A call's deadline fired: stall it once, then time it out for good.
    async fn on_call_deadline(&mut self, txid: i32) {
        let now = now_millis();
        let (stall, family, task) = match self.server.call(txid) {
            None => return,
            Some(call) => {
                let elapsed = now.saturating_sub(call.sent_at());
                let family = Family::of(call.target().addr());
                (
                    call.state() == CallState::Sent
                        && elapsed < constants::RPC_CALL_TIMEOUT_MAX,
                    family,
                    call.task(),
                )
            }
        };

        if stall {
            let sent_at = {
                let call = self.server.call_mut(txid).expect("present");
                call.stalled();
                call.sent_at()
            };
            // a stalled call frees its lookup slot early
            if let Some(task) = task {
                if let Some(dht) = self.dht_mut(family) {
                    dht.task_man.on_call_lost(task);
                }
            }
            self.scheduler.add(
                sent_at + constants::RPC_CALL_TIMEOUT_MAX,
                JobKind::CallTimeout { txid },
            );
            self.drive_tasks().await;
            return;
        }

        let Some(mut call) = self.server.take_call(txid) else {
            return;
        };
        let was_stalled = call.state() == CallState::Stalled;
        call.timed_out();
        debug!(txid, target = %call.target(), "call timed out");

        // when our own socket looks dead, peers should not be punished
        if self.server.is_reachable(family) {
            let target_id = *call.target_id();
            if let Some(dht) = self.dht_mut(family) {
                dht.on_timeout(&target_id);
            }
        }
        if let Some(task) = call.task() {
            if !was_stalled {
                if let Some(dht) = self.dht_mut(family) {
                    dht.task_man.on_call_lost(task);
                }
            }
        }
        self.check_bootstrap_call(family, txid).await;
        self.drive_tasks().await;
    }

    /// The once-a-second tick of both DHT instances.
    async fn dht_update(&mut self) {
        let now = now_millis();
        self.server.check_reachability(now);

        for family in FAMILIES {
            let (actions, needs_bootstrap) = match self.dht_mut(family) {
                Some(dht) => (dht.maintenance(now), dht.needs_bootstrap(now)),
                None => continue,
            };

            if !actions.pings.is_empty() {
                if let Some(dht) = self.dht_mut(family) {
                    dht.task_man.add(
                        "bucket maintenance pings",
                        TaskKind::PingRefresh(PingRefreshTask::new(actions.pings)),
                    );
                }
            }
            let self_id = self.id;
            for target in actions.refresh_targets {
                let seed = match self.dht_mut(family) {
                    Some(dht) => dht
                        .routing_table
                        .closest_entries(&target, constants::MAX_ENTRIES_PER_BUCKET * 2),
                    None => continue,
                };
                let mut task = NodeLookupTask::new(target, family, LookupOption::Conservative);
                task.lookup.add_candidates(&self_id, &seed);
                if let Some(dht) = self.dht_mut(family) {
                    dht.task_man
                        .add(format!("refreshing bucket near {}", target), TaskKind::NodeLookup(task));
                }
            }

            if needs_bootstrap {
                self.start_bootstrap_round(family, false).await;
            }
        }

        self.drive_tasks().await;
    }

    /// Push persistent values and peers that have gone quiet back out.
    async fn reannounce_persistent(&mut self, now: u64) {
        let before = now.saturating_sub(constants::RE_ANNOUNCE_INTERVAL);

        let values = self.storage.persistent_values(before);
        for value in values {
            let value_id = value.id();
            debug!(id = %value_id, "re-announcing persistent value");
            self.storage.update_value_last_announce(&value_id, now);
            self.start_lookups(0, |family, _| {
                TaskKind::NodeLookup(
                    NodeLookupTask::new(value_id, family, LookupOption::Conservative)
                        .with_followup(Followup::StoreValue(value.clone())),
                )
            })
            .await;
        }

        let peers = self.storage.persistent_peers(before);
        for peer in peers {
            let peer_id = *peer.id();
            debug!(id = %peer_id, "re-announcing persistent peer");
            self.storage
                .update_peer_last_announce(&peer_id, peer.origin(), now);
            self.start_lookups(0, |family, _| {
                TaskKind::NodeLookup(
                    NodeLookupTask::new(peer_id, family, LookupOption::Conservative)
                        .with_followup(Followup::AnnouncePeer(peer.clone())),
                )
            })
            .await;
        }
    }

    async fn shutdown(&mut self) {
        info!("node loop shutting down");
        let now = now_millis();
        for family in FAMILIES {
            if let Some(dht) = self.dht_mut(family) {
                dht.task_man.cancel_all();
                dht.persist(now, true);
            }
        }
        // fail whatever is still pending; no more progress is coming
        for (_, pending) in self.ops.drain() {
            match pending {
                PendingOp::FindNode { tx, .. } => {
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::State("node stopped")));
                    }
                }
                PendingOp::FindValue { tx, .. } => {
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::State("node stopped")));
                    }
                }
                PendingOp::FindPeer { tx, .. } => {
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::State("node stopped")));
                    }
                }
                PendingOp::Announce { tx, .. } => {
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::State("node stopped")));
                    }
                }
            }
        }
        let _ = self.status_tx.send(NodeStatus::Stopped);
    }
}
