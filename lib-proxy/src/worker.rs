//! The proxy worker: owns the connection pool, the reconnect backoff and
//! the idle scaling, and carries the session state every connection shares.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lib_crypto::{cryptobox, signature, CryptoBox, Nonce};
use lib_dht::{Id, LookupOption, PeerInfo};

use crate::error::{Error, Result};
use crate::connection::run_connection;

/// The identity surface a connection needs from its node: who we are, how
/// to sign a challenge, and the long-term box with the server.
pub trait NodeIdentity: Send + Sync {
    fn id(&self) -> Id;
    fn sign(&self, data: &[u8]) -> [u8; signature::SIGNATURE_BYTES];
    fn encrypt_to(&self, recipient: &Id, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt_from(&self, sender: &Id, cipher: &[u8]) -> Result<Vec<u8>>;
}

impl NodeIdentity for lib_dht::Node {
    fn id(&self) -> Id {
        *lib_dht::Node::id(self)
    }

    fn sign(&self, data: &[u8]) -> [u8; signature::SIGNATURE_BYTES] {
        lib_dht::Node::sign(self, data)
    }

    fn encrypt_to(&self, recipient: &Id, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(lib_dht::Node::encrypt_to(self, recipient, plain)?)
    }

    fn decrypt_from(&self, sender: &Id, cipher: &[u8]) -> Result<Vec<u8>> {
        Ok(lib_dht::Node::decrypt_from(self, sender, cipher)?)
    }
}

/// Intervals, exposed so tests can shrink minutes to milliseconds.
#[derive(Clone, Debug)]
pub struct Timing {
    /// Keep-alive inspection cadence.
    pub periodic_check: Duration,
    /// Base quiet window before a PING goes out; dead after three of these.
    pub keep_alive_interval: Duration,
    /// Random shift subtracted from the keep-alive window.
    pub keep_alive_jitter: Duration,
    /// Pool status / idle shrink cadence.
    pub idle_check_interval: Duration,
    /// Idle time before the pool shrinks to one connection.
    pub max_idle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            periodic_check: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_jitter: Duration::from_secs(10),
            idle_check_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct ProxyConfig {
    /// Node id of the rendezvous server.
    pub server_id: Id,
    pub server_addr: SocketAddr,
    /// The NAT-bound service this worker exposes.
    pub upstream_addr: SocketAddr,
    /// Domain name announced during AUTH, when the server routes by name.
    pub domain_name: Option<String>,
    /// Keypair for publishing the relayed service as a DHT peer.
    pub peer_keypair: Option<signature::KeyPair>,
    pub max_connections: usize,
    pub timing: Timing,
}

impl ProxyConfig {
    pub fn new(server_id: Id, server_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        ProxyConfig {
            server_id,
            server_addr,
            upstream_addr,
            domain_name: None,
            peer_keypair: None,
            max_connections: 8,
            timing: Timing::default(),
        }
    }
}

/// Lifecycle notifications from connections to the worker.
#[derive(Debug)]
pub(crate) enum Event {
    Authorized {
        id: u32,
        relay_port: u16,
        domain_enabled: bool,
    },
    Opened {
        id: u32,
    },
    OpenFailed {
        id: u32,
    },
    Busy {
        id: u32,
    },
    Idle {
        id: u32,
    },
    Closed {
        id: u32,
    },
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub authenticated: bool,
    pub session_box: Option<CryptoBox>,
    pub relay_port: u16,
    pub domain_enabled: bool,
}

/// Shared, read-mostly context each connection task carries.
pub(crate) struct WorkerContext {
    pub node: Arc<dyn NodeIdentity>,
    pub server_id: Id,
    pub server_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub domain: Option<String>,
    pub timing: Timing,
    session_keypair: cryptobox::KeyPair,
    session: Mutex<SessionState>,
}

impl WorkerContext {
    pub fn session_public_key(&self) -> cryptobox::PublicKey {
        self.session_keypair.public_key().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().unwrap().authenticated
    }

    pub fn relay_port(&self) -> Option<u16> {
        let session = self.session.lock().unwrap();
        session.authenticated.then_some(session.relay_port)
    }

    pub fn encrypt_with_node(&self, plain: &[u8]) -> Result<Vec<u8>> {
        self.node.encrypt_to(&self.server_id, plain)
    }

    pub fn decrypt_with_node(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        self.node.decrypt_from(&self.server_id, cipher)
    }

    /// Derive the session box from the server's session key.
    pub fn establish_session(
        &self,
        server_session_pk: &[u8],
        relay_port: u16,
        domain_enabled: bool,
    ) -> Result<()> {
        let server_pk = cryptobox::PublicKey::from_bytes(server_session_pk)
            .map_err(|_| Error::Protocol("bad server session key".into()))?;
        let mut session = self.session.lock().unwrap();
        session.session_box = Some(CryptoBox::new(
            &server_pk,
            self.session_keypair.private_key(),
        ));
        session.authenticated = true;
        session.relay_port = relay_port;
        session.domain_enabled = domain_enabled;
        Ok(())
    }

    pub fn session_encrypt(&self, plain: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        let session = self.session.lock().unwrap();
        let ctx = session
            .session_box
            .as_ref()
            .ok_or(Error::State("session not established"))?;
        Ok(ctx.encrypt(plain, nonce)?)
    }

    pub fn session_decrypt(&self, cipher: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        let session = self.session.lock().unwrap();
        let ctx = session
            .session_box
            .as_ref()
            .ok_or(Error::State("session not established"))?;
        Ok(ctx.decrypt(cipher, nonce)?)
    }
}

struct ConnHandle {
    close_tx: mpsc::Sender<()>,
    busy: bool,
}

struct Worker {
    ctx: Arc<WorkerContext>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    connections: HashMap<u32, ConnHandle>,
    next_conn_id: u32,
    inflights: usize,
    idle_since: Option<Instant>,
    server_failures: u32,
    reconnect_at: Option<Instant>,
    max_connections: usize,
    announcer: Option<(Arc<lib_dht::Node>, signature::KeyPair)>,
    last_announce: Option<Instant>,
}

/// The running proxy: a handle over the worker task.
pub struct ActiveProxy {
    ctx: Arc<WorkerContext>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ActiveProxy {
    /// Resolve the rendezvous server through the DHT: find the service peer,
    /// then the address of the node hosting it.
    pub async fn locate_service(
        node: &lib_dht::Node,
        server_peer_id: &Id,
    ) -> Result<(Id, SocketAddr)> {
        info!(peer = %server_peer_id, "looking up the rendezvous service peer");
        let peers = node
            .find_peer(*server_peer_id, 1, LookupOption::Conservative)
            .await?;
        let peer = peers
            .first()
            .ok_or(Error::State("rendezvous service peer not found"))?;

        info!(node_id = %peer.node_id(), "looking up the rendezvous node");
        let nodes = node
            .find_node(*peer.node_id(), LookupOption::Conservative)
            .await?;
        let found = nodes
            .iter()
            .find(|n| n.id() == peer.node_id())
            .ok_or(Error::State("rendezvous node not found"))?;

        Ok((*peer.node_id(), SocketAddr::new(found.ip(), peer.port())))
    }

    /// Start the worker. `dht` enables the periodic peer announcement of
    /// the relayed service; identity-only setups pass `None`.
    pub fn start(
        identity: Arc<dyn NodeIdentity>,
        dht: Option<Arc<lib_dht::Node>>,
        config: ProxyConfig,
    ) -> ActiveProxy {
        let ctx = Arc::new(WorkerContext {
            node: identity,
            server_id: config.server_id,
            server_addr: config.server_addr,
            upstream_addr: config.upstream_addr,
            domain: config.domain_name.clone(),
            timing: config.timing.clone(),
            session_keypair: cryptobox::KeyPair::random(),
            session: Mutex::new(SessionState::default()),
        });

        let (events_tx, events_rx) = mpsc::channel(64);
        let announcer = match (dht, config.peer_keypair) {
            (Some(node), Some(keypair)) => Some((node, keypair)),
            _ => None,
        };
        let worker = Worker {
            ctx: ctx.clone(),
            events_tx,
            events_rx,
            connections: HashMap::new(),
            next_conn_id: 0,
            inflights: 0,
            idle_since: None,
            server_failures: 0,
            reconnect_at: None,
            max_connections: config.max_connections,
            announcer,
            last_announce: None,
        };

        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(worker.run(stop.clone()));

        ActiveProxy { ctx, stop, handle }
    }

    /// Port the rendezvous allocated for inbound clients, once known.
    pub fn relay_port(&self) -> Option<u16> {
        self.ctx.relay_port()
    }

    pub fn is_authenticated(&self) -> bool {
        self.ctx.is_authenticated()
    }

    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}

impl Worker {
    async fn run(mut self, stop: Arc<Notify>) {
        info!(server = %self.ctx.server_addr, upstream = %self.ctx.upstream_addr,
            "active proxy starting");

        let mut idle_check = tokio::time::interval(self.ctx.timing.idle_check_interval);
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // provisioning is re-evaluated often; connects are cheap to skip
        let mut provision = tokio::time::interval(Duration::from_millis(500));
        provision.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let reconnect_sleep = self.reconnect_at.map(tokio::time::sleep_until);

            tokio::select! {
                _ = stop.notified() => break,
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.on_event(event).await;
                    }
                    self.maybe_connect();
                }
                _ = async { reconnect_sleep.unwrap().await }, if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.spawn_connection();
                }
                _ = provision.tick() => {
                    self.maybe_connect();
                }
                _ = idle_check.tick() => {
                    self.idle_check();
                    self.reannounce_peer().await;
                }
            }
        }

        info!("active proxy stopping");
        for (_, conn) in self.connections.drain() {
            let _ = conn.close_tx.try_send(());
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Authorized {
                id,
                relay_port,
                domain_enabled,
            } => {
                info!(conn = id, relay_port, domain_enabled, "session authorized");
            }
            Event::Opened { id } => {
                debug!(conn = id, "connection opened");
                self.server_failures = 0;
            }
            Event::OpenFailed { id } => {
                debug!(conn = id, "connection failed to open");
                self.server_failures += 1;
            }
            Event::Busy { id } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if !conn.busy {
                        conn.busy = true;
                        self.inflights += 1;
                    }
                }
                self.idle_since = None;
            }
            Event::Idle { id } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if conn.busy {
                        conn.busy = false;
                        self.inflights = self.inflights.saturating_sub(1);
                    }
                }
                if self.inflights == 0 {
                    self.idle_since = Some(Instant::now());
                }
            }
            Event::Closed { id } => {
                self.connections.remove(&id);
                debug!(conn = id, pool = self.connections.len(), "connection closed");
            }
        }
    }

    fn needs_new_connection(&self) -> bool {
        if self.connections.len() >= self.max_connections {
            return false;
        }
        if self.reconnect_at.is_some() {
            return false;
        }
        self.connections.is_empty() || self.inflights == self.connections.len()
    }

    fn maybe_connect(&mut self) {
        if !self.needs_new_connection() {
            return;
        }
        if self.server_failures == 0 {
            self.spawn_connection();
            return;
        }
        // exponential backoff, saturating at 64 seconds
        let shift = self.server_failures.min(6);
        let delay = Duration::from_secs(1 << shift);
        info!(failures = self.server_failures, ?delay, "delaying reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn spawn_connection(&mut self) {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);

        let (close_tx, close_rx) = mpsc::channel(1);
        self.connections.insert(
            id,
            ConnHandle {
                close_tx,
                busy: false,
            },
        );
        tokio::spawn(run_connection(
            id,
            self.ctx.clone(),
            self.events_tx.clone(),
            close_rx,
        ));
    }

    /// Log the pool and shed redundant connections after a long idle spell.
    fn idle_check(&mut self) {
        info!(
            connections = self.connections.len(),
            inflights = self.inflights,
            idle_seconds = self
                .idle_since
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            "proxy pool status"
        );

        let Some(idle_since) = self.idle_since else {
            return;
        };
        if idle_since.elapsed() < self.ctx.timing.max_idle {
            return;
        }
        if self.inflights != 0 || self.connections.len() <= 1 {
            return;
        }

        info!("closing redundant connections after long idle");
        let keep = *self.connections.keys().min().expect("non-empty");
        for (id, conn) in &self.connections {
            if *id != keep {
                let _ = conn.close_tx.try_send(());
            }
        }
    }

    /// Publish the relayed service as a DHT peer on the rendezvous node.
    async fn reannounce_peer(&mut self) {
        let Some((node, keypair)) = &self.announcer else {
            return;
        };
        let Some(relay_port) = self.ctx.relay_port() else {
            return;
        };
        let due = match self.last_announce {
            Some(last) => last.elapsed() >= Duration::from_secs(60 * 60),
            None => true,
        };
        if !due {
            return;
        }

        let origin = self.ctx.node.id();
        let peer = match PeerInfo::create_with(
            keypair,
            &self.ctx.server_id,
            &origin,
            relay_port,
            self.ctx.domain.as_deref(),
        ) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "cannot build service peer");
                return;
            }
        };

        match node.announce_peer_opts(peer, true).await {
            Ok(()) => {
                info!(port = relay_port, "service peer announced");
                self.last_announce = Some(Instant::now());
            }
            Err(e) => warn!(error = %e, "service peer announcement failed"),
        }
    }
}
