//! One proxy connection: the TCP link to the rendezvous and, while
//! relaying, the TCP link to the upstream service.
//!
//! The connection authenticates with the node identity, then sits Idling
//! with keep-alives until the server hands it an upstream flow to relay.
//! All reads, writes and timers for a connection live on its own task; the
//! worker learns about lifecycle changes through a single event channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use lib_crypto::{random, Nonce};

use crate::error::{Error, Result};
use crate::packet::{build_frame, PacketType, MAX_DATA_PACKET_SIZE, PACKET_HEADER_BYTES};
use crate::worker::{Event, WorkerContext};

/// Pending bytes toward the rendezvous before upstream reads pause.
pub const MAX_RELAY_WRITE_QUEUE_SIZE: usize = 2 * 1024 * 1024;

/// Reads resume when the queue drains below a quarter of the bound.
pub const RELAY_WRITE_QUEUE_RESUME: usize = MAX_RELAY_WRITE_QUEUE_SIZE / 4;

const MAC_BYTES: usize = lib_crypto::cryptobox::MAC_BYTES;

/// Upstream reads are sized so one read becomes one DATA frame.
const MAX_UPSTREAM_READ: usize = MAX_DATA_PACKET_SIZE - PACKET_HEADER_BYTES - MAC_BYTES;

const CHALLENGE_MIN: usize = 32;
const CHALLENGE_MAX: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Initializing,
    Authenticating,
    Attaching,
    Idling,
    Relaying,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    /// The server-to-client acceptance matrix. A packet arriving in a state
    /// that does not accept its type closes the connection. ERROR is
    /// handled before this check and is accepted everywhere.
    pub fn accepts(&self, packet_type: PacketType) -> bool {
        use PacketType::*;
        match self {
            ConnectionState::Initializing => false,
            ConnectionState::Authenticating => matches!(packet_type, AuthAck),
            ConnectionState::Attaching => matches!(packet_type, AttachAck),
            ConnectionState::Idling => matches!(packet_type, PingAck | Connect),
            ConnectionState::Relaying => matches!(packet_type, PingAck | Data | Disconnect),
            ConnectionState::Disconnecting => {
                matches!(packet_type, Disconnect | DisconnectAck | Data)
            }
            ConnectionState::Closed => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Initializing => "Initializing",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::Attaching => "Attaching",
            ConnectionState::Idling => "Idling",
            ConnectionState::Relaying => "Relaying",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// The sticky buffer: TCP hands us arbitrary byte runs, this re-cuts them
/// into complete frames (length header included).
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer { buf: Vec::new() }
    }

    /// Feed received bytes in; returns every frame completed by them.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 2 {
                break;
            }
            let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if declared < 2 || declared > MAX_DATA_PACKET_SIZE {
                return Err(Error::Protocol(format!("invalid frame length {}", declared)));
            }
            if self.buf.len() < declared {
                break;
            }
            frames.push(self.buf.drain(..declared).collect());
        }
        Ok(frames)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Backpressure bookkeeping for the relay write queue.
#[derive(Default)]
pub struct FlowControl {
    paused: bool,
}

impl FlowControl {
    /// After queueing: pause upstream reads past the high-water mark.
    pub fn on_queued(&mut self, pending: usize) -> bool {
        if !self.paused && pending >= MAX_RELAY_WRITE_QUEUE_SIZE {
            self.paused = true;
            return true;
        }
        false
    }

    /// After draining: resume once below a quarter of the bound.
    pub fn on_drained(&mut self, pending: usize) -> bool {
        if self.paused && pending <= RELAY_WRITE_QUEUE_RESUME {
            self.paused = false;
            return true;
        }
        false
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

struct Conn {
    id: u32,
    ctx: Arc<WorkerContext>,
    events: mpsc::Sender<Event>,

    state: ConnectionState,
    nonce: Nonce,
    frames: FrameBuffer,

    relay_rd: OwnedReadHalf,
    relay_wr: OwnedWriteHalf,
    upstream_rd: Option<OwnedReadHalf>,
    upstream_wr: Option<OwnedWriteHalf>,

    relay_out: Vec<u8>,
    out_offset: usize,
    flow: FlowControl,

    disconnect_confirms: u8,
    last_receive: Instant,
    last_ping: Option<Instant>,
    opened: bool,
    busy: bool,
}

async fn read_upstream(
    upstream: &mut Option<OwnedReadHalf>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match upstream {
        Some(rd) => rd.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Drive one connection to completion. Lifecycle events flow to the worker;
/// the worker closes the connection by dropping or signalling `close_rx`.
pub(crate) async fn run_connection(
    id: u32,
    ctx: Arc<WorkerContext>,
    events: mpsc::Sender<Event>,
    mut close_rx: mpsc::Receiver<()>,
) {
    info!(conn = id, server = %ctx.server_addr, "connecting to the rendezvous server");

    let stream = match TcpStream::connect(ctx.server_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(conn = id, server = %ctx.server_addr, error = %e, "connect failed");
            let _ = events.send(Event::OpenFailed { id }).await;
            let _ = events.send(Event::Closed { id }).await;
            return;
        }
    };
    info!(conn = id, server = %ctx.server_addr, "connected");

    let (relay_rd, relay_wr) = stream.into_split();
    let mut conn = Conn {
        id,
        ctx,
        events: events.clone(),
        state: ConnectionState::Initializing,
        nonce: Nonce::random(),
        frames: FrameBuffer::new(),
        relay_rd,
        relay_wr,
        upstream_rd: None,
        upstream_wr: None,
        relay_out: Vec::new(),
        out_offset: 0,
        flow: FlowControl::default(),
        disconnect_confirms: 0,
        last_receive: Instant::now(),
        last_ping: None,
        opened: false,
        busy: false,
    };

    if let Err(e) = conn.run(&mut close_rx).await {
        warn!(conn = id, error = %e, "connection terminated");
    }

    if !conn.opened {
        let _ = events.send(Event::OpenFailed { id }).await;
    }
    if conn.busy {
        let _ = events.send(Event::Idle { id }).await;
    }
    conn.state = ConnectionState::Closed;
    info!(conn = id, "closed");
    let _ = events.send(Event::Closed { id }).await;
}

impl Conn {
    async fn run(&mut self, close_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut rbuf = vec![0u8; 64 * 1024];
        let mut ubuf = vec![0u8; MAX_UPSTREAM_READ];
        let mut check = tokio::time::interval(self.ctx.timing.periodic_check);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = close_rx.recv() => {
                    debug!(conn = self.id, "close requested");
                    return Ok(());
                }
                read = self.relay_rd.read(&mut rbuf) => {
                    match read {
                        Ok(0) => {
                            info!(conn = self.id, "closed by the server");
                            return Ok(());
                        }
                        Ok(n) => {
                            self.last_receive = Instant::now();
                            let frames = self.frames.push(&rbuf[..n])?;
                            for frame in frames {
                                self.handle_frame(frame).await?;
                            }
                        }
                        Err(e) => return Err(Error::Network(e)),
                    }
                }
                read = read_upstream(&mut self.upstream_rd, &mut ubuf),
                    if self.upstream_rd.is_some() && !self.flow.is_paused() =>
                {
                    match read {
                        Ok(0) => {
                            debug!(conn = self.id, "upstream closed");
                            self.begin_disconnect();
                        }
                        Ok(n) => self.send_data(&ubuf[..n])?,
                        Err(e) => {
                            warn!(conn = self.id, error = %e, "upstream read failed");
                            self.begin_disconnect();
                        }
                    }
                }
                written = self.relay_wr.write(&self.relay_out[self.out_offset..]),
                    if self.out_offset < self.relay_out.len() =>
                {
                    match written {
                        Ok(n) => {
                            self.out_offset += n;
                            self.after_drain();
                        }
                        Err(e) => return Err(Error::Network(e)),
                    }
                }
                _ = check.tick() => {
                    if let Some(reason) = self.periodic_check() {
                        return Err(reason);
                    }
                }
            }
        }
    }

    fn pending_out(&self) -> usize {
        self.relay_out.len() - self.out_offset
    }

    fn queue_frame(&mut self, packet_type: PacketType, body: &[u8]) {
        debug!(conn = self.id, packet = %packet_type, "queueing frame");
        let frame = build_frame(packet_type, body);
        self.relay_out.extend_from_slice(&frame);
    }

    fn after_drain(&mut self) {
        if self.out_offset == self.relay_out.len() {
            self.relay_out.clear();
            self.out_offset = 0;
        } else if self.out_offset >= 256 * 1024 {
            self.relay_out.drain(..self.out_offset);
            self.out_offset = 0;
        }
        if self.flow.on_drained(self.pending_out()) {
            debug!(conn = self.id, "resuming upstream reads");
        }
    }

    /// Keep-alive and dead-peer checks; relaying connections are exempt,
    /// their traffic speaks for them.
    fn periodic_check(&mut self) -> Option<Error> {
        if self.state == ConnectionState::Relaying {
            return None;
        }

        let quiet = self.last_receive.elapsed();
        if quiet >= self.ctx.timing.keep_alive_interval * 3 {
            warn!(conn = self.id, "connection is dead");
            return Some(Error::State("keep-alive expired"));
        }

        let jitter_max = self.ctx.timing.keep_alive_jitter.as_millis() as u32;
        let shift = Duration::from_millis(if jitter_max > 0 {
            random::u32_below(jitter_max) as u64
        } else {
            0
        });
        let ping_due = self
            .last_ping
            .map_or(true, |t| t.elapsed() + shift >= self.ctx.timing.keep_alive_interval);
        if self.state == ConnectionState::Idling
            && quiet + shift >= self.ctx.timing.keep_alive_interval
            && ping_due
        {
            self.last_ping = Some(Instant::now());
            self.queue_frame(PacketType::Ping, &[]);
        }
        None
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        // the greeting is a bare challenge: length header, no flag byte
        if self.state == ConnectionState::Initializing {
            return self.on_challenge(&frame[2..]);
        }

        if frame.len() < PACKET_HEADER_BYTES {
            return Err(Error::Protocol("truncated frame".into()));
        }
        let Some(packet_type) = PacketType::of(frame[2]) else {
            return Err(Error::Protocol(format!("invalid flag byte {:#04x}", frame[2])));
        };

        if packet_type == PacketType::Error {
            return Err(self.on_error_packet(&frame));
        }

        if !self.state.accepts(packet_type) {
            return Err(Error::Protocol(format!(
                "unexpected {} packet in {} state",
                packet_type, self.state
            )));
        }

        match packet_type {
            PacketType::AuthAck => self.on_auth_ack(&frame).await,
            PacketType::AttachAck => self.on_attach_ack().await,
            PacketType::PingAck => Ok(()), // timestamp already updated
            PacketType::Connect => self.on_connect(&frame).await,
            PacketType::Data => self.on_data(&frame).await,
            PacketType::Disconnect => self.on_disconnect().await,
            PacketType::DisconnectAck => self.on_disconnect_ack().await,
            _ => Err(Error::Protocol(format!(
                "unexpected {} packet from the server",
                packet_type
            ))),
        }
    }

    /*
     * Challenge: random bytes. Sign with the node key; AUTH on the first
     * connection of a session, ATTACH once the session key exists.
     */
    fn on_challenge(&mut self, challenge: &[u8]) -> Result<()> {
        if challenge.len() < CHALLENGE_MIN || challenge.len() > CHALLENGE_MAX {
            return Err(Error::Protocol(format!(
                "challenge size {} out of range",
                challenge.len()
            )));
        }
        let sig = self.ctx.node.sign(challenge);
        if self.ctx.is_authenticated() {
            self.send_attach(&sig)
        } else {
            self.send_auth(&sig)
        }
    }

    /*
     * AUTH payload:
     *   clientNodeId
     *   box_to_node(sessionPk || connectionNonce || signature ||
     *               domainLen || domain || padding)
     */
    fn send_auth(&mut self, sig: &[u8]) -> Result<()> {
        self.state = ConnectionState::Authenticating;

        let session_pk = self.ctx.session_public_key();
        let domain = self.ctx.domain.as_deref().unwrap_or("");
        let padding_len = random::u8_below(255) as usize + 1;

        let mut plain =
            Vec::with_capacity(32 + 24 + sig.len() + 1 + domain.len() + padding_len);
        plain.extend_from_slice(session_pk.as_bytes());
        plain.extend_from_slice(self.nonce.as_bytes());
        plain.extend_from_slice(sig);
        plain.push(domain.len() as u8);
        plain.extend_from_slice(domain.as_bytes());
        let mut padding = vec![0u8; padding_len];
        random::fill(&mut padding);
        plain.extend_from_slice(&padding);

        let sealed = self.ctx.encrypt_with_node(&plain)?;
        let mut payload = Vec::with_capacity(32 + sealed.len());
        payload.extend_from_slice(self.ctx.node.id().as_bytes());
        payload.extend_from_slice(&sealed);

        self.queue_frame(PacketType::Auth, &payload);
        Ok(())
    }

    /*
     * ATTACH payload: like AUTH, minus the domain block.
     */
    fn send_attach(&mut self, sig: &[u8]) -> Result<()> {
        self.state = ConnectionState::Attaching;

        let session_pk = self.ctx.session_public_key();
        let mut plain = Vec::with_capacity(32 + 24 + sig.len());
        plain.extend_from_slice(session_pk.as_bytes());
        plain.extend_from_slice(self.nonce.as_bytes());
        plain.extend_from_slice(sig);

        let sealed = self.ctx.encrypt_with_node(&plain)?;
        let mut payload = Vec::with_capacity(32 + sealed.len());
        payload.extend_from_slice(self.ctx.node.id().as_bytes());
        payload.extend_from_slice(&sealed);

        self.queue_frame(PacketType::Attach, &payload);
        Ok(())
    }

    /*
     * AUTH_ACK payload: box_from_node(serverSessionPk || port || domainEnabled)
     */
    async fn on_auth_ack(&mut self, frame: &[u8]) -> Result<()> {
        const PLAIN_LEN: usize = 32 + 2 + 1;
        const ACK_LEN: usize = PACKET_HEADER_BYTES + MAC_BYTES + PLAIN_LEN;

        if frame.len() < ACK_LEN {
            return Err(Error::Protocol("short AUTH_ACK".into()));
        }
        let plain = self
            .ctx
            .decrypt_with_node(&frame[PACKET_HEADER_BYTES..ACK_LEN])?;

        let server_session_pk = &plain[..32];
        let relay_port = u16::from_be_bytes([plain[32], plain[33]]);
        let domain_enabled = plain[34] & 0x01 != 0;

        self.ctx
            .establish_session(server_session_pk, relay_port, domain_enabled)?;
        debug!(conn = self.id, relay_port, domain_enabled, "authenticated");

        self.state = ConnectionState::Idling;
        self.opened = true;
        let _ = self
            .events
            .send(Event::Authorized {
                id: self.id,
                relay_port,
                domain_enabled,
            })
            .await;
        let _ = self.events.send(Event::Opened { id: self.id }).await;
        Ok(())
    }

    async fn on_attach_ack(&mut self) -> Result<()> {
        debug!(conn = self.id, "attached");
        self.state = ConnectionState::Idling;
        self.opened = true;
        let _ = self.events.send(Event::Opened { id: self.id }).await;
        Ok(())
    }

    /*
     * CONNECT payload: box_session(addrLen || addr[16] || port) - open the
     * upstream and answer with a success flag.
     */
    async fn on_connect(&mut self, frame: &[u8]) -> Result<()> {
        const PLAIN_LEN: usize = 1 + 16 + 2;
        const REQ_LEN: usize = PACKET_HEADER_BYTES + MAC_BYTES + PLAIN_LEN;

        if frame.len() < REQ_LEN {
            return Err(Error::Protocol("short CONNECT".into()));
        }
        let plain = self
            .ctx
            .session_decrypt(&frame[PACKET_HEADER_BYTES..REQ_LEN], &self.nonce)?;
        let addr_len = plain[0] as usize;
        let client_port = u16::from_be_bytes([plain[17], plain[18]]);
        debug!(conn = self.id, addr_len, client_port, "incoming relay request");

        self.state = ConnectionState::Relaying;
        self.busy = true;
        let _ = self.events.send(Event::Busy { id: self.id }).await;

        match TcpStream::connect(self.ctx.upstream_addr).await {
            Ok(stream) => {
                let (rd, wr) = stream.into_split();
                self.upstream_rd = Some(rd);
                self.upstream_wr = Some(wr);
                self.send_connect_ack(true);
                Ok(())
            }
            Err(e) => {
                error!(conn = self.id, upstream = %self.ctx.upstream_addr, error = %e,
                    "failed to open upstream");
                self.send_connect_ack(false);
                self.back_to_idling().await;
                Ok(())
            }
        }
    }

    fn send_connect_ack(&mut self, success: bool) {
        // low bit carries the answer, the rest is noise
        let mut body = random::bytes(1);
        body[0] = if success { body[0] | 0x01 } else { body[0] & 0xFE };
        self.queue_frame(PacketType::ConnectAck, &body);
    }

    /*
     * DATA payload: box_session(bytes) - decrypt and hand to the upstream.
     */
    async fn on_data(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() < PACKET_HEADER_BYTES + MAC_BYTES {
            return Err(Error::Protocol("short DATA".into()));
        }
        let plain = self
            .ctx
            .session_decrypt(&frame[PACKET_HEADER_BYTES..], &self.nonce)?;

        let Some(upstream) = self.upstream_wr.as_mut() else {
            debug!(conn = self.id, "late DATA without an upstream, dropped");
            return Ok(());
        };
        if let Err(e) = upstream.write_all(&plain).await {
            warn!(conn = self.id, error = %e, "upstream write failed");
            self.begin_disconnect();
        }
        Ok(())
    }

    /// Upstream-to-server direction: seal and queue one DATA frame, pausing
    /// upstream reads past the queue bound.
    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let sealed = self.ctx.session_encrypt(data, &self.nonce)?;
        self.queue_frame(PacketType::Data, &sealed);
        if self.flow.on_queued(self.pending_out()) {
            debug!(conn = self.id, "pausing upstream reads, write queue over limit");
        }
        Ok(())
    }

    /// Drop the upstream and start the two-way disconnect exchange.
    fn begin_disconnect(&mut self) {
        self.upstream_rd = None;
        self.upstream_wr = None;
        if self.state == ConnectionState::Relaying {
            self.state = ConnectionState::Disconnecting;
            self.queue_frame(PacketType::Disconnect, &[]);
        }
    }

    async fn on_disconnect(&mut self) -> Result<()> {
        debug!(conn = self.id, "server disconnect");
        self.upstream_rd = None;
        self.upstream_wr = None;
        self.queue_frame(PacketType::DisconnectAck, &[]);
        if self.state == ConnectionState::Relaying {
            // complete the exchange from our side too
            self.queue_frame(PacketType::Disconnect, &[]);
            self.state = ConnectionState::Disconnecting;
        }
        self.disconnect_confirmed().await;
        Ok(())
    }

    async fn on_disconnect_ack(&mut self) -> Result<()> {
        debug!(conn = self.id, "disconnect acknowledged");
        self.disconnect_confirmed().await;
        Ok(())
    }

    async fn disconnect_confirmed(&mut self) {
        self.disconnect_confirms += 1;
        if self.disconnect_confirms >= 2 {
            self.disconnect_confirms = 0;
            self.back_to_idling().await;
        }
    }

    async fn back_to_idling(&mut self) {
        self.state = ConnectionState::Idling;
        self.upstream_rd = None;
        self.upstream_wr = None;
        if self.busy {
            self.busy = false;
            let _ = self.events.send(Event::Idle { id: self.id }).await;
        }
    }

    /*
     * ERROR payload: box_session(code || message) - the server is done with
     * us, close after logging.
     */
    fn on_error_packet(&mut self, frame: &[u8]) -> Error {
        if frame.len() < PACKET_HEADER_BYTES + MAC_BYTES + 2 {
            return Error::Protocol("short ERROR packet".into());
        }
        match self
            .ctx
            .session_decrypt(&frame[PACKET_HEADER_BYTES..], &self.nonce)
        {
            Ok(plain) if plain.len() >= 2 => {
                let code = u16::from_be_bytes([plain[0], plain[1]]);
                let message = String::from_utf8_lossy(&plain[2..]).into_owned();
                error!(conn = self.id, code, %message, "server error");
                Error::Server { code, message }
            }
            _ => Error::Protocol("undecodable ERROR packet".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(len: usize, fill: u8) -> Vec<u8> {
        let mut f = vec![0u8; len];
        f[0..2].copy_from_slice(&(len as u16).to_be_bytes());
        for b in &mut f[2..] {
            *b = fill;
        }
        f
    }

    #[test]
    fn reassembles_regardless_of_chunking() {
        // the same frames must come out whatever way the bytes are split
        let frames: Vec<Vec<u8>> = (0..40)
            .map(|i| frame_of(3 + (i * 7) % 600, i as u8))
            .collect();
        let stream: Vec<u8> = frames.iter().flatten().copied().collect();

        for seed in 0..50u64 {
            let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let mut buffer = FrameBuffer::new();
            let mut collected = Vec::new();

            let mut pos = 0;
            while pos < stream.len() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let chunk = 1 + (state >> 33) as usize % 97;
                let end = (pos + chunk).min(stream.len());
                collected.extend(buffer.push(&stream[pos..end]).unwrap());
                pos = end;
            }

            assert_eq!(collected, frames, "split seed {}", seed);
            assert_eq!(buffer.pending(), 0);
        }
    }

    #[test]
    fn partial_header_is_held() {
        let mut buffer = FrameBuffer::new();
        let frame = frame_of(100, 0xAB);

        assert!(buffer.push(&frame[..1]).unwrap().is_empty());
        assert!(buffer.push(&frame[1..2]).unwrap().is_empty());
        assert!(buffer.push(&frame[2..50]).unwrap().is_empty());
        let out = buffer.push(&frame[50..]).unwrap();
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn bogus_length_is_rejected() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0x00, 0x01, 0xFF]).is_err());

        let mut buffer = FrameBuffer::new();
        let oversized = (MAX_DATA_PACKET_SIZE as u16 + 1).to_be_bytes();
        assert!(buffer.push(&oversized).is_err());
    }

    #[test]
    fn flow_control_pauses_and_resumes_at_the_thresholds() {
        let mut flow = FlowControl::default();
        assert!(!flow.on_queued(MAX_RELAY_WRITE_QUEUE_SIZE - 1));
        assert!(!flow.is_paused());

        assert!(flow.on_queued(MAX_RELAY_WRITE_QUEUE_SIZE));
        assert!(flow.is_paused());

        // draining above the resume mark keeps reads paused
        assert!(!flow.on_drained(RELAY_WRITE_QUEUE_RESUME + 1));
        assert!(flow.is_paused());

        assert!(flow.on_drained(RELAY_WRITE_QUEUE_RESUME));
        assert!(!flow.is_paused());
    }

    #[test]
    fn acceptance_matrix() {
        use ConnectionState::*;
        use PacketType::*;

        assert!(Authenticating.accepts(AuthAck));
        assert!(!Authenticating.accepts(Connect));
        assert!(Attaching.accepts(AttachAck));
        assert!(Idling.accepts(PingAck));
        assert!(Idling.accepts(Connect));
        assert!(!Idling.accepts(Data));
        assert!(Relaying.accepts(Data));
        assert!(Relaying.accepts(Disconnect));
        assert!(!Relaying.accepts(Connect));
        assert!(Disconnecting.accepts(Data));
        assert!(Disconnecting.accepts(DisconnectAck));
        for t in [AuthAck, AttachAck, PingAck, Connect, Data, Disconnect, DisconnectAck] {
            assert!(!Closed.accepts(t));
        }
    }
}
