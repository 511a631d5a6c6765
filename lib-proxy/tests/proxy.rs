//! Scenarios against a stub rendezvous server: handshake, relaying with
//! fuzzed TCP chunking, and dead-connection detection with reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lib_crypto::{cryptobox, hashing, random, signature, CryptoBox, Nonce};
use lib_dht::Id;
use lib_proxy::packet::build_frame;
use lib_proxy::{ActiveProxy, FrameBuffer, NodeIdentity, PacketType, ProxyConfig, Timing};

/// A bare keypair standing in for a full DHT node.
struct TestIdentity {
    keypair: signature::KeyPair,
    enc: cryptobox::KeyPair,
    id: Id,
}

impl TestIdentity {
    fn new(keypair: signature::KeyPair) -> Self {
        let enc = cryptobox::KeyPair::from_signature_keypair(&keypair);
        let id = Id::from(keypair.public_key());
        TestIdentity { keypair, enc, id }
    }
}

fn pair_nonce(sender: &Id, recipient: &Id) -> Nonce {
    let digest = hashing::sha256_multi(&[sender.as_bytes(), recipient.as_bytes()]);
    Nonce::from_bytes(&digest[..24]).unwrap()
}

impl NodeIdentity for TestIdentity {
    fn id(&self) -> Id {
        self.id
    }

    fn sign(&self, data: &[u8]) -> [u8; signature::SIGNATURE_BYTES] {
        self.keypair.sign(data)
    }

    fn encrypt_to(&self, recipient: &Id, plain: &[u8]) -> lib_proxy::Result<Vec<u8>> {
        let ctx = CryptoBox::new(&recipient.to_encryption_key()?, self.enc.private_key());
        Ok(ctx.encrypt(plain, &pair_nonce(&self.id, recipient))?)
    }

    fn decrypt_from(&self, sender: &Id, cipher: &[u8]) -> lib_proxy::Result<Vec<u8>> {
        let ctx = CryptoBox::new(&sender.to_encryption_key()?, self.enc.private_key());
        Ok(ctx.decrypt(cipher, &pair_nonce(sender, &self.id))?)
    }
}

/// Server side of one rendezvous connection.
struct StubSession {
    sock: TcpStream,
    frames: FrameBuffer,
    pending: std::collections::VecDeque<Vec<u8>>,
    server_enc: cryptobox::KeyPair,
    server_id: Id,
    client_id: Option<Id>,
    session_box: Option<CryptoBox>,
    conn_nonce: Option<Nonce>,
}

impl StubSession {
    fn new(sock: TcpStream, server_keys: &signature::KeyPair) -> Self {
        StubSession {
            sock,
            frames: FrameBuffer::new(),
            pending: std::collections::VecDeque::new(),
            server_enc: cryptobox::KeyPair::from_signature_keypair(server_keys),
            server_id: Id::from(server_keys.public_key()),
            client_id: None,
            session_box: None,
            conn_nonce: None,
        }
    }

    async fn next_frame(&mut self) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return frame;
            }
            let n = self.sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up unexpectedly");
            self.pending.extend(self.frames.push(&buf[..n]).unwrap());
        }
    }

    /// Challenge, AUTH, AUTH_ACK. Returns once the session is established.
    async fn handshake(&mut self, relay_port: u16) {
        let challenge = random::bytes(64);
        let mut greeting = Vec::with_capacity(2 + challenge.len());
        greeting.extend_from_slice(&((2 + challenge.len()) as u16).to_be_bytes());
        greeting.extend_from_slice(&challenge);
        self.sock.write_all(&greeting).await.unwrap();

        let auth = self.next_frame().await;
        assert_eq!(PacketType::of(auth[2]), Some(PacketType::Auth));

        let payload = &auth[3..];
        let client_id = Id::from_bytes(&payload[..32]).unwrap();
        let node_box = CryptoBox::new(
            &client_id.to_encryption_key().unwrap(),
            self.server_enc.private_key(),
        );
        let plain = node_box
            .decrypt(&payload[32..], &pair_nonce(&client_id, &self.server_id))
            .unwrap();

        let client_session_pk = cryptobox::PublicKey::from_bytes(&plain[..32]).unwrap();
        let conn_nonce = Nonce::from_bytes(&plain[32..56]).unwrap();
        let sig = &plain[56..120];
        client_id
            .to_signature_key()
            .unwrap()
            .verify(&challenge, sig)
            .expect("challenge signature verifies");

        let session_keys = cryptobox::KeyPair::random();
        self.session_box = Some(CryptoBox::new(&client_session_pk, session_keys.private_key()));
        self.conn_nonce = Some(conn_nonce);
        self.client_id = Some(client_id);

        let mut ack_plain = Vec::with_capacity(35);
        ack_plain.extend_from_slice(session_keys.public_key().as_bytes());
        ack_plain.extend_from_slice(&relay_port.to_be_bytes());
        ack_plain.push(0); // domain routing disabled
        let sealed = node_box
            .encrypt(&ack_plain, &pair_nonce(&self.server_id, &client_id))
            .unwrap();
        let ack = build_frame(PacketType::AuthAck, &sealed);
        self.sock.write_all(&ack).await.unwrap();
    }

    fn seal(&self, plain: &[u8]) -> Vec<u8> {
        self.session_box
            .as_ref()
            .unwrap()
            .encrypt(plain, self.conn_nonce.as_ref().unwrap())
            .unwrap()
    }

    fn open(&self, cipher: &[u8]) -> Vec<u8> {
        self.session_box
            .as_ref()
            .unwrap()
            .decrypt(cipher, self.conn_nonce.as_ref().unwrap())
            .unwrap()
    }

    /// Tell the client to relay a new flow toward its upstream.
    async fn send_connect(&mut self, port: u16) {
        let mut plain = Vec::with_capacity(19);
        plain.push(4u8);
        plain.extend_from_slice(&[127, 0, 0, 1]);
        plain.extend_from_slice(&[0u8; 12]);
        plain.extend_from_slice(&port.to_be_bytes());
        let frame = build_frame(PacketType::Connect, &self.seal(&plain));
        self.sock.write_all(&frame).await.unwrap();
    }
}

fn fast_timing() -> Timing {
    Timing {
        periodic_check: Duration::from_millis(50),
        keep_alive_interval: Duration::from_millis(400),
        keep_alive_jitter: Duration::from_millis(100),
        idle_check_interval: Duration::from_secs(60),
        max_idle: Duration::from_secs(300),
    }
}

/// S5: authenticate, accept a CONNECT, and carry 100 random DATA frames
/// byte-exact to the upstream across fuzzed TCP chunking.
#[tokio::test(flavor = "multi_thread")]
async fn handshake_and_relay() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let rendezvous = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = rendezvous.local_addr().unwrap();

    let server_keys = signature::KeyPair::random();
    let server_id = Id::from(server_keys.public_key());
    let identity = Arc::new(TestIdentity::new(signature::KeyPair::random()));
    let client_id = NodeIdentity::id(identity.as_ref());

    let config = ProxyConfig::new(server_id, server_addr, upstream_addr);
    let proxy = ActiveProxy::start(identity, None, config);

    let (sock, _) = tokio::time::timeout(Duration::from_secs(5), rendezvous.accept())
        .await
        .expect("client connects")
        .unwrap();
    let mut session = StubSession::new(sock, &server_keys);
    session.handshake(19999).await;
    assert_eq!(session.client_id, Some(client_id));

    // the worker sees the allocated port once the connection reports in
    tokio::time::timeout(Duration::from_secs(2), async {
        while proxy.relay_port() != Some(19999) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("proxy authorizes");
    assert!(proxy.is_authenticated());

    // CONNECT: the client opens the upstream and confirms
    session.send_connect(upstream_addr.port()).await;
    let (mut upstream_sock, _) = tokio::time::timeout(Duration::from_secs(5), upstream.accept())
        .await
        .expect("upstream reached")
        .unwrap();

    let ack = session.next_frame().await;
    assert_eq!(PacketType::of(ack[2]), Some(PacketType::ConnectAck));
    assert_eq!(ack[3] & 0x01, 0x01, "relay accepted");

    // server -> client -> upstream, fuzzed chunk boundaries
    let mut expected = Vec::new();
    let mut wire = Vec::new();
    let mut rng_state = 0x243F6A8885A308D3u64;
    for i in 0..100usize {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let size = 1 + (rng_state >> 33) as usize % 30_000;
        let mut payload = vec![0u8; size];
        for (j, byte) in payload.iter_mut().enumerate() {
            *byte = (i + j) as u8;
        }
        expected.extend_from_slice(&payload);
        wire.extend_from_slice(&build_frame(PacketType::Data, &session.seal(&payload)));
    }

    // write with fuzzed chunk boundaries, draining the upstream as we go
    // so neither side ever stalls on full socket buffers
    let mut received = Vec::with_capacity(expected.len());
    let mut drain = vec![0u8; 16 * 1024];
    let mut pos = 0;
    while pos < wire.len() {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let chunk = 1 + (rng_state >> 33) as usize % 4096;
        let end = (pos + chunk).min(wire.len());
        session.sock.write_all(&wire[pos..end]).await.unwrap();
        pos = end;

        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(1), upstream_sock.read(&mut drain)).await
        {
            assert!(n > 0, "upstream closed early");
            received.extend_from_slice(&drain[..n]);
        }
    }
    let finish = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.len() < expected.len() {
        let n = tokio::time::timeout_at(finish, upstream_sock.read(&mut drain))
            .await
            .expect("all bytes arrive")
            .unwrap();
        assert!(n > 0, "upstream closed early");
        received.extend_from_slice(&drain[..n]);
    }
    assert_eq!(received, expected, "relayed bytes are byte-exact");

    // and the reverse direction: upstream bytes come back as DATA frames
    upstream_sock.write_all(b"response body").await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), session.next_frame())
        .await
        .expect("data frame comes back");
    assert_eq!(PacketType::of(frame[2]), Some(PacketType::Data));
    assert_eq!(session.open(&frame[3..]), b"response body");

    proxy.stop().await;
}

/// S6: a rendezvous that goes silent. The client pings on the keep-alive
/// cadence, declares the connection dead after three quiet intervals, and
/// a replacement connection shows up.
#[tokio::test(flavor = "multi_thread")]
async fn dead_connection_is_replaced() {
    let rendezvous = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = rendezvous.local_addr().unwrap();
    // upstream never used: the stub sends no CONNECT
    let upstream_addr = "127.0.0.1:9".parse().unwrap();

    let server_keys = signature::KeyPair::random();
    let server_id = Id::from(server_keys.public_key());
    let identity = Arc::new(TestIdentity::new(signature::KeyPair::random()));

    let mut config = ProxyConfig::new(server_id, server_addr, upstream_addr);
    config.timing = fast_timing();
    config.max_connections = 1;
    let proxy = ActiveProxy::start(identity, None, config);

    let (sock, _) = tokio::time::timeout(Duration::from_secs(5), rendezvous.accept())
        .await
        .expect("first connection")
        .unwrap();
    let mut session = StubSession::new(sock, &server_keys);
    session.handshake(19999).await;

    // go silent; count pings until the client gives up
    let interval = fast_timing().keep_alive_interval;
    let mut pings = 0usize;
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + interval * 3 + Duration::from_secs(2);
    loop {
        let read = tokio::time::timeout_at(deadline, session.sock.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => break, // client closed the dead connection
            Ok(Ok(n)) => {
                for frame in session.frames.push(&buf[..n]).unwrap() {
                    if PacketType::of(frame[2]) == Some(PacketType::Ping) {
                        pings += 1;
                    }
                }
            }
            Ok(Err(_)) => break,
            Err(_) => panic!("client never closed the dead connection"),
        }
    }
    assert!(
        (1..=4).contains(&pings),
        "expected a few keep-alive pings, saw {}",
        pings
    );

    // the session authenticated, so failures stayed at zero and the
    // replacement arrives without long backoff
    let (sock2, _) = tokio::time::timeout(Duration::from_secs(3), rendezvous.accept())
        .await
        .expect("replacement connection")
        .unwrap();
    drop(sock2);

    proxy.stop().await;
}
