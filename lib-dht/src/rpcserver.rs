//! The UDP RPC server shared by both DHT instances.
//!
//! Owns a socket per IP family, hands out transaction ids, tracks
//! outstanding calls and seals every datagram:
//! `senderId(32) || box(payload)`, boxed to the recipient's derived X25519
//! key under the deterministic per-pair nonce.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::constants;
use crate::crypto_cache::CryptoCache;
use crate::error::{Error, Result};
use crate::id::{Id, ID_BYTES};
use crate::messages::Message;
use crate::node_info::Family;
use crate::rpccall::RpcCall;

pub struct RpcServer {
    sock4: Option<Arc<UdpSocket>>,
    sock6: Option<Arc<UdpSocket>>,
    bound4: Option<SocketAddr>,
    bound6: Option<SocketAddr>,

    next_txid: i32,
    calls: HashMap<i32, RpcCall>,

    last_received4: u64,
    last_received6: u64,
    reachable4: bool,
    reachable6: bool,

    messages_received: u64,
    messages_sent: u64,
}

impl RpcServer {
    /// Bind the requested sockets. Bind failures are fatal by design: a node
    /// that cannot open its sockets has nothing to offer.
    pub async fn bind(addr4: Option<SocketAddr>, addr6: Option<SocketAddr>) -> Result<Self> {
        let mut sock4 = None;
        let mut bound4 = None;
        if let Some(addr) = addr4 {
            let sock = UdpSocket::bind(addr).await.map_err(Error::Network)?;
            bound4 = Some(sock.local_addr().map_err(Error::Network)?);
            sock4 = Some(Arc::new(sock));
        }

        let mut sock6 = None;
        let mut bound6 = None;
        if let Some(mut addr) = addr6 {
            // share the port across families when only one was configured
            if addr.port() == 0 {
                if let Some(b4) = bound4 {
                    addr.set_port(b4.port());
                }
            }
            let sock = UdpSocket::bind(addr).await.map_err(Error::Network)?;
            bound6 = Some(sock.local_addr().map_err(Error::Network)?);
            sock6 = Some(Arc::new(sock));
        }

        Ok(RpcServer {
            sock4,
            sock6,
            bound4,
            bound6,
            next_txid: (lib_crypto::random::u32_below(32_767) + 1) as i32,
            calls: HashMap::new(),
            last_received4: 0,
            last_received6: 0,
            reachable4: false,
            reachable6: false,
            messages_received: 0,
            messages_sent: 0,
        })
    }

    pub fn socket(&self, family: Family) -> Option<Arc<UdpSocket>> {
        match family {
            Family::V4 => self.sock4.clone(),
            Family::V6 => self.sock6.clone(),
        }
    }

    pub fn bound_addr(&self, family: Family) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.bound4,
            Family::V6 => self.bound6,
        }
    }

    fn allocate_txid(&mut self) -> i32 {
        // monotonic, never zero, skipping ids still in flight
        loop {
            self.next_txid = self.next_txid.wrapping_add(1);
            if self.next_txid == 0 {
                self.next_txid = 1;
            }
            if !self.calls.contains_key(&self.next_txid) {
                return self.next_txid;
            }
        }
    }

    /// Seal and send `msg` to `(to, to_addr)`.
    pub async fn send_message(
        &mut self,
        crypto: &mut CryptoCache,
        self_id: &Id,
        to: &Id,
        to_addr: &SocketAddr,
        msg: &Message,
        now: u64,
    ) -> Result<()> {
        let payload = msg.serialize()?;
        let sealed = crypto.encrypt(self_id, to, &payload, now)?;

        let mut datagram = Vec::with_capacity(ID_BYTES + sealed.len());
        datagram.extend_from_slice(self_id.as_bytes());
        datagram.extend_from_slice(&sealed);

        let sock = self
            .socket(Family::of(to_addr))
            .ok_or(Error::State("no socket for address family"))?;
        sock.send_to(&datagram, to_addr).await.map_err(Error::Network)?;

        self.messages_sent += 1;
        debug!(to = %to_addr, size = datagram.len(), "sent {}", msg);
        Ok(())
    }

    /// Assign a txid, record the call and send its request.
    /// Returns the txid for timeout scheduling.
    pub async fn send_call(
        &mut self,
        crypto: &mut CryptoCache,
        self_id: &Id,
        mut call: RpcCall,
        now: u64,
    ) -> Result<i32> {
        let txid = self.allocate_txid();
        call.assign_txid(txid);
        call.sent(now);

        let to = *call.target_id();
        let to_addr = *call.target().addr();
        let request = call.request().clone();
        self.calls.insert(txid, call);

        match self
            .send_message(crypto, self_id, &to, &to_addr, &request, now)
            .await
        {
            Ok(()) => Ok(txid),
            Err(e) => {
                self.calls.remove(&txid);
                Err(e)
            }
        }
    }

    pub async fn send_error(
        &mut self,
        crypto: &mut CryptoCache,
        self_id: &Id,
        to: &Id,
        to_addr: &SocketAddr,
        txid: i32,
        code: i32,
        message: impl Into<String>,
        now: u64,
    ) -> Result<()> {
        let msg = Message::error(txid, code, message);
        self.send_message(crypto, self_id, to, to_addr, &msg, now).await
    }

    /// Unwrap an incoming datagram: strip the sender id and open the box.
    /// Any failure means drop, with no reply.
    pub fn decrypt_datagram(
        &mut self,
        crypto: &mut CryptoCache,
        self_id: &Id,
        datagram: &[u8],
        now: u64,
    ) -> Result<(Id, Message)> {
        if datagram.len() <= ID_BYTES + lib_crypto::cryptobox::MAC_BYTES {
            return Err(Error::Protocol("datagram too short".into()));
        }
        let sender = Id::from_bytes(&datagram[..ID_BYTES])?;
        let payload = crypto.decrypt(self_id, &sender, &datagram[ID_BYTES..], now)?;
        let message = Message::parse(&payload)?;
        self.messages_received += 1;
        Ok((sender, message))
    }

    pub fn call(&self, txid: i32) -> Option<&RpcCall> {
        self.calls.get(&txid)
    }

    pub fn call_mut(&mut self, txid: i32) -> Option<&mut RpcCall> {
        self.calls.get_mut(&txid)
    }

    pub fn take_call(&mut self, txid: i32) -> Option<RpcCall> {
        self.calls.remove(&txid)
    }

    /// Cancel every call against `target` (used when a task is cancelled).
    pub fn cancel_calls_for_task(&mut self, task: u64) -> Vec<RpcCall> {
        let txids: Vec<i32> = self
            .calls
            .iter()
            .filter(|(_, call)| call.task() == Some(task))
            .map(|(txid, _)| *txid)
            .collect();
        txids
            .into_iter()
            .filter_map(|txid| {
                let mut call = self.calls.remove(&txid)?;
                call.cancel();
                Some(call)
            })
            .collect()
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Note a verified response on `family`'s socket.
    pub fn on_valid_response(&mut self, family: Family, now: u64) {
        match family {
            Family::V4 => {
                self.last_received4 = now;
                self.reachable4 = true;
            }
            Family::V6 => {
                self.last_received6 = now;
                self.reachable6 = true;
            }
        }
    }

    /// Flip the per-family gauge when the quiet window runs out.
    pub fn check_reachability(&mut self, now: u64) {
        if self.reachable4
            && now.saturating_sub(self.last_received4) > constants::RPC_SERVER_REACHABILITY_TIMEOUT
        {
            warn!("ipv4 socket quiet too long, marking unreachable");
            self.reachable4 = false;
        }
        if self.reachable6
            && now.saturating_sub(self.last_received6) > constants::RPC_SERVER_REACHABILITY_TIMEOUT
        {
            warn!("ipv6 socket quiet too long, marking unreachable");
            self.reachable6 = false;
        }
    }

    pub fn is_reachable(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.reachable4,
            Family::V6 => self.reachable6,
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.messages_received, self.messages_sent)
    }
}
