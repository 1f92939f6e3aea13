//! Connection: one TCP link, its negotiated pipeline and handshake status.
//!
//! A [`Connection`] owns the write half of its socket. The read half lives in
//! the read loop spawned by [`SocketAgent`](crate::SocketAgent), which is the
//! only writer of the connection's [`State`]. Requests that expect a reply
//! (pokes, remote route queries) are correlated by an `id` parameter.

use crate::codec::{write_frame, Pipeline};
use crate::compression;
use crate::encryption::KeyPair;
use crate::error::{WireError, WireResult};
use crate::packet::{Packet, PacketCode};
use crate::state::State;
use agora_types::{FlatKv, Message, Route};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, watch, Notify};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Observable lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open(State),
    Closed,
}

/// A point-in-time snapshot of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub address: SocketAddr,
    pub direction: Direction,
    /// Known once the peer has introduced itself.
    pub remote_name: Option<String>,
    pub status: ConnectionStatus,
    pub compression: &'static str,
    pub encryption: &'static str,
    pub connected_at: DateTime<Utc>,
    /// Round-trip time of the most recent successful poke.
    pub last_rtt: Option<Duration>,
}

pub struct Connection {
    id: u64,
    address: SocketAddr,
    direction: Direction,
    connected_at: DateTime<Utc>,
    keys: KeyPair,
    pipeline: Mutex<Pipeline>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    status: watch::Sender<ConnectionStatus>,
    remote_name: RwLock<Option<String>>,
    pending: DashMap<String, oneshot::Sender<Packet>>,
    last_rtt: Mutex<Option<Duration>>,
    shutdown: Notify,
    closed: AtomicBool,
    established: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        address: SocketAddr,
        direction: Direction,
        initial: State,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Open(initial));
        Self {
            id,
            address,
            direction,
            connected_at: Utc::now(),
            keys: KeyPair::generate(),
            pipeline: Mutex::new(Pipeline::default()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            status,
            remote_name: RwLock::new(None),
            pending: DashMap::new(),
            last_rtt: Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            established: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_name(&self) -> Option<String> {
        self.remote_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Current protocol state, or `None` once closed.
    pub fn state(&self) -> Option<State> {
        match self.status() {
            ConnectionStatus::Open(state) => Some(state),
            ConnectionStatus::Closed => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == Some(State::Authenticated)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn info(&self) -> ConnectionInfo {
        let pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
        ConnectionInfo {
            id: self.id,
            address: self.address,
            direction: self.direction,
            remote_name: self.remote_name(),
            status: self.status(),
            compression: pipeline.compression_name(),
            encryption: pipeline.encryption_name(),
            connected_at: self.connected_at,
            last_rtt: *self.last_rtt.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Wait until the handshake completes, returning the peer's name.
    pub async fn wait_authenticated(&self, timeout: Duration) -> WireResult<String> {
        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                matches!(
                    s,
                    ConnectionStatus::Open(State::Authenticated) | ConnectionStatus::Closed
                )
            }),
        )
        .await;
        let status = match settled {
            Err(_) => return Err(WireError::Timeout),
            Ok(Err(_)) => return Err(WireError::ConnectionClosed),
            Ok(Ok(status)) => *status,
        };
        match (status, self.remote_name()) {
            (ConnectionStatus::Open(State::Authenticated), Some(name)) => Ok(name),
            _ => Err(WireError::ConnectionClosed),
        }
    }

    pub(crate) fn pipeline(&self) -> &Mutex<Pipeline> {
        &self.pipeline
    }

    pub(crate) fn public_key(&self) -> String {
        self.keys.public_base64()
    }

    pub(crate) fn set_state(&self, state: State) {
        if self.is_closed() {
            return;
        }
        if state == State::Authenticated {
            self.established.store(true, Ordering::Release);
        }
        self.status.send_replace(ConnectionStatus::Open(state));
    }

    /// Whether the link ever completed its handshake, even if closed since.
    pub fn was_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_name(&self, name: String) {
        *self.remote_name.write().unwrap_or_else(|e| e.into_inner()) = Some(name);
    }

    pub(crate) fn adopt_compression(&self, name: &str) -> WireResult<()> {
        let provider = compression::by_name(name)
            .ok_or_else(|| WireError::HandshakeFailed(format!("unknown compression {name}")))?;
        self.pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_compression(provider);
        Ok(())
    }

    pub(crate) fn begin_secure(&self, peer_key: &str) -> WireResult<()> {
        let cipher = self.keys.cipher_for(peer_key)?;
        self.pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_encryption(Box::new(cipher));
        Ok(())
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub(crate) async fn closing(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Encode with the current pipeline and write one frame.
    pub async fn send_packet(&self, packet: &Packet) -> WireResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(WireError::ConnectionClosed);
        };
        let frame = self
            .pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .encode(packet)?;
        debug!(conn = self.id, code = %packet.code, bytes = frame.len(), "Sending packet");
        write_frame(stream, &frame).await
    }

    /// Send a user message. Returns `false` without sending while the
    /// handshake is still in progress.
    pub async fn send_message(&self, message: &Message) -> WireResult<bool> {
        match self.state() {
            Some(state) if state.allows_user_traffic() => {
                self.send_packet(&Packet::new(PacketCode::Propagate, message.serialize()))
                    .await?;
                Ok(true)
            }
            Some(state) => {
                debug!(conn = self.id, ?state, "Suppressing message during handshake");
                Ok(false)
            }
            None => Err(WireError::ConnectionClosed),
        }
    }

    /// Send a request and wait for the packet that answers it.
    ///
    /// A connection that closes while the request is pending resolves as a
    /// timeout.
    async fn request(
        &self,
        code: PacketCode,
        params: FlatKv,
        timeout: Duration,
    ) -> WireResult<Packet> {
        if !self.is_authenticated() {
            return Err(WireError::NotConnected(
                self.remote_name().unwrap_or_else(|| self.address.to_string()),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = self
            .send_packet(&Packet::with_params(code, params.with("id", id.as_str())))
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        let reply = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(&id);
        match reply {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) | Err(_) => Err(WireError::Timeout),
        }
    }

    /// Route a reply to the request waiting on its `id`.
    pub(crate) fn resolve(&self, packet: Packet) {
        let Some(id) = packet.params().get("id").map(str::to_string) else {
            debug!(conn = self.id, code = %packet.code, "Reply without id");
            return;
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(packet);
            }
            None => debug!(conn = self.id, %id, "Late or unknown reply"),
        }
    }

    /// Measure the round-trip time of a POKE/POKE_REPLY exchange.
    pub async fn poke(&self, timeout: Duration) -> WireResult<Duration> {
        let started = Instant::now();
        self.request(PacketCode::Poke, FlatKv::new(), timeout).await?;
        let rtt = started.elapsed();
        *self.last_rtt.lock().unwrap_or_else(|e| e.into_inner()) = Some(rtt);
        Ok(rtt)
    }

    /// Ask the peer to find a route to `destination`, extending `path`.
    pub async fn query_route(
        &self,
        destination: &str,
        path: &Route,
        timeout: Duration,
    ) -> WireResult<Option<Route>> {
        let reply = self
            .request(
                PacketCode::RouteQuery,
                FlatKv::new()
                    .with("destination", destination)
                    .with("path", path.serialize()),
                timeout,
            )
            .await?;
        let params = reply.params();
        if let Some(error) = params.get("error") {
            debug!(conn = self.id, %destination, %error, "Remote route query failed");
            return Ok(None);
        }
        match params.get("route") {
            Some(route) if !route.is_empty() => Ok(Some(Route::parse(route)?)),
            _ => Ok(None),
        }
    }

    /// Forward an invalidation crawl to the peer.
    pub async fn send_invalidation(
        &self,
        names: &[String],
        visited: &HashSet<String>,
    ) -> WireResult<()> {
        let mut visited: Vec<&str> = visited.iter().map(String::as_str).collect();
        visited.sort_unstable();
        self.send_packet(&Packet::with_params(
            PacketCode::Invalidate,
            FlatKv::new()
                .with("names", names.join(","))
                .with("visited", visited.join(",")),
        ))
        .await
    }

    /// Close the link. Idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        self.status.send_replace(ConnectionStatus::Closed);
        self.pending.clear();
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        debug!(conn = self.id, addr = %self.address, "Connection closed");
    }
}

/// Split a comma-joined name list as carried by INVALIDATE.
pub(crate) fn split_names(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
