//! SocketAgent: exposes a node on the network.
//!
//! A [`SocketAgent`] advertises on a TCP port and accepts incoming
//! connections from other nodes. It also connects outward on request. Every
//! socket becomes a [`Connection`] with its own read loop that drives the
//! handshake state machine and then services the link.
//!
//! The [`AgentHandle`] trait abstracts the node's ability to respond to
//! traffic arriving over a link (messages, discovery queries, invalidation
//! crawls, link loss).

use crate::codec::{write_frame, FrameReader, Pipeline};
use crate::connection::{split_names, Connection, ConnectionInfo, Direction};
use crate::error::{WireError, WireResult};
use crate::packet::{Packet, PacketCode};
use crate::state::{Action, HandshakeEnv, Next, State, Step};
use agora_types::{name, Credentials, FlatKv, Message, NodeConfig, Route, RoutingError};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the network event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Callbacks from links into the owning node.
#[async_trait]
pub trait AgentHandle: Send + Sync + 'static {
    /// A message arrived over an authenticated link.
    async fn deliver(&self, message: Message);

    /// A peer asks for a route to `destination`; `path` ends with the peer.
    async fn answer_route_query(
        &self,
        destination: &str,
        path: Route,
    ) -> Result<Option<Route>, RoutingError>;

    /// A peer forwards an invalidation crawl.
    fn invalidate(&self, names: Vec<String>, visited: HashSet<String>);

    /// A link finished its handshake.
    fn link_established(&self, peer: &str);

    /// An authenticated link went away.
    fn link_lost(&self, peer: &str);
}

/// Consulted whenever a peer demands credentials.
pub trait CredentialsHandler: Send + Sync + 'static {
    fn credentials_requested(&self, connection: &ConnectionInfo) -> Option<Credentials>;
}

/// Events observers can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connected {
        id: u64,
        address: SocketAddr,
        direction: Direction,
    },
    Authenticated {
        id: u64,
        peer: String,
    },
    Closed {
        id: u64,
        peer: Option<String>,
        reason: String,
    },
    /// An outbound connection could not be opened or was refused.
    ConnectionFailed {
        address: String,
        reason: String,
    },
    AdvertisingStarted {
        address: SocketAddr,
    },
    AdvertisingFailed {
        port: u16,
        reason: String,
    },
    AdvertisingStopped,
}

/// Link-level configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Host the advertising listener binds to.
    pub bind_host: String,
    pub max_connections: usize,
    pub compression: String,
    pub secure: bool,
    pub master_credentials: Option<Credentials>,
    pub credentials: Option<Credentials>,
    /// Timeout for remote route queries.
    pub request_timeout: Duration,
    /// Interval between latency probes; `None` disables probing.
    pub poke_interval: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::from_node(&NodeConfig::default())
    }
}

impl SocketConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            max_connections: config.max_connections,
            compression: config.compression.clone(),
            secure: config.secure,
            master_credentials: config.master_credentials.clone(),
            credentials: config.credentials.clone(),
            request_timeout: Duration::from_millis(config.discovery_timeout_ms),
            poke_interval: config.poke_interval_secs.map(Duration::from_secs),
        }
    }
}

struct Advertiser {
    address: SocketAddr,
    accepting: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct SocketAgent {
    name: String,
    config: SocketConfig,
    handle: Weak<dyn AgentHandle>,
    connections: DashMap<u64, Arc<Connection>>,
    next_id: AtomicU64,
    events: broadcast::Sender<NetworkEvent>,
    advertiser: Mutex<Option<Advertiser>>,
    credentials_handler: RwLock<Option<Arc<dyn CredentialsHandler>>>,
}

impl SocketAgent {
    pub fn new(name: &str, config: SocketConfig, handle: Weak<dyn AgentHandle>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Arc::new(Self {
            name: name.to_string(),
            config,
            handle,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
            advertiser: Mutex::new(None),
            credentials_handler: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Subscribe to network events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn set_credentials_handler(&self, handler: Arc<dyn CredentialsHandler>) {
        *self
            .credentials_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|c| c.info()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Names of peers with an authenticated link.
    pub fn peer_names(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.is_authenticated())
            .filter_map(|c| c.remote_name())
            .collect()
    }

    /// The authenticated link to `peer`, if any.
    pub fn connection_to(&self, peer: &str) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|c| c.is_authenticated() && c.remote_name().as_deref() == Some(peer))
            .map(|c| Arc::clone(c.value()))
    }

    fn require_connection(&self, peer: &str) -> WireResult<Arc<Connection>> {
        self.connection_to(peer)
            .ok_or_else(|| WireError::NotConnected(peer.to_string()))
    }

    // -----------------------------------------------------------------------
    // Advertising
    // -----------------------------------------------------------------------

    /// Start accepting connections on `port` (0 picks a free port).
    ///
    /// Failure is reported as [`NetworkEvent::AdvertisingFailed`] and `None`.
    pub async fn start_advertising(self: &Arc<Self>, port: u16) -> Option<SocketAddr> {
        self.stop_advertising();

        let listener = match TcpListener::bind((self.config.bind_host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(agent = %self.name, port, error = %e, "Advertising failed");
                self.emit(NetworkEvent::AdvertisingFailed {
                    port,
                    reason: e.to_string(),
                });
                return None;
            }
        };
        let address = match listener.local_addr() {
            Ok(address) => address,
            Err(e) => {
                self.emit(NetworkEvent::AdvertisingFailed {
                    port,
                    reason: e.to_string(),
                });
                return None;
            }
        };

        info!(agent = %self.name, %address, "Advertising");
        let accepting = Arc::new(AtomicBool::new(true));
        let agent = Arc::clone(self);
        let flag = Arc::clone(&accepting);
        let task = tokio::spawn(async move {
            agent.accept_loop(listener, flag).await;
        });
        *self.advertiser.lock().unwrap_or_else(|e| e.into_inner()) = Some(Advertiser {
            address,
            accepting,
            task,
        });
        self.emit(NetworkEvent::AdvertisingStarted { address });
        Some(address)
    }

    /// Stop accepting connections. Existing links are unaffected.
    pub fn stop_advertising(&self) {
        let advertiser = self
            .advertiser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(advertiser) = advertiser {
            advertiser.accepting.store(false, Ordering::Release);
            advertiser.task.abort();
            info!(agent = %self.name, address = %advertiser.address, "Stopped advertising");
            self.emit(NetworkEvent::AdvertisingStopped);
        }
    }

    /// Address of the advertising listener, if running.
    pub fn advertised_address(&self) -> Option<SocketAddr> {
        self.advertiser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.address)
    }

    /// Inbound connections, handshaking ones included. Only these count
    /// against `max_connections`.
    fn inbound_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.direction() == Direction::Inbound)
            .count()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, accepting: Arc<AtomicBool>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(agent = %self.name, %addr, "Accepted connection");
                    if !accepting.load(Ordering::Acquire) {
                        refuse_not_a_server(stream).await;
                        continue;
                    }
                    let initial = if self.inbound_count() >= self.config.max_connections {
                        State::TooManyPeers
                    } else {
                        State::WaitForGreeting
                    };
                    self.spawn_link(stream, addr, Direction::Inbound, initial);
                }
                Err(e) => {
                    error!(agent = %self.name, error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Open a connection in the background. Failure is reported as
    /// [`NetworkEvent::ConnectionFailed`].
    pub fn add_connection(self: &Arc<Self>, host: &str, port: u16) {
        let agent = Arc::clone(self);
        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = agent.connect(&host, port).await {
                agent.emit(NetworkEvent::ConnectionFailed {
                    address: format!("{host}:{port}"),
                    reason: e.to_string(),
                });
            }
        });
    }

    /// Open a connection and start its handshake. The returned connection
    /// may still be handshaking; see [`Connection::wait_authenticated`].
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> WireResult<Arc<Connection>> {
        info!(agent = %self.name, %host, port, "Connecting");
        let stream = TcpStream::connect((host, port)).await?;
        let addr = stream.peer_addr()?;
        Ok(self.spawn_link(stream, addr, Direction::Outbound, State::InitiateGreeting))
    }

    fn spawn_link(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
        initial: State,
    ) -> Arc<Connection> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, addr, direction, initial, writer));
        self.connections.insert(id, Arc::clone(&conn));
        self.emit(NetworkEvent::Connected {
            id,
            address: addr,
            direction,
        });

        let agent = Arc::clone(self);
        let link = Arc::clone(&conn);
        tokio::spawn(async move {
            agent.drive(link, reader, initial).await;
        });
        conn
    }

    // -----------------------------------------------------------------------
    // Read loop
    // -----------------------------------------------------------------------

    async fn drive(self: Arc<Self>, conn: Arc<Connection>, reader: OwnedReadHalf, initial: State) {
        let mut reader = FrameReader::new(reader);
        let reason = match self.run_link(&conn, &mut reader, initial).await {
            Ok(reason) => reason,
            Err(WireError::ConnectionClosed) => "closed by peer".to_string(),
            Err(e) => e.to_string(),
        };
        self.finish(&conn, reason).await;
    }

    /// Run the state machine until it asks to disconnect or the stream
    /// ends. Returns the disconnect reason.
    async fn run_link(
        &self,
        conn: &Arc<Connection>,
        reader: &mut FrameReader<OwnedReadHalf>,
        initial: State,
    ) -> WireResult<String> {
        let step = initial.on_open(&LinkEnv { agent: self, conn });
        if let Some(reason) = self.apply(conn, step).await? {
            return Ok(reason);
        }

        loop {
            let packet = tokio::select! {
                packet = reader.read_packet(conn.pipeline()) => packet?,
                _ = conn.closing() => return Ok("disconnected locally".to_string()),
            };
            let Some(state) = conn.state() else {
                return Ok("disconnected locally".to_string());
            };
            debug!(conn = conn.id(), ?state, code = %packet.code, "Received packet");
            let step = state.on_packet(packet, &LinkEnv { agent: self, conn });
            if let Some(reason) = self.apply(conn, step).await? {
                return Ok(reason);
            }
        }
    }

    /// Execute a transition's effects in order. Returns a reason when the
    /// transition ends the connection.
    async fn apply(&self, conn: &Arc<Connection>, step: Step) -> WireResult<Option<String>> {
        for action in step.actions {
            match action {
                Action::Send(packet) => conn.send_packet(&packet).await?,
                Action::AdoptCompression(name) => conn.adopt_compression(&name)?,
                Action::BeginSecure { peer_key } => conn.begin_secure(&peer_key)?,
                Action::PeerNamed(peer) => conn.set_remote_name(peer),
                Action::Deliver(message) => match self.handle.upgrade() {
                    Some(handle) => handle.deliver(message).await,
                    None => debug!(conn = conn.id(), "Dropping message, node is gone"),
                },
                Action::Control(packet) => self.control(conn, packet).await?,
            }
        }

        match step.next {
            Next::Stay => Ok(None),
            Next::Goto(state) => {
                conn.set_state(state);
                if state == State::Authenticated {
                    self.on_authenticated(conn);
                }
                Ok(None)
            }
            Next::Disconnect(reason) => Ok(Some(reason)),
        }
    }

    fn on_authenticated(&self, conn: &Arc<Connection>) {
        let peer = conn.remote_name().unwrap_or_default();
        info!(
            agent = %self.name,
            %peer,
            addr = %conn.address(),
            direction = ?conn.direction(),
            "Link authenticated"
        );
        self.emit(NetworkEvent::Authenticated {
            id: conn.id(),
            peer: peer.clone(),
        });
        if let Some(handle) = self.handle.upgrade() {
            handle.link_established(&peer);
        }
        if let Some(interval) = self.config.poke_interval {
            spawn_prober(Arc::clone(conn), interval);
        }
    }

    /// Service post-handshake control traffic.
    async fn control(&self, conn: &Arc<Connection>, packet: Packet) -> WireResult<()> {
        match packet.code {
            PacketCode::Poke => {
                let id = packet.param("id")?;
                conn.send_packet(&Packet::with_params(
                    PacketCode::PokeReply,
                    FlatKv::new().with("id", id),
                ))
                .await
            }
            PacketCode::PokeReply | PacketCode::RouteReply => {
                conn.resolve(packet);
                Ok(())
            }
            PacketCode::RouteQuery => {
                let id = packet.param("id")?;
                let destination = packet.param("destination")?;
                let path = packet.param("path")?;
                // Answering may fan out over this same link, so it must not
                // block the read loop.
                let handle = self.handle.clone();
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    let reply = answer_route_query(handle, &destination, &path).await;
                    let _ = conn
                        .send_packet(&Packet::with_params(
                            PacketCode::RouteReply,
                            reply.with("id", id),
                        ))
                        .await;
                });
                Ok(())
            }
            PacketCode::Invalidate => {
                let names = split_names(&packet.param("names")?);
                let visited = split_names(&packet.param("visited")?).into_iter().collect();
                if let Some(handle) = self.handle.upgrade() {
                    handle.invalidate(names, visited);
                }
                Ok(())
            }
            code => Err(WireError::StreamCorrupted(format!(
                "{code} is not a control packet"
            ))),
        }
    }

    async fn finish(&self, conn: &Arc<Connection>, reason: String) {
        let was_authenticated = conn.was_established();
        let peer = conn.remote_name();
        conn.disconnect().await;
        self.connections.remove(&conn.id());

        info!(
            agent = %self.name,
            peer = peer.as_deref().unwrap_or("?"),
            addr = %conn.address(),
            %reason,
            "Link closed"
        );
        if conn.direction() == Direction::Outbound && !was_authenticated {
            self.emit(NetworkEvent::ConnectionFailed {
                address: conn.address().to_string(),
                reason: reason.clone(),
            });
        }
        self.emit(NetworkEvent::Closed {
            id: conn.id(),
            peer: peer.clone(),
            reason,
        });
        if let (true, Some(peer)) = (was_authenticated, peer) {
            if let Some(handle) = self.handle.upgrade() {
                handle.link_lost(&peer);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Traffic
    // -----------------------------------------------------------------------

    /// Send a message to a directly connected peer.
    pub async fn send_message(&self, peer: &str, message: &Message) -> WireResult<()> {
        let conn = self.require_connection(peer)?;
        if conn.send_message(message).await? {
            Ok(())
        } else {
            Err(WireError::NotConnected(peer.to_string()))
        }
    }

    /// Ask a directly connected peer for a route to `destination`.
    pub async fn query_route(
        &self,
        peer: &str,
        destination: &str,
        path: &Route,
    ) -> WireResult<Option<Route>> {
        self.require_connection(peer)?
            .query_route(destination, path, self.config.request_timeout)
            .await
    }

    /// Round-trip probe to a directly connected peer.
    pub async fn poke(&self, peer: &str, timeout: Duration) -> WireResult<Duration> {
        self.require_connection(peer)?.poke(timeout).await
    }

    /// Authenticated peers not in `visited`, sorted by name.
    pub fn invalidation_targets(&self, visited: &HashSet<String>) -> Vec<String> {
        let mut targets: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.is_authenticated())
            .filter_map(|c| c.remote_name())
            .filter(|n| !visited.contains(n))
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Send an invalidation crawl to each of `peers`. `visited` is carried
    /// as is. Returns the peers it reached.
    pub async fn send_invalidation(
        &self,
        peers: &[String],
        names: &[String],
        visited: &HashSet<String>,
    ) -> Vec<String> {
        let mut sent = Vec::with_capacity(peers.len());
        for peer in peers {
            let Some(conn) = self.connection_to(peer) else {
                warn!(agent = %self.name, %peer, "Invalidation target is no longer linked");
                continue;
            };
            match conn.send_invalidation(names, visited).await {
                Ok(()) => sent.push(peer.clone()),
                Err(e) => warn!(agent = %self.name, %peer, error = %e, "Invalidation forward failed"),
            }
        }
        sent
    }

    /// Forward an invalidation crawl to every peer not yet visited. The set
    /// carried to each peer also names this node and every other target, so
    /// no target forwards the crawl to a sibling. Returns the names of the
    /// peers it was sent to.
    pub async fn forward_invalidation(
        &self,
        names: &[String],
        visited: &HashSet<String>,
    ) -> Vec<String> {
        let targets = self.invalidation_targets(visited);
        if targets.is_empty() {
            return targets;
        }
        let mut carried = visited.clone();
        carried.insert(self.name.clone());
        carried.extend(targets.iter().cloned());
        self.send_invalidation(&targets, names, &carried).await
    }

    /// Close the authenticated link to `peer`. Returns whether one existed.
    pub async fn disconnect_peer(&self, peer: &str) -> bool {
        match self.connection_to(peer) {
            Some(conn) => {
                conn.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub async fn disconnect_all(&self) {
        let all: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        for conn in all {
            conn.disconnect().await;
        }
    }

    /// Stop advertising and close every connection.
    pub async fn shutdown(&self) {
        self.stop_advertising();
        self.disconnect_all().await;
    }
}

/// The handshake's view of the node and the link being negotiated.
struct LinkEnv<'a> {
    agent: &'a SocketAgent,
    conn: &'a Connection,
}

impl HandshakeEnv for LinkEnv<'_> {
    fn local_name(&self) -> &str {
        &self.agent.name
    }

    fn public_key(&self) -> String {
        self.conn.public_key()
    }

    fn compression(&self) -> &str {
        &self.agent.config.compression
    }

    fn secure(&self) -> bool {
        self.agent.config.secure
    }

    fn master_credentials(&self) -> Option<&Credentials> {
        self.agent.config.master_credentials.as_ref()
    }

    fn request_credentials(&self) -> Option<Credentials> {
        let handler = self
            .agent
            .credentials_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.credentials_requested(&self.conn.info()),
            None => self.agent.config.credentials.clone(),
        }
    }

    fn admit_peer_name(&self, peer: &str) -> Result<(), String> {
        if !name::is_valid(peer) {
            return Err(format!("invalid agent name {peer:?}"));
        }
        if peer == self.agent.name {
            return Err("peer claims this node's name".to_string());
        }
        let taken = self.agent.connections.iter().any(|c| {
            c.id() != self.conn.id() && c.remote_name().as_deref() == Some(peer)
        });
        if taken {
            return Err(format!("already connected to {peer}"));
        }
        Ok(())
    }
}

async fn answer_route_query(handle: Weak<dyn AgentHandle>, destination: &str, path: &str) -> FlatKv {
    let Some(handle) = handle.upgrade() else {
        return FlatKv::new().with("error", "node is gone");
    };
    let result = match Route::parse(path) {
        Ok(path) => handle.answer_route_query(destination, path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(Some(route)) => FlatKv::new().with("route", route.serialize()),
        Ok(None) => FlatKv::new(),
        Err(e) => FlatKv::new().with("error", e.to_string()),
    }
}

/// Answer a connection accepted after advertising stopped.
async fn refuse_not_a_server(stream: TcpStream) {
    let Ok(frame) = Pipeline::default().encode(&Packet::bare(PacketCode::NotAServer)) else {
        return;
    };
    let (_, mut writer) = stream.into_split();
    let _ = write_frame(&mut writer, &frame).await;
}

/// Probe an authenticated link periodically until it closes. A failed
/// probe is logged and otherwise ignored.
fn spawn_prober(conn: Arc<Connection>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if conn.is_closed() {
                break;
            }
            match conn.poke(interval).await {
                Ok(rtt) => debug!(conn = conn.id(), rtt_ms = rtt.as_millis() as u64, "Poke"),
                Err(e) => warn!(conn = conn.id(), error = %e, "Poke failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    enum Seen {
        Delivered(Message),
        Invalidate(Vec<String>, HashSet<String>),
        Established(String),
        Lost(String),
    }

    struct TestHandle {
        name: String,
        seen: mpsc::UnboundedSender<Seen>,
    }

    #[async_trait]
    impl AgentHandle for TestHandle {
        async fn deliver(&self, message: Message) {
            let _ = self.seen.send(Seen::Delivered(message));
        }

        async fn answer_route_query(
            &self,
            destination: &str,
            path: Route,
        ) -> Result<Option<Route>, RoutingError> {
            if destination == self.name {
                path.extended(&self.name).map(Some)
            } else {
                Ok(None)
            }
        }

        fn invalidate(&self, names: Vec<String>, visited: HashSet<String>) {
            let _ = self.seen.send(Seen::Invalidate(names, visited));
        }

        fn link_established(&self, peer: &str) {
            let _ = self.seen.send(Seen::Established(peer.to_string()));
        }

        fn link_lost(&self, peer: &str) {
            let _ = self.seen.send(Seen::Lost(peer.to_string()));
        }
    }

    struct Node {
        socket: Arc<SocketAgent>,
        seen: mpsc::UnboundedReceiver<Seen>,
        _handle: Arc<dyn AgentHandle>,
    }

    fn local_config() -> SocketConfig {
        SocketConfig {
            bind_host: "127.0.0.1".to_string(),
            poke_interval: None,
            request_timeout: WAIT,
            ..SocketConfig::default()
        }
    }

    fn node(name: &str, config: SocketConfig) -> Node {
        let (tx, seen) = mpsc::unbounded_channel();
        let handle: Arc<dyn AgentHandle> = Arc::new(TestHandle {
            name: name.to_string(),
            seen: tx,
        });
        let socket = SocketAgent::new(name, config, Arc::downgrade(&handle));
        Node {
            socket,
            seen,
            _handle: handle,
        }
    }

    async fn next_seen(node: &mut Node) -> Seen {
        tokio::time::timeout(WAIT, node.seen.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("handle dropped")
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Connect `from` to `to`, advertising `to` first if needed.
    async fn link(from: &mut Node, to: &mut Node) {
        let addr = match to.socket.advertised_address() {
            Some(addr) => addr,
            None => to.socket.start_advertising(0).await.expect("advertise"),
        };
        let conn = from.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(conn.wait_authenticated(WAIT).await.unwrap(), to.socket.name());
        assert!(matches!(next_seen(from).await, Seen::Established(_)));
        assert!(matches!(next_seen(to).await, Seen::Established(_)));
    }

    async fn linked_pair(a: SocketConfig, b: SocketConfig) -> (Node, Node) {
        let mut a = node("alpha", a);
        let mut b = node("beta", b);
        let addr = b.socket.start_advertising(0).await.expect("advertise");
        let conn = a.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(conn.wait_authenticated(WAIT).await.unwrap(), "beta");
        assert!(matches!(next_seen(&mut a).await, Seen::Established(p) if p == "beta"));
        assert!(matches!(next_seen(&mut b).await, Seen::Established(p) if p == "alpha"));
        (a, b)
    }

    #[tokio::test]
    async fn test_handshake_and_message() {
        let (a, mut b) = linked_pair(local_config(), local_config()).await;
        assert_eq!(a.socket.peer_names(), vec!["beta".to_string()]);
        assert_eq!(b.socket.peer_names(), vec!["alpha".to_string()]);

        let info = &a.socket.connections()[0];
        assert_eq!(info.compression, "deflate");
        assert_eq!(info.encryption, "aes256gcm");

        let route = Route::from_hops(["alpha", "beta"]).unwrap();
        let message = Message::new(route, "hello").unwrap();
        a.socket.send_message("beta", &message).await.unwrap();
        match next_seen(&mut b).await {
            Seen::Delivered(got) => assert_eq!(got, message),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_insecure_uncompressed_link() {
        let plain = SocketConfig {
            secure: false,
            compression: "none".to_string(),
            ..local_config()
        };
        let (a, _b) = linked_pair(local_config(), plain).await;
        let info = &a.socket.connections()[0];
        assert_eq!(info.compression, "none");
        assert_eq!(info.encryption, "plain");
    }

    #[tokio::test]
    async fn test_credentials_accepted() {
        let server = SocketConfig {
            master_credentials: Some(Credentials::new("admin", "hunter2")),
            ..local_config()
        };
        let client = SocketConfig {
            credentials: Some(Credentials::new("admin", "hunter2")),
            ..local_config()
        };
        let (a, _b) = linked_pair(client, server).await;
        assert!(a.socket.connection_to("beta").is_some());
    }

    #[tokio::test]
    async fn test_missing_or_bad_credentials_rejected() {
        let server = SocketConfig {
            master_credentials: Some(Credentials::new("admin", "hunter2")),
            ..local_config()
        };
        let b = node("beta", server);
        let addr = b.socket.start_advertising(0).await.unwrap();

        let anonymous = node("alpha", local_config());
        let conn = anonymous.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());

        let wrong = node(
            "gamma",
            SocketConfig {
                credentials: Some(Credentials::new("admin", "letmein")),
                ..local_config()
            },
        );
        let conn = wrong.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());
        assert!(b.socket.peer_names().is_empty());
    }

    struct FixedCredentials;

    impl CredentialsHandler for FixedCredentials {
        fn credentials_requested(&self, _connection: &ConnectionInfo) -> Option<Credentials> {
            Some(Credentials::new("admin", "hunter2"))
        }
    }

    #[tokio::test]
    async fn test_credentials_handler_consulted() {
        let server = SocketConfig {
            master_credentials: Some(Credentials::new("admin", "hunter2")),
            ..local_config()
        };
        let b = node("beta", server);
        let addr = b.socket.start_advertising(0).await.unwrap();
        let a = node("alpha", local_config());
        a.socket.set_credentials_handler(Arc::new(FixedCredentials));
        let conn = a.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(conn.wait_authenticated(WAIT).await.unwrap(), "beta");
    }

    #[tokio::test]
    async fn test_too_many_peers() {
        let full = SocketConfig {
            max_connections: 0,
            ..local_config()
        };
        let b = node("beta", full);
        let addr = b.socket.start_advertising(0).await.unwrap();

        let a = node("alpha", local_config());
        let mut events = a.socket.subscribe();
        let conn = a.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());

        let failed = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(NetworkEvent::ConnectionFailed { address, .. }) = events.recv().await {
                    return address;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed, addr.to_string());
        assert!(b.socket.peer_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_peer_name_refused() {
        let (_a, b) = linked_pair(local_config(), local_config()).await;
        let addr = b.socket.advertised_address().unwrap();
        let impostor = node("alpha", local_config());
        let conn = impostor.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());
    }

    #[tokio::test]
    async fn test_poke_and_route_query() {
        let (a, _b) = linked_pair(local_config(), local_config()).await;
        let rtt = a.socket.poke("beta", WAIT).await.unwrap();
        assert!(rtt < WAIT);
        assert_eq!(a.socket.connections()[0].last_rtt, Some(rtt));

        let path = Route::new("alpha").unwrap().extended("beta").unwrap();
        let found = a.socket.query_route("beta", "beta", &path).await.unwrap();
        assert!(found.is_none(), "beta is already on the path");

        let path = Route::new("alpha").unwrap();
        let found = a.socket.query_route("beta", "beta", &path).await.unwrap();
        assert_eq!(found.unwrap().hops(), ["alpha", "beta"]);

        let found = a.socket.query_route("beta", "nowhere", &path).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_forward_invalidation_skips_visited() {
        let (a, mut b) = linked_pair(local_config(), local_config()).await;
        let names = vec!["gamma".to_string()];

        let visited: HashSet<String> = ["alpha", "beta"].iter().map(|s| s.to_string()).collect();
        assert!(a.socket.forward_invalidation(&names, &visited).await.is_empty());

        let visited: HashSet<String> = HashSet::new();
        let sent = a.socket.forward_invalidation(&names, &visited).await;
        assert_eq!(sent, vec!["beta".to_string()]);
        match next_seen(&mut b).await {
            Seen::Invalidate(got, seen) => {
                assert_eq!(got, names);
                assert_eq!(seen, set(&["alpha", "beta"]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalidation_reaches_each_triangle_peer_once() {
        let mut a = node("alpha", local_config());
        let mut b = node("beta", local_config());
        let mut c = node("gamma", local_config());
        link(&mut a, &mut b).await;
        link(&mut a, &mut c).await;
        link(&mut b, &mut c).await;

        let names = vec!["ghost".to_string()];
        let sent = a.socket.forward_invalidation(&names, &set(&["alpha"])).await;
        assert_eq!(sent, ["beta", "gamma"]);

        for peer in [&mut b, &mut c] {
            let carried = match next_seen(peer).await {
                Seen::Invalidate(got, carried) => {
                    assert_eq!(got, names);
                    carried
                }
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(carried, set(&["alpha", "beta", "gamma"]));
            // The sibling is already marked, so the crawl stops here.
            assert!(peer.socket.forward_invalidation(&names, &carried).await.is_empty());
        }
        for peer in [&mut b, &mut c] {
            let extra = tokio::time::timeout(Duration::from_millis(200), peer.seen.recv()).await;
            assert!(extra.is_err(), "second invalidation delivered: {extra:?}");
        }
    }

    #[tokio::test]
    async fn test_outbound_links_do_not_use_capacity() {
        let mut b = node(
            "beta",
            SocketConfig {
                max_connections: 1,
                ..local_config()
            },
        );
        let mut c = node("gamma", local_config());
        link(&mut b, &mut c).await;

        let mut a = node("alpha", local_config());
        link(&mut a, &mut b).await;
        assert_eq!(b.socket.connection_count(), 2);

        let addr = b.socket.advertised_address().unwrap();
        let late = node("delta", local_config());
        let conn = late.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());
        assert_eq!(b.socket.peer_names().len(), 2);
    }

    #[tokio::test]
    async fn test_not_a_server_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                refuse_not_a_server(stream).await;
            }
        });

        let raw = TcpStream::connect(addr).await.unwrap();
        let mut reader = FrameReader::new(raw);
        let refusal = reader
            .read_packet(&Mutex::new(Pipeline::default()))
            .await
            .unwrap();
        assert_eq!(refusal.code, PacketCode::NotAServer);

        let a = node("alpha", local_config());
        let mut events = a.socket.subscribe();
        let conn = a.socket.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.wait_authenticated(WAIT).await.is_err());
        let failed = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(NetworkEvent::ConnectionFailed { address, .. }) = events.recv().await {
                    return address;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed, addr.to_string());
        assert!(a.socket.peer_names().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_reports_link_lost() {
        let (mut a, mut b) = linked_pair(local_config(), local_config()).await;
        assert!(a.socket.disconnect_peer("beta").await);
        assert!(!a.socket.disconnect_peer("beta").await);
        assert!(matches!(next_seen(&mut a).await, Seen::Lost(p) if p == "beta"));
        assert!(matches!(next_seen(&mut b).await, Seen::Lost(p) if p == "alpha"));
        let message = Message::new(Route::from_hops(["alpha", "beta"]).unwrap(), "x").unwrap();
        assert!(matches!(
            a.socket.send_message("beta", &message).await,
            Err(WireError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_advertising_events() {
        let b = node("beta", local_config());
        let mut events = b.socket.subscribe();
        let addr = b.socket.start_advertising(0).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            NetworkEvent::AdvertisingStarted { address: addr }
        );

        let clash = node("gamma", local_config());
        let mut clash_events = clash.socket.subscribe();
        assert!(clash.socket.start_advertising(addr.port()).await.is_none());
        assert!(matches!(
            clash_events.recv().await.unwrap(),
            NetworkEvent::AdvertisingFailed { port, .. } if port == addr.port()
        ));

        b.socket.stop_advertising();
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::AdvertisingStopped);
        assert!(b.socket.advertised_address().is_none());
    }
}
