//! Agent: a named node of the overlay.
//!
//! An agent keeps its routing table and its in-process peers, forwards
//! messages hop by hop along their routes, and hands messages addressed to
//! it to every registered [`MessageListener`]. With a socket attached it
//! also reaches peers over TCP links; the wire layer calls back into the
//! agent through [`AgentHandle`].

use crate::error::{AgentError, AgentResult};
use crate::routing::{RoutingTable, RoutingWorker};
use crate::undertaker::{CrawlReport, Undertaker};
use agora_types::{name, Message, NodeConfig, Route, RoutingError};
use agora_wire::{AgentHandle, SocketAgent, SocketConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives messages addressed to the agent it is registered with.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);
}

impl<F> MessageListener for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

pub struct Agent {
    name: String,
    me: Weak<Agent>,
    table: RoutingTable,
    peers: DashMap<String, Weak<Agent>>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    socket: OnceLock<Arc<SocketAgent>>,
    max_hops: usize,
    discovery_timeout: Duration,
}

impl Agent {
    /// Create an agent with default routing limits.
    pub fn new(name: &str) -> AgentResult<Arc<Self>> {
        Self::with_config(&NodeConfig {
            name: name.to_string(),
            ..NodeConfig::default()
        })
    }

    /// Create an agent named and bounded by `config`. No socket is attached.
    pub fn with_config(config: &NodeConfig) -> AgentResult<Arc<Self>> {
        let name = name::validate(&config.name)?;
        Ok(Arc::new_cyclic(|me| Self {
            name,
            me: me.clone(),
            table: RoutingTable::new(),
            peers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            socket: OnceLock::new(),
            max_hops: config.max_hops,
            discovery_timeout: Duration::from_millis(config.discovery_timeout_ms),
        }))
    }

    /// Create an agent, attach a socket, start advertising if a listen port
    /// is configured and dial every configured peer.
    pub async fn boot(config: &NodeConfig) -> AgentResult<Arc<Self>> {
        let agent = Self::with_config(config)?;
        let socket = agent.attach_socket(SocketConfig::from_node(config));
        if let Some(port) = config.listen_port {
            socket.start_advertising(port).await;
        }
        for peer in &config.peers {
            match parse_peer(peer) {
                Some((host, port)) => socket.add_connection(&host, port),
                None => warn!(agent = %agent.name, %peer, "Ignoring malformed peer address"),
            }
        }
        info!(agent = %agent.name, peers = config.peers.len(), "Agent booted");
        Ok(agent)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub(crate) fn max_hops(&self) -> usize {
        self.max_hops
    }

    pub(crate) fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
    }

    // -----------------------------------------------------------------------
    // Adjacency
    // -----------------------------------------------------------------------

    /// Link two in-process agents and seed their one-hop routes.
    pub fn link(a: &Arc<Agent>, b: &Arc<Agent>) -> AgentResult<()> {
        if a.name == b.name {
            return Err(RoutingError::DuplicateAgentName(a.name.clone()).into());
        }
        a.peers.insert(b.name.clone(), Arc::downgrade(b));
        b.peers.insert(a.name.clone(), Arc::downgrade(a));
        a.table.add_route(&b.name, Route::from_hops([&a.name, &b.name])?);
        b.table.add_route(&a.name, Route::from_hops([&b.name, &a.name])?);
        info!(a = %a.name, b = %b.name, "Agents linked");
        Ok(())
    }

    /// Sever an in-process link. Each side starts an invalidation crawl for
    /// the other; the returned handles complete when the crawls do.
    pub fn unlink(a: &Arc<Agent>, b: &Arc<Agent>) -> Vec<JoinHandle<CrawlReport>> {
        let removed_a = a.peers.remove(&b.name).is_some();
        let removed_b = b.peers.remove(&a.name).is_some();
        if !removed_a && !removed_b {
            return Vec::new();
        }
        info!(a = %a.name, b = %b.name, "Agents unlinked");
        vec![
            Undertaker::new(Arc::clone(a), vec![b.name.clone()]).spawn(),
            Undertaker::new(Arc::clone(b), vec![a.name.clone()]).spawn(),
        ]
    }

    /// Live in-process peers.
    pub(crate) fn local_peers(&self) -> Vec<Arc<Agent>> {
        self.peers.iter().filter_map(|p| p.value().upgrade()).collect()
    }

    pub(crate) fn is_local_peer(&self, peer: &str) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|p| p.value().strong_count() > 0)
    }

    fn local_peer(&self, peer: &str) -> Option<Arc<Agent>> {
        self.peers.get(peer).and_then(|p| p.value().upgrade())
    }

    /// Names of every directly reachable agent, in-process or over a link.
    pub fn neighbors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local_peers().iter().map(|p| p.name.clone()).collect();
        if let Some(socket) = self.socket() {
            names.extend(socket.peer_names());
        }
        names.sort();
        names.dedup();
        names
    }

    // -----------------------------------------------------------------------
    // Network
    // -----------------------------------------------------------------------

    /// Attach a socket agent. Attaching twice returns the first socket.
    pub fn attach_socket(&self, config: SocketConfig) -> Arc<SocketAgent> {
        let socket = self.socket.get_or_init(|| {
            let handle: Weak<dyn AgentHandle> = self.me.clone();
            SocketAgent::new(&self.name, config, handle)
        });
        Arc::clone(socket)
    }

    pub fn socket(&self) -> Option<&Arc<SocketAgent>> {
        self.socket.get()
    }

    /// Stop advertising and close every link.
    pub async fn shutdown(&self) {
        if let Some(socket) = self.socket() {
            socket.shutdown().await;
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// The route to `destination`, discovering one if the table has none.
    pub async fn route_to(&self, destination: &str) -> AgentResult<Route> {
        if destination == self.name {
            return Err(RoutingError::RouteToSelf(destination.to_string()).into());
        }
        if let Some(route) = self.table.get_route(destination) {
            return Ok(route);
        }
        let me = self.me.upgrade().ok_or_else(|| AgentError::NoRoute(destination.to_string()))?;
        RoutingWorker::new(me, destination)?
            .run()
            .await?
            .ok_or_else(|| AgentError::NoRoute(destination.to_string()))
    }

    /// Send `data` to `destination`. Returns the message that was sent.
    pub async fn send(self: &Arc<Self>, destination: &str, data: &str) -> AgentResult<Message> {
        let route = self.route_to(destination).await?;
        let message = Message::new(route, data)?;
        debug!(agent = %self.name, id = %message.id(), route = %message.route(), "Sending");
        Arc::clone(self).receive(message.clone()).await?;
        Ok(message)
    }

    /// Handle a message that reached this agent: deliver it to the listeners
    /// if this agent is the recipient, otherwise pass it to the next hop.
    pub fn receive(self: Arc<Self>, message: Message) -> BoxFuture<'static, AgentResult<()>> {
        async move {
            if message.originator() != self.name {
                if let Some(back) = message.route().reverse_from(&self.name) {
                    self.table.add_route(message.originator(), back);
                }
            }

            if message.recipient() == self.name {
                self.notify(&message);
                return Ok(());
            }

            let next = message.route().next_hop_after(&self.name)?;
            if let Some(peer) = self.local_peer(&next) {
                return peer.receive(message).await;
            }
            match self.socket() {
                Some(socket) if socket.connection_to(&next).is_some() => {
                    socket.send_message(&next, &message).await?;
                    Ok(())
                }
                _ => {
                    warn!(agent = %self.name, %next, id = %message.id(), "Next hop unreachable");
                    Err(AgentError::UnknownNeighbor(next))
                }
            }
        }
        .boxed()
    }

    fn notify(&self, message: &Message) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        debug!(agent = %self.name, id = %message.id(), listeners = listeners.len(), "Delivering");
        for listener in listeners {
            listener.on_message(message);
        }
    }

    /// Answer a neighbor's discovery query. `path` ends with the neighbor.
    pub fn answer_query(
        self: Arc<Self>,
        destination: String,
        path: Route,
    ) -> BoxFuture<'static, AgentResult<Option<Route>>> {
        async move {
            let path = path.extended(&self.name)?;
            if destination == self.name {
                return Ok(Some(path));
            }
            if let Some(known) = self.table.get_route(&destination) {
                match path.join(&known) {
                    Ok(route) => return Ok(Some(route)),
                    Err(e) => debug!(agent = %self.name, error = %e, "Known route loops back"),
                }
            }
            RoutingWorker::delegated(self, &destination, path).run().await
        }
        .boxed()
    }
}

#[async_trait]
impl AgentHandle for Agent {
    async fn deliver(&self, message: Message) {
        let Some(me) = self.me.upgrade() else { return };
        let id = message.id().to_string();
        if let Err(e) = me.receive(message).await {
            warn!(agent = %self.name, %id, error = %e, "Message dropped");
        }
    }

    async fn answer_route_query(
        &self,
        destination: &str,
        path: Route,
    ) -> Result<Option<Route>, RoutingError> {
        let Some(me) = self.me.upgrade() else {
            return Ok(None);
        };
        match me.answer_query(destination.to_string(), path).await {
            Ok(found) => Ok(found),
            Err(AgentError::Routing(e)) => Err(e),
            Err(e) => {
                debug!(agent = %self.name, error = %e, "Route query unanswered");
                Ok(None)
            }
        }
    }

    fn invalidate(&self, names: Vec<String>, visited: HashSet<String>) {
        if let Some(me) = self.me.upgrade() {
            Undertaker::with_visited(me, names, visited).spawn();
        }
    }

    fn link_established(&self, peer: &str) {
        match Route::from_hops([self.name.as_str(), peer]) {
            Ok(route) => {
                self.table.add_route(peer, route);
            }
            Err(e) => warn!(agent = %self.name, %peer, error = %e, "Cannot route to peer"),
        }
    }

    fn link_lost(&self, peer: &str) {
        if let Some(me) = self.me.upgrade() {
            Undertaker::new(me, vec![peer.to_string()]).spawn();
        }
    }
}

fn parse_peer(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
