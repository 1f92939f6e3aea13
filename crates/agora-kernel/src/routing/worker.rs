//! RoutingWorker: flood discovery of a route to an unknown destination.
//!
//! The worker asks every neighbor not already on the search path, in
//! parallel, whether it is the destination or can reach it. A neighbor
//! that cannot answer from its own table delegates to its neighbors with
//! itself appended to the path. The first reply carrying a route wins and
//! the part of it starting at the asking agent is installed in that
//! agent's routing table.

use crate::agent::Agent;
use crate::error::{AgentError, AgentResult};
use agora_types::{Route, RoutingError};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RoutingWorker {
    agent: Arc<Agent>,
    destination: String,
    path: Route,
}

impl RoutingWorker {
    /// A search originating at `agent`.
    pub fn new(agent: Arc<Agent>, destination: &str) -> AgentResult<Self> {
        if destination == agent.name() {
            return Err(RoutingError::RouteToSelf(destination.to_string()).into());
        }
        let path = Route::new(agent.name())?;
        Ok(Self {
            agent,
            destination: destination.to_string(),
            path,
        })
    }

    /// A search delegated to `agent`; `path` already ends with `agent`.
    pub(crate) fn delegated(agent: Arc<Agent>, destination: &str, path: Route) -> Self {
        Self {
            agent,
            destination: destination.to_string(),
            path,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Flood the query and install the first route found.
    ///
    /// `Ok(None)` means no neighbor could reach the destination within the
    /// hop bound and the discovery timeout.
    pub async fn run(self) -> AgentResult<Option<Route>> {
        let agent = &self.agent;
        if self.path.hop_count() >= agent.max_hops() {
            debug!(agent = %agent.name(), destination = %self.destination, "Hop bound reached");
            return Ok(None);
        }

        let mut queries: FuturesUnordered<BoxFuture<'static, (String, AgentResult<Option<Route>>)>> =
            FuturesUnordered::new();
        for peer in agent.local_peers() {
            if self.path.contains(peer.name()) {
                continue;
            }
            let destination = self.destination.clone();
            let path = self.path.clone();
            queries.push(
                async move {
                    let name = peer.name().to_string();
                    (name, peer.answer_query(destination, path).await)
                }
                .boxed(),
            );
        }
        if let Some(socket) = agent.socket() {
            for peer in socket.peer_names() {
                if self.path.contains(&peer) || agent.is_local_peer(&peer) {
                    continue;
                }
                let socket = Arc::clone(socket);
                let destination = self.destination.clone();
                let path = self.path.clone();
                queries.push(
                    async move {
                        let found = socket
                            .query_route(&peer, &destination, &path)
                            .await
                            .map_err(AgentError::from);
                        (peer, found)
                    }
                    .boxed(),
                );
            }
        }
        if queries.is_empty() {
            return Ok(None);
        }

        debug!(
            agent = %agent.name(),
            destination = %self.destination,
            path = %self.path,
            fanout = queries.len(),
            "Flooding route query"
        );
        let first = tokio::time::timeout(agent.discovery_timeout(), async {
            while let Some((peer, reply)) = queries.next().await {
                match reply {
                    Ok(Some(route)) => return Some(route),
                    Ok(None) => {}
                    Err(e) => debug!(%peer, error = %e, "Route query failed"),
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        let Some(route) = first else {
            return Ok(None);
        };
        if let Some(own) = route.suffix_from(agent.name()) {
            if agent.routing_table().add_route(&self.destination, own.clone()) {
                info!(agent = %agent.name(), destination = %self.destination, route = %own, "Route discovered");
            }
        }
        Ok(Some(route))
    }
}
