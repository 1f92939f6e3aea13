//! Undertaker: repairs routing state after a link is severed.
//!
//! Starting from one endpoint of the severed link, the crawl walks the
//! in-process agent graph depth first and invalidates the dead names in
//! every routing table it reaches. Each agent is visited at most once; the
//! visited set belongs to the crawl and travels with it when it is
//! forwarded. Agents with socket links forward the crawl to remote peers
//! not yet visited, and each remote node continues it locally.

use crate::agent::Agent;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What one crawl did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Agents visited, in visiting order.
    pub visited: Vec<String>,
    /// Routing table entries removed across all visited agents.
    pub invalidated: usize,
    /// Remote peers the crawl was forwarded to.
    pub forwarded_to: Vec<String>,
}

pub struct Undertaker {
    start: Arc<Agent>,
    dead: Vec<String>,
    visited: HashSet<String>,
}

impl Undertaker {
    /// A fresh crawl from `start` invalidating `dead`.
    pub fn new(start: Arc<Agent>, dead: Vec<String>) -> Self {
        Self::with_visited(start, dead, HashSet::new())
    }

    /// Continue a crawl that has already visited the agents in `visited`.
    pub fn with_visited(start: Arc<Agent>, dead: Vec<String>, visited: HashSet<String>) -> Self {
        Self {
            start,
            dead,
            visited,
        }
    }

    /// Run the crawl on a background task.
    pub fn spawn(self) -> JoinHandle<CrawlReport> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> CrawlReport {
        let mut report = CrawlReport::default();
        // A forwarded crawl arrives with its receiver already marked.
        self.visited.remove(self.start.name());
        let mut boundary = Vec::new();
        let mut stack = vec![Arc::clone(&self.start)];

        while let Some(agent) = stack.pop() {
            if !self.visited.insert(agent.name().to_string()) {
                continue;
            }
            report.visited.push(agent.name().to_string());

            for name in self.dead.iter().filter(|n| n.as_str() != agent.name()) {
                report.invalidated += agent.routing_table().invalidate_agent(name);
            }
            if agent.socket().is_some() {
                boundary.push(Arc::clone(&agent));
            }
            for peer in agent.local_peers() {
                if !self.visited.contains(peer.name()) {
                    stack.push(peer);
                }
            }
        }

        // Forward only after the local graph is done. Every target is
        // marked before anything is sent so that no remote node forwards
        // the crawl to another target of this one.
        let mut plan = Vec::new();
        for agent in boundary {
            if let Some(socket) = agent.socket() {
                let targets = socket.invalidation_targets(&self.visited);
                self.visited.extend(targets.iter().cloned());
                if !targets.is_empty() {
                    plan.push((Arc::clone(socket), targets));
                }
            }
        }
        for (socket, targets) in plan {
            let sent = socket
                .send_invalidation(&targets, &self.dead, &self.visited)
                .await;
            report.forwarded_to.extend(sent);
        }

        if report.invalidated > 0 || !report.forwarded_to.is_empty() {
            info!(
                start = %self.start.name(),
                dead = ?self.dead,
                visited = report.visited.len(),
                invalidated = report.invalidated,
                forwarded = report.forwarded_to.len(),
                "Invalidation crawl finished"
            );
        } else {
            debug!(start = %self.start.name(), dead = ?self.dead, "Invalidation crawl found nothing");
        }
        report
    }
}
