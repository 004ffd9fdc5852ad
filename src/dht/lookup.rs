//! Iterative lookup
//!
//! Walks the network towards a target id: each round asks the `alpha`
//! closest peers not yet queried for their closest peers. When a round
//! brings nothing closer, one more round asks every unqueried peer among the
//! `k` closest; the lookup ends when that round brings nothing closer either.
//!
//! Only peers that answered are added to the routing table. Peers merely
//! named in an answer are candidates until they answer themselves.

use crate::dht::events::EventSender;
use crate::dht::node::{Distance, NodeId, PeerRecord};
use crate::dht::routing::{sort_by_distance, RoutingTable, K};
use crate::dht::rpc::{DhtRpc, DEFAULT_REQUEST_TIMEOUT};
use crate::error::DhtError;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Default number of parallel queries per round
pub const DEFAULT_ALPHA: usize = 3;

/// Default cap on rounds per lookup
pub const DEFAULT_MAX_ROUNDS: usize = 20;

/// Lookup parameters
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Size of the result set
    pub k: usize,
    /// Queries in flight per round
    pub alpha: usize,
    /// Time allowed for each find_node
    pub request_timeout: Duration,
    pub max_rounds: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

type QueryResult = (PeerRecord, anyhow::Result<Vec<PeerRecord>>);

/// A lookup in progress.
///
/// Nothing happens until [`Lookup::next`] or [`Lookup::run`] is awaited.
/// Once finished, `next` keeps returning `None`.
pub struct Lookup {
    target: NodeId,
    table: Arc<RoutingTable>,
    rpc: Arc<dyn DhtRpc>,
    events: EventSender,
    config: LookupConfig,
    deadline: Instant,
    /// Closest peers known so far, sorted by distance to `target`
    shortlist: Vec<PeerRecord>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    /// Peers found but not yet handed out by `next`
    discovered: VecDeque<PeerRecord>,
    best: Option<Distance>,
    /// The next round asks every unqueried peer in the shortlist
    sweep: bool,
    /// Width of the first round; seeds are all asked at once
    first_round: usize,
    rounds: usize,
    started: bool,
    finished: bool,
    timed_out: bool,
}

impl Lookup {
    pub fn new(
        target: NodeId,
        table: Arc<RoutingTable>,
        rpc: Arc<dyn DhtRpc>,
        config: LookupConfig,
        deadline: Instant,
    ) -> Self {
        let mut seen = HashSet::new();
        seen.insert(table.local_id());
        Self {
            target,
            table,
            rpc,
            events: EventSender::disabled(),
            first_round: config.alpha,
            config,
            deadline,
            shortlist: Vec::new(),
            seen,
            queried: HashSet::new(),
            discovered: VecDeque::new(),
            best: None,
            sweep: false,
            rounds: 0,
            started: false,
            finished: false,
            timed_out: false,
        }
    }

    /// Start from these peers as well as the table's closest.
    ///
    /// The first round queries every seed, even beyond `alpha`.
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = PeerRecord>) -> Self {
        let mut added = 0;
        for seed in seeds {
            if self.seen.insert(seed.id) {
                self.shortlist.push(seed);
                added += 1;
            }
        }
        self.first_round = self.first_round.max(added);
        self
    }

    /// Report table changes on this sender
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the lookup was cut short by its deadline
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// The closest peers found so far
    pub fn closest(&self) -> &[PeerRecord] {
        &self.shortlist
    }

    /// Next newly discovered peer, running rounds as needed
    pub async fn next(&mut self) -> Option<PeerRecord> {
        loop {
            if let Some(peer) = self.discovered.pop_front() {
                return Some(peer);
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.step().await {
                warn!("Lookup for {} ended early: {}", self.target.short(), e);
            }
        }
    }

    /// Drive the lookup to completion and return the closest peers
    pub async fn run(mut self) -> Vec<PeerRecord> {
        while self.next().await.is_some() {}
        self.shortlist
    }

    async fn start(&mut self) {
        self.started = true;
        for peer in self.table.find_closest(&self.target, self.config.k).await {
            if self.seen.insert(peer.id) {
                self.shortlist.push(peer);
            }
        }
        sort_by_distance(&mut self.shortlist, &self.target);
        self.shortlist.truncate(self.config.k.max(self.first_round));
        self.best = self.shortlist.first().map(|p| p.id.distance(&self.target));
    }

    /// Run one round.
    ///
    /// Returns `LookupTimeout` if the deadline passed; results gathered
    /// before that are kept.
    pub async fn step(&mut self) -> Result<(), DhtError> {
        if self.finished {
            return Ok(());
        }
        if !self.started {
            self.start().await;
        }
        if self.rounds >= self.config.max_rounds {
            debug!("Lookup for {} stopped after {} rounds", self.target.short(), self.rounds);
            self.finished = true;
            return Ok(());
        }
        if Instant::now() >= self.deadline {
            return Err(self.expire());
        }

        let width = if self.rounds == 0 {
            self.first_round
        } else if self.sweep {
            self.shortlist.len()
        } else {
            self.config.alpha
        };
        let candidates: Vec<PeerRecord> = self
            .shortlist
            .iter()
            .filter(|p| !self.queried.contains(&p.id))
            .take(width.max(1))
            .cloned()
            .collect();

        if candidates.is_empty() {
            trace!("Lookup for {}: no candidates left", self.target.short());
            self.finished = true;
            return Ok(());
        }

        self.rounds += 1;
        let mut set = JoinSet::new();
        for peer in candidates {
            self.queried.insert(peer.id);
            let rpc = self.rpc.clone();
            let target = self.target;
            let request_timeout = self.config.request_timeout;
            set.spawn(async move {
                let result = match timeout(request_timeout, rpc.find_node(&peer, target)).await {
                    Ok(r) => r,
                    Err(e) => Err(DhtError::from(e).into()),
                };
                (peer, result)
            });
        }

        let mut results: Vec<QueryResult> = Vec::new();
        let mut expired = false;
        loop {
            match timeout_at(self.deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(e))) => debug!("Lookup query task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    expired = true;
                    break;
                }
            }
        }
        // Dropping the set aborts whatever is still in flight.
        drop(set);

        for (peer, result) in results {
            self.absorb(peer, result).await;
        }

        sort_by_distance(&mut self.shortlist, &self.target);
        self.shortlist.truncate(self.config.k);

        if expired {
            return Err(self.expire());
        }

        let new_best = self.shortlist.first().map(|p| p.id.distance(&self.target));
        match (new_best, self.best) {
            (None, _) => self.finished = true,
            (Some(new), Some(old)) if new >= old => {
                if !self.sweep && self.has_unqueried() {
                    trace!("Lookup for {}: no progress, querying the rest of the shortlist", self.target.short());
                    self.sweep = true;
                } else {
                    debug!("Lookup for {} converged after {} rounds", self.target.short(), self.rounds);
                    self.finished = true;
                }
            }
            _ => {
                self.best = new_best;
                self.sweep = false;
            }
        }
        Ok(())
    }

    fn has_unqueried(&self) -> bool {
        self.shortlist.iter().any(|p| !self.queried.contains(&p.id))
    }

    async fn absorb(&mut self, peer: PeerRecord, result: anyhow::Result<Vec<PeerRecord>>) {
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                debug!("find_node to {} failed: {}", peer.id.short(), e);
                self.shortlist.retain(|p| p.id != peer.id);
                return;
            }
        };

        trace!("{} returned {} peers for {}", peer.id.short(), found.len(), self.target.short());
        let mut responder = peer;
        responder.touch();
        self.insert(responder).await;

        for candidate in found {
            if !self.seen.insert(candidate.id) {
                continue;
            }
            self.shortlist.push(candidate.clone());
            self.discovered.push_back(candidate);
        }
    }

    async fn insert(&self, peer: PeerRecord) {
        match self.table.update(peer.clone()).await {
            Ok(outcome) => self.events.record_insert(&peer, &outcome),
            Err(e) => trace!("Not adding {}: {}", peer.id.short(), e),
        }
    }

    fn expire(&mut self) -> DhtError {
        self.finished = true;
        self.timed_out = true;
        DhtError::lookup_timeout(self.target.to_hex(), self.rounds)
    }
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookup")
            .field("target", &self.target)
            .field("rounds", &self.rounds)
            .field("shortlist", &self.shortlist.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
