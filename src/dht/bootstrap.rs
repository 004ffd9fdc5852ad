//! DHT bootstrap module
//!
//! Joins the network through a list of seed addresses: dial the seeds with
//! bounded concurrency, exchange identifiers, then look up our own id to
//! fill the routing table.

use crate::dht::events::{DiscoveryEvent, EventSender};
use crate::dht::lookup::{Lookup, LookupConfig};
use crate::dht::node::PeerRecord;
use crate::dht::routing::RoutingTable;
use crate::dht::rpc::{DhtRpc, Identified};
use crate::error::DhtError;
use crate::transport::Multiaddr;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Default overall bootstrap deadline
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of seeds dialled at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default extra attempts per seed
pub const DEFAULT_RETRIES: u32 = 2;

/// Default pause between attempts on the same seed
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Where the coordinator is in joining the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    /// Dialling seeds
    Connecting,
    /// Looking up our own id through the connected seeds
    Seeding,
    Ready,
    /// No seed could be reached
    Failed,
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BootstrapState::Idle => "idle",
            BootstrapState::Connecting => "connecting",
            BootstrapState::Seeding => "seeding",
            BootstrapState::Ready => "ready",
            BootstrapState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bootstrap configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Seed addresses, optionally with a `/p2p/` id
    pub seeds: Vec<Multiaddr>,
    /// Deadline for the whole operation
    pub timeout: Duration,
    /// Seeds dialled at once
    pub max_concurrency: usize,
    /// Extra attempts per seed after the first
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Parameters of the self lookup
    pub lookup: LookupConfig,
}

impl BootstrapConfig {
    /// Create a new bootstrap config
    pub fn new(seeds: Vec<Multiaddr>) -> Self {
        Self {
            seeds,
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            lookup: LookupConfig::default(),
        }
    }
}

/// What a successful bootstrap achieved
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Seeds that answered the identifier exchange
    pub connected: Vec<PeerRecord>,
    /// Peers found by the self lookup
    pub discovered: usize,
    /// Routing table size afterwards
    pub table_size: usize,
    /// Our address as each connected seed saw it
    pub observed: Vec<Multiaddr>,
    /// The self lookup hit the deadline
    pub timed_out: bool,
}

/// Runs the bootstrap state machine against a routing table
pub struct Bootstrapper {
    table: Arc<RoutingTable>,
    rpc: Arc<dyn DhtRpc>,
    events: EventSender,
    config: BootstrapConfig,
    state: watch::Sender<BootstrapState>,
}

impl Bootstrapper {
    pub fn new(table: Arc<RoutingTable>, rpc: Arc<dyn DhtRpc>, config: BootstrapConfig) -> Self {
        let (state, _) = watch::channel(BootstrapState::Idle);
        Self {
            table,
            rpc,
            events: EventSender::disabled(),
            config,
            state,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Current state
    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BootstrapState) {
        debug!("Bootstrap state: {}", state);
        self.state.send_replace(state);
        self.events.emit(DiscoveryEvent::StateChanged(state));
    }

    fn fail(&self, message: &str) -> anyhow::Error {
        self.set_state(BootstrapState::Failed);
        DhtError::bootstrap_failed(message, self.config.seeds.len()).into()
    }

    /// Join the network.
    ///
    /// Fails with `BootstrapFailed` only when no seed answered before the
    /// deadline; everything else degrades to a warning.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let deadline = Instant::now() + self.config.timeout;
        info!("Bootstrapping from {} seeds", self.config.seeds.len());
        self.set_state(BootstrapState::Connecting);

        if self.config.seeds.is_empty() {
            return Err(self.fail("no seed addresses configured"));
        }

        let mut connected = Vec::new();
        let mut observed = Vec::new();
        let mut dials = self.spawn_dials();

        loop {
            let joined = match timeout_at(deadline, dials.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!("Bootstrap deadline reached with {} seed dials pending", dials.len());
                    break;
                }
            };
            match joined {
                Ok((seed, Ok(identified))) => {
                    let Identified { peer, observed: seen_as } = identified;
                    info!("Connected to seed {} ({})", peer.id, seed);
                    match self.table.update(peer.clone()).await {
                        Ok(outcome) => self.events.record_insert(&peer, &outcome),
                        Err(e) => debug!("Seed {} not added to table: {}", peer.id.short(), e),
                    }
                    self.events.emit(DiscoveryEvent::PeerConnected(peer.clone()));
                    connected.push(peer);
                    observed.push(seen_as);
                }
                Ok((seed, Err(e))) => warn!("Seed {} unreachable: {}", seed, e),
                Err(e) => warn!("Seed dial task failed: {}", e),
            }
        }
        // Anything still dialling past the deadline is abandoned.
        dials.abort_all();

        if connected.is_empty() {
            return Err(self.fail("no seed could be reached"));
        }

        self.set_state(BootstrapState::Seeding);
        let local_id = self.table.local_id();
        let mut lookup = Lookup::new(local_id, self.table.clone(), self.rpc.clone(), self.config.lookup.clone(), deadline)
            .with_seeds(connected.iter().cloned())
            .with_events(self.events.clone());

        let mut discovered = 0;
        while lookup.next().await.is_some() {
            discovered += 1;
        }

        let report = BootstrapReport {
            connected,
            discovered,
            table_size: self.table.len().await,
            observed,
            timed_out: lookup.timed_out(),
        };
        info!(
            "Bootstrap complete: {} seeds, {} discovered, {} peers in table",
            report.connected.len(),
            report.discovered,
            report.table_size
        );
        self.set_state(BootstrapState::Ready);
        Ok(report)
    }

    fn spawn_dials(&self) -> JoinSet<(Multiaddr, Result<Identified>)> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut dials = JoinSet::new();
        for seed in &self.config.seeds {
            let seed = seed.clone();
            let rpc = self.rpc.clone();
            let permits = permits.clone();
            let retries = self.config.retries;
            let backoff = self.config.retry_backoff;
            dials.spawn(async move {
                let result = dial_seed(rpc.as_ref(), &seed, &permits, retries, backoff).await;
                (seed, result)
            });
        }
        dials
    }
}

/// Identify one seed, retrying up to `retries` times
async fn dial_seed(
    rpc: &dyn DhtRpc,
    seed: &Multiaddr,
    permits: &Semaphore,
    retries: u32,
    backoff: Duration,
) -> Result<Identified> {
    let mut attempt = 0;
    loop {
        let result = {
            let _permit = permits.acquire().await?;
            rpc.identify(seed).await
        };
        match result {
            Ok(identified) => return Ok(identified),
            Err(e) if attempt < retries && is_retryable(&e) => {
                attempt += 1;
                debug!("Seed {} attempt {} failed: {}; retrying", seed, attempt, e);
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Network failures are retried; identifier and parse errors are final
fn is_retryable(error: &anyhow::Error) -> bool {
    error.downcast_ref::<DhtError>().map_or(true, DhtError::is_network)
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("state", &self.state())
            .field("seeds", &self.config.seeds.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::node::NodeId;
    use crate::dht::routing::RoutingConfig;
    use crate::dht::sim::{Behaviour, SimNetwork};

    fn seed_addr(record: &PeerRecord) -> Multiaddr {
        record.primary_addr().unwrap().clone()
    }

    fn bootstrapper(sim: &Arc<SimNetwork>, config: BootstrapConfig) -> (Bootstrapper, Arc<RoutingTable>) {
        let table = Arc::new(RoutingTable::new(NodeId::random(), RoutingConfig::default(), sim.clone()));
        (Bootstrapper::new(table.clone(), sim.clone(), config), table)
    }

    fn quick(seeds: Vec<Multiaddr>) -> BootstrapConfig {
        BootstrapConfig {
            retry_backoff: Duration::from_millis(1),
            ..BootstrapConfig::new(seeds)
        }
    }

    #[tokio::test]
    async fn test_one_of_three_seeds_reachable() {
        let mut sim = SimNetwork::new();
        let a = sim.add(1, Behaviour::Offline);
        let b = sim.add(2, Behaviour::Online);
        let c = sim.add(3, Behaviour::Offline);
        let extra = sim.add(4, Behaviour::Online);
        sim.link(&b.id, &extra);
        let sim = Arc::new(sim);

        let (boot, table) = bootstrapper(&sim, quick(vec![seed_addr(&a), seed_addr(&b), seed_addr(&c)]));
        let report = boot.bootstrap().await.unwrap();

        assert_eq!(boot.state(), BootstrapState::Ready);
        assert_eq!(report.connected.len(), 1);
        assert_eq!(report.connected[0].id, b.id);
        assert!(table.get(&b.id).await.is_some());
        assert!(table.get(&extra.id).await.is_some());
        assert_eq!(report.table_size, table.len().await);
        assert!(report.table_size >= 1);
        assert_eq!(report.observed.len(), 1);
    }

    #[tokio::test]
    async fn test_all_seeds_unreachable() {
        let mut sim = SimNetwork::new();
        let seeds: Vec<_> = (1..=3).map(|i| seed_addr(&sim.add(i, Behaviour::Offline))).collect();
        let sim = Arc::new(sim);

        let (boot, table) = bootstrapper(&sim, quick(seeds));
        let err = boot.bootstrap().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DhtError>(),
            Some(DhtError::BootstrapFailed { attempted: 3, .. })
        ));
        assert_eq!(boot.state(), BootstrapState::Failed);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_no_seeds_fails() {
        let sim = Arc::new(SimNetwork::new());
        let (boot, _) = bootstrapper(&sim, quick(Vec::new()));
        let err = boot.bootstrap().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DhtError>(), Some(DhtError::BootstrapFailed { .. })));
    }

    #[tokio::test]
    async fn test_each_seed_retried() {
        let mut sim = SimNetwork::new();
        let dead = seed_addr(&sim.add(1, Behaviour::Offline));
        let sim = Arc::new(sim);

        let config = BootstrapConfig { retries: 3, ..quick(vec![dead.clone()]) };
        let (boot, _) = bootstrapper(&sim, config);
        assert!(boot.bootstrap().await.is_err());
        assert_eq!(sim.identify_attempts(&dead), 4);
    }

    #[tokio::test]
    async fn test_invalid_seed_not_retried() {
        let mut sim = SimNetwork::new();
        let bad = seed_addr(&sim.add(1, Behaviour::Misbehaving));
        let sim = Arc::new(sim);

        let config = BootstrapConfig { retries: 3, ..quick(vec![bad.clone()]) };
        let (boot, _) = bootstrapper(&sim, config);
        assert!(boot.bootstrap().await.is_err());
        assert_eq!(sim.identify_attempts(&bad), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_hanging_seed() {
        let mut sim = SimNetwork::new();
        let slow = sim.add(1, Behaviour::Hanging);
        let good = sim.add(2, Behaviour::Online);
        let sim = Arc::new(sim);

        let config = BootstrapConfig {
            timeout: Duration::from_secs(5),
            max_concurrency: 2,
            ..quick(vec![seed_addr(&slow), seed_addr(&good)])
        };
        let (boot, _) = bootstrapper(&sim, config);
        let started = Instant::now();
        let report = boot.bootstrap().await.unwrap();

        assert_eq!(report.connected.len(), 1);
        assert_eq!(report.connected[0].id, good.id);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let mut sim = SimNetwork::new();
        let seed = sim.add(1, Behaviour::Online);
        let sim = Arc::new(sim);

        let (events, mut rx) = EventSender::channel(32);
        let (boot, _) = bootstrapper(&sim, quick(vec![seed_addr(&seed)]));
        let boot = boot.with_events(events);
        let watcher = boot.subscribe();
        assert_eq!(*watcher.borrow(), BootstrapState::Idle);

        boot.bootstrap().await.unwrap();
        assert_eq!(*watcher.borrow(), BootstrapState::Ready);

        let mut states = Vec::new();
        let mut connected = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                DiscoveryEvent::StateChanged(s) => states.push(s),
                DiscoveryEvent::PeerConnected(_) => connected += 1,
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![BootstrapState::Connecting, BootstrapState::Seeding, BootstrapState::Ready]
        );
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit_of_one_still_reaches_all() {
        let mut sim = SimNetwork::new();
        let seeds: Vec<_> = (1..=4).map(|i| sim.add(i, Behaviour::Online)).collect();
        let sim = Arc::new(sim);

        let config = BootstrapConfig {
            max_concurrency: 1,
            ..quick(seeds.iter().map(seed_addr).collect())
        };
        let (boot, _) = bootstrapper(&sim, config);
        let report = boot.bootstrap().await.unwrap();
        assert_eq!(report.connected.len(), 4);
    }
}
