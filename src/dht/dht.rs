//! DHT main module
//!
//! The node service: owns the routing table, answers PING, FIND_NODE and
//! IDENTIFY on its listener, refreshes stale buckets, and drives bootstrap.

use crate::dht::bootstrap::{BootstrapConfig, BootstrapReport, Bootstrapper};
use crate::dht::events::{DiscoveryEvent, EventSender, DEFAULT_EVENT_CAPACITY};
use crate::dht::lookup::{Lookup, LookupConfig};
use crate::dht::message::{DhtMessage, PeerInfo, ERROR_MALFORMED, ERROR_UNSUPPORTED};
use crate::dht::node::{NodeId, PeerRecord};
use crate::dht::routing::{RoutingConfig, RoutingTable};
use crate::dht::rpc::RpcClient;
use crate::error::DhtError;
use crate::transport::tcp::DEFAULT_CONNECT_TIMEOUT;
use crate::transport::{socket_multiaddr, Connection, Multiaddr, MultiaddrExt, Network};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default period between bucket refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Buckets untouched for this long get refreshed
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(900);

/// Deadline for lookups the node starts on its own
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Address to listen on
    pub listen: Multiaddr,
    /// Externally reachable address to advertise, if known
    pub announce: Option<Multiaddr>,
    /// Fixed identity; random when unset
    pub local_id: Option<NodeId>,
    pub routing: RoutingConfig,
    pub lookup: LookupConfig,
    pub connect_timeout: Duration,
    /// `None` disables the refresh task
    pub refresh_interval: Option<Duration>,
    pub stale_after: Duration,
    pub event_capacity: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen: socket_multiaddr(SocketAddr::from(([0, 0, 0, 0], 0))),
            announce: None,
            local_id: None,
            routing: RoutingConfig::default(),
            lookup: LookupConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            refresh_interval: Some(DEFAULT_REFRESH_INTERVAL),
            stale_after: DEFAULT_STALE_AFTER,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Listener lifecycle, observable through [`Dht::ready`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Starting,
    Listening(Multiaddr),
    Failed(String),
    Stopped,
}

/// State shared between the node handle and its tasks
struct Shared {
    local_id: NodeId,
    table: Arc<RoutingTable>,
    rpc: Arc<RpcClient>,
    network: Network,
    /// Addresses sent to peers in requests and IDENTIFY answers
    advertised: Arc<RwLock<Vec<Multiaddr>>>,
    /// How seeds saw us, in the order reported
    observed: RwLock<Vec<Multiaddr>>,
    events: EventSender,
    config: DhtConfig,
    status: watch::Sender<NodeStatus>,
}

/// Main DHT struct
pub struct Dht {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dht {
    /// Create a node; nothing is bound until [`Dht::start`]
    pub fn new(config: DhtConfig, network: Network) -> Self {
        let local_id = config.local_id.unwrap_or_else(NodeId::random);
        let advertised = Arc::new(RwLock::new(Vec::new()));
        let rpc = Arc::new(RpcClient::new(
            local_id,
            advertised.clone(),
            network.clone(),
            config.lookup.request_timeout,
        ));
        let table = Arc::new(RoutingTable::new(local_id, config.routing.clone(), rpc.clone()));
        let (events, events_rx) = EventSender::channel(config.event_capacity);
        let (status, _) = watch::channel(NodeStatus::Starting);
        let (shutdown, _) = watch::channel(false);

        info!("DHT initialized with ID: {}", local_id);

        Self {
            shared: Arc::new(Shared {
                local_id,
                table,
                rpc,
                network,
                advertised,
                observed: RwLock::new(Vec::new()),
                events,
                config,
                status,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A node on plain TCP
    pub fn tcp(config: DhtConfig) -> Self {
        let network = Network::tcp(config.connect_timeout);
        Self::new(config, network)
    }

    /// Spawn the listener and refresh tasks.
    ///
    /// Returns immediately; await [`Dht::ready`] for the bound address.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("DHT is already running");
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Err(DhtError::connection_error("DHT has been shut down").into());
        }

        info!("Starting DHT service on {}", self.shared.config.listen);
        let shared = self.shared.clone();
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(shared.serve(shutdown)));

        if let Some(every) = self.shared.config.refresh_interval {
            let shared = self.shared.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(shared.refresh_loop(every, shutdown)));
        }
        Ok(())
    }

    /// Wait until the listener is bound and return its address
    pub async fn ready(&self) -> Result<Multiaddr> {
        let mut status = self.shared.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                NodeStatus::Listening(addr) => return Ok(addr),
                NodeStatus::Failed(reason) => {
                    return Err(DhtError::connection_error_full(
                        "Listener failed",
                        self.shared.config.listen.to_string(),
                        reason,
                    )
                    .into())
                }
                NodeStatus::Stopped => return Err(DhtError::connection_error("DHT stopped").into()),
                NodeStatus::Starting => {}
            }
            status
                .changed()
                .await
                .map_err(|_| DhtError::connection_error("DHT dropped before listening"))?;
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status.borrow().clone()
    }

    /// Bound listen address, once listening
    pub fn listen_addr(&self) -> Option<Multiaddr> {
        match &*self.shared.status.borrow() {
            NodeStatus::Listening(addr) => Some(addr.clone()),
            _ => None,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.local_id
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.shared.table.clone()
    }

    /// Client for issuing requests as this node
    pub fn rpc(&self) -> Arc<RpcClient> {
        self.shared.rpc.clone()
    }

    /// Take the event receiver; only the first caller gets it
    pub async fn take_events(&self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Addresses seeds reported seeing us on
    pub async fn observed_addrs(&self) -> Vec<Multiaddr> {
        self.shared.observed.read().await.clone()
    }

    /// Best address for others to reach us on
    pub async fn reachable_addr(&self) -> Option<Multiaddr> {
        let listen = self.listen_addr()?;
        let observed = self.shared.observed.read().await;
        choose_reachable(&observed, self.shared.config.announce.as_ref(), &listen)
    }

    /// Coordinator for joining through `config.seeds`, reporting on this node's events
    pub fn bootstrapper(&self, config: BootstrapConfig) -> Bootstrapper {
        Bootstrapper::new(self.shared.table.clone(), self.shared.rpc.clone(), config)
            .with_events(self.shared.events.clone())
    }

    /// Join the network and remember how the seeds saw us
    pub async fn bootstrap(&self, config: BootstrapConfig) -> Result<BootstrapReport> {
        let report = self.bootstrapper(config).bootstrap().await?;
        let mut observed = self.shared.observed.write().await;
        for addr in &report.observed {
            if !observed.contains(addr) {
                debug!("Seeds see us as {}", addr);
                observed.push(addr.clone());
            }
        }
        Ok(report)
    }

    /// Iterative lookup for `target`, with the default deadline
    pub fn lookup(&self, target: NodeId) -> Lookup {
        self.shared.lookup(target)
    }

    /// Refresh the table now
    pub async fn refresh(&self) {
        self.shared.refresh().await;
    }

    /// Stop the listener and refresh tasks
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for mut handle in handles {
            if timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.shared.status.send_replace(NodeStatus::Stopped);
        info!("DHT service stopped");
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("local_id", &self.shared.local_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// First observed address (on our listen port), else the announce address,
/// else the listen address unless it is a wildcard
pub fn choose_reachable(
    observed: &[Multiaddr],
    announce: Option<&Multiaddr>,
    listen: &Multiaddr,
) -> Option<Multiaddr> {
    // Observed ports belong to outbound connections; ours is the listen port.
    let port = listen.tcp_port();
    let from_observed = observed.iter().find_map(|addr| {
        let ip = addr.ip_addr()?;
        Some(socket_multiaddr(SocketAddr::new(ip, port?)))
    });

    from_observed
        .or_else(|| announce.cloned())
        .or_else(|| (!listen.is_unspecified()).then(|| listen.clone()))
}

/// Make an advertised address dialable from where the request came from
fn dialable(addr: Multiaddr, remote: &Multiaddr) -> Option<Multiaddr> {
    if !addr.is_unspecified() {
        return Some(addr);
    }
    let port = addr.tcp_port()?;
    let ip = remote.ip_addr()?;
    Some(socket_multiaddr(SocketAddr::new(ip, port)))
}

impl Shared {
    async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut listener = match self.network.listen(&self.config.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to listen on {}: {}", self.config.listen, e);
                self.status.send_replace(NodeStatus::Failed(e.to_string()));
                return;
            }
        };

        let local = listener.local_addr();
        {
            let mut advertised = self.advertised.write().await;
            advertised.push(local.clone());
            if let Some(announce) = &self.config.announce {
                advertised.push(announce.without_p2p());
            }
        }
        info!("DHT listening on: {}", local);
        self.events.emit(DiscoveryEvent::Listening(local.clone()));
        self.status.send_replace(NodeStatus::Listening(local));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            tokio::spawn(self.clone().handle_connection(conn));
                        }
                        Err(e) => {
                            warn!("Error accepting connection: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!("DHT listener closed");
    }

    async fn handle_connection(self: Arc<Self>, conn: Connection) {
        let remote = conn.remote_addr.clone();
        trace!("Inbound connection from {}", remote);

        let exchange = async {
            let mut stream = self.network.accept_inbound(conn).await?;
            let response = match DhtMessage::read_from(&mut stream.io).await {
                Ok(request) => self.respond(request, &remote).await,
                Err(e) => {
                    let malformed = matches!(
                        e.downcast_ref::<DhtError>(),
                        Some(DhtError::ProtocolError { .. } | DhtError::InvalidIdentifier { .. } | DhtError::ParseError { .. })
                    );
                    if !malformed {
                        return Err(e);
                    }
                    debug!("Malformed request from {}: {}", remote, e);
                    DhtMessage::error("", ERROR_MALFORMED, e.to_string())
                }
            };
            response.write_to(&mut stream.io).await
        };

        match timeout(self.config.lookup.request_timeout, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Request from {} failed: {}", remote, e),
            Err(_) => debug!("Request from {} timed out", remote),
        }
    }

    async fn respond(&self, request: DhtMessage, remote: &Multiaddr) -> DhtMessage {
        trace!("Received {} from {}", request.kind(), remote);
        if !request.is_request() {
            debug!("Rejecting {} from {}: not a request", request.kind(), remote);
            return DhtMessage::error(
                request.tx(),
                ERROR_UNSUPPORTED,
                format!("{} is not a request", request.kind()),
            );
        }

        match request {
            DhtMessage::Ping { tx } => DhtMessage::Pong { tx, id: self.local_id },
            DhtMessage::FindNode { tx, sender, target } => {
                let requester = sender.id;
                self.learn(sender, remote).await;
                let peers = self
                    .table
                    .find_closest(&target, self.table.k())
                    .await
                    .iter()
                    .filter(|p| p.id != requester)
                    .map(PeerInfo::from_record)
                    .collect();
                DhtMessage::Nodes { tx, id: self.local_id, peers }
            }
            DhtMessage::Identify { tx, sender } => {
                self.learn(sender, remote).await;
                DhtMessage::IdentifyAck {
                    tx,
                    responder: PeerInfo {
                        id: self.local_id,
                        addrs: self.advertised.read().await.clone(),
                    },
                    observed: remote.clone(),
                }
            }
            other => DhtMessage::error(
                other.tx(),
                ERROR_UNSUPPORTED,
                format!("No handler for {}", other.kind()),
            ),
        }
    }

    /// Add a requester that told us where it listens
    async fn learn(&self, sender: PeerInfo, remote: &Multiaddr) {
        if sender.id == self.local_id {
            return;
        }
        let addrs: Vec<_> = sender.addrs.into_iter().filter_map(|a| dialable(a, remote)).collect();
        if addrs.is_empty() {
            trace!("{} advertised no dialable address", sender.id.short());
            return;
        }

        let record = PeerRecord::new(sender.id, addrs);
        match self.table.update(record.clone()).await {
            Ok(outcome) => self.events.record_insert(&record, &outcome),
            Err(e) => debug!("Not adding requester {}: {}", record.id.short(), e),
        }
    }

    fn lookup(&self, target: NodeId) -> Lookup {
        Lookup::new(
            target,
            self.table.clone(),
            self.rpc.clone(),
            self.config.lookup.clone(),
            Instant::now() + DEFAULT_LOOKUP_TIMEOUT,
        )
        .with_events(self.events.clone())
    }

    async fn refresh_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        // The first tick fires immediately; bootstrap covers that.
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    /// Self lookup, then a lookup into every stale bucket
    async fn refresh(&self) {
        if self.table.is_empty().await {
            trace!("Routing table empty, nothing to refresh");
            return;
        }
        debug!("Refreshing routing table buckets");

        let found = self.lookup(self.local_id).run().await;
        trace!("Self lookup returned {} peers", found.len());

        let stale_buckets = self.table.stale_buckets(self.config.stale_after).await;
        if stale_buckets.is_empty() {
            return;
        }
        debug!("Found {} stale buckets to refresh", stale_buckets.len());
        for index in stale_buckets {
            let target = self.local_id.random_in_bucket(index);
            self.lookup(target).run().await;
        }
    }
}
