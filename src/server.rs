//! Server facade: socket lifecycle, bootstrap, get/set, periodic refresh.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::constants::REPUBLISH_AGE;
use crate::crawl::Spider;
use crate::error::{KadError, Result};
use crate::message::{self, Inbound};
use crate::node::{Node, NodeId};
use crate::protocol::Protocol;
use crate::routing::RoutingTable;
use crate::rpc::Transport;
use crate::storage::{MemoryStorage, SharedStorage, Storage};

/// A DHT node.
///
/// Bind it with [`listen`], seed it with [`bootstrap`], then read and write
/// values with [`get`] and [`set`]. Values are opaque byte strings addressed
/// by the SHA-1 digest of their key.
///
/// [`listen`]: Server::listen
/// [`bootstrap`]: Server::bootstrap
/// [`get`]: Server::get
/// [`set`]: Server::set
pub struct Server {
    config: DhtConfig,
    local_id: NodeId,
    storage: SharedStorage,
    kernel: Option<Arc<Kernel>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Live state of a listening server, shared with its background tasks.
pub(crate) struct Kernel {
    pub(crate) config: DhtConfig,
    pub(crate) local_id: NodeId,
    pub(crate) storage: SharedStorage,
    pub(crate) protocol: Protocol,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) gateways: Mutex<Vec<Node>>,
}

impl Server {
    /// A server with a random node id and the in-memory TTL store.
    pub fn new(config: DhtConfig) -> Self {
        Self::with_parts(config, None, None)
    }

    /// A server with an explicit node id and/or storage backend.
    pub fn with_parts(
        config: DhtConfig,
        id: Option<NodeId>,
        storage: Option<Box<dyn Storage>>,
    ) -> Self {
        let local_id = id.unwrap_or_else(NodeId::random);
        let storage = storage
            .unwrap_or_else(|| Box::new(MemoryStorage::new(config.storage_ttl)));
        Self {
            config,
            local_id,
            storage: Arc::new(Mutex::new(storage)),
            kernel: None,
            tasks: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// The bound socket address; available once listening.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.kernel()?.local_addr)
    }

    pub(crate) fn kernel(&self) -> Result<&Arc<Kernel>> {
        self.kernel.as_ref().ok_or(KadError::NotListening)
    }

    /// Binds the UDP socket and starts the receive loop, the stale-head
    /// pinger, and the periodic refresh task.
    pub async fn listen(&mut self, port: u16, host: Option<IpAddr>) -> Result<()> {
        if self.kernel.is_some() {
            return Err(KadError::AlreadyListening);
        }
        let host = host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let socket = Arc::new(UdpSocket::bind((host, port)).await?);
        let local_addr = socket.local_addr()?;
        info!("node {} listening on {}", self.local_id, local_addr);

        let transport = Transport::new(Arc::clone(&socket), self.config.rpc_timeout);
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let routing = Arc::new(RoutingTable::new(
            self.local_id,
            self.config.ksize,
            self.config.bucket_stale_after,
            ping_tx,
        ));
        let protocol = Protocol::new(
            self.local_id,
            self.config.ksize,
            transport.clone(),
            Arc::clone(&routing),
            Arc::clone(&self.storage),
        );

        let kernel = Arc::new(Kernel {
            config: self.config.clone(),
            local_id: self.local_id,
            storage: Arc::clone(&self.storage),
            protocol: protocol.clone(),
            routing,
            local_addr,
            gateways: Mutex::new(Vec::new()),
        });

        self.tasks
            .push(tokio::spawn(recv_loop(socket, transport, protocol.clone())));
        self.tasks
            .push(tokio::spawn(ping_stale_heads(ping_rx, protocol)));
        self.tasks
            .push(tokio::spawn(refresh_loop(Arc::clone(&kernel))));
        self.kernel = Some(kernel);
        Ok(())
    }

    /// Learns ids from the given addresses and crawls toward the local id to
    /// fill the routing table. Returns the contacts that answered; a single
    /// live one is enough.
    pub async fn bootstrap(&self, addrs: &[SocketAddr]) -> Result<Vec<Node>> {
        self.kernel()?.bootstrap(addrs).await
    }

    /// The nearest known neighbors of the local node, suitable for feeding
    /// back into [`bootstrap`](Server::bootstrap) after a restart.
    pub fn bootstrappable_neighbors(&self) -> Result<Vec<Node>> {
        let kernel = self.kernel()?;
        Ok(kernel
            .routing
            .find_neighbors(&self.local_id, kernel.config.ksize, None))
    }

    /// Looks the key up, locally first and then on the network.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.kernel()?
            .get_digest(NodeId::digest(key.as_bytes()))
            .await
    }

    /// Stores the value on the k nodes nearest the key's digest. Succeeds
    /// iff at least one remote node accepted it.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<bool> {
        let dkey = NodeId::digest(key.as_bytes());
        debug!("setting {:?} -> {} on network", key, dkey);
        self.kernel()?.set_digest(dkey, value.into()).await
    }

    /// Closes the socket and stops the background tasks.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.kernel = None;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Kernel {
    fn spider(&self, target: NodeId, seeds: Vec<Node>) -> Spider {
        Spider::new(
            self.protocol.clone(),
            target,
            seeds,
            self.config.ksize,
            self.config.alpha,
            self.gateways.lock().clone(),
        )
    }

    async fn bootstrap(&self, addrs: &[SocketAddr]) -> Result<Vec<Node>> {
        let mut live = Vec::new();
        for &addr in addrs {
            match self.protocol.ping_addr(addr).await {
                Ok(id) => live.push(Node::new(id, addr)),
                Err(err) => warn!("bootstrap ping to {} failed: {}", addr, err),
            }
        }
        if live.is_empty() {
            warn!("no bootstrap node answered");
            return Ok(live);
        }

        *self.gateways.lock() = live.clone();
        let found = self.spider(self.local_id, live.clone()).find_nodes().await;
        info!(
            "bootstrap reached {} nodes, {} in routing table",
            found.len(),
            self.routing.node_count()
        );
        Ok(live)
    }

    async fn get_digest(&self, dkey: NodeId) -> Result<Option<Bytes>> {
        if let Some(value) = self.storage.lock().get(&dkey) {
            return Ok(Some(value));
        }
        let seeds = self
            .routing
            .find_neighbors(&dkey, self.config.alpha, None);
        if seeds.is_empty() {
            warn!("no known neighbors to look up key {}", dkey);
            return Ok(None);
        }
        Ok(self.spider(dkey, seeds).find_value().await)
    }

    async fn set_digest(&self, dkey: NodeId, value: Bytes) -> Result<bool> {
        let seeds = self
            .routing
            .find_neighbors(&dkey, self.config.alpha, None);
        if seeds.is_empty() {
            warn!("no known neighbors to store key {}", dkey);
            return Ok(false);
        }

        let nodes = self.spider(dkey, seeds).find_nodes().await;
        if nodes.is_empty() {
            return Ok(false);
        }
        debug!("storing {} at {} nodes", dkey, nodes.len());

        // Keep a local copy too, unless we are further from the key than
        // every candidate.
        if let Some(furthest) = nodes.iter().map(|n| n.id.distance(&dkey)).max() {
            if self.local_id.distance(&dkey) < furthest {
                self.storage.lock().set(dkey, value.clone());
            }
        }

        let stored = join_all(nodes.iter().map(|node| {
            let proto = self.protocol.clone();
            let node = *node;
            let value = value.clone();
            async move { proto.store(&node, dkey, value).await }
        }))
        .await;
        Ok(stored.into_iter().any(|r| matches!(r, Ok(true))))
    }

    /// One sweep of the hourly maintenance: crawl a random id in every
    /// lonely bucket, then republish values that have been held a while.
    async fn refresh(&self) {
        for target in self.protocol.refresh_ids() {
            let seeds = self
                .routing
                .find_neighbors(&target, self.config.alpha, None);
            if seeds.is_empty() {
                continue;
            }
            let found = self.spider(target, seeds).find_nodes().await;
            debug!("refresh crawl for {} reached {} nodes", target, found.len());
        }

        let aged = self.storage.lock().items_older_than(REPUBLISH_AGE);
        for (key, value) in aged {
            if let Err(err) = self.set_digest(key, value).await {
                warn!("republish of {} failed: {}", key, err);
            }
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, transport: Transport, protocol: Protocol) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("udp receive failed, shutting down receive loop: {}", err);
                return;
            }
        };
        match message::decode(&buf[..len]) {
            Ok(Inbound::Response { id, body }) => transport.fulfill(id, body),
            Ok(Inbound::Request { id, method, args }) => {
                protocol.handle_request(addr, id, &method, args).await;
            }
            Err(err) => debug!("dropping datagram from {}: {}", addr, err),
        }
    }
}

/// Probes bucket heads displaced by a full bucket; a timeout evicts the head
/// through the usual response bookkeeping, freeing the slot.
async fn ping_stale_heads(mut rx: mpsc::UnboundedReceiver<Node>, protocol: Protocol) {
    while let Some(head) = rx.recv().await {
        let proto = protocol.clone();
        tokio::spawn(async move {
            let _ = proto.ping(&head).await;
        });
    }
}

async fn refresh_loop(kernel: Arc<Kernel>) {
    let mut ticker = interval(kernel.config.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        kernel.refresh().await;
    }
}
