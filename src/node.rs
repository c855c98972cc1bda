//! # Node Controller
//!
//! A [`Node`] wires the peer directory, the rendezvous DHT, flood pub/sub and
//! the TCP listener together and drives startup in a fixed order:
//!
//! ```text
//! Idle ─► Bootstrapped ─► Announced ─► Discovering ─► Connected ─► Running ─► ShuttingDown
//!  │          │               │              │              │
//!  │   dial seeds,      provide(topic)  find_providers  dial providers,
//!  │   find_node(self)   (with retry)    (with retry)   subscribe(topic)
//!  bind listener
//! ```
//!
//! Only configuration errors and shutdown abort startup. A failed announce or
//! an empty provider set leaves the node running alone: peers that discover
//! it later dial in and join its flood set that way.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(Config::default()).await?;
//! println!("bootstrap: {}", node.bootstrap_string());
//!
//! let mut messages = node.messages().await?;
//! node.publish(b"hello".to_vec()).await?;
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {}", msg.from, String::from_utf8_lossy(&msg.data));
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::Connector;
use crate::config::{BootstrapPeer, Config};
use crate::dht::{topic_key, DhtNode, DhtParams, Key, ProviderSet};
use crate::error::Error;
use crate::floodsub::{FloodSub, FloodSubConfig, ReceivedMessage, Subscription};
use crate::identity::{Contact, Identity, Keypair};
use crate::messages::{Message, MessageId};
use crate::peers::{ConnectionState, PeerDirectory};
use crate::rpc::{self, TcpNetwork};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};

/// First delay between discovery retries; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// How long `shutdown` waits for the listener to stop before aborting it.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle position of a [`Node`]. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Idle,
    Bootstrapped,
    Announced,
    Discovering,
    Connected,
    Running,
    ShuttingDown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Idle => "idle",
            NodeState::Bootstrapped => "bootstrapped",
            NodeState::Announced => "announced",
            NodeState::Discovering => "discovering",
            NodeState::Connected => "connected",
            NodeState::Running => "running",
            NodeState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Application-facing view of the node's topic subscription.
#[derive(Debug)]
pub struct MessageStream {
    inner: Subscription,
}

impl MessageStream {
    pub fn topic(&self) -> &str {
        self.inner.topic()
    }

    /// Next message, or `None` once the stream has been replaced by a later
    /// [`Node::messages`] call or the node has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inner.recv().await.map(Message::from)
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.inner.try_recv().map(Message::from)
    }
}

impl From<ReceivedMessage> for Message {
    fn from(msg: ReceivedMessage) -> Self {
        Message {
            topic: msg.topic,
            from: msg.source.to_hex(),
            data: msg.data,
        }
    }
}

/// Point-in-time counters for periodic logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub state: NodeState,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub failed_peers: usize,
    /// Keys with at least one live provider record in the local store.
    pub stored_keys: usize,
    /// Message ids currently held by the dedup cache.
    pub seen_messages: usize,
    pub subscriptions: Vec<String>,
}

/// A running topic peer. Dropping it signals shutdown to every background
/// task; [`Node::shutdown`] additionally waits for the listener to close.
pub struct Node {
    contact: Contact,
    local_addr: SocketAddr,
    config: Config,
    topic_key: Key,
    seeds: Vec<Contact>,
    directory: Arc<PeerDirectory>,
    dht: DhtNode<TcpNetwork>,
    pubsub: FloodSub<TcpNetwork>,
    connector: Connector<TcpNetwork>,
    state: watch::Sender<NodeState>,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    /// Subscription made during startup, handed out by the first `messages()`.
    initial_subscription: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a node with a fresh identity and run discovery to completion.
    pub async fn start(config: Config) -> Result<Self, Error> {
        Self::start_with_keypair(config, Keypair::generate()).await
    }

    pub async fn start_with_keypair(config: Config, keypair: Keypair) -> Result<Self, Error> {
        config.validate()?;
        let bind = config.bind_addr()?;
        let seeds: Vec<Contact> = config.bootstrap()?.iter().map(BootstrapPeer::contact).collect();

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::Configuration(format!("cannot bind {bind}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Configuration(format!("cannot read bound address: {e}")))?;

        let identity = keypair.identity();
        // Unspecified addresses are advertised as-is; receivers substitute
        // the IP they observed.
        let contact = Contact::single(identity, local_addr.to_string());
        info!("Node {}/{}", local_addr, identity);

        let directory = Arc::new(PeerDirectory::new(identity));
        let (trigger, signal) = shutdown::channel();
        let network = TcpNetwork::new(contact.clone(), config.query_timeout());

        let params = DhtParams {
            k: config.k,
            alpha: config.alpha,
            query_timeout: config.query_timeout(),
        };
        let dht = DhtNode::new(contact.clone(), network, directory.clone(), params, signal.clone());

        let pubsub_config = FloodSubConfig {
            seen_cache_size: config.seen_cache_size,
            seen_cache_ttl: config.seen_cache_ttl(),
            ..FloodSubConfig::default()
        };
        let pubsub = FloodSub::spawn(dht.network().clone(), identity, directory.clone(), pubsub_config);
        let connector = Connector::new(
            dht.network().clone(),
            directory.clone(),
            identity,
            config.dial_timeout(),
            config.max_concurrent_dials,
            signal.clone(),
        );

        let listener_task = tokio::spawn(rpc::serve(listener, dht.clone(), pubsub.clone(), signal.clone()));
        let (state, _) = watch::channel(NodeState::Idle);

        let node = Self {
            contact,
            local_addr,
            topic_key: topic_key(&config.topic_name),
            config,
            seeds,
            directory,
            dht,
            pubsub,
            connector,
            state,
            trigger,
            signal,
            initial_subscription: Mutex::new(None),
            tasks: Mutex::new(vec![listener_task]),
        };

        if let Err(e) = node.run_startup().await {
            node.shutdown().await;
            return Err(e);
        }
        Ok(node)
    }

    async fn run_startup(&self) -> Result<(), Error> {
        self.connect_seeds().await;
        self.advance(NodeState::Bootstrapped);

        let key = self.topic_key;
        let ttl = self.config.provider_ttl();
        let provide_timeout = self.config.provide_timeout();
        let dht = self.dht.clone();
        match self
            .with_retries("provide", || {
                let dht = dht.clone();
                async move { dht.provide(key, ttl, provide_timeout).await }
            })
            .await
        {
            Ok(stored) => info!(topic = %self.config.topic_name, stored, "announced as topic provider"),
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            Err(e) => warn!(error = %e, "announce failed, continuing without it"),
        }
        self.advance(NodeState::Announced);

        self.advance(NodeState::Discovering);
        let find_timeout = self.config.find_timeout();
        let providers = match self
            .with_retries("find_providers", || {
                let dht = dht.clone();
                async move { dht.find_providers(key, find_timeout).await }
            })
            .await
        {
            Ok(set) => set,
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            Err(e) => {
                warn!(error = %e, "provider discovery failed, continuing alone");
                ProviderSet::empty(self.identity())
            }
        };
        info!(
            found = providers.len(),
            partial = providers.timed_out,
            "discovered topic providers"
        );

        let mut exclude = HashSet::new();
        exclude.insert(self.identity());
        let connected = self.connector.dial_all(providers.peers, &exclude).await;
        if self.signal.is_signalled() {
            return Err(Error::Shutdown);
        }
        info!(connected, "connected to providers");
        self.advance(NodeState::Connected);

        let subscription = self
            .pubsub
            .subscribe(&self.config.topic_name)
            .await
            .map_err(|_| Error::Shutdown)?;
        *self.initial_subscription.lock().await = Some(subscription);

        let reannounce = self.spawn_reannounce();
        self.tasks.lock().await.push(reannounce);
        self.advance(NodeState::Running);
        Ok(())
    }

    /// Dial the configured seeds and, if any answered, look up our own
    /// identity so their neighbours land in the directory.
    async fn connect_seeds(&self) -> usize {
        let reached = self.connector.bootstrap(&self.seeds).await;
        if reached > 0 {
            match self.dht.find_node(self.identity(), self.config.find_timeout()).await {
                Ok(closest) => debug!(learned = closest.len(), known = self.directory.len(), "self lookup finished"),
                Err(e) => debug!(error = %e, "self lookup failed"),
            }
        }
        reached
    }

    /// Run `attempt`, retrying retryable failures with exponential backoff up
    /// to `discovery_retries` extra times. Seeds are re-dialed before each
    /// retry so peers marked Failed get another chance.
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut retries = 0u32;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.config.discovery_retries => {
                    retries += 1;
                    warn!(
                        operation,
                        retry = retries,
                        of = self.config.discovery_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.signal.signalled() => return Err(Error::Shutdown),
                    }
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                    self.connect_seeds().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh our provider record every half TTL so it never lapses while
    /// the node is up.
    fn spawn_reannounce(&self) -> JoinHandle<()> {
        let dht = self.dht.clone();
        let signal = self.signal.clone();
        let key = self.topic_key;
        let ttl = self.config.provider_ttl();
        let timeout = self.config.provide_timeout();
        let period = (ttl / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match dht.provide(key, ttl, timeout).await {
                        Ok(stored) => debug!(stored, "provider record refreshed"),
                        Err(Error::Shutdown) => break,
                        Err(e) => warn!(error = %e, "provider refresh failed"),
                    },
                    _ = signal.signalled() => break,
                }
            }
        })
    }

    fn advance(&self, next: NodeState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                debug!(from = %current, to = %next, "node state");
                *current = next;
                true
            } else {
                false
            }
        });
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Publish `payload` on the configured topic. The local stream sees it
    /// too.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<MessageId> {
        if self.signal.is_signalled() {
            return Err(Error::Shutdown.into());
        }
        self.pubsub.publish(&self.config.topic_name, payload).await
    }

    /// Messages received on the configured topic.
    ///
    /// The first call returns the subscription opened during startup, so
    /// nothing received before it is lost. Each later call starts a fresh
    /// stream and ends the previous one.
    pub async fn messages(&self) -> Result<MessageStream> {
        if self.signal.is_signalled() {
            return Err(Error::Shutdown.into());
        }
        if let Some(inner) = self.initial_subscription.lock().await.take() {
            return Ok(MessageStream { inner });
        }
        let inner = self.pubsub.subscribe(&self.config.topic_name).await?;
        Ok(MessageStream { inner })
    }

    /// Stop all background work. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.state() == NodeState::ShuttingDown {
            return;
        }
        self.advance(NodeState::ShuttingDown);
        info!("node shutting down");
        self.trigger.trigger();

        self.pubsub.unsubscribe(&self.config.topic_name).await;
        self.pubsub.quit().await;
        self.dht.quit().await;

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if !tasks.is_empty() {
            // The listener is always first and exits on the shutdown signal.
            let listener = tasks.remove(0);
            let abort = listener.abort_handle();
            if tokio::time::timeout(LISTENER_STOP_TIMEOUT, listener).await.is_err() {
                abort.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
        self.initial_subscription.lock().await.take();
    }

    pub fn identity(&self) -> Identity {
        self.contact.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn topic(&self) -> &str {
        &self.config.topic_name
    }

    /// `IP:PORT/PEER_ID` another node can put in its `bootstrap_peers`.
    /// An unspecified bind address is reported as loopback.
    pub fn bootstrap_string(&self) -> String {
        let peer = BootstrapPeer {
            addr: dialable(self.local_addr),
            identity: self.identity(),
        };
        peer.to_string()
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<Contact> {
        self.directory.connected()
    }

    pub fn peer_directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.state(),
            known_peers: self.directory.len(),
            connected_peers: self.directory.count_in(ConnectionState::Connected),
            failed_peers: self.directory.count_in(ConnectionState::Failed),
            stored_keys: self.dht.stored_keys().await,
            seen_messages: self.pubsub.seen_count().await,
            subscriptions: self.pubsub.subscriptions().await,
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Covers a dropped handle and a cancelled `start`: the listener, the
        // re-announce loop and in-flight lookups all watch this signal.
        self.trigger.trigger();
    }
}

fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}
