//! # Flood Pub/Sub
//!
//! Every new message is forwarded to every connected peer; duplicates are
//! dropped by id. There is no mesh, no gossip and no interest announcement:
//! a node relays topics it is not subscribed to.
//!
//! ## Architecture
//!
//! ```text
//!   FloodSub (handle) ──mpsc──► FloodSubActor
//!                                 │  seen cache (LRU + TTL)
//!                                 │  subscriptions: topic → unbounded queue
//!                                 │
//!                                 ├─try_send─► outbox(peer A) ─► drain task ─► network
//!                                 └─try_send─► outbox(peer B) ─► drain task ─► network
//! ```
//!
//! The actor never awaits the network. Each peer's outbox is drained by its
//! own task; a failed send marks that peer Failed in the [`PeerDirectory`]
//! and ends the task. A full outbox drops the message for that peer only.
//!
//! ## Message identity
//!
//! `id = blake3(source || seqno || data)`, see [`crate::messages::message_id`].
//! The same payload published by two sources yields two ids.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::identity::{Contact, Identity};
use crate::messages::{FloodMessage, MessageId};
use crate::peers::PeerDirectory;
use crate::protocols::FloodSubRpc;

/// Default number of message ids remembered for deduplication.
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 10_000;

/// Default age after which a seen id is forgotten.
pub const DEFAULT_SEEN_CACHE_TTL: Duration = Duration::from_secs(120);

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Largest payload accepted for publish or relay (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub const MAX_TOPIC_LENGTH: usize = 256;

/// Messages queued per peer before new ones are dropped for that peer.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

const COMMAND_CHANNEL_CAPACITY: usize = 1000;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

#[derive(Clone, Debug)]
pub struct FloodSubConfig {
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_message_size: usize,
    pub outbox_capacity: usize,
}

impl Default for FloodSubConfig {
    fn default() -> Self {
        Self {
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            seen_cache_ttl: DEFAULT_SEEN_CACHE_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_message_size: MAX_MESSAGE_SIZE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Why a publish or subscribe was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageRejection {
    #[error("message size exceeds maximum allowed")]
    MessageTooLarge,
    #[error("topic name exceeds maximum length")]
    TopicTooLong,
    #[error("topic name is invalid (empty or contains non-ASCII characters)")]
    InvalidTopic,
}

fn check_topic(topic: &str) -> Result<(), MessageRejection> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(MessageRejection::TopicTooLong);
    }
    if !is_valid_topic(topic) {
        return Err(MessageRejection::InvalidTopic);
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    pub received_at: Instant,
}

/// Queue of messages delivered for one topic.
///
/// Unbounded. Ends (`recv` returns `None`) on unsubscribe, on a later
/// subscribe to the same topic, or when the pub/sub actor stops.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<Result<Subscription>>),
    Unsubscribe(String, oneshot::Sender<bool>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<MessageId>>),
    HandleMessage(Contact, FloodMessage, oneshot::Sender<bool>),
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    SeenCount(oneshot::Sender<usize>),
    Quit,
}

// ============================================================================
// FloodSub Handle (public API - cheap to clone)
// ============================================================================

pub struct FloodSub<N: FloodSubRpc> {
    cmd_tx: mpsc::Sender<Command>,
    _network: std::marker::PhantomData<N>,
}

impl<N: FloodSubRpc> Clone for FloodSub<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            _network: std::marker::PhantomData,
        }
    }
}

impl<N: FloodSubRpc> FloodSub<N> {
    pub fn spawn(network: Arc<N>, local: Identity, directory: Arc<PeerDirectory>, config: FloodSubConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = FloodSubActor::new(network, local, directory, config);
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            _network: std::marker::PhantomData,
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?
    }

    /// Drop the local queue for `topic`. Returns `false` if there was none.
    /// Messages for the topic are still relayed.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Unsubscribe(topic.to_string(), tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, tx))
            .await
            .map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?
    }

    /// Process a message relayed by `from`. Returns `true` if it was new.
    pub async fn handle_message(&self, from: &Contact, message: FloodMessage) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleMessage(from.clone(), message, tx))
            .await
            .map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("FloodSub actor closed"))
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetSubscriptions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn seen_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SeenCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// FloodSub Actor (owns state)
// ============================================================================

struct FloodSubActor<N: FloodSubRpc> {
    network: Arc<N>,
    local: Identity,
    directory: Arc<PeerDirectory>,
    config: FloodSubConfig,
    seqno: u64,
    seen: LruCache<MessageId, Instant>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<ReceivedMessage>>,
    outboxes: HashMap<Identity, mpsc::Sender<FloodMessage>>,
}

impl<N: FloodSubRpc> FloodSubActor<N> {
    fn new(network: Arc<N>, local: Identity, directory: Arc<PeerDirectory>, config: FloodSubConfig) -> Self {
        let cap = NonZeroUsize::new(config.seen_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            network,
            local,
            directory,
            config,
            // A restarted node must not reuse ids still cached by its peers.
            seqno: rand::random(),
            seen: LruCache::new(cap),
            subscriptions: HashMap::new(),
            outboxes: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.handle_subscribe_cmd(topic));
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let removed = self.subscriptions.remove(&topic).is_some();
                            if removed {
                                info!(topic = %topic, "unsubscribed from topic");
                            }
                            let _ = reply.send(removed);
                        }
                        Some(Command::Publish(topic, data, reply)) => {
                            let _ = reply.send(self.handle_publish_cmd(topic, data));
                        }
                        Some(Command::HandleMessage(from, message, reply)) => {
                            let _ = reply.send(self.handle_message_internal(&from.identity, message));
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.subscriptions.keys().cloned().collect());
                        }
                        Some(Command::SeenCount(reply)) => {
                            let _ = reply.send(self.seen.len());
                        }
                        Some(Command::Quit) => {
                            debug!("FloodSub actor quitting");
                            break;
                        }
                        None => {
                            debug!("FloodSub handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat_interval.tick() => {
                    self.heartbeat();
                }
            }
        }
        // Dropping the outboxes ends every drain task.
        self.outboxes.clear();
    }

    fn handle_subscribe_cmd(&mut self, topic: String) -> Result<Subscription> {
        check_topic(&topic)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if self.subscriptions.insert(topic.clone(), tx).is_some() {
            debug!(topic = %topic, "replaced existing subscription queue");
        } else {
            info!(topic = %topic, "subscribed to topic");
        }
        Ok(Subscription { topic, rx })
    }

    fn handle_publish_cmd(&mut self, topic: String, data: Vec<u8>) -> Result<MessageId> {
        check_topic(&topic)?;
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }

        self.seqno = self.seqno.wrapping_add(1);
        let message = FloodMessage {
            topic,
            source: self.local,
            seqno: self.seqno,
            data,
        };
        let msg_id = message.id();
        self.seen.put(msg_id, Instant::now());

        self.deliver_local(&message, msg_id);
        let sent = self.forward(&message, &[self.local]);
        trace!(
            msg_id = %hex::encode(&msg_id[..8]),
            topic = %message.topic,
            seqno = message.seqno,
            peers = sent,
            "published message"
        );
        Ok(msg_id)
    }

    fn handle_message_internal(&mut self, from: &Identity, message: FloodMessage) -> bool {
        if check_topic(&message.topic).is_err() || message.data.len() > self.config.max_message_size {
            debug!(from = %from.short(), "dropping malformed flood message");
            return false;
        }

        let msg_id = message.id();
        let now = Instant::now();
        if let Some(seen_at) = self.seen.peek(&msg_id)
            && now.duration_since(*seen_at) < self.config.seen_cache_ttl
        {
            trace!(msg_id = %hex::encode(&msg_id[..8]), from = %from.short(), "duplicate message");
            return false;
        }
        self.seen.put(msg_id, now);

        if message.source == self.local {
            return false;
        }

        self.deliver_local(&message, msg_id);
        let sent = self.forward(&message, &[*from, message.source]);
        trace!(
            msg_id = %hex::encode(&msg_id[..8]),
            from = %from.short(),
            source = %message.source.short(),
            relayed = sent,
            "accepted flood message"
        );
        true
    }

    fn deliver_local(&mut self, message: &FloodMessage, msg_id: MessageId) {
        let Some(tx) = self.subscriptions.get(&message.topic) else {
            return;
        };
        let received = ReceivedMessage {
            topic: message.topic.clone(),
            source: message.source,
            seqno: message.seqno,
            data: message.data.clone(),
            msg_id,
            received_at: Instant::now(),
        };
        if tx.send(received).is_err() {
            debug!(topic = %message.topic, "subscriber dropped, removing subscription");
            self.subscriptions.remove(&message.topic);
        }
    }

    /// Enqueue `message` for every connected peer not in `exclude`.
    fn forward(&mut self, message: &FloodMessage, exclude: &[Identity]) -> usize {
        let mut sent = 0;
        for contact in self.directory.connected() {
            if exclude.contains(&contact.identity) {
                continue;
            }
            let peer = contact.identity;
            let outbox = self.outbox_for(contact);
            match outbox.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer.short(), "outbound queue full, dropping message for peer");
                }
                Err(TrySendError::Closed(_)) => {
                    self.outboxes.remove(&peer);
                }
            }
        }
        sent
    }

    fn outbox_for(&mut self, contact: Contact) -> mpsc::Sender<FloodMessage> {
        if let Some(tx) = self.outboxes.get(&contact.identity)
            && !tx.is_closed()
        {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(self.config.outbox_capacity.max(1));
        self.outboxes.insert(contact.identity, tx.clone());
        tokio::spawn(drain_outbox(self.network.clone(), self.directory.clone(), contact, rx));
        tx
    }

    fn heartbeat(&mut self) {
        let now = Instant::now();
        let ttl = self.config.seen_cache_ttl;
        let mut expired = 0usize;
        // Ids are only ever inserted with `put` and looked up with `peek`, so LRU
        // order is insertion order and the oldest entries sit at the tail.
        while let Some((_, seen_at)) = self.seen.peek_lru() {
            if now.duration_since(*seen_at) < ttl {
                break;
            }
            self.seen.pop_lru();
            expired += 1;
        }
        if expired > 0 {
            trace!(expired, remaining = self.seen.len(), "pruned seen cache");
        }

        self.outboxes.retain(|_, tx| !tx.is_closed());
    }
}

async fn drain_outbox<N: FloodSubRpc>(
    network: Arc<N>,
    directory: Arc<PeerDirectory>,
    to: Contact,
    mut rx: mpsc::Receiver<FloodMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = network.send_flood(&to, message).await {
            warn!(peer = %to.identity.short(), error = %e, "flood send failed, marking peer failed");
            directory.mark_failed(&to.identity);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashSet;
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<Identity, FloodSub<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, id: Identity, node: &FloodSub<TestNetwork>) {
            self.peers.write().await.insert(id, node.clone());
        }

        async fn get(&self, id: &Identity) -> Option<FloodSub<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
        failures: Mutex<HashSet<Identity>>,
        sent: Mutex<Vec<(Identity, MessageId)>>,
    }

    impl TestNetwork {
        async fn set_failure(&self, node: Identity) {
            self.failures.lock().await.insert(node);
        }

        async fn sent_to(&self, node: &Identity) -> usize {
            self.sent.lock().await.iter().filter(|(to, _)| to == node).count()
        }
    }

    #[async_trait::async_trait]
    impl FloodSubRpc for TestNetwork {
        async fn send_flood(&self, to: &Contact, message: FloodMessage) -> Result<()> {
            if self.failures.lock().await.contains(&to.identity) {
                return Err(anyhow!("injected network failure"));
            }
            self.sent.lock().await.push((to.identity, message.id()));
            let peer = self
                .registry
                .get(&to.identity)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))?;
            peer.handle_message(&self.self_contact, message).await?;
            Ok(())
        }
    }

    struct TestNode {
        pubsub: FloodSub<TestNetwork>,
        network: Arc<TestNetwork>,
        directory: Arc<PeerDirectory>,
        contact: Contact,
    }

    impl TestNode {
        async fn new(registry: &Arc<NetworkRegistry>, index: u8) -> Self {
            Self::with_config(registry, index, FloodSubConfig::default()).await
        }

        async fn with_config(registry: &Arc<NetworkRegistry>, index: u8, config: FloodSubConfig) -> Self {
            let contact = Contact::single(Identity::from_bytes([index; 32]), format!("127.0.0.1:{}", 9000 + index as u16));
            let network = Arc::new(TestNetwork {
                registry: registry.clone(),
                self_contact: contact.clone(),
                failures: Mutex::new(HashSet::new()),
                sent: Mutex::new(Vec::new()),
            });
            let directory = Arc::new(PeerDirectory::new(contact.identity));
            let pubsub = FloodSub::spawn(network.clone(), contact.identity, directory.clone(), config);
            registry.register(contact.identity, &pubsub).await;
            Self {
                pubsub,
                network,
                directory,
                contact,
            }
        }

        fn id(&self) -> Identity {
            self.contact.identity
        }
    }

    fn connect(a: &TestNode, b: &TestNode) {
        a.directory.mark_inbound(&b.contact);
        b.directory.mark_inbound(&a.contact);
    }

    fn message(source: u8, seqno: u64, data: &[u8]) -> FloodMessage {
        FloodMessage {
            topic: "chat".into(),
            source: Identity::from_bytes([source; 32]),
            seqno,
            data: data.to_vec(),
        }
    }

    async fn collect_ids(sub: &mut Subscription, count: usize) -> HashSet<MessageId> {
        let mut ids = HashSet::new();
        for _ in 0..count {
            let msg = timeout(RECV_TIMEOUT, sub.recv())
                .await
                .expect("message should arrive in time")
                .expect("subscription open");
            ids.insert(msg.msg_id);
        }
        ids
    }

    async fn assert_quiet(sub: &mut Subscription) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none(), "unexpected extra delivery");
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("chat room"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("caf\u{e9}"));
        assert!(!is_valid_topic("tab\there"));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
        assert_eq!(check_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)), Err(MessageRejection::TopicTooLong));
    }

    #[tokio::test]
    async fn ring_delivers_each_message_exactly_once() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::new();
        for i in 1..=4u8 {
            nodes.push(TestNode::new(&registry, i).await);
        }
        for i in 0..nodes.len() {
            connect(&nodes[i], &nodes[(i + 1) % nodes.len()]);
        }

        let mut subs = Vec::new();
        for node in &nodes {
            subs.push(node.pubsub.subscribe("chat").await.expect("subscribe"));
        }

        let mut published = HashSet::new();
        for n in 0..3u8 {
            let id = nodes[0].pubsub.publish("chat", vec![n]).await.expect("publish");
            published.insert(id);
        }

        for sub in subs.iter_mut() {
            let ids = collect_ids(sub, 3).await;
            assert_eq!(ids, published);
            assert_quiet(sub).await;
        }
    }

    #[tokio::test]
    async fn duplicate_is_neither_delivered_nor_relayed() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let b = TestNode::new(&registry, 2).await;
        connect(&a, &b);
        let mut sub_a = a.pubsub.subscribe("chat").await.expect("subscribe");
        let mut sub_b = b.pubsub.subscribe("chat").await.expect("subscribe");

        let from = Contact::single(Identity::from_bytes([9; 32]), "127.0.0.1:1");
        let msg = message(9, 1, b"hello");
        assert!(a.pubsub.handle_message(&from, msg.clone()).await.expect("handle"));
        assert!(!a.pubsub.handle_message(&from, msg.clone()).await.expect("handle"));

        collect_ids(&mut sub_a, 1).await;
        collect_ids(&mut sub_b, 1).await;
        assert_quiet(&mut sub_a).await;
        assert_quiet(&mut sub_b).await;
        assert_eq!(a.network.sent_to(&b.id()).await, 1);
    }

    #[tokio::test]
    async fn relay_skips_sender_and_source() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let b = TestNode::new(&registry, 2).await;
        let c = TestNode::new(&registry, 3).await;
        connect(&a, &b);
        connect(&b, &c);
        // b relays a topic it never subscribed to.
        let mut sub_c = c.pubsub.subscribe("chat").await.expect("subscribe");

        let id = a.pubsub.publish("chat", b"via b".to_vec()).await.expect("publish");
        let ids = collect_ids(&mut sub_c, 1).await;
        assert!(ids.contains(&id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.network.sent_to(&a.id()).await, 0);
        assert_eq!(b.network.sent_to(&c.id()).await, 1);
        assert_eq!(c.network.sent_to(&b.id()).await, 0);
    }

    #[tokio::test]
    async fn identical_payloads_from_two_sources_are_distinct() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let b = TestNode::new(&registry, 2).await;
        let c = TestNode::new(&registry, 3).await;
        connect(&a, &c);
        connect(&b, &c);
        let mut sub_c = c.pubsub.subscribe("chat").await.expect("subscribe");

        let id_a = a.pubsub.publish("chat", b"same".to_vec()).await.expect("publish");
        let id_b = b.pubsub.publish("chat", b"same".to_vec()).await.expect("publish");
        assert_ne!(id_a, id_b);

        let ids = collect_ids(&mut sub_c, 2).await;
        assert!(ids.contains(&id_a));
        assert!(ids.contains(&id_b));
    }

    #[tokio::test]
    async fn publisher_receives_own_message() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let mut sub = a.pubsub.subscribe("chat").await.expect("subscribe");
        let id = a.pubsub.publish("chat", b"echo".to_vec()).await.expect("publish");
        let msg = timeout(RECV_TIMEOUT, sub.recv()).await.expect("in time").expect("open");
        assert_eq!(msg.msg_id, id);
        assert_eq!(msg.source, a.id());
        assert_eq!(msg.data, b"echo");
    }

    #[tokio::test]
    async fn failed_send_marks_peer_failed() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let b = TestNode::new(&registry, 2).await;
        connect(&a, &b);
        a.network.set_failure(b.id()).await;

        a.pubsub.publish("chat", b"lost".to_vec()).await.expect("publish succeeds locally");

        let failed = timeout(RECV_TIMEOUT, async {
            loop {
                if a.directory.state(&b.id()) == Some(crate::peers::ConnectionState::Failed) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(failed.is_ok(), "peer should be marked failed");
        assert!(a.directory.connected().is_empty());
    }

    #[tokio::test]
    async fn resubscribe_replaces_queue() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let mut first = a.pubsub.subscribe("chat").await.expect("subscribe");
        let mut second = a.pubsub.subscribe("chat").await.expect("subscribe again");
        assert_eq!(second.topic(), "chat");

        assert!(timeout(RECV_TIMEOUT, first.recv()).await.expect("ends").is_none());

        a.pubsub.publish("chat", b"x".to_vec()).await.expect("publish");
        assert!(timeout(RECV_TIMEOUT, second.recv()).await.expect("in time").is_some());
        assert_eq!(a.pubsub.subscriptions().await, vec!["chat".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream_and_stops_local_delivery() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let mut sub = a.pubsub.subscribe("chat").await.expect("subscribe");

        assert!(a.pubsub.unsubscribe("chat").await);
        assert!(!a.pubsub.unsubscribe("chat").await);
        assert!(a.pubsub.subscriptions().await.is_empty());
        assert!(timeout(RECV_TIMEOUT, sub.recv()).await.expect("ends").is_none());

        a.pubsub.publish("chat", b"nobody local".to_vec()).await.expect("publish still works");
        assert_eq!(a.pubsub.seen_count().await, 1);
    }

    #[tokio::test]
    async fn publish_rejects_bad_input() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;

        let err = a
            .pubsub
            .publish("chat", vec![0u8; MAX_MESSAGE_SIZE + 1])
            .await
            .expect_err("too large");
        assert_eq!(err.downcast_ref::<MessageRejection>(), Some(&MessageRejection::MessageTooLarge));

        let err = a.pubsub.publish("", b"x".to_vec()).await.expect_err("empty topic");
        assert_eq!(err.downcast_ref::<MessageRejection>(), Some(&MessageRejection::InvalidTopic));

        assert!(a.pubsub.subscribe("bad\ttopic").await.is_err());
    }

    #[tokio::test]
    async fn seen_cache_is_bounded() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = FloodSubConfig {
            seen_cache_size: 4,
            ..FloodSubConfig::default()
        };
        let a = TestNode::with_config(&registry, 1, config).await;
        let from = Contact::single(Identity::from_bytes([9; 32]), "127.0.0.1:1");
        for seqno in 0..10 {
            a.pubsub.handle_message(&from, message(9, seqno, b"m")).await.expect("handle");
        }
        assert_eq!(a.pubsub.seen_count().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn seen_entries_expire_after_ttl() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::new(&registry, 1).await;
        let from = Contact::single(Identity::from_bytes([9; 32]), "127.0.0.1:1");
        let msg = message(9, 1, b"again");

        assert!(a.pubsub.handle_message(&from, msg.clone()).await.expect("handle"));
        assert!(!a.pubsub.handle_message(&from, msg.clone()).await.expect("handle"));

        tokio::time::advance(DEFAULT_SEEN_CACHE_TTL + Duration::from_secs(2)).await;
        // Let the heartbeat run.
        tokio::task::yield_now().await;

        assert!(a.pubsub.handle_message(&from, msg).await.expect("handle"));
        assert_eq!(a.pubsub.seen_count().await, 1);
    }
}
