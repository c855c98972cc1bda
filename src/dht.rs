//! # Rendezvous DHT
//!
//! Kademlia-style provider records keyed by topic. A node announces itself as
//! a provider of `topic_key(topic)` on the peers closest to that key, and
//! later asks the same neighbourhood who else announced.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      DhtNode (Handle)                      │
//! │   provide / find_providers / find_node / handle_* (RPC)    │
//! └──────────────────────────────┬─────────────────────────────┘
//!                                │ mpsc::Sender<Command>
//!                                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                     DhtNodeActor (Task)                    │
//! │   ProviderStore (LRU keys, per-key provider map, expiry)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Routing state is not kept here: lookups seed from and feed back into the
//! shared [`PeerDirectory`].
//!
//! ## Lookups
//!
//! Iterative and parallel: at most `alpha` queries in flight, each bounded
//! by `query_timeout`, the whole lookup bounded by a caller deadline. A round
//! that turns up nothing closer triggers one final round over the remaining
//! shortlist; the iteration cap, the deadline and shutdown end it early.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use lru::LruCache;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::identity::{distance_cmp, Contact, Identity};
use crate::peers::PeerDirectory;
use crate::protocols::DhtNodeRpc;
use crate::shutdown::ShutdownSignal;

pub type Key = [u8; 32];

/// DHT key under which providers of `topic` rendezvous.
pub fn topic_key(topic: &str) -> Key {
    *blake3::hash(topic.as_bytes()).as_bytes()
}

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Remote peers cannot pin a record for longer than this.
pub const MAX_PROVIDER_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Bounds the number of contacts accepted from (and sent in) a single reply.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 100;

const MAX_LOOKUP_ITERATIONS: usize = 20;
const MAX_PROVIDERS_PER_KEY: usize = 100;
const MAX_PROVIDER_KEYS: usize = 10_000;
const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct DhtParams {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
}

impl Default for DhtParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

// ============================================================================
// Provider Store
// ============================================================================

#[derive(Clone, Debug)]
struct ProviderEntry {
    provider: Contact,
    expires_at: Instant,
}

/// Provider records with per-record expiry.
///
/// Keys are LRU-bounded; each key holds at most `MAX_PROVIDERS_PER_KEY`
/// providers. A record is live strictly before its `expires_at`, and reads
/// never return anything else.
struct ProviderStore {
    entries: LruCache<Key, HashMap<Identity, ProviderEntry>>,
}

impl ProviderStore {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Insert or refresh a record. Returns `false` when the key is full of
    /// live providers.
    fn add(&mut self, key: Key, provider: Contact, ttl: Duration, now: Instant) -> bool {
        let ttl = ttl.min(MAX_PROVIDER_TTL);
        let providers = self.entries.get_or_insert_mut(key, HashMap::new);
        if !providers.contains_key(&provider.identity) && providers.len() >= MAX_PROVIDERS_PER_KEY {
            providers.retain(|_, entry| now < entry.expires_at);
            if providers.len() >= MAX_PROVIDERS_PER_KEY {
                return false;
            }
        }
        providers.insert(
            provider.identity,
            ProviderEntry {
                provider,
                expires_at: now + ttl,
            },
        );
        true
    }

    fn get(&mut self, key: &Key, now: Instant) -> Vec<Contact> {
        let Some(providers) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        providers.retain(|_, entry| now < entry.expires_at);
        let live: Vec<Contact> = providers.values().map(|e| e.provider.clone()).collect();
        if live.is_empty() {
            self.entries.pop(key);
        }
        live
    }

    /// Drop every expired record. Returns how many were removed.
    fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        let mut empty_keys = Vec::new();
        for (key, providers) in self.entries.iter_mut() {
            let before = providers.len();
            providers.retain(|_, entry| now < entry.expires_at);
            removed += before - providers.len();
            if providers.is_empty() {
                empty_keys.push(*key);
            }
        }
        for key in empty_keys {
            self.entries.pop(&key);
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Lookup results
// ============================================================================

/// Providers discovered for a key.
///
/// `peers` never contains the local node; whether the local node is itself a
/// provider is reported separately in `includes_self`.
#[derive(Clone, Debug)]
pub struct ProviderSet {
    pub peers: Vec<Contact>,
    pub includes_self: bool,
    /// The lookup hit its deadline and this set may be partial.
    pub timed_out: bool,
    local: Identity,
}

impl ProviderSet {
    /// A set with nobody in it, used when discovery is abandoned.
    pub fn empty(local: Identity) -> Self {
        Self {
            peers: Vec::new(),
            includes_self: false,
            timed_out: false,
            local,
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        (self.includes_self && *identity == self.local)
            || self.peers.iter().any(|c| c.identity == *identity)
    }

    /// True when no remote provider was found.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupKind {
    Nodes,
    Providers,
}

#[derive(Debug, Default)]
struct LookupOutcome {
    /// Closest contacts seen, nearest first, at most `k`.
    closest: Vec<Contact>,
    providers: HashMap<Identity, Contact>,
    saw_self_as_provider: bool,
    responded: HashSet<Identity>,
    queried: usize,
    timed_out: bool,
}

struct QueryReply {
    closer: Vec<Contact>,
    providers: Vec<Contact>,
}

async fn query<N: DhtNodeRpc>(network: &N, to: &Contact, target: Identity, kind: LookupKind) -> Result<QueryReply> {
    match kind {
        LookupKind::Nodes => {
            let closer = network.find_node(to, target).await?;
            Ok(QueryReply {
                closer,
                providers: Vec::new(),
            })
        }
        LookupKind::Providers => {
            let (providers, closer) = network.get_providers(to, *target.as_bytes()).await?;
            Ok(QueryReply { closer, providers })
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: Identity,
    self_contact: Contact,
    network: Arc<N>,
    directory: Arc<PeerDirectory>,
    params: DhtParams,
    shutdown: ShutdownSignal,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_contact: self.self_contact.clone(),
            network: self.network.clone(),
            directory: self.directory.clone(),
            params: self.params,
            shutdown: self.shutdown.clone(),
        }
    }
}

enum Command {
    AddProvider(Key, Contact, Duration, oneshot::Sender<bool>),
    GetProviders(Key, oneshot::Sender<Vec<Contact>>),
    StoredKeys(oneshot::Sender<usize>),
    Quit,
}

impl<N: DhtNodeRpc> DhtNode<N> {
    pub fn new(
        self_contact: Contact,
        network: N,
        directory: Arc<PeerDirectory>,
        params: DhtParams,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = DhtNodeActor {
            store: ProviderStore::new(MAX_PROVIDER_KEYS),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            id: self_contact.identity,
            self_contact,
            network: Arc::new(network),
            directory,
            params,
            shutdown,
        }
    }

    pub fn identity(&self) -> Identity {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // ------------------------------------------------------------------------
    // Local store
    // ------------------------------------------------------------------------

    async fn store_provider(&self, key: Key, provider: Contact, ttl: Duration) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddProvider(key, provider, ttl, tx))
            .await
            .map_err(|_| anyhow!("DHT actor closed"))?;
        rx.await.map_err(|_| anyhow!("DHT actor closed"))
    }

    /// Live providers of `key` in the local store, the local node included.
    pub async fn local_providers(&self, key: Key) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetProviders(key, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stored_keys(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StoredKeys(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Responder side
    // ------------------------------------------------------------------------

    pub fn handle_ping(&self, from: &Contact) {
        self.directory.upsert_contact(from);
    }

    pub fn handle_find_node(&self, from: &Contact, target: Identity) -> Vec<Contact> {
        self.directory.upsert_contact(from);
        self.directory
            .closest(&target, self.params.k + 1)
            .into_iter()
            .filter(|c| c.identity != from.identity)
            .take(self.params.k)
            .collect()
    }

    /// Live providers we hold for `key`, plus the closest peers we know.
    pub async fn handle_get_providers(&self, from: &Contact, key: Key) -> (Vec<Contact>, Vec<Contact>) {
        let closer = self.handle_find_node(from, Identity::from_bytes(key));
        let mut providers = self.local_providers(key).await;
        providers.truncate(MAX_CONTACTS_PER_RESPONSE);
        (providers, closer)
    }

    /// Accept a provider record. A peer may only announce itself.
    pub async fn handle_add_provider(&self, from: &Contact, key: Key, provider: Contact, ttl: Duration) -> bool {
        self.directory.upsert_contact(from);
        if provider.identity != from.identity {
            debug!(
                from = %from.identity.short(),
                provider = %provider.identity.short(),
                "rejecting third-party provider record"
            );
            return false;
        }
        let mut provider = provider;
        if provider.addrs.is_empty() {
            provider.addrs = from.addrs.clone();
        }
        match self.store_provider(key, provider, ttl).await {
            Ok(accepted) => {
                trace!(key = %hex::encode(&key[..8]), from = %from.identity.short(), accepted, "add provider");
                accepted
            }
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Initiator side
    // ------------------------------------------------------------------------

    /// The closest peers to `target` reachable through the network.
    pub async fn find_node(&self, target: Identity, deadline: Duration) -> Result<Vec<Contact>, Error> {
        let outcome = self
            .lookup(target, LookupKind::Nodes, Instant::now() + deadline)
            .await?;
        Ok(outcome.closest)
    }

    /// Announce the local node as a provider of `key`.
    ///
    /// The record is always stored locally, then sent to the closest
    /// responsive peers. Returns the number of stores that succeeded,
    /// counting the local one.
    pub async fn provide(&self, key: Key, ttl: Duration, deadline: Duration) -> Result<usize, Error> {
        let started = Instant::now();
        let deadline_at = started + deadline;

        self.store_provider(key, self.self_contact.clone(), ttl)
            .await
            .map_err(|_| Error::Shutdown)?;

        let outcome = self.lookup(Identity::from_bytes(key), LookupKind::Nodes, deadline_at).await?;

        let targets: Vec<Contact> = outcome
            .closest
            .into_iter()
            .filter(|c| outcome.responded.contains(&c.identity))
            .take(self.params.k)
            .collect();

        if targets.is_empty() {
            if outcome.queried > 0 {
                return Err(Error::TotalDiscoveryFailure(format!(
                    "none of {} queried peers responded to provide lookup",
                    outcome.queried
                )));
            }
            info!(key = %hex::encode(&key[..8]), "no known peers, provider record stored locally only");
            return Ok(1);
        }

        let candidates = targets.len();
        let permits = Arc::new(Semaphore::new(self.params.alpha.max(1)));
        let mut join_set = JoinSet::new();
        for contact in targets {
            let network = self.network.clone();
            let permits = permits.clone();
            let provider = self.self_contact.clone();
            let query_timeout = self.params.query_timeout;
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = match tokio::time::timeout(query_timeout, network.add_provider(&contact, key, provider, ttl)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("store timeout")),
                };
                (contact, result)
            });
        }

        let mut stored = 0usize;
        let mut timed_out = false;
        loop {
            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = tokio::time::sleep_until(deadline_at) => {
                    timed_out = true;
                    None
                }
                _ = self.shutdown.signalled() => return Err(Error::Shutdown),
            };
            let Some(joined) = joined else { break };
            let Ok((contact, result)) = joined else { continue };
            match result {
                Ok(()) => stored += 1,
                Err(e) => {
                    let err = Error::TransientNetwork {
                        peer: contact.identity.short(),
                        reason: e.to_string(),
                    };
                    debug!(error = %err, "provider store failed");
                }
            }
        }

        if stored == 0 {
            return Err(Error::TotalDiscoveryFailure(format!(
                "no peer accepted the provider record ({candidates} candidates)"
            )));
        }
        if timed_out {
            let err = Error::LookupTimeout {
                operation: "provide",
                elapsed: started.elapsed(),
            };
            warn!(error = %err, stored, candidates, "returning partial provide result");
        }

        debug!(key = %hex::encode(&key[..8]), stored, candidates, "provide completed");
        Ok(stored + 1)
    }

    /// Discover providers of `key`.
    ///
    /// Finding nobody is not an error as long as somebody answered; failing
    /// to reach any peer when nothing is known locally is.
    pub async fn find_providers(&self, key: Key, deadline: Duration) -> Result<ProviderSet, Error> {
        let started = Instant::now();
        let local = self.local_providers(key).await;
        let outcome = self
            .lookup(Identity::from_bytes(key), LookupKind::Providers, started + deadline)
            .await?;

        if outcome.responded.is_empty() && local.is_empty() {
            let reason = if outcome.queried == 0 {
                "no known peers to query".to_string()
            } else {
                format!("none of {} queried peers responded", outcome.queried)
            };
            return Err(Error::TotalDiscoveryFailure(reason));
        }

        let mut includes_self = outcome.saw_self_as_provider;
        let mut merged = outcome.providers;
        for contact in local {
            if contact.identity == self.id {
                includes_self = true;
                continue;
            }
            match merged.entry(contact.identity) {
                Entry::Occupied(mut e) => {
                    e.get_mut().merge_addrs(&contact.addrs);
                }
                Entry::Vacant(e) => {
                    e.insert(contact);
                }
            }
        }

        if outcome.timed_out {
            let err = Error::LookupTimeout {
                operation: "find_providers",
                elapsed: started.elapsed(),
            };
            warn!(error = %err, found = merged.len(), "returning partial provider set");
        }

        Ok(ProviderSet {
            peers: merged.into_values().collect(),
            includes_self,
            timed_out: outcome.timed_out,
            local: self.id,
        })
    }

    async fn lookup(&self, target: Identity, kind: LookupKind, deadline: Instant) -> Result<LookupOutcome, Error> {
        let k = self.params.k.max(1);
        let alpha = self.params.alpha.max(1);

        // The final round may query up to k peers; this keeps at most alpha
        // of them in flight.
        let permits = Arc::new(Semaphore::new(alpha));

        let mut outcome = LookupOutcome::default();
        let mut shortlist = self.directory.closest(&target, k);
        let mut seen: HashSet<Identity> = shortlist.iter().map(|c| c.identity).collect();
        seen.insert(self.id);
        let mut queried: HashSet<Identity> = HashSet::new();

        let mut best_distance = shortlist
            .first()
            .map(|c| c.identity.xor_distance(&target))
            .unwrap_or([0xff; 32]);

        // Once a round brings nothing closer, every unqueried contact in the
        // shortlist gets one last query before the lookup ends.
        let mut final_round = false;

        for iteration in 1..=MAX_LOOKUP_ITERATIONS {
            if self.shutdown.is_signalled() {
                return Err(Error::Shutdown);
            }
            if Instant::now() >= deadline {
                outcome.timed_out = true;
                break;
            }

            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.identity))
                .take(if final_round { k } else { alpha })
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            queried.extend(candidates.iter().map(|c| c.identity));

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let network = self.network.clone();
                let permits = permits.clone();
                let query_timeout = self.params.query_timeout;
                join_set.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let result = match tokio::time::timeout(query_timeout, query(network.as_ref(), &contact, target, kind)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (contact, result)
                });
            }

            loop {
                let joined = tokio::select! {
                    joined = join_set.join_next() => joined,
                    _ = tokio::time::sleep_until(deadline) => {
                        outcome.timed_out = true;
                        None
                    }
                    _ = self.shutdown.signalled() => return Err(Error::Shutdown),
                };
                let Some(joined) = joined else { break };
                let Ok((contact, result)) = joined else { continue };

                match result {
                    Ok(reply) => {
                        outcome.responded.insert(contact.identity);
                        self.directory.upsert_contact(&contact);

                        for provider in reply.providers.into_iter().take(MAX_CONTACTS_PER_RESPONSE) {
                            if provider.identity == self.id {
                                outcome.saw_self_as_provider = true;
                                continue;
                            }
                            self.directory.upsert_contact(&provider);
                            match outcome.providers.entry(provider.identity) {
                                Entry::Occupied(mut e) => {
                                    e.get_mut().merge_addrs(&provider.addrs);
                                }
                                Entry::Vacant(e) => {
                                    e.insert(provider);
                                }
                            }
                        }

                        for node in reply.closer.into_iter().take(MAX_CONTACTS_PER_RESPONSE) {
                            if node.addrs.is_empty() || node.identity == self.id {
                                continue;
                            }
                            self.directory.upsert_contact(&node);
                            if seen.insert(node.identity) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Err(e) => {
                        let err = Error::TransientNetwork {
                            peer: contact.identity.short(),
                            reason: e.to_string(),
                        };
                        // Query failures leave directory state alone.
                        debug!(error = %err, "lookup query failed");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = a.identity.xor_distance(&target);
                let db = b.identity.xor_distance(&target);
                distance_cmp(&da, &db)
            });
            shortlist.truncate(k);

            let mut any_closer = false;
            if let Some(first) = shortlist.first() {
                let new_best = first.identity.xor_distance(&target);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }

            if outcome.timed_out || final_round {
                break;
            }
            if !any_closer {
                final_round = true;
            }
            if iteration == MAX_LOOKUP_ITERATIONS {
                warn!(target = %target.short(), iterations = iteration, "iterative lookup exceeded max iterations");
            }
        }

        outcome.queried = queried.len();
        debug!(
            target = %target.short(),
            ?kind,
            found = shortlist.len(),
            providers = outcome.providers.len(),
            queried = outcome.queried,
            responded = outcome.responded.len(),
            timed_out = outcome.timed_out,
            "iterative lookup completed"
        );
        outcome.closest = shortlist;
        Ok(outcome)
    }
}

// ============================================================================
// Actor
// ============================================================================

struct DhtNodeActor {
    store: ProviderStore,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtNodeActor {
    async fn run(mut self) {
        let mut expiry = tokio::time::interval(EXPIRATION_CHECK_INTERVAL);
        expiry.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::AddProvider(key, provider, ttl, reply)) => {
                            let _ = reply.send(self.store.add(key, provider, ttl, Instant::now()));
                        }
                        Some(Command::GetProviders(key, reply)) => {
                            let _ = reply.send(self.store.get(&key, Instant::now()));
                        }
                        Some(Command::StoredKeys(reply)) => {
                            let _ = reply.send(self.store.len());
                        }
                        Some(Command::Quit) | None => {
                            debug!("DHT actor shutting down");
                            break;
                        }
                    }
                }
                _ = expiry.tick() => {
                    let removed = self.store.expire(Instant::now());
                    if removed > 0 {
                        debug!(removed, remaining_keys = self.store.len(), "expired provider records");
                    }
                }
            }
        }
    }
}
