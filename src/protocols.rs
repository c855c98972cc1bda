//! Protocol trait definitions.
//!
//! The DHT and flood pub/sub depend only on these traits, never on the
//! transport. `rpc::TcpNetwork` implements them over TCP; unit tests
//! implement them over an in-memory registry.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtNodeRpc`] | liveness, closest-node and provider queries |
//! | Pub/Sub | [`FloodSubRpc`] | flood message forwarding |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::Key;
use crate::identity::{Contact, Identity};
use crate::messages::FloodMessage;

#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Liveness check. A successful ping is what "connected" means.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>>;

    /// Ask `to` for live providers of `key`, plus closer contacts.
    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)>;

    /// Ask `to` to remember `provider` as a provider of `key` for `ttl`.
    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact, ttl: Duration) -> Result<()>;
}

#[async_trait]
pub trait FloodSubRpc: Send + Sync + 'static {
    async fn send_flood(&self, to: &Contact, message: FloodMessage) -> Result<()>;
}
