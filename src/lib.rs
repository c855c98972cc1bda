//! # Topicmesh - Topic Rendezvous and Flood Messaging
//!
//! Topicmesh lets nodes that share nothing but a topic name find each other
//! and exchange messages:
//!
//! - **Identity**: Ed25519 keypairs; a peer is named by its 32-byte public key
//! - **Rendezvous**: Kademlia-style provider records under `blake3(topic)`
//! - **PubSub**: flood relay to every connected peer with id-based deduplication
//! - **Transport**: one TCP connection per request, length-prefixed bincode frames
//!
//! ## Architecture
//!
//! Stateful components (DHT store, pub/sub) follow the actor pattern:
//! - a cheap-to-clone Handle sends commands over an mpsc channel
//! - a private Actor task owns the state and processes commands in order
//!
//! The [`PeerDirectory`] is shared between them behind a mutex and is the only
//! routing table: lookups read from it, and dials and inbound requests write
//! to it.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Controller: startup sequence, public API, shutdown |
//! | `config` | TOML configuration and bootstrap peer strings |
//! | `identity` | Keypairs, Identities, Contacts, XOR distance |
//! | `peers` | Peer directory and connection states |
//! | `dht` | Provider store and iterative lookups |
//! | `floodsub` | Flood pub/sub with a seen cache |
//! | `bootstrap` | Dialing seeds and discovered providers |
//! | `protocols` | Protocol trait definitions (DhtNodeRpc, FloodSubRpc) |
//! | `rpc` | TCP transport implementing the protocols |
//! | `messages` | Serialization types for the wire protocol |
//! | `shutdown` | Cooperative shutdown signal |
//! | `error` | Error taxonomy |

mod bootstrap;
mod config;
mod dht;
mod error;
mod floodsub;
mod identity;
mod messages;
mod node;
mod peers;
mod protocols;
mod rpc;
mod shutdown;

pub use config::{BootstrapPeer, Config};
pub use dht::topic_key;
pub use error::Error;
pub use identity::{Contact, Identity, Keypair};
pub use messages::{Message, MessageId};
pub use node::{MessageStream, Node, NodeState, TelemetrySnapshot};
pub use peers::{ConnectionState, PeerDirectory};
