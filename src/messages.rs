//! # Wire Protocol Messages
//!
//! All serializable message types exchanged between nodes. Messages are
//! framed as a big-endian `u32` length followed by a bincode body; every
//! decode goes through [`deserialize_bounded`].
//!
//! | Protocol | Request | Response |
//! |----------|---------|----------|
//! | DHT | [`DhtNodeRequest`] | [`DhtNodeResponse`] |
//! | Flood pub/sub | [`FloodMessage`] | `RpcResponse::FloodAck` |
//!
//! ## Message IDs
//!
//! Flood messages are identified by a 32-byte [`MessageId`]:
//! `blake3(source || seqno.to_le_bytes() || data)`. The id is recomputed by
//! every receiver rather than carried on the wire.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::dht::Key;
use crate::identity::{Contact, Identity};

/// Maximum size of a single frame body (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Deserialization limit, slightly above the frame limit for bincode overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub type MessageId = [u8; 32];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeRequest {
    Ping {
        from: Contact,
    },
    FindNode {
        from: Contact,
        target: Identity,
    },
    GetProviders {
        from: Contact,
        key: Key,
    },
    AddProvider {
        from: Contact,
        key: Key,
        provider: Contact,
        /// Record lifetime in milliseconds.
        ttl_ms: u64,
    },
}

impl DhtNodeRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            DhtNodeRequest::Ping { from }
            | DhtNodeRequest::FindNode { from, .. }
            | DhtNodeRequest::GetProviders { from, .. }
            | DhtNodeRequest::AddProvider { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeResponse {
    Ack,
    Nodes(Vec<Contact>),
    Providers {
        providers: Vec<Contact>,
        closer: Vec<Contact>,
    },
    Error {
        message: String,
    },
}

/// A topic message as it travels between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodMessage {
    pub topic: String,
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
}

impl FloodMessage {
    pub fn id(&self) -> MessageId {
        message_id(&self.source, self.seqno, &self.data)
    }
}

pub fn message_id(source: &Identity, seqno: u64, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// A topic message as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    /// Hex-encoded identity of the publisher.
    pub from: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    DhtNode(DhtNodeRequest),
    FloodSub { from: Contact, message: FloodMessage },
}

impl RpcRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            RpcRequest::DhtNode(request) => request.sender(),
            RpcRequest::FloodSub { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    DhtNode(DhtNodeResponse),
    FloodAck,
    Error { message: String },
}
