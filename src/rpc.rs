//! # RPC Layer
//!
//! TCP transport for both protocols. Each request opens a fresh connection,
//! writes one frame, reads one frame and closes.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ bincode(RpcRequest/Response) │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! - [`TcpNetwork`]: client side, implements [`DhtNodeRpc`] and [`FloodSubRpc`]
//! - [`serve`]: accept loop dispatching requests to the DHT and pub/sub actors
//!
//! Frame sizes are checked before allocation and every decode goes through
//! [`messages::deserialize_bounded`]. Every network step carries a timeout.
//!
//! A peer that pings us or relays a flood message to us is recorded as
//! Connected in the peer directory, which is how inbound sessions join the
//! flood set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::dht::{DhtNode, Key, MAX_CONTACTS_PER_RESPONSE};
use crate::floodsub::FloodSub;
use crate::identity::{Contact, Identity};
use crate::messages::{
    self, DhtNodeRequest, DhtNodeResponse, FloodMessage, RpcRequest, RpcResponse, MAX_FRAME_SIZE,
};
use crate::protocols::{DhtNodeRpc, FloodSubRpc};
use crate::shutdown::ShutdownSignal;

/// Default bound on a whole client round trip (connect, write, read).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent inbound connections; extra connections are closed at once.
const MAX_IN_FLIGHT_CONNECTIONS: usize = 256;

// ============================================================================
// Framing
// ============================================================================

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = messages::serialize(value).context("failed to serialize frame")?;
    if bytes.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", bytes.len(), MAX_FRAME_SIZE);
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the length prefix only. Callers check it before reading the body.
async fn read_frame_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    Ok(u32::from_be_bytes(len_buf) as usize)
}

async fn read_frame_body<R, T>(reader: &mut R, len: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    messages::deserialize_bounded(&body).context("failed to deserialize frame")
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone, Debug)]
pub struct TcpNetwork {
    self_contact: Contact,
    rpc_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(self_contact: Contact, rpc_timeout: Duration) -> Self {
        Self {
            self_contact,
            rpc_timeout,
        }
    }

    async fn rpc(&self, contact: &Contact, request: DhtNodeRequest) -> Result<DhtNodeResponse> {
        match self.rpc_raw(contact, RpcRequest::DhtNode(request)).await? {
            RpcResponse::DhtNode(DhtNodeResponse::Error { message }) => anyhow::bail!("DHT error: {}", message),
            RpcResponse::DhtNode(response) => Ok(response),
            RpcResponse::Error { message } => anyhow::bail!("RPC error: {}", message),
            other => anyhow::bail!("unexpected response type for DHT request: {:?}", other),
        }
    }

    async fn rpc_raw(&self, contact: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        tokio::time::timeout(self.rpc_timeout, self.rpc_inner(contact, request))
            .await
            .context("RPC timed out")?
    }

    async fn rpc_inner(&self, contact: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        let mut stream = connect_any(contact).await?;
        let remote = stream.peer_addr().ok();

        write_frame(&mut stream, &request).await?;

        let len = read_frame_len(&mut stream).await.context("failed to read response header")?;
        if len > MAX_FRAME_SIZE {
            warn!(
                peer = %contact.primary_addr().unwrap_or("<no addr>"),
                size = len,
                max = MAX_FRAME_SIZE,
                "peer sent oversized response"
            );
            anyhow::bail!("response too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
        }
        let response = read_frame_body(&mut stream, len).await?;
        Ok(match remote {
            Some(remote) => normalize_response(response, remote),
            None => response,
        })
    }
}

/// A responder returns its own provider record with whatever address it
/// listens on, which may be unspecified. Rewrite those to the address we
/// actually reached it at.
fn normalize_response(response: RpcResponse, remote: SocketAddr) -> RpcResponse {
    let fix = |contacts: Vec<Contact>| -> Vec<Contact> {
        contacts.into_iter().map(|c| normalize_sender(c, remote)).collect()
    };
    match response {
        RpcResponse::DhtNode(DhtNodeResponse::Nodes(nodes)) => RpcResponse::DhtNode(DhtNodeResponse::Nodes(fix(nodes))),
        RpcResponse::DhtNode(DhtNodeResponse::Providers { providers, closer }) => {
            RpcResponse::DhtNode(DhtNodeResponse::Providers {
                providers: fix(providers),
                closer: fix(closer),
            })
        }
        other => other,
    }
}

/// Connect to the first address of `contact` that accepts.
async fn connect_any(contact: &Contact) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in &contact.addrs {
        match TcpStream::connect(addr.as_str()).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                trace!(addr = %addr, error = %e, "connect attempt failed");
                last_err = Some(anyhow::Error::new(e).context(format!("failed to connect to {addr}")));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("contact has no addresses")))
}

fn truncate_contacts(to: &Contact, contacts: Vec<Contact>) -> Vec<Contact> {
    if contacts.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %to.primary_addr().unwrap_or("<no addr>"),
            count = contacts.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        contacts.into_iter().take(MAX_CONTACTS_PER_RESPONSE).collect()
    } else {
        contacts
    }
}

#[async_trait]
impl DhtNodeRpc for TcpNetwork {
    async fn ping(&self, to: &Contact) -> Result<()> {
        let request = DhtNodeRequest::Ping {
            from: self.self_contact.clone(),
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to Ping: {:?}", other),
        }
    }

    async fn find_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>> {
        let request = DhtNodeRequest::FindNode {
            from: self.self_contact.clone(),
            target,
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Nodes(nodes) => Ok(truncate_contacts(to, nodes)),
            other => anyhow::bail!("unexpected response to FindNode: {:?}", other),
        }
    }

    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)> {
        let request = DhtNodeRequest::GetProviders {
            from: self.self_contact.clone(),
            key,
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Providers { providers, closer } => {
                Ok((truncate_contacts(to, providers), truncate_contacts(to, closer)))
            }
            other => anyhow::bail!("unexpected response to GetProviders: {:?}", other),
        }
    }

    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact, ttl: Duration) -> Result<()> {
        let request = DhtNodeRequest::AddProvider {
            from: self.self_contact.clone(),
            key,
            provider,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        match self.rpc(to, request).await? {
            DhtNodeResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to AddProvider: {:?}", other),
        }
    }
}

#[async_trait]
impl FloodSubRpc for TcpNetwork {
    async fn send_flood(&self, to: &Contact, message: FloodMessage) -> Result<()> {
        let request = RpcRequest::FloodSub {
            from: self.self_contact.clone(),
            message,
        };
        match self.rpc_raw(to, request).await? {
            RpcResponse::FloodAck => Ok(()),
            RpcResponse::Error { message } => anyhow::bail!("flood message rejected: {}", message),
            other => anyhow::bail!("unexpected response to FloodSub: {:?}", other),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Replace unspecified listen addresses (`0.0.0.0:p`) with the IP the
/// connection actually came from.
fn normalize_sender(mut from: Contact, remote: SocketAddr) -> Contact {
    for addr in from.addrs.iter_mut() {
        if let Ok(parsed) = addr.parse::<SocketAddr>()
            && parsed.ip().is_unspecified()
        {
            *addr = SocketAddr::new(remote.ip(), parsed.port()).to_string();
        }
    }
    from
}

/// Accept connections until shutdown is signalled.
pub async fn serve<D, F>(listener: TcpListener, dht: DhtNode<D>, pubsub: FloodSub<F>, shutdown: ShutdownSignal)
where
    D: DhtNodeRpc,
    F: FloodSubRpc,
{
    let local = listener.local_addr().ok();
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT_CONNECTIONS));
    info!(addr = ?local, "RPC listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    debug!(remote = %remote, "too many in-flight connections, dropping");
                    continue;
                };
                let dht = dht.clone();
                let pubsub = pubsub.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, remote, dht, pubsub).await {
                        debug!(remote = %remote, error = ?e, "connection error");
                    }
                    drop(permit);
                });
            }
            _ = shutdown.signalled() => {
                info!("RPC listener stopping");
                break;
            }
        }
    }
}

async fn handle_connection<D, F>(
    mut stream: TcpStream,
    remote: SocketAddr,
    dht: DhtNode<D>,
    pubsub: FloodSub<F>,
) -> Result<()>
where
    D: DhtNodeRpc,
    F: FloodSubRpc,
{
    let len = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame_len(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;

    if len > MAX_FRAME_SIZE {
        warn!(remote = %remote, size = len, max = MAX_FRAME_SIZE, "rejecting oversized request");
        let response = RpcResponse::Error {
            message: format!("request too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        };
        return write_response(&mut stream, &response).await;
    }

    let request: RpcRequest = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame_body(&mut stream, len))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let response = match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, handle_rpc_request(request, remote, &dht, &pubsub)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            RpcResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    write_response(&mut stream, &response).await
}

async fn write_response(stream: &mut TcpStream, response: &RpcResponse) -> Result<()> {
    tokio::time::timeout(RESPONSE_WRITE_TIMEOUT, write_frame(stream, response))
        .await
        .map_err(|_| anyhow::anyhow!("response write timed out"))??;
    stream.shutdown().await.ok();
    Ok(())
}

async fn handle_rpc_request<D, F>(
    request: RpcRequest,
    remote: SocketAddr,
    dht: &DhtNode<D>,
    pubsub: &FloodSub<F>,
) -> RpcResponse
where
    D: DhtNodeRpc,
    F: FloodSubRpc,
{
    // Keeps malformed identities out of the directory and the provider store.
    let sender = request.sender().identity;
    if !sender.is_valid() {
        debug!(%remote, from = %sender.short(), "rejecting request: sender is not an Ed25519 key");
        return RpcResponse::Error {
            message: "invalid sender identity".into(),
        };
    }
    match request {
        RpcRequest::DhtNode(request) => RpcResponse::DhtNode(handle_dht_rpc(dht, request, remote).await),
        RpcRequest::FloodSub { from, message } => {
            let from = normalize_sender(from, remote);
            dht.directory().mark_inbound(&from);
            trace!(from = %from.identity.short(), topic = %message.topic, "dispatching flood message");
            match pubsub.handle_message(&from, message).await {
                Ok(_) => RpcResponse::FloodAck,
                Err(e) => {
                    warn!(from = %from.identity.short(), error = %e, "flood handler returned error");
                    RpcResponse::Error {
                        message: format!("flood error: {}", e),
                    }
                }
            }
        }
    }
}

async fn handle_dht_rpc<D: DhtNodeRpc>(dht: &DhtNode<D>, request: DhtNodeRequest, remote: SocketAddr) -> DhtNodeResponse {
    match request {
        DhtNodeRequest::Ping { from } => {
            let from = normalize_sender(from, remote);
            trace!(from = %from.identity.short(), "handling PING request");
            dht.handle_ping(&from);
            if dht.directory().mark_inbound(&from) {
                debug!(peer = %from.identity.short(), addr = ?from.primary_addr(), "inbound peer connected");
            }
            DhtNodeResponse::Ack
        }
        DhtNodeRequest::FindNode { from, target } => {
            let from = normalize_sender(from, remote);
            let nodes = dht.handle_find_node(&from, target);
            trace!(
                from = %from.identity.short(),
                target = %target.short(),
                returned = nodes.len(),
                "FIND_NODE response"
            );
            DhtNodeResponse::Nodes(nodes)
        }
        DhtNodeRequest::GetProviders { from, key } => {
            let from = normalize_sender(from, remote);
            let (providers, closer) = dht.handle_get_providers(&from, key).await;
            debug!(
                from = %from.identity.short(),
                key = %hex::encode(&key[..8]),
                providers = providers.len(),
                closer = closer.len(),
                "GET_PROVIDERS response"
            );
            DhtNodeResponse::Providers { providers, closer }
        }
        DhtNodeRequest::AddProvider {
            from,
            key,
            provider,
            ttl_ms,
        } => {
            let from = normalize_sender(from, remote);
            let provider = normalize_sender(provider, remote);
            if dht
                .handle_add_provider(&from, key, provider, Duration::from_millis(ttl_ms))
                .await
            {
                DhtNodeResponse::Ack
            } else {
                DhtNodeResponse::Error {
                    message: "provider record rejected".to_string(),
                }
            }
        }
    }
}
