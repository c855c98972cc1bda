//! Dialing bootstrap seeds and discovered peers.
//!
//! A dial is a DHT `ping` bounded by `dial_timeout`. Outcomes are written to
//! the [`PeerDirectory`] (`Connecting` then `Connected` or `Failed`); dial
//! errors are logged and never abort the other dials in a batch. At most
//! `max_concurrent_dials` dials from batches run at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identity::{Contact, Identity};
use crate::peers::{ConnectionState, PeerDirectory};
use crate::protocols::DhtNodeRpc;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT_DIALS: usize = 8;

pub struct Connector<N: DhtNodeRpc> {
    network: Arc<N>,
    directory: Arc<PeerDirectory>,
    local: Identity,
    dial_timeout: Duration,
    /// Shared by every clone, so concurrent batches draw from one budget.
    dial_permits: Arc<Semaphore>,
    shutdown: ShutdownSignal,
}

impl<N: DhtNodeRpc> Clone for Connector<N> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            directory: self.directory.clone(),
            local: self.local,
            dial_timeout: self.dial_timeout,
            dial_permits: self.dial_permits.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<N: DhtNodeRpc> Connector<N> {
    pub fn new(
        network: Arc<N>,
        directory: Arc<PeerDirectory>,
        local: Identity,
        dial_timeout: Duration,
        max_concurrent_dials: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            network,
            directory,
            local,
            dial_timeout,
            dial_permits: Arc::new(Semaphore::new(max_concurrent_dials.max(1))),
            shutdown,
        }
    }

    /// Dial one peer. Already-connected peers succeed immediately.
    pub async fn dial(&self, contact: &Contact) -> Result<(), Error> {
        let peer = contact.identity;
        if peer == self.local {
            return Err(Error::TransientNetwork {
                peer: peer.short(),
                reason: "refusing to dial self".into(),
            });
        }
        if self.shutdown.is_signalled() {
            return Err(Error::Shutdown);
        }

        self.directory.upsert_contact(contact);
        if !self.directory.mark_connecting(&peer) {
            return match self.directory.state(&peer) {
                Some(ConnectionState::Connected) => Ok(()),
                Some(ConnectionState::Connecting) => Err(Error::TransientNetwork {
                    peer: peer.short(),
                    reason: "dial already in progress".into(),
                }),
                _ => Err(Error::TransientNetwork {
                    peer: peer.short(),
                    reason: "peer directory refused record".into(),
                }),
            };
        }

        let result = tokio::select! {
            r = tokio::time::timeout(self.dial_timeout, self.network.ping(contact)) => r,
            _ = self.shutdown.signalled() => {
                self.directory.mark_failed(&peer);
                return Err(Error::Shutdown);
            }
        };

        match result {
            Ok(Ok(())) => {
                self.directory.mark_connected(&peer);
                debug!(peer = %peer.short(), addr = ?contact.primary_addr(), "connected to peer");
                Ok(())
            }
            Ok(Err(e)) => {
                self.directory.mark_failed(&peer);
                Err(Error::TransientNetwork {
                    peer: peer.short(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.directory.mark_failed(&peer);
                Err(Error::TransientNetwork {
                    peer: peer.short(),
                    reason: format!("dial timed out after {:?}", self.dial_timeout),
                })
            }
        }
    }

    /// Dial every seed concurrently. Returns how many are connected afterwards.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> usize {
        if seeds.is_empty() {
            info!("no bootstrap peers configured");
            return 0;
        }
        let reached = self.dial_all(seeds.to_vec(), &HashSet::new()).await;
        info!(reached, attempted = seeds.len(), "bootstrap complete");
        reached
    }

    /// Dial `contacts` concurrently, skipping self, duplicates and anything in
    /// `exclude`. Returns how many of them are connected afterwards.
    pub async fn dial_all(&self, contacts: Vec<Contact>, exclude: &HashSet<Identity>) -> usize {
        let mut targets = HashSet::new();
        let mut join_set = JoinSet::new();
        for contact in contacts {
            if contact.identity == self.local
                || exclude.contains(&contact.identity)
                || !targets.insert(contact.identity)
            {
                continue;
            }
            let connector = self.clone();
            join_set.spawn(async move {
                let result = match connector.dial_permits.clone().acquire_owned().await {
                    Ok(_permit) => connector.dial(&contact).await,
                    Err(_) => Err(Error::Shutdown),
                };
                (contact, result)
            });
        }

        let mut connected = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, result)) = joined else { continue };
            match result {
                Ok(()) => connected += 1,
                Err(Error::Shutdown) => {}
                Err(e) => {
                    warn!(
                        peer = %contact.identity.short(),
                        addr = ?contact.primary_addr(),
                        error = %e,
                        "failed to dial peer"
                    );
                }
            }
        }
        connected
    }
}
