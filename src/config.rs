//! Node configuration with TOML file support.
//!
//! Every field has a default, so an empty file (or [`Config::default`]) is a
//! valid single-node configuration. Durations are stored as integer
//! milliseconds or seconds and exposed through accessors.
//!
//! ```toml
//! bind = "0.0.0.0:4001"
//! topic_name = "demo-chat"
//! bootstrap_peers = ["192.0.2.10:4001/5f3c...e1"]
//! provide_timeout_ms = 10000
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dht::MAX_PROVIDER_TTL;
use crate::error::Error;
use crate::floodsub::is_valid_topic;
use crate::identity::{Contact, Identity};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address the RPC listener binds to. Port 0 picks a free port.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Seeds in `IP:PORT/HEX_PEER_ID` form.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    #[serde(default = "default_topic_name")]
    pub topic_name: String,

    #[serde(default = "default_provide_timeout_ms")]
    pub provide_timeout_ms: u64,

    #[serde(default = "default_find_timeout_ms")]
    pub find_timeout_ms: u64,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Upper bound on simultaneous outgoing dials.
    #[serde(default = "default_max_concurrent_dials")]
    pub max_concurrent_dials: usize,

    /// Bound on each individual DHT query inside a lookup.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_provider_ttl_secs")]
    pub provider_ttl_secs: u64,

    /// Extra attempts for provide and find_providers after a total failure.
    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u32,

    #[serde(default = "default_k")]
    pub k: usize,

    #[serde(default = "default_alpha")]
    pub alpha: usize,

    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,

    #[serde(default = "default_seen_cache_ttl_secs")]
    pub seen_cache_ttl_secs: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_topic_name() -> String {
    "demo-chat".to_string()
}

fn default_provide_timeout_ms() -> u64 {
    10_000
}

fn default_find_timeout_ms() -> u64 {
    10_000
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent_dials() -> usize {
    crate::bootstrap::DEFAULT_MAX_CONCURRENT_DIALS
}

fn default_query_timeout_ms() -> u64 {
    3_000
}

fn default_provider_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_discovery_retries() -> u32 {
    3
}

fn default_k() -> usize {
    crate::dht::DEFAULT_K
}

fn default_alpha() -> usize {
    crate::dht::DEFAULT_ALPHA
}

fn default_seen_cache_size() -> usize {
    crate::floodsub::DEFAULT_SEEN_CACHE_SIZE
}

fn default_seen_cache_ttl_secs() -> u64 {
    crate::floodsub::DEFAULT_SEEN_CACHE_TTL.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            bootstrap_peers: Vec::new(),
            topic_name: default_topic_name(),
            provide_timeout_ms: default_provide_timeout_ms(),
            find_timeout_ms: default_find_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            max_concurrent_dials: default_max_concurrent_dials(),
            query_timeout_ms: default_query_timeout_ms(),
            provider_ttl_secs: default_provider_ttl_secs(),
            discovery_retries: default_discovery_retries(),
            k: default_k(),
            alpha: default_alpha(),
            seen_cache_size: default_seen_cache_size(),
            seen_cache_ttl_secs: default_seen_cache_ttl_secs(),
        }
    }
}

// ── Impl ───────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {path}: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Check every field. Called by `Node::start` before anything binds.
    pub fn validate(&self) -> Result<(), Error> {
        self.bind_addr()?;
        self.bootstrap()?;
        if !is_valid_topic(&self.topic_name) {
            return Err(Error::Configuration(format!("invalid topic name {:?}", self.topic_name)));
        }
        for (name, value) in [
            ("provide_timeout_ms", self.provide_timeout_ms),
            ("find_timeout_ms", self.find_timeout_ms),
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
            ("provider_ttl_secs", self.provider_ttl_secs),
            ("seen_cache_ttl_secs", self.seen_cache_ttl_secs),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be greater than zero")));
            }
        }
        if self.provider_ttl() > MAX_PROVIDER_TTL {
            return Err(Error::Configuration(format!(
                "provider_ttl_secs must be at most {}",
                MAX_PROVIDER_TTL.as_secs()
            )));
        }
        if self.k == 0 || self.alpha == 0 || self.seen_cache_size == 0 || self.max_concurrent_dials == 0 {
            return Err(Error::Configuration(
                "k, alpha, seen_cache_size and max_concurrent_dials must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, Error> {
        self.bind
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid bind address {:?}: {e}", self.bind)))
    }

    pub fn bootstrap(&self) -> Result<Vec<BootstrapPeer>, Error> {
        self.bootstrap_peers.iter().map(|s| s.parse()).collect()
    }

    pub fn provide_timeout(&self) -> Duration {
        Duration::from_millis(self.provide_timeout_ms)
    }

    pub fn find_timeout(&self) -> Duration {
        Duration::from_millis(self.find_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn provider_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_ttl_secs)
    }

    pub fn seen_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_cache_ttl_secs)
    }
}

/// A seed peer: `IP:PORT/HEX_PEER_ID`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    pub identity: Identity,
}

impl BootstrapPeer {
    pub fn contact(&self) -> Contact {
        Contact::single(self.identity, self.addr.to_string())
    }
}

impl FromStr for BootstrapPeer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, id) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| Error::Configuration(format!("bootstrap peer {s:?} is not IP:PORT/PEER_ID")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Configuration(format!("bootstrap peer {s:?} has a bad address: {e}")))?;
        let identity = Identity::from_hex(id)
            .map_err(|e| Error::Configuration(format!("bootstrap peer {s:?} has a bad peer id: {e}")))?;
        if !identity.is_valid() {
            return Err(Error::Configuration(format!(
                "bootstrap peer {s:?} has a peer id that is not an Ed25519 public key"
            )));
        }
        Ok(Self { addr, identity })
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}
