use std::time::Duration;

/// Failures surfaced by discovery, dialing and node startup.
///
/// Per-peer problems ([`Error::TransientNetwork`]) are absorbed by the
/// component that hit them and only ever appear in logs. The controller sees
/// whole-operation failures and decides whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient network error with peer {peer}: {reason}")]
    TransientNetwork { peer: String, reason: String },

    #[error("{operation} exceeded its deadline after {elapsed:?}")]
    LookupTimeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("discovery failed: {0}")]
    TotalDiscoveryFailure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("node is shutting down")]
    Shutdown,
}

impl Error {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TotalDiscoveryFailure(_) | Error::TransientNetwork { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::TransientNetwork {
            peer: "abcd".into(),
            reason: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abcd"));
        assert!(msg.contains("connection refused"));

        let err = Error::LookupTimeout {
            operation: "find_providers",
            elapsed: Duration::from_secs(10),
        };
        assert!(err.to_string().starts_with("find_providers exceeded"));
    }

    #[test]
    fn only_discovery_and_network_failures_are_retryable() {
        assert!(Error::TotalDiscoveryFailure("none".into()).is_retryable());
        assert!(!Error::Configuration("bad".into()).is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }
}
