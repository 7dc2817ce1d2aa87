//! Error types shared across the relay core.
//!
//! Every recoverable failure in the core maps onto one `RelayError` variant;
//! the worker loop treats all of them as per-role events and never aborts on
//! one role's failure. Only `ConfigInvalid` is fatal, and only at boot.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The handshake stream identifier could not be parsed.
    #[error("bad stream id '{0}'")]
    BadStreamId(String),

    /// The peer address was rejected by an ACL entry.
    #[error("access denied for {0}")]
    AclDeny(IpAddr),

    /// A publisher is already bound to the stream key.
    #[error("stream '{0}' already has a publisher")]
    AlreadyPublishing(String),

    /// A player connected to a stream with no publisher and no puller.
    #[error("no publisher for stream '{0}'")]
    NoPublisher(String),

    /// A reader cursor fell too far behind the ring head.
    #[error("reader overrun: cursor lagged {lag} bytes behind head")]
    Overrun { lag: u64 },

    /// A single write larger than the whole ring was attempted.
    #[error("write of {len} bytes exceeds ring capacity {capacity}")]
    WouldOverrun { len: usize, capacity: usize },

    /// The peer socket reported a terminal condition.
    #[error("socket broken: {0}")]
    SocketBroken(String),

    /// No bytes moved on the connection for longer than the configured limit.
    #[error("idle timeout after {0} s")]
    IdleTimeout(u64),

    /// A relay upstream refused or timed out; retried after the backoff.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Configuration file or CLI arguments are invalid.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Shorthand for a `ConfigInvalid` with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::ConfigInvalid(msg.into())
    }

    /// True when the error should invalidate the role it occurred on. The
    /// worker gates its sweep decision on this: a terminal error marks the
    /// role invalid, anything else is logged and the role keeps running.
    pub fn is_terminal_for_role(&self) -> bool {
        matches!(
            self,
            RelayError::SocketBroken(_)
                | RelayError::IdleTimeout(_)
                | RelayError::Overrun { .. }
                | RelayError::WouldOverrun { .. }
                | RelayError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_helper_builds_variant() {
        let err = RelayError::config("missing listen port");
        assert!(matches!(err, RelayError::ConfigInvalid(_)));
        assert_eq!(err.to_string(), "invalid configuration: missing listen port");
    }

    #[test]
    fn terminal_classification() {
        assert!(RelayError::SocketBroken("reset".into()).is_terminal_for_role());
        assert!(RelayError::Overrun { lag: 1 }.is_terminal_for_role());
        assert!(RelayError::IdleTimeout(10).is_terminal_for_role());
        assert!(!RelayError::AlreadyPublishing("a/b/c".into()).is_terminal_for_role());
        assert!(!RelayError::NoPublisher("a/b/c".into()).is_terminal_for_role());
    }
}
