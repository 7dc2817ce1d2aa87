//! Relay plumbing: upstream URLs, shared context, manager maps.
//!
//! A relay session is an outbound connection to another relay instance:
//! *pullers* fetch a stream on demand when a player arrives before any
//! publisher, *pushers* mirror a local publisher to downstream origins.
//! Managers own the upstream-selection policy and the reconnect backoff;
//! the roles they materialize enter workers exactly like accepted ones.

pub mod puller;
pub mod pusher;

pub use self::puller::{ PullerManager, PullerMap };
pub use self::pusher::{ PusherManager, PusherMap };

use std::net::{ SocketAddr, ToSocketAddrs };
use std::sync::Arc;

use crate::constants::DEFAULT_LATENCY_MS;
use crate::error::{ RelayError, Result };
use crate::registry::StreamRegistry;
use crate::worker::RoleHub;

/// Template token in pusher/puller upstream entries, replaced with the
/// stream name before the URL is parsed.
pub const STREAM_NAME_TOKEN: &str = "{stream_name}";

/// Dependencies a manager needs to materialize roles.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<StreamRegistry>,
    pub hub: Arc<RoleHub>,
    pub ring_capacity: usize,
    pub idle_timeout_secs: Option<u64>,
    pub default_latency_ms: u32,
}

/// A parsed relay upstream URL: `srt://host:port?streamid=<id>[&latency=<ms>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUrl {
    pub host: String,
    pub port: u16,
    pub streamid: String,
    pub latency_ms: Option<u32>,
    /// The canonical text form, used as the backoff map key.
    pub raw: String,
}

impl RelayUrl {
    /// Parse an upstream entry. The `srt://` scheme prefix is optional in
    /// configuration files; any other scheme is rejected. The `streamid`
    /// query parameter is required.
    pub fn parse(input: &str) -> Result<RelayUrl> {
        let rest = match input.split_once("://") {
            Some(("srt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(RelayError::config(format!("unsupported relay scheme '{scheme}'")));
            }
            None => input,
        };
        if rest.contains('{') || rest.contains('}') {
            return Err(
                RelayError::config(format!("unresolved template token in upstream '{input}'"))
            );
        }

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| RelayError::config(format!("upstream '{input}' missing port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::config(format!("upstream '{input}' has invalid port")))?;
        if host.is_empty() {
            return Err(RelayError::config(format!("upstream '{input}' missing host")));
        }

        let mut streamid: Option<String> = None;
        let mut latency_ms: Option<u32> = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(RelayError::config(format!("upstream '{input}' has malformed query")));
            };
            match key {
                "streamid" => {
                    streamid = Some(value.to_string());
                }
                "latency" => {
                    latency_ms = Some(
                        value
                            .parse()
                            .map_err(|_| {
                                RelayError::config(format!("upstream '{input}' invalid latency"))
                            })?
                    );
                }
                _ => {}
            }
        }
        let streamid = streamid.ok_or_else(|| {
            RelayError::config(format!("upstream '{input}' missing streamid parameter"))
        })?;
        if streamid.is_empty() {
            return Err(RelayError::config(format!("upstream '{input}' has empty streamid")));
        }

        Ok(RelayUrl {
            host: host.to_string(),
            port,
            streamid,
            latency_ms,
            raw: format!("srt://{authority}?{query}"),
        })
    }

    pub fn latency_or(&self, default_ms: u32) -> u32 {
        self.latency_ms.unwrap_or(if default_ms == 0 { DEFAULT_LATENCY_MS } else { default_ms })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| RelayError::UpstreamUnreachable(format!("{}: {e}", self.raw)))?
            .next()
            .ok_or_else(|| {
                RelayError::UpstreamUnreachable(format!("{}: no address resolved", self.raw))
            })
    }
}

/// Substitute the stream-name token in an upstream entry.
pub fn expand_template(upstream: &str, stream_name: &str) -> String {
    upstream.replace(STREAM_NAME_TOKEN, stream_name)
}

/// Stable upstream pick for hash mode: same stream, same origin.
pub fn hash_pick(stream_name: &str, upstream_count: usize) -> usize {
    debug_assert!(upstream_count > 0);
    (crc32fast::hash(stream_name.as_bytes()) as usize) % upstream_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let url = RelayUrl::parse("srt://origin.example:4001?streamid=live/app/demo&latency=80")
            .unwrap();
        assert_eq!(url.host, "origin.example");
        assert_eq!(url.port, 4001);
        assert_eq!(url.streamid, "live/app/demo");
        assert_eq!(url.latency_ms, Some(80));
    }

    #[test]
    fn scheme_prefix_is_optional() {
        let bare = RelayUrl::parse("origin.example:4001?streamid=a/b/c").unwrap();
        let schemed = RelayUrl::parse("srt://origin.example:4001?streamid=a/b/c").unwrap();
        assert_eq!(bare, schemed);
        assert_eq!(bare.latency_ms, None);
        assert_eq!(bare.latency_or(0), crate::constants::DEFAULT_LATENCY_MS);
    }

    #[test]
    fn streamid_is_required() {
        assert!(RelayUrl::parse("srt://origin.example:4001").is_err());
        assert!(RelayUrl::parse("srt://origin.example:4001?latency=80").is_err());
    }

    #[test]
    fn other_schemes_rejected() {
        assert!(RelayUrl::parse("http://origin.example:4001?streamid=x").is_err());
    }

    #[test]
    fn template_expansion() {
        let expanded = expand_template("srt://o.example:4001?streamid=up/live/{stream_name}", "demo");
        assert_eq!(expanded, "srt://o.example:4001?streamid=up/live/demo");
        let url = RelayUrl::parse(&expanded).unwrap();
        assert_eq!(url.streamid, "up/live/demo");
    }

    #[test]
    fn unexpanded_template_rejected() {
        assert!(RelayUrl::parse("srt://o.example:4001?streamid=up/live/{stream_name}").is_err());
    }

    #[test]
    fn hash_pick_is_deterministic() {
        let a = hash_pick("demo", 7);
        assert_eq!(a, hash_pick("demo", 7));
        assert!(a < 7);
    }
}
