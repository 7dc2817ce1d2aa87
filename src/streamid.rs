//! SRT handshake stream-identifier parsing.
//!
//! Two forms are accepted and canonicalized to `(host, app, stream)`:
//!
//! - Slash form: `/host/app/stream` (leading slash optional), exactly three
//!   non-empty segments.
//! - Query form: `h=<host>&r=<stream>&m=<publish|request>`, where `h` may
//!   carry `host/app`; `host` is accepted as an alias for `h`.
//!
//! A stream id containing `?` is only accepted as pure query form; mixing a
//! slash path with a query suffix is rejected.

use crate::constants::MAX_STREAMID_LEN;
use crate::error::{ RelayError, Result };

/// Default app segment when the query form carries a bare host.
const DEFAULT_APP: &str = "live";

/// Connection intent declared in the query form, informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamIdMode {
    #[default]
    Unspecified,
    Publish,
    Request,
}

/// A parsed stream identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId {
    pub host: String,
    pub app: String,
    pub stream: String,
    pub mode: StreamIdMode,
}

impl StreamId {
    /// Canonical `host/app/stream` key.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.host, self.app, self.stream)
    }

    /// The `host/app` prefix used for app lookup and ACL resolution.
    pub fn app_key(&self) -> String {
        format!("{}/{}", self.host, self.app)
    }

    /// Parse a raw handshake stream-id string.
    pub fn parse(raw: &str) -> Result<StreamId> {
        if raw.is_empty() || raw.len() > MAX_STREAMID_LEN {
            return Err(RelayError::BadStreamId(truncate_for_log(raw)));
        }

        if let Some(idx) = raw.find('?') {
            // Query marker present: only pure query form is accepted.
            if !raw[..idx].is_empty() {
                return Err(RelayError::BadStreamId(truncate_for_log(raw)));
            }
            return parse_query(&raw[idx + 1..], raw);
        }
        if raw.contains('=') {
            return parse_query(raw, raw);
        }
        parse_slash(raw)
    }
}

fn parse_slash(raw: &str) -> Result<StreamId> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(RelayError::BadStreamId(truncate_for_log(raw)));
    }
    Ok(StreamId {
        host: segments[0].to_string(),
        app: segments[1].to_string(),
        stream: segments[2].to_string(),
        mode: StreamIdMode::Unspecified,
    })
}

fn parse_query(query: &str, raw: &str) -> Result<StreamId> {
    let mut host_app: Option<&str> = None;
    let mut stream: Option<&str> = None;
    let mut mode = StreamIdMode::Unspecified;

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(RelayError::BadStreamId(truncate_for_log(raw)));
        };
        match key {
            "h" | "host" => host_app = Some(value),
            "r" => stream = Some(value),
            "m" => {
                mode = match value {
                    "publish" => StreamIdMode::Publish,
                    "request" => StreamIdMode::Request,
                    _ => {
                        return Err(RelayError::BadStreamId(truncate_for_log(raw)));
                    }
                };
            }
            // Unknown keys fall through to defaults.
            _ => {}
        }
    }

    let (Some(host_app), Some(stream)) = (host_app, stream) else {
        return Err(RelayError::BadStreamId(truncate_for_log(raw)));
    };
    if host_app.is_empty() || stream.is_empty() || stream.contains('/') {
        return Err(RelayError::BadStreamId(truncate_for_log(raw)));
    }

    let (host, app) = match host_app.split_once('/') {
        Some((host, app)) => {
            if host.is_empty() || app.is_empty() || app.contains('/') {
                return Err(RelayError::BadStreamId(truncate_for_log(raw)));
            }
            (host, app)
        }
        None => (host_app, DEFAULT_APP),
    };

    Ok(StreamId {
        host: host.to_string(),
        app: app.to_string(),
        stream: stream.to_string(),
        mode,
    })
}

fn truncate_for_log(raw: &str) -> String {
    const LIMIT: usize = 128;
    if raw.len() <= LIMIT {
        raw.to_string()
    } else {
        let mut end = LIMIT;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &raw[..end])
    }
}
