//! Fire-and-forget HTTP event callbacks.
//!
//! When a server block configures `on_event_url`, the relay notifies that
//! endpoint on every role connect and close. Callbacks are best-effort and
//! must never block the accept path or a worker tick, so each one runs on a
//! short-lived detached thread.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{ debug, warn };

use crate::stats::RoleTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Connect,
    Close,
}

impl StreamEvent {
    fn as_str(&self) -> &'static str {
        match self {
            StreamEvent::Connect => "connect",
            StreamEvent::Close => "close",
        }
    }
}

/// Notify `url` of a role lifecycle event. Never blocks the caller.
pub fn notify(url: &str, event: StreamEvent, tag: RoleTag, stream_key: &str, peer: SocketAddr) {
    let request_url = format!(
        "{}?event={}&role={}&stream={}&remote={}",
        url,
        event.as_str(),
        tag.as_str(),
        urlencode(stream_key),
        urlencode(&peer.to_string())
    );
    std::thread::spawn(move || {
        match ureq::get(&request_url).timeout(Duration::from_secs(2)).call() {
            Ok(_) => debug!(url = %request_url, "event callback delivered"),
            Err(e) => warn!(url = %request_url, error = %e, "event callback failed"),
        }
    });
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_separators() {
        assert_eq!(urlencode("publish.example/live/demo"), "publish.example%2Flive%2Fdemo");
        assert_eq!(urlencode("127.0.0.1:9000"), "127.0.0.1%3A9000");
        assert_eq!(urlencode("plain-name_ok.~"), "plain-name_ok.~");
    }
}
