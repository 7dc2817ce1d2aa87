//! Read-only HTTP stats endpoint and the periodic stat-post loop.
//!
//! `GET /stats[?publisher=<key>][&reset=1]` serves the JSON document built
//! from the latest worker snapshots; `reset=1` asks the owning worker to
//! clear the publisher's cumulative counters after this read. The same
//! document is POSTed to `stat_post_url` every stat interval when
//! configured. Both run on their own threads and observe the global
//! shutdown flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

use tiny_http::{ Header, Response, Server };
use tracing::{ debug, info, warn };

use crate::error::{ RelayError, Result };
use crate::stats::{ render_stats_json, StatsHub };

pub struct StatsServer {
    server: Arc<Server>,
    handle: std::thread::JoinHandle<()>,
}

impl StatsServer {
    /// Bind and serve the stats endpoint on `port`.
    pub fn spawn(
        port: u16,
        cors_header: Option<String>,
        stats: Arc<StatsHub>,
        shutdown: Arc<AtomicBool>
    ) -> Result<StatsServer> {
        let server = Server::http(("0.0.0.0", port)).map_err(|e| {
            RelayError::config(format!("cannot bind http stats port {port}: {e}"))
        })?;
        let server = Arc::new(server);
        info!(port = self_port(&server), "http stats endpoint up");

        let serve = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                match serve.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(request)) => handle_request(request, &cors_header, &stats),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "http stats endpoint receive failed");
                        break;
                    }
                }
            }
            info!("http stats endpoint stopped");
        });
        Ok(StatsServer { server, handle })
    }

    pub fn port(&self) -> u16 {
        self_port(&self.server)
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn self_port(server: &Server) -> u16 {
    server
        .server_addr()
        .to_ip()
        .map(|a| a.port())
        .unwrap_or(0)
}

fn handle_request(request: tiny_http::Request, cors: &Option<String>, stats: &Arc<StatsHub>) {
    let (path, query) = split_query(request.url());
    debug!(path, "http stats request");

    let response = if path == "/stats" {
        let publisher = query.get("publisher").map(String::as_str);
        if query.get("reset").map(String::as_str) == Some("1") {
            if let Some(key) = publisher {
                stats.request_reset(key);
            }
        }
        let body = render_stats_json(&stats.collect(), publisher).to_string();
        Response::from_string(body).with_status_code(200)
    } else {
        Response::from_string("{\"status\":\"error\",\"message\":\"not found\"}").with_status_code(
            404
        )
    };

    let mut response = response.with_header(
        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("static header")
    );
    if let Some(cors) = cors {
        if let Ok(header) = Header::from_bytes(&b"Access-Control-Allow-Origin"[..], cors.as_bytes()) {
            response = response.with_header(header);
        }
    }
    if let Err(e) = request.respond(response) {
        warn!(error = %e, "http stats respond failed");
    }
}

fn split_query(url: &str) -> (&str, HashMap<String, String>) {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url, ""),
    };
    let mut map = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if let Some((key, value)) = pair.split_once('=') {
            map.insert(key.to_string(), urldecode(value));
        }
    }
    (path, map)
}

fn urldecode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let Some(value) = raw.get(i + 1..i + 3).and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(value);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// POST the stats document to `url` every `interval_secs`.
pub fn spawn_stat_poster(
    url: String,
    interval_secs: u64,
    stats: Arc<StatsHub>,
    shutdown: Arc<AtomicBool>
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let interval = Duration::from_secs(interval_secs.max(1));
        let mut last_post = std::time::Instant::now();
        while !shutdown.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(200));
            if last_post.elapsed() < interval {
                continue;
            }
            last_post = std::time::Instant::now();
            let body = render_stats_json(&stats.collect(), None).to_string();
            match
                ureq
                    ::post(&url)
                    .set("Content-Type", "application/json")
                    .timeout(Duration::from_secs(3))
                    .send_string(&body)
            {
                Ok(_) => debug!(%url, "stats posted"),
                Err(e) => warn!(%url, error = %e, "stat post failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::monotonic_ms;
    use crate::stats::{ RoleCounters, RoleTag };
    use std::net::{ IpAddr, Ipv4Addr, SocketAddr };

    #[test]
    fn urldecode_handles_escapes() {
        assert_eq!(urldecode("a%2Fb%2Fc"), "a/b/c");
        assert_eq!(urldecode("plain"), "plain");
        assert_eq!(urldecode("a+b"), "a b");
        assert_eq!(urldecode("bad%zz"), "bad%zz");
    }

    #[test]
    fn split_query_extracts_pairs() {
        let (path, query) = split_query("/stats?publisher=a%2Fb%2Fc&reset=1");
        assert_eq!(path, "/stats");
        assert_eq!(query.get("publisher").unwrap(), "a/b/c");
        assert_eq!(query.get("reset").unwrap(), "1");
    }

    #[test]
    fn endpoint_serves_stats_document() {
        let stats = Arc::new(StatsHub::new());
        let mut counters = RoleCounters::new();
        counters.record_in(1316);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        stats.publish(
            0,
            vec![counters.snapshot(RoleTag::Publisher, "pub.example/live/demo", peer, monotonic_ms() + 1000)]
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let server = StatsServer::spawn(
            0,
            Some("*".into()),
            Arc::clone(&stats),
            Arc::clone(&shutdown)
        ).unwrap();
        let port = server.port();

        let response = ureq
            ::get(&format!("http://127.0.0.1:{port}/stats"))
            .call()
            .unwrap();
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["publishers"]["pub.example/live/demo"]["bitrate"].is_u64());

        // Reset requests are queued for the owning worker.
        let _ = ureq
            ::get(&format!("http://127.0.0.1:{port}/stats?publisher=pub.example%2Flive%2Fdemo&reset=1"))
            .call()
            .unwrap();
        assert!(stats.take_reset("pub.example/live/demo"));

        let missing = ureq
            ::get(&format!("http://127.0.0.1:{port}/stats?publisher=nope"))
            .call()
            .unwrap();
        let body: serde_json::Value = missing.into_json().unwrap();
        assert_eq!(body["status"], "error");

        shutdown.store(true, Ordering::Release);
        server.join();
    }
}
