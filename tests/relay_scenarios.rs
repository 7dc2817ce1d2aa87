//! End-to-end scenarios over loopback: publish/fan-out, publisher
//! uniqueness, ACL rejection, and on-demand pull relay between two
//! relay instances.

use std::net::{ IpAddr, Ipv4Addr, SocketAddr };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::{ Duration, Instant };

use srt_relay::config::Config;
use srt_relay::error::RelayError;
use srt_relay::manager::Manager;
use srt_relay::stats::StatsHub;
use srt_relay::transport::{ self, Connection };

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn boot(conf: &str) -> (Manager, u16, Arc<AtomicBool>) {
    let config = Config::parse_str(conf).unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let manager = Manager::start(&config, Arc::new(StatsHub::new()), Arc::clone(&shutdown))
        .unwrap();
    let port = manager.ports()[0];
    (manager, port, shutdown)
}

fn recv_with_deadline(conn: &mut Connection, deadline: Duration) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        match conn.recv_payload() {
            Ok(Some(payload)) => out.push(payload),
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(_) => {
                break;
            }
        }
    }
    out
}

const EDGE_CONF: &str = r#"
srt {
    worker_threads 1;
    server {
        listen 0;
        domain_player play.example;
        domain_publisher publish.example;
        app {
            app_publisher live;
            app_player live;
            allow_publish accept 0;
            allow_play accept 0;
        }
    }
}
"#;

/// A publisher pushes TS datagrams; a late player receives the live tail.
#[test]
fn publisher_fans_out_to_player() {
    let (manager, port, shutdown) = boot(EDGE_CONF);

    let mut publisher = transport
        ::connect(addr(port), "publish.example/live/demo", 0)
        .unwrap();
    // Let the worker register the publisher before the player attaches.
    std::thread::sleep(Duration::from_millis(250));
    let mut player = transport::connect(addr(port), "play.example/live/demo", 0).unwrap();
    std::thread::sleep(Duration::from_millis(250));

    for i in 0..10u8 {
        publisher.send_payload(&[i; 1316]).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    let received = recv_with_deadline(&mut player, Duration::from_secs(3));
    assert!(received.len() >= 10, "player got {} datagrams", received.len());
    // Delivery preserves publisher order.
    let tags: Vec<u8> = received.iter().map(|p| p[0]).collect();
    let mut sorted = tags.clone();
    sorted.sort_unstable();
    assert_eq!(tags, sorted);

    shutdown.store(true, Ordering::Release);
    manager.finish();
}

/// A second publisher for the same key is refused; the first continues.
#[test]
fn duplicate_publisher_is_refused() {
    let (manager, port, shutdown) = boot(EDGE_CONF);

    let mut first = transport::connect(addr(port), "publish.example/live/demo", 0).unwrap();
    std::thread::sleep(Duration::from_millis(250));

    let err = transport::connect(addr(port), "publish.example/live/demo", 0).unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnreachable(_)));

    // The surviving publisher still feeds players.
    let mut player = transport::connect(addr(port), "play.example/live/demo", 0).unwrap();
    std::thread::sleep(Duration::from_millis(250));
    first.send_payload(&[9u8; 1316]).unwrap();
    let received = recv_with_deadline(&mut player, Duration::from_secs(2));
    assert!(!received.is_empty());

    shutdown.store(true, Ordering::Release);
    manager.finish();
}

/// A wildcard publish deny keeps the stream unregistered.
#[test]
fn acl_denies_publisher() {
    let conf = EDGE_CONF.replace("allow_publish accept 0;", "allow_publish deny 0;");
    let (manager, port, shutdown) = boot(&conf);

    assert!(transport::connect(addr(port), "publish.example/live/demo", 0).is_err());
    assert!(manager.registries()[0].get_publisher("publish.example/live/demo").is_none());

    shutdown.store(true, Ordering::Release);
    manager.finish();
}

/// Player demand starts a puller against an origin relay; both relays end
/// up carrying the same stream.
#[test]
fn pull_relay_warms_stream_on_demand() {
    const ORIGIN_CONF: &str = r#"
srt {
    worker_threads 1;
    server {
        listen 0;
        domain_player play.origin;
        domain_publisher publish.origin;
        app {
            app_publisher live;
            app_player live;
            allow_publish accept 0;
            allow_play accept 0;
        }
    }
}
"#;
    let (origin, origin_port, origin_shutdown) = boot(ORIGIN_CONF);

    // Feed the origin continuously from a background publisher.
    let stop_feed = Arc::new(AtomicBool::new(false));
    let feed_flag = Arc::clone(&stop_feed);
    let feeder = std::thread::spawn(move || {
        let mut publisher = transport
            ::connect(addr(origin_port), "publish.origin/live/demo", 0)
            .unwrap();
        let mut i = 0u8;
        while !feed_flag.load(Ordering::Acquire) {
            let _ = publisher.send_payload(&[i; 1316]);
            i = i.wrapping_add(1);
            std::thread::sleep(Duration::from_millis(5));
        }
        publisher.send_shutdown();
    });
    std::thread::sleep(Duration::from_millis(300));

    let edge_conf = format!(
        r#"
srt {{
    worker_threads 1;
    server {{
        listen 0;
        domain_player play.edge;
        domain_publisher publish.edge;
        app {{
            app_publisher live;
            app_player live;
            allow_publish accept 0;
            allow_play accept 0;
            relay {{
                type pull;
                mode loop;
                reconnect_interval 1;
                upstreams 127.0.0.1:{origin_port}?streamid=play.origin/live/{{stream_name}};
            }}
        }}
    }}
}}
"#
    );
    let (edge, edge_port, edge_shutdown) = boot(&edge_conf);

    // No local publisher on the edge: the player's arrival starts the pull.
    let mut player = transport::connect(addr(edge_port), "play.edge/live/demo", 0).unwrap();
    let received = recv_with_deadline(&mut player, Duration::from_secs(4));
    assert!(!received.is_empty(), "player received nothing through the pull relay");

    // The puller occupies the edge's publisher slot.
    assert!(edge.registries()[0].get_publisher("publish.edge/live/demo").is_some());

    // A second player joins the same warmed stream immediately.
    let mut second = transport::connect(addr(edge_port), "play.edge/live/demo", 0).unwrap();
    let more = recv_with_deadline(&mut second, Duration::from_secs(3));
    assert!(!more.is_empty());

    stop_feed.store(true, Ordering::Release);
    let _ = feeder.join();
    edge_shutdown.store(true, Ordering::Release);
    origin_shutdown.store(true, Ordering::Release);
    edge.finish();
    origin.finish();
}

/// Reloading an identical configuration yields an equal registry.
#[test]
fn identical_reload_preserves_registry_shape() {
    let (first, _port, shutdown) = boot(EDGE_CONF);
    let config = Config::parse_str(EDGE_CONF).unwrap();
    let mut old = first;
    old.begin_drain();

    let next = Manager::start(&config, Arc::new(StatsHub::new()), Arc::clone(&shutdown)).unwrap();
    assert_eq!(
        old.registries()[0].app_signature(),
        next.registries()[0].app_signature()
    );

    shutdown.store(true, Ordering::Release);
    old.finish();
    next.finish();
}
