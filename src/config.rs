//! Configuration: nested-block conf file, typed config tree, CLI arguments.
//!
//! The conf file is a nested-block text format: `name { ... }` opens a
//! scope, `key value ...;` is a statement, `#` starts a line comment.
//!
//! ```text
//! srt {
//!     worker_threads 4;
//!     server {
//!         listen 4001;
//!         domain_publisher publish.example;
//!         domain_player play.example;
//!         app {
//!             app_publisher live;
//!             app_player live;
//!             allow_publish accept 0;
//!             relay {
//!                 type pull;
//!                 mode loop;
//!                 upstreams 10.0.0.5:4001?streamid=origin/live/{stream_name};
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! Parsing is two-phase: a generic block tree, then typed extraction with
//! validation. All failures are `ConfigInvalid`; at boot they are fatal, on
//! reload the previous configuration stays in force.

use std::fmt;
use std::net::IpAddr;
use std::path::{ Path, PathBuf };

use clap::Parser;

use crate::constants::{
    DEFAULT_BACKLOG,
    DEFAULT_CONF_PATH,
    DEFAULT_LATENCY_MS,
    DEFAULT_PID_PATH,
    DEFAULT_STAT_POST_INTERVAL_SECS,
    DEFAULT_WORKER_CONNECTIONS,
};
use crate::error::{ RelayError, Result };

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "srt-relay-server", about = "SRT live relay server")]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short = 'c', long = "conf", default_value = DEFAULT_CONF_PATH)]
    pub conf: PathBuf,

    /// Send a command to the running instance (supported: reload).
    #[arg(short = 's', long = "signal")]
    pub command: Option<String>,

    /// Override the configured log level.
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

/// ACL decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Accept,
    Deny,
}

/// One ordered ACL entry; `ip == None` is the `0` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub action: AclAction,
    pub ip: Option<IpAddr>,
}

impl AclEntry {
    pub fn matches(&self, peer: IpAddr) -> bool {
        match self.ip {
            None => true,
            Some(ip) => ip == peer,
        }
    }
}

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Pull,
    Push,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayKind::Pull => write!(f, "pull"),
            RelayKind::Push => write!(f, "push"),
        }
    }
}

/// Upstream selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Loop,
    All,
    Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub kind: RelayKind,
    pub mode: RelayMode,
    pub reconnect_interval_secs: u64,
    pub idle_streams_timeout_secs: Option<u64>,
    pub upstreams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_publisher: String,
    pub app_player: String,
    pub allow_publish: Vec<AclEntry>,
    pub allow_play: Vec<AclEntry>,
    pub relays: Vec<RelayConfig>,
}

impl AppConfig {
    pub fn pull_relay(&self) -> Option<&RelayConfig> {
        self.relays.iter().find(|r| r.kind == RelayKind::Pull)
    }

    pub fn push_relay(&self) -> Option<&RelayConfig> {
        self.relays.iter().find(|r| r.kind == RelayKind::Push)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: u16,
    pub backlog: u32,
    pub latency_ms: u32,
    /// `None` means streams never idle out.
    pub idle_streams_timeout_secs: Option<u64>,
    pub on_event_url: Option<String>,
    pub domain_players: Vec<String>,
    pub domain_publisher: String,
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of worker threads; 0 selects single-worker inline mode.
    pub worker_threads: usize,
    pub worker_connections: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub stat_post_url: Option<String>,
    pub stat_post_interval_secs: u64,
    pub cors_header: Option<String>,
    pub http_port: Option<u16>,
    /// Parsed for compatibility; HLS recording is not implemented.
    pub record_hls_path_prefix: Option<String>,
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("cannot read conf file {}: {e}", path.display()))
        })?;
        Config::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Config> {
        let blocks = parse_blocks(text)?;
        let srt = blocks
            .iter()
            .find(|b| b.name == "srt")
            .ok_or_else(|| RelayError::config("missing top-level srt block"))?;
        Config::from_block(srt)
    }

    fn from_block(block: &RawBlock) -> Result<Config> {
        let mut config = Config {
            worker_threads: 1,
            worker_connections: DEFAULT_WORKER_CONNECTIONS,
            log_level: "info".to_string(),
            log_file: None,
            pid_file: PathBuf::from(DEFAULT_PID_PATH),
            stat_post_url: None,
            stat_post_interval_secs: DEFAULT_STAT_POST_INTERVAL_SECS,
            cors_header: None,
            http_port: None,
            record_hls_path_prefix: None,
            servers: Vec::new(),
        };

        for (key, args) in &block.statements {
            match key.as_str() {
                "worker_threads" => {
                    config.worker_threads = parse_number(key, args)?;
                }
                "worker_connections" => {
                    config.worker_connections = parse_number(key, args)?;
                }
                "log_level" => {
                    config.log_level = single_arg(key, args)?.to_string();
                }
                "log_file" => {
                    config.log_file = Some(PathBuf::from(single_arg(key, args)?));
                }
                "pid_file" => {
                    config.pid_file = PathBuf::from(single_arg(key, args)?);
                }
                "stat_post_url" => {
                    config.stat_post_url = Some(single_arg(key, args)?.to_string());
                }
                "stat_post_interval" => {
                    config.stat_post_interval_secs = parse_number(key, args)?;
                }
                "cors_header" => {
                    config.cors_header = Some(single_arg(key, args)?.to_string());
                }
                "http_port" => {
                    config.http_port = Some(parse_number(key, args)?);
                }
                "record_hls_path_prefix" => {
                    config.record_hls_path_prefix = Some(single_arg(key, args)?.to_string());
                }
                other => {
                    return Err(RelayError::config(format!("unknown srt key '{other}'")));
                }
            }
        }

        for child in &block.children {
            if child.name != "server" {
                return Err(
                    RelayError::config(format!("unexpected block '{}' inside srt", child.name))
                );
            }
            config.servers.push(ServerConfig::from_block(child)?);
        }
        if config.servers.is_empty() {
            return Err(RelayError::config("at least one server block is required"));
        }
        if config.worker_connections == 0 {
            return Err(RelayError::config("worker_connections must be positive"));
        }
        Ok(config)
    }
}

impl ServerConfig {
    fn from_block(block: &RawBlock) -> Result<ServerConfig> {
        let mut listen: Option<u16> = None;
        let mut server = ServerConfig {
            listen: 0,
            backlog: DEFAULT_BACKLOG,
            latency_ms: DEFAULT_LATENCY_MS,
            idle_streams_timeout_secs: None,
            on_event_url: None,
            domain_players: Vec::new(),
            domain_publisher: String::new(),
            apps: Vec::new(),
        };

        for (key, args) in &block.statements {
            match key.as_str() {
                "listen" => {
                    listen = Some(parse_number(key, args)?);
                }
                "backlog" => {
                    server.backlog = parse_number(key, args)?;
                }
                "latency" => {
                    server.latency_ms = parse_number(key, args)?;
                }
                "idle_streams_timeout" => {
                    server.idle_streams_timeout_secs = parse_timeout(key, args)?;
                }
                "on_event_url" => {
                    server.on_event_url = Some(single_arg(key, args)?.to_string());
                }
                "domain_player" => {
                    server.domain_players = args.clone();
                }
                "domain_publisher" => {
                    server.domain_publisher = single_arg(key, args)?.to_string();
                }
                other => {
                    return Err(RelayError::config(format!("unknown server key '{other}'")));
                }
            }
        }

        for child in &block.children {
            if child.name != "app" {
                return Err(
                    RelayError::config(format!("unexpected block '{}' inside server", child.name))
                );
            }
            server.apps.push(AppConfig::from_block(child)?);
        }

        server.listen = listen.ok_or_else(|| RelayError::config("server block missing listen"))?;
        if server.domain_publisher.is_empty() {
            return Err(RelayError::config("server block missing domain_publisher"));
        }
        if server.domain_players.is_empty() {
            return Err(RelayError::config("server block missing domain_player"));
        }
        if server.apps.is_empty() {
            return Err(RelayError::config("server block has no app blocks"));
        }

        // A player-facing host/app must never collide with the uplive key.
        for app in &server.apps {
            let uplive = format!("{}/{}", server.domain_publisher, app.app_publisher);
            for player_domain in &server.domain_players {
                let live = format!("{}/{}", player_domain, app.app_player);
                if live == uplive {
                    return Err(
                        RelayError::config(
                            format!("player endpoint '{live}' collides with publisher endpoint")
                        )
                    );
                }
            }
        }
        Ok(server)
    }
}

impl AppConfig {
    fn from_block(block: &RawBlock) -> Result<AppConfig> {
        let mut app = AppConfig {
            app_publisher: String::new(),
            app_player: String::new(),
            allow_publish: Vec::new(),
            allow_play: Vec::new(),
            relays: Vec::new(),
        };

        for (key, args) in &block.statements {
            match key.as_str() {
                "app_publisher" => {
                    app.app_publisher = single_arg(key, args)?.to_string();
                }
                "app_player" => {
                    app.app_player = single_arg(key, args)?.to_string();
                }
                "allow_publish" => app.allow_publish.push(parse_acl_entry(key, args)?),
                "allow_play" => app.allow_play.push(parse_acl_entry(key, args)?),
                other => {
                    return Err(RelayError::config(format!("unknown app key '{other}'")));
                }
            }
        }

        for child in &block.children {
            if child.name != "relay" {
                return Err(
                    RelayError::config(format!("unexpected block '{}' inside app", child.name))
                );
            }
            app.relays.push(RelayConfig::from_block(child)?);
        }

        if app.app_publisher.is_empty() {
            return Err(RelayError::config("app block missing app_publisher"));
        }
        if app.app_player.is_empty() {
            return Err(RelayError::config("app block missing app_player"));
        }
        Ok(app)
    }
}

impl RelayConfig {
    fn from_block(block: &RawBlock) -> Result<RelayConfig> {
        let mut kind: Option<RelayKind> = None;
        let mut mode: Option<RelayMode> = None;
        let mut relay = RelayConfig {
            kind: RelayKind::Pull,
            mode: RelayMode::Loop,
            reconnect_interval_secs: 10,
            idle_streams_timeout_secs: None,
            upstreams: Vec::new(),
        };

        for (key, args) in &block.statements {
            match key.as_str() {
                "type" => {
                    kind = Some(match single_arg(key, args)? {
                        "pull" => RelayKind::Pull,
                        "push" => RelayKind::Push,
                        other => {
                            return Err(RelayError::config(format!("unknown relay type '{other}'")));
                        }
                    });
                }
                "mode" => {
                    mode = Some(match single_arg(key, args)? {
                        "loop" => RelayMode::Loop,
                        "all" => RelayMode::All,
                        "hash" => RelayMode::Hash,
                        other => {
                            return Err(RelayError::config(format!("unknown relay mode '{other}'")));
                        }
                    });
                }
                "reconnect_interval" => {
                    relay.reconnect_interval_secs = parse_number(key, args)?;
                }
                "idle_streams_timeout" => {
                    relay.idle_streams_timeout_secs = parse_timeout(key, args)?;
                }
                "upstreams" => {
                    relay.upstreams = args.clone();
                }
                other => {
                    return Err(RelayError::config(format!("unknown relay key '{other}'")));
                }
            }
        }

        relay.kind = kind.ok_or_else(|| RelayError::config("relay block missing type"))?;
        relay.mode = mode.ok_or_else(|| RelayError::config("relay block missing mode"))?;
        if relay.upstreams.is_empty() {
            return Err(RelayError::config("relay block missing upstreams"));
        }
        match (relay.kind, relay.mode) {
            (RelayKind::Pull, RelayMode::All) => {
                return Err(RelayError::config("relay mode 'all' is only valid for push"));
            }
            (RelayKind::Push, RelayMode::Loop) => {
                return Err(RelayError::config("relay mode 'loop' is only valid for pull"));
            }
            _ => {}
        }
        Ok(relay)
    }
}

fn single_arg<'a>(key: &str, args: &'a [String]) -> Result<&'a str> {
    match args {
        [one] => Ok(one.as_str()),
        _ => Err(RelayError::config(format!("'{key}' expects exactly one value"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, args: &[String]) -> Result<T> {
    single_arg(key, args)?
        .parse()
        .map_err(|_| RelayError::config(format!("'{key}' expects a number, got '{}'", args[0])))
}

/// `0` disables the timeout, matching the conf convention for "unlimited".
fn parse_timeout(key: &str, args: &[String]) -> Result<Option<u64>> {
    let secs: u64 = parse_number(key, args)?;
    Ok(if secs == 0 { None } else { Some(secs) })
}

fn parse_acl_entry(key: &str, args: &[String]) -> Result<AclEntry> {
    let [action, ip] = args else {
        return Err(RelayError::config(format!("'{key}' expects '<accept|deny> <ip|0>'")));
    };
    let action = match action.as_str() {
        "accept" | "allow" => AclAction::Accept,
        "deny" => AclAction::Deny,
        other => {
            return Err(RelayError::config(format!("unknown ACL action '{other}'")));
        }
    };
    let ip = if ip.as_str() == "0" {
        None
    } else {
        Some(
            ip
                .parse::<IpAddr>()
                .map_err(|_| RelayError::config(format!("invalid ACL ip '{ip}'")))?
        )
    };
    Ok(AclEntry { action, ip })
}

// ---------------------------------------------------------------------------
// Generic block tree
// ---------------------------------------------------------------------------

struct RawBlock {
    name: String,
    statements: Vec<(String, Vec<String>)>,
    children: Vec<RawBlock>,
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semi,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut word = String::new();
        for ch in line.chars() {
            match ch {
                // Braces are structural only at a word boundary; inside a
                // word they are literal (template tokens in upstream URLs).
                '{' | '}' if word.is_empty() => {
                    tokens.push(if ch == '{' { Token::Open } else { Token::Close });
                }
                ';' => {
                    if !word.is_empty() {
                        tokens.push(Token::Word(std::mem::take(&mut word)));
                    }
                    tokens.push(Token::Semi);
                }
                c if c.is_whitespace() => {
                    if !word.is_empty() {
                        tokens.push(Token::Word(std::mem::take(&mut word)));
                    }
                }
                c => word.push(c),
            }
        }
        if !word.is_empty() {
            tokens.push(Token::Word(word));
        }
    }
    tokens
}

fn parse_blocks(text: &str) -> Result<Vec<RawBlock>> {
    let tokens = tokenize(text);
    let mut pos = 0;
    let mut blocks = Vec::new();
    while pos < tokens.len() {
        let (block, next) = parse_block(&tokens, pos)?;
        blocks.push(block);
        pos = next;
    }
    Ok(blocks)
}

fn parse_block(tokens: &[Token], mut pos: usize) -> Result<(RawBlock, usize)> {
    let Some(Token::Word(name)) = tokens.get(pos) else {
        return Err(RelayError::config("expected block name"));
    };
    pos += 1;
    if tokens.get(pos) != Some(&Token::Open) {
        return Err(RelayError::config(format!("expected '{{' after '{name}'")));
    }
    pos += 1;

    let mut block = RawBlock {
        name: name.clone(),
        statements: Vec::new(),
        children: Vec::new(),
    };

    loop {
        match tokens.get(pos) {
            Some(Token::Close) => {
                return Ok((block, pos + 1));
            }
            Some(Token::Word(first)) => {
                // Look ahead: `word {` opens a child, otherwise a statement.
                if tokens.get(pos + 1) == Some(&Token::Open) {
                    let (child, next) = parse_block(tokens, pos)?;
                    block.children.push(child);
                    pos = next;
                } else {
                    let key = first.clone();
                    pos += 1;
                    let mut args = Vec::new();
                    loop {
                        match tokens.get(pos) {
                            Some(Token::Word(w)) => {
                                args.push(w.clone());
                                pos += 1;
                            }
                            Some(Token::Semi) => {
                                pos += 1;
                                break;
                            }
                            _ => {
                                return Err(
                                    RelayError::config(format!("statement '{key}' missing ';'"))
                                );
                            }
                        }
                    }
                    block.statements.push((key, args));
                }
            }
            _ => {
                return Err(RelayError::config(format!("unterminated block '{}'", block.name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONF: &str = r#"
# relay server configuration
srt {
    worker_threads 2;
    worker_connections 300;
    log_level info;
    http_port 8181;
    stat_post_interval 5;

    server {
        listen 4001;
        backlog 100;
        latency 20;
        idle_streams_timeout 10;
        domain_player play.example play2.example;
        domain_publisher publish.example;

        app {
            app_publisher live;
            app_player live;
            allow_publish deny 10.0.0.1;
            allow_publish accept 0;
            allow_play accept 0;

            relay {
                type pull;
                mode loop;
                reconnect_interval 1;
                upstreams 10.0.0.5:4001?streamid=origin/live/{stream_name} 10.0.0.6:4001?streamid=origin/live/{stream_name};
            }
        }
    }
}
"#;

    #[test]
    fn parses_full_configuration() {
        let config = Config::parse_str(FULL_CONF).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.worker_connections, 300);
        assert_eq!(config.http_port, Some(8181));
        assert_eq!(config.servers.len(), 1);

        let server = &config.servers[0];
        assert_eq!(server.listen, 4001);
        assert_eq!(server.latency_ms, 20);
        assert_eq!(server.idle_streams_timeout_secs, Some(10));
        assert_eq!(server.domain_players, vec!["play.example", "play2.example"]);

        let app = &server.apps[0];
        assert_eq!(app.app_publisher, "live");
        assert_eq!(app.allow_publish.len(), 2);
        assert_eq!(app.allow_publish[0].action, AclAction::Deny);
        assert_eq!(app.allow_publish[0].ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(app.allow_publish[1].ip, None);

        let relay = app.pull_relay().unwrap();
        assert_eq!(relay.mode, RelayMode::Loop);
        assert_eq!(relay.reconnect_interval_secs, 1);
        assert_eq!(relay.upstreams.len(), 2);
    }

    #[test]
    fn acl_order_is_preserved() {
        let config = Config::parse_str(FULL_CONF).unwrap();
        let acl = &config.servers[0].apps[0].allow_publish;
        // First match wins, so deny must come before the wildcard accept.
        assert_eq!(acl[0].action, AclAction::Deny);
        assert_eq!(acl[1].action, AclAction::Accept);
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let conf = FULL_CONF.replace("idle_streams_timeout 10;", "idle_streams_timeout 0;");
        let config = Config::parse_str(&conf).unwrap();
        assert_eq!(config.servers[0].idle_streams_timeout_secs, None);
    }

    #[test]
    fn missing_listen_is_invalid() {
        let conf = FULL_CONF.replace("listen 4001;", "");
        assert!(matches!(Config::parse_str(&conf), Err(RelayError::ConfigInvalid(_))));
    }

    #[test]
    fn unknown_key_is_invalid() {
        let conf = FULL_CONF.replace("backlog 100;", "backlug 100;");
        assert!(Config::parse_str(&conf).is_err());
    }

    #[test]
    fn push_loop_combination_rejected() {
        let conf = FULL_CONF.replace("type pull;", "type push;");
        assert!(Config::parse_str(&conf).is_err());
    }

    #[test]
    fn player_publisher_collision_rejected() {
        let conf = FULL_CONF.replace(
            "domain_player play.example play2.example;",
            "domain_player publish.example;"
        );
        assert!(Config::parse_str(&conf).is_err());
    }

    #[test]
    fn comments_and_whitespace_ignored() {
        let conf = FULL_CONF.replace("worker_threads 2;", "worker_threads 2; # inline comment");
        assert!(Config::parse_str(&conf).is_ok());
    }
}
