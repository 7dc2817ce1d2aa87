//! Relay server binary: boot, signal handling, reload generations.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

use anyhow::{ bail, Context };
use clap::Parser;
use tracing::{ error, info };

use srt_relay::config::{ CliArgs, Config };
use srt_relay::constants::DEFAULT_PID_PATH;
use srt_relay::http::{ spawn_stat_poster, StatsServer };
use srt_relay::logging;
use srt_relay::manager::Manager;
use srt_relay::pidfile::{ self, PidFile };
use srt_relay::stats::StatsHub;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // `-s reload` signals the running instance and exits.
    if let Some(command) = &args.command {
        if command != "reload" {
            bail!("unknown command '{command}', supported: reload");
        }
        let pid_path = Config::load(&args.conf)
            .map(|c| c.pid_file)
            .unwrap_or_else(|_| DEFAULT_PID_PATH.into());
        pidfile::send_reload(&pid_path).context("reload command failed")?;
        return Ok(());
    }

    let config = Config::load(&args.conf).context("startup configuration")?;
    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    logging::init(&level, config.log_file.as_deref())?;
    info!(version = srt_relay::VERSION, conf = %args.conf.display(), "srt-relay starting");
    if config.record_hls_path_prefix.is_some() {
        tracing::warn!("record_hls_path_prefix is configured but HLS recording is not supported");
    }

    let _pid_file = PidFile::create(&config.pid_file)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_requested = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload_requested))?;

    let stats = Arc::new(StatsHub::new());
    let stats_server = match config.http_port {
        Some(port) =>
            Some(
                StatsServer::spawn(
                    port,
                    config.cors_header.clone(),
                    Arc::clone(&stats),
                    Arc::clone(&shutdown)
                )?
            ),
        None => None,
    };
    let poster = config.stat_post_url.clone().map(|url| {
        spawn_stat_poster(
            url,
            config.stat_post_interval_secs,
            Arc::clone(&stats),
            Arc::clone(&shutdown)
        )
    });

    let mut current = Manager::start(&config, Arc::clone(&stats), Arc::clone(&shutdown))?;
    info!(ports = ?current.ports(), "serving");
    let mut draining: Vec<Manager> = Vec::new();

    while !shutdown.load(Ordering::Acquire) {
        if reload_requested.swap(false, Ordering::AcqRel) {
            match Config::load(&args.conf) {
                Ok(new_config) => {
                    info!("reloading configuration");
                    // Old listeners must release their ports before the new
                    // generation binds them.
                    current.begin_drain();
                    match Manager::start(&new_config, Arc::clone(&stats), Arc::clone(&shutdown)) {
                        Ok(next) => {
                            draining.push(std::mem::replace(&mut current, next));
                            info!(ports = ?current.ports(), "reload complete");
                        }
                        Err(e) => {
                            error!(error = %e, "new generation failed to start; draining old one");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "reload failed, keeping current configuration");
                }
            }
        }

        // Retire drained generations; inline workers need their tick.
        draining = draining
            .into_iter()
            .filter_map(|mut manager| {
                manager.tick_inline();
                if manager.drained() {
                    manager.finish();
                    info!("old generation retired");
                    None
                } else {
                    Some(manager)
                }
            })
            .collect();

        // In single-worker mode this drives the worker; with threaded
        // workers it is a no-op and the loop just paces on the sleep.
        if current.tick_inline() == 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    info!("shutting down");
    for manager in draining {
        manager.finish();
    }
    current.finish();
    if let Some(server) = stats_server {
        server.join();
    }
    if let Some(poster) = poster {
        let _ = poster.join();
    }
    info!("bye");
    Ok(())
}
