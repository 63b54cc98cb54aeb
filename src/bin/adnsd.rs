//! `adnsd`: the authoritative name server, spec.md §6.
//!
//! Grounded in the teacher's `main.rs` event loop (one `DgramServer` task
//! per core sharing a socket, one `StreamServer`, a periodic metrics
//! report, a zone-list watcher task) extended with process supervision
//! (pid file, SIGTERM/SIGINT, exit codes) and the transfer coordinator.

use core::time::Duration;

use std::process::exit;
use std::sync::Arc;

use adnsd::config::{Cli, Config};
use adnsd::service::middleware::{MetricsMiddlewareSvc, Stats, TsigMiddlewareSvc};
use adnsd::service::Watcher;
use adnsd::{logger, service};
use clap::Parser;
use domain::net::server::buf::VecBufSource;
use domain::net::server::dgram::DgramServer;
use domain::net::server::middleware::edns::EdnsMiddlewareSvc;
use domain::net::server::middleware::mandatory::MandatoryMiddlewareSvc;
use domain::net::server::stream::StreamServer;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            exit(2);
        }
    };

    logger::Logger::new()
        .with_level(config.log.level)
        .with_stderr(config.foreground)
        .init()
        .expect("failed to initialise logger");

    if let Err(e) = write_pid_file(&config) {
        log::error!(target: "startup", "failed to write pid file: {e}");
        exit(1);
    }

    let config = Arc::new(config);
    let dnsr = service::Dnsr::from(config.clone());
    load_database_image(&config, &dnsr);
    let stats = Stats::new_shared();

    let dnsr = Arc::new(dnsr);
    let dnsr_svc = EdnsMiddlewareSvc::new(dnsr.clone());
    let dnsr_svc = MandatoryMiddlewareSvc::new(dnsr_svc);
    let dnsr_svc = TsigMiddlewareSvc::new(dnsr.clone(), dnsr_svc);
    let dnsr_svc = MetricsMiddlewareSvc::new(dnsr_svc, stats.clone());

    let listen_addrs: Vec<_> = if config.address.is_empty() {
        vec!["0.0.0.0".parse().unwrap()]
    } else {
        config.address.clone()
    };

    for ip in &listen_addrs {
        let addr = std::net::SocketAddr::new(*ip, config.port);

        let sock = match UdpSocket::bind(addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                log::error!(target: "startup", "failed to bind udp {addr}: {e}");
                exit(1);
            }
        };
        let worker_count = config
            .server_count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        for _ in 0..worker_count {
            let udp_srv = DgramServer::new(sock.clone(), VecBufSource, dnsr_svc.clone());
            tokio::spawn(async move { udp_srv.run().await });
        }

        let tcp_listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                log::error!(target: "startup", "failed to bind tcp {addr}: {e}");
                exit(1);
            }
        };
        let tcp_srv = StreamServer::new(tcp_listener, VecBufSource, dnsr_svc.clone());
        tokio::spawn(async move { tcp_srv.run().await });
    }

    {
        let coordinator = dnsr.coordinator.clone();
        tokio::spawn(async move { coordinator.run().await });
    }

    {
        let dnsr = dnsr.clone();
        tokio::spawn(async move {
            if let Err(e) = dnsr.watch_lock() {
                log::error!(target: "watcher", "zone list watcher stopped: {e}");
                exit(1);
            }
        });
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            log::info!(target: "metrics", "metrics report: {}", stats.read().unwrap());
        }
    });

    wait_for_shutdown().await;
    let _ = std::fs::remove_file(&config.pid_file);
    log::info!(target: "shutdown", "shutting down cleanly");
    exit(0);
}

async fn wait_for_shutdown() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => log::info!(target: "shutdown", "received SIGTERM"),
        _ = sigint.recv() => log::info!(target: "shutdown", "received SIGINT"),
    }
}

/// Loads the compiled database image named by `-f`/`Config::database`, if
/// one exists, replays any per-zone journal left by a reload since the
/// last full write, and installs every zone it names into the serving
/// tree. A missing or unreadable image just means a fresh deployment with
/// no image yet; the zone-list watcher's first pass fills `dnsr` in
/// either case, so this is best-effort rather than fatal.
fn load_database_image(config: &Config, dnsr: &service::Dnsr) {
    let mut db = match adnsd::persist::read_database(&config.database) {
        Ok(db) => db,
        Err(e) => {
            log::info!(target: "startup", "no usable database image at '{}': {e}", config.database.display());
            return;
        }
    };

    for (zone_number, apex) in db.zone_names().to_vec().into_iter().enumerate() {
        let journal_path = adnsd::persist::journal_path_for(&config.database, &apex);
        if let Err(e) = adnsd::persist::apply_journal(&mut db, zone_number as u32, &journal_path) {
            log::warn!(target: "startup", "failed to replay journal for zone '{apex}': {e}");
        }
    }

    for zone_number in 0..db.zone_names().len() as u32 {
        match adnsd::compiler::to_zone(&db, zone_number) {
            Ok(zone) => {
                if let Err(e) = dnsr.zones.insert_zone(zone) {
                    log::warn!(target: "startup", "failed to install zone from database image: {e}");
                }
            }
            Err(e) => log::warn!(target: "startup", "failed to build zone tree from database image: {e}"),
        }
    }

    log::info!(target: "startup", "loaded database image '{}' with {} zones", config.database.display(), db.zone_names().len());
    *dnsr.database.write().unwrap() = db;
}

fn write_pid_file(config: &Config) -> std::io::Result<()> {
    let pid = std::process::id();
    let tmp = config.pid_file.with_extension("tmp");
    std::fs::write(&tmp, format!("{pid}\n"))?;
    std::fs::rename(&tmp, &config.pid_file)
}
