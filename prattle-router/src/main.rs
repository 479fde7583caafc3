use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use prattle_router::component::ComponentSession;
use prattle_router::settings::Settings;
use prattle_router::table::TableHandle;
use prattle_sx::connection::{load_server_config, TcpConnection, TlsMode};

#[derive(Parser)]
#[command(name = "prattle-router", about = "stanza router")]
struct Cli {
    /// Configuration file (without extension, config crate conventions)
    #[arg(short = 'c', long = "config", default_value = "config/router")]
    config: String,
    /// Log at debug level
    #[arg(short = 'D', long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(error) => {
            error!(%error, "could not load configuration");
            std::process::exit(2);
        }
    };

    if let Err(error) = run(settings).await {
        error!(%error, "router failed");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Error> {
    if let Some(pidfile) = &settings.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    let tls = match &settings.local.pemfile {
        Some(pemfile) => match load_server_config(pemfile) {
            Ok(config) => TlsMode::Server(config),
            Err(error) => {
                warn!(%error, "could not load TLS material, STARTTLS disabled");
                TlsMode::Disabled
            }
        },
        None => TlsMode::Disabled,
    };

    let listener =
        TcpListener::bind((settings.local.ip.as_str(), settings.local.port)).await?;
    info!(ip = %settings.local.ip, port = settings.local.port, id = %settings.id, "router listening");

    let settings = Arc::new(settings);
    let table = TableHandle::spawn(&settings);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut sessions = JoinSet::new();
    let mut conn_seq: u64 = 0;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                conn_seq += 1;
                info!(conn = conn_seq, %addr, "component connected");
                let connection = TcpConnection::new(socket, tls.clone());
                sessions.spawn(ComponentSession::serve(
                    conn_seq,
                    connection,
                    settings.clone(),
                    table.clone(),
                    shutdown_tx.subscribe(),
                ));
            }
            _ = sighup.recv() => {
                info!("rotating message log");
                table.rotate_log().await;
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("shutting down, closing component streams");
    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("components did not close voluntarily, forcing");
        sessions.shutdown().await;
    }

    if let Some(pidfile) = &settings.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("router stopped");
    Ok(())
}
