use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use prattle_core::xml::Nad;
use prattle_s2s::gateway::GatewayHandle;
use prattle_s2s::peer::{self, PeerConfig, PeerTls};
use prattle_s2s::settings::Settings;
use prattle_sx::connection::{load_client_config, load_server_config};
use prattle_sx::uplink::{Uplink, UplinkConfig};

#[derive(Parser)]
#[command(name = "prattle-s2s", about = "server-to-server gateway")]
struct Cli {
    /// Configuration file (without extension, config crate conventions)
    #[arg(short = 'c', long = "config", default_value = "config/s2s")]
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
        error!(%error, "s2s gateway failed");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Error> {
    if let Some(pidfile) = &settings.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    let server_tls = match &settings.local.pemfile {
        Some(pemfile) => match load_server_config(pemfile) {
            Ok(config) => Some(config),
            Err(error) => {
                warn!(%error, "could not load TLS material, STARTTLS disabled");
                None
            }
        },
        None => None,
    };
    let client_tls = match load_client_config() {
        Ok(config) => Some(config),
        Err(error) => {
            warn!(%error, "no trust roots for outgoing TLS, connecting plaintext");
            None
        }
    };
    let tls = PeerTls {
        server: server_tls,
        client: client_tls,
    };

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Nad>(64);
    let uplink_config = UplinkConfig {
        ip: settings.router.ip.clone(),
        port: settings.router.port,
        user: settings.router.user.clone(),
        pass: settings.router.pass.clone(),
        name: settings.id.clone(),
        use_tls: settings.router.use_tls,
        retry_init: settings.router.retry.init,
        retry_lost: settings.router.retry.lost,
        retry_sleep: settings.router.retry.sleep,
    };
    let (uplink, mut uplink_task) = Uplink::spawn(uplink_config, inbound_tx);

    let (router_tx, mut router_rx) = mpsc::channel::<Nad>(64);
    let settings = Arc::new(settings);
    let gateway = GatewayHandle::spawn(settings.clone(), tls.clone(), router_tx);

    // router-bound traffic from the gateway goes up the component stream
    let uplink_out = uplink.clone();
    let to_router = tokio::spawn(async move {
        while let Some(nad) = router_rx.recv().await {
            if uplink_out.send(nad).await.is_err() {
                break;
            }
        }
    });

    // traffic from the router feeds the gateway
    let gateway_in = gateway.clone();
    let from_router = tokio::spawn(async move {
        while let Some(nad) = inbound_rx.recv().await {
            gateway_in.packet(nad).await;
        }
    });

    let listener =
        TcpListener::bind((settings.local.ip.as_str(), settings.local.port)).await?;
    info!(ip = %settings.local.ip, port = settings.local.port, id = %settings.id, "listening for peers");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                let conn = gateway.next_conn_id();
                info!(conn, %addr, "peer connected");
                let (commands_tx, commands_rx) = mpsc::channel(64);
                gateway
                    .accepted(conn, commands_tx, format!("{}/{}", addr.ip(), addr.port()))
                    .await;
                let config = PeerConfig {
                    tls: tls.clone(),
                    require_tls: settings.security.require_tls,
                    max_stanza_size: settings.io.max_stanza_size,
                };
                tokio::spawn(peer::serve_incoming(
                    conn,
                    socket,
                    config,
                    gateway.peer_sender(),
                    commands_rx,
                ));
            }
            result = &mut uplink_task => {
                match result {
                    Ok(Ok(())) => info!("uplink closed"),
                    Ok(Err(error)) => return Err(error),
                    Err(join_error) => return Err(anyhow!(join_error)),
                }
                break;
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("shutting down, closing peer connections");
    gateway.shutdown().await;
    from_router.abort();
    to_router.abort();
    drop(uplink);
    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(pidfile) = &settings.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("s2s gateway stopped");
    Ok(())
}
