use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use prattle_backend::{MemoryAuthBackend, SqliteAuthBackend, StoreHandle};
use prattle_c2s::session::{ClientSession, SessionContext};
use prattle_c2s::settings::Settings;
use prattle_c2s::sm::SmHandle;
use prattle_core::acl::IpAccess;
use prattle_core::component::RouteView;
use prattle_core::rate::RateLimit;
use prattle_core::xml::Nad;
use prattle_sx::connection::{load_server_config, TcpConnection, TlsMode};
use prattle_sx::uplink::{Uplink, UplinkConfig};

#[derive(Parser)]
#[command(name = "prattle-c2s", about = "client gateway")]
struct Cli {
    /// Configuration file (without extension, config crate conventions)
    #[arg(short = 'c', long = "config", default_value = "config/c2s")]
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
        error!(%error, "c2s gateway failed");
        std::process::exit(1);
    }
}

/// Per-IP admission: the configured allow/deny table plus a connect-rate
/// bucket per remote address.
struct Admission {
    access: IpAccess,
    buckets: HashMap<IpAddr, RateLimit>,
    connects: u64,
    seconds: u64,
    throttle: u64,
}

impl Admission {
    fn new(settings: &Settings) -> Self {
        Self {
            access: IpAccess::new(
                settings.io.access.order,
                &settings.io.access.allow,
                &settings.io.access.deny,
            ),
            buckets: HashMap::new(),
            connects: settings.io.connect_limits.connects,
            seconds: settings.io.connect_limits.seconds,
            throttle: settings.io.connect_limits.throttle,
        }
    }

    fn admit(&mut self, ip: IpAddr) -> bool {
        if !self.access.permits(ip) {
            return false;
        }
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| RateLimit::new(self.connects, self.seconds, self.throttle));
        if bucket.is_throttled() {
            return false;
        }
        bucket.add(1)
    }
}

async fn run(settings: Settings) -> Result<(), Error> {
    if let Some(pidfile) = &settings.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    let store = match &settings.authreg.database_url {
        Some(url) => StoreHandle::new(SqliteAuthBackend::new(url).await?),
        None => {
            warn!("no auth database configured, using in-memory credentials");
            StoreHandle::new(MemoryAuthBackend::default())
        }
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

    let sm = SmHandle::spawn(&settings.id, uplink.clone());
    let dispatcher_sm = sm.clone();
    tokio::spawn(async move {
        while let Some(nad) = inbound_rx.recv().await {
            let Some(view) = RouteView::parse(&nad) else {
                debug!("non-route element from router, dropping");
                continue;
            };
            let Some(payload) = view.payload else { continue };
            let mut standalone = Nad::new();
            standalone.append_nad(None, &nad, payload);
            dispatcher_sm.deliver(standalone).await;
        }
    });

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

    let listener = TcpListener::bind((settings.local.ip.as_str(), settings.local.port)).await?;
    info!(ip = %settings.local.ip, port = settings.local.port, "listening for clients");
    let ssl_listener = match settings.local.ssl_port {
        Some(port) => {
            let l = TcpListener::bind((settings.local.ip.as_str(), port)).await?;
            info!(ip = %settings.local.ip, port, "listening for TLS-wrapped clients");
            Some(l)
        }
        None => None,
    };

    let settings = Arc::new(settings);
    let ctx = SessionContext {
        settings: settings.clone(),
        store,
        sm,
        uplink,
    };
    let mut admission = Admission::new(&settings);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut sessions = JoinSet::new();
    let mut conn_seq: u64 = 0;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                if !admission.admit(addr.ip()) || sessions.len() >= settings.io.max_fds {
                    debug!(%addr, "connection refused by admission policy");
                    continue;
                }
                conn_seq += 1;
                let connection = TcpConnection::new(socket, tls.clone());
                sessions.spawn(ClientSession::serve(
                    conn_seq,
                    connection,
                    ctx.clone(),
                    shutdown_tx.subscribe(),
                ));
            }
            accepted = accept_wrapped(ssl_listener.as_ref()), if ssl_listener.is_some() => {
                let (socket, addr) = accepted?;
                if !admission.admit(addr.ip()) || sessions.len() >= settings.io.max_fds {
                    debug!(%addr, "connection refused by admission policy");
                    continue;
                }
                conn_seq += 1;
                let TlsMode::Server(config) = tls.clone() else {
                    warn!("ssl port configured without TLS material");
                    continue;
                };
                let ctx = ctx.clone();
                let shutdown = shutdown_tx.subscribe();
                let conn_id = conn_seq;
                sessions.spawn(async move {
                    match TcpConnection::accept_tls(socket, config).await {
                        Ok(connection) => {
                            ClientSession::serve(conn_id, connection, ctx, shutdown).await;
                        }
                        Err(error) => debug!(conn = conn_id, %error, "TLS accept failed"),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
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

    info!("shutting down, closing client sessions");
    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("sessions did not close voluntarily, forcing");
        sessions.shutdown().await;
    }

    if let Some(pidfile) = &settings.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("c2s gateway stopped");
    Ok(())
}

async fn accept_wrapped(
    listener: Option<&TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
