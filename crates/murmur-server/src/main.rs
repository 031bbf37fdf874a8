mod auth_client;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use murmur_core::{ChatServer, ServerConfig, auth::CredentialService};
use murmur_logwire::DatagramLayer;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth_client::{OpenAuth, RemoteAuth};

/// Group chat relay server.
#[derive(Parser, Debug)]
#[command(name = "chatserver", version, about)]
struct Cli {
    /// TCP port to listen on.
    #[arg(default_value_t = 1234)]
    port: u16,

    /// Worker threads; 0 picks twice the hardware parallelism (at least 4).
    #[arg(default_value_t = 0)]
    threads: usize,

    /// Credential service address. Every LOGIN/REGISTER is accepted when
    /// absent.
    #[arg(long)]
    auth: Option<SocketAddr>,

    /// Unix datagram socket of the logger daemon; records are additionally
    /// shipped there, one datagram each.
    #[arg(long)]
    log_sock: Option<PathBuf>,

    /// Largest accepted frame body in bytes.
    #[arg(long, default_value_t = murmur_proto::DEFAULT_MAX_BODY_LEN)]
    max_frame: usize,

    /// Disconnect a client whose outbound queue exceeds this many bytes;
    /// unbounded when absent.
    #[arg(long)]
    max_queue: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_sock.as_deref());

    // Writes use MSG_NOSIGNAL, but belt and braces: a dying peer must never
    // signal us.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, shutdown.clone()) {
            error!(?err, signal, "couldn't install signal handler");
            return ExitCode::FAILURE;
        }
    }

    let auth: Arc<dyn CredentialService> = match cli.auth {
        Some(addr) => {
            info!(%addr, "using remote credential service");
            Arc::new(RemoteAuth::new(addr))
        }
        None => {
            warn!("no credential service configured, accepting all logins");
            Arc::new(OpenAuth)
        }
    };

    let cfg = ServerConfig {
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cli.port),
        workers: effective_workers(cli.threads),
        max_body_len: cli.max_frame,
        max_queue_bytes: cli.max_queue,
    };

    let mut server = match ChatServer::bind(cfg, auth) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = server.start() {
        error!(%err, "startup failed");
        return ExitCode::FAILURE;
    }
    info!(port = cli.port, "chatserver running, ctrl-c to stop");

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("shutdown signal received");
    server.stop();
    ExitCode::SUCCESS
}

/// CLI default: 2x hardware parallelism, never below 4.
fn effective_workers(threads: usize) -> usize {
    if threads != 0 {
        return threads;
    }
    thread::available_parallelism().map_or(4, |n| (n.get() * 2).max(4))
}

fn init_tracing(log_sock: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    let shipping = log_sock.and_then(|path| match DatagramLayer::new(path) {
        Ok(layer) => Some(layer),
        Err(err) => {
            eprintln!("couldn't set up log shipping to {}: {err}", path.display());
            None
        }
    });

    tracing_subscriber::registry().with(filter).with(fmt).with(shipping).init();
}
