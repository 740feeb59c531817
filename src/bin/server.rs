use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::net::TcpSocket;
use tokio::signal::unix::{signal, SignalKind};

use c45_blackjack::config::{apply_override, load_config};
use c45_blackjack::logger::Logger;
use c45_blackjack::session;
use c45_blackjack::App;

// ── CLI (§6, §10.3) ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "server",
    version,
    about = "C45 dedicated Blackjack lobby server",
    long_about = "Accepts client connections, assigns them to lobbies, and runs \
                  two-player Blackjack matches over the line-framed C45 protocol."
)]
struct Args {
    /// Path to the config file (KEY value per line; missing file is not an error)
    #[arg(short = 'c', long, default_value = "config.txt")]
    config: PathBuf,

    /// Override bind IP; must be given together with --port
    #[arg(short = 'i', long)]
    ip: Option<String>,

    /// Override bind port; must be given together with --ip
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

// ── DISPLAY EVENTS ────────────────────────────────────────────────────────────

enum Event<'a> {
    Listening { addr: SocketAddr, lobby_count: usize },
    Accepted { addr: SocketAddr },
    AcceptError { reason: String },
    NetworkLost { ip: Ipv4Addr },
    ShuttingDown { reason: &'a str },
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Listening { addr, lobby_count } => {
                write!(f, "listening on {addr} with {lobby_count} lobbies")
            }
            Event::Accepted { addr } => write!(f, "accepted connection from {addr}"),
            Event::AcceptError { reason } => write!(f, "accept error: {reason}"),
            Event::NetworkLost { ip } => write!(f, "bind address {ip} is no longer assigned to a local interface"),
            Event::ShuttingDown { reason } => write!(f, "shutting down: {reason}"),
        }
    }
}

/// `true` if `ip` is still assigned to a local interface. `127.0.0.1` and
/// `0.0.0.0` are always considered present (§4.7: "skip for loopback").
///
/// A bind to `(ip, 0)` on an ephemeral UDP socket succeeds only if the
/// kernel still has `ip` assigned to some interface; this is the same
/// signal a dropped network interface would produce without needing a
/// netlink/ioctl interface-listing dependency.
fn bind_ip_is_live(ip: Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(ip), 0)).is_ok()
}

async fn shutdown_reason() -> &'static str {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut cfg = load_config(&args.config);
    apply_override(&mut cfg, args.ip.as_deref(), args.port.as_deref());

    let app = App::new(cfg.lobby_count, args.verbose);
    let bind_addr = SocketAddr::new(IpAddr::V4(cfg.ip), cfg.port);

    // Backlog >= 64 per §4.7; tokio::net::TcpListener::bind hardcodes its
    // own backlog, so the socket is built by hand to control it explicitly.
    let listener = (|| -> std::io::Result<tokio::net::TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        socket.listen(64)
    })()
    .unwrap_or_else(|e| {
        eprintln!("failed to bind {bind_addr}: {e}");
        std::process::exit(1);
    });

    app.log.info(Event::Listening { addr: bind_addr, lobby_count: cfg.lobby_count });

    let mut liveness_tick = tokio::time::interval(Duration::from_secs(2));
    let mut signal_fut = Box::pin(shutdown_reason());

    let reason: String = loop {
        tokio::select! {
            sig_reason = &mut signal_fut => {
                break sig_reason.to_string();
            }
            _ = liveness_tick.tick() => {
                if !bind_ip_is_live(cfg.ip) {
                    app.log.warn(Event::NetworkLost { ip: cfg.ip });
                    break "NETWORK_LOST".to_string();
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        app.log.verbose(Event::Accepted { addr });
                        let app = app.clone();
                        tokio::spawn(async move {
                            session::run_session(app, stream, addr).await;
                        });
                    }
                    Err(e) => {
                        app.log.warn(Event::AcceptError { reason: e.to_string() });
                    }
                }
            }
        }
    };

    app.log.info(Event::ShuttingDown { reason: &reason });
    app.conns.broadcast_shutdown(&reason);

    // Give in-flight sessions a moment to observe the broadcast and close
    // their sockets before the process exits.
    tokio::time::sleep(Duration::from_millis(250)).await;
}
