use std::fmt;
use std::io::{self, Write as _};

use clap::{ArgAction, Parser};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use c45_blackjack::deck::Card;
use c45_blackjack::logger::Logger;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "client",
    version,
    about = "C45 Blackjack — terminal client",
    long_about = "Connects to a running C45 lobby server and plays interactively.\n\
                  Type your name to log in, then `join <n>` to pick a lobby.\n\
                  During a hand: `hit` / `stand`. Anytime: `back` to leave."
)]
struct Args {
    /// Server address to connect to
    #[arg(default_value = "127.0.0.1:4545")]
    addr: String,

    /// Player name to log in with; prompted interactively if omitted
    #[arg(short, long)]
    name: Option<String>,

    /// Increase output verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

// ── CLIENT EVENTS (operational logging to stderr) ─────────────────────────────

enum ClientEvent<'a> {
    Connecting { addr: &'a str },
    Connected { addr: &'a str },
    Sending { line: &'a str },
    Received { raw: &'a str },
    Disconnected,
}

impl fmt::Display for ClientEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Connecting { addr } => write!(f, "connecting to {addr}..."),
            ClientEvent::Connected { addr } => write!(f, "connected to {addr}"),
            ClientEvent::Sending { line } => write!(f, "-> {line}"),
            ClientEvent::Received { raw } => write!(f, "<- {raw}"),
            ClientEvent::Disconnected => write!(f, "connection closed by server"),
        }
    }
}

// ── SERVER MESSAGES ───────────────────────────────────────────────────────────

enum ServerMsg {
    Ok,
    Wrong(Option<String>),
    RecOk,
    Ping,
    Pong,
    Snapshot(String),
    Deal(Card, Card),
    Card(Card),
    Turn { name: String, seconds: u64 },
    Bust { name: String, value: i32 },
    Timeout,
    OppDown { name: String, seconds: u64 },
    OppBack { name: String },
    Result { name0: String, v0: i32, name1: String, v1: i32, winner: String },
    Down(String),
    Unknown(String),
}

impl ServerMsg {
    fn parse(line: &str) -> Self {
        let Some(rest) = line.strip_prefix("C45") else {
            return Self::Unknown(line.to_string());
        };
        let mut it = rest.split_whitespace();
        match it.next().unwrap_or("") {
            "OK" => Self::Ok,
            "WRONG" => Self::Wrong(it.next().map(str::to_string)),
            "REC_OK" => Self::RecOk,
            "PI" => Self::Ping,
            "PO" => Self::Pong,
            "L" => Self::Snapshot(it.collect::<Vec<_>>().join(" ")),
            "DEAL" => match (it.next().and_then(Card::from_wire), it.next().and_then(Card::from_wire)) {
                (Some(c1), Some(c2)) => Self::Deal(c1, c2),
                _ => Self::Unknown(line.to_string()),
            },
            "CARD" => match it.next().and_then(Card::from_wire) {
                Some(c) => Self::Card(c),
                None => Self::Unknown(line.to_string()),
            },
            "TURN" => match (it.next(), it.next().and_then(|s| s.parse().ok())) {
                (Some(name), Some(seconds)) => Self::Turn { name: name.to_string(), seconds },
                _ => Self::Unknown(line.to_string()),
            },
            "BUST" => match (it.next(), it.next().and_then(|s| s.parse().ok())) {
                (Some(name), Some(value)) => Self::Bust { name: name.to_string(), value },
                _ => Self::Unknown(line.to_string()),
            },
            "TIMEOUT" => Self::Timeout,
            "OPPDOWN" => match (it.next(), it.next().and_then(|s| s.parse().ok())) {
                (Some(name), Some(seconds)) => Self::OppDown { name: name.to_string(), seconds },
                _ => Self::Unknown(line.to_string()),
            },
            "OPPBACK" => match it.next() {
                Some(name) => Self::OppBack { name: name.to_string() },
                None => Self::Unknown(line.to_string()),
            },
            "RESULT" => {
                let name0 = it.next();
                let v0 = it.next().and_then(|s| s.parse().ok());
                let name1 = it.next();
                let v1 = it.next().and_then(|s| s.parse().ok());
                let winner = if it.next() == Some("WINNER") { it.next() } else { None };
                match (name0, v0, name1, v1, winner) {
                    (Some(n0), Some(v0), Some(n1), Some(v1), Some(w)) => Self::Result {
                        name0: n0.to_string(),
                        v0,
                        name1: n1.to_string(),
                        v1,
                        winner: w.to_string(),
                    },
                    _ => Self::Unknown(line.to_string()),
                }
            }
            "DOWN" => Self::Down(rest.trim_start_matches("DOWN").trim().to_string()),
            _ => Self::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for ServerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMsg::Ok => write!(f, "ok"),
            ServerMsg::Wrong(Some(reason)) => write!(f, "rejected: {reason}"),
            ServerMsg::Wrong(None) => write!(f, "rejected"),
            ServerMsg::RecOk => write!(f, "reconnected"),
            ServerMsg::Ping | ServerMsg::Pong => write!(f, ""),
            ServerMsg::Snapshot(raw) => write!(f, "lobbies: {raw}"),
            ServerMsg::Deal(c1, c2) => write!(f, "your hand: {c1} {c2}"),
            ServerMsg::Card(c) => write!(f, "dealt: {c}"),
            ServerMsg::Turn { name, seconds } => write!(f, "{name}'s turn ({seconds}s)"),
            ServerMsg::Bust { name, value } => write!(f, "{name} busts with {value}"),
            ServerMsg::Timeout => write!(f, "your turn timed out, auto-stood"),
            ServerMsg::OppDown { name, seconds } => {
                write!(f, "{name} disconnected, waiting up to {seconds}s for them to return")
            }
            ServerMsg::OppBack { name } => write!(f, "{name} reconnected"),
            ServerMsg::Result { name0, v0, name1, v1, winner } => {
                write!(f, "result: {name0} {v0} vs {name1} {v1} -- winner: {winner}")
            }
            ServerMsg::Down(reason) => write!(f, "server is shutting down ({reason})"),
            ServerMsg::Unknown(raw) => write!(f, "(unrecognised: {raw:?})"),
        }
    }
}

// ── CLIENT STATE ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    LoggingIn,
    LobbySelect,
    Waiting,
    MyTurn,
    OpponentTurn,
    PostMatch,
}

fn prompt(phase: Phase) {
    let label = match phase {
        Phase::LoggingIn => "name> ",
        Phase::LobbySelect => "lobby (join <n>)> ",
        Phase::Waiting => "",
        Phase::MyTurn => "your move (hit/stand/back)> ",
        Phase::OpponentTurn => "",
        Phase::PostMatch => "(back for another lobby)> ",
    };
    if !label.is_empty() {
        print!("\n{label}");
        io::stdout().flush().ok();
    }
}

fn accepts_input(phase: Phase) -> bool {
    !matches!(phase, Phase::Waiting | Phase::OpponentTurn)
}

/// Translate one line of player input into a wire line, given the current
/// phase and (once logged in) the player's own name.
fn to_wire(phase: Phase, own_name: &str, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match phase {
        Phase::LoggingIn => Some(format!("C45{trimmed}\n")),
        Phase::LobbySelect => {
            let lower = trimmed.to_ascii_lowercase();
            if lower == "back" {
                Some("C45B\n".to_string())
            } else if let Some(n) = lower.strip_prefix("join ").and_then(|n| n.trim().parse::<u32>().ok()) {
                Some(format!("C45J {n}\n"))
            } else {
                None
            }
        }
        Phase::MyTurn => match trimmed.to_ascii_lowercase().as_str() {
            "hit" => Some("C45H\n".to_string()),
            "stand" => Some("C45S\n".to_string()),
            "back" => Some(format!("C45{own_name}back\n")),
            _ => None,
        },
        Phase::PostMatch => {
            if trimmed.eq_ignore_ascii_case("back") {
                Some("C45B\n".to_string())
            } else {
                None
            }
        }
        Phase::Waiting | Phase::OpponentTurn => None,
    }
}

// ── MAIN ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log = Logger::new(args.verbose);

    log.info(ClientEvent::Connecting { addr: &args.addr });
    let stream = match TcpStream::connect(&args.addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to connect to {}: {e}", args.addr);
            std::process::exit(1);
        }
    };
    log.info(ClientEvent::Connected { addr: &args.addr });

    let (reader, mut writer) = tokio::io::split(stream);
    let mut server_lines = BufReader::new(reader).lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();

    let mut phase = Phase::LoggingIn;
    let mut own_name = args.name.clone().unwrap_or_default();

    if let Some(name) = &args.name {
        let line = format!("C45{name}\n");
        log.verbose(ClientEvent::Sending { line: line.trim_end() });
        if writer.write_all(line.as_bytes()).await.is_err() {
            eprintln!("failed to send login");
            return;
        }
    } else {
        println!("Welcome to C45 Blackjack. Enter your name:");
        prompt(phase);
    }

    loop {
        tokio::select! {
            result = server_lines.next_line() => {
                let raw = match result {
                    Ok(Some(l)) => l,
                    _ => {
                        log.info(ClientEvent::Disconnected);
                        println!("\ndisconnected from server.");
                        break;
                    }
                };
                log.trace(ClientEvent::Received { raw: &raw });
                let msg = ServerMsg::parse(raw.trim());

                match &msg {
                    ServerMsg::Ping => {
                        let _ = writer.write_all(b"C45PO\n").await;
                    }
                    ServerMsg::Pong => {}
                    ServerMsg::Ok if phase == Phase::LoggingIn => {
                        if own_name.is_empty() {
                            own_name = "you".to_string();
                        }
                        phase = Phase::LobbySelect;
                        println!("\nlogged in. pick a lobby with: join <n>");
                        prompt(phase);
                    }
                    ServerMsg::RecOk => {
                        phase = Phase::LobbySelect;
                        println!("\n{msg}");
                        prompt(phase);
                    }
                    ServerMsg::Wrong(_) => {
                        println!("\n{msg}");
                        prompt(phase);
                    }
                    ServerMsg::Snapshot(_) if phase == Phase::LobbySelect => {
                        println!("\n{msg}");
                        prompt(phase);
                    }
                    ServerMsg::Deal(c1, c2) => {
                        phase = Phase::OpponentTurn;
                        println!("\n{msg}");
                        println!("(dealt {c1} {c2})");
                    }
                    ServerMsg::Card(_) => println!("\n{msg}"),
                    ServerMsg::Bust { .. } => println!("\n{msg}"),
                    ServerMsg::Timeout => println!("\n{msg}"),
                    ServerMsg::Turn { name, .. } => {
                        phase = if *name == own_name { Phase::MyTurn } else { Phase::OpponentTurn };
                        println!("\n{msg}");
                        prompt(phase);
                    }
                    ServerMsg::OppDown { .. } | ServerMsg::OppBack { .. } => println!("\n{msg}"),
                    ServerMsg::Result { .. } => {
                        phase = Phase::PostMatch;
                        println!("\n{msg}");
                        prompt(phase);
                    }
                    ServerMsg::Down(_) => {
                        println!("\n{msg}");
                        break;
                    }
                    ServerMsg::Unknown(_) => println!("\n{msg}"),
                    _ => {}
                }
            }

            result = stdin_lines.next_line(), if accepts_input(phase) => {
                let raw = match result {
                    Ok(Some(l)) => l,
                    _ => {
                        println!("\ninput closed.");
                        break;
                    }
                };
                if phase == Phase::LoggingIn {
                    own_name = raw.trim().to_string();
                }
                match to_wire(phase, &own_name, &raw) {
                    Some(line) => {
                        log.verbose(ClientEvent::Sending { line: line.trim_end() });
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            eprintln!("failed to send.");
                            break;
                        }
                    }
                    None => {
                        println!("  ? unrecognised input for this phase");
                        prompt(phase);
                    }
                }
            }
        }
    }
}
