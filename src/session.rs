//! Per-connection session state machine (§4.5, §4.5.1).
//!
//! Grounded on `examples/original_source/server/src/server.c`'s per-client
//! thread function (handshake -> lobby browse -> wait -> play -> back) and
//! on design note #2 ("goto-chains become an explicit state machine with
//! named transitions"): each state is its own `async fn` returning an
//! outcome enum, and `run_session` is the dispatcher between them.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::conn::{Conn, ConnId, LineEvent};
use crate::protocol::{self, HandshakeLine, LobbySelectLine, PostMatchLine, WaitingLine};
use crate::App;

const RECONNECT_GRACE: Duration = Duration::from_millis(3000);
const RECONNECT_GRACE_SLICE: Duration = Duration::from_millis(50);

enum Recv {
    Line(String),
    /// Peer closed, errored, or the server is shutting down (in which case
    /// `C45DOWN` has already been written before this is returned).
    Ended,
}

/// Read one line, racing the shutdown broadcast (§4.7, §5: "≤1s" delivery).
/// Every indefinite read in the session state machine goes through this so
/// a live connection never outlives the broadcast by more than one poll.
async fn recv_msg(conn: &mut Conn, shutdown_rx: &mut watch::Receiver<Option<String>>) -> Recv {
    if let Some(reason) = shutdown_rx.borrow().clone() {
        let _ = conn.write_line(&protocol::down(&reason)).await;
        return Recv::Ended;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_ok() {
                if let Some(reason) = shutdown_rx.borrow().clone() {
                    let _ = conn.write_line(&protocol::down(&reason)).await;
                }
            }
            Recv::Ended
        }
        event = conn.recv() => match event {
            LineEvent::Line(l) => Recv::Line(l),
            LineEvent::Closed | LineEvent::Error => Recv::Ended,
        }
    }
}

enum Event {
    Accepted { addr: std::net::SocketAddr },
    NameTaken { name: String },
    LoggedIn { name: String },
    Joined { name: String, idx: usize },
    Reconnected { name: String, idx: usize },
    ProtocolViolation { raw: String },
    Disconnected { name: Option<String> },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Accepted { addr } => write!(f, "accepted connection from {addr}"),
            Event::NameTaken { name } => write!(f, "login rejected, name already taken: {name:?}"),
            Event::LoggedIn { name } => write!(f, "{name:?} logged in"),
            Event::Joined { name, idx } => write!(f, "{name:?} joined lobby {idx}"),
            Event::Reconnected { name, idx } => write!(f, "{name:?} reconnected into lobby {idx}"),
            Event::ProtocolViolation { raw } => write!(f, "protocol violation: {raw:?}"),
            Event::Disconnected { name } => write!(f, "session ended for {name:?}"),
        }
    }
}

pub async fn run_session(app: Arc<App>, stream: TcpStream, addr: std::net::SocketAddr) {
    let mut conn = match Conn::accept(stream, addr) {
        Ok(c) => c,
        Err(_) => return,
    };
    app.log.verbose(Event::Accepted { addr });
    app.conns.register(conn.id);
    let mut shutdown_rx = app.conns.subscribe();

    let outcome = run_handshake(&app, &mut conn, &mut shutdown_rx).await;

    let (mut name, mut token) = match outcome {
        HandshakeOutcome::FreshLogin(name, token) => {
            app.log.info(Event::LoggedIn { name: name.clone() });
            (name, token)
        }
        HandshakeOutcome::ReconnectIntoMatch { idx, name, token } => {
            app.log.info(Event::Reconnected { name: name.clone(), idx });
            match run_match_handoff(&app, conn, idx, &name).await {
                HandoffResult::Returned(c) => conn = c,
                HandoffResult::SendFailed(c) => {
                    finish(&app, c, Some((name, token))).await;
                    return;
                }
                HandoffResult::Lost => {
                    app.log.warn("match task dropped return channel without replying");
                    return;
                }
            }
            if !run_post_match_and_maybe_loop(&app, &mut conn, &name, &mut shutdown_rx).await {
                finish(&app, conn, Some((name, token))).await;
                return;
            }
            (name, token)
        }
        HandshakeOutcome::ReconnectIntoWaiting { idx, name, token, supersede_rx } => {
            app.log.info(Event::Reconnected { name: name.clone(), idx });
            match run_waiting(&app, &mut conn, idx, &name, supersede_rx, &mut shutdown_rx).await {
                WaitingOutcome::EnteredMatch => match run_match_handoff(&app, conn, idx, &name).await {
                    HandoffResult::Returned(c) => conn = c,
                    HandoffResult::SendFailed(c) => {
                        finish(&app, c, Some((name, token))).await;
                        return;
                    }
                    HandoffResult::Lost => {
                        app.log.warn("match task dropped return channel without replying");
                        return;
                    }
                },
                WaitingOutcome::Back | WaitingOutcome::Disconnected | WaitingOutcome::Superseded => {
                    finish(&app, conn, Some((name, token))).await;
                    return;
                }
            }
            if !run_post_match_and_maybe_loop(&app, &mut conn, &name, &mut shutdown_rx).await {
                finish(&app, conn, Some((name, token))).await;
                return;
            }
            (name, token)
        }
        HandshakeOutcome::Fail => {
            finish_no_name(&app, conn).await;
            return;
        }
    };

    'lobby: loop {
        match run_lobby_select(&app, &mut conn, &name, &mut shutdown_rx).await {
            LobbySelectOutcome::Join(idx) => {
                let (supersede_tx, supersede_rx) = oneshot::channel();
                if app.lobbies.attach_fd(idx, &name, conn.id, supersede_tx).is_err() {
                    let _ = conn.write_line(&protocol::wrong(None)).await;
                    continue 'lobby;
                }
                let _ = conn.write_line(&protocol::ok()).await;
                if let Some(handoffs) = app.lobbies.start_if_ready(idx) {
                    crate::match_sm::spawn(app.clone(), idx, handoffs);
                }
                app.log.info(Event::Joined { name: name.clone(), idx });

                match run_waiting(&app, &mut conn, idx, &name, supersede_rx, &mut shutdown_rx).await {
                    WaitingOutcome::EnteredMatch => {
                        match run_match_handoff(&app, conn, idx, &name).await {
                            HandoffResult::Returned(c) => conn = c,
                            HandoffResult::SendFailed(c) => {
                                finish(&app, c, Some((name, token))).await;
                                return;
                            }
                            HandoffResult::Lost => {
                                app.log.warn("match task dropped return channel without replying");
                                return;
                            }
                        }
                        if !run_post_match_and_maybe_loop(&app, &mut conn, &name, &mut shutdown_rx).await {
                            finish(&app, conn, Some((name, token))).await;
                            return;
                        }
                        continue 'lobby;
                    }
                    WaitingOutcome::Back => continue 'lobby,
                    WaitingOutcome::Disconnected | WaitingOutcome::Superseded => {
                        finish(&app, conn, Some((name, token))).await;
                        return;
                    }
                }
            }
            LobbySelectOutcome::Disconnected => {
                finish(&app, conn, Some((name, token))).await;
                return;
            }
        }
    }
}

// ── HANDSHAKE ────────────────────────────────────────────────────────────

enum HandshakeOutcome {
    FreshLogin(String, u64),
    ReconnectIntoMatch { idx: usize, name: String, token: u64 },
    ReconnectIntoWaiting { idx: usize, name: String, token: u64, supersede_rx: oneshot::Receiver<()> },
    Fail,
}

async fn run_handshake(
    app: &App,
    conn: &mut Conn,
    shutdown_rx: &mut watch::Receiver<Option<String>>,
) -> HandshakeOutcome {
    loop {
        let line = match recv_msg(conn, shutdown_rx).await {
            Recv::Line(l) => l,
            Recv::Ended => return HandshakeOutcome::Fail,
        };
        if !protocol::is_c45(&line) {
            return HandshakeOutcome::Fail;
        }
        match protocol::parse_handshake(&line) {
            HandshakeLine::Ping => {
                let _ = conn.write_line(&protocol::pong()).await;
            }
            HandshakeLine::Pong => {}
            HandshakeLine::Reconnect { name, lobby_idx } => {
                return match attempt_reconnect(app, conn.id, &name, lobby_idx).await {
                    ReconnectAttempt::IntoMatch { idx } => match ensure_bound(app, &name, conn.id) {
                        Some(token) => {
                            let _ = conn.write_line(&protocol::rec_ok()).await;
                            HandshakeOutcome::ReconnectIntoMatch { idx, name, token }
                        }
                        None => HandshakeOutcome::Fail,
                    },
                    ReconnectAttempt::IntoWaiting { idx, supersede_rx } => match ensure_bound(app, &name, conn.id) {
                        Some(token) => {
                            let _ = conn.write_line(&protocol::rec_ok()).await;
                            HandshakeOutcome::ReconnectIntoWaiting { idx, name, token, supersede_rx }
                        }
                        None => HandshakeOutcome::Fail,
                    },
                    ReconnectAttempt::FailSilent => HandshakeOutcome::Fail,
                    ReconnectAttempt::FailToFreshLogin => match fresh_login(app, conn, &name).await {
                        Some((name, token)) => HandshakeOutcome::FreshLogin(name, token),
                        None => HandshakeOutcome::Fail,
                    },
                };
            }
            HandshakeLine::Login(name) => {
                return match fresh_login(app, conn, &name).await {
                    Some((name, token)) => HandshakeOutcome::FreshLogin(name, token),
                    None => HandshakeOutcome::Fail,
                };
            }
            HandshakeLine::Other => {
                let _ = conn.write_line(&protocol::wrong(None)).await;
                return HandshakeOutcome::Fail;
            }
        }
    }
}

/// §4.5.1 "ensure name is in registry (add if absent), bind to obtain a
/// new token".
fn ensure_bound(app: &App, name: &str, conn_id: ConnId) -> Option<u64> {
    app.names.bind(name, conn_id).or_else(|| {
        app.names.add(name).ok()?;
        app.names.bind(name, conn_id)
    })
}

async fn fresh_login(app: &App, conn: &mut Conn, name: &str) -> Option<(String, u64)> {
    if app.names.has(name) || app.lobbies.name_exists(name) {
        let _ = conn.write_line(&protocol::wrong(Some("NAME_TAKEN"))).await;
        app.log.info(Event::NameTaken { name: name.to_string() });
        return None;
    }
    if app.names.add(name).is_err() {
        let _ = conn.write_line(&protocol::wrong(None)).await;
        return None;
    }
    let token = app.names.bind(name, conn.id)?;
    let _ = conn.write_line(&protocol::ok()).await;
    let _ = conn.write_line(&protocol::snapshot(&app.lobbies.snapshot())).await;
    Some((name.to_string(), token))
}

enum ReconnectAttempt {
    IntoMatch { idx: usize },
    IntoWaiting { idx: usize, supersede_rx: oneshot::Receiver<()> },
    FailSilent,
    FailToFreshLogin,
}

/// §4.5.1: try `try_reconnect` then `try_takeover_waiting` against the
/// named lobby first (if known), then every other lobby, retrying for a
/// bounded grace window so a match task has time to notice the old
/// socket is gone.
async fn attempt_reconnect(app: &App, conn_id: ConnId, name: &str, lobby_idx: u32) -> ReconnectAttempt {
    let mut candidates = Vec::with_capacity(app.lobbies.count());
    if lobby_idx > 0 {
        let idx = (lobby_idx - 1) as usize;
        if idx < app.lobbies.count() {
            candidates.push(idx);
        }
    }
    for i in 0..app.lobbies.count() {
        if !candidates.contains(&i) {
            candidates.push(i);
        }
    }

    let deadline = Instant::now() + RECONNECT_GRACE;
    loop {
        for &idx in &candidates {
            if app.lobbies.try_reconnect(idx, name, conn_id).is_some() {
                return ReconnectAttempt::IntoMatch { idx };
            }
        }
        let (tx, rx) = oneshot::channel();
        let mut supersede_tx = Some(tx);
        let mut supersede_rx = Some(rx);
        for &idx in &candidates {
            let tx = supersede_tx.take().expect("refilled on failure below");
            match app.lobbies.try_takeover_waiting(idx, name, conn_id, tx) {
                Ok(()) => return ReconnectAttempt::IntoWaiting { idx, supersede_rx: supersede_rx.take().unwrap() },
                Err(tx) => supersede_tx = Some(tx),
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(RECONNECT_GRACE_SLICE).await;
    }
    if app.lobbies.name_exists(name) {
        ReconnectAttempt::FailSilent
    } else {
        ReconnectAttempt::FailToFreshLogin
    }
}

// ── LOBBY_SELECT ─────────────────────────────────────────────────────────

enum LobbySelectOutcome {
    Join(usize),
    Disconnected,
}

async fn run_lobby_select(
    app: &App,
    conn: &mut Conn,
    name: &str,
    shutdown_rx: &mut watch::Receiver<Option<String>>,
) -> LobbySelectOutcome {
    loop {
        let line = match recv_msg(conn, shutdown_rx).await {
            Recv::Line(l) => l,
            Recv::Ended => return LobbySelectOutcome::Disconnected,
        };
        if !protocol::is_c45(&line) {
            return LobbySelectOutcome::Disconnected;
        }
        match protocol::parse_lobby_select(&line) {
            LobbySelectLine::Ping => {
                let _ = conn.write_line(&protocol::pong()).await;
            }
            LobbySelectLine::Pong => {}
            LobbySelectLine::Back => {
                let _ = conn.write_line(&protocol::snapshot(&app.lobbies.snapshot())).await;
            }
            LobbySelectLine::Join(n) => {
                let idx = (n - 1) as usize;
                if idx >= app.lobbies.count() {
                    let _ = conn.write_line(&protocol::wrong(None)).await;
                    continue;
                }
                match app.lobbies.try_add(idx, name) {
                    Ok(()) => return LobbySelectOutcome::Join(idx),
                    Err(_) => {
                        let _ = conn.write_line(&protocol::wrong(None)).await;
                    }
                }
            }
            LobbySelectLine::Malformed => {
                let _ = conn.write_line(&protocol::wrong(None)).await;
            }
        }
    }
}

// ── WAITING ──────────────────────────────────────────────────────────────

enum WaitingOutcome {
    EnteredMatch,
    Back,
    Disconnected,
    Superseded,
}

async fn run_waiting(
    app: &App,
    conn: &mut Conn,
    idx: usize,
    name: &str,
    mut supersede_rx: oneshot::Receiver<()>,
    shutdown_rx: &mut watch::Receiver<Option<String>>,
) -> WaitingOutcome {
    let Ok(mut running_rx) = app.lobbies.subscribe_running(idx) else {
        return WaitingOutcome::Disconnected;
    };
    if *running_rx.borrow() {
        return WaitingOutcome::EnteredMatch;
    }
    loop {
        if let Some(reason) = shutdown_rx.borrow().clone() {
            let _ = conn.write_line(&protocol::down(&reason)).await;
            app.lobbies.remove_by_name_if_fd(name, conn.id);
            return WaitingOutcome::Disconnected;
        }
        tokio::select! {
            changed = running_rx.changed() => {
                if changed.is_err() {
                    return WaitingOutcome::Disconnected;
                }
                if *running_rx.borrow() {
                    return WaitingOutcome::EnteredMatch;
                }
            }
            _ = shutdown_rx.changed() => {}
            _ = &mut supersede_rx => {
                return WaitingOutcome::Superseded;
            }
            event = conn.recv() => {
                match event {
                    LineEvent::Line(line) => {
                        if !protocol::is_c45(&line) {
                            app.lobbies.remove_by_name_if_fd(name, conn.id);
                            return WaitingOutcome::Disconnected;
                        }
                        match protocol::parse_waiting(&line) {
                            WaitingLine::Ping => { let _ = conn.write_line(&protocol::pong()).await; }
                            WaitingLine::Pong => {}
                            WaitingLine::Back => {
                                app.lobbies.remove_by_name_if_fd(name, conn.id);
                                let _ = conn.write_line(&protocol::snapshot(&app.lobbies.snapshot())).await;
                                return WaitingOutcome::Back;
                            }
                            WaitingLine::Other => {
                                app.lobbies.remove_by_name_if_fd(name, conn.id);
                                return WaitingOutcome::Disconnected;
                            }
                        }
                    }
                    LineEvent::Closed | LineEvent::Error => {
                        app.lobbies.remove_by_name_if_fd(name, conn.id);
                        return WaitingOutcome::Disconnected;
                    }
                }
            }
        }
    }
}

enum HandoffResult {
    Returned(Conn),
    /// The match task dropped its return channel without sending — should
    /// never happen if the match task always replies exactly once.
    Lost,
    SendFailed(Conn),
}

/// Hand `conn` over to the running match task for `idx` and block until
/// it is handed back at settlement.
async fn run_match_handoff(app: &App, conn: Conn, idx: usize, name: &str) -> HandoffResult {
    let Some(handoff_tx) = app.lobbies.handoff_sender(idx, name) else {
        return HandoffResult::SendFailed(conn);
    };
    let (ret_tx, ret_rx) = oneshot::channel();
    if let Err(err) = handoff_tx.send((conn, ret_tx)) {
        let (conn, _ret_tx) = err.0;
        return HandoffResult::SendFailed(conn);
    }
    match ret_rx.await {
        Ok(returned) => HandoffResult::Returned(returned),
        Err(_) => HandoffResult::Lost,
    }
}

// ── POST_MATCH ─────────────────────────────────────────────────────────────

/// Runs POST_MATCH to completion. Returns `true` if the session should
/// loop back into LOBBY_SELECT, `false` if it should terminate.
async fn run_post_match_and_maybe_loop(
    app: &App,
    conn: &mut Conn,
    name: &str,
    shutdown_rx: &mut watch::Receiver<Option<String>>,
) -> bool {
    if app.names.take_back(name, None) {
        let _ = conn.write_line(&protocol::snapshot(&app.lobbies.snapshot())).await;
        return true;
    }
    loop {
        let line = match recv_msg(conn, shutdown_rx).await {
            Recv::Line(l) => l,
            Recv::Ended => return false,
        };
        if !protocol::is_c45(&line) {
            return false;
        }
        match protocol::parse_post_match(&line) {
            PostMatchLine::Back => {
                let _ = conn.write_line(&protocol::snapshot(&app.lobbies.snapshot())).await;
                return true;
            }
            PostMatchLine::Tolerated => {}
            PostMatchLine::Other => {
                app.log.verbose(Event::ProtocolViolation { raw: line });
                let _ = conn.write_line(&protocol::wrong(None)).await;
                return false;
            }
        }
    }
}

async fn finish(app: &App, conn: Conn, name_token: Option<(String, u64)>) {
    if let Some((name, token)) = &name_token {
        app.names.remove_if_token(name, *token);
    }
    app.log.verbose(Event::Disconnected { name: name_token.map(|(n, _)| n) });
    app.conns.unregister(conn.id);
    conn.shutdown().await;
}

async fn finish_no_name(app: &App, conn: Conn) {
    app.conns.unregister(conn.id);
    conn.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn test_conn_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer_addr) = listener.accept().await.unwrap();
        (Conn::accept(server_stream, peer_addr).unwrap(), client)
    }

    #[tokio::test]
    async fn handshake_rejects_a_too_short_line_without_panicking() {
        let app = App::new(1, 0);
        let (mut conn, mut client) = test_conn_pair().await;
        let mut shutdown_rx = app.conns.subscribe();

        client.write_all(b"\n").await.unwrap();

        let outcome = run_handshake(&app, &mut conn, &mut shutdown_rx).await;
        assert!(matches!(outcome, HandshakeOutcome::Fail));
    }

    #[tokio::test]
    async fn handshake_accepts_a_fresh_login_and_replies_ok() {
        let app = App::new(1, 0);
        let (mut conn, mut client) = test_conn_pair().await;
        let mut shutdown_rx = app.conns.subscribe();

        client.write_all(b"C45Alice\n").await.unwrap();

        let outcome = run_handshake(&app, &mut conn, &mut shutdown_rx).await;
        match outcome {
            HandshakeOutcome::FreshLogin(name, _token) => assert_eq!(name, "Alice"),
            _ => panic!("expected a fresh login"),
        }

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"C45OK\n"));
    }

    #[tokio::test]
    async fn handshake_rejects_a_name_already_logged_in() {
        let app = App::new(1, 0);
        app.names.add("Alice").unwrap();
        app.names.bind("Alice", ConnId::from_raw(99)).unwrap();

        let (mut conn, mut client) = test_conn_pair().await;
        let mut shutdown_rx = app.conns.subscribe();

        client.write_all(b"C45Alice\n").await.unwrap();

        let outcome = run_handshake(&app, &mut conn, &mut shutdown_rx).await;
        assert!(matches!(outcome, HandshakeOutcome::Fail));
    }

    #[tokio::test]
    async fn lobby_select_join_moves_into_the_requested_lobby() {
        let app = App::new(1, 0);
        let (mut conn, mut client) = test_conn_pair().await;
        let mut shutdown_rx = app.conns.subscribe();

        client.write_all(b"C45J 1\n").await.unwrap();

        let outcome = run_lobby_select(&app, &mut conn, "Alice", &mut shutdown_rx).await;
        assert!(matches!(outcome, LobbySelectOutcome::Join(0)));
    }

    #[tokio::test]
    async fn lobby_select_rejects_an_out_of_range_index() {
        let app = App::new(1, 0);
        let (mut conn, mut client) = test_conn_pair().await;
        let mut shutdown_rx = app.conns.subscribe();

        client.write_all(b"C45J 5\n").await.unwrap();
        client.write_all(b"C45J 1\n").await.unwrap();

        let outcome = run_lobby_select(&app, &mut conn, "Alice", &mut shutdown_rx).await;
        assert!(matches!(outcome, LobbySelectOutcome::Join(0)));

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"C45WRONG"));
    }
}
