//! Match state machine (§4.6-§4.6.3): deal, alternating turns, bust/stand,
//! reconnect-waiting, settlement. One task per running lobby.
//!
//! Grounded on `examples/original_source/server/src/game.c`'s
//! `lobby_game_thread` (the goto-chained `pause_a`/`pause_b`/`pause_turn`/
//! `end_game` state machine), reshaped per design note #2 into explicit
//! `async fn`s returning a [`TurnOutcome`], and on `wait_for_reconnect`
//! for the reconnect-waiting sub-state (§4.6.2).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::conn::{Conn, LineEvent};
use crate::lobby::{ConnHandoff, MatchHandoffs};
use crate::protocol::{self, ActiveTurnLine, NonActiveLine};
use crate::App;

const TURN_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(5);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

enum Event {
    MatchStarted { idx: usize },
    MatchEnded { idx: usize, winner: String },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::MatchStarted { idx } => write!(f, "[lobby {idx}] match started"),
            Event::MatchEnded { idx, winner } => write!(f, "[lobby {idx}] match ended, winner {winner:?}"),
        }
    }
}

struct Seat {
    conn: Conn,
    ret: oneshot::Sender<Conn>,
}

pub fn spawn(app: Arc<App>, idx: usize, handoffs: MatchHandoffs) {
    tokio::spawn(run_match(app, idx, handoffs));
}

async fn run_match(app: Arc<App>, idx: usize, handoffs: MatchHandoffs) {
    let mut rx = handoffs.rx;
    let mut seats: [Option<Seat>; 2] = [None, None];
    for (slot, receiver) in rx.iter_mut().enumerate() {
        match receiver.recv().await {
            Some((conn, ret)) => seats[slot] = Some(Seat { conn, ret }),
            None => {
                app.log.warn("match task lost its handoff channel before kickoff");
                return;
            }
        }
    }
    app.log.info(Event::MatchStarted { idx });

    let shutdown_rx = app.conns.subscribe();

    let [a1, a2, b1, b2] = app.lobbies.deal_initial(idx);
    write_to(&mut seats, 0, &protocol::deal(a1, a2)).await;
    write_to(&mut seats, 1, &protocol::deal(b1, b2)).await;

    let mut turn = 0usize;
    let forced_winner: Option<String> = loop {
        if app.lobbies.is_stood_or_busted(idx, 0) && app.lobbies.is_stood_or_busted(idx, 1) {
            break None;
        }
        if app.lobbies.is_stood_or_busted(idx, turn) {
            turn = 1 - turn;
            continue;
        }
        let active_name = app.lobbies.player_name(idx, turn);
        let turn_line = protocol::turn(&active_name, TURN_TIMEOUT.as_secs());
        write_to(&mut seats, 0, &turn_line).await;
        write_to(&mut seats, 1, &turn_line).await;

        match play_turn(&app, idx, &mut seats, turn, &mut rx, &shutdown_rx).await {
            TurnOutcome::FlipTurn => turn = 1 - turn,
            TurnOutcome::Resume => {}
            TurnOutcome::Settle { forced_winner } => break forced_winner,
        }
    };

    settle(&app, idx, &mut seats, forced_winner).await;
}

async fn write_to(seats: &mut [Option<Seat>; 2], slot: usize, line: &str) {
    if let Some(seat) = seats[slot].as_mut() {
        let _ = seat.conn.write_line(line).await;
    }
}

enum TurnOutcome {
    FlipTurn,
    /// A reconnect during this turn succeeded; restart the turn's timers
    /// without flipping whose turn it is.
    Resume,
    Settle { forced_winner: Option<String> },
}

/// §4.6 main loop body for one active player's turn, including the
/// non-active drain (§4.6.1).
async fn play_turn(
    app: &App,
    idx: usize,
    seats: &mut [Option<Seat>; 2],
    turn: usize,
    rx: &mut [mpsc::UnboundedReceiver<ConnHandoff>; 2],
    shutdown_rx: &watch::Receiver<Option<String>>,
) -> TurnOutcome {
    let active = turn;
    let non_active = 1 - turn;

    if seats[active].is_none() {
        return pause_for_reconnect(app, idx, seats, active, rx, shutdown_rx).await;
    }
    if seats[non_active].is_none() {
        return pause_for_reconnect(app, idx, seats, non_active, rx, shutdown_rx).await;
    }

    let turn_start = Instant::now();
    let mut last_pong = Instant::now();
    let mut last_ping = Instant::now();

    loop {
        if let Some(reason) = shutdown_rx.borrow().clone() {
            let down = protocol::down(&reason);
            write_to(seats, 0, &down).await;
            write_to(seats, 1, &down).await;
            return TurnOutcome::Settle { forced_winner: None };
        }

        if last_ping.elapsed() >= PING_INTERVAL {
            let seat = seats[active].as_mut().unwrap();
            let _ = seat.conn.write_line(&protocol::ping()).await;
            last_ping = Instant::now();
        }

        if let Some(event) = seats[non_active].as_mut().unwrap().conn.try_recv() {
            match event {
                LineEvent::Line(line) => {
                    let name_na = app.lobbies.player_name(idx, non_active);
                    let parsed = if protocol::is_c45(&line) {
                        protocol::parse_non_active(&line, &name_na)
                    } else {
                        NonActiveLine::Violation
                    };
                    match parsed {
                        NonActiveLine::Ping => {
                            let _ = seats[non_active].as_mut().unwrap().conn.write_line(&protocol::pong()).await;
                        }
                        NonActiveLine::Pong | NonActiveLine::Yes => {}
                        NonActiveLine::BackRequest => {
                            app.names.mark_back(&name_na, None);
                            let winner = app.lobbies.player_name(idx, active);
                            return TurnOutcome::Settle { forced_winner: Some(winner) };
                        }
                        NonActiveLine::Violation => {
                            if let Some(seat) = seats[non_active].take() {
                                seat.conn.shutdown().await;
                            }
                            app.lobbies.mark_disconnected(idx, non_active);
                            let winner = app.lobbies.player_name(idx, active);
                            return TurnOutcome::Settle { forced_winner: Some(winner) };
                        }
                    }
                }
                LineEvent::Closed | LineEvent::Error => {
                    return pause_for_reconnect(app, idx, seats, non_active, rx, shutdown_rx).await;
                }
            }
        }

        let active_read = seats[active].as_mut().unwrap().conn.recv_timeout(Duration::from_secs(1)).await;
        match active_read {
            Some(LineEvent::Line(line)) => {
                let name_a = app.lobbies.player_name(idx, active);
                let parsed = if protocol::is_c45(&line) {
                    protocol::parse_active_turn(&line, &name_a)
                } else {
                    ActiveTurnLine::Other
                };
                match parsed {
                    ActiveTurnLine::Ping => {
                        let _ = seats[active].as_mut().unwrap().conn.write_line(&protocol::pong()).await;
                        last_pong = Instant::now();
                    }
                    ActiveTurnLine::Pong => last_pong = Instant::now(),
                    ActiveTurnLine::Yes => {}
                    ActiveTurnLine::BackRequest => {
                        app.names.mark_back(&name_a, None);
                        let winner = app.lobbies.player_name(idx, non_active);
                        return TurnOutcome::Settle { forced_winner: Some(winner) };
                    }
                    ActiveTurnLine::Hit => {
                        let (card, value, busted) = app.lobbies.hit(idx, active);
                        let seat = seats[active].as_mut().unwrap();
                        let _ = seat.conn.write_line(&protocol::card(card)).await;
                        if busted {
                            let _ = seat.conn.write_line(&protocol::bust(&name_a, value)).await;
                        }
                        return TurnOutcome::FlipTurn;
                    }
                    ActiveTurnLine::Stand => {
                        app.lobbies.stand(idx, active);
                        return TurnOutcome::FlipTurn;
                    }
                    ActiveTurnLine::Other => {
                        if let Some(seat) = seats[active].take() {
                            seat.conn.shutdown().await;
                        }
                        app.lobbies.mark_disconnected(idx, active);
                        let winner = app.lobbies.player_name(idx, non_active);
                        return TurnOutcome::Settle { forced_winner: Some(winner) };
                    }
                }
            }
            Some(LineEvent::Closed) | Some(LineEvent::Error) => {
                return pause_for_reconnect(app, idx, seats, active, rx, shutdown_rx).await;
            }
            None => {}
        }

        if last_pong.elapsed() > PONG_TIMEOUT {
            return pause_for_reconnect(app, idx, seats, active, rx, shutdown_rx).await;
        }
        if turn_start.elapsed() >= TURN_TIMEOUT {
            app.lobbies.stand(idx, active);
            let _ = seats[active].as_mut().unwrap().conn.write_line(&protocol::timeout()).await;
            return TurnOutcome::FlipTurn;
        }
    }
}

/// §4.6.2: `missing`'s socket is already gone (or about to be closed here).
/// Waits up to `RECONNECT_TIMEOUT` for a new socket to arrive for that
/// seat, draining the other player meanwhile.
async fn pause_for_reconnect(
    app: &App,
    idx: usize,
    seats: &mut [Option<Seat>; 2],
    missing: usize,
    rx: &mut [mpsc::UnboundedReceiver<ConnHandoff>; 2],
    shutdown_rx: &watch::Receiver<Option<String>>,
) -> TurnOutcome {
    let other = 1 - missing;
    let missing_name = app.lobbies.player_name(idx, missing);
    let other_name = app.lobbies.player_name(idx, other);

    if let Some(seat) = seats[missing].take() {
        seat.conn.shutdown().await;
    }
    app.lobbies.mark_disconnected(idx, missing);

    if seats[other].is_none() {
        // Both players gone; nothing meaningful left to wait for.
        return TurnOutcome::Settle { forced_winner: None };
    }
    {
        let seat = seats[other].as_mut().unwrap();
        let _ = seat.conn.write_line(&protocol::opp_down(&missing_name, RECONNECT_TIMEOUT.as_secs())).await;
    }

    let deadline = Instant::now() + RECONNECT_TIMEOUT;
    let mut last_ping = Instant::now();
    loop {
        if let Some(reason) = shutdown_rx.borrow().clone() {
            let seat = seats[other].as_mut().unwrap();
            let _ = seat.conn.write_line(&protocol::down(&reason)).await;
            return TurnOutcome::Settle { forced_winner: None };
        }
        if Instant::now() >= deadline {
            return TurnOutcome::Settle { forced_winner: Some(other_name) };
        }
        if last_ping.elapsed() >= PING_INTERVAL {
            let seat = seats[other].as_mut().unwrap();
            let _ = seat.conn.write_line(&protocol::ping()).await;
            last_ping = Instant::now();
        }

        let handoff_fut = tokio::time::timeout(Duration::from_millis(200), rx[missing].recv());
        let other_read_fut = seats[other].as_mut().unwrap().conn.recv_timeout(Duration::from_millis(200));

        tokio::select! {
            handoff = handoff_fut => {
                if let Ok(Some((conn, ret))) = handoff {
                    seats[missing] = Some(Seat { conn, ret });
                    let cards = app.lobbies.hand_cards(idx, missing);
                    {
                        let seat = seats[missing].as_mut().unwrap();
                        if cards.len() >= 2 {
                            let _ = seat.conn.write_line(&protocol::deal(cards[0], cards[1])).await;
                            for &c in &cards[2..] {
                                let _ = seat.conn.write_line(&protocol::card(c)).await;
                            }
                        }
                    }
                    let other_seat = seats[other].as_mut().unwrap();
                    let _ = other_seat.conn.write_line(&protocol::opp_back(&missing_name)).await;
                    return TurnOutcome::Resume;
                }
            }
            event = other_read_fut => {
                match event {
                    Some(LineEvent::Line(line)) => {
                        let parsed = if protocol::is_c45(&line) {
                            protocol::parse_non_active(&line, &other_name)
                        } else {
                            NonActiveLine::Violation
                        };
                        match parsed {
                            NonActiveLine::Ping => {
                                let _ = seats[other].as_mut().unwrap().conn.write_line(&protocol::pong()).await;
                            }
                            NonActiveLine::Pong | NonActiveLine::Yes => {}
                            NonActiveLine::BackRequest => {
                                app.names.mark_back(&other_name, None);
                                // Mirrors the deadline-expiry outcome above: `other` wins.
                                return TurnOutcome::Settle { forced_winner: Some(other_name) };
                            }
                            NonActiveLine::Violation => {
                                return TurnOutcome::Settle { forced_winner: None };
                            }
                        }
                    }
                    Some(LineEvent::Closed) | Some(LineEvent::Error) => {
                        return TurnOutcome::Settle { forced_winner: None };
                    }
                    None => {}
                }
            }
        }
    }
}

/// §4.6.3: compute final values, announce the result, flip the lobby back
/// to idle, and hand both sockets back to their session tasks.
async fn settle(app: &App, idx: usize, seats: &mut [Option<Seat>; 2], forced_winner: Option<String>) {
    let va = app.lobbies.settlement_value(idx, 0);
    let vb = app.lobbies.settlement_value(idx, 1);
    let name0 = app.lobbies.player_name(idx, 0);
    let name1 = app.lobbies.player_name(idx, 1);

    let winner = forced_winner.unwrap_or_else(|| {
        if va > vb {
            name0.clone()
        } else if vb > va {
            name1.clone()
        } else {
            "PUSH".to_string()
        }
    });

    let result_line = protocol::result(&name0, va, &name1, vb, &winner);
    write_to(seats, 0, &result_line).await;
    write_to(seats, 1, &result_line).await;

    app.log.info(Event::MatchEnded { idx, winner });
    app.lobbies.end_match(idx);

    for slot in seats.iter_mut() {
        if let Some(Seat { conn, ret }) = slot.take() {
            let _ = ret.send(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::conn::ConnId;

    async fn test_conn_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer_addr) = listener.accept().await.unwrap();
        (Conn::accept(server_stream, peer_addr).unwrap(), client)
    }

    /// Sets up a one-lobby pool with both seats already occupied and
    /// connected, mirroring what `run_match` hands `play_turn` after kickoff.
    async fn two_player_lobby(app: &App) -> [mpsc::UnboundedReceiver<ConnHandoff>; 2] {
        app.lobbies.try_add(0, "Ann").unwrap();
        app.lobbies.try_add(0, "Bob").unwrap();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        app.lobbies.attach_fd(0, "Ann", ConnId::from_raw(1), tx_a).unwrap();
        app.lobbies.attach_fd(0, "Bob", ConnId::from_raw(2), tx_b).unwrap();
        app.lobbies.start_if_ready(0).unwrap().rx
    }

    #[tokio::test]
    async fn malformed_short_line_from_active_player_settles_instead_of_panicking() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (active_conn, mut active_client) = test_conn_pair().await;
        let (non_active_conn, _non_active_client) = test_conn_pair().await;
        let (ret_a, _) = oneshot::channel();
        let (ret_b, _) = oneshot::channel();
        let mut seats: [Option<Seat>; 2] =
            [Some(Seat { conn: active_conn, ret: ret_a }), Some(Seat { conn: non_active_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        active_client.write_all(b"\n").await.unwrap();

        let outcome = play_turn(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await;
        match outcome {
            TurnOutcome::Settle { forced_winner } => assert_eq!(forced_winner, Some("Bob".to_string())),
            _ => panic!("expected the malformed line to settle the match"),
        }
    }

    #[tokio::test]
    async fn unrecognised_c45_line_from_non_active_player_is_a_violation() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (active_conn, _active_client) = test_conn_pair().await;
        let (non_active_conn, mut non_active_client) = test_conn_pair().await;
        let (ret_a, _) = oneshot::channel();
        let (ret_b, _) = oneshot::channel();
        let mut seats: [Option<Seat>; 2] =
            [Some(Seat { conn: active_conn, ret: ret_a }), Some(Seat { conn: non_active_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        non_active_client.write_all(b"C45ZZZ\n").await.unwrap();
        // Give the background reader a moment to deliver the line before
        // play_turn's non-blocking try_recv() drain runs.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = play_turn(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await;
        match outcome {
            TurnOutcome::Settle { forced_winner } => assert_eq!(forced_winner, Some("Ann".to_string())),
            _ => panic!("expected the violation to settle the match"),
        }
    }

    #[tokio::test]
    async fn active_player_standing_flips_the_turn_without_settling() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (active_conn, mut active_client) = test_conn_pair().await;
        let (non_active_conn, _non_active_client) = test_conn_pair().await;
        let (ret_a, _) = oneshot::channel();
        let (ret_b, _) = oneshot::channel();
        let mut seats: [Option<Seat>; 2] =
            [Some(Seat { conn: active_conn, ret: ret_a }), Some(Seat { conn: non_active_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        active_client.write_all(b"C45S\n").await.unwrap();

        let outcome = play_turn(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await;
        assert!(matches!(outcome, TurnOutcome::FlipTurn));
        assert!(app.lobbies.is_stood_or_busted(0, 0));
    }

    #[tokio::test]
    async fn active_player_back_request_forfeits_to_the_opponent() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (active_conn, mut active_client) = test_conn_pair().await;
        let (non_active_conn, _non_active_client) = test_conn_pair().await;
        let (ret_a, _) = oneshot::channel();
        let (ret_b, _) = oneshot::channel();
        let mut seats: [Option<Seat>; 2] =
            [Some(Seat { conn: active_conn, ret: ret_a }), Some(Seat { conn: non_active_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        active_client.write_all(b"C45Annback\n").await.unwrap();

        let outcome = play_turn(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await;
        match outcome {
            TurnOutcome::Settle { forced_winner } => assert_eq!(forced_winner, Some("Bob".to_string())),
            _ => panic!("expected the back request to forfeit the active player's seat"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_wait_expiry_awards_the_player_who_stayed() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (bob_conn, _bob_client) = test_conn_pair().await;
        let (ret_b, _) = oneshot::channel();
        let seats: [Option<Seat>; 2] = [None, Some(Seat { conn: bob_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        let handle = {
            let app = app.clone();
            let mut seats = seats;
            tokio::spawn(async move { pause_for_reconnect(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await })
        };
        tokio::time::advance(RECONNECT_TIMEOUT + Duration::from_secs(1)).await;
        let outcome = handle.await.unwrap();
        match outcome {
            TurnOutcome::Settle { forced_winner } => assert_eq!(forced_winner, Some("Bob".to_string())),
            _ => panic!("expected reconnect-wait expiry to settle the match"),
        }
    }

    #[tokio::test]
    async fn reconnect_wait_back_request_matches_the_deadline_expiry_outcome() {
        let app = App::new(1, 0);
        let mut rx = two_player_lobby(&app).await;
        let (bob_conn, mut bob_client) = test_conn_pair().await;
        let (ret_b, _) = oneshot::channel();
        let mut seats: [Option<Seat>; 2] = [None, Some(Seat { conn: bob_conn, ret: ret_b })];
        let shutdown_rx = app.conns.subscribe();

        bob_client.write_all(b"C45Bobback\n").await.unwrap();

        let outcome = pause_for_reconnect(&app, 0, &mut seats, 0, &mut rx, &shutdown_rx).await;
        match outcome {
            TurnOutcome::Settle { forced_winner } => assert_eq!(forced_winner, Some("Bob".to_string())),
            _ => panic!("expected the back request to settle the same way a deadline expiry would"),
        }
    }
}
