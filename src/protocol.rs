//! The line-framed `C45` tagged-token protocol. The only module that
//! touches raw text; every other module works with the enums defined here.
//!
//! Grounded on `examples/original_source/server/include/protocol.h` (the
//! `is_c45_prefix` / exact-token-match style) and spec §4.1/§6. Token
//! matching is exact: a token only matches when the next character is
//! end-of-string, `\n`, `\r`, space, or tab, so a player name that happens
//! to start with a token spelling is never misread as that token.

use crate::deck::Card;

/// Maximum player name length in bytes (§3, §8: 63 accepted, 64 rejected).
pub const MAX_NAME_LEN: usize = 63;

fn is_boundary(c: char) -> bool {
    matches!(c, '\n' | '\r' | ' ' | '\t')
}

/// If `s` starts with `token` followed by a boundary character (or nothing),
/// return the remainder after `token`. Otherwise `None`.
fn try_token<'a>(s: &'a str, token: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(token)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if is_boundary(c) => Some(rest),
        _ => None,
    }
}

/// A player name is 1..=63 bytes with no whitespace (§3, §6).
pub fn valid_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NAME_LEN && !s.chars().any(char::is_whitespace)
}

/// `true` if the line starts with the literal `C45` tag.
pub fn is_c45(line: &str) -> bool {
    line.starts_with("C45")
}

/// Strip a trailing `\n`/`\r\n` and the `C45` tag, returning the rest of
/// the line. Panics if `is_c45(line)` is false; callers must check first.
fn tag_body(line: &str) -> &str {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    &trimmed[3..]
}

/// `C45<name>back` exactly, where `<name>` is the sender's own name —
/// an explicit request to return to the lobby list.
fn is_back_request(rest: &str, own_name: &str) -> bool {
    rest.strip_prefix(own_name)
        .and_then(|after| try_token(after, "back"))
        .is_some()
}

// ── HANDSHAKE ──────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeLine {
    Ping,
    Pong,
    Reconnect { name: String, lobby_idx: u32 },
    Login(String),
    /// Any other C45-prefixed line: reply `C45WRONG` and disconnect.
    Other,
}

pub fn parse_handshake(line: &str) -> HandshakeLine {
    let rest = tag_body(line);
    if try_token(rest, "PI").is_some() {
        return HandshakeLine::Ping;
    }
    if try_token(rest, "PO").is_some() {
        return HandshakeLine::Pong;
    }
    if let Some(args) = try_token(rest, "REC") {
        let mut it = args.trim_start().split_whitespace();
        if let (Some(name), Some(idx_s)) = (it.next(), it.next()) {
            if valid_name(name) {
                if let Ok(lobby_idx) = idx_s.parse::<u32>() {
                    return HandshakeLine::Reconnect { name: name.to_string(), lobby_idx };
                }
            }
        }
        return HandshakeLine::Other;
    }
    if valid_name(rest) {
        return HandshakeLine::Login(rest.to_string());
    }
    HandshakeLine::Other
}

// ── LOBBY_SELECT ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum LobbySelectLine {
    Ping,
    Pong,
    Back,
    Join(u32),
    Malformed,
}

pub fn parse_lobby_select(line: &str) -> LobbySelectLine {
    let rest = tag_body(line);
    if try_token(rest, "PI").is_some() {
        return LobbySelectLine::Ping;
    }
    if try_token(rest, "PO").is_some() {
        return LobbySelectLine::Pong;
    }
    if try_token(rest, "B").is_some() {
        return LobbySelectLine::Back;
    }
    if let Some(args) = try_token(rest, "J") {
        if let Ok(n) = args.trim().parse::<u32>() {
            if n > 0 {
                return LobbySelectLine::Join(n);
            }
        }
        return LobbySelectLine::Malformed;
    }
    LobbySelectLine::Malformed
}

// ── WAITING ──────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum WaitingLine {
    Ping,
    Pong,
    Back,
    /// Anything else: remove from lobby and disconnect.
    Other,
}

pub fn parse_waiting(line: &str) -> WaitingLine {
    let rest = tag_body(line);
    if try_token(rest, "PI").is_some() {
        return WaitingLine::Ping;
    }
    if try_token(rest, "PO").is_some() {
        return WaitingLine::Pong;
    }
    if try_token(rest, "B").is_some() {
        return WaitingLine::Back;
    }
    WaitingLine::Other
}

// ── POST_MATCH ─────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum PostMatchLine {
    Back,
    /// Stale H/S/PI/PO/YES from the tail end of a match: tolerated, no-op.
    Tolerated,
    Other,
}

pub fn parse_post_match(line: &str) -> PostMatchLine {
    let rest = tag_body(line);
    if try_token(rest, "B").is_some() {
        return PostMatchLine::Back;
    }
    if try_token(rest, "H").is_some()
        || try_token(rest, "S").is_some()
        || try_token(rest, "PI").is_some()
        || try_token(rest, "PO").is_some()
        || try_token(rest, "YES").is_some()
    {
        return PostMatchLine::Tolerated;
    }
    PostMatchLine::Other
}

// ── IN-MATCH (active player's turn) ─────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum ActiveTurnLine {
    Ping,
    Pong,
    /// Legacy waiting-phase acknowledgment, arriving late: ignored.
    Yes,
    BackRequest,
    Hit,
    Stand,
    /// Anything else: protocol violation, current player is disconnected.
    Other,
}

pub fn parse_active_turn(line: &str, own_name: &str) -> ActiveTurnLine {
    let rest = tag_body(line);
    if try_token(rest, "PI").is_some() {
        return ActiveTurnLine::Ping;
    }
    if try_token(rest, "PO").is_some() {
        return ActiveTurnLine::Pong;
    }
    if try_token(rest, "YES").is_some() {
        return ActiveTurnLine::Yes;
    }
    if is_back_request(rest, own_name) {
        return ActiveTurnLine::BackRequest;
    }
    if try_token(rest, "H").is_some() {
        return ActiveTurnLine::Hit;
    }
    if try_token(rest, "S").is_some() {
        return ActiveTurnLine::Stand;
    }
    ActiveTurnLine::Other
}

// ── IN-MATCH (non-active / waiting-for-reconnect player) ────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum NonActiveLine {
    Ping,
    Pong,
    Yes,
    BackRequest,
    /// Any attempt to act out of turn, or unrecognised input: a violation.
    Violation,
}

pub fn parse_non_active(line: &str, own_name: &str) -> NonActiveLine {
    let rest = tag_body(line);
    if try_token(rest, "PI").is_some() {
        return NonActiveLine::Ping;
    }
    if try_token(rest, "PO").is_some() {
        return NonActiveLine::Pong;
    }
    if try_token(rest, "YES").is_some() {
        return NonActiveLine::Yes;
    }
    if is_back_request(rest, own_name) {
        return NonActiveLine::BackRequest;
    }
    NonActiveLine::Violation
}

// ── SERVER -> CLIENT MESSAGE BUILDERS ───────────────────────────────────────
//
// Every builder returns a complete line, `\n`-terminated, ready to write.

pub fn ok() -> String {
    "C45OK\n".to_string()
}

pub fn wrong(reason: Option<&str>) -> String {
    match reason {
        Some(r) => format!("C45WRONG {r}\n"),
        None => "C45WRONG\n".to_string(),
    }
}

pub fn rec_ok() -> String {
    "C45REC_OK\n".to_string()
}

pub fn ping() -> String {
    "C45PI\n".to_string()
}

pub fn pong() -> String {
    "C45PO\n".to_string()
}

/// Lobby snapshot: `C45L <n> <2n-digit-pairs>\n`. Each lobby contributes a
/// player-count digit (clamped 0..9) followed by a running digit (0|1),
/// concatenated with no separator — a single-line form required under
/// high-fragmentation transports (§4.1).
pub fn snapshot(lobbies: &[(u8, bool)]) -> String {
    let mut pairs = String::with_capacity(lobbies.len() * 2);
    for &(count, running) in lobbies {
        pairs.push(char::from(b'0' + count.min(9)));
        pairs.push(if running { '1' } else { '0' });
    }
    format!("C45L {} {}\n", lobbies.len(), pairs)
}

pub fn deal(c1: Card, c2: Card) -> String {
    format!("C45DEAL {c1} {c2}\n")
}

pub fn card(c: Card) -> String {
    format!("C45CARD {c}\n")
}

pub fn turn(name: &str, seconds: u64) -> String {
    format!("C45TURN {name} {seconds}\n")
}

pub fn bust(name: &str, value: i32) -> String {
    format!("C45BUST {name} {value}\n")
}

pub fn timeout() -> String {
    "C45TIMEOUT\n".to_string()
}

pub fn opp_down(name: &str, seconds: u64) -> String {
    format!("C45OPPDOWN {name} {seconds}\n")
}

pub fn opp_back(name: &str) -> String {
    format!("C45OPPBACK {name}\n")
}

pub fn result(name0: &str, v0: i32, name1: &str, v1: i32, winner: &str) -> String {
    format!("C45RESULT {name0} {v0} {name1} {v1} WINNER {winner}\n")
}

pub fn down(reason: &str) -> String {
    format!("C45DOWN {reason}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_starting_with_a_token_is_not_misread_as_that_token() {
        // "PING" the handshake line "C45PING" must parse as a login named
        // "PING", not as the PI token, because the char after "PI" is "N".
        assert_eq!(parse_handshake("C45PING\n"), HandshakeLine::Login("PING".into()));
    }

    #[test]
    fn bare_pi_token_matches_exactly() {
        assert_eq!(parse_handshake("C45PI\n"), HandshakeLine::Ping);
    }

    #[test]
    fn reconnect_parses_name_and_index() {
        assert_eq!(
            parse_handshake("C45REC Alice 2\n"),
            HandshakeLine::Reconnect { name: "Alice".into(), lobby_idx: 2 }
        );
    }

    #[test]
    fn join_requires_space_and_rejects_attached_digit_legacy_form() {
        assert_eq!(parse_lobby_select("C45J 3\n"), LobbySelectLine::Join(3));
        // Legacy "C45J2" (no space) is the disputed form spec.md flags as an
        // open question; this crate's resolution rejects it as malformed.
        assert_eq!(parse_lobby_select("C45J2\n"), LobbySelectLine::Malformed);
    }

    #[test]
    fn back_request_matches_only_the_senders_own_name() {
        assert_eq!(parse_active_turn("C45Alback\n", "Al"), ActiveTurnLine::BackRequest);
        assert_eq!(parse_active_turn("C45Alback\n", "Bob"), ActiveTurnLine::Other);
    }

    #[test]
    fn snapshot_format_matches_happy_path_scenario() {
        assert_eq!(snapshot(&[(0, false)]), "C45L 1 00\n");
        assert_eq!(snapshot(&[(1, false)]), "C45L 1 10\n");
    }

    #[test]
    fn snapshot_clamps_overflowing_counts_to_a_single_digit() {
        assert_eq!(snapshot(&[(20, true)]), "C45L 1 91\n");
    }
}
