//! The fixed-size lobby pool (§3, §4.4): each lobby owns a deck, up to two
//! player slots, a running flag, and a lock.
//!
//! Grounded on `examples/original_source/server/include/game.h`'s `Lobby`/
//! `Player` structs and `server/src/game.c`'s `lobby_try_add_player`,
//! `lobby_attach_fd`, `lobby_name_exists`, `lobby_remove_player_by_name`,
//! `start_game_if_ready` — reshaped from a `pthread_mutex_t` per lobby plus
//! raw `fd`s into a `std::sync::Mutex` per lobby plus explicit handoff
//! channels for socket ownership transfer (§9: "socket ownership transfers
//! ... modeled as explicit handoffs, not shared ownership").

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot, watch};

use crate::conn::{Conn, ConnId};
use crate::deck::{Card, Deck, Hand};
use crate::error::LobbyError;

/// A `Conn` in flight between a session task and the match task that
/// currently owns a seat, paired with the channel the match task uses to
/// hand the `Conn` back once the match ends (or the seat is vacated).
pub type ConnHandoff = (Conn, oneshot::Sender<Conn>);

struct PlayerSlot {
    name: Option<String>,
    conn_id: Option<ConnId>,
    hand: Hand,
    stood: bool,
    busted: bool,
    /// Fired by a superseding session during `try_takeover_waiting` to wake
    /// a stale pre-match WAITING session so it can close its own socket.
    supersede: Option<oneshot::Sender<()>>,
}

impl PlayerSlot {
    fn empty() -> Self {
        Self { name: None, conn_id: None, hand: Hand::new(), stood: false, busted: false, supersede: None }
    }

    fn matches(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

struct LobbyState {
    slots: [PlayerSlot; 2],
    running: bool,
    deck: Deck,
    handoff_tx: [Option<mpsc::UnboundedSender<ConnHandoff>>; 2],
}

impl LobbyState {
    fn connected_count(&self) -> u8 {
        self.slots.iter().filter(|s| s.conn_id.is_some()).count() as u8
    }
}

/// Receivers the match task reads from to obtain both players' `Conn`s,
/// both at kickoff and for any later reconnect during the match.
pub struct MatchHandoffs {
    pub rx: [mpsc::UnboundedReceiver<ConnHandoff>; 2],
}

pub struct Lobby {
    state: Mutex<LobbyState>,
    running_tx: watch::Sender<bool>,
}

impl Lobby {
    fn new() -> Self {
        let (running_tx, _rx) = watch::channel(false);
        Self {
            state: Mutex::new(LobbyState {
                slots: [PlayerSlot::empty(), PlayerSlot::empty()],
                running: false,
                deck: Deck::new(),
                handoff_tx: [None, None],
            }),
            running_tx,
        }
    }
}

pub struct LobbyPool {
    lobbies: Vec<Lobby>,
}

impl LobbyPool {
    pub fn new(count: usize) -> Self {
        Self { lobbies: (0..count).map(|_| Lobby::new()).collect() }
    }

    pub fn count(&self) -> usize {
        self.lobbies.len()
    }

    fn lobby(&self, idx: usize) -> Result<&Lobby, LobbyError> {
        self.lobbies.get(idx).ok_or(LobbyError::BadIndex)
    }

    /// A compact snapshot for `C45L`: `(connected_count, running)` per lobby.
    pub fn snapshot(&self) -> Vec<(u8, bool)> {
        self.lobbies
            .iter()
            .map(|l| {
                let st = l.state.lock().unwrap();
                (st.connected_count(), st.running)
            })
            .collect()
    }

    pub fn subscribe_running(&self, idx: usize) -> Result<watch::Receiver<bool>, LobbyError> {
        Ok(self.lobby(idx)?.running_tx.subscribe())
    }

    /// Reserve the first empty slot for `name` (§4.4 `try_add`).
    pub fn try_add(&self, idx: usize, name: &str) -> Result<(), LobbyError> {
        let lobby = self.lobby(idx)?;
        let mut st = lobby.state.lock().unwrap();
        match st.slots.iter_mut().find(|s| s.name.is_none()) {
            Some(slot) => {
                slot.name = Some(name.to_string());
                Ok(())
            }
            None => Err(LobbyError::Full),
        }
    }

    /// Bind a live connection to a player already reserved in a slot, and
    /// install that session's supersede channel (§4.4 `attach_fd`).
    pub fn attach_fd(
        &self,
        idx: usize,
        name: &str,
        conn_id: ConnId,
        supersede: oneshot::Sender<()>,
    ) -> Result<(), LobbyError> {
        let lobby = self.lobby(idx)?;
        let mut st = lobby.state.lock().unwrap();
        match st.slots.iter_mut().find(|s| s.matches(name)) {
            Some(slot) => {
                slot.conn_id = Some(conn_id);
                slot.supersede = Some(supersede);
                Ok(())
            }
            None => Err(LobbyError::BadIndex),
        }
    }

    /// Reconnect into a *running* match: succeeds only if a slot with this
    /// name currently has no socket (§4.4 `try_reconnect`). Returns the
    /// sender the caller uses to push its `Conn` into the match task.
    pub fn try_reconnect(
        &self,
        idx: usize,
        name: &str,
        conn_id: ConnId,
    ) -> Option<mpsc::UnboundedSender<ConnHandoff>> {
        let lobby = self.lobbies.get(idx)?;
        let mut st = lobby.state.lock().unwrap();
        if !st.running {
            return None;
        }
        let slot_idx = st.slots.iter().position(|s| s.matches(name) && s.conn_id.is_none())?;
        st.slots[slot_idx].conn_id = Some(conn_id);
        st.handoff_tx[slot_idx].clone()
    }

    /// Take over a name's seat in a lobby that has *not* started yet (§4.4
    /// `try_takeover_waiting`). Wakes the superseded session so it closes
    /// its own stale socket, then installs the new session's connection.
    ///
    /// On failure the sender is handed back so the caller can retry it
    /// against the next candidate lobby without constructing a new one.
    pub fn try_takeover_waiting(
        &self,
        idx: usize,
        name: &str,
        conn_id: ConnId,
        supersede: oneshot::Sender<()>,
    ) -> Result<(), oneshot::Sender<()>> {
        let Some(lobby) = self.lobbies.get(idx) else { return Err(supersede) };
        let mut st = lobby.state.lock().unwrap();
        if st.running {
            return Err(supersede);
        }
        let Some(slot_idx) = st.slots.iter().position(|s| s.matches(name)) else { return Err(supersede) };
        if let Some(old) = st.slots[slot_idx].supersede.take() {
            let _ = old.send(());
        }
        st.slots[slot_idx].conn_id = Some(conn_id);
        st.slots[slot_idx].supersede = Some(supersede);
        Ok(())
    }

    /// Get this slot's handoff sender after the transition to running has
    /// already been observed (the WAITING session's path into the match).
    pub fn handoff_sender(&self, idx: usize, name: &str) -> Option<mpsc::UnboundedSender<ConnHandoff>> {
        let lobby = self.lobbies.get(idx)?;
        let st = lobby.state.lock().unwrap();
        let slot_idx = st.slots.iter().position(|s| s.matches(name))?;
        st.handoff_tx[slot_idx].clone()
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.lobbies.iter().any(|l| l.state.lock().unwrap().slots.iter().any(|s| s.matches(name)))
    }

    /// Remove a name's slot, but only if it is still owned by `conn_id`
    /// (guards against a reconnect race) (§4.4 `remove_by_name_if_fd`).
    pub fn remove_by_name_if_fd(&self, name: &str, conn_id: ConnId) -> bool {
        for lobby in &self.lobbies {
            let mut st = lobby.state.lock().unwrap();
            if let Some(slot) = st.slots.iter_mut().find(|s| s.matches(name)) {
                if slot.conn_id == Some(conn_id) {
                    *slot = PlayerSlot::empty();
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Atomic compare-and-set `running` 0->1 when full; idempotent (§4.4
    /// `start_if_ready`, §8 "idempotent"). On success, stores per-slot
    /// handoff channels and notifies the WAITING session so both sides
    /// observe the transition before the match task deals.
    pub fn start_if_ready(&self, idx: usize) -> Option<MatchHandoffs> {
        let lobby = self.lobbies.get(idx)?;
        let mut st = lobby.state.lock().unwrap();
        if st.running || st.connected_count() != 2 {
            return None;
        }
        st.running = true;
        let (tx0, rx0) = mpsc::unbounded_channel();
        let (tx1, rx1) = mpsc::unbounded_channel();
        st.handoff_tx = [Some(tx0), Some(tx1)];
        drop(st);
        let _ = lobby.running_tx.send(true);
        Some(MatchHandoffs { rx: [rx0, rx1] })
    }

    // ── match-task-only operations, all under the lobby lock ────────────

    pub fn player_name(&self, idx: usize, slot: usize) -> String {
        let lobby = &self.lobbies[idx];
        let st = lobby.state.lock().unwrap();
        st.slots[slot].name.clone().unwrap_or_default()
    }

    pub fn deal_initial(&self, idx: usize) -> [Card; 4] {
        let lobby = &self.lobbies[idx];
        let mut st = lobby.state.lock().unwrap();
        st.deck.shuffle();
        for slot in &mut st.slots {
            slot.hand.clear();
            slot.stood = false;
            slot.busted = false;
        }
        // Strict dealing order: slot 0 card 1, slot 1 card 1, slot 0 card 2, slot 1 card 2.
        let a1 = st.deck.draw();
        let b1 = st.deck.draw();
        let a2 = st.deck.draw();
        let b2 = st.deck.draw();
        st.slots[0].hand.push(a1);
        st.slots[1].hand.push(b1);
        st.slots[0].hand.push(a2);
        st.slots[1].hand.push(b2);
        [a1, a2, b1, b2]
    }

    /// Draw one card for `slot`, returning it plus the post-draw value and
    /// whether this draw just busted the hand.
    pub fn hit(&self, idx: usize, slot: usize) -> (Card, i32, bool) {
        let lobby = &self.lobbies[idx];
        let mut st = lobby.state.lock().unwrap();
        let card = st.deck.draw();
        st.slots[slot].hand.push(card);
        let value = st.slots[slot].hand.value();
        let busted = value > 21;
        if busted {
            st.slots[slot].busted = true;
        }
        (card, value, busted)
    }

    pub fn stand(&self, idx: usize, slot: usize) {
        let lobby = &self.lobbies[idx];
        lobby.state.lock().unwrap().slots[slot].stood = true;
    }

    pub fn is_stood_or_busted(&self, idx: usize, slot: usize) -> bool {
        let lobby = &self.lobbies[idx];
        let st = lobby.state.lock().unwrap();
        st.slots[slot].stood || st.slots[slot].busted
    }

    pub fn hand_cards(&self, idx: usize, slot: usize) -> Vec<Card> {
        let lobby = &self.lobbies[idx];
        lobby.state.lock().unwrap().slots[slot].hand.cards().to_vec()
    }

    /// Final value for settlement: -1 if busted, else the hand's Blackjack value.
    pub fn settlement_value(&self, idx: usize, slot: usize) -> i32 {
        let lobby = &self.lobbies[idx];
        let st = lobby.state.lock().unwrap();
        if st.slots[slot].busted {
            -1
        } else {
            st.slots[slot].hand.value()
        }
    }

    pub fn mark_disconnected(&self, idx: usize, slot: usize) {
        let lobby = &self.lobbies[idx];
        lobby.state.lock().unwrap().slots[slot].conn_id = None;
    }

    /// End the match: flip running back to false, clear both slots.
    pub fn end_match(&self, idx: usize) {
        let lobby = &self.lobbies[idx];
        let mut st = lobby.state.lock().unwrap();
        st.running = false;
        st.slots = [PlayerSlot::empty(), PlayerSlot::empty()];
        st.handoff_tx = [None, None];
        drop(st);
        let _ = lobby.running_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_add_fills_first_empty_slot_then_reports_full() {
        let pool = LobbyPool::new(1);
        pool.try_add(0, "alice").unwrap();
        pool.try_add(0, "bob").unwrap();
        assert_eq!(pool.try_add(0, "carol"), Err(LobbyError::Full));
    }

    #[test]
    fn bad_index_is_reported_distinctly_from_full() {
        let pool = LobbyPool::new(1);
        assert_eq!(pool.try_add(5, "alice"), Err(LobbyError::BadIndex));
    }

    #[test]
    fn start_if_ready_is_idempotent_until_slots_are_connected() {
        let pool = LobbyPool::new(1);
        pool.try_add(0, "alice").unwrap();
        pool.try_add(0, "bob").unwrap();
        assert!(pool.start_if_ready(0).is_none(), "no one has attached a socket yet");

        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        pool.attach_fd(0, "alice", ConnId::from_raw(1), tx_a).unwrap();
        pool.attach_fd(0, "bob", ConnId::from_raw(2), tx_b).unwrap();

        assert!(pool.start_if_ready(0).is_some());
        // A second caller observing "now full" must get no second match spawned.
        assert!(pool.start_if_ready(0).is_none());
    }

    #[test]
    fn deal_initial_preserves_global_deal_order() {
        let pool = LobbyPool::new(1);
        pool.try_add(0, "alice").unwrap();
        pool.try_add(0, "bob").unwrap();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        pool.attach_fd(0, "alice", ConnId::from_raw(1), tx_a).unwrap();
        pool.attach_fd(0, "bob", ConnId::from_raw(2), tx_b).unwrap();
        pool.start_if_ready(0).unwrap();

        let [a1, a2, b1, b2] = pool.deal_initial(0);
        let a_hand = pool.hand_cards(0, 0);
        let b_hand = pool.hand_cards(0, 1);
        assert_eq!(a_hand, vec![a1, a2]);
        assert_eq!(b_hand, vec![b1, b2]);
    }

    #[test]
    fn remove_by_name_if_fd_guards_against_reconnect_race() {
        let pool = LobbyPool::new(1);
        pool.try_add(0, "alice").unwrap();
        let (tx, _rx) = oneshot::channel();
        pool.attach_fd(0, "alice", ConnId::from_raw(1), tx).unwrap();

        // A stale id must not be able to evict a slot now owned by someone else.
        assert!(!pool.remove_by_name_if_fd("alice", ConnId::from_raw(99)));
        assert!(pool.name_exists("alice"));
        assert!(pool.remove_by_name_if_fd("alice", ConnId::from_raw(1)));
        assert!(!pool.name_exists("alice"));
    }
}
