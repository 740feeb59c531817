//! Cards, the ordered 52-card deck, and Blackjack hand valuation.
//!
//! Grounded on `examples/original_source/server/include/game.h` and
//! `server/src/game.c` (`deck_init`, `deck_shuffle`, `deck_draw`,
//! `hand_value`), ported to idiomatic Rust with `rand`'s Fisher–Yates
//! shuffle in place of `rand() % (i + 1)`.

use rand::seq::SliceRandom;
use rand::thread_rng;
use std::fmt;

pub const DECK_SIZE: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

impl Suit {
    const ALL: [Suit; 4] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    fn to_char(self) -> char {
        match self {
            Suit::Clubs => 'C',
            Suit::Diamonds => 'D',
            Suit::Hearts => 'H',
            Suit::Spades => 'S',
        }
    }

    fn from_char(c: char) -> Option<Suit> {
        match c {
            'C' => Some(Suit::Clubs),
            'D' => Some(Suit::Diamonds),
            'H' => Some(Suit::Hearts),
            'S' => Some(Suit::Spades),
            _ => None,
        }
    }
}

/// `rank` is 1..=13, where 1 is Ace and 11/12/13 are Jack/Queen/King.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    pub rank: u8,
    pub suit: Suit,
}

impl Card {
    fn rank_char(self) -> char {
        match self.rank {
            1 => 'A',
            2..=9 => (b'0' + self.rank) as char,
            10 => 'T',
            11 => 'J',
            12 => 'Q',
            13 => 'K',
            _ => unreachable!("rank out of 1..=13"),
        }
    }

    fn rank_from_char(c: char) -> Option<u8> {
        match c {
            'A' => Some(1),
            '2'..='9' => Some(c as u8 - b'0'),
            'T' => Some(10),
            'J' => Some(11),
            'Q' => Some(12),
            'K' => Some(13),
            _ => None,
        }
    }

    /// Parse a two-character wire token such as `"AS"` or `"TD"`.
    pub fn from_wire(s: &str) -> Option<Card> {
        let mut chars = s.chars();
        let rank = Self::rank_from_char(chars.next()?)?;
        let suit = Suit::from_char(chars.next()?)?;
        if chars.next().is_some() {
            return None;
        }
        Some(Card { rank, suit })
    }

    /// Blackjack point value before soft-ace demotion (face cards = 10, ace = 11).
    fn base_value(self) -> i32 {
        match self.rank {
            1 => 11,
            r if r >= 10 => 10,
            r => r as i32,
        }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank_char(), self.suit.to_char())
    }
}

/// Sum a hand's Blackjack value, demoting aces from 11 to 1 one at a time
/// while the total exceeds 21. This is the unique maximum value <= 21 when
/// one is reachable, else the minimum achievable value (§3, §8).
pub fn hand_value(cards: &[Card]) -> i32 {
    let mut total: i32 = cards.iter().map(|c| c.base_value()).sum();
    let mut soft_aces = cards.iter().filter(|c| c.rank == 1).count();
    while total > 21 && soft_aces > 0 {
        total -= 10;
        soft_aces -= 1;
    }
    total
}

/// Ordered sequence of up to 12 cards held by a player during a match.
#[derive(Debug, Clone, Default)]
pub struct Hand {
    cards: Vec<Card>,
}

impl Hand {
    pub fn new() -> Self {
        Self { cards: Vec::with_capacity(12) }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn clear(&mut self) {
        self.cards.clear();
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn value(&self) -> i32 {
        hand_value(&self.cards)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Ordered 52-card deck with a draw cursor. Reshuffles automatically once
/// the cursor reaches the end (§3, §4.2).
pub struct Deck {
    cards: [Card; DECK_SIZE],
    cursor: usize,
}

impl Deck {
    pub fn new() -> Self {
        let mut cards = [Card { rank: 1, suit: Suit::Clubs }; DECK_SIZE];
        let mut i = 0;
        for suit in Suit::ALL {
            for rank in 1..=13u8 {
                cards[i] = Card { rank, suit };
                i += 1;
            }
        }
        Self { cards, cursor: 0 }
    }

    pub fn shuffle(&mut self) {
        self.cards.shuffle(&mut thread_rng());
        self.cursor = 0;
    }

    /// Draw one card, reshuffling first if the deck is exhausted.
    pub fn draw(&mut self) -> Card {
        if self.cursor == DECK_SIZE {
            self.shuffle();
        }
        let card = self.cards[self.cursor];
        self.cursor += 1;
        card
    }
}

impl Default for Deck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_for_every_card() {
        for suit in Suit::ALL {
            for rank in 1..=13u8 {
                let card = Card { rank, suit };
                let wire = card.to_string();
                assert_eq!(wire.len(), 2);
                let parsed = Card::from_wire(&wire).expect("parses back");
                assert_eq!(parsed.rank, card.rank);
                assert_eq!(parsed.suit, card.suit);
            }
        }
    }

    #[test]
    fn ace_counts_as_eleven_until_bust_risk() {
        let cards = [Card { rank: 1, suit: Suit::Clubs }, Card { rank: 9, suit: Suit::Spades }];
        assert_eq!(hand_value(&cards), 20);
    }

    #[test]
    fn soft_ace_demotes_exactly_enough_to_avoid_busting() {
        let cards = [
            Card { rank: 1, suit: Suit::Clubs },
            Card { rank: 1, suit: Suit::Diamonds },
            Card { rank: 9, suit: Suit::Spades },
        ];
        // 11 + 11 + 9 = 31 -> demote one ace -> 21
        assert_eq!(hand_value(&cards), 21);
    }

    #[test]
    fn two_aces_and_a_face_busts_even_after_full_demotion() {
        let cards = [
            Card { rank: 1, suit: Suit::Clubs },
            Card { rank: 1, suit: Suit::Diamonds },
            Card { rank: 13, suit: Suit::Spades },
            Card { rank: 13, suit: Suit::Hearts },
        ];
        // 11 + 11 + 10 + 10 = 42 -> both aces demoted -> 1 + 1 + 10 + 10 = 22
        assert_eq!(hand_value(&cards), 22);
    }

    #[test]
    fn deck_reshuffles_after_fifty_two_draws() {
        let mut deck = Deck::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..DECK_SIZE {
            let c = deck.draw();
            assert!(seen.insert((c.rank, c.suit.to_char())), "no duplicate before reshuffle");
        }
        // 53rd draw triggers an automatic reshuffle and cursor reset.
        let _ = deck.draw();
        assert_eq!(deck.cursor, 1);
    }

    #[test]
    fn appending_a_non_ace_card_never_decreases_value() {
        let mut hand = Hand::new();
        hand.push(Card { rank: 5, suit: Suit::Clubs });
        let before = hand.value();
        hand.push(Card { rank: 6, suit: Suit::Diamonds });
        assert!(hand.value() >= before);
    }
}
