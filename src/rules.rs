//! Chess rules collaborator.
//! The orchestration layer never interprets positions itself; it asks a
//! [`ChessRules`] implementation to load FENs and apply moves. The shipped
//! implementation is backed by shakmaty.

use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position};
use tracing::debug;

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// A move as the UI submits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
    pub promotion: Option<char>,
}

impl MoveRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            promotion: None,
        }
    }

    pub fn with_promotion(mut self, piece: char) -> Self {
        self.promotion = Some(piece);
        self
    }

    /// `e7e8q` style notation.
    pub fn to_uci(&self) -> String {
        let mut uci = format!("{}{}", self.from, self.to);
        if let Some(piece) = self.promotion {
            uci.push(piece.to_ascii_lowercase());
        }
        uci
    }
}

/// A move that was accepted, with the resulting position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMove {
    pub uci: String,
    pub san: String,
    pub fen: String,
}

pub trait ChessRules: Send {
    /// FEN of the current position.
    fn current_position(&self) -> String;

    /// Replaces the position. Returns false and keeps the old one if `fen` is invalid.
    fn load_position(&mut self, fen: &str) -> bool;

    /// Plays a move if it is legal.
    fn apply_move(&mut self, mv: &MoveRequest) -> Option<AppliedMove>;

    fn reset(&mut self) {
        self.load_position(START_FEN);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShakmatyRules {
    position: Chess,
}

impl ShakmatyRules {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChessRules for ShakmatyRules {
    fn current_position(&self) -> String {
        to_fen(&self.position)
    }

    fn load_position(&mut self, fen: &str) -> bool {
        match parse_position(fen) {
            Some(position) => {
                self.position = position;
                true
            }
            None => {
                debug!(%fen, "rejected invalid FEN");
                false
            }
        }
    }

    fn apply_move(&mut self, mv: &MoveRequest) -> Option<AppliedMove> {
        let uci = mv.to_uci();
        let legal = UciMove::from_ascii(uci.as_bytes())
            .ok()?
            .to_move(&self.position)
            .ok()?;

        let uci = legal.to_uci(CastlingMode::Standard).to_string();
        let san = San::from_move(&self.position, legal.clone()).to_string();
        self.position.play_unchecked(legal);

        Some(AppliedMove {
            uci,
            san,
            fen: to_fen(&self.position),
        })
    }
}

/// Parses and validates a FEN into a playable position.
pub fn parse_position(fen: &str) -> Option<Chess> {
    let parsed = Fen::from_ascii(fen.trim().as_bytes()).ok()?;
    parsed.into_position(CastlingMode::Standard).ok()
}

/// Number of pieces on the board described by `fen`, kings included.
pub fn piece_count(fen: &str) -> Option<usize> {
    let parsed = Fen::from_ascii(fen.trim().as_bytes()).ok()?;
    Some(parsed.as_setup().board.occupied().count())
}

fn to_fen(position: &Chess) -> String {
    Fen::from_position(position, EnPassantMode::Legal).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_from_initial_position() {
        let rules = ShakmatyRules::new();
        assert_eq!(rules.current_position(), START_FEN);
    }

    #[test]
    fn test_apply_legal_move() {
        let mut rules = ShakmatyRules::new();
        let applied = rules.apply_move(&MoveRequest::new("e2", "e4")).unwrap();
        assert_eq!(applied.uci, "e2e4");
        assert_eq!(applied.san, "e4");
        assert_eq!(
            applied.fen,
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1"
        );
        assert_eq!(rules.current_position(), applied.fen);
    }

    #[test]
    fn test_illegal_move_leaves_position() {
        let mut rules = ShakmatyRules::new();
        assert!(rules.apply_move(&MoveRequest::new("e2", "e5")).is_none());
        assert!(rules.apply_move(&MoveRequest::new("z9", "e4")).is_none());
        assert_eq!(rules.current_position(), START_FEN);
    }

    #[test]
    fn test_promotion() {
        let mut rules = ShakmatyRules::new();
        assert!(rules.load_position("8/4P3/8/8/8/8/k7/4K3 w - - 0 1"));
        let applied = rules
            .apply_move(&MoveRequest::new("e7", "e8").with_promotion('Q'))
            .unwrap();
        assert_eq!(applied.uci, "e7e8q");
        assert_eq!(applied.san, "e8=Q");
    }

    #[test]
    fn test_invalid_fen_is_rejected() {
        let mut rules = ShakmatyRules::new();
        assert!(!rules.load_position("not a fen"));
        // Two white kings.
        assert!(!rules.load_position("4k3/8/8/8/8/8/8/K3K3 w - - 0 1"));
        assert_eq!(rules.current_position(), START_FEN);
    }

    #[test]
    fn test_reset() {
        let mut rules = ShakmatyRules::new();
        rules.apply_move(&MoveRequest::new("g1", "f3")).unwrap();
        rules.reset();
        assert_eq!(rules.current_position(), START_FEN);
    }

    #[test]
    fn test_piece_count() {
        assert_eq!(piece_count(START_FEN), Some(32));
        assert_eq!(piece_count("8/8/8/8/8/8/k7/4K2R w K - 0 1"), Some(3));
        assert_eq!(piece_count("garbage"), None);
    }
}
