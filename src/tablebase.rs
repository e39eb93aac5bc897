//! Endgame tablebase lookups.
//! Queries the Lichess tablebase HTTP API for positions with few enough
//! pieces. Anything bigger is answered locally with an "unknown" entry.
//! Latency: 50-300ms (network dependent)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TablebaseError;
use crate::rules::piece_count;

pub const LICHESS_TABLEBASE_URL: &str = "https://tablebase.lichess.ovh";
/// Largest positions the public Syzygy tables cover.
pub const MAX_TABLEBASE_PIECES: usize = 7;
const MAX_API_RETRIES: u32 = 2;
const RETRY_DELAY_MS: u64 = 300;

// *************** Result type ***************

/// Tablebase verdict from the side to move's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TablebaseEntry {
    pub is_known: bool,
    /// 2 win, 1 cursed win, 0 draw, -1 blessed loss, -2 loss.
    pub win_draw_loss: Option<i8>,
    pub distance_to_zero: Option<i32>,
    pub category: String,
    /// Moves that keep the best achievable result, in UCI notation.
    pub best_moves: Vec<String>,
}

impl TablebaseEntry {
    pub fn unknown() -> Self {
        Self {
            category: "unknown".into(),
            ..Self::default()
        }
    }
}

/// Maps a Lichess category onto the win/draw/loss scale.
pub fn category_to_wdl(category: &str) -> Option<i8> {
    match category {
        "win" | "syzygy-win" => Some(2),
        "cursed-win" | "maybe-win" => Some(1),
        "draw" => Some(0),
        "blessed-loss" | "maybe-loss" => Some(-1),
        "loss" | "syzygy-loss" => Some(-2),
        _ => None,
    }
}

#[async_trait]
pub trait Tablebase: Send + Sync {
    async fn lookup(&self, fen: &str) -> Result<TablebaseEntry, TablebaseError>;
}

// *************** Lichess client ***************

#[derive(Deserialize)]
struct LichessResponse {
    category: String,
    dtz: Option<i32>,
    #[serde(default)]
    moves: Vec<LichessMove>,
}

#[derive(Deserialize)]
struct LichessMove {
    uci: String,
    category: String,
}

impl From<LichessResponse> for TablebaseEntry {
    fn from(response: LichessResponse) -> Self {
        let win_draw_loss = category_to_wdl(&response.category);
        // Moves are sorted best first; their category is from the opponent's side.
        let best_moves = match response.moves.first() {
            Some(best) => response
                .moves
                .iter()
                .take_while(|m| m.category == best.category)
                .map(|m| m.uci.clone())
                .collect(),
            None => Vec::new(),
        };
        TablebaseEntry {
            is_known: win_draw_loss.is_some(),
            win_draw_loss,
            distance_to_zero: response.dtz,
            category: response.category,
            best_moves,
        }
    }
}

pub struct LichessTablebase {
    client: Client,
    base_url: String,
    max_pieces: usize,
}

impl LichessTablebase {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TablebaseError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_pieces: MAX_TABLEBASE_PIECES,
        })
    }

    pub fn with_max_pieces(mut self, max_pieces: usize) -> Self {
        self.max_pieces = max_pieces;
        self
    }

    async fn call_api(&self, fen: &str) -> Result<TablebaseEntry, TablebaseError> {
        let response = self
            .client
            .get(format!("{}/standard", self.base_url))
            .query(&[("fen", fen)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TablebaseError::Status { status, body });
        }

        let parsed: LichessResponse = response.json().await?;
        Ok(parsed.into())
    }
}

#[async_trait]
impl Tablebase for LichessTablebase {
    async fn lookup(&self, fen: &str) -> Result<TablebaseEntry, TablebaseError> {
        let pieces = piece_count(fen).ok_or_else(|| TablebaseError::InvalidFen(fen.to_string()))?;
        if pieces > self.max_pieces {
            debug!(pieces, "too many pieces for tablebase");
            return Ok(TablebaseEntry::unknown());
        }

        let mut attempt = 1;
        loop {
            match self.call_api(fen).await {
                Ok(entry) => return Ok(entry),
                // Client errors will not improve on retry.
                Err(TablebaseError::Status { status, body }) if status < 500 => {
                    return Err(TablebaseError::Status { status, body });
                }
                Err(e) if attempt <= MAX_API_RETRIES => {
                    warn!(attempt, max = MAX_API_RETRIES + 1, error = %e, "tablebase lookup failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// *************** Tests ***************

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(category_to_wdl("win"), Some(2));
        assert_eq!(category_to_wdl("cursed-win"), Some(1));
        assert_eq!(category_to_wdl("draw"), Some(0));
        assert_eq!(category_to_wdl("blessed-loss"), Some(-1));
        assert_eq!(category_to_wdl("loss"), Some(-2));
        assert_eq!(category_to_wdl("unknown"), None);
    }

    #[test]
    fn test_response_conversion() {
        let json = r#"{
            "checkmate": false,
            "stalemate": false,
            "category": "win",
            "dtz": 1,
            "dtm": 17,
            "moves": [
                {"uci": "h7h8q", "san": "h8=Q+", "category": "loss", "dtz": -2},
                {"uci": "h7h8r", "san": "h8=R+", "category": "loss", "dtz": -2},
                {"uci": "a1a2", "san": "Ka2", "category": "draw", "dtz": 0}
            ]
        }"#;
        let response: LichessResponse = serde_json::from_str(json).unwrap();
        let entry = TablebaseEntry::from(response);
        assert!(entry.is_known);
        assert_eq!(entry.win_draw_loss, Some(2));
        assert_eq!(entry.distance_to_zero, Some(1));
        assert_eq!(entry.best_moves, vec!["h7h8q", "h7h8r"]);
    }

    #[test]
    fn test_unknown_category_is_not_known() {
        let response: LichessResponse =
            serde_json::from_str(r#"{"category": "unknown", "dtz": null}"#).unwrap();
        let entry = TablebaseEntry::from(response);
        assert!(!entry.is_known);
        assert!(entry.best_moves.is_empty());
    }

    #[tokio::test]
    async fn test_large_positions_skip_the_network() {
        // Nothing listens on port 9; any request would fail.
        let tablebase = LichessTablebase::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap();
        let entry = tablebase.lookup(crate::rules::START_FEN).await.unwrap();
        assert_eq!(entry, TablebaseEntry::unknown());
    }

    #[tokio::test]
    async fn test_invalid_fen_is_rejected() {
        let tablebase = LichessTablebase::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap();
        let err = tablebase.lookup("not a fen").await.unwrap_err();
        assert!(matches!(err, TablebaseError::InvalidFen(_)));
    }

    #[tokio::test]
    #[ignore = "requires network access to tablebase.lichess.ovh"]
    async fn test_lichess_lookup() {
        let tablebase = LichessTablebase::new(LICHESS_TABLEBASE_URL, Duration::from_secs(10)).unwrap();
        let entry = tablebase
            .lookup("4k3/6KP/8/8/8/8/7p/8 w - - 0 1")
            .await
            .unwrap();
        println!("Tablebase: {:?}", entry);
        assert!(entry.is_known);
    }
}
