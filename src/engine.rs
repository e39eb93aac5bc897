//! Engine module.
//! Inputs FEN string, loads it into the service, asks for the best move and
//! an evaluation, and formats the result for the terminal ("+1.20", "Mate in 3").
//! Positions small enough for the tablebase also get a tablebase verdict.
//! Latency: movetime plus eval depth, typically 1-2s with default config.

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::protocol::Evaluation;
use crate::rules::piece_count;
use crate::service::EngineService;
use crate::tablebase::{MAX_TABLEBASE_PIECES, TablebaseEntry};

/// Everything we found out about one position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub fen: String,
    pub best_move: Option<String>,
    pub ponder: Option<String>,
    pub evaluation: Option<Evaluation>,
    pub tablebase: Option<TablebaseEntry>,
}

impl Analysis {
    /// (best_move, eval) as printed by the CLI.
    pub fn summary(&self) -> (String, String) {
        let best_move = self.best_move.clone().unwrap_or_else(|| "(none)".to_string());
        let eval = self
            .evaluation
            .as_ref()
            .map(format_evaluation)
            .unwrap_or_else(|| "unavailable".to_string());
        (best_move, eval)
    }
}

/// Analyzes the position from FEN.
pub async fn analyze(service: &EngineService, fen: &str, use_tablebase: bool) -> Result<Analysis> {
    let fen = fen.trim();
    let loaded = service
        .set_position(fen)
        .await
        .context("Failed to load position")?;
    if !loaded {
        bail!("Invalid FEN: {}", fen);
    }

    let best = service
        .get_best_move()
        .await
        .context("Failed to search best move")?;
    let mut analysis = Analysis {
        fen: fen.to_string(),
        ..Analysis::default()
    };
    if let Some(best) = best {
        analysis.best_move = best.uci;
        analysis.ponder = best.ponder;
        analysis.evaluation = best.evaluation;
    }

    let small = piece_count(fen).is_some_and(|n| n <= MAX_TABLEBASE_PIECES);
    if use_tablebase && small {
        let dual = service
            .get_dual_evaluation(fen)
            .await
            .context("Failed to run dual evaluation")?;
        if dual.engine.is_some() {
            analysis.evaluation = dual.engine;
        }
        analysis.tablebase = dual.tablebase;
    }

    Ok(analysis)
}

/// Analyzes the position from FEN, returns (best_move as String, eval as String e.g. "+1.20" or "Mate in 3")
pub async fn analyze_position(service: &EngineService, fen: &str) -> Result<(String, String)> {
    Ok(analyze(service, fen, false).await?.summary())
}

/// Renders an evaluation from the side to move's point of view.
pub fn format_evaluation(evaluation: &Evaluation) -> String {
    match evaluation.mate {
        Some(0) => "Checkmate".to_string(),
        Some(n) if n > 0 => format!("Mate in {}", n),
        Some(n) => format!("Mated in {}", -n),
        None => format!("{:+.2}", evaluation.score as f64 / 100.0),
    }
}

/// One-line tablebase verdict, e.g. "win (DTZ 3)".
pub fn format_tablebase(entry: &TablebaseEntry) -> String {
    if !entry.is_known {
        return "unknown".to_string();
    }
    match entry.distance_to_zero {
        Some(dtz) => format!("{} (DTZ {})", entry.category, dtz.abs()),
        None => entry.category.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rules::{ShakmatyRules, START_FEN};
    use crate::testing::FakeEngine;
    use std::sync::Arc;

    fn eval(score: i32, mate: Option<i32>) -> Evaluation {
        Evaluation {
            score,
            mate,
            ..Evaluation::default()
        }
    }

    #[test]
    fn test_format_centipawns() {
        assert_eq!(format_evaluation(&eval(120, None)), "+1.20");
        assert_eq!(format_evaluation(&eval(-35, None)), "-0.35");
        assert_eq!(format_evaluation(&eval(0, None)), "+0.00");
    }

    #[test]
    fn test_format_mates() {
        assert_eq!(format_evaluation(&eval(10_000, Some(3))), "Mate in 3");
        assert_eq!(format_evaluation(&eval(-10_000, Some(-2))), "Mated in 2");
        assert_eq!(format_evaluation(&eval(-10_000, Some(0))), "Checkmate");
    }

    #[test]
    fn test_format_tablebase() {
        let entry = TablebaseEntry {
            is_known: true,
            win_draw_loss: Some(-2),
            distance_to_zero: Some(-7),
            category: "loss".into(),
            best_moves: Vec::new(),
        };
        assert_eq!(format_tablebase(&entry), "loss (DTZ 7)");
        assert_eq!(format_tablebase(&TablebaseEntry::unknown()), "unknown");
    }

    #[tokio::test]
    async fn test_engine_startpos() {
        let mut config = Config::default();
        config.search.move_time_ms = 20;
        let service = EngineService::new(
            config,
            Arc::new(FakeEngine::new()),
            Box::new(ShakmatyRules::new()),
            None,
        );

        let (mv, eval) = analyze_position(&service, START_FEN).await.unwrap();
        assert_eq!(mv, "e2e4");
        assert_eq!(eval, "+0.25");
    }

    #[tokio::test]
    async fn test_invalid_fen_is_an_error() {
        let service = EngineService::new(
            Config::default(),
            Arc::new(FakeEngine::new()),
            Box::new(ShakmatyRules::new()),
            None,
        );
        let err = analyze_position(&service, "8/8/8/8 w - - 0 1").await.unwrap_err();
        assert!(err.to_string().contains("Invalid FEN"));
    }
}
