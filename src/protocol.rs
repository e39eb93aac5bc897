//! UCI protocol layer.
//! Parses lines printed by the engine into typed responses and renders the
//! commands we send back. Everything in here is pure: no I/O, no state beyond
//! the line being parsed, so it can be tested with literal protocol strings.
//!
//! Duplicate keywords inside one `info` line resolve to the last occurrence.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ProtocolError;

/// Display score used for forced mates, signed like the mate distance.
pub const MATE_SCORE: i32 = 10_000;

// *************** Inbound types ***************

/// Whether the engine reported an exact score or only a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBound {
    Lower,
    Upper,
}

/// Everything one `info` line can tell us. Absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoFragment {
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    /// Centipawns, or +/-[`MATE_SCORE`] when `mate` is set.
    pub score: Option<i32>,
    pub mate: Option<i32>,
    pub bound: Option<ScoreBound>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub time: Option<u64>,
    pub hashfull: Option<u32>,
    pub multipv: Option<u32>,
    pub currmove: Option<String>,
    pub currmovenumber: Option<u32>,
    pub pv: Option<Vec<String>>,
    pub string: Option<String>,
}

impl InfoFragment {
    /// True if the line carries search results rather than progress chatter.
    pub fn has_evaluation(&self) -> bool {
        self.score.is_some() || self.pv.is_some()
    }
}

/// Terminal `bestmove` signal. `best` is `None` for `(none)`, which engines
/// print when the position has no legal moves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BestMoveSignal {
    pub best: Option<String>,
    pub ponder: Option<String>,
}

/// An `option` advertised by the engine during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOption {
    pub name: String,
    pub kind: Option<String>,
    pub default: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub vars: Vec<String>,
}

impl EngineOption {
    pub fn value(&self) -> Option<&str> {
        self.default.as_deref()
    }
}

/// Closed set of things the engine can say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineResponse {
    UciOk,
    ReadyOk,
    Id { key: String, value: String },
    Info(InfoFragment),
    BestMove(BestMoveSignal),
    Option(EngineOption),
    Other(String),
}

/// Accumulated evaluation for one search (or one line of a multi-PV search).
///
/// Built up from successive [`InfoFragment`]s; later fragments overwrite the
/// fields they carry and leave the rest alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Centipawns from the side to move, or +/-[`MATE_SCORE`] for mates.
    pub score: i32,
    pub mate: Option<i32>,
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub time: Option<u64>,
    pub hashfull: Option<u32>,
    pub pv: Vec<String>,
    pub multipv: Option<u32>,
}

impl Evaluation {
    pub fn from_fragment(fragment: &InfoFragment) -> Self {
        let mut eval = Evaluation::default();
        eval.merge(fragment);
        eval
    }

    pub fn merge(&mut self, fragment: &InfoFragment) {
        if let Some(score) = fragment.score {
            self.score = score;
            self.mate = fragment.mate;
        }
        if fragment.depth.is_some() {
            self.depth = fragment.depth;
        }
        if fragment.seldepth.is_some() {
            self.seldepth = fragment.seldepth;
        }
        if fragment.nodes.is_some() {
            self.nodes = fragment.nodes;
        }
        if fragment.nps.is_some() {
            self.nps = fragment.nps;
        }
        if fragment.time.is_some() {
            self.time = fragment.time;
        }
        if fragment.hashfull.is_some() {
            self.hashfull = fragment.hashfull;
        }
        if fragment.multipv.is_some() {
            self.multipv = fragment.multipv;
        }
        if let Some(pv) = &fragment.pv {
            self.pv = pv.clone();
        }
    }

    pub fn is_mate(&self) -> bool {
        self.mate.is_some()
    }

    /// First move of the principal variation.
    pub fn best_move(&self) -> Option<&str> {
        self.pv.first().map(String::as_str)
    }
}

// *************** Parsing ***************

/// Parses an `info` line. Returns `Ok(None)` for any other kind of line.
pub fn parse_info_line(line: &str) -> Result<Option<InfoFragment>, ProtocolError> {
    check_line(line)?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"info") {
        return Ok(None);
    }

    let mut fragment = InfoFragment::default();

    // `string` swallows the rest of the line as free text.
    let keyword_end = match tokens.iter().position(|t| *t == "string") {
        Some(idx) => {
            fragment.string = Some(tokens[idx + 1..].join(" "));
            idx
        }
        None => tokens.len(),
    };
    let region = &tokens[1..keyword_end];

    let scan = match region.iter().rposition(|t| *t == "pv") {
        Some(idx) => {
            fragment.pv = Some(
                region[idx + 1..]
                    .iter()
                    .filter(|t| !t.is_empty())
                    .map(|t| t.to_string())
                    .collect(),
            );
            &region[..idx]
        }
        None => region,
    };

    let mut last_cp: Option<i32> = None;
    let mut last_mate: Option<i32> = None;
    let mut i = 0;
    while i < scan.len() {
        match scan[i] {
            "depth" => {
                fragment.depth = Some(number(scan, i, "depth")?);
                i += 2;
            }
            "seldepth" => {
                fragment.seldepth = Some(number(scan, i, "seldepth")?);
                i += 2;
            }
            "nodes" => {
                fragment.nodes = Some(number(scan, i, "nodes")?);
                i += 2;
            }
            "nps" => {
                fragment.nps = Some(number(scan, i, "nps")?);
                i += 2;
            }
            "time" => {
                fragment.time = Some(number(scan, i, "time")?);
                i += 2;
            }
            "hashfull" => {
                fragment.hashfull = Some(number(scan, i, "hashfull")?);
                i += 2;
            }
            "multipv" => {
                fragment.multipv = Some(number(scan, i, "multipv")?);
                i += 2;
            }
            "currmovenumber" => {
                fragment.currmovenumber = Some(number(scan, i, "currmovenumber")?);
                i += 2;
            }
            "currmove" => {
                fragment.currmove = Some(value(scan, i, "currmove")?.to_string());
                i += 2;
            }
            "score" => {
                i += 1;
                match scan.get(i).copied() {
                    Some("cp") => {
                        last_cp = Some(number(scan, i, "cp")?);
                        i += 2;
                    }
                    Some("mate") => {
                        last_mate = Some(number(scan, i, "mate")?);
                        i += 2;
                    }
                    _ => {}
                }
                while let Some(bound) = scan.get(i).copied() {
                    match bound {
                        "lowerbound" => fragment.bound = Some(ScoreBound::Lower),
                        "upperbound" => fragment.bound = Some(ScoreBound::Upper),
                        _ => break,
                    }
                    i += 1;
                }
            }
            // tbhits, cpuload, refutation and friends are not tracked
            _ => i += 1,
        }
    }

    if let Some(mate) = last_mate {
        fragment.mate = Some(mate);
        fragment.score = Some(mate_to_score(mate));
    } else if let Some(cp) = last_cp {
        fragment.score = Some(cp);
    }

    Ok(Some(fragment))
}

/// Parses a `bestmove` line. Returns `Ok(None)` for any other kind of line.
pub fn parse_best_move(line: &str) -> Result<Option<BestMoveSignal>, ProtocolError> {
    check_line(line)?;
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("bestmove") {
        return Ok(None);
    }

    let best = match tokens.next() {
        None => return Err(ProtocolError::MissingMove),
        Some(mv) => real_move(mv),
    };

    let mut ponder = None;
    while let Some(token) = tokens.next() {
        if token == "ponder" {
            ponder = tokens.next().and_then(real_move);
        }
    }

    Ok(Some(BestMoveSignal { best, ponder }))
}

/// Parses an `option` line. Returns `Ok(None)` for any other kind of line.
pub fn parse_option(line: &str) -> Result<Option<EngineOption>, ProtocolError> {
    check_line(line)?;
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("option") {
        return Ok(None);
    }

    let mut option = EngineOption::default();
    let mut key: Option<&str> = None;
    let mut words: Vec<&str> = Vec::new();

    for token in tokens.chain(std::iter::once("")) {
        let is_keyword = matches!(token, "name" | "type" | "default" | "min" | "max" | "var" | "");
        if !is_keyword {
            words.push(token);
            continue;
        }
        if let Some(current) = key {
            let text = words.join(" ");
            match current {
                "name" => option.name = text,
                "type" => option.kind = Some(text),
                "default" => {
                    option.default = Some(if text == "<empty>" { String::new() } else { text })
                }
                "min" => option.min = Some(parse_int("min", &text)?),
                "max" => option.max = Some(parse_int("max", &text)?),
                _ => option.vars.push(text),
            }
        }
        key = Some(token);
        words.clear();
    }

    if option.name.is_empty() {
        return Err(ProtocolError::MissingOptionName);
    }
    Ok(Some(option))
}

/// Classifies any line the engine prints.
pub fn parse_line(line: &str) -> Result<EngineResponse, ProtocolError> {
    check_line(line)?;
    let keyword = line.split_whitespace().next().unwrap_or("");
    let response = match keyword {
        "uciok" => EngineResponse::UciOk,
        "readyok" => EngineResponse::ReadyOk,
        "id" => {
            let mut parts = line.split_whitespace().skip(1);
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts.collect::<Vec<_>>().join(" ");
            EngineResponse::Id { key, value }
        }
        "info" => match parse_info_line(line)? {
            Some(fragment) => EngineResponse::Info(fragment),
            None => EngineResponse::Other(line.to_string()),
        },
        "bestmove" => match parse_best_move(line)? {
            Some(signal) => EngineResponse::BestMove(signal),
            None => EngineResponse::Other(line.to_string()),
        },
        "option" => match parse_option(line)? {
            Some(option) => EngineResponse::Option(option),
            None => EngineResponse::Other(line.to_string()),
        },
        _ => EngineResponse::Other(line.to_string()),
    };
    Ok(response)
}

/// Mate in N is shown as a flat +/-10000; `mate 0` means the side to move is mated.
pub fn mate_to_score(mate: i32) -> i32 {
    if mate > 0 { MATE_SCORE } else { -MATE_SCORE }
}

fn check_line(line: &str) -> Result<(), ProtocolError> {
    if !line.is_ascii() {
        return Err(ProtocolError::NonAscii {
            line: line.to_string(),
        });
    }
    if line.contains(['\n', '\r']) {
        return Err(ProtocolError::LineBreak);
    }
    Ok(())
}

fn real_move(token: &str) -> Option<String> {
    match token {
        "(none)" | "0000" => None,
        mv => Some(mv.to_string()),
    }
}

fn value<'a>(tokens: &[&'a str], key_idx: usize, key: &'static str) -> Result<&'a str, ProtocolError> {
    tokens
        .get(key_idx + 1)
        .copied()
        .ok_or(ProtocolError::MissingValue { key })
}

fn number<T: FromStr>(tokens: &[&str], key_idx: usize, key: &'static str) -> Result<T, ProtocolError> {
    parse_int(key, value(tokens, key_idx, key)?)
}

fn parse_int<T: FromStr>(key: &'static str, text: &str) -> Result<T, ProtocolError> {
    text.parse().map_err(|_| ProtocolError::InvalidInteger {
        key,
        value: text.to_string(),
    })
}

// *************** Outbound commands ***************

/// Search limits for `go`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoParams {
    pub movetime: Option<Duration>,
    pub depth: Option<u32>,
}

impl GoParams {
    pub fn movetime(movetime: Duration) -> Self {
        Self {
            movetime: Some(movetime),
            depth: None,
        }
    }

    pub fn depth(depth: u32) -> Self {
        Self {
            movetime: None,
            depth: Some(depth),
        }
    }
}

/// Commands we send to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UciCommand {
    Uci,
    IsReady,
    UciNewGame,
    SetOption { name: String, value: String },
    Position { fen: String },
    Go(GoParams),
    Stop,
    Quit,
}

impl fmt::Display for UciCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UciCommand::Uci => f.write_str("uci"),
            UciCommand::IsReady => f.write_str("isready"),
            UciCommand::UciNewGame => f.write_str("ucinewgame"),
            UciCommand::SetOption { name, value } => {
                write!(f, "setoption name {} value {}", name, value)
            }
            UciCommand::Position { fen } => write!(f, "position fen {}", fen),
            UciCommand::Go(params) => {
                f.write_str("go")?;
                if let Some(depth) = params.depth {
                    write!(f, " depth {}", depth)?;
                }
                if let Some(movetime) = params.movetime {
                    write!(f, " movetime {}", movetime.as_millis())?;
                }
                Ok(())
            }
            UciCommand::Stop => f.write_str("stop"),
            UciCommand::Quit => f.write_str("quit"),
        }
    }
}

/// Rejects arguments that could smuggle extra protocol lines to the engine.
pub fn is_safe_argument(arg: &str) -> bool {
    !arg.trim().is_empty() && arg.bytes().all(|b| b.is_ascii() && !b.is_ascii_control())
}

// *************** Tests ***************

#[cfg(test)]
mod tests {
    use super::*;

    fn info(line: &str) -> InfoFragment {
        parse_info_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_info_with_centipawn_score() {
        let f = info("info depth 15 score cp 150 nodes 1000000 time 5000 nps 200000");
        assert_eq!(f.depth, Some(15));
        assert_eq!(f.score, Some(150));
        assert_eq!(f.mate, None);
        assert_eq!(f.nodes, Some(1_000_000));
        assert_eq!(f.time, Some(5000));
        assert_eq!(f.nps, Some(200_000));
        assert_eq!(f.pv, None);
    }

    #[test]
    fn test_info_with_mate_score_and_pv() {
        let f = info("info depth 15 score mate 3 pv e2e4");
        assert_eq!(f.depth, Some(15));
        assert_eq!(f.score, Some(10_000));
        assert_eq!(f.mate, Some(3));
        assert_eq!(f.pv, Some(vec!["e2e4".to_string()]));
    }

    #[test]
    fn test_info_with_negative_mate() {
        let f = info("info depth 10 score mate -2");
        assert_eq!(f.score, Some(-10_000));
        assert_eq!(f.mate, Some(-2));
    }

    #[test]
    fn test_mate_zero_means_side_to_move_is_mated() {
        let f = info("info depth 0 score mate 0");
        assert_eq!(f.score, Some(-MATE_SCORE));
    }

    #[test]
    fn test_duplicate_cp_tokens_take_last() {
        let f = info("info depth 12 score cp 40 score cp -25 nodes 10");
        assert_eq!(f.score, Some(-25));
        assert_eq!(f.mate, None);
    }

    #[test]
    fn test_mate_has_priority_over_cp() {
        let f = info("info depth 12 score mate 4 score cp 300");
        assert_eq!(f.mate, Some(4));
        assert_eq!(f.score, Some(MATE_SCORE));
    }

    #[test]
    fn test_pv_uses_last_pv_token() {
        let f = info("info depth 8 multipv 2 score cp 12 pv d2d4 pv g1f3 d7d5 c2c4");
        assert_eq!(f.multipv, Some(2));
        assert_eq!(
            f.pv,
            Some(vec!["g1f3".to_string(), "d7d5".to_string(), "c2c4".to_string()])
        );
    }

    #[test]
    fn test_full_stockfish_line() {
        let f = info(
            "info depth 22 seldepth 30 multipv 1 score cp 31 upperbound nodes 2818305 nps 1409152 hashfull 912 tbhits 0 time 2000 pv e2e4 e7e5 g1f3",
        );
        assert_eq!(f.seldepth, Some(30));
        assert_eq!(f.bound, Some(ScoreBound::Upper));
        assert_eq!(f.hashfull, Some(912));
        assert_eq!(f.time, Some(2000));
        assert_eq!(f.pv.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_currmove_progress_line() {
        let f = info("info depth 18 currmove g1f3 currmovenumber 3");
        assert_eq!(f.currmove.as_deref(), Some("g1f3"));
        assert_eq!(f.currmovenumber, Some(3));
        assert!(!f.has_evaluation());
    }

    #[test]
    fn test_info_string_is_free_text() {
        let f = info("info string NNUE evaluation using nn-5af11540bbfe.nnue pv enabled");
        assert_eq!(f.pv, None);
        assert_eq!(
            f.string.as_deref(),
            Some("NNUE evaluation using nn-5af11540bbfe.nnue pv enabled")
        );
    }

    #[test]
    fn test_missing_fields_stay_unset() {
        let f = info("info nodes 42");
        assert_eq!(f.depth, None);
        assert_eq!(f.score, None);
        assert_eq!(f.nodes, Some(42));
    }

    #[test]
    fn test_bad_integer_is_an_error() {
        let err = parse_info_line("info depth deep score cp 10").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidInteger {
                key: "depth",
                value: "deep".into()
            }
        );
    }

    #[test]
    fn test_non_ascii_line_is_rejected() {
        let err = parse_info_line("info depth 5 score cp 10 pv e2e4 é").unwrap_err();
        assert!(matches!(err, ProtocolError::NonAscii { .. }));
        assert!(parse_line("bestmove e2e4 ✓").is_err());
    }

    #[test]
    fn test_other_lines_are_not_applicable() {
        assert_eq!(parse_info_line("bestmove e2e4").unwrap(), None);
        assert_eq!(parse_best_move("info depth 3").unwrap(), None);
        assert_eq!(parse_option("uciok").unwrap(), None);
        assert_eq!(parse_info_line("information overload").unwrap(), None);
    }

    #[test]
    fn test_bestmove_none() {
        let signal = parse_best_move("bestmove (none)").unwrap().unwrap();
        assert_eq!(signal.best, None);
        assert_eq!(signal.ponder, None);
    }

    #[test]
    fn test_bestmove_with_ponder() {
        let signal = parse_best_move("bestmove e2e4 ponder e7e5").unwrap().unwrap();
        assert_eq!(signal.best.as_deref(), Some("e2e4"));
        assert_eq!(signal.ponder.as_deref(), Some("e7e5"));
    }

    #[test]
    fn test_bestmove_without_move_is_an_error() {
        assert_eq!(parse_best_move("bestmove").unwrap_err(), ProtocolError::MissingMove);
    }

    #[test]
    fn test_spin_option() {
        let opt = parse_option("option name Hash type spin default 16 min 1 max 33554432")
            .unwrap()
            .unwrap();
        assert_eq!(opt.name, "Hash");
        assert_eq!(opt.kind.as_deref(), Some("spin"));
        assert_eq!(opt.value(), Some("16"));
        assert_eq!(opt.min, Some(1));
        assert_eq!(opt.max, Some(33_554_432));
    }

    #[test]
    fn test_option_name_with_spaces_and_empty_default() {
        let opt = parse_option("option name Debug Log File type string default <empty>")
            .unwrap()
            .unwrap();
        assert_eq!(opt.name, "Debug Log File");
        assert_eq!(opt.value(), Some(""));
    }

    #[test]
    fn test_combo_option_vars() {
        let opt = parse_option("option name Style type combo default Normal var Solid var Normal var Risky")
            .unwrap()
            .unwrap();
        assert_eq!(opt.vars, vec!["Solid", "Normal", "Risky"]);
    }

    #[test]
    fn test_parse_line_classifies() {
        assert_eq!(parse_line("uciok").unwrap(), EngineResponse::UciOk);
        assert_eq!(parse_line("readyok").unwrap(), EngineResponse::ReadyOk);
        assert_eq!(
            parse_line("id name Stockfish 16").unwrap(),
            EngineResponse::Id {
                key: "name".into(),
                value: "Stockfish 16".into()
            }
        );
        assert!(matches!(parse_line("info depth 1").unwrap(), EngineResponse::Info(_)));
        assert!(matches!(
            parse_line("Stockfish 16 by the Stockfish developers").unwrap(),
            EngineResponse::Other(_)
        ));
    }

    #[test]
    fn test_evaluation_merge_overwrites_only_present_fields() {
        let mut eval = Evaluation::from_fragment(&info("info depth 10 score mate 5 nodes 100 pv e2e4 e7e5"));
        eval.merge(&info("info depth 11 score cp 80"));
        assert_eq!(eval.depth, Some(11));
        assert_eq!(eval.score, 80);
        assert_eq!(eval.mate, None);
        assert_eq!(eval.nodes, Some(100));
        assert_eq!(eval.best_move(), Some("e2e4"));
    }

    #[test]
    fn test_command_rendering() {
        assert_eq!(UciCommand::Uci.to_string(), "uci");
        assert_eq!(
            UciCommand::Position {
                fen: "8/8/8/8/8/8/8/K1k5 w - - 0 1".into()
            }
            .to_string(),
            "position fen 8/8/8/8/8/8/8/K1k5 w - - 0 1"
        );
        assert_eq!(
            UciCommand::Go(GoParams::movetime(Duration::from_millis(1500))).to_string(),
            "go movetime 1500"
        );
        assert_eq!(UciCommand::Go(GoParams::depth(18)).to_string(), "go depth 18");
        assert_eq!(
            UciCommand::SetOption {
                name: "MultiPV".into(),
                value: "3".into()
            }
            .to_string(),
            "setoption name MultiPV value 3"
        );
    }

    #[test]
    fn test_safe_argument() {
        assert!(is_safe_argument("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"));
        assert!(!is_safe_argument("8/8/8/8/8/8/8/8 w - - 0 1\nquit"));
        assert!(!is_safe_argument("   "));
    }
}
