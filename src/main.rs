use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command, value_parser};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zugzwang_engine::config::{DEFAULT_CONFIG_PATH, load_config};
use zugzwang_engine::engine::{self, Analysis, format_tablebase};
use zugzwang_engine::EngineService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let matches = Command::new("Zugzwang-Engine")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drives a UCI chess engine: best moves, evaluations and tablebase lookups")
        .arg(
            Arg::new("engine")
                .long("engine")
                .value_name("PATH")
                .help("UCI engine binary (overrides config and ZUGZWANG_ENGINE)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON config file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("fen")
                .long("fen")
                .value_name("FEN")
                .help("Position to analyze (otherwise FENs are read from stdin, one per line)"),
        )
        .arg(
            Arg::new("movetime")
                .long("movetime")
                .value_name("MS")
                .help("Best-move search time in milliseconds")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_name("N")
                .help("Evaluation search depth")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("no-tablebase")
                .long("no-tablebase")
                .help("Skip tablebase lookups")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print one JSON object per position")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print the resolved config and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = load_config(&config_path)?
        .with_engine_override(matches.get_one::<String>("engine").cloned());
    if let Some(movetime) = matches.get_one::<u64>("movetime") {
        config.search.move_time_ms = *movetime;
    }
    if let Some(depth) = matches.get_one::<u32>("depth") {
        config.search.eval_depth = *depth;
    }
    if matches.get_flag("no-tablebase") {
        config.tablebase.enabled = false;
    }

    if matches.get_flag("print-config") {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let json = matches.get_flag("json");
    let use_tablebase = config.tablebase.enabled;
    info!(engine = %config.engine.path.display(), "Zugzwang engine service starting");

    let service = EngineService::from_config(config).context("Failed to build engine service")?;
    service.initialize().await.context("Failed to start engine")?;

    if let Some(fen) = matches.get_one::<String>("fen") {
        analyze_and_print(&service, fen, use_tablebase, json).await?;
    } else {
        println!("Reading FENs from stdin. Press Ctrl+C to stop.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    analyze_and_print(&service, &line, use_tablebase, json).await?;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    service.shutdown()?;
    Ok(())
}

async fn analyze_and_print(service: &EngineService, fen: &str, use_tablebase: bool, json: bool) -> Result<()> {
    match engine::analyze(service, fen, use_tablebase).await {
        Ok(analysis) => print_analysis(&analysis, json),
        Err(e) => {
            warn!("{:#}", e);
            Ok(())
        }
    }
}

fn print_analysis(analysis: &Analysis, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(analysis)?);
        return Ok(());
    }

    let (best_move, eval) = analysis.summary();
    println!("Detected FEN: {}", analysis.fen);
    println!("Best move: {}", best_move);
    println!("Evaluation: {}", eval);
    if let Some(entry) = &analysis.tablebase {
        println!("Tablebase: {}", format_tablebase(entry));
    }
    Ok(())
}
