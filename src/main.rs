use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use boardscan::capture::{FileImageSource, ImageSource};
use boardscan::config::{Config, DEFAULT_CONFIG_PATH};
use boardscan::engine::EngineSession;
use boardscan::pipeline::{Pipeline, Report, StatusSink, StatusUpdate};
use boardscan::worker::{AnalysisWorker, Submitted};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_IMAGE: &str = "screenshots/current_board.png";

fn cli() -> Command {
    Command::new("boardscan")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Finds a chess board in an image, reads the position and asks a UCI engine for the best move")
        .arg(
            Arg::new("image")
                .long("image")
                .value_name("PATH")
                .help("Image to scan (re-read on every scan in watch mode)")
                .default_value(DEFAULT_IMAGE),
        )
        .arg(
            Arg::new("fen")
                .long("fen")
                .value_name("FEN")
                .help("Analyze this position directly instead of scanning an image")
                .conflicts_with("watch"),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Rescan the image every scan_interval_secs until Ctrl+C")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Config file (missing file means defaults)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("engine")
                .long("engine")
                .value_name("PATH")
                .help("UCI engine binary (overrides STOCKFISH_PATH)"),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_name("PLIES")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("movetime-ms")
                .long("movetime-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("N")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("hash-mb")
                .long("hash-mb")
                .value_name("MB")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("min-board-size")
                .long("min-board-size")
                .value_name("PX")
                .value_parser(value_parser!(u32)),
        )
}

/// File, then environment, then command line.
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let mut config = Config::load(path).with_context(|| format!("Failed to load config from {path}"))?;
    config.apply_env();

    if let Some(engine) = matches.get_one::<String>("engine") {
        config.engine.path = engine.clone();
    }
    if let Some(&depth) = matches.get_one::<u32>("depth") {
        config.search.depth = depth;
    }
    if let Some(&ms) = matches.get_one::<u64>("movetime-ms") {
        config.search.time_limit_ms = ms;
    }
    if let Some(&threads) = matches.get_one::<u32>("threads") {
        config.engine.threads = threads;
    }
    if let Some(&hash) = matches.get_one::<u32>("hash-mb") {
        config.engine.hash_mb = hash;
    }
    if let Some(&size) = matches.get_one::<u32>("min-board-size") {
        config.detector.min_board_size = size;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_report(report: &Report) {
    println!("Detected FEN: {}", report.fen());
    match report.analysis.best_move_text() {
        Some(mv) => println!("Move: {mv}"),
        None => println!("Move: none (no legal moves)"),
    }
    if let Some(score) = report.analysis.score {
        println!("Evaluation: {} (depth {})", score, report.analysis.depth);
    }
    if !report.analysis.principal_variation.is_empty() {
        println!("Line: {}", report.analysis.pv_text().join(" "));
    }
    if report.encoding_fallback {
        println!("Note: position could not be recognized, starting position was analyzed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    println!("boardscan starting...");
    println!("Engine: {}", config.engine.path);

    let engine_config = config.engine.clone();
    let engine = tokio::task::spawn_blocking(move || EngineSession::from_config(&engine_config))
        .await
        .context("Engine start task failed")?;
    let engine = Arc::new(engine);
    if let Some(name) = engine.engine_name() {
        println!("Engine ready: {name}");
    }

    let (narration_tx, mut narration_rx) = mpsc::unbounded_channel::<String>();
    let pipeline = Arc::new(
        Pipeline::new(&config, Arc::clone(&engine)).with_narrator(Arc::new(narration_tx)),
    );
    let narration = tokio::spawn(async move {
        while let Some(text) = narration_rx.recv().await {
            println!("{text}");
        }
    });

    let result = if let Some(fen) = matches.get_one::<String>("fen").cloned() {
        let p = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || p.analyze_fen(&fen))
            .await
            .context("Analysis task failed")?
            .map(|report| print_report(&report))
            .context("Failed to analyze position")
    } else {
        let image = matches
            .get_one::<String>("image")
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let source: Arc<dyn ImageSource> = Arc::new(FileImageSource::new(&image));
        if matches.get_flag("watch") {
            watch(Arc::clone(&pipeline), source, config.scan_interval_secs).await
        } else {
            scan_once(Arc::clone(&pipeline), source).await
        }
    };

    // Closes the narration channel so the printer task can finish
    drop(pipeline);
    let _ = narration.await;
    engine.close();
    result
}

async fn scan_once(pipeline: Arc<Pipeline>, source: Arc<dyn ImageSource>) -> Result<()> {
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_status(status_rx, false));

    let report = tokio::task::spawn_blocking(move || pipeline.scan(source.as_ref(), &status_tx))
        .await
        .context("Scan task failed")?;
    let _ = printer.await;

    let report = report.context("Scan failed")?;
    print_report(&report);
    Ok(())
}

async fn watch(pipeline: Arc<Pipeline>, source: Arc<dyn ImageSource>, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        bail!("scan_interval_secs must be positive in watch mode");
    }
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_status(status_rx, true));
    let sink: Arc<dyn StatusSink> = Arc::new(status_tx);
    let worker = AnalysisWorker::spawn(pipeline, source, sink);

    println!("Scanning every {interval_secs}s. Press Ctrl+C to stop.");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if worker.submit() == Submitted::Closed {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                println!("Stopping...");
                break;
            }
        }
    }

    worker.shutdown().await;
    let _ = printer.await;
    Ok(())
}

/// Prints progress lines. Finished reports are printed in full when `reports` is set.
async fn print_status(mut rx: mpsc::UnboundedReceiver<StatusUpdate>, reports: bool) {
    while let Some(update) = rx.recv().await {
        match update {
            StatusUpdate::Finished(report) => {
                if reports {
                    print_report(&report);
                }
            }
            other => println!("{other}"),
        }
    }
}
