//! Engine module (Step 4 in the pipeline).
//! Drives an external UCI engine (Stockfish or compatible) through a line-based channel.
//! One `EngineSession` owns one engine process for the life of the program; every
//! handshake, search and quit runs under the session lock, so at most one search is in
//! flight no matter how many threads call `analyze`.
//! The transport is injectable (`EngineLauncher`/`EngineTransport`) so the protocol logic
//! can run against a scripted engine in tests.

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{fmt, mem};

use shakmaty::uci::UciMove;
use tracing::{debug, info, warn};

use crate::board::position_from_fen;
use crate::config::{EngineConfig, SearchConfig};
use crate::error::AnalyzerError;

/// Bidirectional line channel to a running engine.
pub trait EngineTransport: Send {
    /// Writes one command line (without trailing newline).
    fn send(&mut self, line: &str) -> io::Result<()>;
    /// Next output line, `Ok(None)` if nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<String>>;
    /// Asks the engine to quit and releases the process. Best effort.
    fn shutdown(&mut self);
}

/// Starts engine instances. Called once at startup and again for lazy re-initialization.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn EngineTransport>>;
}

// *************** Process transport ***************

/// Launches the engine binary at `path` with piped stdio.
#[derive(Clone, Debug)]
pub struct UciProcessLauncher {
    path: PathBuf,
}

impl UciProcessLauncher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EngineLauncher for UciProcessLauncher {
    fn launch(&self) -> io::Result<Box<dyn EngineTransport>> {
        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("engine stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("engine stdout unavailable"))?;

        // Blocking reads happen on their own thread so `recv` can honour a timeout
        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("engine-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        info!(path = %self.path.display(), pid = child.id(), "Engine process spawned");
        Ok(Box::new(UciProcess {
            child,
            stdin: BufWriter::new(stdin),
            lines: rx,
            reader: Some(reader),
        }))
    }
}

pub struct UciProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl EngineTransport for UciProcess {
    fn send(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "engine closed its output",
            )),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.send("quit");
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for UciProcess {
    fn drop(&mut self) {
        // No-op if shutdown already reaped the child
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// *************** Requests and results ***************

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub threads: u32,
    pub hash_mb: u32,
    pub handshake_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            threads: config.threads,
            hash_mb: config.hash_mb,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }
}

/// Position plus search bounds. Depth and time are checked here, the notation in `analyze`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisRequest {
    fen: String,
    depth: u32,
    time_limit: Duration,
}

impl AnalysisRequest {
    pub fn new(
        fen: impl Into<String>,
        depth: u32,
        time_limit: Duration,
    ) -> Result<Self, AnalyzerError> {
        if depth == 0 {
            return Err(AnalyzerError::InvalidRequest("depth must be positive".into()));
        }
        if time_limit.is_zero() {
            return Err(AnalyzerError::InvalidRequest("time limit must be positive".into()));
        }
        Ok(Self {
            fen: fen.into(),
            depth,
            time_limit,
        })
    }

    pub fn from_config(fen: impl Into<String>, search: &SearchConfig) -> Result<Self, AnalyzerError> {
        Self::new(fen, search.depth, search.time_limit())
    }

    pub fn fen(&self) -> &str {
        &self.fen
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }
}

/// Evaluation from the side to move's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    /// Positive: side to move mates in N. Negative: side to move is mated in N.
    Mate(i32),
}

impl Score {
    pub fn pawns(&self) -> Option<f64> {
        match self {
            Score::Centipawns(cp) => Some(f64::from(*cp) / 100.0),
            Score::Mate(_) => None,
        }
    }

    pub fn mate_distance(&self) -> Option<i32> {
        match self {
            Score::Mate(n) => Some(*n),
            Score::Centipawns(_) => None,
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Score::Centipawns(cp) => write!(f, "{:.2}", f64::from(cp) / 100.0),
            Score::Mate(n) if n > 0 => write!(f, "Mate in {n}"),
            Score::Mate(n) => write!(f, "Mated in {}", n.unsigned_abs()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisResult {
    /// `None` when the side to move has no legal move
    pub best_move: Option<UciMove>,
    pub score: Option<Score>,
    pub depth: u32,
    /// Starts with `best_move` whenever both are present
    pub principal_variation: Vec<UciMove>,
}

impl AnalysisResult {
    pub fn best_move_text(&self) -> Option<String> {
        self.best_move.as_ref().map(|m| m.to_string())
    }

    pub fn pv_text(&self) -> Vec<String> {
        self.principal_variation.iter().map(|m| m.to_string()).collect()
    }
}

// *************** Session ***************

/// Observable session state.
///
/// `Uninitialized` covers both an engine that never started and one whose
/// process died or stopped answering mid-search. Either way the next
/// `analyze` call makes one start attempt and the session returns to `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    /// Another caller holds the session
    Busy,
    Closed,
}

enum Slot {
    Uninitialized,
    Ready(Box<dyn EngineTransport>),
    Closed,
}

struct Inner {
    slot: Slot,
    engine_name: Option<String>,
}

impl Inner {
    fn state(&self) -> SessionState {
        match self.slot {
            Slot::Uninitialized => SessionState::Uninitialized,
            Slot::Ready(_) => SessionState::Ready,
            Slot::Closed => SessionState::Closed,
        }
    }
}

pub struct EngineSession {
    launcher: Box<dyn EngineLauncher>,
    options: EngineOptions,
    inner: Mutex<Inner>,
}

impl EngineSession {
    /// Launches and configures the engine. A failed start leaves the session
    /// `Uninitialized`; the next `analyze` retries once before giving up.
    pub fn start(launcher: impl EngineLauncher + 'static, options: EngineOptions) -> Self {
        let session = Self {
            launcher: Box::new(launcher),
            options,
            inner: Mutex::new(Inner {
                slot: Slot::Uninitialized,
                engine_name: None,
            }),
        };
        {
            let mut inner = session.lock();
            if let Err(e) = session.initialize(&mut inner) {
                warn!(error = %e, "Engine failed to start, will retry on first analysis");
            }
        }
        session
    }

    /// Session over the engine binary named in `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::start(UciProcessLauncher::new(&config.path), EngineOptions::from(config))
    }

    /// Current state without waiting for the lock.
    pub fn state(&self) -> SessionState {
        match self.inner.try_lock() {
            Ok(inner) => inner.state(),
            Err(TryLockError::WouldBlock) => SessionState::Busy,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().state(),
        }
    }

    /// Engine name from its `id name` line, once initialized.
    pub fn engine_name(&self) -> Option<String> {
        self.lock().engine_name.clone()
    }

    /// Searches `request` and blocks until the engine answers or the time bound (plus grace) passes.
    ///
    /// Every failure is `AnalysisFailed`, but the state afterwards differs.
    /// Malformed engine output leaves the session `Ready`. A dead or silent
    /// process is dropped, and the session reports `Uninitialized` until the
    /// next call restarts it.
    pub fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalyzerError> {
        // Rejected before the engine sees anything
        position_from_fen(request.fen())?;

        let mut inner = self.lock();
        if let Slot::Uninitialized = inner.slot {
            info!("Engine not initialized, retrying start");
            self.initialize(&mut inner)?;
        }
        let transport = match &mut inner.slot {
            Slot::Ready(transport) => transport,
            Slot::Closed => return Err(AnalyzerError::SessionClosed),
            Slot::Uninitialized => {
                return Err(AnalyzerError::EngineUnavailable("engine not initialized".into()));
            }
        };

        let started = Instant::now();
        match run_search(transport.as_mut(), request, &self.options) {
            Ok(result) => {
                debug!(
                    depth = result.depth,
                    best_move = ?result.best_move_text(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Analysis finished"
                );
                Ok(result)
            }
            Err(SearchError::Protocol(msg)) => {
                warn!(error = %msg, "Engine protocol error");
                Err(AnalyzerError::AnalysisFailed(msg))
            }
            Err(SearchError::Lost(msg)) => {
                // Channel is out of sync or dead: restart lazily on the next call
                warn!(error = %msg, "Engine connection lost, dropping process");
                if let Slot::Ready(mut transport) = mem::replace(&mut inner.slot, Slot::Uninitialized) {
                    transport.shutdown();
                }
                Err(AnalyzerError::AnalysisFailed(msg))
            }
        }
    }

    /// Quits the engine. The session cannot be reopened afterwards.
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Slot::Ready(mut transport) = mem::replace(&mut inner.slot, Slot::Closed) {
            info!("Shutting down engine");
            transport.shutdown();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize(&self, inner: &mut Inner) -> Result<(), AnalyzerError> {
        let mut transport = self
            .launcher
            .launch()
            .map_err(|e| AnalyzerError::EngineUnavailable(format!("failed to spawn engine: {e}")))?;

        match handshake(transport.as_mut(), &self.options) {
            Ok(name) => {
                info!(engine = name.as_deref().unwrap_or("unknown"), "Engine ready");
                inner.engine_name = name;
                inner.slot = Slot::Ready(transport);
                Ok(())
            }
            Err(e) => {
                transport.shutdown();
                Err(AnalyzerError::EngineUnavailable(e.to_string()))
            }
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Slot::Ready(mut transport) = mem::replace(&mut inner.slot, Slot::Closed) {
            transport.shutdown();
        }
    }
}

// *************** Protocol ***************

enum SearchError {
    /// Malformed output; the channel is still in sync
    Protocol(String),
    /// Channel broken or engine unresponsive
    Lost(String),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Protocol(msg) | SearchError::Lost(msg) => f.write_str(msg),
        }
    }
}

fn send(transport: &mut dyn EngineTransport, cmd: &str) -> Result<(), SearchError> {
    debug!(cmd, "engine <");
    transport
        .send(cmd)
        .map_err(|e| SearchError::Lost(format!("failed to write to engine: {e}")))
}

/// Reads until a line equal to `expected`, handing every other line to `on_line`.
fn wait_for(
    transport: &mut dyn EngineTransport,
    expected: &str,
    timeout: Duration,
    mut on_line: impl FnMut(&str),
) -> Result<(), SearchError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SearchError::Lost(format!(
                "engine did not answer '{expected}' within {timeout:?}"
            )));
        }
        let line = transport
            .recv(remaining)
            .map_err(|e| SearchError::Lost(format!("failed to read from engine: {e}")))?;
        if let Some(line) = line {
            let trimmed = line.trim();
            debug!(line = trimmed, "engine >");
            if trimmed == expected {
                return Ok(());
            }
            on_line(trimmed);
        }
    }
}

/// `uci` / `uciok`, fixed options, `isready` / `readyok`. Returns the engine's name.
fn handshake(
    transport: &mut dyn EngineTransport,
    options: &EngineOptions,
) -> Result<Option<String>, SearchError> {
    let mut name = None;
    send(transport, "uci")?;
    wait_for(transport, "uciok", options.handshake_timeout, |line| {
        if let Some(id) = line.strip_prefix("id name ") {
            name = Some(id.trim().to_string());
        }
    })?;
    send(transport, &format!("setoption name Threads value {}", options.threads))?;
    send(transport, &format!("setoption name Hash value {}", options.hash_mb))?;
    send(transport, "isready")?;
    wait_for(transport, "readyok", options.handshake_timeout, |_| {})?;
    Ok(name)
}

fn run_search(
    transport: &mut dyn EngineTransport,
    request: &AnalysisRequest,
    options: &EngineOptions,
) -> Result<AnalysisResult, SearchError> {
    // Flushes anything left over from an earlier search
    send(transport, "isready")?;
    wait_for(transport, "readyok", options.handshake_timeout, |_| {})?;

    send(transport, &format!("position fen {}", request.fen()))?;
    send(
        transport,
        &format!(
            "go depth {} movetime {}",
            request.depth(),
            request.time_limit().as_millis()
        ),
    )?;

    let mut latest = InfoLine::default();
    let mut deadline = Instant::now() + request.time_limit() + options.stop_grace;
    let mut stop_sent = false;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            if stop_sent {
                return Err(SearchError::Lost(
                    "engine did not report a best move after stop".into(),
                ));
            }
            warn!("Search overran its time bound, sending stop");
            send(transport, "stop")?;
            stop_sent = true;
            deadline = Instant::now() + options.stop_grace;
            continue;
        }

        let line = transport
            .recv(remaining)
            .map_err(|e| SearchError::Lost(format!("failed to read from engine: {e}")))?;
        let Some(line) = line else { continue };
        let trimmed = line.trim();
        debug!(line = trimmed, "engine >");

        if trimmed.starts_with("info") {
            if let Some(info) = parse_info(trimmed) {
                latest = info;
            }
        } else if trimmed.starts_with("bestmove") {
            return finish(latest, trimmed);
        }
    }
}

fn finish(info: InfoLine, bestmove_line: &str) -> Result<AnalysisResult, SearchError> {
    let (best, ponder) = parse_bestmove(bestmove_line)?;
    let mut pv: Vec<UciMove> = info
        .pv
        .iter()
        .map_while(|m| m.parse::<UciMove>().ok())
        .collect();

    match &best {
        None => pv.clear(),
        Some(best) => {
            if pv.first().is_some_and(|first| first != best) {
                // The last reported line belonged to another move; keep what bestmove vouches for
                pv = std::iter::once(best.clone()).chain(ponder).collect();
            }
        }
    }

    Ok(AnalysisResult {
        best_move: best,
        score: info.score,
        depth: info.depth,
        principal_variation: pv,
    })
}

/// `bestmove <move> [ponder <move>]`; `(none)` and `0000` mean no move.
fn parse_bestmove(line: &str) -> Result<(Option<UciMove>, Option<UciMove>), SearchError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&token) = parts.get(1) else {
        return Err(SearchError::Protocol(format!("bestmove without a move: '{line}'")));
    };
    if token == "(none)" || token == "0000" {
        return Ok((None, None));
    }
    let best = token
        .parse::<UciMove>()
        .map_err(|_| SearchError::Protocol(format!("unparsable best move '{token}'")))?;
    let ponder = match parts.get(2..4) {
        Some(["ponder", mv]) => mv.parse::<UciMove>().ok(),
        _ => None,
    };
    Ok((Some(best), ponder))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct InfoLine {
    depth: u32,
    score: Option<Score>,
    pv: Vec<String>,
}

/// Keeps only primary-line `info` output that carries a PV.
fn parse_info(line: &str) -> Option<InfoLine> {
    if !line.contains(" pv ") {
        return None;
    }
    if parse_after::<u32>(line, "multipv").is_some_and(|idx| idx != 1) {
        return None;
    }
    let score = parse_after(line, "mate")
        .map(Score::Mate)
        .or_else(|| parse_after(line, "cp").map(Score::Centipawns));
    Some(InfoLine {
        depth: parse_after(line, "depth").unwrap_or(0),
        score,
        pv: parse_pv(line),
    })
}

/// Value of the token following `key`, e.g. `parse_after::<i32>(line, "cp")`.
fn parse_after<T: FromStr>(line: &str, key: &str) -> Option<T> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts
        .windows(2)
        .find(|w| w[0] == key)
        .and_then(|w| w[1].parse().ok())
}

/// Moves after `pv`, up to the next non-move token Stockfish appends (`bmc`, `string`).
fn parse_pv(line: &str) -> Vec<String> {
    line.split_whitespace()
        .skip_while(|part| *part != "pv")
        .skip(1)
        .take_while(|part| !part.starts_with("bmc") && *part != "string")
        .map(str::to_string)
        .collect()
}
