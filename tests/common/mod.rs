//! Scripted UCI engine shared by the integration tests.
//! Answers the handshake, plays the first legal move of whatever position it is
//! given, records every command and counts overlapping searches.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use boardscan::engine::{EngineLauncher, EngineOptions, EngineSession, EngineTransport};
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess, Position};

#[derive(Default)]
pub struct MockState {
    sent: Mutex<Vec<String>>,
    searching: AtomicBool,
    overlaps: AtomicUsize,
    launches: AtomicUsize,
    /// Launches still to refuse
    failing_launches: AtomicUsize,
    /// Searches still to answer with a broken pipe
    crashing_searches: AtomicUsize,
    search_delay_ms: AtomicUsize,
    fixed_best: Mutex<Option<String>>,
}

impl MockState {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.sent().iter().filter(|l| l.starts_with(prefix)).count()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    pub fn fail_launches(self, n: usize) -> Self {
        self.state.failing_launches.store(n, Ordering::SeqCst);
        self
    }

    pub fn crash_searches(self, n: usize) -> Self {
        self.state.crashing_searches.store(n, Ordering::SeqCst);
        self
    }

    pub fn search_delay(self, delay: Duration) -> Self {
        self.state
            .search_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
        self
    }

    /// Always answer with `mv` instead of the first legal move.
    pub fn best_move(self, mv: &str) -> Self {
        *self.state.fixed_best.lock().unwrap() = Some(mv.to_string());
        self
    }

    pub fn session(&self) -> EngineSession {
        let options = EngineOptions {
            handshake_timeout: Duration::from_millis(500),
            stop_grace: Duration::from_millis(200),
            ..EngineOptions::default()
        };
        EngineSession::start(self.clone(), options)
    }
}

impl EngineLauncher for MockEngine {
    fn launch(&self) -> io::Result<Box<dyn EngineTransport>> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .state
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock engine refused to start"));
        }
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
            pending: VecDeque::new(),
            fen: None,
        }))
    }
}

struct MockTransport {
    state: Arc<MockState>,
    pending: VecDeque<String>,
    fen: Option<String>,
}

impl MockTransport {
    fn search(&mut self) -> io::Result<()> {
        if self.state.searching.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = self.state.search_delay_ms.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(delay as u64));

        let crash = self
            .state
            .crashing_searches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.state.searching.store(false, Ordering::SeqCst);
        if crash {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock engine crashed"));
        }

        let fixed = self.state.fixed_best.lock().unwrap().clone();
        let best = fixed.or_else(|| self.fen.as_deref().and_then(first_legal_move));
        match best {
            Some(best) => {
                self.pending
                    .push_back(format!("info depth 1 seldepth 1 multipv 1 score cp 5 pv {best}"));
                self.pending
                    .push_back(format!("info depth 6 seldepth 8 multipv 1 score cp 17 nodes 999 pv {best}"));
                self.pending.push_back(format!("bestmove {best}"));
            }
            None => {
                self.pending.push_back("info depth 0 score mate 0".to_string());
                self.pending.push_back("bestmove (none)".to_string());
            }
        }
        Ok(())
    }
}

impl EngineTransport for MockTransport {
    fn send(&mut self, line: &str) -> io::Result<()> {
        self.state.sent.lock().unwrap().push(line.to_string());
        match line {
            "uci" => {
                self.pending.push_back("id name MockFish 1.0".to_string());
                self.pending.push_back("id author boardscan tests".to_string());
                self.pending.push_back("uciok".to_string());
            }
            "isready" => self.pending.push_back("readyok".to_string()),
            l if l.starts_with("position fen ") => {
                self.fen = Some(l["position fen ".len()..].to_string());
            }
            l if l.starts_with("go") => self.search()?,
            _ => {}
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        match self.pending.pop_front() {
            Some(line) => Ok(Some(line)),
            None => {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }

    fn shutdown(&mut self) {
        self.state.sent.lock().unwrap().push("quit".to_string());
    }
}

pub fn first_legal_move(fen: &str) -> Option<String> {
    let pos: Chess = Fen::from_ascii(fen.as_bytes())
        .ok()?
        .into_position(CastlingMode::Standard)
        .ok()?;
    pos.legal_moves()
        .first()
        .map(|m| m.to_uci(CastlingMode::Standard).to_string())
}
