//! Scan pipeline: capture, detect, encode, analyze, describe.
//! Every step reports to a `StatusSink` as it starts; notifications are
//! fire-and-forget so a slow consumer never holds up the scan.
//! Geometry and encoding problems degrade (status message, fallback value);
//! engine problems are returned to the caller.

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use shakmaty::uci::UciMove;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::board::BoardState;
use crate::capture::{self, ImageSource};
use crate::classify::{LuminanceClassifier, SquareClassifier};
use crate::config::{Config, SearchConfig};
use crate::describe::describe;
use crate::detect::{Detection, GeometryDetector};
use crate::encode::encode_or_initial;
use crate::engine::{AnalysisRequest, AnalysisResult, EngineSession};
use crate::error::AnalyzerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Scanning,
    Detecting,
    Encoding,
    Analyzing,
}

impl Stage {
    pub fn message(self) -> &'static str {
        match self {
            Stage::Scanning => "Taking screenshot...",
            Stage::Detecting => "Detecting board...",
            Stage::Encoding => "Recognizing position...",
            Stage::Analyzing => "Analyzing with engine...",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatusUpdate {
    Stage(Stage),
    BoardNotFound,
    /// Encoding failed and the initial position was used instead
    EncodingFallback(String),
    Finished(Box<Report>),
    Failed(String),
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUpdate::Stage(stage) => f.write_str(stage.message()),
            StatusUpdate::BoardNotFound => f.write_str("Could not detect chess board"),
            StatusUpdate::EncodingFallback(reason) => {
                write!(f, "Could not recognize position ({reason}), using starting position")
            }
            StatusUpdate::Finished(report) => write!(f, "Best move: {}", report.description),
            StatusUpdate::Failed(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Receives progress notifications. Must not block.
pub trait StatusSink: Send + Sync {
    fn notify(&self, update: StatusUpdate);
}

impl StatusSink for UnboundedSender<StatusUpdate> {
    fn notify(&self, update: StatusUpdate) {
        // A dropped receiver just means nobody is watching
        let _ = self.send(update);
    }
}

/// Writes every update to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn notify(&self, update: StatusUpdate) {
        info!(status = %update, "Scan status");
    }
}

/// Speaks (or otherwise announces) a finished analysis.
pub trait Narrator: Send + Sync {
    fn speak(&self, text: &str);
}

impl Narrator for UnboundedSender<String> {
    fn speak(&self, text: &str) {
        let _ = self.send(text.to_string());
    }
}

/// Source and destination of the best move in source-image coordinates.
pub type Arrow = ((f32, f32), (f32, f32));

#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    /// Position submitted to the engine
    pub state: BoardState,
    pub analysis: AnalysisResult,
    pub description: String,
    /// Present when the position came from an image and the engine found a move
    pub arrow: Option<Arrow>,
    pub encoding_fallback: bool,
}

impl Report {
    pub fn fen(&self) -> String {
        self.state.to_fen()
    }

    pub fn narration(&self) -> String {
        format!("Best move: {}", self.description)
    }
}

pub struct Pipeline {
    detector: GeometryDetector,
    classifier: Arc<dyn SquareClassifier>,
    engine: Arc<EngineSession>,
    search: SearchConfig,
    narrator: Option<Arc<dyn Narrator>>,
}

impl Pipeline {
    /// Pipeline with the luminance classifier and no narration.
    pub fn new(config: &Config, engine: Arc<EngineSession>) -> Self {
        Self {
            detector: GeometryDetector::new(config.detector.clone()),
            classifier: Arc::new(LuminanceClassifier::new(&config.classifier)),
            engine,
            search: config.search.clone(),
            narrator: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SquareClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn engine(&self) -> &EngineSession {
        &self.engine
    }

    /// Pulls one frame from `source` and runs it through [`Pipeline::run`].
    pub fn scan(
        &self,
        source: &dyn ImageSource,
        status: &dyn StatusSink,
    ) -> Result<Report, AnalyzerError> {
        status.notify(StatusUpdate::Stage(Stage::Scanning));
        let image = source.capture().inspect_err(|e| {
            status.notify(StatusUpdate::Failed(e.to_string()));
        })?;
        self.run(&image, status)
    }

    pub fn run(
        &self,
        image: &DynamicImage,
        status: &dyn StatusSink,
    ) -> Result<Report, AnalyzerError> {
        status.notify(StatusUpdate::Stage(Stage::Detecting));
        let Some(detection) = self.detector.detect(image) else {
            debug!("No board in frame");
            status.notify(StatusUpdate::BoardNotFound);
            return Err(AnalyzerError::BoardNotFound);
        };
        capture::maybe_dump_rectified(&detection.board);

        status.notify(StatusUpdate::Stage(Stage::Encoding));
        let (state, fallback) = encode_or_initial(&detection.board, self.classifier.as_ref());
        if let Some(e) = &fallback {
            status.notify(StatusUpdate::EncodingFallback(e.to_string()));
        }
        let state = state.with_consistent_castling();
        debug!(fen = %state, "Position encoded");

        status.notify(StatusUpdate::Stage(Stage::Analyzing));
        let mut report = self.analyze_state(state).inspect_err(|e| {
            status.notify(StatusUpdate::Failed(e.to_string()));
        })?;
        report.encoding_fallback = fallback.is_some();
        report.arrow = report.analysis.best_move.as_ref().and_then(|m| arrow_for(&detection, m));

        self.announce(&report);
        status.notify(StatusUpdate::Finished(Box::new(report.clone())));
        Ok(report)
    }

    /// Analyzes a position given directly as FEN, skipping the image steps.
    pub fn analyze_fen(&self, fen: &str) -> Result<Report, AnalyzerError> {
        let state: BoardState = fen.parse()?;
        let report = self.analyze_state(state)?;
        self.announce(&report);
        Ok(report)
    }

    fn analyze_state(&self, state: BoardState) -> Result<Report, AnalyzerError> {
        let request = AnalysisRequest::from_config(state.to_fen(), &self.search)?;
        let analysis = self.engine.analyze(&request)?;
        let description = describe(&state, analysis.best_move_text().as_deref());
        Ok(Report {
            state,
            analysis,
            description,
            arrow: None,
            encoding_fallback: false,
        })
    }

    fn announce(&self, report: &Report) {
        let score = report.analysis.score.map(|s| s.to_string());
        info!(
            fen = %report.state,
            best_move = ?report.analysis.best_move_text(),
            score = score.as_deref().unwrap_or("-"),
            depth = report.analysis.depth,
            "Analysis complete"
        );
        match &self.narrator {
            Some(narrator) => narrator.speak(&report.narration()),
            None => debug!("No narrator attached"),
        }
    }
}

fn arrow_for(detection: &Detection, mv: &UciMove) -> Option<Arrow> {
    match *mv {
        UciMove::Normal { from, to, .. } => {
            Some((detection.square_center(from), detection.square_center(to)))
        }
        _ => {
            warn!(%mv, "Best move has no source square");
            None
        }
    }
}
