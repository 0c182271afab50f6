//! Board scanning and analysis: locate a chess board in an image, read the
//! position off it and ask a UCI engine for the best move.

pub mod board;
pub mod capture;
pub mod classify;
pub mod config;
pub mod describe;
pub mod detect;
pub mod encode;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use board::{BoardState, INITIAL_FEN, PieceLabel};
pub use config::Config;
pub use engine::{AnalysisRequest, AnalysisResult, EngineSession, Score};
pub use error::AnalyzerError;
pub use pipeline::{Pipeline, Report, StatusUpdate};
