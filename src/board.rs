//! Board-state value types and the FEN notation they serialize to.
//!
//! `BoardState` is built once per analysis cycle and treated as a value: every
//! transformation returns a new state. Legality is delegated to `shakmaty`.

use std::fmt;
use std::str::FromStr;

use shakmaty::fen::Fen;
use shakmaty::{Bitboard, CastlingMode, Chess, Color, File, Rank, Role, Square};

use crate::error::AnalyzerError;

pub const INITIAL_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn name(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

impl PieceKind {
    pub fn name(self) -> &'static str {
        match self {
            PieceKind::Pawn => "pawn",
            PieceKind::Knight => "knight",
            PieceKind::Bishop => "bishop",
            PieceKind::Rook => "rook",
            PieceKind::Queen => "queen",
            PieceKind::King => "king",
        }
    }
}

impl From<Role> for PieceKind {
    fn from(role: Role) -> Self {
        match role {
            Role::Pawn => PieceKind::Pawn,
            Role::Knight => PieceKind::Knight,
            Role::Bishop => PieceKind::Bishop,
            Role::Rook => PieceKind::Rook,
            Role::Queen => PieceKind::Queen,
            Role::King => PieceKind::King,
        }
    }
}

/// Occupancy of a single square: empty or one of the twelve pieces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PieceLabel {
    #[default]
    Empty,
    WhitePawn,
    WhiteKnight,
    WhiteBishop,
    WhiteRook,
    WhiteQueen,
    WhiteKing,
    BlackPawn,
    BlackKnight,
    BlackBishop,
    BlackRook,
    BlackQueen,
    BlackKing,
}

impl PieceLabel {
    pub fn new(side: Side, kind: PieceKind) -> Self {
        use PieceKind::*;
        match (side, kind) {
            (Side::White, Pawn) => PieceLabel::WhitePawn,
            (Side::White, Knight) => PieceLabel::WhiteKnight,
            (Side::White, Bishop) => PieceLabel::WhiteBishop,
            (Side::White, Rook) => PieceLabel::WhiteRook,
            (Side::White, Queen) => PieceLabel::WhiteQueen,
            (Side::White, King) => PieceLabel::WhiteKing,
            (Side::Black, Pawn) => PieceLabel::BlackPawn,
            (Side::Black, Knight) => PieceLabel::BlackKnight,
            (Side::Black, Bishop) => PieceLabel::BlackBishop,
            (Side::Black, Rook) => PieceLabel::BlackRook,
            (Side::Black, Queen) => PieceLabel::BlackQueen,
            (Side::Black, King) => PieceLabel::BlackKing,
        }
    }

    /// Side and kind, `None` for an empty square.
    pub fn piece(self) -> Option<(Side, PieceKind)> {
        use PieceKind::*;
        let piece = match self {
            PieceLabel::Empty => return None,
            PieceLabel::WhitePawn => (Side::White, Pawn),
            PieceLabel::WhiteKnight => (Side::White, Knight),
            PieceLabel::WhiteBishop => (Side::White, Bishop),
            PieceLabel::WhiteRook => (Side::White, Rook),
            PieceLabel::WhiteQueen => (Side::White, Queen),
            PieceLabel::WhiteKing => (Side::White, King),
            PieceLabel::BlackPawn => (Side::Black, Pawn),
            PieceLabel::BlackKnight => (Side::Black, Knight),
            PieceLabel::BlackBishop => (Side::Black, Bishop),
            PieceLabel::BlackRook => (Side::Black, Rook),
            PieceLabel::BlackQueen => (Side::Black, Queen),
            PieceLabel::BlackKing => (Side::Black, King),
        };
        Some(piece)
    }

    pub fn is_empty(self) -> bool {
        self == PieceLabel::Empty
    }

    /// FEN letter (uppercase = white), `None` for empty.
    pub fn fen_char(self) -> Option<char> {
        let (side, kind) = self.piece()?;
        let c = match kind {
            PieceKind::Pawn => 'p',
            PieceKind::Knight => 'n',
            PieceKind::Bishop => 'b',
            PieceKind::Rook => 'r',
            PieceKind::Queen => 'q',
            PieceKind::King => 'k',
        };
        Some(match side {
            Side::White => c.to_ascii_uppercase(),
            Side::Black => c,
        })
    }

    pub fn from_fen_char(c: char) -> Option<Self> {
        let kind = match c.to_ascii_lowercase() {
            'p' => PieceKind::Pawn,
            'n' => PieceKind::Knight,
            'b' => PieceKind::Bishop,
            'r' => PieceKind::Rook,
            'q' => PieceKind::Queen,
            'k' => PieceKind::King,
            _ => return None,
        };
        let side = if c.is_ascii_uppercase() { Side::White } else { Side::Black };
        Some(Self::new(side, kind))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CastlingRights {
    pub white_kingside: bool,
    pub white_queenside: bool,
    pub black_kingside: bool,
    pub black_queenside: bool,
}

impl CastlingRights {
    pub const ALL: Self = Self {
        white_kingside: true,
        white_queenside: true,
        black_kingside: true,
        black_queenside: true,
    };

    pub const NONE: Self = Self {
        white_kingside: false,
        white_queenside: false,
        black_kingside: false,
        black_queenside: false,
    };

    /// Rights from the rook squares `shakmaty` records; rooks past the e-file castle kingside.
    fn from_rooks(rooks: Bitboard) -> Self {
        let mut rights = Self::NONE;
        for sq in rooks {
            let kingside = sq.file() > File::E;
            match (sq.rank(), kingside) {
                (Rank::First, true) => rights.white_kingside = true,
                (Rank::First, false) => rights.white_queenside = true,
                (Rank::Eighth, true) => rights.black_kingside = true,
                (Rank::Eighth, false) => rights.black_queenside = true,
                _ => {}
            }
        }
        rights
    }
}

impl fmt::Display for CastlingRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            return f.write_str("-");
        }
        let flags = [
            (self.white_kingside, 'K'),
            (self.white_queenside, 'Q'),
            (self.black_kingside, 'k'),
            (self.black_queenside, 'q'),
        ];
        for (set, c) in flags {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Full position: placement plus side to move, castling, en passant and clocks.
///
/// `grid[rank][file]` with rank 0 = rank 1 and file 0 = the a-file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BoardState {
    grid: [[PieceLabel; 8]; 8],
    pub side_to_move: Side,
    pub castling: CastlingRights,
    pub en_passant: Option<Square>,
    pub halfmove_clock: u32,
    pub fullmove_number: u32,
}

impl BoardState {
    /// State produced by the image pipeline: white to move, all castling rights, fresh clocks.
    pub fn from_grid(grid: [[PieceLabel; 8]; 8]) -> Self {
        Self {
            grid,
            side_to_move: Side::White,
            castling: CastlingRights::ALL,
            en_passant: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    pub fn empty() -> Self {
        Self::from_grid([[PieceLabel::Empty; 8]; 8])
    }

    pub fn initial() -> Self {
        use PieceLabel::*;
        let mut grid = [[Empty; 8]; 8];
        grid[0] = [
            WhiteRook, WhiteKnight, WhiteBishop, WhiteQueen, WhiteKing, WhiteBishop, WhiteKnight,
            WhiteRook,
        ];
        grid[1] = [WhitePawn; 8];
        grid[6] = [BlackPawn; 8];
        grid[7] = [
            BlackRook, BlackKnight, BlackBishop, BlackQueen, BlackKing, BlackBishop, BlackKnight,
            BlackRook,
        ];
        Self::from_grid(grid)
    }

    pub fn grid(&self) -> &[[PieceLabel; 8]; 8] {
        &self.grid
    }

    /// Label at `rank` (0 = rank 1) and `file` (0 = a-file). Out-of-range indices read as empty.
    pub fn label_at(&self, rank: usize, file: usize) -> PieceLabel {
        self.grid
            .get(rank)
            .and_then(|r| r.get(file))
            .copied()
            .unwrap_or_default()
    }

    pub fn label_on(&self, square: Square) -> PieceLabel {
        self.label_at(square.rank() as usize, square.file() as usize)
    }

    /// Placement field only: ranks 8 to 1, empty runs collapsed to digits.
    pub fn placement(&self) -> String {
        let mut out = String::with_capacity(72);
        for rank in (0..8).rev() {
            let mut empty_run = 0;
            for file in 0..8 {
                match self.grid[rank][file].fen_char() {
                    None => empty_run += 1,
                    Some(c) => {
                        if empty_run > 0 {
                            out.push_str(&empty_run.to_string());
                            empty_run = 0;
                        }
                        out.push(c);
                    }
                }
            }
            if empty_run > 0 {
                out.push_str(&empty_run.to_string());
            }
            if rank > 0 {
                out.push('/');
            }
        }
        out
    }

    pub fn to_fen(&self) -> String {
        self.to_string()
    }

    /// Drops castling rights whose king or rook is not on its home square.
    pub fn with_consistent_castling(&self) -> Self {
        let home = |rank: usize, file: usize, label: PieceLabel| self.grid[rank][file] == label;
        let white_king = home(0, 4, PieceLabel::WhiteKing);
        let black_king = home(7, 4, PieceLabel::BlackKing);
        let castling = CastlingRights {
            white_kingside: self.castling.white_kingside
                && white_king
                && home(0, 7, PieceLabel::WhiteRook),
            white_queenside: self.castling.white_queenside
                && white_king
                && home(0, 0, PieceLabel::WhiteRook),
            black_kingside: self.castling.black_kingside
                && black_king
                && home(7, 7, PieceLabel::BlackRook),
            black_queenside: self.castling.black_queenside
                && black_king
                && home(7, 0, PieceLabel::BlackRook),
        };
        Self {
            castling,
            ..self.clone()
        }
    }

    /// Legal `shakmaty` position for this state, or `InvalidPosition`.
    pub fn to_position(&self) -> Result<Chess, AnalyzerError> {
        position_from_fen(&self.to_fen())
    }
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.side_to_move {
            Side::White => 'w',
            Side::Black => 'b',
        };
        let ep = self
            .en_passant
            .map(|sq| sq.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} {} {} {} {} {}",
            self.placement(),
            side,
            self.castling,
            ep,
            self.halfmove_clock,
            self.fullmove_number
        )
    }
}

impl FromStr for BoardState {
    type Err = AnalyzerError;

    /// Parses FEN through `shakmaty`. Missing trailing fields take their
    /// defaults (white, no castling, no en passant, `0 1`); a fullmove number
    /// of 0 reads as 1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let setup = Fen::from_ascii(s.trim().as_bytes())
            .map_err(|e| AnalyzerError::InvalidPosition(format!("{e} (received: '{s}')")))?
            .into_setup();
        if setup.pockets.is_some() || setup.remaining_checks.is_some() {
            return Err(AnalyzerError::InvalidPosition(format!(
                "variant fields are not supported (received: '{s}')"
            )));
        }

        let mut grid = [[PieceLabel::Empty; 8]; 8];
        for (sq, piece) in setup.board.iter() {
            grid[sq.rank() as usize][sq.file() as usize] =
                PieceLabel::new(piece.color.into(), piece.role.into());
        }

        Ok(Self {
            grid,
            side_to_move: setup.turn.into(),
            castling: CastlingRights::from_rooks(setup.castling_rights),
            en_passant: setup.ep_square,
            halfmove_clock: setup.halfmoves,
            fullmove_number: setup.fullmoves.get(),
        })
    }
}

/// Parses FEN into a legal position. Structural errors and illegal setups both
/// surface as `InvalidPosition`.
pub fn position_from_fen(fen: &str) -> Result<Chess, AnalyzerError> {
    let parsed = Fen::from_ascii(fen.trim().as_bytes())
        .map_err(|e| AnalyzerError::InvalidPosition(format!("{e} (received: '{fen}')")))?;
    parsed
        .into_position::<Chess>(CastlingMode::Standard)
        .map_err(|e| AnalyzerError::InvalidPosition(format!("{e} (received: '{fen}')")))
}
