//! Move descriptions (Step 5 in the pipeline).
//! Turns a coordinate-notation move into a sentence such as
//! "white knight from g1 to f3, capturing the black pawn, check".
//! Piece identity comes from the board before the move; check and mate come
//! from playing the move on a copy of the position.

use shakmaty::uci::UciMove;
use shakmaty::{Chess, Position, Square};

use crate::board::{BoardState, PieceKind, Side};

pub const NO_MOVE: &str = "No move available";

/// Describes `mv` as played from `before`. Absent or malformed moves get a generic fallback.
pub fn describe(before: &BoardState, mv: Option<&str>) -> String {
    let Some(raw) = mv.map(str::trim).filter(|m| m.len() >= 4) else {
        return NO_MOVE.to_string();
    };
    let Ok(UciMove::Normal { from, to, promotion }) = raw.parse::<UciMove>() else {
        return format!("Move {raw}");
    };
    let Some((side, kind)) = before.label_on(from).piece() else {
        return format!("Move from {from} to {to}");
    };

    let legal = before.to_position().ok().and_then(|pos| {
        let m = UciMove::Normal { from, to, promotion }.to_move(&pos).ok()?;
        Some((pos, m))
    });

    let mut text = format!("{} {} from {from} to {to}", side.name(), kind.name());

    let captured = before.label_on(to).piece().or_else(|| {
        // En passant lands on an empty square
        legal
            .as_ref()
            .filter(|(_, m)| m.is_en_passant())
            .map(|_| (opponent(side), PieceKind::Pawn))
    });
    if let Some((captured_side, captured_kind)) = captured {
        text.push_str(&format!(
            ", capturing the {} {}",
            captured_side.name(),
            captured_kind.name()
        ));
    }

    if let Some(role) = promotion {
        text.push_str(&format!(", promoting to a {}", PieceKind::from(role).name()));
    }

    if kind == PieceKind::King && file_distance(from, to) == 2 {
        if to.file() > from.file() {
            text.push_str(" (kingside castling)");
        } else {
            text.push_str(" (queenside castling)");
        }
    }

    if let Some((pos, m)) = legal {
        text.push_str(check_suffix(pos, m));
    }

    text
}

/// Convenience over a raw FEN string; unparsable notation yields the generic fallback.
pub fn describe_fen(fen: &str, mv: Option<&str>) -> String {
    match fen.parse::<BoardState>() {
        Ok(state) => describe(&state, mv),
        Err(_) => match mv {
            Some(m) if m.len() >= 4 => format!("Move {m}"),
            _ => NO_MOVE.to_string(),
        },
    }
}

fn check_suffix(mut pos: Chess, m: shakmaty::Move) -> &'static str {
    pos.play_unchecked(m);
    if pos.is_checkmate() {
        ", checkmate"
    } else if pos.is_check() {
        ", check"
    } else {
        ""
    }
}

fn file_distance(from: Square, to: Square) -> u32 {
    (from.file() as i32 - to.file() as i32).unsigned_abs()
}

fn opponent(side: Side) -> Side {
    match side {
        Side::White => Side::Black,
        Side::Black => Side::White,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(fen: &str) -> BoardState {
        fen.parse().unwrap()
    }

    #[test]
    fn test_opening_pawn_push() {
        let text = describe(&BoardState::initial(), Some("e2e4"));
        assert_eq!(text, "white pawn from e2 to e4");
        assert!(!text.contains("capturing"));
        assert!(!text.contains("check"));
    }

    #[test]
    fn test_knight_move() {
        assert_eq!(
            describe(&BoardState::initial(), Some("g1f3")),
            "white knight from g1 to f3"
        );
    }

    #[test]
    fn test_capture() {
        let before = state("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2");
        assert_eq!(
            describe(&before, Some("e4d5")),
            "white pawn from e4 to d5, capturing the black pawn"
        );
    }

    #[test]
    fn test_en_passant_capture() {
        let before = state("rnbqkbnr/ppp1p1pp/8/3pPp2/8/8/PPPP1PPP/RNBQKBNR w KQkq f6 0 3");
        assert_eq!(
            describe(&before, Some("e5f6")),
            "white pawn from e5 to f6, capturing the black pawn"
        );
    }

    #[test]
    fn test_promotion() {
        let before = state("8/P6k/8/8/8/8/8/K7 w - - 0 1");
        assert_eq!(
            describe(&before, Some("a7a8q")),
            "white pawn from a7 to a8, promoting to a queen"
        );
    }

    #[test]
    fn test_castling_both_sides() {
        let before = state("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1");
        assert_eq!(
            describe(&before, Some("e1g1")),
            "white king from e1 to g1 (kingside castling)"
        );
        let mut black = before.clone();
        black.side_to_move = Side::Black;
        assert_eq!(
            describe(&black, Some("e8c8")),
            "black king from e8 to c8 (queenside castling)"
        );
    }

    #[test]
    fn test_check_and_checkmate() {
        // Scholar's mate
        let before = state("r1bqkbnr/pppp1ppp/2n5/4p2Q/2B1P3/8/PPPP1PPP/RNB1K1NR w KQkq - 2 3");
        assert_eq!(
            describe(&before, Some("h5f7")),
            "white queen from h5 to f7, capturing the black pawn, checkmate"
        );

        let before = state("4k3/8/8/8/8/8/8/R3K3 w - - 0 1");
        assert_eq!(describe(&before, Some("a1a8")), "white rook from a1 to a8, check");
    }

    #[test]
    fn test_fallbacks() {
        let initial = BoardState::initial();
        assert_eq!(describe(&initial, None), NO_MOVE);
        assert_eq!(describe(&initial, Some("e2")), NO_MOVE);
        assert_eq!(describe(&initial, Some("zzzz")), "Move zzzz");
        assert_eq!(describe(&initial, Some("e4e5")), "Move from e4 to e5");
    }

    #[test]
    fn test_illegal_move_has_no_check_suffix() {
        // Pieces still named from the board, but nothing is played
        assert_eq!(
            describe(&BoardState::initial(), Some("d1d7")),
            "white queen from d1 to d7, capturing the black pawn"
        );
    }

    #[test]
    fn test_describe_fen() {
        assert_eq!(
            describe_fen(crate::board::INITIAL_FEN, Some("b1c3")),
            "white knight from b1 to c3"
        );
        assert_eq!(describe_fen("invalid-fen-string", Some("e2e4")), "Move e2e4");
        assert_eq!(describe_fen("invalid-fen-string", None), NO_MOVE);
    }
}
