//! Position encoding (Step 3 in the pipeline).
//! Slices the rectified board into 8x8 cells, classifies each one and builds a `BoardState`.
//! Image row 0 is rank 8, image column 0 is the a-file.
//! Pixels beyond `8 * (side / 8)` on either axis are ignored.

use image::imageops;
use tracing::warn;

use crate::board::{BoardState, PieceLabel};
use crate::classify::SquareClassifier;
use crate::detect::RectifiedBoard;
use crate::error::AnalyzerError;

/// One cell of the rectified board. `row` counts from the top of the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SquareRegion {
    pub row: u32,
    pub col: u32,
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// The 64 cell regions for a board of `side` pixels, row-major from the top-left.
pub fn square_regions(side: u32) -> Result<Vec<SquareRegion>, AnalyzerError> {
    let size = side / 8;
    if size == 0 {
        return Err(AnalyzerError::EncodingFailed(format!(
            "board side {side}px is too small to slice into 8x8 squares"
        )));
    }
    let regions = (0..8)
        .flat_map(|row| {
            (0..8).map(move |col| SquareRegion {
                row,
                col,
                x: col * size,
                y: row * size,
                size,
            })
        })
        .collect();
    Ok(regions)
}

/// Classifies every cell and returns the resulting position (white to move, `KQkq - 0 1`).
pub fn encode(
    board: &RectifiedBoard,
    classifier: &dyn SquareClassifier,
) -> Result<BoardState, AnalyzerError> {
    let mut grid = [[PieceLabel::Empty; 8]; 8];
    for region in square_regions(board.side())? {
        let cell = imageops::crop_imm(board.image(), region.x, region.y, region.size, region.size)
            .to_image();
        let label = classifier.classify(&cell).map_err(|e| {
            AnalyzerError::EncodingFailed(format!(
                "square at row {} col {}: {e}",
                region.row, region.col
            ))
        })?;
        grid[7 - region.row as usize][region.col as usize] = label;
    }
    Ok(BoardState::from_grid(grid))
}

/// Like [`encode`], but substitutes the initial position on failure.
/// The error is handed back alongside so callers can report the fallback.
pub fn encode_or_initial(
    board: &RectifiedBoard,
    classifier: &dyn SquareClassifier,
) -> (BoardState, Option<AnalyzerError>) {
    match encode(board, classifier) {
        Ok(state) => (state, None),
        Err(e) => {
            warn!(error = %e, "Encoding failed, falling back to the initial position");
            (BoardState::initial(), Some(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::INITIAL_FEN;
    use crate::classify::{ClassifyError, LuminanceClassifier};
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn board_of(side: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(side, side, Rgb([value, value, value]))
    }

    fn fill_cell(img: &mut RgbImage, row: u32, col: u32, cell: u32, value: u8) {
        draw_filled_rect_mut(
            img,
            Rect::at((col * cell) as i32, (row * cell) as i32).of_size(cell, cell),
            Rgb([value, value, value]),
        );
    }

    #[test]
    fn test_mid_luminance_board_is_empty() {
        let board = RectifiedBoard::new(board_of(240, 128)).unwrap();
        let state = encode(&board, &LuminanceClassifier::default()).unwrap();
        assert_eq!(state.placement(), "8/8/8/8/8/8/8/8");
        assert_eq!(state.to_fen(), "8/8/8/8/8/8/8/8 w KQkq - 0 1");
    }

    #[test]
    fn test_top_row_is_rank_eight() {
        let mut img = board_of(160, 128);
        fill_cell(&mut img, 0, 0, 20, 250);
        fill_cell(&mut img, 7, 7, 20, 10);
        fill_cell(&mut img, 3, 4, 20, 10);
        let board = RectifiedBoard::new(img).unwrap();
        let state = encode(&board, &LuminanceClassifier::default()).unwrap();
        assert_eq!(state.placement(), "P7/8/8/4p3/8/8/8/7p");
        assert_eq!(state.label_at(7, 0), PieceLabel::WhitePawn);
        assert_eq!(state.label_at(0, 7), PieceLabel::BlackPawn);
    }

    #[test]
    fn test_remainder_pixels_are_dropped() {
        // 8 * 20 = 160; the trailing 5px column and row are bright but ignored
        let mut img = board_of(165, 128);
        draw_filled_rect_mut(&mut img, Rect::at(160, 0).of_size(5, 165), Rgb([255, 255, 255]));
        draw_filled_rect_mut(&mut img, Rect::at(0, 160).of_size(165, 5), Rgb([255, 255, 255]));
        let board = RectifiedBoard::new(img).unwrap();
        let state = encode(&board, &LuminanceClassifier::default()).unwrap();
        assert_eq!(state.placement(), "8/8/8/8/8/8/8/8");
    }

    #[test]
    fn test_output_always_has_seven_separators() {
        let mut img = board_of(80, 128);
        for (row, col) in [(0, 3), (2, 2), (5, 7), (6, 0)] {
            fill_cell(&mut img, row, col, 10, if col % 2 == 0 { 240 } else { 20 });
        }
        let board = RectifiedBoard::new(img).unwrap();
        let state = encode(&board, &LuminanceClassifier::default()).unwrap();
        let placement = state.placement();
        assert_eq!(placement.matches('/').count(), 7);
        let decoded: BoardState = state.to_fen().parse().unwrap();
        assert_eq!(decoded.grid(), state.grid());
    }

    #[test]
    fn test_tiny_board_fails_and_falls_back() {
        let board = RectifiedBoard::new(board_of(7, 128)).unwrap();
        assert!(matches!(
            encode(&board, &LuminanceClassifier::default()),
            Err(AnalyzerError::EncodingFailed(_))
        ));
        let (state, err) = encode_or_initial(&board, &LuminanceClassifier::default());
        assert_eq!(state.to_fen(), INITIAL_FEN);
        assert!(err.is_some());
    }

    #[test]
    fn test_classifier_failure_is_reported() {
        let failing = |_: &RgbImage| -> Result<PieceLabel, ClassifyError> {
            Err(ClassifyError::Other("model not loaded".into()))
        };
        let board = RectifiedBoard::new(board_of(64, 128)).unwrap();
        let err = encode(&board, &failing).unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
        let (state, err) = encode_or_initial(&board, &failing);
        assert_eq!(state, BoardState::initial());
        assert!(matches!(err, Some(AnalyzerError::EncodingFailed(_))));
    }

    #[test]
    fn test_regions_cover_the_grid() {
        let regions = square_regions(100).unwrap();
        assert_eq!(regions.len(), 64);
        assert_eq!(regions[0], SquareRegion { row: 0, col: 0, x: 0, y: 0, size: 12 });
        assert_eq!(regions[63], SquareRegion { row: 7, col: 7, x: 84, y: 84, size: 12 });
    }
}
