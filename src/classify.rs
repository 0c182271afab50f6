//! Square classification.
//! `SquareClassifier` is the seam a real piece recognizer plugs into; the
//! encoder and detector never depend on a concrete implementation.
//! `LuminanceClassifier` is the coarse reference: it only tells light, dark
//! and mid-tone squares apart.

use image::RgbImage;
use thiserror::Error;

use crate::board::PieceLabel;
use crate::config::ClassifierConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("square region is empty ({width}x{height})")]
    EmptyRegion { width: u32, height: u32 },

    #[error("{0}")]
    Other(String),
}

/// Maps one square's pixels to a label. Must be deterministic and free of side effects.
pub trait SquareClassifier: Send + Sync {
    fn classify(&self, square: &RgbImage) -> Result<PieceLabel, ClassifyError>;
}

impl<F> SquareClassifier for F
where
    F: Fn(&RgbImage) -> Result<PieceLabel, ClassifyError> + Send + Sync,
{
    fn classify(&self, square: &RgbImage) -> Result<PieceLabel, ClassifyError> {
        self(square)
    }
}

/// Mean-luminance heuristic: mid band = empty, bright = white pawn, dark = black pawn.
#[derive(Clone, Debug)]
pub struct LuminanceClassifier {
    lower: f32,
    upper: f32,
}

impl LuminanceClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            lower: config.empty_lower,
            upper: config.empty_upper,
        }
    }
}

impl Default for LuminanceClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl SquareClassifier for LuminanceClassifier {
    fn classify(&self, square: &RgbImage) -> Result<PieceLabel, ClassifyError> {
        let luminance = mean_luminance(square)?;
        let label = if luminance > self.lower && luminance < self.upper {
            PieceLabel::Empty
        } else if luminance >= self.upper {
            PieceLabel::WhitePawn
        } else {
            PieceLabel::BlackPawn
        };
        Ok(label)
    }
}

/// Average of the luma channel over the whole region, on a 0-255 scale.
pub fn mean_luminance(square: &RgbImage) -> Result<f32, ClassifyError> {
    let (width, height) = square.dimensions();
    if width == 0 || height == 0 {
        return Err(ClassifyError::EmptyRegion { width, height });
    }
    let total: u64 = square
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            // Rec. 601 weights in fixed point
            (299 * u64::from(r) + 587 * u64::from(g) + 114 * u64::from(b)) / 1000
        })
        .sum();
    Ok(total as f32 / (u64::from(width) * u64::from(height)) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(20, 20, Rgb([value, value, value]))
    }

    #[test]
    fn test_mid_band_is_empty() {
        let classifier = LuminanceClassifier::default();
        assert_eq!(classifier.classify(&solid(128)).unwrap(), PieceLabel::Empty);
        assert_eq!(classifier.classify(&solid(91)).unwrap(), PieceLabel::Empty);
        assert_eq!(classifier.classify(&solid(169)).unwrap(), PieceLabel::Empty);
    }

    #[test]
    fn test_band_edges() {
        let classifier = LuminanceClassifier::default();
        assert_eq!(classifier.classify(&solid(170)).unwrap(), PieceLabel::WhitePawn);
        assert_eq!(classifier.classify(&solid(250)).unwrap(), PieceLabel::WhitePawn);
        assert_eq!(classifier.classify(&solid(90)).unwrap(), PieceLabel::BlackPawn);
        assert_eq!(classifier.classify(&solid(10)).unwrap(), PieceLabel::BlackPawn);
    }

    #[test]
    fn test_configurable_band() {
        let classifier = LuminanceClassifier::new(&ClassifierConfig {
            empty_lower: 20.0,
            empty_upper: 40.0,
        });
        assert_eq!(classifier.classify(&solid(30)).unwrap(), PieceLabel::Empty);
        assert_eq!(classifier.classify(&solid(128)).unwrap(), PieceLabel::WhitePawn);
    }

    #[test]
    fn test_deterministic() {
        let classifier = LuminanceClassifier::default();
        let mut img = solid(60);
        img.put_pixel(3, 3, Rgb([255, 0, 0]));
        let first = classifier.classify(&img).unwrap();
        for _ in 0..5 {
            assert_eq!(classifier.classify(&img).unwrap(), first);
        }
    }

    #[test]
    fn test_empty_region_is_an_error() {
        let classifier = LuminanceClassifier::default();
        let err = classifier.classify(&RgbImage::new(0, 0)).unwrap_err();
        assert_eq!(err, ClassifyError::EmptyRegion { width: 0, height: 0 });
    }

    #[test]
    fn test_closure_classifier() {
        let always_king = |_: &RgbImage| Ok::<_, ClassifyError>(PieceLabel::BlackKing);
        assert_eq!(always_king.classify(&solid(0)).unwrap(), PieceLabel::BlackKing);
    }
}
