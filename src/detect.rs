//! Board detection (Step 2 in the pipeline).
//! Finds the board outline in a raw frame and warps it to a top-down square.
//!
//! 1. Gaussian-weighted local threshold marks pixels darker than their
//!    neighbourhood. Uniform areas (lit or not) stay background.
//! 2. A small morphological close joins edge fragments that split where
//!    neighbouring squares have similar brightness.
//! 3. Outermost contours are traced with `imageproc`, and the convex hull of each
//!    is simplified (Douglas-Peucker, tolerance = a fraction of its perimeter).
//!    The first four-vertex polygon above the area threshold wins.
//! 4. Corners are ordered TL, TR, BR, BL and a homography maps them onto a
//!    square canvas whose side is the longest quadrilateral edge.
//!
//! Not finding a board is a normal outcome and is reported as `None`.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use imageproc::geometry::{approximate_polygon_dp, arc_length, contour_area, convex_hull};
use imageproc::morphology::close;
use imageproc::point::Point;
use shakmaty::Square;
use tracing::debug;

use crate::config::{CornerOrdering, DetectorConfig};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Corner {
    pub x: f32,
    pub y: f32,
}

impl Corner {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn distance(self, other: Corner) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn as_tuple(self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// Board outline in source-image coordinates, corners in cyclic order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quadrilateral {
    pub top_left: Corner,
    pub top_right: Corner,
    pub bottom_right: Corner,
    pub bottom_left: Corner,
}

impl Quadrilateral {
    /// Assigns four unordered vertices to corners.
    pub fn from_points(points: [Corner; 4], ordering: CornerOrdering) -> Self {
        match ordering {
            CornerOrdering::SumDiff => order_sum_diff(points),
            CornerOrdering::Angular => order_angular(points),
        }
    }

    pub fn corners(&self) -> [Corner; 4] {
        [self.top_left, self.top_right, self.bottom_right, self.bottom_left]
    }

    pub fn area(&self) -> f64 {
        contour_area(&self.corners().map(|c| Point::new(f64::from(c.x), f64::from(c.y))))
    }

    /// Canvas side: the longer of the widest horizontal and tallest vertical edge, truncated.
    pub fn side_length(&self) -> u32 {
        let width = self
            .top_right
            .distance(self.top_left)
            .max(self.bottom_right.distance(self.bottom_left));
        let height = self
            .bottom_left
            .distance(self.top_left)
            .max(self.bottom_right.distance(self.top_right));
        (width as u32).max(height as u32)
    }
}

fn order_sum_diff(points: [Corner; 4]) -> Quadrilateral {
    let mut by_sum = points;
    by_sum.sort_by(|a, b| (a.x + a.y).total_cmp(&(b.x + b.y)));
    let mut rest = [by_sum[1], by_sum[2]];
    rest.sort_by(|a, b| (a.y - a.x).total_cmp(&(b.y - b.x)));
    Quadrilateral {
        top_left: by_sum[0],
        top_right: rest[0],
        bottom_right: by_sum[3],
        bottom_left: rest[1],
    }
}

fn order_angular(points: [Corner; 4]) -> Quadrilateral {
    let cx = points.iter().map(|p| p.x).sum::<f32>() / 4.0;
    let cy = points.iter().map(|p| p.y).sum::<f32>() / 4.0;
    let mut sorted = points;
    // y grows downwards, so ascending atan2 walks clockwise on screen
    sorted.sort_by(|a, b| (a.y - cy).atan2(a.x - cx).total_cmp(&(b.y - cy).atan2(b.x - cx)));
    let start = (0..4)
        .min_by(|&i, &j| (sorted[i].x + sorted[i].y).total_cmp(&(sorted[j].x + sorted[j].y)))
        .unwrap_or(0);
    sorted.rotate_left(start);
    Quadrilateral {
        top_left: sorted[0],
        top_right: sorted[1],
        bottom_right: sorted[2],
        bottom_left: sorted[3],
    }
}

/// Top-down square view of the board. Side is always equal on both axes.
#[derive(Clone, Debug)]
pub struct RectifiedBoard {
    image: RgbImage,
}

impl RectifiedBoard {
    /// Wraps an already square image; `None` if the image is not square or is empty.
    pub fn new(image: RgbImage) -> Option<Self> {
        let (w, h) = image.dimensions();
        (w == h && w > 0).then_some(Self { image })
    }

    pub fn side(&self) -> u32 {
        self.image.width()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// A located board: its outline, the source-to-canvas homography and the warped canvas.
#[derive(Clone, Debug)]
pub struct Detection {
    pub quad: Quadrilateral,
    pub projection: Projection,
    pub board: RectifiedBoard,
}

impl Detection {
    /// Centre of `square` in source-image coordinates (white at the bottom of the canvas).
    pub fn square_center(&self, square: Square) -> (f32, f32) {
        let cell = (self.board.side() / 8) as f32;
        let col = square.file() as usize as f32;
        let row = (7 - square.rank() as usize) as f32;
        let canvas = ((col + 0.5) * cell, (row + 0.5) * cell);
        self.projection.invert() * canvas
    }
}

#[derive(Clone, Debug, Default)]
pub struct GeometryDetector {
    config: DetectorConfig,
}

impl GeometryDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Locates and rectifies the board, or `None` when no outline qualifies.
    pub fn detect(&self, image: &DynamicImage) -> Option<Detection> {
        let gray = image.to_luma8();
        let quad = self.find_quadrilateral(&gray)?;
        let color = image.to_rgb8();
        let (projection, board) = rectify(&color, &quad)?;
        debug!(side = board.side(), ?quad, "Board rectified");
        Some(Detection {
            quad,
            projection,
            board,
        })
    }

    /// Foreground (255) where a pixel is darker than its local Gaussian mean by at least the offset.
    pub fn binarize(&self, gray: &GrayImage) -> GrayImage {
        let window = self.config.threshold_window.max(3) as f32;
        let sigma = 0.3 * ((window - 1.0) * 0.5 - 1.0) + 0.8;
        let local_mean = gaussian_blur_f32(gray, sigma);
        let offset = self.config.threshold_offset;

        let mut binary = GrayImage::new(gray.width(), gray.height());
        for (x, y, pixel) in gray.enumerate_pixels() {
            let mean = f32::from(local_mean.get_pixel(x, y)[0]);
            let value = if f32::from(pixel[0]) <= mean - offset { 255 } else { 0 };
            binary.put_pixel(x, y, Luma([value]));
        }
        if self.config.close_radius > 0 {
            binary = close(&binary, Norm::LInf, self.config.close_radius);
        }
        binary
    }

    /// First outermost contour whose hull simplifies to four vertices with enough area.
    pub fn find_quadrilateral(&self, gray: &GrayImage) -> Option<Quadrilateral> {
        let binary = self.binarize(gray);
        let contours: Vec<Contour<i32>> = find_contours(&binary);
        let min_side = f64::from(self.config.min_board_size);
        let min_area = min_side * min_side;

        let mut considered = 0usize;
        for contour in contours.iter().filter(|c| c.parent.is_none()) {
            // Thin strokes are traced twice; the hull's angular sort needs distinct points
            let mut points = contour.points.clone();
            points.sort_by_key(|p| (p.y, p.x));
            points.dedup();
            let hull = convex_hull(points);
            if hull.len() < 4 {
                continue;
            }
            considered += 1;

            let epsilon = self.config.approx_epsilon_ratio * arc_length(&hull, true);
            let polygon = simplify_closed(&hull, epsilon);
            let Ok(vertices) = <[Point<i32>; 4]>::try_from(polygon) else {
                continue;
            };
            let quad = Quadrilateral::from_points(
                vertices.map(|p| Corner::new(p.x as f32, p.y as f32)),
                self.config.corner_ordering,
            );
            let area = quad.area();
            if area <= min_area {
                continue;
            }
            debug!(considered, area, "Board outline accepted");
            return Some(quad);
        }

        debug!(considered, total = contours.len(), "No board outline found");
        None
    }
}

/// Douglas-Peucker over a closed polygon: split at the vertex farthest from the
/// first one and simplify both halves, so the closing edge is tested too.
fn simplify_closed(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    if points.len() < 4 || !(epsilon > 0.0) {
        return points.to_vec();
    }
    let first = points[0];
    let far = (1..points.len())
        .max_by_key(|&i| {
            let dx = i64::from(points[i].x - first.x);
            let dy = i64::from(points[i].y - first.y);
            dx * dx + dy * dy
        })
        .unwrap_or(1);

    // Each half ends where the other starts
    let mut polygon = approximate_polygon_dp(&points[..=far], epsilon, false);
    polygon.pop();
    let mut tail = points[far..].to_vec();
    tail.push(first);
    let mut rest = approximate_polygon_dp(&tail, epsilon, false);
    rest.pop();
    polygon.extend(rest);
    polygon
}

/// Warps the quadrilateral onto a `side x side` canvas. `None` for degenerate outlines.
pub fn rectify(image: &RgbImage, quad: &Quadrilateral) -> Option<(Projection, RectifiedBoard)> {
    let side = quad.side_length();
    if side < 2 {
        return None;
    }
    let far = (side - 1) as f32;
    let from = quad.corners().map(Corner::as_tuple);
    let to = [(0.0, 0.0), (far, 0.0), (far, far), (0.0, far)];
    let projection = Projection::from_control_points(from, to)?;

    let mut canvas = RgbImage::new(side, side);
    warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut canvas);
    Some((projection, RectifiedBoard { image: canvas }))
}
