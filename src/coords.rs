// ============================================================================
// Coordinate spaces — display-pixel ↔ relative [0,1] ↔ target-image-pixel
// ============================================================================
//
// Pointer events arrive in *logical* display pixels (CSS-pixel-equivalent;
// the OS applies the device-pixel scale before we ever see a position), so
// every conversion here divides or multiplies by logical sizes. Relative
// coordinates are fractions of the capture surface and are the only form
// that ever gets committed or serialized — they survive any later resize of
// the display surface and transfer unchanged onto target images of any
// resolution.
//
// Conversions are pure and lossless up to f32 precision. Clamping at the
// display → relative boundary is the single information-losing step: a point
// dragged off the surface edge is pulled back to [0,1] and logged, never
// rejected.

use serde::{Deserialize, Serialize};

/// A 2-D coordinate. Which space it lives in is implicit from context —
/// callers never mix spaces without an explicit conversion call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// The space a stroke's points are expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Space {
    /// Logical display pixels — only while the stroke is being drawn.
    Display,
    /// Fractions of the capture surface in [0,1] — every committed stroke.
    Relative,
}

/// One continuous freehand gesture: an ordered polyline plus a thickness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub width: f32,
    pub space: Space,
}

impl Stroke {
    /// A new, empty in-progress stroke in display space.
    pub fn begin(width: f32) -> Self {
        Self {
            points: Vec::new(),
            width,
            space: Space::Display,
        }
    }
}

/// Logical size of the display surface strokes are captured on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceSize {
    pub width: f32,
    pub height: f32,
}

impl SurfaceSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Pixel dimensions of a target image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

// ============================================================================
// Point conversions
// ============================================================================

/// Display → relative. Divides by the *logical* surface size and clamps the
/// result to [0,1]. An out-of-range input (pointer dragged past the surface
/// edge) is corrected and logged — this never fails.
pub fn display_to_relative(p: Point, surface: SurfaceSize) -> Point {
    let raw = Point::new(p.x / surface.width.max(1.0), p.y / surface.height.max(1.0));
    let clamped = Point::new(raw.x.clamp(0.0, 1.0), raw.y.clamp(0.0, 1.0));
    if raw != clamped {
        log_warn!(
            "[COORDS] point ({:.2}, {:.2}) outside surface {}x{} — clamped to ({:.4}, {:.4})",
            p.x,
            p.y,
            surface.width,
            surface.height,
            clamped.x,
            clamped.y
        );
    }
    clamped
}

/// Relative → target pixels. Targets are trusted (≥ 0), so no clamping —
/// this keeps the conversion the exact inverse of `display_to_relative`
/// for in-bounds points.
pub fn relative_to_target(p: Point, target: TargetSize) -> Point {
    Point::new(p.x * target.width as f32, p.y * target.height as f32)
}

// ============================================================================
// Scalar (stroke width) conversions
// ============================================================================
//
// Width is normalized against the capture surface's logical *width* and
// denormalized against each target's pixel width. On targets whose aspect
// ratio differs wildly from the capture surface, the thickness is therefore
// proportional to width, not to what the user saw vertically — matching the
// capture-time behavior users calibrate their brush against.

pub fn width_to_relative(width: f32, surface_width: f32) -> f32 {
    width / surface_width.max(1.0)
}

pub fn relative_to_width(width: f32, target_width: u32) -> f32 {
    width * target_width as f32
}

// ============================================================================
// Whole-stroke conversions
// ============================================================================

/// Normalize a display-space stroke to relative space. Point order is
/// preserved; the width is normalized against the surface's logical width.
/// A stroke that is already relative passes through unchanged.
pub fn stroke_to_relative(stroke: &Stroke, surface: SurfaceSize) -> Stroke {
    if stroke.space == Space::Relative {
        return stroke.clone();
    }
    Stroke {
        points: stroke
            .points
            .iter()
            .map(|&p| display_to_relative(p, surface))
            .collect(),
        width: width_to_relative(stroke.width, surface.width),
        space: Space::Relative,
    }
}

/// Denormalize a relative stroke onto a target image's pixel grid. The
/// result is in target-pixel space, ready for the mask compositor. Callers
/// must not feed display-space strokes here; debug builds assert it.
pub fn stroke_to_target(stroke: &Stroke, target: TargetSize) -> Stroke {
    debug_assert_eq!(stroke.space, Space::Relative);
    Stroke {
        points: stroke
            .points
            .iter()
            .map(|&p| relative_to_target(p, target))
            .collect(),
        width: relative_to_width(stroke.width, target.width),
        // Target-pixel coordinates are display-like absolute pixels
        space: Space::Display,
    }
}

/// Denormalize an entire committed stroke set for one target image.
pub fn strokes_to_target(strokes: &[Stroke], target: TargetSize) -> Vec<Stroke> {
    strokes.iter().map(|s| stroke_to_target(s, target)).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() < EPS && (a.y - b.y).abs() < EPS
    }

    #[test]
    fn round_trip_is_identity_for_in_bounds_points() {
        let sizes = [(640u32, 480u32), (1920, 1080), (333, 77), (1, 1)];
        let points = [
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.25, 0.75),
            Point::new(0.5, 0.001),
        ];
        for &(w, h) in &sizes {
            let target = TargetSize::new(w, h);
            let surface = SurfaceSize::new(w as f32, h as f32);
            for &p in &points {
                let px = relative_to_target(p, target);
                let back = display_to_relative(px, surface);
                assert!(close(p, back), "{:?} -> {:?} -> {:?}", p, px, back);
            }
        }
    }

    #[test]
    fn out_of_range_display_input_clamps() {
        let surface = SurfaceSize::new(100.0, 100.0);
        let p = display_to_relative(Point::new(-30.0, 140.0), surface);
        assert_eq!(p, Point::new(0.0, 1.0));

        // Same check on an odd-sized surface
        let surface = SurfaceSize::new(17.0, 312.5);
        let p = display_to_relative(Point::new(-5.1, 437.5), surface);
        assert_eq!(p, Point::new(0.0, 1.0));
    }

    #[test]
    fn relative_to_target_does_not_clamp() {
        // Targets are trusted; slightly-out values pass through so the
        // inverse property holds exactly where it should.
        let p = relative_to_target(Point::new(1.5, -0.25), TargetSize::new(100, 200));
        assert_eq!(p, Point::new(150.0, -50.0));
    }

    #[test]
    fn width_round_trips_through_relative() {
        let rel = width_to_relative(24.0, 800.0);
        assert!((rel - 0.03).abs() < EPS);
        let back = relative_to_width(rel, 800);
        assert!((back - 24.0).abs() < EPS);

        // Different target width scales proportionally
        let scaled = relative_to_width(rel, 1600);
        assert!((scaled - 48.0).abs() < EPS);
    }

    #[test]
    fn stroke_normalization_preserves_order_and_clamps() {
        let surface = SurfaceSize::new(200.0, 100.0);
        let display = Stroke {
            points: vec![
                Point::new(0.0, 0.0),
                Point::new(100.0, 50.0),
                Point::new(250.0, -10.0), // off-surface on both axes
            ],
            width: 10.0,
            space: Space::Display,
        };

        let rel = stroke_to_relative(&display, surface);
        assert_eq!(rel.space, Space::Relative);
        assert_eq!(rel.points.len(), 3);
        assert!(close(rel.points[0], Point::new(0.0, 0.0)));
        assert!(close(rel.points[1], Point::new(0.5, 0.5)));
        assert!(close(rel.points[2], Point::new(1.0, 0.0)));
        assert!((rel.width - 0.05).abs() < EPS);
    }

    #[test]
    fn stroke_denormalization_hits_target_pixels() {
        let rel = Stroke {
            points: vec![Point::new(0.5, 0.25)],
            width: 0.05,
            space: Space::Relative,
        };
        let px = stroke_to_target(&rel, TargetSize::new(400, 400));
        assert!(close(px.points[0], Point::new(200.0, 100.0)));
        assert!((px.width - 20.0).abs() < EPS);
    }

    #[test]
    fn already_relative_stroke_passes_through() {
        let rel = Stroke {
            points: vec![Point::new(0.1, 0.9)],
            width: 0.02,
            space: Space::Relative,
        };
        let again = stroke_to_relative(&rel, SurfaceSize::new(999.0, 999.0));
        assert_eq!(rel, again);
    }
}
