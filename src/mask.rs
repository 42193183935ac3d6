// ============================================================================
// Mask compositor — rasterizes a stroke set into a binary removal mask
// ============================================================================
//
// A mask is a single-channel raster the exact size of one target image:
// 0 = background (keep), 255 = foreground (remove/inpaint). It is derived
// per compositing call and never persisted except as the transport PNG the
// inference engine receives (see `io::encode_mask_png`).
//
// Rasterization stamps a filled disc of the stroke's diameter at each point
// and at sub-radius spacing along every segment — the same interpolation the
// brush tools use while painting — which gives round caps and round joins
// for free. Foreground is idempotent, so stroke order never matters.

use image::GrayImage;

use rayon::prelude::*;

use crate::coords::{Space, Stroke, TargetSize};

/// Binary mask raster. 0 = background, 255 = foreground.
pub type Mask = GrayImage;

pub const BACKGROUND: u8 = 0;
pub const FOREGROUND: u8 = 255;

/// Upper bound on mask pixels (16384²). Anything larger is treated the same
/// as an unallocatable surface.
const MAX_MASK_PIXELS: u64 = 16384 * 16384;

/// Errors raised by mask compositing.
#[derive(Debug)]
pub enum MaskError {
    /// A raster surface of the requested size cannot be allocated.
    SurfaceUnavailable(String),
}

impl std::fmt::Display for MaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskError::SurfaceUnavailable(why) => {
                write!(f, "mask surface unavailable: {}", why)
            }
        }
    }
}

impl std::error::Error for MaskError {}

/// One disc stamp in target-pixel space, produced while walking a stroke.
#[derive(Clone, Copy)]
struct Disc {
    cx: f32,
    cy: f32,
    r: f32,
}

/// Composite a stroke set (already in target-pixel space, see
/// `coords::strokes_to_target`) into a fresh binary mask of `target` size.
///
/// Strokes with an empty point list or a non-positive/undefined width are
/// skipped without error — an in-progress stroke with no points yet must
/// not corrupt the mask. Compositing the same stroke set twice yields
/// pixel-identical rasters.
pub fn composite(strokes: &[Stroke], target: TargetSize) -> Result<Mask, MaskError> {
    if target.width == 0 || target.height == 0 {
        return Err(MaskError::SurfaceUnavailable(format!(
            "zero dimension {}x{}",
            target.width, target.height
        )));
    }
    let pixels = target.width as u64 * target.height as u64;
    if pixels > MAX_MASK_PIXELS {
        return Err(MaskError::SurfaceUnavailable(format!(
            "{}x{} exceeds the {} pixel cap",
            target.width, target.height, MAX_MASK_PIXELS
        )));
    }

    let mut discs: Vec<Disc> = Vec::new();
    for stroke in strokes {
        debug_assert_ne!(stroke.space, Space::Relative, "denormalize before compositing");
        collect_stroke_discs(stroke, &mut discs);
    }

    let mut mask = GrayImage::from_pixel(target.width, target.height, image::Luma([BACKGROUND]));
    if discs.is_empty() {
        return Ok(mask);
    }

    // Row-parallel fill: each row scans only the discs whose vertical extent
    // touches it and paints the horizontal chord span. Rows are disjoint, so
    // this needs no synchronisation.
    let width = target.width as usize;
    let buf: &mut [u8] = &mut mask;
    buf.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let yc = y as f32 + 0.5;
            for disc in &discs {
                let dy = yc - disc.cy;
                if dy.abs() > disc.r {
                    continue;
                }
                let half = (disc.r * disc.r - dy * dy).sqrt();
                let x0 = ((disc.cx - half).floor().max(0.0)) as usize;
                let x1 = ((disc.cx + half).ceil().min(width as f32)) as usize;
                for px in &mut row[x0.min(width)..x1] {
                    *px = FOREGROUND;
                }
            }
        });

    Ok(mask)
}

/// Walk one stroke and emit disc stamps: one per point, plus interpolated
/// stamps along each segment at half-radius spacing.
fn collect_stroke_discs(stroke: &Stroke, out: &mut Vec<Disc>) {
    if stroke.points.is_empty() {
        return;
    }
    if !(stroke.width > 0.0) {
        // Catches zero, negative, and NaN widths in one comparison
        return;
    }
    let r = (stroke.width * 0.5).max(0.5);

    let first = stroke.points[0];
    out.push(Disc {
        cx: first.x,
        cy: first.y,
        r,
    });

    for pair in stroke.points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let dist = (dx * dx + dy * dy).sqrt();
        let step = (r * 0.5).max(0.25);
        let n = (dist / step).ceil() as u32;
        for i in 1..=n.max(1) {
            let t = i as f32 / n.max(1) as f32;
            out.push(Disc {
                cx: a.x + dx * t,
                cy: a.y + dy * t,
                r,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
