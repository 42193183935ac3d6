// ============================================================================
// Built-in erase engine — exemplar inpainting (onion-peeling + PatchMatch)
// ============================================================================
//
// Core correctness principle: the patch distance must IGNORE marked pixels
// in the query patch — only border/context pixels participate in the
// comparison, otherwise the search "matches" the very content being removed.
//
// Algorithm: each outer pass fills the current boundary layer (marked pixels
// adjacent to clean pixels) by finding the best-matching source patch via
// PatchMatch (propagation + halving-radius random search). Filled pixels
// become source candidates for the next pass, so texture propagates from
// the outside inward.
//
// This engine needs no external files, which makes it the default: every
// install can run a batch even when no ONNX runtime is configured.

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

use crate::session::{InferenceSession, SessionError};

/// Quality presets trading runtime for seam quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseQuality {
    /// Small patches, few refinement passes — interactive-grade speed.
    Fast,
    /// 5×5 patches, moderate refinement (default).
    Balanced,
    /// 7×7 patches, full refinement — for final exports.
    HighQuality,
}

impl EraseQuality {
    pub fn label(&self) -> &'static str {
        match self {
            EraseQuality::Fast => "Fast",
            EraseQuality::Balanced => "Balanced",
            EraseQuality::HighQuality => "High Quality",
        }
    }

    pub fn patch_size(&self) -> u32 {
        match self {
            EraseQuality::Fast => 3,
            EraseQuality::Balanced => 5,
            EraseQuality::HighQuality => 7,
        }
    }

    pub fn refine_iters(&self) -> usize {
        match self {
            EraseQuality::Fast => 2,
            EraseQuality::Balanced => 3,
            EraseQuality::HighQuality => 6,
        }
    }
}

/// The built-in inference session. Stateless between calls, so the shared
/// handle is trivially reusable across a whole batch.
#[derive(Debug)]
pub struct PatchMatchSession {
    quality: EraseQuality,
}

impl PatchMatchSession {
    pub fn new(quality: EraseQuality) -> Self {
        Self { quality }
    }
}

impl InferenceSession for PatchMatchSession {
    fn name(&self) -> &str {
        "patchmatch"
    }

    fn erase(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, SessionError> {
        if image.dimensions() != mask.dimensions() {
            return Err(SessionError::InferenceFailed(format!(
                "mask {}x{} does not match image {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }
        // Nothing marked — the edit is the identity
        if mask.as_raw().iter().all(|&v| v == 0) {
            return Ok(image.clone());
        }
        Ok(fill_marked_region(
            image,
            mask,
            self.quality.patch_size(),
            self.quality.refine_iters(),
        ))
    }
}

/// Returns true if (x,y) is marked AND has at least one clean 4-connected
/// neighbour.
#[inline]
fn is_boundary_pixel(mask: &GrayImage, x: u32, y: u32) -> bool {
    if mask.get_pixel(x, y).0[0] == 0 {
        return false;
    }
    let (w, h) = mask.dimensions();
    for (dx, dy) in [(-1i32, 0), (1, 0), (0, -1i32), (0, 1)] {
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if nx >= 0
            && ny >= 0
            && nx < w as i32
            && ny < h as i32
            && mask.get_pixel(nx as u32, ny as u32).0[0] == 0
        {
            return true;
        }
    }
    false
}

/// Masked SSD between the patches around `(ax,ay)` and `(bx,by)`. Only
/// counts positions where BOTH pixels are clean. Returns f32::MAX when
/// fewer than `min_valid` pixel pairs survive the masking.
#[inline]
fn patch_ssd_masked(
    img: &RgbaImage,
    mask: &GrayImage,
    ax: i32,
    ay: i32,
    bx: i32,
    by: i32,
    half: i32,
    min_valid: usize,
) -> f32 {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut ssd = 0.0f32;
    let mut count = 0usize;
    for dy in -half..=half {
        for dx in -half..=half {
            let apx = ax + dx;
            let apy = ay + dy;
            let bpx = bx + dx;
            let bpy = by + dy;
            if apx < 0 || apy < 0 || apx >= w || apy >= h {
                continue;
            }
            if bpx < 0 || bpy < 0 || bpx >= w || bpy >= h {
                continue;
            }
            if mask.get_pixel(apx as u32, apy as u32).0[0] > 0 {
                continue;
            }
            if mask.get_pixel(bpx as u32, bpy as u32).0[0] > 0 {
                continue;
            }
            let pa = img.get_pixel(apx as u32, apy as u32);
            let pb = img.get_pixel(bpx as u32, bpy as u32);
            for c in 0..3usize {
                let d = pa.0[c] as f32 - pb.0[c] as f32;
                ssd += d * d;
            }
            count += 1;
        }
    }
    if count < min_valid { f32::MAX } else { ssd / count as f32 }
}

/// One propagation + random-search sweep over the boundary pixels.
/// Alternates sweep direction per iteration.
#[allow(clippy::too_many_arguments)]
fn refine_pass(
    img: &RgbaImage,
    mask: &GrayImage,
    pixels: &[(u32, u32)],
    nnf_ox: &mut [i32],
    nnf_oy: &mut [i32],
    nnf_ssd: &mut [f32],
    half: i32,
    min_valid: usize,
    max_radius: f32,
    iter: usize,
) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let forward = iter % 2 == 0;

    let iter_order: Box<dyn Iterator<Item = &(u32, u32)>> = if forward {
        Box::new(pixels.iter())
    } else {
        Box::new(pixels.iter().rev())
    };

    for &(hx, hy) in iter_order {
        let idx = (hy * img.width() + hx) as usize;
        let mut best_ox = nnf_ox[idx];
        let mut best_oy = nnf_oy[idx];
        let mut best_ssd = nnf_ssd[idx];

        // Propagation: offsets that worked for a spatial neighbour tend to
        // work here too
        let neighbours: &[(i32, i32)] = if forward {
            &[(-1, 0), (0, -1)]
        } else {
            &[(1, 0), (0, 1)]
        };
        for &(ndx, ndy) in neighbours {
            let nx = hx as i32 + ndx;
            let ny = hy as i32 + ndy;
            if nx < 0 || ny < 0 || nx >= w || ny >= h {
                continue;
            }
            let ni = (ny as u32 * img.width() + nx as u32) as usize;
            if nnf_ssd[ni] == f32::MAX {
                continue;
            }
            let cx = hx as i32 + nnf_ox[ni];
            let cy = hy as i32 + nnf_oy[ni];
            if cx < 0 || cy < 0 || cx >= w || cy >= h {
                continue;
            }
            if mask.get_pixel(cx as u32, cy as u32).0[0] > 0 {
                continue;
            }
            let ssd = patch_ssd_masked(img, mask, hx as i32, hy as i32, cx, cy, half, min_valid);
            if ssd < best_ssd {
                best_ssd = ssd;
                best_ox = cx - hx as i32;
                best_oy = cy - hy as i32;
            }
        }

        // Random search around the current best, halving the radius each step
        let mut rng = (hx as u64)
            .wrapping_mul(6364136223846793005)
            .wrapping_add((hy as u64).wrapping_mul(982451653))
            .wrapping_add(iter as u64 * 1234567891);
        let mut search_r = max_radius;
        while search_r >= 1.0 {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let ra = (rng >> 33) as f32 / (u32::MAX as f32);
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let rb = (rng >> 33) as f32 / (u32::MAX as f32);
            let cx = (hx as f32 + best_ox as f32 + (ra * 2.0 - 1.0) * search_r).round() as i32;
            let cy = (hy as f32 + best_oy as f32 + (rb * 2.0 - 1.0) * search_r).round() as i32;
            if cx >= 0
                && cy >= 0
                && cx < w
                && cy < h
                && mask.get_pixel(cx as u32, cy as u32).0[0] == 0
            {
                let ssd =
                    patch_ssd_masked(img, mask, hx as i32, hy as i32, cx, cy, half, min_valid);
                if ssd < best_ssd {
                    best_ssd = ssd;
                    best_ox = cx - hx as i32;
                    best_oy = cy - hy as i32;
                }
            }
            search_r *= 0.5;
        }

        nnf_ox[idx] = best_ox;
        nnf_oy[idx] = best_oy;
        nnf_ssd[idx] = best_ssd;
    }
}

/// Fill every marked pixel of `mask` (value > 0) in `src`.
///
/// Key properties:
/// - SSD ignores marked pixels → matches surrounding context, not the
///   content being removed
/// - fills the boundary layer first, updates the mask, repeats → texture
///   grows inward coherently
/// - each peeling pass uses previously-filled pixels as source candidates
pub fn fill_marked_region(
    src: &RgbaImage,
    mask: &GrayImage,
    patch_size: u32,
    iterations: usize,
) -> RgbaImage {
    let (w, h) = src.dimensions();
    let ps = patch_size.max(3) as i32;
    let half = ps / 2;
    let min_valid = ((half as usize * 2 + 1).pow(2)).max(4) / 4;
    let max_radius = w.max(h) as f32;
    let total = (w * h) as usize;

    let mut out = src.clone();
    let mut live_mask = mask.clone();
    let mut nnf_ox = vec![0i32; total];
    let mut nnf_oy = vec![0i32; total];
    let mut nnf_ssd = vec![f32::MAX; total];

    let mut source_pixels: Vec<(u32, u32)> = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .filter(|&(x, y)| mask.get_pixel(x, y).0[0] == 0)
        .collect();

    if source_pixels.is_empty() {
        // Everything is marked — nothing to sample from
        return out;
    }

    // Onion-peeling loop: each pass fills one layer of the region boundary
    let max_peeling_passes = (w.max(h) as usize + 1) * 2;
    for _peel in 0..max_peeling_passes {
        let boundary: Vec<(u32, u32)> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .filter(|&(x, y)| is_boundary_pixel(&live_mask, x, y))
            .collect();

        if boundary.is_empty() {
            break;
        }

        let src_count = source_pixels.len();

        // Seed the NNF for this layer's pixels. Each seed is independent,
        // so this runs row-parallel.
        let seeds: Vec<(usize, i32, i32, f32)> = boundary
            .par_iter()
            .map(|&(hx, hy)| {
                let idx = (hy * w + hx) as usize;
                let mut best_ox = 0i32;
                let mut best_oy = 0i32;
                let mut best_ssd = f32::MAX;

                let mut rng = (hx as u64)
                    .wrapping_mul(7919)
                    .wrapping_add((hy as u64).wrapping_mul(6271));
                for attempt in 0..5u32 {
                    let si = if attempt == 0 {
                        (rng as usize) % src_count
                    } else {
                        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
                        (rng >> 33) as usize % src_count
                    };
                    let (sx, sy) = source_pixels[si];
                    let ssd = patch_ssd_masked(
                        &out, &live_mask, hx as i32, hy as i32, sx as i32, sy as i32, half,
                        min_valid,
                    );
                    if ssd < best_ssd {
                        best_ssd = ssd;
                        best_ox = sx as i32 - hx as i32;
                        best_oy = sy as i32 - hy as i32;
                    }
                }
                (idx, best_ox, best_oy, best_ssd)
            })
            .collect();
        for (idx, ox, oy, ssd) in seeds {
            nnf_ox[idx] = ox;
            nnf_oy[idx] = oy;
            nnf_ssd[idx] = ssd;
        }

        // Propagation/random-search refinement (sequential — propagation
        // depends on sweep order)
        let pm_iters = if iterations <= 3 { 2 } else { 4 };
        for iter in 0..pm_iters {
            refine_pass(
                &out,
                &live_mask,
                &boundary,
                &mut nnf_ox,
                &mut nnf_oy,
                &mut nnf_ssd,
                half,
                min_valid,
                max_radius,
                iter,
            );
        }

        // Fill this layer & update the live mask. Collect first — `out` is
        // both source and destination.
        let fills: Vec<(u32, u32, image::Rgba<u8>)> = boundary
            .iter()
            .filter_map(|&(hx, hy)| {
                let idx = (hy * w + hx) as usize;
                if nnf_ssd[idx] == f32::MAX {
                    return None;
                }
                let sx = hx as i32 + nnf_ox[idx];
                let sy = hy as i32 + nnf_oy[idx];
                if sx < 0 || sy < 0 || sx >= w as i32 || sy >= h as i32 {
                    return None;
                }
                if live_mask.get_pixel(sx as u32, sy as u32).0[0] > 0 {
                    return None;
                }
                Some((hx, hy, *out.get_pixel(sx as u32, sy as u32)))
            })
            .collect();

        for (x, y, pixel) in fills {
            out.put_pixel(x, y, pixel);
        }

        for (x, y) in &boundary {
            live_mask.put_pixel(*x, *y, image::Luma([0u8]));
            source_pixels.push((*x, *y));
        }
    }

    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Flat grey field with a white blotch; mask covers the blotch.
    fn blotched_field() -> (RgbaImage, GrayImage) {
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([120, 120, 120, 255]));
        let mut mask = GrayImage::new(32, 32);
        for y in 12..20 {
            for x in 12..20 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        (img, mask)
    }

    #[test]
    fn marked_region_is_filled_from_context() {
        let (img, mask) = blotched_field();
        let out = fill_marked_region(&img, &mask, 5, 3);

        // Every previously-white pixel must have been replaced with
        // something close to the surrounding grey.
        for y in 12..20 {
            for x in 12..20 {
                let p = out.get_pixel(x, y);
                assert!(
                    p.0[0] < 200 && p.0[1] < 200 && p.0[2] < 200,
                    "pixel ({},{}) still blotch-colored: {:?}",
                    x,
                    y,
                    p
                );
            }
        }
        // Clean pixels are untouched
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(0, 0));
        assert_eq!(out.get_pixel(31, 31), img.get_pixel(31, 31));
    }

    #[test]
    fn empty_mask_is_identity() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([10, 200, 30, 255]));
        let mask = GrayImage::new(16, 16);
        let session = PatchMatchSession::new(EraseQuality::Fast);
        let out = session.erase(&img, &mask).unwrap();
        assert_eq!(out.as_raw(), img.as_raw());
    }

    #[test]
    fn fully_marked_image_does_not_hang_or_panic() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([50, 50, 50, 255]));
        let mask = GrayImage::from_pixel(8, 8, image::Luma([255]));
        let out = fill_marked_region(&img, &mask, 3, 2);
        assert_eq!(out.dimensions(), (8, 8));
    }

    #[test]
    fn mismatched_mask_is_an_inference_error() {
        let img = RgbaImage::new(16, 16);
        let mask = GrayImage::new(8, 8);
        let session = PatchMatchSession::new(EraseQuality::Balanced);
        let err = session.erase(&img, &mask).unwrap_err();
        assert!(matches!(err, SessionError::InferenceFailed(_)));
    }

    #[test]
    fn quality_presets_expose_sane_parameters() {
        assert!(EraseQuality::Fast.patch_size() < EraseQuality::HighQuality.patch_size());
        assert!(EraseQuality::Fast.refine_iters() < EraseQuality::HighQuality.refine_iters());
        assert_eq!(EraseQuality::Balanced.label(), "Balanced");
    }
}
