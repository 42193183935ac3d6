// ============================================================================
// Image I/O — decoding, thread-safe encoding, derived output names
// ============================================================================

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageError, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::mask::Mask;

/// Output formats the batch runner can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
    Webp,
    Bmp,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Webp => "webp",
            SaveFormat::Bmp => "bmp",
        }
    }

    /// Map a file extension (without dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(SaveFormat::Png),
            "jpg" | "jpeg" => Some(SaveFormat::Jpeg),
            "webp" => Some(SaveFormat::Webp),
            "bmp" => Some(SaveFormat::Bmp),
            _ => None,
        }
    }
}

/// Decode an image file into RGBA. Returns a user-facing message on failure;
/// the caller decides whether that aborts anything.
pub fn load_image_sync(path: &Path) -> Result<RgbaImage, String> {
    let img = image::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    Ok(img.into_rgba8())
}

/// Encode and write an image to a file.
/// This is a standalone function (no `&mut self`) so it can be called from
/// background threads.
pub fn encode_and_write(
    image: &RgbaImage,
    path: &Path,
    format: SaveFormat,
    quality: u8,
) -> Result<(), ImageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match format {
        SaveFormat::Png => {
            let encoder = PngEncoder::new(&mut writer);
            #[allow(deprecated)]
            encoder.encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Jpeg => {
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
            encoder.encode(
                rgb_image.as_raw(),
                rgb_image.width(),
                rgb_image.height(),
                image::ColorType::Rgb8,
            )?;
        }
        SaveFormat::Webp => {
            let dyn_img = DynamicImage::ImageRgba8(image.clone());
            dyn_img.save(path)?;
        }
        SaveFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
    }

    Ok(())
}

/// Encode an image to an in-memory PNG blob (the staging store keeps encoded
/// bytes, not rasters).
pub fn encode_png_blob(image: &RgbaImage) -> Result<Vec<u8>, ImageError> {
    let mut blob = Vec::new();
    let encoder = PngEncoder::new(&mut blob);
    #[allow(deprecated)]
    encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(blob)
}

/// Encode a mask as a single-channel PNG. The transport form stays strictly
/// two-valued (0 background, 255 foreground) and keeps the companion image's
/// exact dimensions.
pub fn encode_mask_png(mask: &Mask) -> Result<Vec<u8>, ImageError> {
    let mut blob = Vec::new();
    let encoder = PngEncoder::new(&mut blob);
    #[allow(deprecated)]
    encoder.encode(mask.as_raw(), mask.width(), mask.height(), image::ColorType::L8)?;
    Ok(blob)
}

/// Longest base name (stem) an output file may carry before truncation.
const MAX_STEM_LEN: usize = 60;
/// Appended to every processed output's stem.
const OUTPUT_SUFFIX: &str = "_cleaned";

/// Build the output file name for a processed input:
/// stem minus filesystem-unsafe punctuation, truncated with an ellipsis
/// marker when too long, then the fixed suffix, then the original extension
/// (`png` when the input had none).
pub fn derived_file_name(original_name: &str) -> String {
    let (stem, ext) = match original_name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() && !e.is_empty() => (s, e),
        _ => (original_name, "png"),
    };

    let mut clean: String = stem
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if clean.is_empty() {
        clean.push_str("output");
    }

    if clean.chars().count() > MAX_STEM_LEN {
        clean = clean.chars().take(MAX_STEM_LEN).collect();
        clean.push_str("...");
    }

    format!("{}{}.{}", clean, OUTPUT_SUFFIX, ext)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn derived_name_keeps_stem_and_extension() {
        assert_eq!(derived_file_name("holiday.jpg"), "holiday_cleaned.jpg");
    }

    #[test]
    fn derived_name_defaults_missing_extension_to_png() {
        assert_eq!(derived_file_name("scan"), "scan_cleaned.png");
        assert_eq!(derived_file_name(".hidden"), ".hidden_cleaned.png");
    }

    #[test]
    fn derived_name_replaces_unsafe_punctuation() {
        assert_eq!(derived_file_name("a/b:c*d.png"), "a_b_c_d_cleaned.png");
    }

    #[test]
    fn derived_name_truncates_long_stems_with_marker() {
        let long = format!("{}.png", "x".repeat(200));
        let name = derived_file_name(&long);
        assert!(name.starts_with(&"x".repeat(MAX_STEM_LEN)));
        assert!(name.contains("..."));
        assert!(name.ends_with("_cleaned.png"));
        let stem_part = name.strip_suffix("_cleaned.png").unwrap();
        assert_eq!(stem_part.chars().count(), MAX_STEM_LEN + 3);
    }

    #[test]
    fn round_trip_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        let mut img = RgbaImage::new(4, 3);
        img.put_pixel(1, 1, Rgba([200, 10, 30, 255]));

        encode_and_write(&img, &path, SaveFormat::Png, 90).unwrap();
        let loaded = load_image_sync(&path).unwrap();
        assert_eq!(loaded.dimensions(), (4, 3));
        assert_eq!(loaded.get_pixel(1, 1), &Rgba([200, 10, 30, 255]));
    }

    #[test]
    fn mask_png_blob_is_single_channel() {
        let mut mask = Mask::new(5, 5);
        mask.put_pixel(2, 2, image::Luma([255]));
        let blob = encode_mask_png(&mask).unwrap();
        // PNG magic + IHDR color type 0 (grayscale) at fixed offset
        assert_eq!(&blob[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        assert_eq!(blob[25], 0);
    }

    #[test]
    fn format_extension_mapping() {
        assert_eq!(SaveFormat::from_extension("JPEG"), Some(SaveFormat::Jpeg));
        assert_eq!(SaveFormat::from_extension("png"), Some(SaveFormat::Png));
        assert_eq!(SaveFormat::from_extension("tiff"), None);
        assert_eq!(SaveFormat::Jpeg.extension(), "jpg");
    }
}
