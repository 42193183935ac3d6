// ============================================================================
// Staging store — processed outputs held for a later bulk export
// ============================================================================
//
// In stage-for-export mode the batch runner does not write results as it
// goes; each one lands here as an encoded PNG blob keyed by a fresh id. A
// single `export_all` then writes every record to a directory (optionally
// re-encoding to another format) and clears the store only after the whole
// export succeeded.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::io::{self, SaveFormat};

/// One processed output awaiting export.
#[derive(Clone)]
pub struct StagedOutput {
    pub id: String,
    pub file_name: String,
    /// PNG-encoded raster.
    pub blob: Vec<u8>,
    pub timestamp_ms: u64,
}

#[derive(Default)]
pub struct StagingStore {
    records: Mutex<Vec<StagedOutput>>,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl StagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one encoded output. Returns the generated record id.
    pub fn store(&self, file_name: String, blob: Vec<u8>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = StagedOutput {
            id: id.clone(),
            file_name,
            blob,
            timestamp_ms: epoch_ms(),
        };
        self.records.lock().unwrap().push(record);
        id
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Snapshot of the staged records, oldest first.
    pub fn snapshot(&self) -> Vec<StagedOutput> {
        self.records.lock().unwrap().clone()
    }

    /// Write every staged record into `dir`. With `reencode` set, each blob
    /// is decoded and re-encoded to the requested format/quality and the
    /// file extension is rewritten to match; otherwise the stored PNG bytes
    /// go to disk as-is. The store is cleared only when every record was
    /// written — a failed export leaves everything staged for a retry.
    pub fn export_all(
        &self,
        dir: &Path,
        reencode: Option<(SaveFormat, u8)>,
    ) -> Result<usize, String> {
        let records = self.snapshot();
        if records.is_empty() {
            return Ok(0);
        }

        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;

        for record in &records {
            match reencode {
                Some((format, quality)) => {
                    let img = image::load_from_memory(&record.blob)
                        .map_err(|e| format!("Failed to decode staged '{}': {}", record.file_name, e))?
                        .into_rgba8();
                    let renamed = swap_extension(&record.file_name, format.extension());
                    let path = dir.join(&renamed);
                    io::encode_and_write(&img, &path, format, quality)
                        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
                }
                None => {
                    let path = dir.join(&record.file_name);
                    std::fs::write(&path, &record.blob)
                        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
                }
            }
        }

        let count = records.len();
        self.records.lock().unwrap().clear();
        log_info!("[STAGE] exported {} staged output(s) to {}", count, dir.display());
        Ok(count)
    }

    /// Drop all staged records without exporting.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

fn swap_extension(file_name: &str, ext: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, ext),
        _ => format!("{}.{}", file_name, ext),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample_blob() -> Vec<u8> {
        let mut img = RgbaImage::new(3, 3);
        img.put_pixel(0, 0, Rgba([9, 8, 7, 255]));
        io::encode_png_blob(&img).unwrap()
    }

    #[test]
    fn store_assigns_unique_ids_and_keeps_order() {
        let store = StagingStore::new();
        let a = store.store("a.png".into(), sample_blob());
        let b = store.store("b.png".into(), sample_blob());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);

        let snap = store.snapshot();
        assert_eq!(snap[0].file_name, "a.png");
        assert_eq!(snap[1].file_name, "b.png");
        assert!(snap[0].timestamp_ms <= snap[1].timestamp_ms);
    }

    #[test]
    fn export_writes_blobs_verbatim_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new();
        let blob = sample_blob();
        store.store("keep.png".into(), blob.clone());

        let n = store.export_all(dir.path(), None).unwrap();
        assert_eq!(n, 1);
        assert!(store.is_empty());
        assert_eq!(std::fs::read(dir.path().join("keep.png")).unwrap(), blob);
    }

    #[test]
    fn export_can_reencode_with_new_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new();
        store.store("photo.png".into(), sample_blob());

        store
            .export_all(dir.path(), Some((SaveFormat::Jpeg, 85)))
            .unwrap();
        let out = dir.path().join("photo.jpg");
        assert!(out.exists());
        let img = image::open(&out).unwrap().into_rgba8();
        assert_eq!(img.dimensions(), (3, 3));
    }

    #[test]
    fn failed_export_leaves_records_staged() {
        let store = StagingStore::new();
        store.store("x.png".into(), vec![1, 2, 3]); // not a decodable image

        let err = store
            .export_all(
                tempfile::tempdir().unwrap().path(),
                Some((SaveFormat::Jpeg, 85)),
            )
            .unwrap_err();
        assert!(err.contains("x.png"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_export_is_a_noop() {
        let store = StagingStore::new();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store.export_all(dir.path(), None).unwrap(), 0);
    }
}
