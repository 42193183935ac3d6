// ============================================================================
// Stroke store — per-image committed mark template + the in-progress stroke
// ============================================================================
//
// The committed template is an immutable, versioned snapshot: every commit,
// undo, and clear publishes a *new* `StrokeTemplate` (the stroke list lives
// behind an `Arc`, so publishing is a pointer swap and cloning a snapshot is
// cheap). Render and batch code hold their own snapshot and never observe a
// half-mutated list, no matter when a redraw lands relative to an edit.
//
// Undo is deliberately dual-purpose: while committed strokes exist it
// removes the newest stroke; once the template is empty it removes the most
// recently applied inference result instead. That mirrors how users think —
// "take back the last thing that changed the picture".

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::coords::{self, Point, Space, Stroke, SurfaceSize};

// ============================================================================
// StrokeTemplate — immutable snapshot of the committed strokes
// ============================================================================

/// The full committed stroke set for one image, always in relative space.
/// Snapshots are value-like: clone freely, compare versions to detect change.
#[derive(Clone, Debug)]
pub struct StrokeTemplate {
    strokes: Arc<Vec<Stroke>>,
    version: u64,
}

impl StrokeTemplate {
    pub fn empty() -> Self {
        Self {
            strokes: Arc::new(Vec::new()),
            version: 0,
        }
    }

    /// Snapshot an already-normalized stroke set (points in relative space).
    pub fn from_strokes(strokes: Vec<Stroke>) -> Self {
        Self {
            strokes: Arc::new(strokes),
            version: 1,
        }
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    /// Monotonically increasing per store; bumped by every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Serialize to the marks-file JSON form:
    /// `{ "strokes": [ { "points": [{"x","y"}], "width": ... } ] }`.
    pub fn to_json(&self) -> String {
        let file = TemplateFile {
            strokes: self
                .strokes
                .iter()
                .map(|s| TemplateFileStroke {
                    points: s.points.clone(),
                    width: s.width,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&file).unwrap_or_else(|_| "{\"strokes\":[]}".to_string())
    }

    /// Parse a marks file. Coordinates are clamped into [0,1] on load (and
    /// logged) so a hand-edited file cannot smuggle out-of-range points past
    /// the committed-stroke invariant.
    pub fn from_json(src: &str) -> Result<Self, String> {
        let file: TemplateFile =
            serde_json::from_str(src).map_err(|e| format!("invalid marks file: {}", e))?;
        let strokes: Vec<Stroke> = file
            .strokes
            .into_iter()
            .map(|s| {
                let points = s
                    .points
                    .into_iter()
                    .map(|p| {
                        let clamped = Point::new(p.x.clamp(0.0, 1.0), p.y.clamp(0.0, 1.0));
                        if clamped != p {
                            log_warn!(
                                "[MARKS] loaded point ({}, {}) outside [0,1] — clamped",
                                p.x,
                                p.y
                            );
                        }
                        clamped
                    })
                    .collect();
                Stroke {
                    points,
                    width: s.width,
                    space: Space::Relative,
                }
            })
            .collect();
        Ok(Self {
            strokes: Arc::new(strokes),
            version: 0,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct TemplateFileStroke {
    points: Vec<Point>,
    width: f32,
}

#[derive(Serialize, Deserialize)]
struct TemplateFile {
    strokes: Vec<TemplateFileStroke>,
}

// ============================================================================
// StrokeStore — one open image's edit state
// ============================================================================

/// An inference output already applied to this image, kept for undo.
pub struct AppliedResult {
    pub image: RgbaImage,
    pub label: String,
}

/// What `undo_last` actually removed.
#[derive(Debug, PartialEq, Eq)]
pub enum UndoAction {
    RemovedStroke,
    RemovedResult,
    Nothing,
}

pub struct StrokeStore {
    surface: SurfaceSize,
    template: StrokeTemplate,
    in_progress: Option<Stroke>,
    results: Vec<AppliedResult>,
}

impl StrokeStore {
    pub fn new(surface: SurfaceSize) -> Self {
        Self {
            surface,
            template: StrokeTemplate::empty(),
            in_progress: None,
            results: Vec::new(),
        }
    }

    /// Update the capture surface's logical size (window resized). Committed
    /// strokes are relative and unaffected; only future commits normalize
    /// against the new size.
    pub fn set_surface(&mut self, surface: SurfaceSize) {
        self.surface = surface;
    }

    /// Current committed snapshot (cheap clone — hand it to render/batch).
    pub fn template(&self) -> StrokeTemplate {
        self.template.clone()
    }

    /// The display-space stroke currently being drawn, if any.
    pub fn in_progress(&self) -> Option<&Stroke> {
        self.in_progress.as_ref()
    }

    pub fn results(&self) -> &[AppliedResult] {
        &self.results
    }

    /// Begin a new in-progress stroke in display space. Replaces any
    /// uncommitted stroke (pointer-down always starts fresh).
    pub fn start_stroke(&mut self, width: f32) {
        self.in_progress = Some(Stroke::begin(width));
    }

    /// Append a display-space point to the in-progress stroke. A point
    /// arriving with no active stroke is a hover artifact — dropped.
    pub fn append_point(&mut self, point: Point) {
        match &mut self.in_progress {
            Some(stroke) => stroke.points.push(point),
            None => log_warn!("[MARKS] append_point with no active stroke — ignored"),
        }
    }

    /// Convert the in-progress stroke to relative space, publish it as a new
    /// template version, and open a fresh empty stroke at the same width.
    /// A pointless commit (no active stroke, or zero points) publishes
    /// nothing.
    pub fn commit_stroke(&mut self) {
        let Some(active) = self.in_progress.take() else {
            return;
        };
        let width = active.width;
        if !active.points.is_empty() {
            let relative = coords::stroke_to_relative(&active, self.surface);
            let mut strokes = (*self.template.strokes).clone();
            strokes.push(relative);
            self.publish(strokes);
        }
        self.in_progress = Some(Stroke::begin(width));
    }

    /// Remove the most recently committed stroke; when none remain, remove
    /// the most recent applied inference result instead.
    pub fn undo_last(&mut self) -> UndoAction {
        if !self.template.is_empty() {
            let mut strokes = (*self.template.strokes).clone();
            strokes.pop();
            self.publish(strokes);
            return UndoAction::RemovedStroke;
        }
        if self.results.pop().is_some() {
            return UndoAction::RemovedResult;
        }
        UndoAction::Nothing
    }

    /// Record an applied inference result for later undo.
    pub fn push_result(&mut self, result: AppliedResult) {
        self.results.push(result);
    }

    /// Drop the entire template for this image. Applied results are kept —
    /// clearing marks does not revert edits already made.
    pub fn clear(&mut self) {
        if !self.template.is_empty() {
            self.publish(Vec::new());
        }
        self.in_progress = None;
    }

    fn publish(&mut self, strokes: Vec<Stroke>) {
        self.template = StrokeTemplate {
            strokes: Arc::new(strokes),
            version: self.template.version + 1,
        };
    }
}

// ============================================================================
// StrokeStores — registry keyed by image id
// ============================================================================

/// Holds one `StrokeStore` per open image. Switching the active image swaps
/// which template is visible and mutated; templates are never merged.
pub struct StrokeStores {
    stores: HashMap<String, StrokeStore>,
    active: Option<String>,
}

impl StrokeStores {
    pub fn new() -> Self {
        Self {
            stores: HashMap::new(),
            active: None,
        }
    }

    /// Make `id` the active image, creating its store on first sight.
    pub fn activate(&mut self, id: &str, surface: SurfaceSize) -> &mut StrokeStore {
        self.active = Some(id.to_string());
        self.stores
            .entry(id.to_string())
            .or_insert_with(|| StrokeStore::new(surface))
    }

    pub fn active(&mut self) -> Option<&mut StrokeStore> {
        let id = self.active.clone()?;
        self.stores.get_mut(&id)
    }

    pub fn get(&self, id: &str) -> Option<&StrokeStore> {
        self.stores.get(id)
    }

    /// Drop the store for a closed image.
    pub fn remove(&mut self, id: &str) {
        self.stores.remove(id);
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
    }
}

impl Default for StrokeStores {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> SurfaceSize {
        SurfaceSize::new(200.0, 100.0)
    }

    fn draw_one(store: &mut StrokeStore, pts: &[(f32, f32)], width: f32) {
        store.start_stroke(width);
        for &(x, y) in pts {
            store.append_point(Point::new(x, y));
        }
        store.commit_stroke();
    }

    fn dummy_result(label: &str) -> AppliedResult {
        AppliedResult {
            image: RgbaImage::new(4, 4),
            label: label.to_string(),
        }
    }

    #[test]
    fn commit_normalizes_to_relative_and_clamps() {
        let mut store = StrokeStore::new(surface());
        draw_one(&mut store, &[(100.0, 50.0), (250.0, -10.0)], 20.0);

        let template = store.template();
        assert_eq!(template.len(), 1);
        let s = &template.strokes()[0];
        assert_eq!(s.space, Space::Relative);
        assert_eq!(s.points[0], Point::new(0.5, 0.5));
        assert_eq!(s.points[1], Point::new(1.0, 0.0));
        assert!((s.width - 0.1).abs() < 1e-5);

        // Commit reopens a fresh in-progress stroke at the same width
        let active = store.in_progress().unwrap();
        assert!(active.points.is_empty());
        assert_eq!(active.width, 20.0);
    }

    #[test]
    fn empty_commit_publishes_nothing() {
        let mut store = StrokeStore::new(surface());
        store.start_stroke(8.0);
        let v0 = store.template().version();
        store.commit_stroke();
        assert_eq!(store.template().version(), v0);
        assert!(store.template().is_empty());
    }

    #[test]
    fn each_commit_and_undo_publishes_a_new_version() {
        let mut store = StrokeStore::new(surface());
        assert_eq!(store.template().version(), 0);
        draw_one(&mut store, &[(10.0, 10.0)], 5.0);
        assert_eq!(store.template().version(), 1);
        draw_one(&mut store, &[(20.0, 20.0)], 5.0);
        assert_eq!(store.template().version(), 2);
        store.undo_last();
        assert_eq!(store.template().version(), 3);
        assert_eq!(store.template().len(), 1);
    }

    #[test]
    fn snapshots_are_isolated_from_later_edits() {
        let mut store = StrokeStore::new(surface());
        draw_one(&mut store, &[(10.0, 10.0)], 5.0);
        let snapshot = store.template();
        draw_one(&mut store, &[(20.0, 20.0)], 5.0);
        store.clear();

        // The earlier snapshot still sees exactly one stroke
        assert_eq!(snapshot.len(), 1);
        assert!(store.template().is_empty());
    }

    #[test]
    fn undo_prefers_strokes_then_falls_back_to_results() {
        let mut store = StrokeStore::new(surface());
        store.push_result(dummy_result("first pass"));
        draw_one(&mut store, &[(10.0, 10.0)], 5.0);

        // Stroke present: undo removes it, result untouched
        assert_eq!(store.undo_last(), UndoAction::RemovedStroke);
        assert_eq!(store.results().len(), 1);

        // No strokes left: undo removes the result
        assert_eq!(store.undo_last(), UndoAction::RemovedResult);
        assert!(store.results().is_empty());

        // Nothing left at all
        assert_eq!(store.undo_last(), UndoAction::Nothing);
    }

    #[test]
    fn clear_drops_template_but_keeps_results() {
        let mut store = StrokeStore::new(surface());
        draw_one(&mut store, &[(10.0, 10.0)], 5.0);
        store.push_result(dummy_result("pass"));
        store.clear();
        assert!(store.template().is_empty());
        assert_eq!(store.results().len(), 1);
    }

    #[test]
    fn stores_are_per_image_and_never_merge() {
        let mut stores = StrokeStores::new();
        draw_one(stores.activate("a.png", surface()), &[(10.0, 10.0)], 5.0);
        draw_one(stores.activate("b.png", surface()), &[(20.0, 20.0)], 5.0);
        draw_one(stores.activate("b.png", surface()), &[(30.0, 30.0)], 5.0);

        assert_eq!(stores.get("a.png").unwrap().template().len(), 1);
        assert_eq!(stores.get("b.png").unwrap().template().len(), 2);

        stores.remove("b.png");
        assert!(stores.get("b.png").is_none());
        assert!(stores.active().is_none());
    }

    #[test]
    fn template_json_round_trips() {
        let mut store = StrokeStore::new(surface());
        draw_one(&mut store, &[(0.0, 0.0), (100.0, 50.0)], 10.0);
        let json = store.template().to_json();

        let loaded = StrokeTemplate::from_json(&json).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.strokes()[0].points, store.template().strokes()[0].points);
        assert_eq!(loaded.strokes()[0].space, Space::Relative);
    }

    #[test]
    fn template_json_clamps_hand_edited_points() {
        let json = r#"{ "strokes": [ { "points": [ { "x": -0.5, "y": 1.5 } ], "width": 0.1 } ] }"#;
        let loaded = StrokeTemplate::from_json(json).unwrap();
        assert_eq!(loaded.strokes()[0].points[0], Point::new(0.0, 1.0));
    }

    #[test]
    fn garbage_marks_file_is_a_readable_error() {
        let err = StrokeTemplate::from_json("not json").unwrap_err();
        assert!(err.contains("invalid marks file"));
    }
}
