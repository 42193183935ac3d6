// ============================================================================
// Batch orchestrator — apply one stroke template across many images
// ============================================================================
//
// Strictly serial: one decode, one mask, one inference call in flight at any
// time. Inference sessions hold large scratch state, so running items in
// parallel multiplies peak memory for no latency win on a saturated engine.
// Between items the orchestrator takes a bounded cooperative pause so a host
// event loop (and its draw scheduler) stays responsive during long runs.
//
// Failure policy: anything that goes wrong while processing ONE item is
// caught at the per-item boundary, recorded under that item's file name, and
// the loop moves on. Only session construction is fatal to the whole batch.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::coords::{TargetSize, strokes_to_target};
use crate::io::{self, SaveFormat};
use crate::mask::{self, MaskError};
use crate::scheduler::DrawScheduler;
use crate::session::{SessionContext, SessionError};
use crate::staging::StagingStore;
use crate::strokes::StrokeTemplate;

/// Where successful results go.
pub enum Destination {
    /// Write each result to `out_dir` as soon as it is produced.
    DirectDownload {
        out_dir: PathBuf,
        format: SaveFormat,
        quality: u8,
    },
    /// Hold results in the staging store for a later bulk export.
    StageForExport,
}

pub struct BatchRequest {
    /// Input image paths, processed in this order.
    pub inputs: Vec<PathBuf>,
    pub template: StrokeTemplate,
    pub destination: Destination,
}

/// Why one item failed. Each variant marks the pipeline stage that broke.
#[derive(Debug)]
pub enum ItemError {
    Decode(String),
    Mask(MaskError),
    Inference(String),
    Write(String),
    Stage(String),
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Decode(e) => write!(f, "decode failed: {}", e),
            ItemError::Mask(e) => write!(f, "mask compositing failed: {}", e),
            ItemError::Inference(e) => write!(f, "inference failed: {}", e),
            ItemError::Write(e) => write!(f, "write failed: {}", e),
            ItemError::Stage(e) => write!(f, "staging failed: {}", e),
        }
    }
}

/// A failure recorded against one input, identified by file name.
#[derive(Debug)]
pub struct ItemFailure {
    pub name: String,
    pub error: ItemError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every item was attempted (some may still have failed individually).
    Completed,
    /// The cancel flag was observed between items; remaining items skipped.
    Cancelled,
}

#[derive(Debug)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub successes: usize,
    pub failures: Vec<ItemFailure>,
}

/// Fatal errors — these abort the batch before (or instead of) the loop.
#[derive(Debug)]
pub enum BatchError {
    SessionConstruction(SessionError),
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::SessionConstruction(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BatchError {}

/// Upper bound on the cooperative pause between items.
const YIELD_SLICE: Duration = Duration::from_millis(2);

pub struct BatchOrchestrator<'a> {
    sessions: &'a SessionContext,
    staging: &'a StagingStore,
    scheduler: Option<&'a DrawScheduler>,
    cancel: Arc<AtomicBool>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(sessions: &'a SessionContext, staging: &'a StagingStore) -> Self {
        Self {
            sessions,
            staging,
            scheduler: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a draw scheduler; the between-item pause then also pumps one
    /// frame so queued redraws execute during the batch.
    pub fn with_scheduler(mut self, scheduler: &'a DrawScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Shared flag a UI or signal handler can set to stop the batch at the
    /// next item boundary. In-flight inference is never interrupted.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run the batch. `progress(current, total)` fires once per item, before
    /// that item is processed, with `current` starting at 1.
    pub fn run(
        &self,
        request: &BatchRequest,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<BatchReport, BatchError> {
        // Acquire the session once, up front. A broken engine should fail
        // the batch before any file is touched.
        let session = self
            .sessions
            .get_session()
            .map_err(BatchError::SessionConstruction)?;

        let total = request.inputs.len();
        log_info!(
            "[BATCH] starting: {} item(s), engine '{}', {} stroke(s)",
            total,
            session.name(),
            request.template.len()
        );

        let mut report = BatchReport {
            outcome: BatchOutcome::Completed,
            successes: 0,
            failures: Vec::new(),
        };

        for (index, input) in request.inputs.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                log_warn!("[BATCH] cancelled after {} of {} item(s)", index, total);
                report.outcome = BatchOutcome::Cancelled;
                break;
            }

            progress(index + 1, total);

            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| input.display().to_string());

            // All per-item scratch (decoded image, mask, result) lives in
            // this scope and is released before the next item begins.
            let item_result = {
                let outcome = self.process_item(&*session, input, &name, request);
                match outcome {
                    Ok(()) => Ok(()),
                    Err(error) => Err(ItemFailure { name, error }),
                }
            };

            match item_result {
                Ok(()) => report.successes += 1,
                Err(failure) => {
                    log_err!("[BATCH] '{}': {}", failure.name, failure.error);
                    report.failures.push(failure);
                }
            }

            self.yield_to_host();
        }

        log_info!(
            "[BATCH] done: {} succeeded, {} failed ({:?})",
            report.successes,
            report.failures.len(),
            report.outcome
        );
        Ok(report)
    }

    fn process_item(
        &self,
        session: &dyn crate::session::InferenceSession,
        input: &std::path::Path,
        name: &str,
        request: &BatchRequest,
    ) -> Result<(), ItemError> {
        let image = io::load_image_sync(input).map_err(ItemError::Decode)?;
        let target = TargetSize::new(image.width(), image.height());

        let strokes = strokes_to_target(request.template.strokes(), target);
        let mask = mask::composite(&strokes, target).map_err(ItemError::Mask)?;

        let result = session
            .erase(&image, &mask)
            .map_err(|e| ItemError::Inference(e.to_string()))?;

        match &request.destination {
            Destination::DirectDownload {
                out_dir,
                format,
                quality,
            } => {
                let file_name = with_format_extension(&io::derived_file_name(name), *format);
                let path = out_dir.join(file_name);
                io::encode_and_write(&result, &path, *format, *quality)
                    .map_err(|e| ItemError::Write(e.to_string()))?;
            }
            Destination::StageForExport => {
                let blob = io::encode_png_blob(&result).map_err(|e| ItemError::Stage(e.to_string()))?;
                self.staging.store(io::derived_file_name(name), blob);
            }
        }

        Ok(())
    }

    /// Bounded cooperative pause between items: pump one scheduler frame if
    /// one is attached, then sleep a fixed slice. Never waits on anything
    /// that could block indefinitely.
    fn yield_to_host(&self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.on_frame(Instant::now());
        }
        std::thread::sleep(YIELD_SLICE);
    }
}

fn with_format_extension(file_name: &str, format: SaveFormat) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, format.extension()),
        _ => format!("{}.{}", file_name, format.extension()),
    }
}

// ============================================================================
// Tests
// ============================================================================
