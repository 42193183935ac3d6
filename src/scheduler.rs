// ============================================================================
// Draw scheduler — frame-paced, priority-ordered redraw coalescing
// ============================================================================
//
// Pointer movement can submit hundreds of redraw requests per second; the
// display only needs (and the CPU budget only allows) one repaint per frame
// interval. The scheduler accepts every request, keeps them sorted by
// descending priority, and drains the whole pending batch at most once per
// minimum frame interval. A frame boundary that arrives inside the budget is
// *skipped* (counted, not executed) — this is what bounds CPU usage during
// fast freehand input.
//
// Two drive modes:
//   * host-owned loop — the UI calls `on_frame(Instant::now())` from its own
//     frame callback;
//   * background driver — `spawn_driver()` runs the drain loop on its own
//     thread (the off-main compositing surface), waking on submission.
//
// The scheduler holds no drawing state, only timing and ordering state.
// Thunks mutate the visible surface directly and are consumed exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A deferred draw call. Runs at most once, on whichever thread drains the
/// batch it landed in.
pub type DrawThunk = Box<dyn FnOnce() + Send + 'static>;

/// Default minimum interval between executed batches (~60 Hz budget).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(15);

/// Well-known priorities. Higher runs earlier within a batch.
pub mod priority {
    /// Per-pointer-move preview repaint.
    pub const PREVIEW: i32 = 0;
    /// Repaint after a stroke commit — must land before queued previews.
    pub const COMMIT: i32 = 10;
    /// Surface (re)configuration, runs before everything else.
    pub const SURFACE: i32 = 100;
}

/// Interface the rendering component implements so owners can request a
/// repaint of one image (or everything) without holding a widget reference.
pub trait RedrawTarget {
    /// Redraw the image at `index`, or all images when `None`.
    fn draw(&mut self, index: Option<usize>);
}

/// Scheduler lifecycle. `Draining` means a drain is scheduled or running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    Idle,
    Draining,
}

/// Outcome of one frame boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing pending; scheduler is (now) idle.
    Idle,
    /// Pending work exists but the frame budget has not elapsed yet.
    Skipped,
    /// Executed a batch of this many operations.
    Executed(usize),
}

/// Counters for observing coalescing behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub executed_batches: u64,
    pub executed_ops: u64,
    pub skipped_frames: u64,
    pub dropped_ops: u64,
}

struct DrawOp {
    id: u64,
    priority: i32,
    thunk: DrawThunk,
}

struct Inner {
    state: SchedState,
    pending: Vec<DrawOp>,
    next_id: u64,
    last_batch: Option<Instant>,
    min_interval: Duration,
    stats: SchedulerStats,
}

/// Cheap-to-clone handle; all clones share one queue.
#[derive(Clone)]
pub struct DrawScheduler {
    inner: Arc<Mutex<Inner>>,
    wake: Arc<Condvar>,
}

impl DrawScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SchedState::Idle,
                pending: Vec::new(),
                next_id: 0,
                last_batch: None,
                min_interval,
                stats: SchedulerStats::default(),
            })),
            wake: Arc::new(Condvar::new()),
        }
    }

    /// Queue a draw operation. Returns its id. If the scheduler was `Idle`
    /// it transitions to `Draining`; the op runs at the next frame boundary
    /// that clears the budget, never synchronously.
    pub fn submit(&self, priority: i32, thunk: DrawThunk) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        // Keep the batch sorted by descending priority, stable for ties, so
        // a commit repaint always executes before previews queued in the
        // same batch.
        let pos = inner
            .pending
            .iter()
            .position(|op| op.priority < priority)
            .unwrap_or(inner.pending.len());
        inner.pending.insert(pos, DrawOp { id, priority, thunk });

        inner.state = SchedState::Draining;
        self.wake.notify_all();
        id
    }

    /// Process one frame boundary at time `now`.
    ///
    /// * `Idle` when nothing is pending (and the state returns to `Idle`);
    /// * `Skipped` when pending work exists but `now` is still inside the
    ///   minimum frame interval since the last executed batch;
    /// * `Executed(n)` after running every queued thunk in priority order.
    ///
    /// Operations submitted *by* executing thunks (through a clone of this
    /// handle) are not run in the same batch; they leave the scheduler
    /// `Draining` for the next boundary.
    pub fn on_frame(&self, now: Instant) -> FrameOutcome {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_empty() {
                inner.state = SchedState::Idle;
                return FrameOutcome::Idle;
            }
            if let Some(last) = inner.last_batch
                && now.duration_since(last) < inner.min_interval
            {
                inner.stats.skipped_frames += 1;
                return FrameOutcome::Skipped;
            }
            inner.last_batch = Some(now);
            std::mem::take(&mut inner.pending)
        };

        // Run thunks with the lock released — they may submit follow-ups.
        let count = batch.len();
        for op in batch {
            (op.thunk)();
        }

        let mut inner = self.inner.lock().unwrap();
        inner.stats.executed_batches += 1;
        inner.stats.executed_ops += count as u64;
        if inner.pending.is_empty() {
            inner.state = SchedState::Idle;
        }
        FrameOutcome::Executed(count)
    }

    /// Drop all pending operations and cancel the scheduled drain. Used on
    /// teardown so no thunk ever runs against a disposed surface.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.dropped_ops += inner.pending.len() as u64;
        inner.pending.clear();
        inner.state = SchedState::Idle;
        self.wake.notify_all();
    }

    pub fn state(&self) -> SchedState {
        self.inner.lock().unwrap().state
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().unwrap().stats
    }

    /// Run the drain loop on a background thread. The thread sleeps until
    /// work is submitted, paces itself by the minimum frame interval, and
    /// exits when the returned handle is shut down (pending ops are dropped,
    /// as on `clear`).
    pub fn spawn_driver(&self) -> SchedulerDriver {
        let sched = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let join = thread::spawn(move || {
            loop {
                {
                    let mut inner = sched.inner.lock().unwrap();
                    while inner.pending.is_empty() && !stop_flag.load(Ordering::Acquire) {
                        inner = sched.wake.wait(inner).unwrap();
                    }
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                }
                match sched.on_frame(Instant::now()) {
                    FrameOutcome::Skipped => {
                        // Inside the frame budget — wait out the remainder
                        let nap = sched.inner.lock().unwrap().min_interval / 4;
                        thread::sleep(nap.max(Duration::from_millis(1)));
                    }
                    FrameOutcome::Idle | FrameOutcome::Executed(_) => {}
                }
            }
        });

        SchedulerDriver {
            scheduler: self.clone(),
            stop,
            join: Some(join),
        }
    }
}

impl Default for DrawScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

/// Owner handle for the background drain thread.
pub struct SchedulerDriver {
    scheduler: DrawScheduler,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerDriver {
    /// Stop the driver and join its thread. Pending ops are dropped.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.scheduler.clear();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SchedulerDriver {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Scheduler plus a shared execution log; each submitted thunk appends
    /// its tag when (and only when) it runs.
    fn rig(interval_ms: u64) -> (DrawScheduler, Arc<Mutex<Vec<i32>>>) {
        (
            DrawScheduler::new(Duration::from_millis(interval_ms)),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn submit_tagged(sched: &DrawScheduler, log: &Arc<Mutex<Vec<i32>>>, priority: i32, tag: i32) {
        let log = log.clone();
        sched.submit(
            priority,
            Box::new(move || log.lock().unwrap().push(tag)),
        );
    }

    #[test]
    fn hundred_submits_coalesce_into_one_batch() {
        let (sched, log) = rig(10);
        for i in 0..100 {
            submit_tagged(&sched, &log, 0, i);
        }
        // Nothing executes before a frame boundary
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sched.state(), SchedState::Draining);

        assert_eq!(sched.on_frame(Instant::now()), FrameOutcome::Executed(100));
        assert_eq!(log.lock().unwrap().len(), 100);
        assert_eq!(sched.state(), SchedState::Idle);

        let stats = sched.stats();
        assert_eq!(stats.executed_batches, 1);
        assert_eq!(stats.executed_ops, 100);
    }

    #[test]
    fn batch_runs_in_descending_priority_order_with_stable_ties() {
        let (sched, log) = rig(10);
        // (priority, tag): two ties at priority 5 must keep arrival order
        for &(prio, tag) in &[(0, 1), (5, 2), (10, 3), (5, 4), (0, 5)] {
            submit_tagged(&sched, &log, prio, tag);
        }
        sched.on_frame(Instant::now());
        assert_eq!(*log.lock().unwrap(), vec![3, 2, 4, 1, 5]);
    }

    #[test]
    fn frames_inside_the_budget_are_skipped_not_executed() {
        let (sched, log) = rig(10);
        let t0 = Instant::now();

        submit_tagged(&sched, &log, 0, 1);
        assert_eq!(sched.on_frame(t0), FrameOutcome::Executed(1));

        // New work arrives immediately; boundaries inside the 10ms budget
        // are skipped and counted.
        submit_tagged(&sched, &log, 0, 2);
        assert_eq!(sched.on_frame(t0 + Duration::from_millis(3)), FrameOutcome::Skipped);
        assert_eq!(sched.on_frame(t0 + Duration::from_millis(7)), FrameOutcome::Skipped);
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(sched.state(), SchedState::Draining);

        // Past the budget the batch drains
        assert_eq!(
            sched.on_frame(t0 + Duration::from_millis(12)),
            FrameOutcome::Executed(1)
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(sched.stats().skipped_frames, 2);
    }

    #[test]
    fn thunks_submitting_followups_leave_scheduler_draining() {
        let (sched, log) = rig(0);
        let resub = sched.clone();
        let inner_log = log.clone();
        sched.submit(
            0,
            Box::new(move || {
                inner_log.lock().unwrap().push(1);
                let log2 = inner_log.clone();
                resub.submit(0, Box::new(move || log2.lock().unwrap().push(2)));
            }),
        );

        let t0 = Instant::now();
        assert_eq!(sched.on_frame(t0), FrameOutcome::Executed(1));
        // Follow-up was not run in the same batch
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(sched.state(), SchedState::Draining);

        assert_eq!(
            sched.on_frame(t0 + Duration::from_millis(1)),
            FrameOutcome::Executed(1)
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn clear_drops_pending_and_returns_to_idle() {
        let (sched, log) = rig(10);
        for i in 0..5 {
            submit_tagged(&sched, &log, 0, i);
        }
        sched.clear();
        assert_eq!(sched.state(), SchedState::Idle);
        assert_eq!(sched.on_frame(Instant::now()), FrameOutcome::Idle);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sched.stats().dropped_ops, 5);
    }

    #[test]
    fn on_frame_with_empty_queue_is_idle() {
        let (sched, _log) = rig(10);
        assert_eq!(sched.on_frame(Instant::now()), FrameOutcome::Idle);
        assert_eq!(sched.state(), SchedState::Idle);
    }

    #[test]
    fn background_driver_drains_submissions() {
        let (sched, log) = rig(1);
        let driver = sched.spawn_driver();

        for i in 0..20 {
            submit_tagged(&sched, &log, 0, i);
        }

        // Wait (bounded) for the driver to drain everything
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().len() < 20 {
            assert!(Instant::now() < deadline, "driver did not drain in time");
            thread::sleep(Duration::from_millis(2));
        }
        driver.shutdown();
        assert_eq!(log.lock().unwrap().len(), 20);
    }

    #[test]
    fn redraw_target_is_drivable_through_thunks() {
        struct Canvas {
            drawn: Vec<Option<usize>>,
        }
        impl RedrawTarget for Canvas {
            fn draw(&mut self, index: Option<usize>) {
                self.drawn.push(index);
            }
        }

        let canvas = Arc::new(Mutex::new(Canvas { drawn: Vec::new() }));
        let (sched, _log) = rig(0);
        for index in [Some(3), None] {
            let canvas = canvas.clone();
            sched.submit(
                priority::PREVIEW,
                Box::new(move || canvas.lock().unwrap().draw(index)),
            );
        }
        sched.on_frame(Instant::now());
        assert_eq!(canvas.lock().unwrap().drawn, vec![Some(3), None]);
    }
}
