// ============================================================================
// Inference session management — construct once, share everywhere
// ============================================================================
//
// Building an inference session can take seconds (the ONNX backend loads a
// runtime DLL and a model; even the built-in engine allocates scratch
// state). `SessionContext` pays that cost at most once per process lifetime:
// it is an explicit context object constructed at startup and passed by
// reference into the batch orchestrator and any interactive call site — not
// a hidden global.
//
// Lifecycle: Uninitialized → Initializing → Ready. `dispose()` resets to
// Uninitialized; the next `get_session()` rebuilds from scratch. While one
// caller is constructing, every concurrent caller blocks on the same
// in-flight build — at most one construction, at most one live session.

use std::sync::{Arc, Condvar, Mutex};

use image::{GrayImage, RgbaImage};

/// Errors from session construction or inference.
#[derive(Debug)]
pub enum SessionError {
    /// The session could not be built (missing runtime/model, bad config).
    /// Fatal to any batch that needs it.
    ConstructionFailed(String),
    /// One inference call failed. Fatal only to the current item.
    InferenceFailed(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ConstructionFailed(e) => write!(f, "session construction failed: {}", e),
            SessionError::InferenceFailed(e) => write!(f, "inference failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// The long-lived handle to an inference engine. One call erases the masked
/// region of `image` (255 in `mask` = remove) and returns the edited raster.
///
/// Implementations must be callable from any thread, but the orchestrator
/// guarantees calls are strictly serial — implementations may keep internal
/// scratch buffers without locking them per pixel.
pub trait InferenceSession: Send + Sync + std::fmt::Debug {
    /// Short engine name for logs and reports.
    fn name(&self) -> &str;

    /// `mask` dimensions must exactly match `image` dimensions.
    fn erase(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, SessionError>;
}

/// Builds the session on first demand. The factory captures all engine
/// configuration; `SessionContext` only manages the lifecycle.
pub type SessionFactory =
    Box<dyn Fn() -> Result<Arc<dyn InferenceSession>, SessionError> + Send + Sync>;

/// Observable lifecycle state, mainly for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

enum Slot {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn InferenceSession>),
}

pub struct SessionContext {
    slot: Mutex<Slot>,
    done: Condvar,
    factory: SessionFactory,
}

impl SessionContext {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            slot: Mutex::new(Slot::Uninitialized),
            done: Condvar::new(),
            factory,
        }
    }

    pub fn state(&self) -> SessionState {
        match *self.slot.lock().unwrap() {
            Slot::Uninitialized => SessionState::Uninitialized,
            Slot::Initializing => SessionState::Initializing,
            Slot::Ready(_) => SessionState::Ready,
        }
    }

    /// Get the shared session, building it if this is the first call (or the
    /// first call after `dispose()`). Callers arriving during an in-flight
    /// construction block until it resolves and share its session; after a
    /// failed construction the slot is reset so a later call may retry.
    pub fn get_session(&self) -> Result<Arc<dyn InferenceSession>, SessionError> {
        {
            let mut slot = self.slot.lock().unwrap();
            loop {
                match &*slot {
                    Slot::Ready(session) => return Ok(session.clone()),
                    Slot::Initializing => {
                        slot = self.done.wait(slot).unwrap();
                    }
                    Slot::Uninitialized => {
                        *slot = Slot::Initializing;
                        break;
                    }
                }
            }
        }

        // This caller owns the construction. Build with the lock released —
        // model loading can take seconds and must not block `dispose()` of
        // unrelated contexts or diagnostic `state()` reads forever.
        log_info!("[SESSION] constructing inference session");
        let built = (self.factory)();

        let mut slot = self.slot.lock().unwrap();
        match &built {
            Ok(session) => {
                log_info!("[SESSION] session '{}' ready", session.name());
                *slot = Slot::Ready(session.clone());
            }
            Err(e) => {
                log_err!("[SESSION] construction failed: {}", e);
                *slot = Slot::Uninitialized;
            }
        }
        self.done.notify_all();
        built
    }

    /// Release the live session (its resources free when the last clone of
    /// the `Arc` drops) and reset to `Uninitialized`. A no-op while no
    /// session exists; never interrupts an in-flight construction.
    pub fn dispose(&self) {
        let mut slot = self.slot.lock().unwrap();
        if let Slot::Ready(session) = &*slot {
            log_info!("[SESSION] disposing session '{}'", session.name());
            *slot = Slot::Uninitialized;
            self.done.notify_all();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct NullSession;

    impl InferenceSession for NullSession {
        fn name(&self) -> &str {
            "null"
        }
        fn erase(&self, image: &RgbaImage, _mask: &GrayImage) -> Result<RgbaImage, SessionError> {
            Ok(image.clone())
        }
    }

    fn counting_context(builds: Arc<AtomicUsize>) -> SessionContext {
        SessionContext::new(Box::new(move || {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullSession) as Arc<dyn InferenceSession>)
        }))
    }

    #[test]
    fn sequential_calls_share_one_session() {
        let builds = Arc::new(AtomicUsize::new(0));
        let ctx = counting_context(builds.clone());

        let a = ctx.get_session().unwrap();
        let b = ctx.get_session().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.state(), SessionState::Ready);
    }

    #[test]
    fn concurrent_calls_never_duplicate_construction() {
        let builds = Arc::new(AtomicUsize::new(0));
        let slow_builds = builds.clone();
        let ctx = Arc::new(SessionContext::new(Box::new(move || {
            slow_builds.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Arc::new(NullSession) as Arc<dyn InferenceSession>)
        })));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(thread::spawn(move || ctx.get_session().unwrap()));
        }
        let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        for pair in sessions.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn dispose_resets_and_rebuilds_from_scratch() {
        let builds = Arc::new(AtomicUsize::new(0));
        let ctx = counting_context(builds.clone());

        let a = ctx.get_session().unwrap();
        ctx.dispose();
        assert_eq!(ctx.state(), SessionState::Uninitialized);

        let b = ctx.get_session().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispose_without_session_is_a_noop() {
        let builds = Arc::new(AtomicUsize::new(0));
        let ctx = counting_context(builds.clone());
        ctx.dispose();
        assert_eq!(ctx.state(), SessionState::Uninitialized);
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_construction_resets_so_a_retry_can_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory_attempts = attempts.clone();
        let ctx = SessionContext::new(Box::new(move || {
            if factory_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SessionError::ConstructionFailed("model missing".into()))
            } else {
                Ok(Arc::new(NullSession) as Arc<dyn InferenceSession>)
            }
        }));

        let err = ctx.get_session().unwrap_err();
        assert!(matches!(err, SessionError::ConstructionFailed(_)));
        assert_eq!(ctx.state(), SessionState::Uninitialized);

        let session = ctx.get_session().unwrap();
        assert_eq!(session.name(), "null");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
