/// Sticky background error state gating the write path.
///
/// ```text
///            reservation denied / commit I/O failure
///   Normal ───────────────────────────────────────────▶ Error
///     ▲                                                   │ writes & flushes
///     │            resume() finds headroom                │ refused fast
///     └───────────────────────────────────────────────────┘
/// ```
///
/// The first reporter wins; later reports while in Error are no-ops, so
/// racing writers converge on one transition. `resume` is a single bounded
/// evaluation; it never waits or loops.
use crate::budget::SpaceBudgetEnforcer;
use crate::error::{Error, Result};
use kelp_observe::{ErrorKindTag, Meter, NoopMeter, SpaceEvt, SpaceKind, VizEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundErrorKind {
    None,
    SpaceLimitExceeded,
    IoFailure,
}

impl std::fmt::Display for BackgroundErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::SpaceLimitExceeded => "space limit exceeded",
            Self::IoFailure => "I/O failure",
        };
        f.write_str(s)
    }
}

/// What the controller remembers about the current error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundErrorState {
    pub kind: BackgroundErrorKind,
    pub since: Option<SystemTime>,
    pub detail: String,
    /// Bytes the denied operation asked for (space errors only)
    pub requested_bytes: u64,
}

impl BackgroundErrorState {
    fn normal() -> Self {
        Self {
            kind: BackgroundErrorKind::None,
            since: None,
            detail: String::new(),
            requested_bytes: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind != BackgroundErrorKind::None
    }

    fn to_error(&self) -> Error {
        Error::BackgroundError {
            kind: self.kind,
            detail: self.detail.clone(),
        }
    }
}

pub struct BackgroundErrorController {
    state: Mutex<BackgroundErrorState>,
    /// Mirrors `state.kind != None` for the lock-free write-path check
    in_error: AtomicBool,
    resume_evaluations: AtomicU64,
    meter: Arc<dyn Meter>,
}

impl std::fmt::Debug for BackgroundErrorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundErrorController")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Default for BackgroundErrorController {
    fn default() -> Self {
        Self::new(Arc::new(NoopMeter))
    }
}

impl BackgroundErrorController {
    pub fn new(meter: Arc<dyn Meter>) -> Self {
        Self {
            state: Mutex::new(BackgroundErrorState::normal()),
            in_error: AtomicBool::new(false),
            resume_evaluations: AtomicU64::new(0),
            meter,
        }
    }

    pub fn is_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BackgroundErrorState {
        self.state.lock().clone()
    }

    /// Fails fast with [`Error::BackgroundError`] while in Error.
    pub fn check_writable(&self) -> Result<()> {
        if !self.is_error() {
            return Ok(());
        }
        let state = self.state.lock();
        if state.is_error() {
            return Err(state.to_error());
        }
        Ok(())
    }

    /// Enters the Error state. Returns `false` if an error was already set;
    /// the recorded cause is then left untouched.
    pub fn set_error(
        &self,
        kind: BackgroundErrorKind,
        detail: impl Into<String>,
        requested_bytes: u64,
    ) -> bool {
        if kind == BackgroundErrorKind::None {
            return false;
        }
        let mut state = self.state.lock();
        if state.is_error() {
            return false;
        }
        *state = BackgroundErrorState {
            kind,
            since: Some(SystemTime::now()),
            detail: detail.into(),
            requested_bytes,
        };
        self.in_error.store(true, Ordering::Release);

        tracing::error!("Background error set ({}): {}", state.kind, state.detail);
        let tag = match kind {
            BackgroundErrorKind::IoFailure => ErrorKindTag::Io,
            _ => ErrorKindTag::SpaceLimit,
        };
        drop(state);
        self.meter.emit(VizEvent::Space(SpaceEvt {
            kind: SpaceKind::BackgroundError { kind: tag },
        }));
        true
    }

    /// Re-evaluates space once and clears the error if there is headroom.
    ///
    /// A no-op success in Normal. In Error the engine is considered over
    /// budget when `is_max_allowed_space_reached()` holds, or, for a space
    /// error, when the request that was denied still would not fit.
    pub fn resume(&self, enforcer: &SpaceBudgetEnforcer) -> Result<()> {
        let mut state = self.state.lock();
        if !state.is_error() {
            return Ok(());
        }
        self.resume_evaluations.fetch_add(1, Ordering::Relaxed);

        // One snapshot so both checks see the same counters.
        let usage = enforcer.usage();
        let budget = usage.max_allowed_space;
        let reached = budget > 0 && usage.total_size >= budget;
        let denied_still_blocked = state.kind == BackgroundErrorKind::SpaceLimitExceeded
            && usage.available() < state.requested_bytes;
        let still_over = reached || denied_still_blocked;

        if still_over {
            let requested = state.requested_bytes;
            drop(state);
            tracing::warn!(
                "Resume rejected: {} bytes used, {} pending, budget {}",
                usage.total_size,
                usage.pending_bytes,
                usage.max_allowed_space
            );
            self.meter.emit(VizEvent::Space(SpaceEvt {
                kind: SpaceKind::ResumeRejected {
                    total_size: usage.total_size,
                    budget: usage.max_allowed_space,
                },
            }));
            return Err(Error::ResumeStillOverBudget {
                total_size: usage.total_size,
                pending: usage.pending_bytes,
                requested,
                budget: usage.max_allowed_space,
            });
        }

        let previous = std::mem::replace(&mut *state, BackgroundErrorState::normal());
        self.in_error.store(false, Ordering::Release);
        drop(state);

        tracing::info!(
            "Resumed from background error ({}) raised at {:?}",
            previous.kind,
            previous.since
        );
        self.meter.emit(VizEvent::Space(SpaceEvt {
            kind: SpaceKind::Resumed,
        }));
        Ok(())
    }

    /// Number of resume calls that actually evaluated space (i.e. were made
    /// while in Error).
    pub fn resume_evaluations(&self) -> u64 {
        self.resume_evaluations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PathSpaceTracker;
    use std::path::Path;
    use std::time::Duration;

    fn over_budget_enforcer() -> SpaceBudgetEnforcer {
        let e = SpaceBudgetEnforcer::new(0, Duration::from_secs(60));
        let t = Arc::new(PathSpaceTracker::new());
        t.register("/p", 0).unwrap();
        e.add_tracker(Arc::clone(&t));
        e.try_reserve(1000)
            .unwrap()
            .commit(&t, Path::new("/p"), 1, 1000)
            .unwrap();
        e.set_max_allowed_space(500);
        e
    }

    #[test]
    fn test_starts_normal() {
        let c = BackgroundErrorController::default();
        assert!(!c.is_error());
        assert!(c.check_writable().is_ok());
        assert_eq!(c.state().kind, BackgroundErrorKind::None);
    }

    #[test]
    fn test_first_reporter_wins() {
        let c = BackgroundErrorController::default();
        assert!(c.set_error(BackgroundErrorKind::SpaceLimitExceeded, "first", 10));
        assert!(!c.set_error(BackgroundErrorKind::IoFailure, "second", 0));

        let s = c.state();
        assert_eq!(s.kind, BackgroundErrorKind::SpaceLimitExceeded);
        assert_eq!(s.detail, "first");
        assert!(s.since.is_some());

        match c.check_writable() {
            Err(Error::BackgroundError { kind, detail }) => {
                assert_eq!(kind, BackgroundErrorKind::SpaceLimitExceeded);
                assert_eq!(detail, "first");
            }
            other => panic!("expected BackgroundError, got {:?}", other),
        }
    }

    #[test]
    fn test_set_none_is_ignored() {
        let c = BackgroundErrorController::default();
        assert!(!c.set_error(BackgroundErrorKind::None, "nothing", 0));
        assert!(!c.is_error());
    }

    #[test]
    fn test_resume_in_normal_is_noop() {
        let c = BackgroundErrorController::default();
        let e = over_budget_enforcer();
        assert!(c.resume(&e).is_ok());
        assert!(c.resume(&e).is_ok());
        assert_eq!(c.resume_evaluations(), 0);
    }

    #[test]
    fn test_resume_still_over_budget_is_repeatable() {
        let c = BackgroundErrorController::default();
        let e = over_budget_enforcer();
        c.set_error(BackgroundErrorKind::SpaceLimitExceeded, "full", 0);

        let first = c.resume(&e).unwrap_err();
        let second = c.resume(&e).unwrap_err();
        assert!(matches!(first, Error::ResumeStillOverBudget { total_size: 1000, budget: 500, .. }));
        assert_eq!(first.to_string(), second.to_string());
        assert!(c.is_error());
        assert_eq!(c.resume_evaluations(), 2);
    }

    #[test]
    fn test_resume_after_budget_raise() {
        let c = BackgroundErrorController::default();
        let e = over_budget_enforcer();
        c.set_error(BackgroundErrorKind::SpaceLimitExceeded, "full", 200);

        e.set_max_allowed_space(1100);
        // 1000 + 200 > 1100: the denied request still does not fit
        assert!(c.resume(&e).is_err());

        e.set_max_allowed_space(2000);
        c.resume(&e).unwrap();
        assert!(!c.is_error());
        assert!(c.check_writable().is_ok());
        assert_eq!(c.state(), BackgroundErrorState::normal());
    }

    #[test]
    fn test_io_failure_resume_checks_budget_only() {
        let c = BackgroundErrorController::default();
        let e = SpaceBudgetEnforcer::new(100, Duration::from_secs(1));
        c.set_error(BackgroundErrorKind::IoFailure, "fsync failed", 5000);
        c.resume(&e).unwrap();
        assert!(!c.is_error());
    }

    #[test]
    fn test_resume_is_bounded() {
        let c = BackgroundErrorController::default();
        let e = over_budget_enforcer();
        c.set_error(BackgroundErrorKind::SpaceLimitExceeded, "full", 0);

        let start = std::time::Instant::now();
        for _ in 0..100 {
            assert!(c.resume(&e).is_err());
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(c.resume_evaluations(), 100);
    }

    #[test]
    fn test_concurrent_reporters_single_transition() {
        let c = Arc::new(BackgroundErrorController::default());
        let winners: usize = (0..16)
            .map(|i| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    c.set_error(BackgroundErrorKind::SpaceLimitExceeded, format!("w{}", i), 1)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
