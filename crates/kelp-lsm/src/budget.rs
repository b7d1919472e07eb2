/// Space budget enforcement across every column family's tracker.
///
/// The enforcer owns three counters that are only ever touched together,
/// under one lock:
///
/// - `max_allowed_space`: the budget, 0 = unlimited
/// - `total_size`: bytes of committed table files, all column families
/// - `pending_bytes`: bytes reserved by in-flight flushes/compactions
///
/// # Reserve / commit / release
/// ```text
///   try_reserve(est)  ── denied ──▶ SpaceLimit, no state change
///        │
///        ▼ pending += est
///   Reservation ──commit(actual)──▶ pending -= est, total += actual, tracker.record
///        │
///        └─────release / drop / deadline──▶ pending -= est
/// ```
///
/// Check-and-allocate happens in one critical section, so concurrent
/// flushes can never both claim the same headroom.
///
/// Expired reservations are reclaimed lazily by the next call that takes
/// the lock; there is no background sweeper.
use crate::error::{Error, Result};
use crate::tracker::{PathSpaceTracker, TrackedFile};
use kelp_observe::{obs_count, obs_gauge, Meter, NoopMeter, SpaceEvt, SpaceKind, VizEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of the enforcer's counters taken under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub max_allowed_space: u64,
    pub total_size: u64,
    pub pending_bytes: u64,
    pub outstanding_reservations: usize,
}

impl SpaceUsage {
    /// Bytes that may still be reserved; `u64::MAX` when unlimited.
    pub fn available(&self) -> u64 {
        if self.max_allowed_space == 0 {
            return u64::MAX;
        }
        self.max_allowed_space
            .saturating_sub(self.total_size.saturating_add(self.pending_bytes))
    }
}

#[derive(Debug)]
struct Outstanding {
    bytes: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct SpaceState {
    max_allowed_space: u64,
    total_size: u64,
    pending_bytes: u64,
    outstanding: HashMap<u64, Outstanding>,
    next_reservation_id: u64,
    trackers: Vec<Arc<PathSpaceTracker>>,
}

impl SpaceState {
    fn usage(&self) -> SpaceUsage {
        SpaceUsage {
            max_allowed_space: self.max_allowed_space,
            total_size: self.total_size,
            pending_bytes: self.pending_bytes,
            outstanding_reservations: self.outstanding.len(),
        }
    }

    /// Drops reservations past their deadline. Returns (id, bytes) of each.
    fn sweep_expired(&mut self, now: Instant) -> Vec<(u64, u64)> {
        let expired: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(o) = self.outstanding.remove(&id) {
                self.pending_bytes -= o.bytes;
                released.push((id, o.bytes));
            }
        }
        released
    }

    fn owns_tracker(&self, tracker: &PathSpaceTracker) -> bool {
        self.trackers
            .iter()
            .any(|t| std::ptr::eq(Arc::as_ptr(t), tracker))
    }
}

struct Shared {
    state: Mutex<SpaceState>,
    reservation_timeout: Duration,
    meter: Arc<dyn Meter>,
}

impl Shared {
    fn report_expired(&self, expired: Vec<(u64, u64)>) {
        for (id, bytes) in expired {
            tracing::warn!(
                "Reservation {} ({} bytes) passed its deadline, force-released",
                id,
                bytes
            );
            obs_count!(self.meter, "kelp_reservation_expired_total", &[], 1);
            self.meter.emit(VizEvent::Space(SpaceEvt {
                kind: SpaceKind::ReservationExpired { id, bytes },
            }));
        }
    }

    fn release(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.outstanding.remove(&id) {
                Some(o) => {
                    state.pending_bytes -= o.bytes;
                    true
                }
                None => false,
            }
        };
        if removed {
            tracing::debug!("Reservation {} released", id);
        }
        removed
    }
}

/// Aggregates the trackers of all column families and gates new table
/// output against the configured budget.
#[derive(Clone)]
pub struct SpaceBudgetEnforcer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SpaceBudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceBudgetEnforcer")
            .field("usage", &self.usage())
            .field("reservation_timeout", &self.shared.reservation_timeout)
            .finish()
    }
}

impl SpaceBudgetEnforcer {
    pub fn new(max_allowed_space: u64, reservation_timeout: Duration) -> Self {
        Self::with_meter(max_allowed_space, reservation_timeout, Arc::new(NoopMeter))
    }

    pub fn with_meter(
        max_allowed_space: u64,
        reservation_timeout: Duration,
        meter: Arc<dyn Meter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SpaceState {
                    max_allowed_space,
                    ..Default::default()
                }),
                reservation_timeout,
                meter,
            }),
        }
    }

    /// Starts accounting for a column family's tracker. Files it already
    /// holds (recovered at open) are added to the running total.
    pub fn add_tracker(&self, tracker: Arc<PathSpaceTracker>) {
        let mut state = self.shared.state.lock();
        if state.owns_tracker(&tracker) {
            return;
        }
        state.total_size += tracker.total();
        state.trackers.push(tracker);
        let total = state.total_size;
        drop(state);
        obs_gauge!(self.shared.meter, "kelp_total_size_bytes", &[], total);
    }

    /// Updates the budget; 0 disables enforcement.
    ///
    /// Does not touch the background error state: the next reservation or
    /// an explicit resume re-evaluates it.
    pub fn set_max_allowed_space(&self, bytes: u64) {
        let old = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.max_allowed_space, bytes)
        };
        tracing::info!("Max allowed space changed: {} -> {} bytes", old, bytes);
        self.shared.meter.emit(VizEvent::Space(SpaceEvt {
            kind: SpaceKind::BudgetChanged {
                old_bytes: old,
                new_bytes: bytes,
            },
        }));
    }

    pub fn max_allowed_space(&self) -> u64 {
        self.shared.state.lock().max_allowed_space
    }

    /// Sum of committed table files across all paths. Reads the running
    /// total; never scans directories.
    pub fn get_total_size(&self) -> u64 {
        self.shared.state.lock().total_size
    }

    /// Bytes currently held by live reservations.
    pub fn pending_bytes(&self) -> u64 {
        self.usage().pending_bytes
    }

    pub fn usage(&self) -> SpaceUsage {
        let (usage, expired) = {
            let mut state = self.shared.state.lock();
            let expired = state.sweep_expired(Instant::now());
            (state.usage(), expired)
        };
        self.shared.report_expired(expired);
        usage
    }

    pub fn is_max_allowed_space_reached(&self) -> bool {
        let state = self.shared.state.lock();
        state.max_allowed_space > 0 && state.total_size >= state.max_allowed_space
    }

    /// Same predicate as [`Self::is_max_allowed_space_reached`] but counts
    /// in-flight reservations as if they had already landed.
    pub fn is_max_allowed_space_reached_including_compactions(&self) -> bool {
        let u = self.usage();
        u.max_allowed_space > 0 && u.total_size + u.pending_bytes >= u.max_allowed_space
    }

    /// Claims `estimated_bytes` of headroom.
    ///
    /// Fails with [`Error::SpaceLimit`] without changing any state when
    /// `total + pending + estimated` would exceed a non-zero budget.
    pub fn try_reserve(&self, estimated_bytes: u64) -> Result<Reservation> {
        let now = Instant::now();
        let (result, expired) = {
            let mut state = self.shared.state.lock();
            let expired = state.sweep_expired(now);

            let projected = state
                .total_size
                .saturating_add(state.pending_bytes)
                .saturating_add(estimated_bytes);
            let budget = state.max_allowed_space;

            let result = if budget > 0 && projected > budget {
                Err(Error::SpaceLimit {
                    requested: estimated_bytes,
                    available: state.usage().available(),
                    budget,
                })
            } else {
                state.next_reservation_id += 1;
                let id = state.next_reservation_id;
                let deadline = now + self.shared.reservation_timeout;
                state.outstanding.insert(
                    id,
                    Outstanding {
                        bytes: estimated_bytes,
                        deadline,
                    },
                );
                state.pending_bytes += estimated_bytes;
                Ok(Reservation {
                    id,
                    bytes: estimated_bytes,
                    deadline,
                    shared: Some(Arc::clone(&self.shared)),
                })
            };
            (result, expired)
        };
        self.shared.report_expired(expired);

        match &result {
            Ok(r) => tracing::debug!("Reservation {} granted: {} bytes", r.id, r.bytes),
            Err(Error::SpaceLimit {
                requested,
                available,
                budget,
            }) => {
                tracing::warn!(
                    "Reservation denied: {} bytes requested, {} available (budget {})",
                    requested,
                    available,
                    budget
                );
                obs_count!(self.shared.meter, "kelp_reservation_denied_total", &[], 1);
                self.shared.meter.emit(VizEvent::Space(SpaceEvt {
                    kind: SpaceKind::ReservationDenied {
                        requested: *requested,
                        available: *available,
                    },
                }));
            }
            Err(_) => {}
        }
        result
    }

    /// Removes a committed file from accounting after it was deleted.
    pub fn release_file(
        &self,
        tracker: &PathSpaceTracker,
        path: &Path,
        file_number: u64,
    ) -> Result<Option<u64>> {
        let mut state = self.shared.state.lock();
        if !state.owns_tracker(tracker) {
            return Err(Error::Internal(
                "tracker is not registered with this enforcer".to_string(),
            ));
        }
        let released = tracker.release(path, file_number)?;
        if let Some(size) = released {
            state.total_size -= size;
        }
        let total = state.total_size;
        drop(state);

        obs_gauge!(self.shared.meter, "kelp_total_size_bytes", &[], total);
        Ok(released)
    }

    /// Reclaims expired reservations now. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.shared.state.lock().sweep_expired(Instant::now());
        let n = expired.len();
        self.shared.report_expired(expired);
        n
    }

    pub fn reservation_timeout(&self) -> Duration {
        self.shared.reservation_timeout
    }
}

/// A provisional claim against the budget.
///
/// Must end in [`Reservation::commit`] or [`Reservation::release`];
/// dropping it releases the bytes. If the holder stalls past the deadline
/// the bytes are reclaimed and a later commit fails.
#[must_use = "a reservation holds budget until committed or released"]
pub struct Reservation {
    id: u64,
    bytes: u64,
    deadline: Instant,
    shared: Option<Arc<Shared>>,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Estimated bytes held by this reservation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Converts the reservation into a tracked file of `actual_size` bytes.
    ///
    /// The pending bytes, the running total and the tracker are updated in
    /// one critical section. On error nothing is recorded and the
    /// reservation is released.
    pub fn commit(
        mut self,
        tracker: &PathSpaceTracker,
        path: &Path,
        file_number: u64,
        actual_size: u64,
    ) -> Result<TrackedFile> {
        let Some(shared) = self.shared.take() else {
            return Err(Error::Internal("reservation already consumed".to_string()));
        };

        let (result, expired) = {
            let mut state = shared.state.lock();
            let expired = state.sweep_expired(Instant::now());

            let result = if !state.owns_tracker(tracker) {
                Err(Error::Internal(
                    "tracker is not registered with this enforcer".to_string(),
                ))
            } else if !state.outstanding.contains_key(&self.id) {
                Err(Error::ReservationExpired { id: self.id })
            } else {
                tracker.record(path, file_number, actual_size).map(|file| {
                    if let Some(o) = state.outstanding.remove(&self.id) {
                        state.pending_bytes -= o.bytes;
                    }
                    state.total_size += actual_size;
                    file
                })
            };
            (result, (expired, state.total_size))
        };
        let (expired, total) = expired;
        shared.report_expired(expired);

        match &result {
            Ok(file) => {
                tracing::debug!(
                    "Reservation {} committed as file {} ({} bytes, estimated {})",
                    self.id,
                    file.file_number,
                    actual_size,
                    self.bytes
                );
                obs_gauge!(shared.meter, "kelp_total_size_bytes", &[], total);
            }
            Err(_) => {
                shared.release(self.id);
            }
        }
        result
    }

    /// Returns the reserved bytes without creating a file.
    pub fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.id);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.id);
        }
    }
}
