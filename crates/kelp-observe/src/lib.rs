//! kelp-observe: vendor-neutral observability ABI.
//!
//! The storage core depends only on these traits and event types. Exporters
//! (Prometheus, OTLP, a live dashboard) live outside the core crates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// In-process meter that keeps every event and the latest value of each
/// counter and gauge. Meant for tests and for embedding in debug tooling.
#[derive(Clone, Default)]
pub struct CapturingMeter {
    inner: Arc<Mutex<Captured>>,
}

#[derive(Default)]
struct Captured {
    events: Vec<VizEvent>,
    counters: HashMap<&'static str, u64>,
    gauges: HashMap<&'static str, i64>,
}

impl CapturingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, oldest first.
    pub fn events(&self) -> Vec<VizEvent> {
        self.lock().events.clone()
    }

    /// Only the space-accounting events, oldest first.
    pub fn space_events(&self) -> Vec<SpaceKind> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                VizEvent::Space(evt) => Some(evt.kind.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.lock().gauges.get(name).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Captured> {
        // A panicking test thread must not hide the data from the others.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct CapturedCounter {
    name: &'static str,
    inner: Arc<Mutex<Captured>>,
}
impl Counter for CapturedCounter {
    fn inc(&self, v: u64) {
        let mut c = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *c.counters.entry(self.name).or_insert(0) += v;
    }
}

struct CapturedGauge {
    name: &'static str,
    inner: Arc<Mutex<Captured>>,
}
impl Gauge for CapturedGauge {
    fn set(&self, v: i64) {
        let mut c = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        c.gauges.insert(self.name, v);
    }
}

impl Meter for CapturingMeter {
    fn counter(
        &self,
        name: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(CapturedCounter {
            name,
            inner: Arc::clone(&self.inner),
        })
    }
    fn gauge(
        &self,
        name: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(CapturedGauge {
            name,
            inner: Arc::clone(&self.inner),
        })
    }
    fn emit(&self, evt: VizEvent) {
        self.lock().events.push(evt);
    }
}

/// Typed events for live visualization (keys/values never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Space(SpaceEvt),
    Flush(FlushEvt),
}

#[derive(Clone, Debug)]
pub struct SpaceEvt {
    pub kind: SpaceKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    /// Administrator changed the space budget (0 = unlimited)
    BudgetChanged { old_bytes: u64, new_bytes: u64 },
    /// A reservation would have pushed usage past the budget
    ReservationDenied { requested: u64, available: u64 },
    /// An outstanding reservation outlived its deadline and was released
    ReservationExpired { id: u64, bytes: u64 },
    /// Writes are now refused until a successful resume
    BackgroundError { kind: ErrorKindTag },
    /// Resume found enough headroom and cleared the error
    Resumed,
    /// Resume ran but usage is still over budget
    ResumeRejected { total_size: u64, budget: u64 },
    /// A committed table file was deleted and released from accounting
    FileReleased { file_number: u64, bytes: u64 },
}

/// Coarse cause of a background error, mirrored from the core without
/// depending on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKindTag {
    SpaceLimit,
    Io,
}

#[derive(Clone, Debug)]
pub struct FlushEvt {
    pub column_family: String,
    pub kind: FlushKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushKind {
    /// Buffer crossed its size trigger
    Triggered { buffer_bytes: usize },
    /// Table file durably written and counted
    Committed {
        file_number: u64,
        bytes: u64,
        entries: usize,
    },
    /// Flush rolled back; buffer left intact
    Aborted { reason: &'static str },
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
