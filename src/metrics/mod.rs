//! In-process metrics: labelled counters, duration samples, rolling windows.
//!
//! State lives for the process lifetime and reflects only this process.
//! Rendered by [`prometheus::render_prom_metrics`] for scraping and by
//! [`snapshot::MonitoringSnapshot`] for dashboards; both read the same samples.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

pub mod prometheus;
mod rolling;
pub mod snapshot;

pub use prometheus::{render_prom_metrics, BUCKETS_MS};
pub use rolling::{EventKind, WindowCounts, FIVE_MINUTES, HOUR};
pub use snapshot::{MonitoringSnapshot, SeriesStats};

use crate::config::MetricsConfig;
use crate::utils::clock::{system_clock, Clock};
use rolling::RollingLog;

// ============================================================================
// Labels
// ============================================================================

/// Label set with a canonical form independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `k1="v1",k2="v2"` with keys sorted and values escaped.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(
                out,
                "{}=\"{}\"",
                sanitize_name(key),
                escape_label_value(value)
            );
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Escape a label value for the exposition format.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

/// Map a name onto `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

// ============================================================================
// Registry
// ============================================================================

/// All-time counts, unaffected by window pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub msgs: u64,
    pub errors: u64,
}

/// metric name -> canonical label string -> value
pub(crate) type Family<T> = BTreeMap<String, BTreeMap<String, T>>;

#[derive(Debug, Default)]
pub(crate) struct State {
    pub counters: Family<u64>,
    pub durations: Family<VecDeque<f64>>,
    pub events: RollingLog,
    pub totals: Totals,
}

/// Labelled counters and duration samples for one process.
pub struct MetricsRegistry {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    max_samples: Option<usize>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            max_samples: config.max_samples_per_series.filter(|n| *n > 0),
        }
    }

    pub fn increment_counter(&self, metric: &str, labels: &Labels, amount: u64) {
        let mut state = self.lock();
        let value = state
            .counters
            .entry(sanitize_name(metric))
            .or_default()
            .entry(labels.canonical())
            .or_insert(0);
        *value = value.saturating_add(amount);
    }

    /// Append a duration sample in milliseconds.
    ///
    /// With `max_samples_per_series` set, the oldest sample is dropped once
    /// the series is full; otherwise samples accumulate without bound.
    pub fn record_duration(&self, metric: &str, labels: &Labels, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut state = self.lock();
        let samples = state
            .durations
            .entry(sanitize_name(metric))
            .or_default()
            .entry(labels.canonical())
            .or_default();
        if let Some(max) = self.max_samples {
            while samples.len() >= max {
                samples.pop_front();
            }
        }
        samples.push_back(ms);
    }

    pub fn observe(&self, metric: &str, labels: &Labels, elapsed: Duration) {
        self.record_duration(metric, labels, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_message(&self) {
        self.record_event(EventKind::Message);
    }

    pub fn record_error(&self) {
        self.record_event(EventKind::Error);
    }

    fn record_event(&self, kind: EventKind) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.events.record(kind, now);
        match kind {
            EventKind::Message => state.totals.msgs += 1,
            EventKind::Error => state.totals.errors += 1,
        }
    }

    pub fn msgs_per_hour(&self) -> u64 {
        self.lock()
            .events
            .count(EventKind::Message, HOUR, self.clock.now_ms())
    }

    pub fn errors_per_hour(&self) -> u64 {
        self.lock()
            .events
            .count(EventKind::Error, HOUR, self.clock.now_ms())
    }

    pub fn last_five_minutes(&self) -> WindowCounts {
        self.lock().events.counts(FIVE_MINUTES, self.clock.now_ms())
    }

    pub fn totals(&self) -> Totals {
        self.lock().totals
    }

    pub fn counter(&self, metric: &str, labels: &Labels) -> u64 {
        self.lock()
            .counters
            .get(&sanitize_name(metric))
            .and_then(|series| series.get(&labels.canonical()))
            .copied()
            .unwrap_or(0)
    }

    pub fn sample_count(&self, metric: &str, labels: &Labels) -> usize {
        self.lock()
            .durations
            .get(&sanitize_name(metric))
            .and_then(|series| series.get(&labels.canonical()))
            .map_or(0, VecDeque::len)
    }

    /// Prometheus exposition text.
    pub fn render_prometheus(&self) -> String {
        render_prom_metrics(self)
    }

    pub fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot::capture(self)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
