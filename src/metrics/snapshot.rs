//! JSON monitoring snapshot computed from raw samples.

use std::collections::BTreeMap;

use serde::Serialize;

use super::rolling::EventKind;
use super::{MetricsRegistry, Totals, WindowCounts, FIVE_MINUTES, HOUR};

/// Summary of one duration series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl SeriesStats {
    fn from_samples<'a>(samples: impl IntoIterator<Item = &'a f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &s in samples {
            count += 1;
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        (count > 0).then(|| Self {
            count,
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

/// Point-in-time view for the dashboard endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub generated_at_ms: u64,
    pub msgs_per_hour: u64,
    pub errors_per_hour: u64,
    pub last_five_minutes: WindowCounts,
    pub totals: Totals,
    /// metric -> canonical labels -> value
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
    /// metric -> canonical labels -> stats; empty series are omitted
    pub durations: BTreeMap<String, BTreeMap<String, SeriesStats>>,
}

impl MonitoringSnapshot {
    pub fn capture(registry: &MetricsRegistry) -> Self {
        let now = registry.now_ms();
        let state = registry.lock();

        let durations = state
            .durations
            .iter()
            .filter_map(|(name, series)| {
                let stats: BTreeMap<_, _> = series
                    .iter()
                    .filter_map(|(labels, samples)| {
                        SeriesStats::from_samples(samples).map(|s| (labels.clone(), s))
                    })
                    .collect();
                (!stats.is_empty()).then(|| (name.clone(), stats))
            })
            .collect();

        Self {
            generated_at_ms: now,
            msgs_per_hour: state.events.count(EventKind::Message, HOUR, now),
            errors_per_hour: state.events.count(EventKind::Error, HOUR, now),
            last_five_minutes: state.events.counts(FIVE_MINUTES, now),
            totals: state.totals,
            counters: state.counters.clone(),
            durations,
        }
    }
}
