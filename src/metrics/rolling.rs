//! Trailing-window event counts.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Longest window queried; older events are pruned.
pub const HOUR: Duration = Duration::from_secs(3600);
pub const FIVE_MINUTES: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Error,
}

/// Message and error counts over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub msgs: u64,
    pub errors: u64,
}

/// Timestamped event log, sliding rather than bucketed.
#[derive(Debug, Default)]
pub(crate) struct RollingLog {
    events: VecDeque<(u64, EventKind)>,
}

impl RollingLog {
    pub fn record(&mut self, kind: EventKind, now_ms: u64) {
        self.prune(now_ms);
        self.events.push_back((now_ms, kind));
    }

    /// Events of `kind` younger than `window` at `now_ms`.
    pub fn count(&self, kind: EventKind, window: Duration, now_ms: u64) -> u64 {
        self.in_window(window, now_ms)
            .filter(|(_, k)| *k == kind)
            .count() as u64
    }

    pub fn counts(&self, window: Duration, now_ms: u64) -> WindowCounts {
        self.in_window(window, now_ms)
            .fold(WindowCounts::default(), |mut acc, (_, kind)| {
                match kind {
                    EventKind::Message => acc.msgs += 1,
                    EventKind::Error => acc.errors += 1,
                }
                acc
            })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    fn in_window(
        &self,
        window: Duration,
        now_ms: u64,
    ) -> impl Iterator<Item = &(u64, EventKind)> + '_ {
        let window_ms = window.as_millis() as u64;
        // Newest events are at the back; stop at the first one too old.
        self.events
            .iter()
            .rev()
            .take_while(move |(ts, _)| now_ms.saturating_sub(*ts) < window_ms)
    }

    fn prune(&mut self, now_ms: u64) {
        let horizon = HOUR.as_millis() as u64;
        while let Some((ts, _)) = self.events.front() {
            if now_ms.saturating_sub(*ts) < horizon {
                break;
            }
            self.events.pop_front();
        }
    }
}
