//! Prometheus text exposition (format 0.0.4).

use std::fmt::Write as _;

use super::rolling::EventKind;
use super::{MetricsRegistry, FIVE_MINUTES, HOUR};

/// Content type of [`render_prom_metrics`] output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Histogram upper bounds in milliseconds; `+Inf` is implied.
pub const BUCKETS_MS: [f64; 8] = [50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0];

/// Render the registry: rolling gauges, then histograms, then counters.
pub fn render_prom_metrics(registry: &MetricsRegistry) -> String {
    let now = registry.now_ms();
    let state = registry.lock();
    let mut out = String::new();

    let gauges = [
        ("omni_msgs_per_hour", state.events.count(EventKind::Message, HOUR, now)),
        ("omni_errors_per_hour", state.events.count(EventKind::Error, HOUR, now)),
        ("omni_msgs_last_5m", state.events.count(EventKind::Message, FIVE_MINUTES, now)),
        ("omni_errors_last_5m", state.events.count(EventKind::Error, FIVE_MINUTES, now)),
    ];
    for (name, value) in gauges {
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(out, "{name} {value}");
    }

    for (name, series) in &state.durations {
        if series.values().all(|samples| samples.is_empty()) {
            continue;
        }
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (labels, samples) in series {
            if samples.is_empty() {
                continue;
            }
            for bound in BUCKETS_MS {
                let cumulative = samples.iter().filter(|s| **s <= bound).count();
                let le = format!("le=\"{bound}\"");
                let _ = writeln!(
                    out,
                    "{name}_bucket{} {cumulative}",
                    braces(&join(labels, &le))
                );
            }
            let inf = join(labels, "le=\"+Inf\"");
            let _ = writeln!(out, "{name}_bucket{} {}", braces(&inf), samples.len());
            let sum: f64 = samples.iter().sum();
            let _ = writeln!(out, "{name}_sum{} {sum}", braces(labels));
            let _ = writeln!(out, "{name}_count{} {}", braces(labels), samples.len());
        }
    }

    for (name, series) in &state.counters {
        let _ = writeln!(out, "# TYPE {name} counter");
        for (labels, value) in series {
            let _ = writeln!(out, "{name}{} {value}", braces(labels));
        }
    }

    out
}

fn join(labels: &str, extra: &str) -> String {
    if labels.is_empty() {
        extra.to_string()
    } else {
        format!("{labels},{extra}")
    }
}

fn braces(labels: &str) -> String {
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{labels}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::metrics::Labels;
    use crate::utils::clock::ManualClock;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::with_clock(&MetricsConfig::default(), ManualClock::new(10_000_000))
    }

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let registry = registry();
        let labels = Labels::new().with("channel", "whatsapp");
        for ms in [40.0, 120.0, 3000.0] {
            registry.record_duration("omni_send_ms", &labels, ms);
        }

        let text = render_prom_metrics(&registry);
        let out = lines(&text);

        assert!(out.contains(&"# TYPE omni_send_ms histogram"));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="50"} 1"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="100"} 1"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="250"} 2"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="2000"} 2"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="5000"} 3"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="10000"} 3"#));
        assert!(out.contains(&r#"omni_send_ms_bucket{channel="whatsapp",le="+Inf"} 3"#));
        assert!(out.contains(&r#"omni_send_ms_sum{channel="whatsapp"} 3160"#));
        assert!(out.contains(&r#"omni_send_ms_count{channel="whatsapp"} 3"#));
    }

    #[test]
    fn test_bucket_counts_never_decrease() {
        let registry = registry();
        let labels = Labels::new();
        for ms in [5.0, 75.0, 75.0, 600.0, 20_000.0, 1.5] {
            registry.record_duration("lat", &labels, ms);
        }

        let text = render_prom_metrics(&registry);
        let counts: Vec<u64> = text
            .lines()
            .filter(|l| l.starts_with("lat_bucket"))
            .map(|l| l.rsplit(' ').next().unwrap().parse().unwrap())
            .collect();

        assert_eq!(counts.len(), BUCKETS_MS.len() + 1);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*counts.last().unwrap(), 6);
        assert!(text.contains("lat_bucket{le=\"50\"} 2\n"));
        assert!(text.contains("lat_sum 20756.5\n"));
        assert!(text.contains("lat_count 6\n"));
    }

    #[test]
    fn test_rolling_gauges_always_present() {
        let registry = registry();
        registry.record_message();
        registry.record_message();
        registry.record_error();

        let text = render_prom_metrics(&registry);
        let out = lines(&text);
        assert!(out.contains(&"# TYPE omni_msgs_per_hour gauge"));
        assert!(out.contains(&"omni_msgs_per_hour 2"));
        assert!(out.contains(&"omni_errors_per_hour 1"));
        assert!(out.contains(&"omni_msgs_last_5m 2"));
        assert!(out.contains(&"omni_errors_last_5m 1"));
    }

    #[test]
    fn test_counters_one_line_per_label_set() {
        let registry = registry();
        let ok = Labels::new().with("stream", "omni.messages").with("outcome", "ok");
        let dup = Labels::new().with("stream", "omni.messages").with("outcome", "duplicate");
        registry.increment_counter("omni_bus_publish_total", &ok, 2);
        registry.increment_counter("omni_bus_publish_total", &dup, 1);

        let text = render_prom_metrics(&registry);
        let out = lines(&text);
        assert_eq!(
            out.iter()
                .filter(|l| **l == "# TYPE omni_bus_publish_total counter")
                .count(),
            1
        );
        assert!(out.contains(
            &r#"omni_bus_publish_total{outcome="duplicate",stream="omni.messages"} 1"#
        ));
        assert!(out.contains(&r#"omni_bus_publish_total{outcome="ok",stream="omni.messages"} 2"#));
    }

    #[test]
    fn test_escaped_label_values_in_output() {
        let registry = registry();
        registry.increment_counter("c", &Labels::new().with("to", "say \"hi\"\n"), 1);

        let text = render_prom_metrics(&registry);
        assert!(text.contains(r#"c{to="say \"hi\"\n"} 1"#));
    }

    #[test]
    fn test_empty_registry_renders_only_gauges() {
        let text = render_prom_metrics(&registry());
        assert_eq!(text.lines().count(), 8);
        assert!(!text.contains("histogram"));
    }
}
