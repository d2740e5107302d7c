use crate::metrics::definitions::{
    HELP_LAST_UPDATE_TIMESTAMP, HELP_SCRAPE_DURATION_SECONDS, HELP_UP, LABEL_TARGET,
    METRIC_LAST_UPDATE_TIMESTAMP, METRIC_SCRAPE_DURATION_SECONDS, METRIC_UP,
};
use crate::metrics::types::{Labels, MetricPoint};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default staleness threshold: 3x the default poll interval
const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(90);

pub struct MetricsRegistry {
    metrics: DashMap<String, Vec<MetricPoint>>,
    last_update: DashMap<String, Instant>,
    last_update_timestamp: DashMap<String, u64>, // Unix timestamp in seconds
    healthy: AtomicBool,
    last_scrape_duration_ms: AtomicU64,
    staleness_threshold: Duration,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_staleness_threshold(DEFAULT_STALENESS_THRESHOLD)
    }

    pub fn with_staleness_threshold(staleness_threshold: Duration) -> Self {
        Self {
            metrics: DashMap::new(),
            last_update: DashMap::new(),
            last_update_timestamp: DashMap::new(),
            healthy: AtomicBool::new(true),
            last_scrape_duration_ms: AtomicU64::new(0),
            staleness_threshold,
        }
    }

    /// Replace all points of a target with the output of one finished cycle.
    pub fn update(&self, target: &str, points: Vec<MetricPoint>) {
        let unix_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        self.metrics.insert(target.to_string(), points);
        self.last_update.insert(target.to_string(), Instant::now());
        self.last_update_timestamp
            .insert(target.to_string(), unix_timestamp);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_scrape_duration_ms(&self, duration_ms: u64) {
        self.last_scrape_duration_ms
            .store(duration_ms, Ordering::SeqCst);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn get_scrape_duration_seconds(&self) -> f64 {
        self.last_scrape_duration_ms.load(Ordering::SeqCst) as f64 / 1000.0
    }

    pub fn render_prometheus(&self) -> String {
        self.render_prometheus_with_staleness_check(true)
    }

    fn is_fresh(&self, target: &str, now: Instant) -> bool {
        self.last_update
            .get(target)
            .is_some_and(|last_update| now.duration_since(*last_update) <= self.staleness_threshold)
    }

    /// Render Prometheus metrics, optionally filtering out stale targets
    pub fn render_prometheus_with_staleness_check(&self, filter_stale: bool) -> String {
        let mut output = String::new();
        let now = Instant::now();

        // Keep DashMap guards alive while their contents are borrowed
        let guards: Vec<_> = self
            .metrics
            .iter()
            .filter(|entry| !filter_stale || self.is_fresh(entry.key(), now))
            .collect();

        let mut by_name: HashMap<&str, Vec<&MetricPoint>> = HashMap::new();
        for guard in &guards {
            for point in guard.value() {
                by_name.entry(point.name.as_str()).or_default().push(point);
            }
        }

        let mut names: Vec<_> = by_name.keys().copied().collect();
        names.sort_unstable();

        for name in names {
            let points = &by_name[name];
            let Some(first) = points.first() else {
                continue;
            };

            let _ = writeln!(output, "# HELP {name} {}", first.help);
            let _ = writeln!(output, "# TYPE {name} {}", first.metric_type.as_str());

            for point in points {
                let _ = writeln!(
                    output,
                    "{}{} {}",
                    point.name,
                    render_labels(&point.labels),
                    point.value.as_f64()
                );
            }
        }

        let scrape_duration = self.get_scrape_duration_seconds();
        let _ = writeln!(
            output,
            "# HELP {METRIC_SCRAPE_DURATION_SECONDS} {HELP_SCRAPE_DURATION_SECONDS}"
        );
        let _ = writeln!(output, "# TYPE {METRIC_SCRAPE_DURATION_SECONDS} gauge");
        let _ = writeln!(output, "{METRIC_SCRAPE_DURATION_SECONDS} {scrape_duration:.6}");

        let _ = writeln!(output, "# HELP {METRIC_UP} {HELP_UP}");
        let _ = writeln!(output, "# TYPE {METRIC_UP} gauge");
        let _ = writeln!(output, "{METRIC_UP} {}", i32::from(self.is_healthy()));

        if !self.last_update_timestamp.is_empty() {
            let _ = writeln!(
                output,
                "# HELP {METRIC_LAST_UPDATE_TIMESTAMP} {HELP_LAST_UPDATE_TIMESTAMP}"
            );
            let _ = writeln!(output, "# TYPE {METRIC_LAST_UPDATE_TIMESTAMP} gauge");
            let mut timestamps: Vec<(String, u64)> = self
                .last_update_timestamp
                .iter()
                .filter(|entry| !filter_stale || self.is_fresh(entry.key(), now))
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect();
            timestamps.sort_unstable();
            for (target, timestamp) in timestamps {
                let _ = writeln!(
                    output,
                    "{METRIC_LAST_UPDATE_TIMESTAMP}{{{LABEL_TARGET}=\"{}\"}} {timestamp}",
                    escape_label_value(&target)
                );
            }
        }

        output
    }

    pub fn remove_target(&self, target: &str) {
        self.metrics.remove(target);
        self.last_update.remove(target);
        self.last_update_timestamp.remove(target);
    }

    pub fn target_count(&self) -> usize {
        self.metrics.len()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| *k);

    let label_str = pairs
        .into_iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");

    format!("{{{label_str}}}")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Attach per-target static labels; collector labels win on conflict.
pub fn add_custom_labels(points: &mut [MetricPoint], custom_labels: &HashMap<String, String>) {
    if custom_labels.is_empty() {
        return;
    }
    for point in points {
        for (k, v) in custom_labels {
            point
                .labels
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::definitions::{CONSUMER_OFFSET, GROUP_COUNT, GROUP_DIFF};

    fn sample_points() -> Vec<MetricPoint> {
        vec![
            CONSUMER_OFFSET.gauge(&["DefaultCluster", "broker-a", "orders", "g1"], 15.0),
            GROUP_DIFF.gauge(&["g1", "orders", "2", "CLUSTERING"], 3.0),
        ]
    }

    #[test]
    fn test_update_replaces_previous_cycle() {
        let registry = MetricsRegistry::new();
        registry.update("prod", sample_points());
        registry.update(
            "prod",
            vec![GROUP_DIFF.gauge(&["g1", "orders", "2", "CLUSTERING"], 7.0)],
        );

        let output = registry.render_prometheus();
        assert!(!output.contains("rocketmq_consumer_offset{"));
        assert!(output.contains(
            "rocketmq_group_diff{count_of_online_consumers=\"2\",group=\"g1\",msg_model=\"CLUSTERING\",topic=\"orders\"} 7"
        ));
    }

    #[test]
    fn test_prometheus_format_gauge() {
        let registry = MetricsRegistry::new();
        registry.update("prod", sample_points());

        let output = registry.render_prometheus();
        assert!(output.contains("# HELP rocketmq_consumer_offset"));
        assert!(output.contains("# TYPE rocketmq_consumer_offset gauge"));
        assert!(output.contains(
            "rocketmq_consumer_offset{broker=\"broker-a\",cluster=\"DefaultCluster\",group=\"g1\",topic=\"orders\"} 15"
        ));
        assert!(output.contains("rocketmq_exporter_last_update_timestamp_seconds{target=\"prod\"}"));
    }

    #[test]
    fn test_help_emitted_once_per_family() {
        let registry = MetricsRegistry::new();
        registry.update("a", sample_points());
        registry.update("b", sample_points());

        let output = registry.render_prometheus();
        assert_eq!(output.matches("# HELP rocketmq_group_diff ").count(), 1);
        assert_eq!(output.matches("rocketmq_group_diff{").count(), 2);
    }

    #[test]
    fn test_empty_label_values_rendered() {
        let registry = MetricsRegistry::new();
        registry.update("prod", vec![GROUP_COUNT.gauge(&["", "", "orders", "g1"], 0.0)]);

        let output = registry.render_prometheus();
        assert!(output.contains(
            "rocketmq_group_count{client_addresses=\"\",client_ids=\"\",group=\"g1\",topic=\"orders\"} 0"
        ));
    }

    #[test]
    fn test_up_metric() {
        let registry = MetricsRegistry::new();
        assert!(registry.render_prometheus().contains("rocketmq_exporter_up 1"));

        registry.set_healthy(false);
        assert!(registry.render_prometheus().contains("rocketmq_exporter_up 0"));
    }

    #[test]
    fn test_stale_target_hidden() {
        let registry = MetricsRegistry::with_staleness_threshold(Duration::from_millis(0));
        registry.update("prod", sample_points());
        std::thread::sleep(Duration::from_millis(5));

        let filtered = registry.render_prometheus();
        assert!(!filtered.contains("rocketmq_consumer_offset{"));
        assert!(!filtered.contains("target=\"prod\""));

        let unfiltered = registry.render_prometheus_with_staleness_check(false);
        assert!(unfiltered.contains("rocketmq_consumer_offset{"));
    }

    #[test]
    fn test_remove_target() {
        let registry = MetricsRegistry::new();
        registry.update("prod", sample_points());
        assert_eq!(registry.target_count(), 1);

        registry.remove_target("prod");
        assert_eq!(registry.target_count(), 0);
        assert!(!registry.render_prometheus().contains("rocketmq_consumer_offset"));
    }

    #[test]
    fn test_custom_labels_do_not_override() {
        let mut points = sample_points();
        let mut custom = HashMap::new();
        custom.insert("env".to_string(), "prod".to_string());
        custom.insert("group".to_string(), "overridden".to_string());

        add_custom_labels(&mut points, &custom);

        for point in &points {
            assert_eq!(point.label("env"), Some("prod"));
            assert_eq!(point.label("group"), Some("g1"));
        }
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_escape_label_value_safe(input in ".*") {
            let escaped = escape_label_value(&input);
            let mut chars = escaped.chars().peekable();
            while let Some(c) = chars.next() {
                prop_assert_ne!(c, '\n');
                if c == '\\' {
                    let next = chars.next();
                    prop_assert!(matches!(next, Some('\\' | '"' | 'n')));
                } else {
                    prop_assert_ne!(c, '"');
                }
            }
        }

        #[test]
        fn prop_scrape_duration_conversion(ms in 0u64..10_000_000) {
            let registry = MetricsRegistry::new();
            registry.set_scrape_duration_ms(ms);
            #[allow(clippy::cast_precision_loss)]
            let expected = ms as f64 / 1000.0;
            prop_assert!((registry.get_scrape_duration_seconds() - expected).abs() < 1e-9);
        }
    }
}
