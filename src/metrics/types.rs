use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum MetricValue {
    Gauge(f64),
}

impl MetricValue {
    pub const fn as_f64(&self) -> f64 {
        match self {
            Self::Gauge(v) => *v,
        }
    }
}

pub type Labels = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub name: String,
    pub labels: Labels,
    pub value: MetricValue,
    pub help: &'static str,
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
        }
    }
}

impl MetricPoint {
    pub fn gauge(name: impl Into<String>, labels: Labels, value: f64, help: &'static str) -> Self {
        Self {
            name: name.into(),
            labels,
            value: MetricValue::Gauge(value),
            help,
            metric_type: MetricType::Gauge,
        }
    }

    #[cfg(test)]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}
