//! Per-cycle collectors. Each one reads through [`AdminApi`]/[`PullApi`] and
//! writes finished samples to a [`MetricSink`](crate::metrics::sink::MetricSink).
//!
//! [`AdminApi`]: crate::rocketmq::AdminApi
//! [`PullApi`]: crate::rocketmq::PullApi

pub mod broker_stats;
pub mod consumer_offset;
pub mod stats_query;
pub mod topic_stats;

pub use broker_stats::BrokerStatsCollector;
pub use consumer_offset::ConsumerOffsetCollector;
pub use topic_stats::TopicStatsCollector;
