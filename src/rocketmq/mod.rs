//! RocketMQ collaborators: admin queries and probe pulls.
//!
//! Collectors only depend on the [`AdminApi`] and [`PullApi`] traits; the
//! remoting-protocol implementations live in [`client`] and [`consumer`].

pub mod client;
pub mod consumer;
pub mod fastjson;
pub mod model;
pub mod remoting;

use crate::error::Result;
use model::{
    BrokerStatsData, ClusterInfo, ConsumeStats, ConsumerConnection, MessageQueue, PullResult,
    TopicRoute,
};

pub use client::RocketmqClient;
pub use consumer::ProbeConsumer;

/// Topics holding messages that exhausted their redelivery attempts.
pub const DLQ_GROUP_TOPIC_PREFIX: &str = "%DLQ%";
/// Topics holding messages scheduled for redelivery to a group.
pub const RETRY_GROUP_TOPIC_PREFIX: &str = "%RETRY%";

pub fn is_dlq_topic(topic: &str) -> bool {
    topic.starts_with(DLQ_GROUP_TOPIC_PREFIX)
}

pub fn is_retry_topic(topic: &str) -> bool {
    topic.starts_with(RETRY_GROUP_TOPIC_PREFIX)
}

#[async_trait::async_trait]
pub trait AdminApi: Send + Sync {
    /// Drop cached routing data so the next cycle sees broker changes.
    fn invalidate_routes(&self) {}

    /// `Ok(None)` when the broker has no data for the key.
    async fn query_broker_stats(
        &self,
        stats_name: &str,
        stats_key: &str,
        broker_addr: &str,
    ) -> Result<Option<BrokerStatsData>>;

    async fn examine_consume_stats(&self, group: &str, topic: &str) -> Result<ConsumeStats>;

    async fn examine_topic_consume_by_who(&self, topic: &str) -> Result<Vec<String>>;

    async fn examine_topic_route(&self, topic: &str) -> Result<TopicRoute>;

    async fn examine_broker_cluster_info(&self) -> Result<ClusterInfo>;

    async fn fetch_all_topic_list(&self) -> Result<Vec<String>>;

    /// `Ok(None)` when no consumer of the group is online.
    async fn examine_consumer_connection(&self, group: &str)
    -> Result<Option<ConsumerConnection>>;
}

#[async_trait::async_trait]
pub trait PullApi: Send + Sync {
    async fn pull_from(&self, queue: &MessageQueue, offset: i64, max_nums: i32)
    -> Result<PullResult>;
}
