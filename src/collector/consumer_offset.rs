//! Consumer backlog, committed offsets and consumption latency for one
//! (topic, group) pair.
//!
//! Offsets come from the group's consume stats. Latency is estimated per
//! queue by pulling the first unconsumed message and measuring how long ago
//! the broker stored it, then reduced to the maximum per broker.

use crate::metrics::definitions::{
    CONSUMER_OFFSET, GROUP_COUNT, GROUP_DIFF, GROUP_DLQ_DIFF, GROUP_GET_LATENCY_BY_STORETIME,
    GROUP_RETRY_DIFF, MetricDef,
};
use crate::metrics::sink::MetricSink;
use crate::rocketmq::model::{
    BrokerIndex, ConsumerConnection, MessageModel, MessageQueue, OffsetPair, PullResult,
    PullStatus,
};
use crate::rocketmq::{AdminApi, PullApi, is_dlq_topic, is_retry_topic};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

/// Scratch totals of one collection call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupAggregates {
    /// Signed sum of `broker_offset - consumer_offset` over all queues
    pub diff_total: i64,
    /// Broker name to summed consumer offset
    pub consumer_offsets: BTreeMap<String, i64>,
    /// Broker name to the largest latency seen on its queues, in ms
    pub consumer_latencies: BTreeMap<String, i64>,
}

impl GroupAggregates {
    pub fn add_offsets(&mut self, queue: &MessageQueue, offsets: &OffsetPair) {
        self.diff_total += offsets.diff();
        *self
            .consumer_offsets
            .entry(queue.broker_name.clone())
            .or_default() += offsets.consumer_offset;
    }

    pub fn fold_latency(&mut self, broker_name: &str, latency_ms: i64) {
        self.consumer_latencies
            .entry(broker_name.to_string())
            .and_modify(|max| *max = (*max).max(latency_ms))
            .or_insert(latency_ms);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

pub struct ConsumerOffsetCollector {
    admin: Arc<dyn AdminApi>,
    puller: Arc<dyn PullApi>,
    clock: fn() -> i64,
}

impl ConsumerOffsetCollector {
    pub fn new(admin: Arc<dyn AdminApi>, puller: Arc<dyn PullApi>) -> Self {
        Self {
            admin,
            puller,
            clock: now_millis,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// `connection` is `None` when no consumer of the group is online; the
    /// group is then treated as clustering with zero consumers.
    #[allow(clippy::cast_precision_loss)]
    #[instrument(skip(self, connection, brokers, sink))]
    pub async fn collect(
        &self,
        topic: &str,
        group: &str,
        connection: Option<&ConsumerConnection>,
        brokers: &BrokerIndex,
        sink: &MetricSink,
    ) {
        if is_dlq_topic(topic) {
            return;
        }

        let message_model = connection.map_or(MessageModel::Clustering, |c| c.message_model);
        let connections = connection.map_or(&[][..], |c| c.connection_set.as_slice());
        let online = connections.len();

        let addresses = connections
            .iter()
            .map(|c| c.client_addr.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let client_ids = connections
            .iter()
            .map(|c| c.client_id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        sink.emit(GROUP_COUNT.gauge(
            &[addresses.as_str(), client_ids.as_str(), topic, group],
            online as f64,
        ))
        .await;

        let stats = match self.admin.examine_consume_stats(group, topic).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Fetching consume stats failed");
                return;
            }
        };

        let mut queues: Vec<_> = stats.offset_table.iter().collect();
        queues.sort_by(|a, b| a.0.cmp(b.0));

        let mut aggregates = GroupAggregates::default();
        for (queue, offsets) in queues {
            aggregates.add_offsets(queue, offsets);

            if message_model == MessageModel::Clustering
                && let Some(latency) = self.probe_latency(queue, offsets).await
            {
                aggregates.fold_latency(&queue.broker_name, latency);
            }
        }

        if message_model == MessageModel::Clustering {
            let online = online.to_string();
            sink.emit(backlog_metric(topic).gauge(
                &[group, topic, online.as_str(), message_model.as_str()],
                aggregates.diff_total as f64,
            ))
            .await;
        }

        emit_per_broker(&CONSUMER_OFFSET, &aggregates.consumer_offsets, topic, group, brokers, sink)
            .await;
        emit_per_broker(
            &GROUP_GET_LATENCY_BY_STORETIME,
            &aggregates.consumer_latencies,
            topic,
            group,
            brokers,
            sink,
        )
        .await;
    }

    /// Latency of the first unconsumed message of `queue`, or `None` when the
    /// queue must not contribute to the broker maximum.
    async fn probe_latency(&self, queue: &MessageQueue, offsets: &OffsetPair) -> Option<i64> {
        let result = match self.puller.pull_from(queue, offsets.consumer_offset, 1).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    queue = %queue,
                    consumer_offset = offsets.consumer_offset,
                    error = %e,
                    "Latency probe failed"
                );
                return None;
            }
        };

        match result.status {
            PullStatus::Found if offsets.diff() != 0 => Some(self.latency_of(&result)),
            PullStatus::Found => Some(0),
            PullStatus::OffsetIllegal => Some(self.probe_from_min(queue, result.min_offset).await),
            PullStatus::BrokerTimeout => {
                warn!(
                    queue = %queue,
                    consumer_offset = offsets.consumer_offset,
                    error = "PullBrokerTimeout",
                    "Latency probe timed out"
                );
                None
            }
            PullStatus::NoNewMessage | PullStatus::NoMatchedMessage => Some(0),
        }
    }

    /// The consumer offset fell out of retention; measure from the oldest
    /// retained message instead.
    async fn probe_from_min(&self, queue: &MessageQueue, min_offset: i64) -> i64 {
        match self.puller.pull_from(queue, min_offset, 1).await {
            Ok(result) if result.status == PullStatus::Found => self.latency_of(&result),
            Ok(result) => {
                debug!(queue = %queue, min_offset = min_offset, status = ?result.status, "No message at min offset");
                0
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    min_offset = min_offset,
                    error = %e,
                    "Latency probe at min offset failed"
                );
                0
            }
        }
    }

    fn latency_of(&self, result: &PullResult) -> i64 {
        result
            .first_store_timestamp()
            .map_or(0, |stored| (self.clock)() - stored)
    }
}

fn backlog_metric(topic: &str) -> &'static MetricDef {
    if is_retry_topic(topic) {
        &GROUP_RETRY_DIFF
    } else if is_dlq_topic(topic) {
        &GROUP_DLQ_DIFF
    } else {
        &GROUP_DIFF
    }
}

#[allow(clippy::cast_precision_loss)]
async fn emit_per_broker(
    def: &MetricDef,
    values: &BTreeMap<String, i64>,
    topic: &str,
    group: &str,
    brokers: &BrokerIndex,
    sink: &MetricSink,
) {
    for (broker_name, value) in values {
        let Some(cluster) = brokers.cluster_of(broker_name) else {
            debug!(
                metric = def.name,
                broker = broker_name,
                "Broker has no known cluster, skipping sample"
            );
            continue;
        };
        sink.emit(def.gauge(&[cluster, broker_name.as_str(), topic, group], *value as f64))
            .await;
    }
}
