use crate::collector::stats_query::{
    self, GROUP_GET_NUMS, GROUP_GET_SIZE, SNDBCK_PUT_NUMS, TOPIC_PUT_NUMS, TOPIC_PUT_SIZE,
    group_stats_key,
};
use crate::metrics::definitions::{
    CONSUMER_MESSAGE_SIZE, CONSUMER_TPS, PRODUCER_MESSAGE_SIZE, PRODUCER_TPS, SEND_BACK_NUMS,
};
use crate::metrics::sink::MetricSink;
use crate::rocketmq::model::BrokerData;
use crate::rocketmq::{AdminApi, is_dlq_topic, is_retry_topic};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Producer and per-group consumer throughput of one topic.
pub struct TopicStatsCollector {
    admin: Arc<dyn AdminApi>,
}

impl TopicStatsCollector {
    pub fn new(admin: Arc<dyn AdminApi>) -> Self {
        Self { admin }
    }

    /// Returns the groups consuming `topic`, or `None` when the topic is
    /// internal or its consumers could not be listed.
    #[instrument(skip(self, sink))]
    pub async fn collect(&self, topic: &str, sink: &MetricSink) -> Option<Vec<String>> {
        if is_dlq_topic(topic) || is_retry_topic(topic) {
            return None;
        }

        let brokers = match self.admin.examine_topic_route(topic).await {
            Ok(route) => {
                let mut brokers = route.broker_datas;
                brokers.sort_by(|a, b| a.broker_name.cmp(&b.broker_name));
                Some(brokers)
            }
            Err(e) => {
                warn!(error = %e, "Topic route lookup failed, skipping broker stats");
                None
            }
        };

        if let Some(brokers) = &brokers {
            for broker in brokers {
                self.collect_producer(topic, broker, sink).await;
            }
        }

        let groups = match self.admin.examine_topic_consume_by_who(topic).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(error = %e, "Listing consumer groups failed, skipping topic");
                return None;
            }
        };
        debug!(groups = groups.len(), "Resolved consumer groups");

        if let Some(brokers) = &brokers {
            for group in &groups {
                for broker in brokers {
                    self.collect_consumer(topic, group, broker, sink).await;
                }
            }
        }

        Some(groups)
    }

    async fn collect_producer(&self, topic: &str, broker: &BrokerData, sink: &MetricSink) {
        let Some(addr) = broker.select_broker_addr() else {
            debug!(broker = broker.broker_name, "No address for broker");
            return;
        };
        let labels = [broker.cluster.as_str(), broker.broker_name.as_str(), topic];
        let admin = self.admin.as_ref();

        if let Some(put) =
            stats_query::query(admin, TOPIC_PUT_NUMS, topic, &broker.broker_name, addr).await
        {
            sink.emit(PRODUCER_TPS.gauge(&labels, put.stats_minute.tps))
                .await;
        }
        if let Some(size) =
            stats_query::query(admin, TOPIC_PUT_SIZE, topic, &broker.broker_name, addr).await
        {
            sink.emit(PRODUCER_MESSAGE_SIZE.gauge(&labels, size.stats_minute.tps))
                .await;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn collect_consumer(
        &self,
        topic: &str,
        group: &str,
        broker: &BrokerData,
        sink: &MetricSink,
    ) {
        let Some(addr) = broker.select_broker_addr() else {
            return;
        };
        let key = group_stats_key(topic, group);
        let labels = [
            broker.cluster.as_str(),
            broker.broker_name.as_str(),
            topic,
            group,
        ];
        let admin = self.admin.as_ref();

        if let Some(get) =
            stats_query::query(admin, GROUP_GET_NUMS, &key, &broker.broker_name, addr).await
        {
            sink.emit(CONSUMER_TPS.gauge(&labels, get.stats_minute.tps))
                .await;
        }
        if let Some(size) =
            stats_query::query(admin, GROUP_GET_SIZE, &key, &broker.broker_name, addr).await
        {
            sink.emit(CONSUMER_MESSAGE_SIZE.gauge(&labels, size.stats_minute.tps))
                .await;
        }
        if let Some(send_back) =
            stats_query::query(admin, SNDBCK_PUT_NUMS, &key, &broker.broker_name, addr).await
        {
            sink.emit(SEND_BACK_NUMS.gauge(&labels, send_back.stats_minute.sum as f64))
                .await;
        }
    }
}
