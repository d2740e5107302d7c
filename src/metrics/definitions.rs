use crate::metrics::types::{Labels, MetricPoint};

pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_BROKER: &str = "broker";
pub const LABEL_BROKER_ADDRESS: &str = "broker_address";
pub const LABEL_TOPIC: &str = "topic";
pub const LABEL_GROUP: &str = "group";
pub const LABEL_CLIENT_ADDRESSES: &str = "client_addresses";
pub const LABEL_CLIENT_IDS: &str = "client_ids";
pub const LABEL_ONLINE_CONSUMERS: &str = "count_of_online_consumers";
pub const LABEL_MESSAGE_MODEL: &str = "msg_model";
pub const LABEL_TARGET: &str = "target";

/// Fixed shape of a gauge family: name, help text and the ordered label schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Build a gauge point; `values` are matched positionally against `self.labels`.
    pub fn gauge(&self, values: &[&str], value: f64) -> MetricPoint {
        debug_assert_eq!(
            values.len(),
            self.labels.len(),
            "label values do not match schema of {}",
            self.name
        );
        let labels: Labels = self
            .labels
            .iter()
            .zip(values)
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        MetricPoint::gauge(self.name, labels, value, self.help)
    }
}

const BROKER_LABELS: &[&str] = &[LABEL_CLUSTER, LABEL_BROKER, LABEL_BROKER_ADDRESS];
const TOPIC_LABELS: &[&str] = &[LABEL_CLUSTER, LABEL_BROKER, LABEL_TOPIC];
const GROUP_LABELS: &[&str] = &[LABEL_CLUSTER, LABEL_BROKER, LABEL_TOPIC, LABEL_GROUP];
const BACKLOG_LABELS: &[&str] = &[
    LABEL_GROUP,
    LABEL_TOPIC,
    LABEL_ONLINE_CONSUMERS,
    LABEL_MESSAGE_MODEL,
];

pub const BROKER_TPS: MetricDef = MetricDef {
    name: "rocketmq_broker_tps",
    help: "Messages put to the broker over the last minute",
    labels: BROKER_LABELS,
};

pub const BROKER_QPS: MetricDef = MetricDef {
    name: "rocketmq_broker_qps",
    help: "Messages fetched from the broker per second, minute window",
    labels: BROKER_LABELS,
};

pub const PRODUCER_TPS: MetricDef = MetricDef {
    name: "rocketmq_producer_tps",
    help: "Messages produced to the topic per second on this broker",
    labels: TOPIC_LABELS,
};

pub const PRODUCER_MESSAGE_SIZE: MetricDef = MetricDef {
    name: "rocketmq_producer_message_size",
    help: "Bytes produced to the topic per second on this broker",
    labels: TOPIC_LABELS,
};

pub const CONSUMER_TPS: MetricDef = MetricDef {
    name: "rocketmq_consumer_tps",
    help: "Messages consumed by the group per second on this broker",
    labels: GROUP_LABELS,
};

pub const CONSUMER_MESSAGE_SIZE: MetricDef = MetricDef {
    name: "rocketmq_consumer_message_size",
    help: "Bytes consumed by the group per second on this broker",
    labels: GROUP_LABELS,
};

pub const SEND_BACK_NUMS: MetricDef = MetricDef {
    name: "rocketmq_send_back_nums",
    help: "Messages sent back to the retry topic over the last minute",
    labels: GROUP_LABELS,
};

pub const GROUP_COUNT: MetricDef = MetricDef {
    name: "rocketmq_group_count",
    help: "Number of online consumer clients of the group",
    labels: &[LABEL_CLIENT_ADDRESSES, LABEL_CLIENT_IDS, LABEL_TOPIC, LABEL_GROUP],
};

pub const GROUP_RETRY_DIFF: MetricDef = MetricDef {
    name: "rocketmq_group_retrydiff",
    help: "Unconsumed messages of the group on its retry topic",
    labels: BACKLOG_LABELS,
};

pub const GROUP_DLQ_DIFF: MetricDef = MetricDef {
    name: "rocketmq_group_dlqdiff",
    help: "Unconsumed messages of the group on its dead-letter topic",
    labels: BACKLOG_LABELS,
};

pub const GROUP_DIFF: MetricDef = MetricDef {
    name: "rocketmq_group_diff",
    help: "Unconsumed messages of the group on the topic",
    labels: BACKLOG_LABELS,
};

pub const CONSUMER_OFFSET: MetricDef = MetricDef {
    name: "rocketmq_consumer_offset",
    help: "Sum of consumer offsets of the group across the broker's queues",
    labels: GROUP_LABELS,
};

pub const GROUP_GET_LATENCY_BY_STORETIME: MetricDef = MetricDef {
    name: "rocketmq_group_get_latency_by_storetime",
    help: "Milliseconds since the oldest unconsumed message was stored, max across the broker's queues",
    labels: GROUP_LABELS,
};

/// Every collector-emitted family, in exposition order.
#[cfg(test)]
pub const ALL_METRICS: &[&MetricDef] = &[
    &BROKER_TPS,
    &BROKER_QPS,
    &PRODUCER_TPS,
    &PRODUCER_MESSAGE_SIZE,
    &CONSUMER_TPS,
    &CONSUMER_MESSAGE_SIZE,
    &SEND_BACK_NUMS,
    &GROUP_COUNT,
    &GROUP_RETRY_DIFF,
    &GROUP_DLQ_DIFF,
    &GROUP_DIFF,
    &CONSUMER_OFFSET,
    &GROUP_GET_LATENCY_BY_STORETIME,
];

pub const METRIC_SCRAPE_DURATION_SECONDS: &str = "rocketmq_exporter_scrape_duration_seconds";
pub const METRIC_UP: &str = "rocketmq_exporter_up";
pub const METRIC_LAST_UPDATE_TIMESTAMP: &str =
    "rocketmq_exporter_last_update_timestamp_seconds";

pub const HELP_SCRAPE_DURATION_SECONDS: &str = "Duration of the last collection cycle in seconds";
pub const HELP_UP: &str = "1 if the exporter is healthy, 0 otherwise";
pub const HELP_LAST_UPDATE_TIMESTAMP: &str =
    "Unix timestamp of the last successful collection per target";
