use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One windowed aggregate of a broker statistic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerStatsItem {
    pub sum: i64,
    pub tps: f64,
}

/// Answer to a `VIEW_BROKER_STATS_DATA` query. Only the minute window is
/// exported; the hour and day windows are skipped on decode.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerStatsData {
    pub stats_minute: BrokerStatsItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl MessageQueue {
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: i32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker_name, self.queue_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetPair {
    pub broker_offset: i64,
    pub consumer_offset: i64,
}

impl OffsetPair {
    pub const fn new(consumer_offset: i64, broker_offset: i64) -> Self {
        Self {
            broker_offset,
            consumer_offset,
        }
    }

    /// Unconsumed messages; negative while a consumer offset runs ahead of the broker.
    pub const fn diff(&self) -> i64 {
        self.broker_offset - self.consumer_offset
    }
}

/// Per-queue offsets of one consumer group on one topic.
#[derive(Debug, Clone, Default)]
pub struct ConsumeStats {
    pub offset_table: HashMap<MessageQueue, OffsetPair>,
    pub consume_tps: f64,
}

impl ConsumeStats {
    pub fn merge(&mut self, other: ConsumeStats) {
        self.offset_table.extend(other.offset_table);
        self.consume_tps += other.consume_tps;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageModel {
    #[default]
    Clustering,
    Broadcasting,
}

impl MessageModel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clustering => "CLUSTERING",
            Self::Broadcasting => "BROADCASTING",
        }
    }
}

impl fmt::Display for MessageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub client_id: String,
    pub client_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConnection {
    pub connection_set: Vec<Connection>,
    pub message_model: MessageModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Found,
    NoNewMessage,
    NoMatchedMessage,
    OffsetIllegal,
    BrokerTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageExt {
    /// Milliseconds since the Unix epoch
    pub store_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub status: PullStatus,
    /// Earliest offset still stored; the restart point after `OffsetIllegal`.
    pub min_offset: i64,
    pub messages: Vec<MessageExt>,
}

impl PullResult {
    pub fn with_status(status: PullStatus) -> Self {
        Self {
            status,
            min_offset: 0,
            messages: Vec::new(),
        }
    }

    pub fn first_store_timestamp(&self) -> Option<i64> {
        self.messages.first().map(|m| m.store_timestamp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerData {
    pub cluster: String,
    pub broker_name: String,
    /// Broker id to address; id 0 is the master.
    pub broker_addrs: BTreeMap<i64, String>,
}

pub const MASTER_ID: i64 = 0;

impl BrokerData {
    /// Master address when present, otherwise the replica with the lowest id.
    pub fn select_broker_addr(&self) -> Option<&str> {
        self.broker_addrs
            .get(&MASTER_ID)
            .or_else(|| self.broker_addrs.values().next())
            .map(String::as_str)
            .filter(|addr| !addr.is_empty())
    }

    pub fn master_addr(&self) -> Option<&str> {
        self.broker_addrs
            .get(&MASTER_ID)
            .map(String::as_str)
            .filter(|addr| !addr.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicRoute {
    pub broker_datas: Vec<BrokerData>,
}

impl TopicRoute {
    pub fn broker(&self, broker_name: &str) -> Option<&BrokerData> {
        self.broker_datas
            .iter()
            .find(|b| b.broker_name == broker_name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterInfo {
    pub broker_addr_table: HashMap<String, BrokerData>,
    pub cluster_addr_table: HashMap<String, Vec<String>>,
}

impl ClusterInfo {
    pub fn broker_index(&self) -> BrokerIndex {
        let mut index = BrokerIndex::default();
        for (cluster, brokers) in &self.cluster_addr_table {
            for broker in brokers {
                index.insert(broker.clone(), cluster.clone());
            }
        }
        for (name, broker) in &self.broker_addr_table {
            if !broker.cluster.is_empty() {
                index.insert(name.clone(), broker.cluster.clone());
            }
        }
        index
    }

    /// Brokers ordered by name.
    pub fn brokers(&self) -> Vec<&BrokerData> {
        let mut brokers: Vec<_> = self.broker_addr_table.values().collect();
        brokers.sort_by(|a, b| a.broker_name.cmp(&b.broker_name));
        brokers
    }
}

/// Broker name to owning cluster name, rebuilt every cycle.
#[derive(Debug, Clone, Default)]
pub struct BrokerIndex {
    clusters: HashMap<String, String>,
}

impl BrokerIndex {
    pub fn insert(&mut self, broker_name: String, cluster: String) {
        self.clusters.insert(broker_name, cluster);
    }

    pub fn cluster_of(&self, broker_name: &str) -> Option<&str> {
        self.clusters.get(broker_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }
}

impl FromIterator<(String, String)> for BrokerIndex {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            clusters: iter.into_iter().collect(),
        }
    }
}
