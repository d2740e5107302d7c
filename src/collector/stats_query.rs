use crate::rocketmq::AdminApi;
use crate::rocketmq::model::BrokerStatsData;
use tracing::{debug, warn};

pub const BROKER_PUT_NUMS: &str = "BROKER_PUT_NUMS";
pub const BROKER_GET_NUMS: &str = "BROKER_GET_NUMS";
pub const TOPIC_PUT_NUMS: &str = "TOPIC_PUT_NUMS";
pub const TOPIC_PUT_SIZE: &str = "TOPIC_PUT_SIZE";
pub const GROUP_GET_NUMS: &str = "GROUP_GET_NUMS";
pub const GROUP_GET_SIZE: &str = "GROUP_GET_SIZE";
pub const SNDBCK_PUT_NUMS: &str = "SNDBCK_PUT_NUMS";

/// Stats key for per-group statistics of a topic.
pub fn group_stats_key(topic: &str, group: &str) -> String {
    format!("{topic}@{group}")
}

/// Best-effort broker statistic lookup.
///
/// Errors and empty answers both come back as `None`; the caller skips the
/// sample for this cycle.
pub async fn query(
    admin: &dyn AdminApi,
    stats_name: &str,
    stats_key: &str,
    broker_name: &str,
    broker_addr: &str,
) -> Option<BrokerStatsData> {
    match admin
        .query_broker_stats(stats_name, stats_key, broker_addr)
        .await
    {
        Ok(Some(data)) => Some(data),
        Ok(None) => {
            debug!(
                stats_name = stats_name,
                stats_key = stats_key,
                broker = broker_name,
                broker_addr = broker_addr,
                "No stats data"
            );
            None
        }
        Err(e) => {
            warn!(
                stats_name = stats_name,
                stats_key = stats_key,
                broker = broker_name,
                broker_addr = broker_addr,
                error = %e,
                "Broker stats query failed"
            );
            None
        }
    }
}
