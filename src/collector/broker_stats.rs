use crate::collector::stats_query::{self, BROKER_GET_NUMS, BROKER_PUT_NUMS};
use crate::metrics::definitions::{BROKER_QPS, BROKER_TPS};
use crate::metrics::sink::MetricSink;
use crate::rocketmq::AdminApi;
use crate::rocketmq::model::BrokerData;
use std::sync::Arc;
use tracing::warn;

/// Broker-wide put/get throughput.
pub struct BrokerStatsCollector {
    admin: Arc<dyn AdminApi>,
}

impl BrokerStatsCollector {
    pub fn new(admin: Arc<dyn AdminApi>) -> Self {
        Self { admin }
    }

    #[allow(clippy::cast_precision_loss)]
    pub async fn collect(&self, broker: &BrokerData, sink: &MetricSink) {
        let Some(addr) = broker.select_broker_addr() else {
            warn!(
                cluster = broker.cluster,
                broker = broker.broker_name,
                "No address for broker, skipping broker stats"
            );
            return;
        };
        let labels = [broker.cluster.as_str(), broker.broker_name.as_str(), addr];

        // Both stats are keyed by the owning cluster.
        if let Some(put) = stats_query::query(
            self.admin.as_ref(),
            BROKER_PUT_NUMS,
            &broker.cluster,
            &broker.broker_name,
            addr,
        )
        .await
        {
            sink.emit(BROKER_TPS.gauge(&labels, put.stats_minute.sum as f64))
                .await;
        }

        if let Some(get) = stats_query::query(
            self.admin.as_ref(),
            BROKER_GET_NUMS,
            &broker.cluster,
            &broker.broker_name,
            addr,
        )
        .await
        {
            sink.emit(BROKER_QPS.gauge(&labels, get.stats_minute.tps))
                .await;
        }
    }
}
