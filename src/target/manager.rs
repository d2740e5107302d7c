use crate::collector::{BrokerStatsCollector, ConsumerOffsetCollector, TopicStatsCollector};
use crate::config::{CompiledFilters, ExporterConfig, TargetConfig};
use crate::error::Result;
use crate::metrics::registry::{MetricsRegistry, add_custom_labels};
use crate::metrics::sink::MetricSink;
use crate::metrics::types::MetricPoint;
use crate::rocketmq::model::BrokerIndex;
use crate::rocketmq::remoting::RemotingClient;
use crate::rocketmq::{
    AdminApi, ProbeConsumer, PullApi, RETRY_GROUP_TOPIC_PREFIX, RocketmqClient,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Default timeout for a single collection cycle (should be less than `poll_interval`)
const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Scrape loop of one RocketMQ deployment.
pub struct TargetManager {
    target_name: String,
    target_labels: HashMap<String, String>,
    admin: Arc<dyn AdminApi>,
    filters: CompiledFilters,
    broker_stats: BrokerStatsCollector,
    topic_stats: TopicStatsCollector,
    consumer_offsets: ConsumerOffsetCollector,
    registry: Arc<MetricsRegistry>,
    poll_interval: Duration,
    max_backoff: Duration,
    collection_timeout: Duration,
    max_concurrent_topics: usize,
    metric_channel_capacity: usize,
}

impl TargetManager {
    pub fn new(
        config: &TargetConfig,
        registry: Arc<MetricsRegistry>,
        exporter_config: &ExporterConfig,
    ) -> Result<Self> {
        let remoting = Arc::new(RemotingClient::new(config.request_timeout));
        let client = Arc::new(RocketmqClient::new(
            config.name.clone(),
            config.namesrv_addrs(),
            remoting,
        ));
        let puller = Arc::new(ProbeConsumer::new(
            Arc::clone(&client),
            config.probe_group.clone(),
        ));

        info!(
            target = config.name,
            namesrv = config.namesrv_addr,
            poll_interval = ?exporter_config.poll_interval,
            request_timeout = ?config.request_timeout,
            probe_group = config.probe_group,
            custom_labels = ?config.labels,
            "Created target manager"
        );

        Self::with_clients(config, client, puller, registry, exporter_config)
    }

    pub fn with_clients(
        config: &TargetConfig,
        admin: Arc<dyn AdminApi>,
        puller: Arc<dyn PullApi>,
        registry: Arc<MetricsRegistry>,
        exporter_config: &ExporterConfig,
    ) -> Result<Self> {
        let collection_timeout =
            collection_timeout(exporter_config.poll_interval, config.request_timeout);
        if collection_timeout > exporter_config.poll_interval {
            warn!(
                target = config.name,
                poll_interval = ?exporter_config.poll_interval,
                request_timeout = ?config.request_timeout,
                collection_timeout = ?collection_timeout,
                "collection_timeout exceeds poll_interval; consider increasing poll_interval"
            );
        }

        Ok(Self {
            target_name: config.name.clone(),
            target_labels: config.labels.clone(),
            filters: config.compile_filters()?,
            broker_stats: BrokerStatsCollector::new(Arc::clone(&admin)),
            topic_stats: TopicStatsCollector::new(Arc::clone(&admin)),
            consumer_offsets: ConsumerOffsetCollector::new(Arc::clone(&admin), puller),
            admin,
            registry,
            poll_interval: exporter_config.poll_interval,
            max_backoff: Duration::from_secs(300),
            collection_timeout,
            max_concurrent_topics: exporter_config.max_concurrent_topics,
            metric_channel_capacity: exporter_config.metric_channel_capacity,
        })
    }

    #[instrument(skip(self, shutdown), fields(target = %self.target_name))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting collection loop");

        let mut interval = tokio::time::interval(self.poll_interval);
        let mut consecutive_errors = 0u32;
        let mut current_backoff = Duration::from_secs(1);

        self.registry.set_healthy(true);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Dropping the cycle future on timeout cancels every in-flight call
                    let collection_result = tokio::time::timeout(
                        self.collection_timeout,
                        self.collect_once()
                    ).await;

                    match collection_result {
                        Ok(Ok(())) => {
                            consecutive_errors = 0;
                            current_backoff = Duration::from_secs(1);
                            self.registry.set_healthy(true);
                        }
                        Ok(Err(e)) => {
                            consecutive_errors += 1;
                            error!(
                                error = %e,
                                consecutive_errors = consecutive_errors,
                                "Collection failed"
                            );

                            if consecutive_errors >= 3 {
                                self.registry.set_healthy(false);

                                let backoff = current_backoff.min(self.max_backoff);
                                warn!(
                                    backoff_secs = backoff.as_secs(),
                                    "Applying backoff due to consecutive errors"
                                );

                                tokio::select! {
                                    () = tokio::time::sleep(backoff) => {}
                                    _ = shutdown.recv() => {
                                        info!("Received shutdown signal");
                                        break;
                                    }
                                }
                                current_backoff = (current_backoff * 2).min(self.max_backoff);
                            }
                        }
                        Err(_timeout) => {
                            consecutive_errors += 1;
                            error!(
                                timeout_secs = self.collection_timeout.as_secs(),
                                consecutive_errors = consecutive_errors,
                                "Collection timed out"
                            );

                            if consecutive_errors >= 3 {
                                self.registry.set_healthy(false);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.registry.remove_target(&self.target_name);
        info!("Collection loop stopped");
    }

    #[instrument(skip(self))]
    async fn collect_once(&self) -> Result<()> {
        let start = Instant::now();

        // 1. Fresh routing and the broker -> cluster index
        self.admin.invalidate_routes();
        let cluster_info = self.admin.examine_broker_cluster_info().await?;
        let broker_index = cluster_info.broker_index();
        debug!(brokers = broker_index.len(), "Fetched cluster info");

        // 2. List and filter topics
        let all_topics = self.admin.fetch_all_topic_list().await?;
        let mut topics: Vec<String> = all_topics
            .iter()
            .filter(|t| self.filters.matches_topic(t))
            .cloned()
            .collect();
        topics.sort_unstable();
        debug!(
            total_topics = all_topics.len(),
            filtered_topics = topics.len(),
            "Filtered topics"
        );

        // 3. Run collectors while draining their samples
        let (sink, mut rx) = MetricSink::channel(self.metric_channel_capacity);
        let work = async move {
            let step = Instant::now();
            for broker in cluster_info.brokers() {
                self.broker_stats.collect(broker, &sink).await;
            }
            let brokers_ms = step.elapsed().as_millis();

            let step = Instant::now();
            let topic_count = topics.len();
            let (broker_index, sink) = (&broker_index, &sink);
            futures::stream::iter(topics)
                .map(|topic| async move {
                    self.collect_topic(&topic, broker_index, sink).await;
                })
                .buffer_unordered(self.max_concurrent_topics)
                .collect::<Vec<()>>()
                .await;
            let topics_ms = step.elapsed().as_millis();

            info!(
                broker_stats_ms = %brokers_ms,
                topic_stats_ms = %topics_ms,
                topics = topic_count,
                "Collection cycle step timings"
            );
        };
        let drain = async {
            let mut points: Vec<MetricPoint> = Vec::new();
            while let Some(point) = rx.recv().await {
                points.push(point);
            }
            points
        };
        let ((), mut points) = tokio::join!(work, drain);

        // 4. Publish the cycle
        add_custom_labels(&mut points, &self.target_labels);
        let point_count = points.len();
        self.registry.update(&self.target_name, points);

        #[allow(clippy::cast_possible_truncation)]
        let scrape_duration_ms = start.elapsed().as_millis() as u64;
        self.registry.set_scrape_duration_ms(scrape_duration_ms);

        debug!(
            elapsed_ms = scrape_duration_ms,
            points = point_count,
            "Collection cycle completed, took {} seconds",
            start.elapsed().as_secs_f32()
        );

        Ok(())
    }

    /// Topic stats, then offsets and latency for every group consuming it.
    async fn collect_topic(&self, topic: &str, broker_index: &BrokerIndex, sink: &MetricSink) {
        // A retry topic belongs to exactly the group named in its suffix.
        let groups = if let Some(group) = topic.strip_prefix(RETRY_GROUP_TOPIC_PREFIX) {
            vec![group.to_string()]
        } else {
            match self.topic_stats.collect(topic, sink).await {
                Some(groups) => groups,
                None => return,
            }
        };

        for group in groups.iter().filter(|g| self.filters.matches_group(g)) {
            let connection = match self.admin.examine_consumer_connection(group).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(
                        topic = topic,
                        group = group,
                        error = %e,
                        "Fetching consumer connections failed, assuming none online"
                    );
                    None
                }
            };

            self.consumer_offsets
                .collect(topic, group, connection.as_ref(), broker_index, sink)
                .await;
        }
    }
}

/// Collection timeout should be less than `poll_interval` to avoid overlap,
/// but must exceed `request_timeout` so individual calls can finish.
fn collection_timeout(poll_interval: Duration, request_timeout: Duration) -> Duration {
    let min_viable = request_timeout + Duration::from_secs(5);
    if poll_interval > Duration::from_secs(10) {
        poll_interval
            .saturating_sub(Duration::from_secs(5))
            .max(min_viable)
    } else {
        DEFAULT_COLLECTION_TIMEOUT
            .min(poll_interval)
            .max(min_viable)
    }
}

impl std::fmt::Debug for TargetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetManager")
            .field("target_name", &self.target_name)
            .field("poll_interval", &self.poll_interval)
            .field("collection_timeout", &self.collection_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::stats_query::{BROKER_PUT_NUMS, TOPIC_PUT_NUMS};
    use crate::collector::testing::{MockAdmin, MockPuller, Scripted, broker, stats};
    use crate::rocketmq::model::{ClusterInfo, ConsumeStats, MessageQueue, OffsetPair};

    const ADDR: &str = "10.0.0.1:10911";

    fn target_config() -> TargetConfig {
        TargetConfig {
            name: "prod".to_string(),
            namesrv_addr: "127.0.0.1:9876".to_string(),
            request_timeout: Duration::from_secs(3),
            probe_group: "probe".to_string(),
            group_whitelist: vec![".*".to_string()],
            group_blacklist: vec!["^ignored$".to_string()],
            topic_whitelist: vec![".*".to_string()],
            topic_blacklist: vec!["^excluded$".to_string()],
            labels: HashMap::from([("env".to_string(), "test".to_string())]),
        }
    }

    fn exporter_config(poll_interval: Duration) -> ExporterConfig {
        ExporterConfig {
            poll_interval,
            http_port: 0,
            http_host: "127.0.0.1".to_string(),
            max_concurrent_topics: 4,
            metric_channel_capacity: 8,
        }
    }

    fn cluster_info() -> ClusterInfo {
        let mut info = ClusterInfo::default();
        info.broker_addr_table.insert(
            "broker-a".to_string(),
            broker("DefaultCluster", "broker-a", Some(ADDR)),
        );
        info.cluster_addr_table
            .insert("DefaultCluster".to_string(), vec!["broker-a".to_string()]);
        info
    }

    fn offsets(topic: &str, consumer: i64, broker: i64) -> ConsumeStats {
        ConsumeStats {
            offset_table: HashMap::from([(
                MessageQueue::new(topic, "broker-a", 0),
                OffsetPair::new(consumer, broker),
            )]),
            consume_tps: 0.0,
        }
    }

    fn scripted_admin() -> MockAdmin {
        let mut admin = MockAdmin::default()
            .with_route("orders", vec![broker("DefaultCluster", "broker-a", Some(ADDR))])
            .with_consumers("orders", &["billing", "ignored"])
            .with_stats(BROKER_PUT_NUMS, "DefaultCluster", ADDR, stats(600, 10.0))
            .with_stats(TOPIC_PUT_NUMS, "orders", ADDR, stats(60, 1.0))
            .with_consume_stats("billing", "orders", offsets("orders", 5, 8))
            .with_consume_stats("billing", "%RETRY%billing", offsets("%RETRY%billing", 1, 3))
            .with_consume_stats("ignored", "orders", offsets("orders", 0, 100));
        admin.cluster_info = Some(cluster_info());
        admin.topics = Some(vec![
            "orders".to_string(),
            "%RETRY%billing".to_string(),
            "%DLQ%billing".to_string(),
            "excluded".to_string(),
        ]);
        admin.connections.insert("billing".to_string(), None);
        admin
    }

    fn manager(admin: MockAdmin, registry: Arc<MetricsRegistry>) -> TargetManager {
        let puller = MockPuller::default()
            .on(
                &MessageQueue::new("orders", "broker-a", 0),
                5,
                Scripted::Status(crate::rocketmq::model::PullStatus::NoNewMessage),
            );
        TargetManager::with_clients(
            &target_config(),
            Arc::new(admin),
            Arc::new(puller),
            registry,
            &exporter_config(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_collect_once_publishes_cycle() {
        let registry = Arc::new(MetricsRegistry::new());
        let manager = manager(scripted_admin(), Arc::clone(&registry));

        manager.collect_once().await.unwrap();

        assert_eq!(registry.target_count(), 1);
        let output = registry.render_prometheus();
        assert!(output.contains("rocketmq_broker_tps{"));
        assert!(output.contains("rocketmq_producer_tps{"));
        assert!(output.contains(
            r#"rocketmq_group_diff{count_of_online_consumers="0",env="test",group="billing",msg_model="CLUSTERING",topic="orders"} 3"#
        ));
        assert!(output.contains(
            r#"rocketmq_group_retrydiff{count_of_online_consumers="0",env="test",group="billing",msg_model="CLUSTERING",topic="%RETRY%billing"} 2"#
        ));
        assert!(output.contains(r#"target="prod""#));
        // Filtered group and topics never show up.
        assert!(!output.contains(r#"group="ignored""#));
        assert!(!output.contains("excluded"));
        assert!(!output.contains("%DLQ%"));
    }

    #[tokio::test]
    async fn test_collect_once_fans_out_on_spawned_task() {
        let registry = Arc::new(MetricsRegistry::new());
        let manager = Arc::new(manager(scripted_admin(), Arc::clone(&registry)));

        let cycle = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.collect_once().await }
        });
        cycle.await.unwrap().unwrap();

        let output = registry.render_prometheus();
        assert!(output.contains(r#"rocketmq_group_diff{count_of_online_consumers="0",env="test",group="billing""#));
        assert!(output.contains(r#"topic="%RETRY%billing""#));
    }

    #[tokio::test]
    async fn test_cluster_info_failure_fails_cycle() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut admin = scripted_admin();
        admin.cluster_info = None;
        let manager = manager(admin, Arc::clone(&registry));

        assert!(manager.collect_once().await.is_err());
        assert_eq!(registry.target_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_list_failure_fails_cycle() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut admin = scripted_admin();
        admin.topics = None;
        let manager = manager(admin, Arc::clone(&registry));

        assert!(manager.collect_once().await.is_err());
        assert_eq!(registry.target_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_and_removes_target_on_shutdown() {
        let registry = Arc::new(MetricsRegistry::new());
        let manager = manager(scripted_admin(), Arc::clone(&registry));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(manager.run(shutdown_rx));
        for _ in 0..100 {
            if registry.target_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.target_count(), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.target_count(), 0);
    }

    #[test]
    fn test_collection_timeout_bounds() {
        assert_eq!(
            collection_timeout(Duration::from_secs(30), Duration::from_secs(3)),
            Duration::from_secs(25)
        );
        assert_eq!(
            collection_timeout(Duration::from_secs(12), Duration::from_secs(10)),
            Duration::from_secs(15)
        );
        assert_eq!(
            collection_timeout(Duration::from_secs(5), Duration::from_secs(1)),
            Duration::from_secs(6)
        );
    }
}
