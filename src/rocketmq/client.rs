use crate::error::{ExporterError, Result};
use crate::rocketmq::model::{
    BrokerStatsData, ClusterInfo, ConsumeStats, ConsumerConnection, MessageQueue, OffsetPair,
    TopicRoute,
};
use crate::rocketmq::remoting::{RemotingClient, RemotingCommand, request_code, response_code};
use crate::rocketmq::{AdminApi, RETRY_GROUP_TOPIC_PREFIX, fastjson};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TopicList {
    topic_list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GroupList {
    group_list: Vec<String>,
}

/// Admin client for one RocketMQ deployment.
///
/// Metadata comes from the name servers; stats and offsets come from the
/// broker masters listed in each topic's route.
pub struct RocketmqClient {
    name: String,
    namesrv_addrs: Vec<String>,
    remoting: Arc<RemotingClient>,
    routes: DashMap<String, TopicRoute>,
}

impl RocketmqClient {
    pub fn new(name: impl Into<String>, namesrv_addrs: Vec<String>, remoting: Arc<RemotingClient>) -> Self {
        Self {
            name: name.into(),
            namesrv_addrs,
            remoting,
            routes: DashMap::new(),
        }
    }

    pub fn remoting(&self) -> &RemotingClient {
        &self.remoting
    }

    #[cfg(test)]
    pub fn cached_route_count(&self) -> usize {
        self.routes.len()
    }

    /// Master address of `broker_name` in the route of `topic`.
    pub async fn resolve_master(&self, topic: &str, broker_name: &str) -> Result<String> {
        let route = self.route(topic).await?;
        route
            .broker(broker_name)
            .and_then(|b| b.master_addr())
            .map(str::to_string)
            .ok_or_else(|| {
                ExporterError::Route(format!("no master for broker {broker_name} of topic {topic}"))
            })
    }

    async fn route(&self, topic: &str) -> Result<TopicRoute> {
        if let Some(route) = self.routes.get(topic) {
            return Ok(route.clone());
        }

        let request =
            RemotingCommand::request(request_code::GET_ROUTEINFO_BY_TOPIC).with_field("topic", topic);
        let response = self.invoke_namesrv(request).await?;
        if response.code == response_code::TOPIC_NOT_EXIST {
            return Err(ExporterError::Route(format!("no route for topic {topic}")));
        }
        let response = response.into_success()?;
        let route: TopicRoute = fastjson::from_slice(&response.body)?;

        self.routes.insert(topic.to_string(), route.clone());
        Ok(route)
    }

    /// Masters of the topic route, ordered by broker name.
    async fn route_masters(&self, topic: &str) -> Result<Vec<String>> {
        let route = self.route(topic).await?;
        let mut brokers: Vec<_> = route.broker_datas.iter().collect();
        brokers.sort_by(|a, b| a.broker_name.cmp(&b.broker_name));

        Ok(brokers
            .into_iter()
            .filter_map(|b| {
                let addr = b.master_addr();
                if addr.is_none() {
                    debug!(topic = topic, broker = b.broker_name, "Broker has no master, skipping");
                }
                addr.map(str::to_string)
            })
            .collect())
    }

    async fn invoke_namesrv(&self, request: RemotingCommand) -> Result<RemotingCommand> {
        let mut last_error = None;
        for addr in &self.namesrv_addrs {
            match self.remoting.invoke(addr, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(namesrv = addr, error = %e, "Name server request failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ExporterError::Remoting("no name server configured".to_string())))
    }
}

#[async_trait::async_trait]
impl AdminApi for RocketmqClient {
    fn invalidate_routes(&self) {
        self.routes.clear();
    }

    async fn query_broker_stats(
        &self,
        stats_name: &str,
        stats_key: &str,
        broker_addr: &str,
    ) -> Result<Option<BrokerStatsData>> {
        let request = RemotingCommand::request(request_code::VIEW_BROKER_STATS_DATA)
            .with_field("statsName", stats_name)
            .with_field("statsKey", stats_key);
        let response = self.remoting.invoke(broker_addr, request).await?.into_success()?;

        if response.body.is_empty() {
            return Ok(None);
        }
        Ok(Some(fastjson::from_slice(&response.body)?))
    }

    #[instrument(skip(self), fields(target = %self.name))]
    async fn examine_consume_stats(&self, group: &str, topic: &str) -> Result<ConsumeStats> {
        let mut stats = ConsumeStats::default();
        for addr in self.route_masters(topic).await? {
            let request = RemotingCommand::request(request_code::GET_CONSUME_STATS)
                .with_field("consumerGroup", group)
                .with_field("topic", topic);
            let response = self.remoting.invoke(&addr, request).await?.into_success()?;
            stats.merge(parse_consume_stats(&response.body)?);
        }
        Ok(stats)
    }

    async fn examine_topic_consume_by_who(&self, topic: &str) -> Result<Vec<String>> {
        let mut groups = BTreeSet::new();
        for addr in self.route_masters(topic).await? {
            let request = RemotingCommand::request(request_code::QUERY_TOPIC_CONSUME_BY_WHO)
                .with_field("topic", topic);
            let response = self.remoting.invoke(&addr, request).await?.into_success()?;
            let list: GroupList = fastjson::from_slice(&response.body)?;
            groups.extend(list.group_list);
        }
        Ok(groups.into_iter().collect())
    }

    async fn examine_topic_route(&self, topic: &str) -> Result<TopicRoute> {
        self.route(topic).await
    }

    #[instrument(skip(self), fields(target = %self.name))]
    async fn examine_broker_cluster_info(&self) -> Result<ClusterInfo> {
        let request = RemotingCommand::request(request_code::GET_BROKER_CLUSTER_INFO);
        let response = self.invoke_namesrv(request).await?.into_success()?;
        fastjson::from_slice(&response.body)
    }

    #[instrument(skip(self), fields(target = %self.name))]
    async fn fetch_all_topic_list(&self) -> Result<Vec<String>> {
        let request = RemotingCommand::request(request_code::GET_ALL_TOPIC_LIST_FROM_NAMESERVER);
        let response = self.invoke_namesrv(request).await?.into_success()?;
        let list: TopicList = fastjson::from_slice(&response.body)?;
        Ok(list.topic_list)
    }

    async fn examine_consumer_connection(
        &self,
        group: &str,
    ) -> Result<Option<ConsumerConnection>> {
        let retry_topic = format!("{RETRY_GROUP_TOPIC_PREFIX}{group}");
        let Some(addr) = self.route_masters(&retry_topic).await?.into_iter().next() else {
            return Err(ExporterError::Route(format!(
                "no broker master serves {retry_topic}"
            )));
        };

        let request = RemotingCommand::request(request_code::GET_CONSUMER_CONNECTION_LIST)
            .with_field("consumerGroup", group);
        let response = self.remoting.invoke(&addr, request).await?;
        if response.code == response_code::CONSUMER_NOT_ONLINE {
            return Ok(None);
        }
        let response = response.into_success()?;
        Ok(Some(fastjson::from_slice(&response.body)?))
    }
}

/// Decode a `GET_CONSUME_STATS` body, whose offset table is keyed by
/// message-queue objects.
pub(crate) fn parse_consume_stats(body: &[u8]) -> Result<ConsumeStats> {
    let value = fastjson::parse(body)?;
    let mut stats = ConsumeStats {
        consume_tps: value.get("consumeTps").and_then(Value::as_f64).unwrap_or(0.0),
        ..ConsumeStats::default()
    };

    if let Some(table) = value.get("offsetTable").and_then(Value::as_object) {
        for (key, offsets) in table {
            let queue: MessageQueue = serde_json::from_str(key)?;
            let pair: OffsetPair = serde_json::from_value(offsets.clone())?;
            stats.offset_table.insert(queue, pair);
        }
    }
    Ok(stats)
}

impl std::fmt::Debug for RocketmqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketmqClient")
            .field("name", &self.name)
            .field("namesrv_addrs", &self.namesrv_addrs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rocketmq::remoting::RemotingCodec;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    /// Serves every request on one socket address, answering by request code.
    /// The route body points brokers back at the same address.
    async fn spawn_fake_cluster() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let broker_addr = addr.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let broker_addr = broker_addr.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, RemotingCodec);
                    while let Some(Ok(request)) = framed.next().await {
                        let (code, body) = answer(&request, &broker_addr);
                        let response = RemotingCommand {
                            code,
                            opaque: request.opaque,
                            flag: 1,
                            remark: None,
                            ext_fields: HashMap::new(),
                            body: Bytes::from(body),
                        };
                        if framed.send(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    fn answer(request: &RemotingCommand, broker_addr: &str) -> (i32, String) {
        let field = |k: &str| request.ext_fields.get(k).cloned().unwrap_or_default();
        match request.code {
            request_code::GET_ALL_TOPIC_LIST_FROM_NAMESERVER => {
                (0, r#"{"topicList":["orders","%RETRY%billing"]}"#.to_string())
            }
            request_code::GET_ROUTEINFO_BY_TOPIC => {
                if field("topic") == "missing" {
                    return (response_code::TOPIC_NOT_EXIST, String::new());
                }
                (
                    0,
                    format!(
                        r#"{{"brokerDatas":[{{"brokerAddrs":{{0:"{broker_addr}"}},"brokerName":"broker-a","cluster":"DefaultCluster"}}],"queueDatas":[{{"brokerName":"broker-a","perm":6,"readQueueNums":2,"writeQueueNums":2}}]}}"#
                    ),
                )
            }
            request_code::GET_BROKER_CLUSTER_INFO => (
                0,
                format!(
                    r#"{{"brokerAddrTable":{{"broker-a":{{"brokerAddrs":{{0:"{broker_addr}"}},"brokerName":"broker-a","cluster":"DefaultCluster"}}}},"clusterAddrTable":{{"DefaultCluster":["broker-a"]}}}}"#
                ),
            ),
            request_code::GET_CONSUME_STATS => (
                0,
                r#"{"consumeTps":1.5,"offsetTable":{{"brokerName":"broker-a","queueId":0,"topic":"orders"}:{"brokerOffset":10,"consumerOffset":10,"lastTimestamp":0},{"brokerName":"broker-a","queueId":1,"topic":"orders"}:{"brokerOffset":8,"consumerOffset":5,"lastTimestamp":0}}}"#
                    .to_string(),
            ),
            request_code::QUERY_TOPIC_CONSUME_BY_WHO => {
                (0, r#"{"groupList":["billing","audit"]}"#.to_string())
            }
            request_code::GET_CONSUMER_CONNECTION_LIST => {
                if field("consumerGroup") == "offline" {
                    return (response_code::CONSUMER_NOT_ONLINE, String::new());
                }
                (
                    0,
                    r#"{"connectionSet":[{"clientAddr":"10.1.0.1:5000","clientId":"c1","language":"JAVA","version":401}],"consumeType":"CONSUME_PASSIVELY","messageModel":"BROADCASTING"}"#
                        .to_string(),
                )
            }
            request_code::VIEW_BROKER_STATS_DATA => {
                if field("statsKey") == "empty" {
                    return (0, String::new());
                }
                (
                    0,
                    r#"{"statsDay":{"avgpt":0.0,"sum":0,"tps":0.0},"statsHour":{"avgpt":0.0,"sum":0,"tps":0.0},"statsMinute":{"avgpt":1.0,"sum":120,"tps":2.0}}"#
                        .to_string(),
                )
            }
            _ => (response_code::SYSTEM_ERROR, String::new()),
        }
    }

    async fn client() -> RocketmqClient {
        let addr = spawn_fake_cluster().await;
        RocketmqClient::new(
            "test",
            vec![addr],
            Arc::new(RemotingClient::new(Duration::from_secs(2))),
        )
    }

    #[test]
    fn test_parse_consume_stats() {
        let stats = parse_consume_stats(
            br#"{"consumeTps":0.5,"offsetTable":{{"brokerName":"b","queueId":3,"topic":"t"}:{"brokerOffset":9,"consumerOffset":4,"lastTimestamp":1700000000000}}}"#,
        )
        .unwrap();
        let pair = stats.offset_table[&MessageQueue::new("t", "b", 3)];
        assert_eq!(pair.diff(), 5);
        assert!((stats.consume_tps - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_fetch_topics_and_cluster_info() {
        let client = client().await;

        let topics = client.fetch_all_topic_list().await.unwrap();
        assert_eq!(topics, vec!["orders".to_string(), "%RETRY%billing".to_string()]);

        let info = client.examine_broker_cluster_info().await.unwrap();
        assert_eq!(info.broker_index().cluster_of("broker-a"), Some("DefaultCluster"));
    }

    #[tokio::test]
    async fn test_consume_stats_from_route_masters() {
        let client = client().await;

        let stats = client.examine_consume_stats("billing", "orders").await.unwrap();
        assert_eq!(stats.offset_table.len(), 2);
        let backlog: i64 = stats.offset_table.values().map(OffsetPair::diff).sum();
        assert_eq!(backlog, 3);
        assert_eq!(client.cached_route_count(), 1);

        client.invalidate_routes();
        assert_eq!(client.cached_route_count(), 0);
    }

    #[tokio::test]
    async fn test_consume_by_who_sorted() {
        let client = client().await;
        let groups = client.examine_topic_consume_by_who("orders").await.unwrap();
        assert_eq!(groups, vec!["audit".to_string(), "billing".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_route_is_error() {
        let client = client().await;
        let result = client.examine_topic_route("missing").await;
        assert!(matches!(result, Err(ExporterError::Route(_))));
    }

    #[tokio::test]
    async fn test_consumer_connection() {
        let client = client().await;

        let connection = client.examine_consumer_connection("billing").await.unwrap().unwrap();
        assert_eq!(connection.connection_set.len(), 1);
        assert_eq!(connection.connection_set[0].client_id, "c1");
        assert_eq!(connection.message_model.as_str(), "BROADCASTING");

        assert!(client.examine_consumer_connection("offline").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broker_stats() {
        let client = client().await;
        let addr = client.resolve_master("orders", "broker-a").await.unwrap();

        let stats = client
            .query_broker_stats("BROKER_PUT_NUMS", "DefaultCluster", &addr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.stats_minute.sum, 120);

        let empty = client
            .query_broker_stats("TOPIC_PUT_NUMS", "empty", &addr)
            .await
            .unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_namesrv_falls_back_to_next_address() {
        let good = spawn_fake_cluster().await;
        // Bound then dropped, so connecting is refused.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let client = RocketmqClient::new(
            "test",
            vec![dead, good],
            Arc::new(RemotingClient::new(Duration::from_secs(2))),
        );
        assert_eq!(client.fetch_all_topic_list().await.unwrap().len(), 2);
    }
}
