//! Latency probe consumer.
//!
//! Issues one-shot pull requests that never commit offsets and never park on
//! the broker, so probing leaves consumer groups untouched.

use crate::error::{ExporterError, Result};
use crate::rocketmq::PullApi;
use crate::rocketmq::client::RocketmqClient;
use crate::rocketmq::model::{MessageExt, MessageQueue, PullResult, PullStatus};
use crate::rocketmq::remoting::{RemotingCommand, request_code, response_code};
use std::sync::Arc;
use tracing::{trace, warn};

const FLAG_SUBSCRIPTION: i32 = 0x4;
const BORN_HOST_V6_FLAG: i32 = 0x1 << 4;

// Offsets into a stored message record.
const POS_SYS_FLAG: usize = 36;
const POS_BORN_HOST: usize = 48;
const BORN_HOST_V4_LEN: usize = 8;
const BORN_HOST_V6_LEN: usize = 20;

pub struct ProbeConsumer {
    client: Arc<RocketmqClient>,
    group: String,
}

impl ProbeConsumer {
    pub fn new(client: Arc<RocketmqClient>, group: impl Into<String>) -> Self {
        Self {
            client,
            group: group.into(),
        }
    }

    fn pull_request(&self, queue: &MessageQueue, offset: i64, max_nums: i32) -> RemotingCommand {
        RemotingCommand::request(request_code::PULL_MESSAGE)
            .with_field("consumerGroup", &self.group)
            .with_field("topic", &queue.topic)
            .with_field("queueId", queue.queue_id)
            .with_field("queueOffset", offset)
            .with_field("maxMsgNums", max_nums)
            .with_field("sysFlag", FLAG_SUBSCRIPTION)
            .with_field("commitOffset", 0)
            .with_field("suspendTimeoutMillis", 0)
            .with_field("subscription", "*")
            .with_field("subVersion", 0)
            .with_field("expressionType", "TAG")
    }
}

#[async_trait::async_trait]
impl PullApi for ProbeConsumer {
    async fn pull_from(
        &self,
        queue: &MessageQueue,
        offset: i64,
        max_nums: i32,
    ) -> Result<PullResult> {
        let addr = self
            .client
            .resolve_master(&queue.topic, &queue.broker_name)
            .await?;
        let request = self.pull_request(queue, offset, max_nums);

        let response = match self.client.remoting().invoke(&addr, request).await {
            Ok(response) => response,
            Err(ExporterError::Timeout(reason)) => {
                warn!(queue = %queue, offset = offset, reason = %reason, "Pull timed out");
                return Ok(PullResult::with_status(PullStatus::BrokerTimeout));
            }
            Err(e) => return Err(e),
        };

        let status = match response.code {
            response_code::SUCCESS => PullStatus::Found,
            response_code::PULL_NOT_FOUND => PullStatus::NoNewMessage,
            response_code::PULL_RETRY_IMMEDIATELY => PullStatus::NoMatchedMessage,
            response_code::PULL_OFFSET_MOVED => PullStatus::OffsetIllegal,
            _ => return Err(response.into_error()),
        };

        let messages = if status == PullStatus::Found {
            decode_messages(&response.body)?
        } else {
            Vec::new()
        };
        trace!(queue = %queue, offset = offset, status = ?status, messages = messages.len(), "Pulled");

        Ok(PullResult {
            status,
            min_offset: response.ext_i64("minOffset").unwrap_or_default(),
            messages,
        })
    }
}

/// Walk a pull body of back-to-back stored messages, keeping the fields the
/// probe needs.
pub(crate) fn decode_messages(body: &[u8]) -> Result<Vec<MessageExt>> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let record = body.get(pos..).unwrap_or_default();
        let total_size = usize::try_from(read_i32(record, 0)?)
            .map_err(|_| ExporterError::Protocol(format!("negative message size at byte {pos}")))?;
        if total_size == 0 || total_size > record.len() {
            return Err(ExporterError::Protocol(format!(
                "message size {total_size} at byte {pos} exceeds body"
            )));
        }
        let record = &record[..total_size];

        let sys_flag = read_i32(record, POS_SYS_FLAG)?;
        let born_host_len = if sys_flag & BORN_HOST_V6_FLAG == 0 {
            BORN_HOST_V4_LEN
        } else {
            BORN_HOST_V6_LEN
        };

        messages.push(MessageExt {
            store_timestamp: read_i64(record, POS_BORN_HOST + born_host_len)?,
        });
        pos += total_size;
    }

    Ok(messages)
}

fn read_i32(buf: &[u8], at: usize) -> Result<i32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_be_bytes)
        .ok_or_else(|| ExporterError::Protocol(format!("truncated message at byte {at}")))
}

fn read_i64(buf: &[u8], at: usize) -> Result<i64> {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| ExporterError::Protocol(format!("truncated message at byte {at}")))
}

impl std::fmt::Debug for ProbeConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeConsumer")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
