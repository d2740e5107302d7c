//! RocketMQ remoting protocol: frame codec and a multiplexing transport.
//!
//! Wire format, big-endian:
//! `i32 length | i32 (serialize_type << 24 | header_length) | header | body`
//! where `length` covers everything after itself. Only JSON headers are used.

use crate::error::{ExporterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, instrument, trace};

pub mod request_code {
    pub const PULL_MESSAGE: i32 = 11;
    pub const GET_ROUTEINFO_BY_TOPIC: i32 = 105;
    pub const GET_BROKER_CLUSTER_INFO: i32 = 106;
    pub const GET_CONSUMER_CONNECTION_LIST: i32 = 203;
    pub const GET_ALL_TOPIC_LIST_FROM_NAMESERVER: i32 = 206;
    pub const GET_CONSUME_STATS: i32 = 208;
    pub const QUERY_TOPIC_CONSUME_BY_WHO: i32 = 300;
    pub const VIEW_BROKER_STATS_DATA: i32 = 315;
}

pub mod response_code {
    pub const SUCCESS: i32 = 0;
    #[allow(dead_code)]
    pub const SYSTEM_ERROR: i32 = 1;
    pub const TOPIC_NOT_EXIST: i32 = 17;
    pub const PULL_NOT_FOUND: i32 = 19;
    pub const PULL_RETRY_IMMEDIATELY: i32 = 20;
    pub const PULL_OFFSET_MOVED: i32 = 21;
    pub const CONSUMER_NOT_ONLINE: i32 = 206;
}

const RPC_TYPE_RESPONSE: i32 = 1;
const SERIALIZE_TYPE_JSON: i32 = 0;
const LANGUAGE: &str = "OTHER";
const PROTOCOL_VERSION: i32 = 401;
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RemotingCommand {
    pub code: i32,
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    pub ext_fields: HashMap<String, String>,
    pub body: Bytes,
}

impl RemotingCommand {
    pub fn request(code: i32) -> Self {
        Self {
            code,
            opaque: 0,
            flag: 0,
            remark: None,
            ext_fields: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl ToString) -> Self {
        self.ext_fields.insert(key.to_string(), value.to_string());
        self
    }

    pub const fn is_response(&self) -> bool {
        self.flag & RPC_TYPE_RESPONSE != 0
    }

    pub fn ext_i64(&self, key: &str) -> Option<i64> {
        self.ext_fields.get(key).and_then(|v| v.parse().ok())
    }

    /// Turn a non-success response into an error.
    pub fn into_success(self) -> Result<Self> {
        if self.code == response_code::SUCCESS {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> ExporterError {
        ExporterError::Broker {
            code: self.code,
            remark: self.remark.unwrap_or_default(),
        }
    }
}

#[allow(dead_code)] // language, version and serialize type are only written
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    code: i32,
    #[serde(default)]
    language: String,
    #[serde(default)]
    version: i32,
    opaque: i32,
    #[serde(default)]
    flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    ext_fields: HashMap<String, String>,
    #[serde(default, rename = "serializeTypeCurrentRPC")]
    serialize_type_current_rpc: Option<String>,
}

#[derive(Debug, Default)]
pub struct RemotingCodec;

impl Decoder for RemotingCodec {
    type Item = RemotingCommand;
    type Error = ExporterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(4..=MAX_FRAME_LENGTH).contains(&length) {
            return Err(ExporterError::Protocol(format!(
                "invalid frame length {length}"
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(length);

        let header_word = frame.get_i32();
        let serialize_type = (header_word >> 24) & 0xFF;
        let header_length = (header_word & 0x00FF_FFFF) as usize;
        if serialize_type != SERIALIZE_TYPE_JSON {
            return Err(ExporterError::Protocol(format!(
                "unsupported header serialize type {serialize_type}"
            )));
        }
        if header_length > frame.len() {
            return Err(ExporterError::Protocol(format!(
                "header length {header_length} exceeds frame of {}",
                frame.len() + 4
            )));
        }

        let header_bytes = frame.split_to(header_length);
        let header: Header = serde_json::from_slice(&header_bytes)?;

        Ok(Some(RemotingCommand {
            code: header.code,
            opaque: header.opaque,
            flag: header.flag,
            remark: header.remark,
            ext_fields: header.ext_fields,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<RemotingCommand> for RemotingCodec {
    type Error = ExporterError;

    fn encode(&mut self, item: RemotingCommand, dst: &mut BytesMut) -> Result<()> {
        let header = Header {
            code: item.code,
            language: LANGUAGE.to_string(),
            version: PROTOCOL_VERSION,
            opaque: item.opaque,
            flag: item.flag,
            remark: item.remark,
            ext_fields: item.ext_fields,
            serialize_type_current_rpc: Some("JSON".to_string()),
        };
        let header_bytes = serde_json::to_vec(&header)?;

        let length = 4 + header_bytes.len() + item.body.len();
        if length > MAX_FRAME_LENGTH {
            return Err(ExporterError::Protocol(format!(
                "frame of {length} bytes exceeds limit"
            )));
        }

        dst.reserve(4 + length);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        {
            dst.put_i32(length as i32);
            dst.put_i32((SERIALIZE_TYPE_JSON << 24) | header_bytes.len() as i32);
        }
        dst.extend_from_slice(&header_bytes);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

type FrameSink = SplitSink<Framed<TcpStream, RemotingCodec>, RemotingCommand>;
type FrameStream = SplitStream<Framed<TcpStream, RemotingCodec>>;

/// Callers waiting on a connection, keyed by request opaque.
#[derive(Default)]
struct InFlight {
    pending: DashMap<i32, oneshot::Sender<RemotingCommand>>,
    closed: AtomicBool,
}

/// One multiplexed connection. Writes are serialized; a reader task routes
/// every response to the caller that owns its opaque.
struct Connection {
    writer: Mutex<FrameSink>,
    in_flight: Arc<InFlight>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn open(stream: TcpStream, addr: &str) -> Self {
        let (writer, frames) = Framed::new(stream, RemotingCodec).split();
        let in_flight = Arc::new(InFlight::default());
        let reader = tokio::spawn(route_responses(
            frames,
            Arc::clone(&in_flight),
            addr.to_string(),
        ));

        Self {
            writer: Mutex::new(writer),
            in_flight,
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.in_flight.closed.load(Ordering::SeqCst)
    }

    async fn exchange(
        &self,
        request: RemotingCommand,
        response: oneshot::Receiver<RemotingCommand>,
    ) -> Result<RemotingCommand> {
        // Registered before this check, so a concurrent close either sees the
        // waiter or is seen here.
        if self.is_closed() {
            return Err(ExporterError::Remoting("connection closed by peer".to_string()));
        }
        self.writer.lock().await.send(request).await?;
        response
            .await
            .map_err(|_| ExporterError::Remoting("connection closed by peer".to_string()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_responses(mut frames: FrameStream, in_flight: Arc<InFlight>, addr: String) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(command) if command.is_response() => {
                let waiter = in_flight.pending.remove(&command.opaque);
                match waiter {
                    Some((_, waiter)) => {
                        let _ = waiter.send(command);
                    }
                    None => trace!(
                        opaque = command.opaque,
                        code = command.code,
                        "Discarding response without a waiting caller"
                    ),
                }
            }
            Ok(command) => trace!(code = command.code, "Ignoring broker-initiated request"),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Remoting connection failed");
                break;
            }
        }
    }

    in_flight.closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every remaining waiter with an error.
    in_flight.pending.clear();
    debug!(addr = %addr, "Remoting connection closed");
}

/// Request/response transport with one cached, multiplexed connection per
/// address.
///
/// Concurrent requests share the connection and are matched by opaque. The
/// timeout bounds a single request; on expiry the late response is discarded
/// and the connection stays. A write or read failure drops the connection so
/// the next call reconnects.
pub struct RemotingClient {
    connections: DashMap<String, Arc<Connection>>,
    next_opaque: AtomicI32,
    timeout: Duration,
}

impl RemotingClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            next_opaque: AtomicI32::new(1),
            timeout,
        }
    }

    #[instrument(skip(self, request), fields(code = request.code))]
    pub async fn invoke(&self, addr: &str, mut request: RemotingCommand) -> Result<RemotingCommand> {
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        request.opaque = opaque;
        let connection = self.connection(addr).await?;

        let (waiter, response) = oneshot::channel();
        connection.in_flight.pending.insert(opaque, waiter);

        let outcome =
            tokio::time::timeout(self.timeout, connection.exchange(request, response)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                connection.in_flight.pending.remove(&opaque);
                self.evict(addr, &connection);
                Err(e)
            }
            Err(_) => {
                connection.in_flight.pending.remove(&opaque);
                Err(ExporterError::Timeout(format!(
                    "no response from {addr} within {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn connection(&self, addr: &str) -> Result<Arc<Connection>> {
        if let Some(connection) = self.connections.get(addr)
            && !connection.is_closed()
        {
            return Ok(Arc::clone(connection.value()));
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ExporterError::Timeout(format!("connect to {addr} timed out")))?
            .map_err(|e| ExporterError::Remoting(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(addr = addr, "Opened remoting connection");

        let opened = Arc::new(Connection::open(stream, addr));
        // Another caller may have connected meanwhile; keep whichever is live.
        let mut entry = self
            .connections
            .entry(addr.to_string())
            .or_insert_with(|| Arc::clone(&opened));
        if entry.is_closed() {
            *entry = Arc::clone(&opened);
        }
        Ok(Arc::clone(entry.value()))
    }

    fn evict(&self, addr: &str, connection: &Arc<Connection>) {
        self.connections
            .remove_if(addr, |_, cached| Arc::ptr_eq(cached, connection));
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for RemotingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingClient")
            .field("connections", &self.connections.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
