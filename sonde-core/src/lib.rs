use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod wire;

/// Readings buffered per device before the gateway hands them to the queue.
pub const BUFFER_SIZE: usize = 100;

/// Target batch size for a single ingester flush.
pub const BATCH_SIZE: usize = 150;

/// One-shot flush deadline for short queues.
pub const FLUSH_INTERVAL_MS: u64 = 2000;

/// Recheck period inside a drain loop.
pub const INGEST_POLL_MS: u64 = 500;

/// Period of the ingester's queue-key discovery scan.
pub const DISCOVERY_INTERVAL_MS: u64 = 1000;

/// How long a fresh socket may stay unidentified before it is parked.
pub const IDENTIFY_TIMEOUT_MS: u64 = 3000;

/// Lifetime of the per-node metrics hash.
pub const METRICS_TTL_SECS: i64 = 86_400;

/// Default cap on `/api/series` results.
pub const DEFAULT_SERIES_LIMIT: usize = 1000;

pub const QUEUE_PREFIX: &str = "queue:node:";
pub const DEAD_LETTER_PREFIX: &str = "dlq:node:";
pub const METRICS_PREFIX: &str = "metrics:";

/// Wall-clock now in milliseconds, the timestamp every reading is stamped with.
pub fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

/// Stable identity of a sensor node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

/// Which ingress path produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// The `/save` firmware frame.
    #[serde(rename = "esp32")]
    Esp32,
    /// The legacy `data` / `bulk:data` frames.
    #[serde(rename = "socketio")]
    SocketIo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_identified: bool,
}

/// A single measurement in flight: stamped at receipt, not yet sequenced.
///
/// The payload is an open bag of metrics (`min`/`max`/`avg`/`current` in
/// practice, but firmware revisions add fields freely) and is carried
/// opaquely through the queue into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub node_id: NodeId,
    /// Server wall-clock milliseconds at receipt.
    pub ts: i64,
    pub payload: Map<String, Value>,
    pub meta: Meta,
}

/// A persisted reading with its per-node sequence number.
///
/// For every node the set of stored sequences is dense: `{1..=max}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub node_id: NodeId,
    pub seq: u64,
    pub ts: i64,
    pub payload: Map<String, Value>,
    pub meta: Meta,
}

impl Record {
    pub fn from_reading(reading: Reading, seq: u64) -> Self {
        Self {
            node_id: reading.node_id,
            seq,
            ts: reading.ts,
            payload: reading.payload,
            meta: reading.meta,
        }
    }
}

/// Registry snapshot entry for a connected node, served both on the
/// `nodes:list` socket event and on `GET /api/nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub socket_id: String,
    pub connected_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_at: Option<i64>,
    pub metadata: Value,
}

/// Control commands a dashboard can address to a connected node.
///
/// The REST body names the command; the wire event emitted to the device
/// is fixed per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetThreshold,
    Stop,
    Start,
    Reset,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "setThreshold" => Some(Command::SetThreshold),
            "stop" => Some(Command::Stop),
            "start" => Some(Command::Start),
            "reset" => Some(Command::Reset),
            _ => None,
        }
    }

    pub fn wire_event(self) -> &'static str {
        match self {
            Command::SetThreshold => "/threshold/set",
            Command::Stop => "/stop",
            Command::Start => "/start",
            Command::Reset => "/reset",
        }
    }
}
