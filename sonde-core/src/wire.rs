//! JSON frames exchanged over the gateway socket.
//!
//! Every frame is a two-element array `["<event>", <payload>]`. Devices and
//! dashboards share one inbound event set; the gateway pushes its own set
//! back. Event names are fixed by the device firmware and must not change.

use serde_json::{json, Value};
use thiserror::Error;

use crate::{NodeId, NodeInfo, Reading};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a [\"<event>\", payload] array")]
    Shape,

    #[error("unknown event {0:?}")]
    UnknownEvent(String),

    #[error("event {event:?} carries a malformed payload: {reason}")]
    Payload { event: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyKind {
    Node,
    Client,
}

/// Parsed `identify` payload. `node_id` accepts either the `nodeId` or the
/// `deviceId` field, whichever the firmware sends.
#[derive(Debug, Clone)]
pub struct IdentifyFrame {
    pub kind: IdentifyKind,
    pub node_id: Option<String>,
    pub metadata: Value,
}

/// Inbound events, device or dashboard.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Identify(IdentifyFrame),
    /// Firmware reading push. The payload has already been string-decoded
    /// where necessary and is guaranteed to be a JSON object.
    Save(Value),
    /// Legacy single reading.
    Data(Value),
    /// Legacy batched readings, applied in order.
    BulkData(Vec<Value>),
    Subscribe(String),
    Unsubscribe(String),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Identify(_) => "identify",
            ClientEvent::Save(_) => "/save",
            ClientEvent::Data(_) => "data",
            ClientEvent::BulkData(_) => "bulk:data",
            ClientEvent::Subscribe(_) => "subscribe",
            ClientEvent::Unsubscribe(_) => "unsubscribe",
        }
    }

    pub fn parse(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(items) = value else {
            return Err(WireError::Shape);
        };
        let mut items = items.into_iter();
        let Some(Value::String(event)) = items.next() else {
            return Err(WireError::Shape);
        };
        let payload = items.next().unwrap_or(Value::Null);

        match event.as_str() {
            "identify" => Ok(ClientEvent::Identify(parse_identify(payload)?)),
            "/save" => Ok(ClientEvent::Save(decode_save_payload(payload)?)),
            "data" => Ok(ClientEvent::Data(payload)),
            "bulk:data" => match payload {
                Value::Array(items) => Ok(ClientEvent::BulkData(items)),
                _ => Err(WireError::Payload {
                    event: "bulk:data",
                    reason: "expected an array of readings".to_owned(),
                }),
            },
            "subscribe" => Ok(ClientEvent::Subscribe(node_id_arg("subscribe", payload)?)),
            "unsubscribe" => Ok(ClientEvent::Unsubscribe(node_id_arg(
                "unsubscribe",
                payload,
            )?)),
            other => Err(WireError::UnknownEvent(other.to_owned())),
        }
    }
}

fn parse_identify(payload: Value) -> Result<IdentifyFrame, WireError> {
    let Value::Object(mut fields) = payload else {
        return Err(WireError::Payload {
            event: "identify",
            reason: "expected an object".to_owned(),
        });
    };

    let kind = match fields.get("type").and_then(Value::as_str) {
        Some("node") => IdentifyKind::Node,
        Some("client") => IdentifyKind::Client,
        other => {
            return Err(WireError::Payload {
                event: "identify",
                reason: format!("unsupported type {other:?}"),
            });
        }
    };

    let node_id = fields
        .get("nodeId")
        .or_else(|| fields.get("deviceId"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let metadata = fields.remove("metadata").unwrap_or(Value::Null);

    Ok(IdentifyFrame {
        kind,
        node_id,
        metadata,
    })
}

/// Some firmware revisions serialize the `/save` body twice; a string
/// payload is decoded once more before use.
fn decode_save_payload(payload: Value) -> Result<Value, WireError> {
    let payload = match payload {
        Value::String(inner) => {
            serde_json::from_str(&inner).map_err(|e| WireError::Payload {
                event: "/save",
                reason: format!("string payload is not valid JSON: {e}"),
            })?
        }
        other => other,
    };

    if payload.is_object() {
        Ok(payload)
    } else {
        Err(WireError::Payload {
            event: "/save",
            reason: "expected an object".to_owned(),
        })
    }
}

fn node_id_arg(event: &'static str, payload: Value) -> Result<String, WireError> {
    match payload {
        Value::String(id) => Ok(id),
        Value::Object(fields) => fields
            .get("nodeId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(WireError::Payload {
                event,
                reason: "missing nodeId".to_owned(),
            }),
        _ => Err(WireError::Payload {
            event,
            reason: "expected a node id".to_owned(),
        }),
    }
}

/// Outbound events, rendered to the shared frame shape.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    NodeConnected { node_id: NodeId, metadata: Value },
    NodeDisconnected { node_id: NodeId },
    NodesList(Vec<NodeInfo>),
    /// Live fan-out of an accepted reading, emitted before ingestion and
    /// therefore without a sequence number.
    DataLive(Reading),
    /// A control command forwarded to one device.
    Command { event: &'static str, data: Value },
}

impl ServerEvent {
    pub fn event_name(&self) -> &str {
        match self {
            ServerEvent::NodeConnected { .. } => "node:connected",
            ServerEvent::NodeDisconnected { .. } => "node:disconnected",
            ServerEvent::NodesList(_) => "nodes:list",
            ServerEvent::DataLive(_) => "data:live",
            ServerEvent::Command { event, .. } => event,
        }
    }

    pub fn to_frame(&self) -> String {
        let payload = match self {
            ServerEvent::NodeConnected { node_id, metadata } => {
                json!({"nodeId": node_id, "metadata": metadata})
            }
            ServerEvent::NodeDisconnected { node_id } => json!({"nodeId": node_id}),
            ServerEvent::NodesList(nodes) => {
                serde_json::to_value(nodes).unwrap_or(Value::Null)
            }
            ServerEvent::DataLive(reading) => {
                serde_json::to_value(reading).unwrap_or(Value::Null)
            }
            ServerEvent::Command { data, .. } => data.clone(),
        };
        json!([self.event_name(), payload]).to_string()
    }
}
