use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// The record relayed to core for one host event.
///
/// `attributes` carries either the raw actor attributes of the source event
/// or, for enriched container creations, the inspected attribute set.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEventPayload {
    pub event_id: Uuid,
    /// Emission timestamp of the source event in microseconds (UTC).
    pub timestamp: i64,
    /// Event name, e.g. "create" or "die".
    pub event: String,
    /// Kind of resource the event concerns, e.g. "container".
    pub kind: String,
    /// Identifier of the resource.
    pub id: String,
    pub attributes: Map<String, Value>,
}

impl OutboundEventPayload {
    pub fn new(
        timestamp: i64,
        event: String,
        kind: String,
        id: String,
        attributes: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp,
            event,
            kind,
            id,
            attributes,
        }
    }
}
