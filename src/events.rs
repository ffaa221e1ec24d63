//! # Interaction Events
//! Wire shape of the client-submitted analytics batch.
//!
//! Every enumerated field is a closed Rust enum, so an unknown `eventType` or
//! `placement` fails deserialization instead of slipping through as a string.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    View,
    Interaction,
    Conversion,
}

/// UI location the testimonial was rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Hero,
    Grid,
    Carousel,
    Cta,
    Modal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

impl Placement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hero => "hero",
            Self::Grid => "grid",
            Self::Carousel => "carousel",
            Self::Cta => "cta",
            Self::Modal => "modal",
        }
    }
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    #[serde(alias = "testimonialId")]
    pub entity_id: String,
    pub event_type: EventType,
    pub placement: Placement,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Milliseconds since the UNIX epoch, as reported by the client.
    pub timestamp: u64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Dwell time in milliseconds for `interaction` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsBatch {
    pub events: Vec<InteractionEvent>,
    #[serde(default)]
    pub session: Map<String, Value>,
    #[serde(default)]
    pub client: Map<String, Value>,
}

/// Event after the server has attached what it observed about the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub event: InteractionEvent,
    pub client_ip: String,
    pub user_agent: String,
    /// Server receive time, milliseconds since the UNIX epoch.
    pub received_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_testimonial_id_alias() {
        let ev: InteractionEvent = serde_json::from_value(json!({
            "testimonialId": "t1",
            "eventType": "view",
            "placement": "grid",
            "deviceType": "mobile",
            "timestamp": 1_700_000_000_000u64,
            "sessionId": "s1"
        }))
        .expect("valid event");
        assert_eq!(ev.entity_id, "t1");
        assert_eq!(ev.event_type, EventType::View);
        assert_eq!(ev.device_type, DeviceType::Mobile);
        assert!(ev.metadata.is_empty());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let res: Result<InteractionEvent, _> = serde_json::from_value(json!({
            "entityId": "t1",
            "eventType": "click",
            "placement": "grid",
            "timestamp": 1,
            "sessionId": "s1"
        }));
        assert!(res.is_err());
    }

    #[test]
    fn string_timestamp_is_rejected() {
        let res: Result<InteractionEvent, _> = serde_json::from_value(json!({
            "entityId": "t1",
            "eventType": "view",
            "placement": "hero",
            "timestamp": "yesterday",
            "sessionId": "s1"
        }));
        assert!(res.is_err());
    }
}
