use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{require, Subject};
use crate::{error::ValidationError, temporal::Timestamp};

/// A raw business event. Carries no usage semantics until it is metered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEventPayload")]
pub struct EventPayload {
    pub id: String,
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
    #[serde(rename = "universeID")]
    pub universe_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject: Subject,
    /// Business time of the event.
    pub time: Timestamp,
    pub properties: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawEventPayload {
    id: String,
    #[serde(rename = "workspaceID")]
    workspace_id: String,
    #[serde(rename = "universeID")]
    universe_id: String,
    #[serde(rename = "type")]
    event_type: String,
    subject: Subject,
    time: Timestamp,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl TryFrom<RawEventPayload> for EventPayload {
    type Error = ValidationError;

    fn try_from(raw: RawEventPayload) -> Result<Self, Self::Error> {
        EventPayload::new(
            raw.id,
            raw.workspace_id,
            raw.universe_id,
            raw.event_type,
            raw.subject,
            raw.time,
            raw.properties,
        )
    }
}

impl EventPayload {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        universe_id: impl Into<String>,
        event_type: impl Into<String>,
        subject: Subject,
        time: Timestamp,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            id: require("id", id.into())?,
            workspace_id: require("workspaceID", workspace_id.into())?,
            universe_id: require("universeID", universe_id.into())?,
            event_type: require("type", event_type.into())?,
            subject,
            time,
            properties,
        })
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
