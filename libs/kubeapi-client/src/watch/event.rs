use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::KubeClientError;

/// Kind of change reported by a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change delivered by a [`WatchStream`](crate::WatchStream).
///
/// `Error` carries the server's `Status` instead of a resource and is always
/// the last event of its stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Error(Status),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

impl<K> ChangeEvent<K> {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Added(_) => EventType::Added,
            Self::Modified(_) => EventType::Modified,
            Self::Deleted(_) => EventType::Deleted,
            Self::Error(_) => EventType::Error,
        }
    }

    #[must_use]
    pub fn resource(&self) -> Option<&K> {
        match self {
            Self::Added(r) | Self::Modified(r) | Self::Deleted(r) => Some(r),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn into_resource(self) -> Option<K> {
        match self {
            Self::Added(r) | Self::Modified(r) | Self::Deleted(r) => Some(r),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error_status(&self) -> Option<&Status> {
        match self {
            Self::Error(status) => Some(status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl<K: DeserializeOwned> ChangeEvent<K> {
    /// Decode one `{"type": ..., "object": ...}` line.
    ///
    /// # Errors
    /// Returns `KubeClientError::Protocol` if the line is not a valid
    /// envelope, names an unknown event type, or its object does not decode
    /// as the expected kind.
    pub fn from_line(line: &[u8]) -> Result<Self, KubeClientError> {
        let envelope: Envelope = serde_json::from_slice(line)
            .map_err(|e| KubeClientError::Protocol(format!("malformed watch envelope: {e}")))?;

        let Some(event_type) = EventType::parse(&envelope.event_type) else {
            return Err(KubeClientError::Protocol(format!(
                "unknown watch event type '{}'",
                envelope.event_type
            )));
        };

        let object = envelope.object;
        let decode_err =
            |e: serde_json::Error| KubeClientError::Protocol(format!("invalid {event_type} object: {e}"));

        Ok(match event_type {
            EventType::Added => Self::Added(serde_json::from_value(object).map_err(decode_err)?),
            EventType::Modified => {
                Self::Modified(serde_json::from_value(object).map_err(decode_err)?)
            }
            EventType::Deleted => Self::Deleted(serde_json::from_value(object).map_err(decode_err)?),
            EventType::Error => Self::Error(serde_json::from_value(object).map_err(decode_err)?),
        })
    }
}
