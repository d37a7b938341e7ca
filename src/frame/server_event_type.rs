use std::fmt;
use std::str::FromStr;

use crate::frame::frame_errors::ParseError;

/// A server event category the driver can subscribe to with REGISTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            _ => Err(ParseError::BadIncomingData(format!(
                "invalid event type: {}",
                s
            ))),
        }
    }
}
