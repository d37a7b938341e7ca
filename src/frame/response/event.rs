use std::net::SocketAddr;

use crate::frame::frame_errors::ParseError;
use crate::frame::types;

/// An event pushed by the server on the control connection.
#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: String = types::read_string(buf)?.to_string();
        match event_type.as_str() {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(
                buf,
            )?)),
            "STATUS_CHANGE" => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Unknown event type: {}",
                event_type
            ))),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change: String = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Unknown topology change type: {}",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change: String = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Unknown status change type: {}",
                type_of_change
            ))),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change_string = types::read_string(buf)?.to_string();
        let type_of_change = match type_of_change_string.as_str() {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf)?.to_string();
        let keyspace_affected = types::read_string(buf)?.to_string();

        match target.as_str() {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => {
                let table_name = types::read_string(buf)?.to_string();
                Ok(Self::TableChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    object_name: table_name,
                })
            }
            "TYPE" => {
                let changed_type = types::read_string(buf)?.to_string();
                Ok(Self::TypeChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    type_name: changed_type,
                })
            }
            "FUNCTION" => {
                let function = types::read_string(buf)?.to_string();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::FunctionChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    function_name: function,
                    arguments,
                })
            }
            "AGGREGATE" => {
                let name = types::read_string(buf)?.to_string();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::AggregateChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    aggregate_name: name,
                    arguments,
                })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid schema change target: {}",
                target
            ))),
        }
    }

    /// Name of the keyspace this change applies to.
    pub fn keyspace_name(&self) -> &str {
        match self {
            SchemaChangeEvent::KeyspaceChange { keyspace_name, .. }
            | SchemaChangeEvent::TableChange { keyspace_name, .. }
            | SchemaChangeEvent::TypeChange { keyspace_name, .. }
            | SchemaChangeEvent::FunctionChange { keyspace_name, .. }
            | SchemaChangeEvent::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }
}
