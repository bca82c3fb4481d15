use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
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

impl SchemaChangeEvent {
    pub fn keyspace_name(&self) -> &str {
        match self {
            Self::KeyspaceChange { keyspace_name, .. }
            | Self::TableChange { keyspace_name, .. }
            | Self::TypeChange { keyspace_name, .. }
            | Self::FunctionChange { keyspace_name, .. }
            | Self::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }

    pub fn change_type(&self) -> SchemaChangeType {
        match self {
            Self::KeyspaceChange { change_type, .. }
            | Self::TableChange { change_type, .. }
            | Self::TypeChange { change_type, .. }
            | Self::FunctionChange { change_type, .. }
            | Self::AggregateChange { change_type, .. } => *change_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl SchemaChangeType {
    fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
            SchemaChangeType::Invalid => "INVALID",
        }
    }
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    /// Writes the body of an EVENT response. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            Event::TopologyChange(change) => {
                types::write_string(&EventType::TopologyChange.to_string(), buf)?;
                let (kind, addr) = match change {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                };
                types::write_string(kind, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(change) => {
                types::write_string(&EventType::StatusChange.to_string(), buf)?;
                let (kind, addr) = match change {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(kind, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(change) => {
                types::write_string(&EventType::SchemaChange.to_string(), buf)?;
                change.serialize(buf)?;
            }
        }
        Ok(())
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = match types::read_string(buf)? {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf)?;
        let keyspace_affected = types::read_string(buf)?.to_string();

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                object_name: types::read_string(buf)?.to_string(),
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                type_name: types::read_string(buf)?.to_string(),
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                function_name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                aggregate_name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            }),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of schema change ({}) in SchemaChangeEvent",
                target
            ))),
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string(self.change_type().as_str(), buf)?;
        match self {
            Self::KeyspaceChange { keyspace_name, .. } => {
                types::write_string("KEYSPACE", buf)?;
                types::write_string(keyspace_name, buf)?;
            }
            Self::TableChange {
                keyspace_name,
                object_name,
                ..
            } => {
                types::write_string("TABLE", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(object_name, buf)?;
            }
            Self::TypeChange {
                keyspace_name,
                type_name,
                ..
            } => {
                types::write_string("TYPE", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(type_name, buf)?;
            }
            Self::FunctionChange {
                keyspace_name,
                function_name,
                arguments,
                ..
            } => {
                types::write_string("FUNCTION", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(function_name, buf)?;
                types::write_string_list(arguments, buf)?;
            }
            Self::AggregateChange {
                keyspace_name,
                aggregate_name,
                arguments,
                ..
            } => {
                types::write_string("AGGREGATE", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(aggregate_name, buf)?;
                types::write_string_list(arguments, buf)?;
            }
        }
        Ok(())
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of change ({}) in TopologyChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of status change ({}) in StatusChangeEvent",
                type_of_change
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse_back() {
        let addr: SocketAddr = "10.0.0.7:9042".parse().unwrap();
        let events = [
            Event::TopologyChange(TopologyChangeEvent::NewNode(addr)),
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(addr)),
            Event::StatusChange(StatusChangeEvent::Down(addr)),
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type: SchemaChangeType::Created,
                keyspace_name: "ks".to_owned(),
                object_name: "t".to_owned(),
            }),
            Event::SchemaChange(SchemaChangeEvent::FunctionChange {
                change_type: SchemaChangeType::Dropped,
                keyspace_name: "ks".to_owned(),
                function_name: "f".to_owned(),
                arguments: vec!["int".to_owned(), "text".to_owned()],
            }),
        ];

        for event in events {
            let mut buf = Vec::new();
            event.serialize(&mut buf).unwrap();
            assert_eq!(Event::deserialize(&mut &buf[..]).unwrap(), event);
        }
    }

    #[test]
    fn unknown_status_change_is_an_error() {
        let mut buf = Vec::new();
        types::write_string("STATUS_CHANGE", &mut buf).unwrap();
        types::write_string("SIDEWAYS", &mut buf).unwrap();
        types::write_inet("127.0.0.1:9042".parse().unwrap(), &mut buf);
        assert!(Event::deserialize(&mut &buf[..]).is_err());
    }
}
