use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::server_event_type::EventType;
use crate::frame::types;

pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.to_string())
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_serialization() {
        let request = Register {
            event_types_to_register_for: vec![EventType::TopologyChange, EventType::StatusChange],
        };

        let data = request.to_bytes().unwrap();
        let expected = vec![
            0x00, 0x02, // 2 strings
            0x00, 0x0F, b'T', b'O', b'P', b'O', b'L', b'O', b'G', b'Y', b'_', b'C', b'H', b'A',
            b'N', b'G', b'E', // TOPOLOGY_CHANGE
            0x00, 0x0D, b'S', b'T', b'A', b'T', b'U', b'S', b'_', b'C', b'H', b'A', b'N', b'G',
            b'E', // STATUS_CHANGE
        ];
        assert_eq!(data, expected);
    }
}
