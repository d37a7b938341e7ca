use bytes::Bytes;

use crate::frame::frame_errors::ParseError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

pub struct Execute<'a> {
    pub id: &'a Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(self.id, buf)?;
        self.parameters.serialize(buf)
    }
}
