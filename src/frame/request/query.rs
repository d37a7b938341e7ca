use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::frame::value::SerializedValues;

// Query parameter flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;

pub struct Query<'a> {
    pub contents: &'a str,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(self.contents, buf)?;
        self.parameters.serialize(buf)
    }
}

pub struct QueryParameters<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub skip_metadata: bool,
    pub values: &'a SerializedValues,
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }
        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }
        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }
        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_serialization() {
        let values = SerializedValues::new();
        let query = Query {
            contents: "SELECT key FROM system.local",
            parameters: QueryParameters {
                consistency: Consistency::One,
                serial_consistency: None,
                page_size: None,
                paging_state: None,
                skip_metadata: false,
                values: &values,
            },
        };

        let mut buf = Vec::new();
        query.serialize(&mut buf).unwrap();

        let mut expected = Vec::new();
        types::write_long_string("SELECT key FROM system.local", &mut expected).unwrap();
        expected.extend_from_slice(&[0x00, 0x01, 0x00]); // consistency ONE, no flags
        assert_eq!(buf, expected);
    }

    #[test]
    fn query_parameter_flags() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&[0x01])).unwrap();

        let parameters = QueryParameters {
            consistency: Consistency::Quorum,
            serial_consistency: Some(SerialConsistency::LocalSerial),
            page_size: Some(250),
            paging_state: Some(Bytes::from_static(b"page")),
            skip_metadata: true,
            values: &values,
        };

        let mut buf = Vec::new();
        parameters.serialize(&mut buf).unwrap();

        // consistency
        assert_eq!(&buf[0..2], &[0x00, 0x04]);
        // all five flags set
        assert_eq!(buf[2], 0x1F);
    }
}
