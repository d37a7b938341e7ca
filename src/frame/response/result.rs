use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use uuid::Uuid;

use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct RowsMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One row of a result, column payloads left raw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

impl Row {
    pub fn column(&self, idx: usize) -> Option<&Bytes> {
        self.columns.get(idx).and_then(|c| c.as_ref())
    }
}

#[derive(Debug, Default)]
pub struct Rows {
    pub metadata: RowsMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Positions of the partition-key columns among bound values,
    /// in partition key order.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: RowsMetadata,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();

    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_count = types::read_short_length(buf)?;
            let mut field_types = Vec::with_capacity(fields_count);
            for _ in 0..fields_count {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short_length(buf)?;
            let mut types_ = Vec::with_capacity(len);
            for _ in 0..len {
                types_.push(deser_type(buf)?);
            }
            Tuple(types_)
        }
        id => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown type id: {}",
                id
            )))
        }
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_rows_metadata(buf: &mut &[u8]) -> std::result::Result<RowsMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let col_count = types::read_int_length(buf)?;

    let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    let col_specs = if flags & FLAG_NO_METADATA == 0 {
        let global_table_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
            Some(deser_table_spec(buf)?)
        } else {
            None
        };
        deser_col_specs(buf, &global_table_spec, col_count)?
    } else {
        vec![]
    };

    Ok(RowsMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_rows(buf: &mut &[u8]) -> std::result::Result<Rows, ParseError> {
    let metadata = deser_rows_metadata(buf)?;

    let rows_count = types::read_int_length(buf)?;
    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            let v = types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice);
            columns.push(v);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> std::result::Result<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let col_count = types::read_int_length(buf)?;
    let pk_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for _ in 0..pk_count {
        pk_indexes.push(types::read_short(buf)?);
    }

    let global_table_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_prepared(buf: &mut &[u8]) -> std::result::Result<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_prepared_metadata(buf)?;
    let result_metadata = deser_rows_metadata(buf)?;

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

pub fn deserialize(buf: &mut &[u8]) -> std::result::Result<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(self::SetKeyspace {
            keyspace_name: types::read_string(buf)?.to_owned(),
        }),
        0x0004 => Prepared(deser_prepared(buf)?),
        0x0005 => SchemaChange(self::SchemaChange {
            event: SchemaChangeEvent::deserialize(buf)?,
        }),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                k
            )))
        }
    })
}

// Decoders for the few raw cell types the driver itself reads out of the
// system tables. Full value marshalling is not this crate's business.

pub(crate) fn decode_text(raw: &[u8]) -> std::result::Result<String, ParseError> {
    String::from_utf8(raw.to_vec())
        .map_err(|err| ParseError::BadIncomingData(format!("invalid utf8 cell: {}", err)))
}

pub(crate) fn decode_uuid(raw: &[u8]) -> std::result::Result<Uuid, ParseError> {
    Uuid::from_slice(raw)
        .map_err(|err| ParseError::BadIncomingData(format!("invalid uuid cell: {}", err)))
}

pub(crate) fn decode_ip_addr(raw: &[u8]) -> std::result::Result<IpAddr, ParseError> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().unwrap();
            Ok(IpAddr::from(octets))
        }
        len => Err(ParseError::BadIncomingData(format!(
            "invalid inet cell length: {}",
            len
        ))),
    }
}

pub(crate) fn decode_text_list(raw: &[u8]) -> std::result::Result<Vec<String>, ParseError> {
    let buf = &mut &*raw;
    let count = types::read_int_length(buf)?;
    let mut result = Vec::with_capacity(count);
    for _ in 0..count {
        let elem = types::read_bytes(buf)?;
        result.push(decode_text(elem)?);
    }
    Ok(result)
}

pub(crate) fn decode_text_map(
    raw: &[u8],
) -> std::result::Result<HashMap<String, String>, ParseError> {
    let buf = &mut &*raw;
    let count = types::read_int_length(buf)?;
    let mut result = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = decode_text(types::read_bytes(buf)?)?;
        let val = decode_text(types::read_bytes(buf)?)?;
        result.insert(key, val);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn sample_rows_body(has_more_pages: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut flags = FLAG_GLOBAL_TABLES_SPEC;
        if has_more_pages {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, &mut buf);
        types::write_int(2, &mut buf); // col count
        if has_more_pages {
            types::write_bytes(b"next-page", &mut buf).unwrap();
        }
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("t", &mut buf).unwrap();
        types::write_string("pk", &mut buf).unwrap();
        types::write_short(0x0002, &mut buf); // bigint
        types::write_string("v", &mut buf).unwrap();
        types::write_short(0x000D, &mut buf); // text
        types::write_int(2, &mut buf); // rows count
        for row in [["a", "b"], ["c", "d"]] {
            for cell in row {
                types::write_bytes(cell.as_bytes(), &mut buf).unwrap();
            }
        }
        buf
    }

    #[test]
    fn rows_parse() {
        let buf = sample_rows_body(false);
        let rows = match deser_rows(&mut &buf[..]) {
            Ok(rows) => rows,
            Err(err) => panic!("parse failed: {}", err),
        };

        assert_eq!(rows.metadata.col_count, 2);
        assert_eq!(rows.metadata.paging_state, None);
        assert_eq!(rows.metadata.col_specs.len(), 2);
        assert_eq!(rows.metadata.col_specs[0].name, "pk");
        assert_eq!(rows.metadata.col_specs[0].typ, ColumnType::BigInt);
        assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "ks");
        assert_eq!(rows.rows_count, 2);
        assert_eq!(
            rows.rows[0].column(0).unwrap(),
            &Bytes::from_static(b"a")
        );
        assert_eq!(
            rows.rows[1].column(1).unwrap(),
            &Bytes::from_static(b"d")
        );
    }

    #[test]
    fn rows_parse_with_paging_state() {
        let buf = sample_rows_body(true);
        let rows = deser_rows(&mut &buf[..]).unwrap();
        assert_eq!(
            rows.metadata.paging_state,
            Some(Bytes::from_static(b"next-page"))
        );
    }

    #[test]
    fn prepared_parse() {
        let mut buf = Vec::new();
        types::write_short_bytes(b"prep-id", &mut buf).unwrap();
        // prepared metadata
        types::write_int(FLAG_GLOBAL_TABLES_SPEC, &mut buf);
        types::write_int(2, &mut buf); // col count
        types::write_int(1, &mut buf); // pk count
        types::write_short(0, &mut buf); // pk index
        types::write_string("k1", &mut buf).unwrap();
        types::write_string("t", &mut buf).unwrap();
        types::write_string("pk", &mut buf).unwrap();
        types::write_short(0x0002, &mut buf);
        types::write_string("v", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf);
        // result metadata: NO_METADATA unset, zero columns
        types::write_int(0, &mut buf);
        types::write_int(0, &mut buf);

        let prepared = deser_prepared(&mut &buf[..]).unwrap();
        assert_eq!(prepared.id, Bytes::from_static(b"prep-id"));
        assert_eq!(prepared.prepared_metadata.col_count, 2);
        assert_eq!(prepared.prepared_metadata.pk_indexes, vec![0]);
        assert_eq!(
            prepared.prepared_metadata.col_specs[0].table_spec.ks_name,
            "k1"
        );
    }

    #[test]
    fn nested_type_parse() {
        let mut buf = Vec::new();
        types::write_short(0x0021, &mut buf); // map
        types::write_short(0x000D, &mut buf); // text
        types::write_short(0x0022, &mut buf); // set
        types::write_short(0x0009, &mut buf); // int

        let typ = deser_type(&mut &buf[..]).unwrap();
        assert_eq!(
            typ,
            ColumnType::Map(
                Box::new(ColumnType::Text),
                Box::new(ColumnType::Set(Box::new(ColumnType::Int)))
            )
        );
    }

    #[test]
    fn cell_decoders() {
        assert_eq!(decode_text(b"local").unwrap(), "local");
        assert!(decode_uuid(&[0; 15]).is_err());

        let mut list = Vec::new();
        types::write_int(2, &mut list);
        types::write_bytes(b"-9223372036854775808", &mut list).unwrap();
        types::write_bytes(b"42", &mut list).unwrap();
        assert_eq!(
            decode_text_list(&list).unwrap(),
            vec!["-9223372036854775808".to_string(), "42".to_string()]
        );

        let mut map = Vec::new();
        types::write_int(1, &mut map);
        types::write_bytes(b"class", &mut map).unwrap();
        types::write_bytes(b"SimpleStrategy", &mut map).unwrap();
        let decoded = decode_text_map(&map).unwrap();
        assert_eq!(decoded.get("class").unwrap(), "SimpleStrategy");

        let mut buf = Vec::new();
        buf.put_slice(&[192, 168, 0, 1]);
        assert_eq!(
            decode_ip_addr(&buf).unwrap(),
            "192.168.0.1".parse::<IpAddr>().unwrap()
        );
    }
}
