use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::StatementConfig;
use crate::frame::response::result::{PreparedMetadata, RowsMetadata};
use crate::frame::types::{Consistency, SerialConsistency};
use crate::frame::value::SerializedValues;
use crate::routing::{murmur3_token, Token};

/// A statement registered on the server, identified by an opaque id.
///
/// Carries the bound-value metadata the server handed out at prepare time,
/// including the positions of partition-key columns, which make the
/// statement routable to the right node and shard.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    metadata: PreparedMetadata,
    result_metadata: RowsMetadata,
    statement: String,
    pub config: StatementConfig,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionKeyError {
    #[error("No value bound for partition key column at index {0}")]
    NoPkIndexValue(u16),
    #[error("Value bound for partition key column at index {0} is null or unset")]
    NullPkValue(u16),
    #[error("Value bound for partition key column at index {0} is too long: {1} bytes")]
    ValueTooLong(u16, usize),
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        metadata: PreparedMetadata,
        result_metadata: RowsMetadata,
        statement: String,
        config: StatementConfig,
    ) -> Self {
        Self {
            id,
            metadata,
            result_metadata,
            statement,
            config,
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    /// Keyspace the statement operates on, as reported by prepared metadata.
    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.ks_name.as_str())
    }

    /// Bound-value metadata the server handed out at prepare time.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    /// Column specifications of the statement's result rows.
    pub fn get_result_metadata(&self) -> &RowsMetadata {
        &self.result_metadata
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.config.page_size = Some(page_size);
    }

    pub fn get_page_size(&self) -> Option<i32> {
        self.config.page_size
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.config.consistency = Some(consistency);
    }

    pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
        self.config.serial_consistency = serial_consistency;
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn is_token_aware(&self) -> bool {
        !self.metadata.pk_indexes.is_empty()
    }

    /// Recomposes the serialized partition key from bound values.
    ///
    /// A single-column key is its raw value; a composite key is the
    /// concatenation of `u16 length | value | 0x00` per component.
    pub fn compute_partition_key(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Bytes>, PartitionKeyError> {
        if self.metadata.pk_indexes.is_empty() {
            return Ok(None);
        }

        let values: Vec<_> = bound_values.iter().collect();

        if self.metadata.pk_indexes.len() == 1 {
            let pk_index = self.metadata.pk_indexes[0];
            let value = values
                .get(pk_index as usize)
                .ok_or(PartitionKeyError::NoPkIndexValue(pk_index))?
                .as_bytes()
                .ok_or(PartitionKeyError::NullPkValue(pk_index))?;
            return Ok(Some(Bytes::copy_from_slice(value)));
        }

        let mut buf = BytesMut::new();
        for pk_index in &self.metadata.pk_indexes {
            let value = values
                .get(*pk_index as usize)
                .ok_or(PartitionKeyError::NoPkIndexValue(*pk_index))?
                .as_bytes()
                .ok_or(PartitionKeyError::NullPkValue(*pk_index))?;
            let len = u16::try_from(value.len())
                .map_err(|_| PartitionKeyError::ValueTooLong(*pk_index, value.len()))?;
            buf.put_u16(len);
            buf.put_slice(value);
            buf.put_u8(0);
        }

        Ok(Some(buf.freeze()))
    }

    /// Token this execution routes by, `None` when the statement has no
    /// partition-key metadata.
    pub fn calculate_token(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Token>, PartitionKeyError> {
        Ok(self
            .compute_partition_key(bound_values)?
            .map(|pk| murmur3_token(&pk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::response::result::{ColumnSpec, ColumnType, TableSpec};

    fn make_prepared(pk_indexes: Vec<u16>, col_count: usize) -> PreparedStatement {
        let col_specs = (0..col_count)
            .map(|i| ColumnSpec {
                table_spec: TableSpec {
                    ks_name: "k1".to_string(),
                    table_name: "t".to_string(),
                },
                name: format!("c{}", i),
                typ: ColumnType::Blob,
            })
            .collect();

        PreparedStatement::new(
            Bytes::from_static(b"id"),
            PreparedMetadata {
                flags: 0,
                col_count,
                pk_indexes,
                col_specs,
            },
            RowsMetadata::default(),
            "INSERT INTO k1.t (a, b, c) VALUES (?, ?, ?)".to_string(),
            Default::default(),
        )
    }

    #[test]
    fn no_pk_metadata_means_not_token_aware() {
        let prepared = make_prepared(vec![], 1);
        assert!(!prepared.is_token_aware());

        let mut values = SerializedValues::new();
        values.add_value(Some(b"x")).unwrap();
        assert_eq!(prepared.compute_partition_key(&values).unwrap(), None);
        assert_eq!(prepared.calculate_token(&values).unwrap(), None);
    }

    #[test]
    fn single_column_partition_key_is_raw_value() {
        let prepared = make_prepared(vec![1], 2);

        let mut values = SerializedValues::new();
        values.add_value(Some(b"ignored")).unwrap();
        values.add_value(Some(b"key-bytes")).unwrap();

        let pk = prepared.compute_partition_key(&values).unwrap().unwrap();
        assert_eq!(pk, Bytes::from_static(b"key-bytes"));
    }

    #[test]
    fn composite_partition_key_layout() {
        let prepared = make_prepared(vec![0, 2], 3);

        let mut values = SerializedValues::new();
        values.add_value(Some(b"ab")).unwrap();
        values.add_value(Some(b"skip")).unwrap();
        values.add_value(Some(b"c")).unwrap();

        let pk = prepared.compute_partition_key(&values).unwrap().unwrap();
        assert_eq!(
            pk,
            Bytes::from_static(&[0, 2, b'a', b'b', 0, 0, 1, b'c', 0])
        );
    }

    #[test]
    fn token_matches_partitioner() {
        let prepared = make_prepared(vec![0], 1);

        let mut values = SerializedValues::new();
        values.add_value(Some(b"test")).unwrap();

        let token = prepared.calculate_token(&values).unwrap().unwrap();
        assert_eq!(token, murmur3_token(b"test"));
        assert_eq!(token.value, -6017608668500074083);
    }

    #[test]
    fn null_pk_value_is_an_error() {
        let prepared = make_prepared(vec![0], 1);

        let mut values = SerializedValues::new();
        values.add_value(None).unwrap();

        assert_eq!(
            prepared.compute_partition_key(&values),
            Err(PartitionKeyError::NullPkValue(0))
        );

        let empty = SerializedValues::new();
        assert_eq!(
            prepared.compute_partition_key(&empty),
            Err(PartitionKeyError::NoPkIndexValue(0))
        );
    }
}
