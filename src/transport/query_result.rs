use bytes::Bytes;

use crate::frame::response::result::{ColumnSpec, Row};

/// Result of a single (page of a) query.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Rows returned by the operation; `None` for results of non-row queries
    /// such as INSERT or CREATE TABLE.
    pub rows: Option<Vec<Row>>,
    /// Warnings attached to the response by the server.
    pub warnings: Vec<String>,
    /// Cursor to pass back to fetch the next page, when one exists.
    pub paging_state: Option<Bytes>,
    /// Column specifications of returned rows.
    pub col_specs: Vec<ColumnSpec>,
}

impl QueryResult {
    /// Number of rows, 0 for non-row results.
    pub fn rows_num(&self) -> usize {
        self.rows.as_ref().map(Vec::len).unwrap_or_default()
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.as_ref().and_then(|rows| rows.first())
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state.is_some()
    }
}
