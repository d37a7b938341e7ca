use super::StatementConfig;
use crate::frame::types::{Consistency, SerialConsistency};

/// CQL text passed through to the server as-is.
#[derive(Debug, Clone)]
pub struct Query {
    pub contents: String,
    pub config: StatementConfig,
}

impl Query {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: Default::default(),
        }
    }

    /// Returns self with the page size set.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.config.page_size = Some(page_size);
        self
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

    /// Declares the statement idempotent, enabling cross-node retries of
    /// transport errors.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }
}

impl From<String> for Query {
    fn from(contents: String) -> Query {
        Query::new(contents)
    }
}

impl From<&str> for Query {
    fn from(contents: &str) -> Query {
        Query::new(contents.to_owned())
    }
}
