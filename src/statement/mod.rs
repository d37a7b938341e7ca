pub mod prepared_statement;
pub mod query;

pub use crate::frame::types::{Consistency, SerialConsistency};

/// Configuration shared by unprepared and prepared statements.
#[derive(Debug, Clone, Default)]
pub struct StatementConfig {
    /// Consistency to use for this statement; the session default applies when unset.
    pub consistency: Option<Consistency>,
    /// Serial consistency of the conditional part of the statement.
    pub serial_consistency: Option<SerialConsistency>,
    /// Result page size; unset means the server sends everything in one page.
    pub page_size: Option<i32>,
    /// A statement is idempotent if it can be applied multiple times without
    /// changing the result of the initial application. Never assumed, must be
    /// declared by the caller.
    pub is_idempotent: bool,
    /// Ask the server to omit result metadata it already handed out at
    /// prepare time.
    pub skip_metadata: bool,
}

impl StatementConfig {
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}
