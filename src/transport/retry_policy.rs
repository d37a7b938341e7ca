//! Query retry configuration.
//! To decide when to retry a query the `Session` can use any object which
//! implements the `RetryPolicy` trait.

use crate::frame::types::Consistency;
use crate::transport::errors::{DbError, QueryError, WriteType};

/// Information about a failed query attempt.
pub struct RetryInfo<'a> {
    /// The error with which the attempt failed
    pub error: &'a QueryError,
    /// A query is idempotent if it can be applied multiple times without
    /// changing the result of the initial application. `false` means it is
    /// unknown whether it is idempotent.
    pub is_idempotent: bool,
    /// Consistency with which the query failed
    pub consistency: Consistency,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameNode,
    RetryNextNode,
    DontRetry,
}

/// Specifies a policy used to decide when to retry a query.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new query, starts a session of deciding about retries.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single query to decide when to retry it.
/// After the query is finished it is destroyed or reset.
pub trait RetrySession: Send + Sync {
    /// Called after a query attempt failed - decide what to do next.
    fn decide_should_retry(&mut self, retry_info: RetryInfo<'_>) -> RetryDecision;

    /// Reset before using for a new query.
    fn reset(&mut self);
}

/// Forwards all errors directly to the user, never retries.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

pub struct FallthroughRetrySession;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _retry_info: RetryInfo<'_>) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

/// Total retry cap, preventing retry storms no matter what the per-error
/// rules would allow.
const DEFAULT_MAX_RETRIES: usize = 5;

/// Default retry policy - retries when there is a high chance that a retry
/// might help.
#[derive(Debug)]
pub struct DefaultRetryPolicy {
    max_retries: usize,
}

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(max_retries: usize) -> DefaultRetryPolicy {
        DefaultRetryPolicy { max_retries }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new(self.max_retries))
    }
}

pub struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
    retries_done: usize,
    max_retries: usize,
}

impl DefaultRetrySession {
    fn new(max_retries: usize) -> DefaultRetrySession {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
            retries_done: 0,
            max_retries,
        }
    }

    fn count(&mut self, decision: RetryDecision) -> RetryDecision {
        if decision != RetryDecision::DontRetry {
            self.retries_done += 1;
        }
        decision
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, retry_info: RetryInfo<'_>) -> RetryDecision {
        // Conditional statements use Paxos and are never safe to replay
        if retry_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        }

        if self.retries_done >= self.max_retries {
            return RetryDecision::DontRetry;
        }

        let decision = match retry_info.error {
            // Connection and transport errors: the node itself may be fine,
            // but this query may have reached the server, so replaying it is
            // only safe for idempotent statements.
            QueryError::IoError(_)
            | QueryError::NodeDown(_)
            | QueryError::TimeoutError
            | QueryError::DbError(DbError::ServerError, _)
            | QueryError::DbError(DbError::TruncateError, _) => {
                if retry_info.is_idempotent {
                    RetryDecision::RetryNextNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Unavailable - the current node believes that not enough nodes
            // are alive to satisfy specified consistency requirements.
            // Maybe this node has network problems - try a different one.
            // Perform at most one retry - it's unlikely that two nodes
            // have network problems at the same time.
            QueryError::DbError(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            // ReadTimeout - coordinator didn't hear back from enough replicas
            // in time. Retry at most once, on the same node, and only when
            // enough replicas responded and one of them carried the data -
            // the coordinator then has everything it needs at hand.
            QueryError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && *data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            // WriteTimeout - retry at most once, and only for a timeout on
            // the write of the batch log: the batch log write succeeding
            // means the batch itself will be replayed by the server.
            QueryError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry && *write_type == WriteType::BatchLog {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The node is overloaded or still bootstrapping: it can't execute
            // the query now, another one may
            QueryError::DbError(DbError::Overloaded, _)
            | QueryError::DbError(DbError::IsBootstrapping, _) => RetryDecision::RetryNextNode,
            // All stream ids of this connection are taken; use another
            // connection
            QueryError::UnableToAllocStreamId => RetryDecision::RetryNextNode,
            // In all other cases propagate the error to the user
            _ => RetryDecision::DontRetry,
        };

        self.count(decision)
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new(self.max_retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::ErrorKind;
    use std::sync::Arc;

    fn make_retry_info(error: &QueryError, is_idempotent: bool) -> RetryInfo<'_> {
        RetryInfo {
            error,
            is_idempotent,
            consistency: Consistency::One,
        }
    }

    // Asserts that the default policy never retries for this error
    fn default_policy_assert_never_retries(error: QueryError) {
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_never_retries() {
        let never_retried_dberrors = vec![
            DbError::SyntaxError,
            DbError::Invalid,
            DbError::AlreadyExists {
                keyspace: String::new(),
                table: String::new(),
            },
            DbError::FunctionFailure {
                keyspace: String::new(),
                function: String::new(),
                arg_types: vec![],
            },
            DbError::AuthenticationError,
            DbError::Unauthorized,
            DbError::ConfigError,
            DbError::ReadFailure {
                consistency: Consistency::Two,
                received: 2,
                required: 1,
                numfailures: 1,
                data_present: false,
            },
            DbError::WriteFailure {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                numfailures: 1,
                write_type: WriteType::BatchLog,
            },
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"deadbeef"),
            },
            DbError::ProtocolError,
            DbError::Other(0x124816),
        ];

        for dberror in never_retried_dberrors {
            default_policy_assert_never_retries(QueryError::DbError(dberror, String::new()));
        }

        default_policy_assert_never_retries(QueryError::ProtocolError("test"));
    }

    // Asserts that for this error the policy retries on the next node only
    // for idempotent queries
    fn default_policy_assert_idempotent_next(error: QueryError) {
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::RetryNextNode
        );
    }

    #[test]
    fn default_idempotent_next_retries() {
        let idempotent_next_errors = vec![
            QueryError::DbError(DbError::Overloaded, String::new()),
            QueryError::DbError(DbError::IsBootstrapping, String::new()),
        ];

        for error in idempotent_next_errors {
            let mut policy = DefaultRetryPolicy::new().new_session();
            // Overloaded/bootstrapping retries regardless of idempotence
            assert_eq!(
                policy.decide_should_retry(make_retry_info(&error, false)),
                RetryDecision::RetryNextNode
            );
        }

        let transport_errors = vec![
            QueryError::DbError(DbError::TruncateError, String::new()),
            QueryError::DbError(DbError::ServerError, String::new()),
            QueryError::IoError(Arc::new(std::io::Error::new(ErrorKind::Other, "test"))),
            QueryError::NodeDown("127.0.0.1:9042".parse().unwrap()),
        ];

        for error in transport_errors {
            default_policy_assert_idempotent_next(error);
        }
    }

    // Transport error on a non-idempotent statement must never be replayed
    #[test]
    fn default_transport_error_non_idempotent_no_retry() {
        let error = QueryError::IoError(Arc::new(std::io::Error::new(
            ErrorKind::BrokenPipe,
            "broken",
        )));

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    // On Unavailable error we retry one time no matter the idempotence
    #[test]
    fn default_unavailable() {
        let error = QueryError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy_not_idempotent = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy_not_idempotent.decide_should_retry(make_retry_info(&error, false)),
            RetryDecision::RetryNextNode
        );
        assert_eq!(
            policy_not_idempotent.decide_should_retry(make_retry_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy_idempotent = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy_idempotent.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::RetryNextNode
        );
        assert_eq!(
            policy_idempotent.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    // On ReadTimeout the policy retries once, on the same node, when there
    // were enough responses and the data was present
    #[test]
    fn default_read_timeout() {
        // Enough responses and data_present == true
        let enough_responses_with_data = QueryError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            },
            String::new(),
        );

        for is_idempotent in [true, false] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_retry_info(
                    &enough_responses_with_data,
                    is_idempotent
                )),
                RetryDecision::RetrySameNode
            );
            // Only once
            assert_eq!(
                policy.decide_should_retry(make_retry_info(
                    &enough_responses_with_data,
                    is_idempotent
                )),
                RetryDecision::DontRetry
            );
        }

        // Enough responses but data_present == false
        let enough_responses_no_data = QueryError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&enough_responses_no_data, true)),
            RetryDecision::DontRetry
        );

        // Not enough responses
        let not_enough_responses = QueryError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                data_present: true,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&not_enough_responses, true)),
            RetryDecision::DontRetry
        );
    }

    // WriteTimeout retries once when write_type == BatchLog, regardless of
    // idempotence
    #[test]
    fn default_write_timeout() {
        let batch_log_write = QueryError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            String::new(),
        );

        for is_idempotent in [true, false] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_retry_info(&batch_log_write, is_idempotent)),
                RetryDecision::RetrySameNode
            );
            assert_eq!(
                policy.decide_should_retry(make_retry_info(&batch_log_write, is_idempotent)),
                RetryDecision::DontRetry
            );
        }

        let simple_write = QueryError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 4,
                required: 2,
                write_type: WriteType::Simple,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&simple_write, true)),
            RetryDecision::DontRetry
        );
    }

    // Serial consistency means a conditional statement - never retried
    #[test]
    fn default_serial_consistency_never_retries() {
        let error = QueryError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Serial,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(RetryInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::Serial,
            }),
            RetryDecision::DontRetry
        );
    }

    // The total retry count is capped
    #[test]
    fn default_retry_cap() {
        let error = QueryError::DbError(DbError::Overloaded, String::new());

        let mut policy = DefaultRetryPolicy::with_max_retries(3).new_session();
        for _ in 0..3 {
            assert_eq!(
                policy.decide_should_retry(make_retry_info(&error, true)),
                RetryDecision::RetryNextNode
            );
        }
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    // Reset gives a fresh session
    #[test]
    fn default_reset() {
        let error = QueryError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::RetryNextNode
        );
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::DontRetry
        );

        policy.reset();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::RetryNextNode
        );
    }

    // Fallthrough never retries anything
    #[test]
    fn fallthrough_never_retries() {
        let error = QueryError::DbError(DbError::Overloaded, String::new());

        let mut policy = FallthroughRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_retry_info(&error, true)),
            RetryDecision::DontRetry
        );
    }
}
