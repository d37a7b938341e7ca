use bytes::Bytes;

use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::transport::errors::{DbError, QueryError, WriteType};

/// An ERROR response, carrying the server error code decoded into [`DbError`].
#[derive(Debug)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: types::read_u8(buf)? != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: types::read_u8(buf)? != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_string(),
                function: types::read_string(buf)?.to_string(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

impl From<Error> for QueryError {
    fn from(error: Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;

    fn encode_header(code: i32, message: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn simple_error_codes() {
        let cases: &[(i32, DbError)] = &[
            (0x0000, DbError::ServerError),
            (0x000A, DbError::ProtocolError),
            (0x0100, DbError::AuthenticationError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x1003, DbError::TruncateError),
            (0x2000, DbError::SyntaxError),
            (0x2100, DbError::Unauthorized),
            (0x2200, DbError::Invalid),
            (0x2300, DbError::ConfigError),
            (0x1234, DbError::Other(0x1234)),
        ];

        for (code, expected) in cases {
            let buf = encode_header(*code, "message");
            let err = Error::deserialize(&mut &buf[..]).unwrap();
            assert_eq!(&err.error, expected);
            assert_eq!(err.reason, "message");
        }
    }

    #[test]
    fn unavailable_error() {
        let mut buf = encode_header(0x1000, "unavailable");
        types::write_consistency(Consistency::Quorum, &mut buf);
        types::write_int(2, &mut buf);
        types::write_int(1, &mut buf);

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            }
        );
    }

    #[test]
    fn read_timeout_error() {
        let mut buf = encode_header(0x1200, "rt");
        types::write_consistency(Consistency::Two, &mut buf);
        types::write_int(2, &mut buf);
        types::write_int(2, &mut buf);
        buf.push(1);

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            }
        );
    }

    #[test]
    fn write_timeout_error() {
        let mut buf = encode_header(0x1100, "wt");
        types::write_consistency(Consistency::One, &mut buf);
        types::write_int(0, &mut buf);
        types::write_int(1, &mut buf);
        types::write_string("BATCH_LOG", &mut buf).unwrap();

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::WriteTimeout {
                consistency: Consistency::One,
                received: 0,
                required: 1,
                write_type: WriteType::BatchLog,
            }
        );
    }

    #[test]
    fn unprepared_error() {
        let mut buf = encode_header(0x2500, "unprepared");
        types::write_short_bytes(b"deadbeef", &mut buf).unwrap();

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"deadbeef"),
            }
        );
    }

    #[test]
    fn already_exists_error() {
        let mut buf = encode_header(0x2400, "exists");
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tbl", &mut buf).unwrap();

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::AlreadyExists {
                keyspace: "ks".to_string(),
                table: "tbl".to_string(),
            }
        );
    }
}
