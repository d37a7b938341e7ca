pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

pub use authenticate::{AuthChallenge, AuthSuccess, Authenticate};
pub use error::Error;
pub use event::Event;
pub use supported::Supported;

use crate::frame::frame_errors::{FrameError, ParseError};
use crate::transport::errors::QueryError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(ResponseOpcode::Error),
            0x02 => Ok(ResponseOpcode::Ready),
            0x03 => Ok(ResponseOpcode::Authenticate),
            0x06 => Ok(ResponseOpcode::Supported),
            0x08 => Ok(ResponseOpcode::Result),
            0x0C => Ok(ResponseOpcode::Event),
            0x0E => Ok(ResponseOpcode::AuthChallenge),
            0x10 => Ok(ResponseOpcode::AuthSuccess),
            _ => Err(FrameError::UnknownOpcode(value)),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate(Authenticate),
    Supported(Supported),
    Result(result::Result),
    Event(Event),
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, buf: &mut &[u8]) -> Result<Response, ParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::Event => Response::Event(Event::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(AuthSuccess::deserialize(buf)?),
        };

        Ok(response)
    }

    pub fn into_non_error_response(self) -> Result<NonErrorResponse, QueryError> {
        let non_error_response = match self {
            Response::Error(error) => return Err(error.into()),
            Response::Ready => NonErrorResponse::Ready,
            Response::Authenticate(auth) => NonErrorResponse::Authenticate(auth),
            Response::Supported(sup) => NonErrorResponse::Supported(sup),
            Response::Result(res) => NonErrorResponse::Result(res),
            Response::Event(event) => NonErrorResponse::Event(event),
            Response::AuthChallenge(auth_chal) => NonErrorResponse::AuthChallenge(auth_chal),
            Response::AuthSuccess(auth_succ) => NonErrorResponse::AuthSuccess(auth_succ),
        };

        Ok(non_error_response)
    }
}

/// A [`Response`] that is known not to be an ERROR frame.
#[derive(Debug)]
pub enum NonErrorResponse {
    Ready,
    Authenticate(Authenticate),
    Supported(Supported),
    Result(result::Result),
    Event(Event),
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}
