//! Wire types exchanged on one connection.
//!
//! A single fixed protocol version; both ends of a channel must run the
//! same codec. [`Frame`] is the envelope: the `Hello*` variants carry the
//! connection handshake, everything after that is `Request` one way and
//! `Response` the other.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::value::{Kwargs, Value};

/// One remote invocation, constructed by a proxy and consumed exactly once
/// by the peer's serving loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Request {
    pub wants_response: bool,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Request {
    pub fn new(function: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            wants_response: true,
            function: function.into(),
            args,
            kwargs,
        }
    }

    pub fn fire_and_forget(function: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            wants_response: false,
            function: function.into(),
            args,
            kwargs,
        }
    }
}

/// Outcome of one invocation: a value or an error value, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum Response {
    Ok(Value),
    Err(RemoteError),
}

impl Response {
    pub fn from_result(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Response::Ok(value),
            Err(err) => Response::Err(err),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum Frame {
    /// First frame on every connection: the connecting side presents the
    /// listener's shared secret.
    Hello { auth_key: String },
    HelloOk,
    HelloDenied,
    Request(Request),
    Response(Response),
}
