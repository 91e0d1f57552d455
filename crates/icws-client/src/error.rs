//! Error types for the ICWS client.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::transport::{STATUS_CONNECTION_RESET, STATUS_TRANSPORT_FAILURE, STATUS_UNREACHABLE};

/// Local failures, raised before any network activity takes place.
#[derive(Debug, Error)]
pub enum IcwsError {
    /// A request descriptor is missing a required field.
    #[error("invalid request descriptor: {0}")]
    InvalidDescriptor(String),

    /// A request requires a session but none is established.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Client configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse classification of a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport-success status, but the body carries an `errorId`.
    Protocol,
    /// 401: the session is no longer valid.
    AuthFailure,
    /// Refused, reset, timed out or otherwise never completed.
    Transport,
    /// Any other non-success HTTP status.
    Http,
}

/// Failure of a sync engine call.
///
/// Every network outcome that is not a success collapses into
/// [`SyncError::Response`], a `(status, body)` pair.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The call was rejected locally.
    #[error(transparent)]
    Local(#[from] IcwsError),

    /// The exchange completed with an error status or error body.
    #[error("request failed ({status}){}", describe_body(body))]
    Response { status: u16, body: Value },
}

impl SyncError {
    /// The status code of a failed exchange, if one took place.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Local(_) => None,
            Self::Response { status, .. } => Some(*status),
        }
    }

    /// The parsed response body of a failed exchange, if one took place.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Local(_) => None,
            Self::Response { body, .. } => Some(body),
        }
    }

    /// Classify a failed exchange. Local failures have no class.
    pub fn class(&self) -> Option<ErrorClass> {
        let Self::Response { status, body } = self else {
            return None;
        };

        Some(match *status {
            401 => ErrorClass::AuthFailure,
            STATUS_TRANSPORT_FAILURE | STATUS_UNREACHABLE | STATUS_CONNECTION_RESET => {
                ErrorClass::Transport
            }
            200..=299 if error_id(body).is_some() => ErrorClass::Protocol,
            _ => ErrorClass::Http,
        })
    }

    /// The application-level `errorId` carried by the body, if any.
    pub fn error_id(&self) -> Option<&str> {
        self.body().and_then(error_id)
    }
}

/// Extract the application-level error identifier from a response body.
pub(crate) fn error_id(body: &Value) -> Option<&str> {
    body.get("errorId").and_then(Value::as_str)
}

fn describe_body(body: &Value) -> String {
    match (error_id(body), body.get("message").and_then(Value::as_str)) {
        (Some(id), Some(msg)) => format!(": {id} - {msg}"),
        (Some(id), None) => format!(": {id}"),
        (None, Some(msg)) => format!(": {msg}"),
        (None, None) => match body {
            Value::String(s) if !s.is_empty() => format!(": {s}"),
            _ => String::new(),
        },
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Username or password was empty; nothing was sent.
    MissingCredentials,
    BadRequest,
    AuthenticationFailure,
    NotFound,
    ResourceGone,
    InternalServerError,
    /// The server refuses connections. Alternate hosts, when offered, are
    /// reported here and never followed automatically.
    ServiceUnavailable { alternate_hosts: Vec<String> },
    NetworkTimeout,
    ConnectionReset,
    /// A success status whose body lacked the session identifiers.
    InvalidResponse,
    UnknownStatus,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredentials => f.write_str("missing username or password"),
            Self::BadRequest => f.write_str("bad request"),
            Self::AuthenticationFailure => f.write_str("authentication failure"),
            Self::NotFound => f.write_str("not found"),
            Self::ResourceGone => f.write_str("resource is gone"),
            Self::InternalServerError => f.write_str("internal server error"),
            Self::ServiceUnavailable { alternate_hosts } if alternate_hosts.is_empty() => {
                f.write_str("service unavailable, no other servers found")
            }
            Self::ServiceUnavailable { alternate_hosts } => write!(
                f,
                "service unavailable, alternate hosts: {}",
                alternate_hosts.join(", ")
            ),
            Self::NetworkTimeout => f.write_str("network connect timeout"),
            Self::ConnectionReset => f.write_str("connection reset"),
            Self::InvalidResponse => f.write_str("response lacked session identifiers"),
            Self::UnknownStatus => f.write_str("unknown status"),
        }
    }
}

/// A failed `connect`.
#[derive(Debug, Clone, Error)]
#[error("connect failed ({status_code}): {kind}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub status_code: u16,
    /// Raw response text, or the transport failure message.
    pub raw_message: String,
}

/// A failed `disconnect`. Session state is cleared in every case.
#[derive(Debug, Error)]
pub enum DisconnectError {
    /// There was no session to close; nothing was sent.
    #[error("not connected")]
    NotConnected,

    /// The server did not acknowledge the logout.
    #[error("disconnect rejected ({status})")]
    Rejected { status: u16, body: Value },
}

/// Errors raised by the event dispatcher.
#[derive(Debug, Error)]
pub enum EventError {
    /// No listener is registered for the message type.
    #[error("no listeners for message type {0}")]
    NoListeners(String),

    /// The subscription call failed; local listeners are unchanged.
    #[error("subscription request failed: {0}")]
    Sync(#[from] SyncError),

    /// Neither `message_type` nor `message_types` named anything.
    #[error("subscription names no message types")]
    NoMessageTypes,
}
