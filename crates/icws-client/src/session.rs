//! Session state and the rules tying it to requests.

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::error_id;
use crate::request::HeaderSet;
use crate::{ConnectErrorKind, IcwsError};

pub const CSRF_TOKEN_HEADER: &str = "ININ-ICWS-CSRF-Token";
pub const SESSION_ID_HEADER: &str = "ININ-ICWS-Session-ID";
pub const COOKIE_HEADER: &str = "Cookie";
pub const ACCEPT_LANGUAGE_HEADER: &str = "Accept-Language";

/// Language requested on unauthenticated calls.
pub const DEFAULT_LANGUAGE: &str = "en";

/// `__type` of the login representation.
const AUTH_CONNECTION_REQUEST: &str = "urn:inin.com:connection:icAuthConnectionRequestSettings";

/// `errorId` of a server that refuses connections but may name alternates.
const NOT_ACCEPTING_CONNECTIONS: &str = "error.server.notAcceptingConnections";

/// Identifiers of an authenticated session.
///
/// Session id and CSRF token are always present together; there is no
/// partially authenticated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub csrf_token: String,
    /// Echoed back in the `Cookie` header.
    pub cookie: String,
}

impl SessionInfo {
    /// Read session identifiers from an authenticating response.
    ///
    /// Returns `None` unless both `sessionId` and `csrfToken` are present
    /// and non-empty.
    pub fn from_response(body: &Value, set_cookies: &[String]) -> Option<Self> {
        let session_id = body.get("sessionId")?.as_str()?;
        let csrf_token = body.get("csrfToken")?.as_str()?;
        if session_id.is_empty() || csrf_token.is_empty() {
            return None;
        }

        Some(Self {
            session_id: session_id.to_string(),
            csrf_token: csrf_token.to_string(),
            cookie: cookie_from_set_cookie(set_cookies),
        })
    }
}

/// Reduce `Set-Cookie` headers to a `Cookie` header value.
///
/// Attributes (`Path`, `HttpOnly`, ...) are dropped; the `name=value` pairs
/// are joined with `"; "`.
pub fn cookie_from_set_cookie(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .filter_map(|header| header.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Headers tying a request to the session.
///
/// Authenticated requests carry the CSRF token, session id and cookie;
/// unauthenticated ones carry only a language preference. Never both.
pub fn decorate_headers(
    requires_session: bool,
    session: Option<&SessionInfo>,
) -> Result<HeaderSet, IcwsError> {
    let mut headers = HeaderSet::new();
    if requires_session {
        let info = session.ok_or(IcwsError::NotAuthenticated)?;
        headers.insert(CSRF_TOKEN_HEADER, info.csrf_token.clone());
        headers.insert(SESSION_ID_HEADER, info.session_id.clone());
        headers.insert(COOKIE_HEADER, info.cookie.clone());
    } else {
        headers.insert(ACCEPT_LANGUAGE_HEADER, DEFAULT_LANGUAGE);
    }
    Ok(headers)
}

/// The session owned by one client.
///
/// Writes replace the whole value under the lock, so readers never observe
/// a token from one login paired with a cookie from another.
#[derive(Debug, Default)]
pub struct Session {
    state: RwLock<Option<SessionInfo>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current session.
    pub async fn current(&self) -> Option<SessionInfo> {
        self.state.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub(crate) async fn store(&self, info: SessionInfo) {
        *self.state.write().await = Some(info);
    }

    pub(crate) async fn clear(&self) -> Option<SessionInfo> {
        self.state.write().await.take()
    }

    /// Clear the session only if it is still the one in `expected`.
    ///
    /// Returns whether it was cleared. A newer login is left in place.
    pub(crate) async fn clear_if(&self, expected: &SessionInfo) -> bool {
        let mut state = self.state.write().await;
        match state.as_ref() {
            Some(info) if info.session_id == expected.session_id => {
                *state = None;
                true
            }
            _ => false,
        }
    }
}

/// Login representation POSTed to the connection resource.
pub(crate) fn login_payload(application_name: &str, username: &str, password: &str) -> Value {
    json!({
        "__type": AUTH_CONNECTION_REQUEST,
        "applicationName": application_name,
        "userID": username,
        "password": password,
    })
}

/// Map a failed connection status to its kind.
pub(crate) fn connect_error_kind(status: u16, body: &Value) -> ConnectErrorKind {
    match status {
        400 => ConnectErrorKind::BadRequest,
        401 => ConnectErrorKind::AuthenticationFailure,
        404 => ConnectErrorKind::NotFound,
        410 => ConnectErrorKind::ResourceGone,
        500 => ConnectErrorKind::InternalServerError,
        503 => ConnectErrorKind::ServiceUnavailable {
            alternate_hosts: alternate_hosts(body),
        },
        crate::transport::STATUS_UNREACHABLE => ConnectErrorKind::NetworkTimeout,
        crate::transport::STATUS_CONNECTION_RESET => ConnectErrorKind::ConnectionReset,
        _ => ConnectErrorKind::UnknownStatus,
    }
}

/// Alternate hosts offered by a server that is not accepting connections.
fn alternate_hosts(body: &Value) -> Vec<String> {
    if error_id(body) != Some(NOT_ACCEPTING_CONNECTIONS) {
        return Vec::new();
    }

    body.get("alternateHostList")
        .and_then(Value::as_array)
        .map(|hosts| {
            hosts
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
