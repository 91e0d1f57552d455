//! ICWS client: connection lifecycle and the shared exchange path.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::request::{self, Method, RequestDescriptor};
use crate::session::{self, Session, SessionInfo};
use crate::transport::{HttpTransport, RawResponse, Transport};
use crate::{ClientConfig, ConnectError, ConnectErrorKind, DisconnectError, IcwsError, paths};

/// A completed exchange, with the body already parsed.
#[derive(Debug, Clone)]
pub(crate) struct Exchange {
    pub status: u16,
    /// Parsed body; `{}` when empty or unparseable, the failure message
    /// when the transport never completed.
    pub body: Value,
    pub raw: RawResponse,
}

impl Exchange {
    pub fn is_success(&self) -> bool {
        self.raw.is_success()
    }

    /// Raw text for error reporting.
    fn message(&self) -> String {
        self.raw
            .failure
            .clone()
            .unwrap_or_else(|| self.raw.body.clone())
    }
}

/// Client for one ICWS server, holding at most one session.
pub struct IcwsClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    session: Session,
}

impl IcwsClient {
    /// Create a client that talks HTTP(S) to the configured server.
    pub fn new(config: ClientConfig) -> Result<Self, IcwsError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a client over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            session: Session::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// True iff both a session id and a CSRF token are held.
    pub async fn is_authenticated(&self) -> bool {
        self.session.is_authenticated().await
    }

    /// Snapshot of the current session, if any.
    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.session.current().await
    }

    /// Log in, replacing any existing session.
    #[tracing::instrument(skip(self, password), fields(server = %self.config.server))]
    pub async fn connect(&self, username: &str, password: &str) -> Result<SessionInfo, ConnectError> {
        if username.is_empty() || password.is_empty() {
            return Err(ConnectError {
                kind: ConnectErrorKind::MissingCredentials,
                status_code: 0,
                raw_message: if username.is_empty() {
                    "missing username".to_string()
                } else {
                    "missing password".to_string()
                },
            });
        }

        let descriptor = RequestDescriptor::new(Method::Post, paths::CONNECTION)
            .requires_session(false)
            .payload(session::login_payload(
                &self.config.application_name,
                username,
                password,
            ));

        let exchange = self.exchange(&descriptor).await.map_err(|e| ConnectError {
            kind: ConnectErrorKind::UnknownStatus,
            status_code: 0,
            raw_message: e.to_string(),
        })?;

        if !exchange.is_success() {
            let kind = session::connect_error_kind(exchange.status, &exchange.body);
            warn!(status = exchange.status, %kind, "connect failed");
            return Err(ConnectError {
                kind,
                status_code: exchange.status,
                raw_message: exchange.message(),
            });
        }

        match SessionInfo::from_response(&exchange.body, &exchange.raw.set_cookies) {
            Some(info) => {
                info!(user = %username, "connected");
                Ok(info)
            }
            None => Err(ConnectError {
                kind: ConnectErrorKind::InvalidResponse,
                status_code: exchange.status,
                raw_message: exchange.message(),
            }),
        }
    }

    /// Log out. The local session is cleared whatever the server answers.
    #[tracing::instrument(skip(self), fields(server = %self.config.server))]
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        if !self.session.is_authenticated().await {
            return Err(DisconnectError::NotConnected);
        }

        let descriptor =
            RequestDescriptor::new(Method::Delete, paths::CONNECTION).requires_session(true);
        let result = self.exchange(&descriptor).await;
        self.session.clear().await;

        match result {
            Ok(exchange) if exchange.is_success() => {
                info!("disconnected");
                Ok(())
            }
            Ok(exchange) => {
                warn!(status = exchange.status, "disconnect rejected, session dropped");
                Err(DisconnectError::Rejected {
                    status: exchange.status,
                    body: exchange.body,
                })
            }
            // The session was cleared concurrently before the request was built
            Err(IcwsError::NotAuthenticated) => Err(DisconnectError::NotConnected),
            Err(e) => Err(DisconnectError::Rejected {
                status: 0,
                body: Value::String(e.to_string()),
            }),
        }
    }

    /// Build, send and apply session side effects for one request.
    ///
    /// A successful exchange made while unauthenticated, or explicitly
    /// marked unauthenticated, stores the session identifiers it carries.
    /// A 401 on an authenticated exchange drops the session.
    pub(crate) async fn exchange(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<Exchange, IcwsError> {
        let current = self.session.current().await;
        let requires_session = descriptor.requires_session.unwrap_or(current.is_some());
        let request = request::build(descriptor, current.as_ref(), &self.config.custom_headers)?;

        let raw = self.transport.send(&request).await;
        debug!(
            method = %request.method,
            resource = %descriptor.resource_path,
            status = raw.status,
            "exchange completed"
        );

        let body = match &raw.failure {
            Some(message) => Value::String(message.clone()),
            None => parse_body(&raw.body),
        };

        if raw.is_success()
            && (current.is_none() || !requires_session)
            && let Some(info) = SessionInfo::from_response(&body, &raw.set_cookies)
        {
            debug!("session identifiers stored from response");
            self.session.store(info).await;
        }

        if raw.status == 401
            && requires_session
            && raw.failure.is_none()
            && let Some(sent_with) = &current
        {
            if self.session.clear_if(sent_with).await {
                warn!(resource = %descriptor.resource_path, "authentication failure, session dropped");
            } else {
                debug!(resource = %descriptor.resource_path, "authentication failure for a replaced session");
            }
        }

        Ok(Exchange {
            status: raw.status,
            body,
            raw,
        })
    }
}

/// Parse a response body, treating empty or malformed text as `{}`.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(text).unwrap_or_else(|e| {
        debug!(error = %e, "unparseable response body treated as empty");
        Value::Object(Map::new())
    })
}
