//! HTTP transport.
//!
//! A transport sends one [`WireRequest`] and always yields a [`RawResponse`].
//! Network failures never surface as errors here: they are folded into
//! synthetic status codes so callers see a single `(status, body)` shape.

use std::error::Error as StdError;
use std::io;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::SET_COOKIE;
use tracing::debug;

use crate::config::{ClientConfig, Scheme};
use crate::request::{CONTENT_LENGTH_HEADER, Method, WireRequest};
use crate::IcwsError;

/// The request failed in a way no other code describes.
pub const STATUS_TRANSPORT_FAILURE: u16 = 0;

/// The name of the server could not be resolved.
pub const STATUS_NAME_NOT_RESOLVED: u16 = 404;

/// The server refused the connection or did not answer in time.
pub const STATUS_UNREACHABLE: u16 = 599;

/// The peer closed the connection mid-exchange.
pub const STATUS_CONNECTION_RESET: u16 = 600;

/// Outcome of one exchange with the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Complete response body.
    pub body: String,
    /// Raw `Set-Cookie` header values.
    pub set_cookies: Vec<String>,
    /// Set when the exchange never completed; holds the failure message.
    pub failure: Option<String>,
}

impl RawResponse {
    /// A synthetic response for an exchange that never completed.
    pub fn failed(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && (200..300).contains(&self.status)
    }
}

/// Sends wire requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the full response body.
    async fn send(&self, request: &WireRequest) -> RawResponse;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, IcwsError> {
        let http = Client::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(
                config.scheme == Scheme::Https && config.accept_invalid_certs,
            )
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WireRequest) -> RawResponse {
        let url = format!("{}{}", self.base_url, request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http.request(method, &url);
        for (name, value) in request.headers.iter() {
            // reqwest derives the length from the body itself
            if name.eq_ignore_ascii_case(CONTENT_LENGTH_HEADER) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return failure_response(&e),
        };

        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(String::from)
            .collect();

        match response.text().await {
            Ok(body) => RawResponse {
                status,
                body,
                set_cookies,
                failure: None,
            },
            Err(e) => failure_response(&e),
        }
    }
}

fn failure_response(err: &reqwest::Error) -> RawResponse {
    let status = failure_status(err);
    debug!(status, error = %err, "transport failure");
    RawResponse::failed(status, err.to_string())
}

/// Map a reqwest failure to a synthetic status code.
fn failure_status(err: &reqwest::Error) -> u16 {
    if err.is_timeout() {
        return STATUS_UNREACHABLE;
    }

    let mut source = Some(err as &(dyn StdError + 'static));
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => {
                    return STATUS_UNREACHABLE;
                }
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return STATUS_CONNECTION_RESET,
                _ => {}
            }
        }

        let text = e.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return STATUS_NAME_NOT_RESOLVED;
        }
        if text.contains("connection closed before message completed") {
            return STATUS_CONNECTION_RESET;
        }

        source = e.source();
    }

    if err.is_connect() {
        STATUS_UNREACHABLE
    } else {
        STATUS_TRANSPORT_FAILURE
    }
}
