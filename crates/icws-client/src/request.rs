//! Request descriptors and the URI builder.
//!
//! [`build`] is pure: it turns a [`RequestDescriptor`] plus the current
//! session snapshot into a [`WireRequest`] with a fully qualified path,
//! merged headers and a serialized body.

use std::fmt;

use serde_json::Value;

use crate::config::CustomHeader;
use crate::session::{SessionInfo, decorate_headers};
use crate::IcwsError;

/// Root path of every ICWS resource.
pub const API_ROOT: &str = "/icws";

/// Media type for request and response bodies.
pub const MEDIA_TYPE: &str = "application/vnd.inin.icws+JSON;charset=utf-8";

pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";

/// Transport verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Pre-serialized text, sent unchanged.
    Text(String),
    /// Structured data, serialized as JSON.
    Json(Value),
}

impl Payload {
    /// Serialize to the wire form. Empty text and `null` mean "no body".
    fn serialize(&self) -> Result<Option<String>, IcwsError> {
        match self {
            Self::Text(text) if text.is_empty() => Ok(None),
            Self::Text(text) => Ok(Some(text.clone())),
            Self::Json(Value::Null) => Ok(None),
            Self::Json(value) => Ok(Some(serde_json::to_string(value)?)),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Ordered header list with case-insensitive replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet(Vec<(String, String)>);

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing header with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(slot) => *slot = (name, value),
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Merge `other` into `self`; headers in `other` win on collision.
    pub fn merge(&mut self, other: &HeaderSet) {
        for (name, value) in &other.0 {
            self.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A logical request, before path and header assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub resource_path: String,
    /// Appended to the path as `/segment`, in order.
    pub template: Vec<String>,
    /// Query filters, in order. Keys and values are joined literally.
    pub query: Vec<(String, String)>,
    /// Caller headers; these override every default.
    pub headers: HeaderSet,
    pub payload: Option<Payload>,
    /// `None` resolves to "true if authenticated".
    pub requires_session: Option<bool>,
}

impl RequestDescriptor {
    pub fn new(method: Method, resource_path: impl Into<String>) -> Self {
        Self {
            method,
            resource_path: resource_path.into(),
            template: Vec::new(),
            query: Vec::new(),
            headers: HeaderSet::new(),
            payload: None,
            requires_session: None,
        }
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.template.push(segment.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn requires_session(mut self, requires_session: bool) -> Self {
        self.requires_session = Some(requires_session);
        self
    }
}

/// A request ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub method: Method,
    /// Absolute path including query string, relative to the server root.
    pub path: String,
    pub headers: HeaderSet,
    pub body: Option<String>,
}

/// Assemble a wire request.
///
/// `session` is a snapshot of the current session; a descriptor that
/// requires one fails with [`IcwsError::NotAuthenticated`] when it is absent.
/// Query values are not percent-encoded: filter expressions are passed to
/// the server exactly as the caller wrote them.
pub fn build(
    descriptor: &RequestDescriptor,
    session: Option<&SessionInfo>,
    default_headers: &[CustomHeader],
) -> Result<WireRequest, IcwsError> {
    let resource = descriptor.resource_path.trim().trim_matches('/');
    if resource.is_empty() {
        return Err(IcwsError::InvalidDescriptor(
            "missing resource path".to_string(),
        ));
    }

    let requires_session = descriptor.requires_session.unwrap_or(session.is_some());
    let mut headers = decorate_headers(requires_session, session)?;

    let mut path = String::from(API_ROOT);
    if requires_session && let Some(info) = session {
        path.push('/');
        path.push_str(&info.session_id);
    }
    path.push('/');
    path.push_str(resource);

    for segment in &descriptor.template {
        path.push('/');
        path.push_str(segment);
    }

    for (i, (key, value)) in descriptor.query.iter().enumerate() {
        path.push(if i == 0 { '?' } else { '&' });
        path.push_str(key);
        path.push('=');
        path.push_str(value);
    }

    let body = match &descriptor.payload {
        Some(payload) => payload.serialize()?,
        None => None,
    };
    if let Some(body) = &body {
        headers.insert(CONTENT_TYPE_HEADER, MEDIA_TYPE);
        headers.insert(CONTENT_LENGTH_HEADER, body.len().to_string());
    }

    for header in default_headers {
        headers.insert(header.name.clone(), header.value.clone());
    }
    headers.merge(&descriptor.headers);

    Ok(WireRequest {
        method: descriptor.method,
        path,
        headers,
        body,
    })
}
