//! Generic CRUD-to-REST mapping.
//!
//! Any [`Syncable`] value (an entity, a collection, a subscription) can be
//! read, created, updated or deleted through [`IcwsClient::execute`]. The
//! result is either the parsed response body or a [`SyncError`].

use serde_json::Value;

use crate::client::{Exchange, IcwsClient};
use crate::error::error_id;
use crate::request::{HeaderSet, Method, Payload, RequestDescriptor};
use crate::SyncError;

/// Query sent when the caller supplies none.
pub const DEFAULT_SELECT: (&str, &str) = ("select", "*");

/// Abstract persistence operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Read,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn method(&self) -> Method {
        match self {
            Self::Read => Method::Get,
            Self::Create => Method::Post,
            Self::Update => Method::Put,
            Self::Delete => Method::Delete,
        }
    }
}

/// Something addressable on the server.
pub trait Syncable {
    /// Resource path, relative to the API root.
    fn url(&self) -> &str;

    /// Entity id; `None` for collections and unsaved entities.
    fn id(&self) -> Option<&str> {
        None
    }

    /// Representation sent by create, update and delete.
    fn attributes(&self) -> &Value;
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOptions {
    /// `None` resolves to "true if authenticated".
    pub requires_session: Option<bool>,
    /// Extra path segments. Ignored by reads of an entity with an id.
    pub template: Vec<String>,
    /// `None` sends `select=*`; an empty list sends no query string.
    pub query: Option<Vec<(String, String)>>,
    pub headers: HeaderSet,
    /// Overrides the handle's attributes as the request body.
    pub representation: Option<Payload>,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires_session(mut self, requires_session: bool) -> Self {
        self.requires_session = Some(requires_session);
        self
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.template.push(segment.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Send no query string at all.
    pub fn without_query(mut self) -> Self {
        self.query = Some(Vec::new());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn representation(mut self, payload: impl Into<Payload>) -> Self {
        self.representation = Some(payload.into());
        self
    }

    fn into_descriptor<S: Syncable + ?Sized>(self, verb: Verb, handle: &S) -> RequestDescriptor {
        let query = self.query.unwrap_or_else(|| {
            vec![(DEFAULT_SELECT.0.to_string(), DEFAULT_SELECT.1.to_string())]
        });

        let (template, payload) = match verb {
            Verb::Read => {
                let template = match handle.id() {
                    Some(id) => vec![id.to_string()],
                    None => self.template,
                };
                (template, None)
            }
            Verb::Create | Verb::Update | Verb::Delete => {
                let payload = self
                    .representation
                    .unwrap_or_else(|| Payload::Json(handle.attributes().clone()));
                (self.template, Some(payload))
            }
        };

        RequestDescriptor {
            method: verb.method(),
            resource_path: handle.url().to_string(),
            template,
            query,
            headers: self.headers,
            payload,
            requires_session: self.requires_session,
        }
    }
}

impl IcwsClient {
    /// Run one CRUD operation against `handle`.
    ///
    /// Success means a 2xx status and a body without an `errorId`; anything
    /// else, including transport failures, is a [`SyncError::Response`].
    /// Missing descriptor fields fail before any network activity.
    pub async fn execute<S: Syncable + ?Sized>(
        &self,
        verb: Verb,
        handle: &S,
        options: SyncOptions,
    ) -> Result<Value, SyncError> {
        let descriptor = options.into_descriptor(verb, handle);
        let exchange = self.exchange(&descriptor).await?;
        classify(exchange)
    }

    pub async fn fetch<S: Syncable + ?Sized>(
        &self,
        handle: &S,
        options: SyncOptions,
    ) -> Result<Value, SyncError> {
        self.execute(Verb::Read, handle, options).await
    }

    pub async fn create<S: Syncable + ?Sized>(
        &self,
        handle: &S,
        options: SyncOptions,
    ) -> Result<Value, SyncError> {
        self.execute(Verb::Create, handle, options).await
    }

    pub async fn update<S: Syncable + ?Sized>(
        &self,
        handle: &S,
        options: SyncOptions,
    ) -> Result<Value, SyncError> {
        self.execute(Verb::Update, handle, options).await
    }

    pub async fn delete<S: Syncable + ?Sized>(
        &self,
        handle: &S,
        options: SyncOptions,
    ) -> Result<Value, SyncError> {
        self.execute(Verb::Delete, handle, options).await
    }
}

fn classify(exchange: Exchange) -> Result<Value, SyncError> {
    if exchange.is_success() && error_id(&exchange.body).is_none() {
        Ok(exchange.body)
    } else {
        Err(SyncError::Response {
            status: exchange.status,
            body: exchange.body,
        })
    }
}
