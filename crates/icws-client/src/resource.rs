//! Resource handles: local stand-ins for server entities and collections.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::client::IcwsClient;
use crate::events::Subscription;
use crate::sync::{SyncOptions, Syncable};
use crate::{IcwsError, SyncError};

fn empty_attributes() -> Value {
    Value::Object(Map::new())
}

/// One addressable entity.
///
/// An entity without an id has not been created on the server yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: Option<String>,
    pub url: String,
    pub attributes: Value,
}

impl Entity {
    pub fn new(url: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            url: url.into(),
            attributes: empty_attributes(),
        }
    }

    /// An entity that only exists locally so far.
    pub fn unsaved(url: impl Into<String>, attributes: Value) -> Self {
        Self {
            id: None,
            url: url.into(),
            attributes,
        }
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Read the entity.
    pub async fn fetch(&self, client: &IcwsClient) -> Result<Value, SyncError> {
        client.fetch(self, SyncOptions::new()).await
    }

    /// Bring the entity in line with the server: read it when it has an id,
    /// create it from its attributes otherwise.
    pub async fn synchronize(&self, client: &IcwsClient) -> Result<Value, SyncError> {
        match self.id {
            Some(_) => self.fetch(client).await,
            None => client.create(self, SyncOptions::new()).await,
        }
    }

    /// A subscription bound to this entity's URL.
    pub fn subscription(&self) -> Subscription {
        Subscription::new(self.url.clone())
    }
}

impl Syncable for Entity {
    fn url(&self) -> &str {
        &self.url
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn attributes(&self) -> &Value {
        &self.attributes
    }
}

/// One addressable collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub url: String,
    pub attributes: Value,
}

impl Collection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attributes: empty_attributes(),
        }
    }

    pub async fn fetch(&self, client: &IcwsClient) -> Result<Value, SyncError> {
        client.fetch(self, SyncOptions::new()).await
    }
}

impl Syncable for Collection {
    fn url(&self) -> &str {
        &self.url
    }

    fn attributes(&self) -> &Value {
        &self.attributes
    }
}

/// Either kind of handle, as produced by [`IcwsClient::inflate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceHandle {
    Entity(Entity),
    Collection(Collection),
}

impl ResourceHandle {
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Collection(collection) => Some(collection),
            Self::Entity(_) => None,
        }
    }
}

impl Syncable for ResourceHandle {
    fn url(&self) -> &str {
        match self {
            Self::Entity(entity) => entity.url(),
            Self::Collection(collection) => collection.url(),
        }
    }

    fn id(&self) -> Option<&str> {
        match self {
            Self::Entity(entity) => entity.id(),
            Self::Collection(collection) => collection.id(),
        }
    }

    fn attributes(&self) -> &Value {
        match self {
            Self::Entity(entity) => entity.attributes(),
            Self::Collection(collection) => collection.attributes(),
        }
    }
}

/// A reference to a server object, as found inside other representations.
///
/// With an id it names an entity; the URL may then be omitted and derived
/// from `uri`, which is the URL followed by `/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl ResourceRef {
    pub fn entity(url: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            url: Some(url.into()),
            uri: None,
        }
    }

    pub fn collection(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the reference into a handle without touching the network.
    pub fn to_handle(&self) -> Result<ResourceHandle, IcwsError> {
        let id = self.id.as_deref().filter(|id| !id.is_empty());
        match id {
            Some(id) => {
                let url = match (&self.url, &self.uri) {
                    (Some(url), _) if !url.is_empty() => url.clone(),
                    (_, Some(uri)) => parent_of(uri, id)?,
                    _ => {
                        return Err(IcwsError::InvalidDescriptor(format!(
                            "reference to {id} has neither url nor uri"
                        )));
                    }
                };
                Ok(ResourceHandle::Entity(Entity::new(url, id)))
            }
            None => match self.url.as_deref().filter(|url| !url.is_empty()) {
                Some(url) => Ok(ResourceHandle::Collection(Collection::new(url))),
                None => Err(IcwsError::InvalidDescriptor(
                    "reference has neither id nor url".to_string(),
                )),
            },
        }
    }
}

fn parent_of(uri: &str, id: &str) -> Result<String, IcwsError> {
    uri.trim_end_matches('/')
        .strip_suffix(id)
        .and_then(|rest| rest.strip_suffix('/'))
        .map(String::from)
        .ok_or_else(|| IcwsError::InvalidDescriptor(format!("uri {uri} does not end with /{id}")))
}

/// A handle produced by [`IcwsClient::inflate`], with the read result when
/// one was requested.
#[derive(Debug)]
pub struct Inflated {
    pub handle: ResourceHandle,
    pub fetched: Option<Result<Value, SyncError>>,
}

impl IcwsClient {
    /// Build a handle from a reference, reading it immediately when
    /// `auto_fetch` is set.
    pub async fn inflate(
        &self,
        reference: &ResourceRef,
        auto_fetch: bool,
    ) -> Result<Inflated, IcwsError> {
        let handle = reference.to_handle()?;
        debug!(url = %handle.url(), id = ?handle.id(), auto_fetch, "inflating reference");

        let fetched = if auto_fetch {
            Some(self.fetch(&handle, SyncOptions::new()).await)
        } else {
            None
        };

        Ok(Inflated { handle, fetched })
    }
}
