//! Client for Interaction Center web services (ICWS).
//!
//! This crate wraps the ICWS REST API behind a session-oriented client:
//! log in once, then read and write server resources and receive server
//! messages without dealing with session headers yourself.
//!
//! ## Features
//!
//! - **Session**: login/logout with typed failures; session headers are
//!   attached to every authenticated request
//! - **Sync**: create/read/update/delete on any addressable resource, with
//!   one `(status, body)` error shape for HTTP and network failures
//! - **Resources**: entity and collection handles, built directly or
//!   inflated from references found in other representations
//! - **Events**: a polling dispatcher that turns the message feed into
//!   per-type listener callbacks

pub mod client;
pub mod config;
mod error;
pub mod events;
pub mod paths;
pub mod request;
pub mod resource;
pub mod session;
pub mod sync;
pub mod transport;

pub use client::IcwsClient;
pub use config::{ClientConfig, CustomHeader, Scheme};
pub use error::{
    ConnectError, ConnectErrorKind, DisconnectError, ErrorClass, EventError, IcwsError, SyncError,
};
pub use events::{EventDispatcher, Listener, ListenerRegistry, ListenerResult, Message, Subscription};
pub use request::{HeaderSet, Method, Payload, RequestDescriptor, WireRequest};
pub use resource::{Collection, Entity, Inflated, ResourceHandle, ResourceRef};
pub use session::{Session, SessionInfo};
pub use sync::{SyncOptions, Syncable, Verb};
pub use transport::{HttpTransport, RawResponse, Transport};
