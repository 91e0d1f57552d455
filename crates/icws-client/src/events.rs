//! Event dispatcher: publish/subscribe on top of the polled message feed.
//!
//! The server queues messages for every subscription the session holds. A
//! background task reads the feed at a fixed interval and hands each delta
//! message to the listeners registered for its `__type`.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::IcwsClient;
use crate::resource::Collection;
use crate::sync::{SyncOptions, Syncable};
use crate::{EventError, IcwsError, SyncError, paths};

/// One entry of the message feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "__type")]
    pub type_tag: String,
    /// New or changed since the previous read of the feed.
    #[serde(rename = "isDelta", default)]
    pub is_delta: bool,
    /// Everything else, passed to listeners untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(type_tag: impl Into<String>, is_delta: bool) -> Self {
        Self {
            type_tag: type_tag.into(),
            is_delta,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

pub type ListenerResult = Result<(), String>;

type ListenerFn = dyn Fn(&Message) -> ListenerResult + Send + Sync;

/// A message callback.
///
/// Listeners are compared by identity: clones of one `Listener` are equal,
/// two listeners built from identical closures are not.
#[derive(Clone)]
pub struct Listener(Arc<ListenerFn>);

impl Listener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> ListenerResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn same(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn call(&self, message: &Message) -> ListenerResult {
        (self.0)(message)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0))
    }
}

/// Listeners per message type, in registration order. Duplicates allowed.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, message_type: &str, listener: Listener) {
        self.listeners
            .entry(message_type.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove the first registration of `listener` under `message_type`.
    pub fn remove(&self, message_type: &str, listener: &Listener) -> bool {
        let Some(mut entry) = self.listeners.get_mut(message_type) else {
            return false;
        };
        match entry.iter().position(|l| l.same(listener)) {
            Some(index) => {
                entry.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copy of the current registrations for `message_type`.
    pub fn snapshot(&self, message_type: &str) -> Vec<Listener> {
        self.listeners
            .get(message_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self, message_type: &str) -> usize {
        self.listeners
            .get(message_type)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.iter().all(|entry| entry.value().is_empty())
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

/// The server-side object expressing interest in some message types.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub url: String,
    /// Sent on subscribe; `Null` sends no body.
    pub representation: Value,
    /// Request options for both subscribe and unsubscribe. No query string
    /// unless set.
    pub options: SyncOptions,
}

impl Subscription {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            representation: Value::Null,
            options: SyncOptions::new().without_query(),
        }
    }

    pub fn with_representation(mut self, representation: Value) -> Self {
        self.representation = representation;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }
}

impl Syncable for Subscription {
    fn url(&self) -> &str {
        &self.url
    }

    fn attributes(&self) -> &Value {
        &self.representation
    }
}

struct Poller {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Poller {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!("poll task panicked");
        }
    }
}

struct Feed {
    client: Arc<IcwsClient>,
    listeners: Arc<ListenerRegistry>,
}

impl Feed {
    async fn poll(&self) -> Result<usize, SyncError> {
        let feed = Collection::new(paths::MESSAGES);
        let body = self
            .client
            .fetch(&feed, SyncOptions::new().requires_session(true))
            .await?;

        let entries = match body {
            Value::Array(entries) => entries,
            _ => return Ok(0),
        };

        let mut dispatched = 0;
        for entry in entries {
            let message: Message = match serde_json::from_value(entry) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable feed entry");
                    continue;
                }
            };
            if !message.is_delta {
                trace!(message_type = %message.type_tag, "ignoring non-delta message");
                continue;
            }
            match self.dispatch(&message) {
                Ok(_) => dispatched += 1,
                Err(e) => debug!(error = %e, "message dropped"),
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&self, message: &Message) -> Result<usize, EventError> {
        let listeners = self.listeners.snapshot(&message.type_tag);
        if listeners.is_empty() {
            return Err(EventError::NoListeners(message.type_tag.clone()));
        }

        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.call(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(message_type = %message.type_tag, error = %e, "listener failed");
                }
                Err(_) => {
                    warn!(message_type = %message.type_tag, "listener panicked");
                }
            }
        }
        Ok(listeners.len())
    }

    async fn run(self: Arc<Self>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // The next tick is not taken until this one completes
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        result = self.poll() => match result {
                            Ok(count) => trace!(count, "poll tick completed"),
                            Err(e) => debug!(error = %e, "poll tick dropped"),
                        },
                    }
                }
            }
        }

        debug!("poll loop exited");
    }
}

/// Polls the message feed and fans messages out to listeners.
///
/// Stopped until [`start`](Self::start) is called; [`stop`](Self::stop)
/// returns it to that state. Dropping the dispatcher stops the poll task.
pub struct EventDispatcher {
    feed: Arc<Feed>,
    poller: Mutex<Option<Poller>>,
}

impl EventDispatcher {
    pub fn new(client: Arc<IcwsClient>) -> Self {
        Self {
            feed: Arc::new(Feed {
                client,
                listeners: Arc::new(ListenerRegistry::new()),
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &Arc<IcwsClient> {
        &self.feed.client
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.feed.listeners
    }

    /// Start polling every `interval`, or the configured poll interval.
    ///
    /// Clears all listeners. Calling it while polling restarts the loop.
    pub async fn start(&self, interval: Option<Duration>) -> Result<(), IcwsError> {
        let period = interval.unwrap_or(self.feed.client.config().poll_interval);
        if period.is_zero() {
            return Err(IcwsError::Config(
                "poll interval must be non-zero".to_string(),
            ));
        }

        let mut poller = self.poller.lock().await;
        if let Some(previous) = poller.take() {
            debug!("restarting poll loop");
            previous.stop().await;
        }
        self.feed.listeners.clear();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.feed).run(period, shutdown_rx));
        *poller = Some(Poller {
            shutdown_tx,
            handle,
        });

        info!(interval_ms = period.as_millis() as u64, "polling started");
        Ok(())
    }

    /// Stop polling and clear all listeners.
    pub async fn stop(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop().await;
            info!("polling stopped");
        }
        self.feed.listeners.clear();
    }

    pub async fn is_polling(&self) -> bool {
        self.poller.lock().await.is_some()
    }

    /// Run one poll tick now. Returns the number of messages dispatched.
    pub async fn poll(&self) -> Result<usize, SyncError> {
        self.feed.poll().await
    }

    /// Deliver `message` to every listener of its type, in registration
    /// order. A failing listener does not stop the others.
    pub fn dispatch(&self, message: &Message) -> Result<usize, EventError> {
        self.feed.dispatch(message)
    }

    pub fn add_listener(&self, message_type: &str, listener: Listener) {
        self.feed.listeners.add(message_type, listener);
    }

    pub fn remove_listener(&self, message_type: &str, listener: &Listener) -> bool {
        self.feed.listeners.remove(message_type, listener)
    }

    pub fn listener_count(&self, message_type: &str) -> usize {
        self.feed.listeners.len(message_type)
    }

    /// Create the server-side subscription, then register `listener` under
    /// every type. Nothing is registered if the server call fails.
    pub async fn subscribe(
        &self,
        message_types: &[&str],
        subscription: &Subscription,
        listener: Listener,
    ) -> Result<(), EventError> {
        if message_types.is_empty() {
            return Err(EventError::NoMessageTypes);
        }

        self.feed
            .client
            .update(subscription, subscription.options.clone())
            .await?;

        for message_type in message_types {
            self.feed.listeners.add(message_type, listener.clone());
        }
        info!(url = %subscription.url, types = ?message_types, "subscribed");
        Ok(())
    }

    /// Delete the server-side subscription, then remove the first
    /// registration of `listener` under every type. Nothing is removed if
    /// the server call fails.
    pub async fn unsubscribe(
        &self,
        message_types: &[&str],
        subscription: &Subscription,
        listener: &Listener,
    ) -> Result<(), EventError> {
        if message_types.is_empty() {
            return Err(EventError::NoMessageTypes);
        }

        self.feed
            .client
            .delete(subscription, subscription.options.clone())
            .await?;

        for message_type in message_types {
            self.feed.listeners.remove(message_type, listener);
        }
        info!(url = %subscription.url, types = ?message_types, "unsubscribed");
        Ok(())
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            let _ = poller.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use crate::request::{Method, WireRequest};
    use crate::transport::{RawResponse, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const STATUS_MESSAGE: &str = "urn:inin.com:status:userStatusMessage";

    fn offline_dispatcher() -> EventDispatcher {
        let client = IcwsClient::new(ClientConfig::new("localhost", 8018)).unwrap();
        EventDispatcher::new(Arc::new(client))
    }

    async fn connected_dispatcher(server: &MockServer) -> EventDispatcher {
        Mock::given(method("POST"))
            .and(path("/icws/connection"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"sessionId": "S1", "csrfToken": "T1"})),
            )
            .mount(server)
            .await;

        let addr = server.address();
        let client =
            IcwsClient::new(ClientConfig::new(addr.ip().to_string(), addr.port())).unwrap();
        client.connect("admin", "correct").await.unwrap();
        EventDispatcher::new(Arc::new(client))
    }

    fn recorder(log: &Arc<StdMutex<Vec<String>>>, name: &str) -> Listener {
        let log = Arc::clone(log);
        let name = name.to_string();
        Listener::new(move |message| {
            let id = message.field("id").cloned().unwrap_or(Value::Null);
            log.lock().unwrap().push(format!("{name}:{id}"));
            Ok(())
        })
    }

    #[test]
    fn test_message_deserialize() {
        let message: Message = serde_json::from_value(json!({
            "__type": STATUS_MESSAGE,
            "isDelta": true,
            "userStatusList": [{"userId": "alice"}]
        }))
        .unwrap();

        assert_eq!(message.type_tag, STATUS_MESSAGE);
        assert!(message.is_delta);
        assert_eq!(message.field("userStatusList"), Some(&json!([{"userId": "alice"}])));
    }

    #[test]
    fn test_message_delta_defaults_false() {
        let message: Message = serde_json::from_value(json!({"__type": "T"})).unwrap();
        assert!(!message.is_delta);
    }

    #[test]
    fn test_registry_removes_first_occurrence_only() {
        let registry = ListenerRegistry::new();
        let listener = Listener::new(|_| Ok(()));
        let other = Listener::new(|_| Ok(()));

        registry.add("T", listener.clone());
        registry.add("T", other.clone());
        registry.add("T", listener.clone());

        assert!(registry.remove("T", &listener));
        let remaining = registry.snapshot("T");
        assert_eq!(remaining.len(), 2);
        assert!(remaining[0].same(&other));
        assert!(remaining[1].same(&listener));

        assert!(!registry.remove("U", &listener));
        assert!(!registry.remove("T", &Listener::new(|_| Ok(()))));
    }

    #[tokio::test]
    async fn test_dispatch_fan_out_in_order() {
        let dispatcher = offline_dispatcher();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for name in ["L1", "L2", "L3"] {
            dispatcher.add_listener("T", recorder(&log, name));
        }

        let count = dispatcher
            .dispatch(&Message::new("T", true).with_field("id", json!(1)))
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(*log.lock().unwrap(), vec!["L1:1", "L2:1", "L3:1"]);
    }

    #[tokio::test]
    async fn test_dispatch_without_listeners() {
        let dispatcher = offline_dispatcher();
        let err = dispatcher.dispatch(&Message::new("T", true)).unwrap_err();
        assert!(matches!(err, EventError::NoListeners(t) if t == "T"));
    }

    #[tokio::test]
    async fn test_failing_listeners_are_isolated() {
        let dispatcher = offline_dispatcher();
        let log = Arc::new(StdMutex::new(Vec::new()));

        dispatcher.add_listener("T", Listener::new(|_| Err("boom".to_string())));
        dispatcher.add_listener("T", Listener::new(|_| panic!("listener bug")));
        dispatcher.add_listener("T", recorder(&log, "L3"));

        let count = dispatcher.dispatch(&Message::new("T", true)).unwrap();

        assert_eq!(count, 3);
        assert_eq!(*log.lock().unwrap(), vec!["L3:null"]);
    }

    #[tokio::test]
    async fn test_removal_during_dispatch_uses_snapshot() {
        let dispatcher = offline_dispatcher();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let l2 = recorder(&log, "L2");
        let l1 = {
            let registry = Arc::clone(dispatcher.listeners());
            let l2 = l2.clone();
            let log = Arc::clone(&log);
            Listener::new(move |_| {
                log.lock().unwrap().push("L1".to_string());
                registry.remove("T", &l2);
                Ok(())
            })
        };
        dispatcher.add_listener("T", l1);
        dispatcher.add_listener("T", l2);
        dispatcher.add_listener("T", recorder(&log, "L3"));

        dispatcher.dispatch(&Message::new("T", true)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["L1", "L2:null", "L3:null"]);

        log.lock().unwrap().clear();
        dispatcher.dispatch(&Message::new("T", true)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["L1", "L3:null"]);
    }

    #[tokio::test]
    async fn test_poll_dispatches_only_deltas() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("GET"))
            .and(path("/icws/S1/messaging/messages"))
            .and(query_param("select", "*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"__type": "StatusMessage", "isDelta": true, "id": 7},
                {"__type": "StatusMessage", "isDelta": false, "id": 8}
            ])))
            .mount(&server)
            .await;

        let log = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.add_listener("StatusMessage", recorder(&log, "L"));

        let count = dispatcher.poll().await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(*log.lock().unwrap(), vec!["L:7"]);
    }

    #[tokio::test]
    async fn test_poll_skips_unreadable_entries() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("GET"))
            .and(path("/icws/S1/messaging/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"isDelta": true, "id": 1},
                "garbage",
                {"__type": "T", "isDelta": true, "id": 2}
            ])))
            .mount(&server)
            .await;

        let log = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.add_listener("T", recorder(&log, "L"));

        assert_eq!(dispatcher.poll().await.unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["L:2"]);
    }

    #[tokio::test]
    async fn test_poll_requires_session() {
        let dispatcher = offline_dispatcher();
        let err = dispatcher.poll().await.unwrap_err();
        assert!(matches!(err, SyncError::Local(IcwsError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_subscribe_registers_after_success() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("PUT"))
            .and(path("/icws/S1/messaging/subscriptions/status/user-statuses"))
            .and(body_json(json!({"userIds": ["alice"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let subscription = Subscription::new(paths::subscription("status/user-statuses"))
            .with_representation(json!({"userIds": ["alice"]}));
        let listener = Listener::new(|_| Ok(()));

        dispatcher
            .subscribe(&[STATUS_MESSAGE, "Other"], &subscription, listener)
            .await
            .unwrap();

        assert_eq!(dispatcher.listener_count(STATUS_MESSAGE), 1);
        assert_eq!(dispatcher.listener_count("Other"), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_registry_unchanged() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errorId": "error.request.invalidRepresentation"
            })))
            .mount(&server)
            .await;

        let subscription = Subscription::new("/messaging/subscriptions/queues/q1");
        let err = dispatcher
            .subscribe(&["T"], &subscription, Listener::new(|_| Ok(())))
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Sync(ref e) if e.status() == Some(400)));
        assert!(dispatcher.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_message_types() {
        let dispatcher = offline_dispatcher();
        let err = dispatcher
            .subscribe(&[], &Subscription::new("/x"), Listener::new(|_| Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::NoMessageTypes));
    }

    #[tokio::test]
    async fn test_subscription_options_are_sent() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("PUT"))
            .and(path("/icws/S1/messaging/subscriptions/queues/q1/agents"))
            .and(query_param("rightsFilter", "view"))
            .and(header("X-Trace", "abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/icws/S1/messaging/subscriptions/queues/q1/agents"))
            .and(query_param("rightsFilter", "view"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let subscription = Subscription::new("/messaging/subscriptions/queues/q1").with_options(
            SyncOptions::new()
                .segment("agents")
                .query("rightsFilter", "view")
                .header("X-Trace", "abc"),
        );
        let listener = Listener::new(|_| Ok(()));

        dispatcher
            .subscribe(&["T"], &subscription, listener.clone())
            .await
            .unwrap();
        dispatcher
            .unsubscribe(&["T"], &subscription, &listener)
            .await
            .unwrap();
        assert_eq!(dispatcher.listener_count("T"), 0);
    }

    #[tokio::test]
    async fn test_subscription_defaults_to_no_query() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("PUT"))
            .and(path("/icws/S1/messaging/subscriptions/queues/q1"))
            .and(|request: &Request| request.url.query().is_none())
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        dispatcher
            .subscribe(
                &["T"],
                &Subscription::new("/messaging/subscriptions/queues/q1"),
                Listener::new(|_| Ok(())),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_atomicity() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;
        let subscription = Subscription::new("/messaging/subscriptions/queues/q1");
        let listener = Listener::new(|_| Ok(()));
        dispatcher.add_listener("T", listener.clone());

        Mock::given(method("DELETE"))
            .and(path("/icws/S1/messaging/subscriptions/queues/q1"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        assert!(
            dispatcher
                .unsubscribe(&["T"], &subscription, &listener)
                .await
                .is_err()
        );
        assert_eq!(dispatcher.listener_count("T"), 1);

        Mock::given(method("DELETE"))
            .and(path("/icws/S1/messaging/subscriptions/queues/q1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        dispatcher
            .unsubscribe(&["T"], &subscription, &listener)
            .await
            .unwrap();
        assert_eq!(dispatcher.listener_count("T"), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_clear_listeners() {
        let dispatcher = offline_dispatcher();
        dispatcher.add_listener("T", Listener::new(|_| Ok(())));

        dispatcher
            .start(Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(dispatcher.is_polling().await);
        assert_eq!(dispatcher.listener_count("T"), 0);

        dispatcher.add_listener("T", Listener::new(|_| Ok(())));
        dispatcher
            .start(Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(dispatcher.listener_count("T"), 0);

        dispatcher.add_listener("T", Listener::new(|_| Ok(())));
        dispatcher.stop().await;
        assert!(!dispatcher.is_polling().await);
        assert_eq!(dispatcher.listener_count("T"), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_interval() {
        let dispatcher = offline_dispatcher();
        assert!(matches!(
            dispatcher.start(Some(Duration::ZERO)).await,
            Err(IcwsError::Config(_))
        ));
        assert!(!dispatcher.is_polling().await);
    }

    #[tokio::test]
    async fn test_poll_loop_delivers_messages() {
        let server = MockServer::start().await;
        let dispatcher = connected_dispatcher(&server).await;

        Mock::given(method("GET"))
            .and(path("/icws/S1/messaging/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"__type": "T", "isDelta": true, "id": 1}])),
            )
            .mount(&server)
            .await;

        dispatcher
            .start(Some(Duration::from_millis(20)))
            .await
            .unwrap();

        let log = Arc::new(StdMutex::new(Vec::new()));
        dispatcher.add_listener("T", recorder(&log, "L"));

        let mut delivered = false;
        for _ in 0..100 {
            if !log.lock().unwrap().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        dispatcher.stop().await;

        assert!(delivered);
    }

    /// Answers logins immediately and holds every feed read for `delay`,
    /// tracking how many reads are outstanding at once.
    struct SlowFeed {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for SlowFeed {
        async fn send(&self, request: &WireRequest) -> RawResponse {
            if request.method == Method::Post {
                return RawResponse {
                    status: 201,
                    body: r#"{"sessionId":"S1","csrfToken":"T1"}"#.to_string(),
                    ..RawResponse::default()
                };
            }

            self.reads.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            RawResponse {
                status: 200,
                body: "[]".to_string(),
                ..RawResponse::default()
            }
        }
    }

    #[tokio::test]
    async fn test_slow_feed_never_overlaps_ticks() {
        let transport = Arc::new(SlowFeed {
            delay: Duration::from_millis(100),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        });
        let client = IcwsClient::with_transport(
            ClientConfig::new("cic.example.com", 8018),
            transport.clone(),
        );
        client.connect("admin", "correct").await.unwrap();
        let dispatcher = EventDispatcher::new(Arc::new(client));

        dispatcher
            .start(Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        dispatcher.stop().await;

        assert!(transport.reads.load(Ordering::SeqCst) >= 2);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
