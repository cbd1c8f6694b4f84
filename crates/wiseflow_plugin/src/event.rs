use std::{fmt, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// The closed set of event kinds that travel over the bus.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
    Display, EnumIter, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    SystemStartup,
    SystemShutdown,
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    FocusPointCreated,
    FocusPointUpdated,
    FocusPointDeleted,
    DataCollected,
    DataProcessed,
    AnalysisCompleted,
    InsightGenerated,
    KnowledgeGraphUpdated,
    ConnectorStarted,
    ConnectorCompleted,
    ConnectorFailed,
    PluginLoaded,
    PluginUnloaded,
    PluginFailed,
    ResourceWarning,
    ResourceCritical,
    ConfigChanged,
    Custom,
}

/// An immutable notification record.
///
/// `event_type` and `id` are fixed at construction; the builder methods only
/// apply while the value is still owned by its creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    event_type: EventType,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    timestamp: DateTime<Utc>,
    id: String,
}

impl Event {
    pub fn new(event_type: EventType, data: Map<String, Value>) -> Self {
        Self {
            event_type,
            data,
            source: None,
            timestamp: Utc::now(),
            id: Uuid::new_v4().to_string(),
        }
    }

    /// An event with an empty payload.
    pub fn empty(event_type: EventType) -> Self {
        Self::new(event_type, Map::new())
    }

    /// Builds the payload from a `json!({...})` object. Non-object values
    /// are stored under the `value` key.
    pub fn from_json(event_type: EventType, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(event_type, data)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Convenience for string payload values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle returned by a subscription, used to remove exactly that registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Signature of a subscriber that runs inline on the publishing thread.
pub type SyncEventFn = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;

/// A subscriber that is scheduled on the async runtime and never blocks the
/// publisher.
#[async_trait]
pub trait AsyncEventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct FnHandler {
    f: Box<dyn Fn(Event) -> BoxedHandlerFuture + Send + Sync>,
}

#[async_trait]
impl AsyncEventHandler for FnHandler {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// A subscriber, tagged with how it has to be executed.
#[derive(Clone)]
pub enum EventCallback {
    Sync(Arc<SyncEventFn>),
    Async(Arc<dyn AsyncEventHandler>),
}

impl EventCallback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        EventCallback::Sync(Arc::new(f))
    }

    /// Wraps an async closure: `EventCallback::from_async(|ev| async move { .. })`.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = FnHandler {
            f: Box::new(move |event| Box::pin(f(event)) as BoxedHandlerFuture),
        };
        EventCallback::Async(Arc::new(handler))
    }

    pub fn handler(handler: Arc<dyn AsyncEventHandler>) -> Self {
        EventCallback::Async(handler)
    }

    pub fn is_async(&self) -> bool {
        matches!(self, EventCallback::Async(_))
    }

    /// Identity comparison: two callbacks are the same when they share the
    /// same allocation.
    pub fn same_as(&self, other: &EventCallback) -> bool {
        match (self, other) {
            (EventCallback::Sync(a), EventCallback::Sync(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (EventCallback::Async(a), EventCallback::Async(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCallback::Sync(_) => f.write_str("EventCallback::Sync(<fn>)"),
            EventCallback::Async(_) => f.write_str("EventCallback::Async(<handler>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn new_event_gets_unique_id_and_timestamp() {
        let a = Event::empty(EventType::TaskCreated);
        let b = Event::empty(EventType::TaskCreated);
        assert_ne!(a.id(), b.id());
        assert!(a.timestamp() <= Utc::now());
        assert!(a.source().is_none());
    }

    #[test]
    fn from_json_wraps_scalars() {
        let ev = Event::from_json(EventType::Custom, json!(42)).with_source("tests");
        assert_eq!(ev.get("value"), Some(&json!(42)));
        assert_eq!(ev.source(), Some("tests"));

        let ev = Event::from_json(EventType::Custom, json!({"action": "ping"}));
        assert_eq!(ev.get_str("action"), Some("ping"));
    }

    #[test]
    fn event_type_names_are_snake_case() {
        assert_eq!(EventType::PluginLoaded.to_string(), "plugin_loaded");
        assert_eq!(EventType::from_str("config_changed").unwrap(), EventType::ConfigChanged);
        assert!(EventType::iter().count() > 20);
    }

    #[test]
    fn callback_identity() {
        let a = EventCallback::sync(|_| Ok(()));
        let b = a.clone();
        let c = EventCallback::sync(|_| Ok(()));
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert!(!a.is_async());
    }

    #[tokio::test]
    async fn async_closure_callback_runs() {
        let cb = EventCallback::from_async(|ev: Event| async move {
            anyhow::ensure!(ev.event_type() == EventType::Custom, "wrong type");
            Ok(())
        });
        match cb {
            EventCallback::Async(h) => {
                h.handle(Event::empty(EventType::Custom)).await.unwrap();
                assert!(h.handle(Event::empty(EventType::TaskFailed)).await.is_err());
            }
            EventCallback::Sync(_) => panic!("expected async callback"),
        }
    }
}
