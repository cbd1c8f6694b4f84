use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display};
use tracing::{error, info, warn};
use wiseflow_plugin::{Event, EventType, PluginError, PluginMetadata};

use crate::{event_bus::EventBus, logger::LIFECYCLE_TARGET, util::panic_message};

/// Lifecycle notifications fired by the plugin manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    Load,
    Initialize,
    Activate,
    Deactivate,
    Shutdown,
    Error,
}

/// Handle for removing a hook again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// What a hook receives.
#[derive(Debug, Clone)]
pub struct LifecycleNotice<'a> {
    pub event: LifecycleEvent,
    pub metadata: &'a PluginMetadata,
    pub error: Option<&'a PluginError>,
}

pub type LifecycleHook = dyn Fn(&LifecycleNotice<'_>) -> anyhow::Result<()> + Send + Sync;

/// Fan-out of plugin transitions to local hooks and to the event bus.
pub struct PluginLifecycleManager {
    bus: EventBus,
    hooks: Mutex<HashMap<LifecycleEvent, Vec<(HookId, Arc<LifecycleHook>)>>>,
    next_id: AtomicU64,
}

impl PluginLifecycleManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            hooks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register_hook<F>(&self, event: LifecycleEvent, hook: F) -> HookId
    where
        F: Fn(&LifecycleNotice<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.hooks.lock().entry(event).or_default().push((id, Arc::new(hook)));
        id
    }

    pub fn unregister_hook(&self, event: LifecycleEvent, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        let Some(list) = hooks.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        before != list.len()
    }

    pub fn on_plugin_load(&self, metadata: &PluginMetadata) {
        self.fire(LifecycleEvent::Load, metadata, None);
    }

    pub fn on_plugin_initialize(&self, metadata: &PluginMetadata) {
        self.fire(LifecycleEvent::Initialize, metadata, None);
    }

    pub fn on_plugin_activate(&self, metadata: &PluginMetadata) {
        self.fire(LifecycleEvent::Activate, metadata, None);
    }

    pub fn on_plugin_deactivate(&self, metadata: &PluginMetadata) {
        self.fire(LifecycleEvent::Deactivate, metadata, None);
    }

    pub fn on_plugin_shutdown(&self, metadata: &PluginMetadata) {
        self.fire(LifecycleEvent::Shutdown, metadata, None);
    }

    pub fn on_plugin_error(&self, metadata: &PluginMetadata, error: &PluginError) {
        self.fire(LifecycleEvent::Error, metadata, Some(error));
    }

    fn fire(&self, event: LifecycleEvent, metadata: &PluginMetadata, error: Option<&PluginError>) {
        // 1) local hooks, snapshot so a hook may (un)register others
        let hooks: Vec<_> = self
            .hooks
            .lock()
            .get(&event)
            .map(|l| l.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        let notice = LifecycleNotice { event, metadata, error };
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(&notice))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(plugin = %metadata.name, %event, "lifecycle hook failed: {e:#}"),
                Err(p) => warn!(
                    plugin = %metadata.name,
                    %event,
                    "lifecycle hook panicked: {}",
                    panic_message(p.as_ref())
                ),
            }
        }

        // 2) structured record
        match error {
            Some(err) => error!(
                target: LIFECYCLE_TARGET,
                action = event.as_ref(),
                plugin = %metadata.name,
                version = %metadata.version,
                error_type = %err.type_name(),
                "{err}"
            ),
            None => info!(
                target: LIFECYCLE_TARGET,
                action = event.as_ref(),
                plugin = %metadata.name,
                version = %metadata.version,
                "plugin {}", event
            ),
        }

        // 3) system-wide notification
        if let Err(e) = self.bus.publish_sync(lifecycle_event(event, metadata, error)) {
            warn!(plugin = %metadata.name, %event, "lifecycle event delivery: {e}");
        }
    }
}

impl fmt::Debug for PluginLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<LifecycleEvent, usize> =
            self.hooks.lock().iter().map(|(e, l)| (*e, l.len())).collect();
        f.debug_struct("PluginLifecycleManager").field("hooks", &counts).finish()
    }
}

/// The `Custom` event published for a transition.
pub fn lifecycle_event(event: LifecycleEvent, metadata: &PluginMetadata, error: Option<&PluginError>) -> Event {
    let mut data = Map::new();
    data.insert("action".into(), json!(event.as_ref()));
    data.insert("plugin_name".into(), json!(metadata.name));
    data.insert("plugin_version".into(), json!(metadata.version));
    data.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    if let Some(err) = error {
        data.insert("error".into(), Value::String(err.to_string()));
        data.insert("error_type".into(), Value::String(err.type_name()));
    }
    Event::new(EventType::Custom, data).with_source("plugin_lifecycle")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collect(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_fn(Some(EventType::Custom), None, move |e| {
            s.lock().push(e.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn bad_hooks_do_not_block_others() {
        let bus = EventBus::default();
        let seen = collect(&bus);
        let lm = PluginLifecycleManager::new(bus);
        let calls = Arc::new(AtomicUsize::new(0));

        lm.register_hook(LifecycleEvent::Initialize, |_| anyhow::bail!("hook error"));
        lm.register_hook(LifecycleEvent::Initialize, |_| panic!("hook panic"));
        let c = calls.clone();
        lm.register_hook(LifecycleEvent::Initialize, move |n| {
            assert_eq!(n.metadata.name, "demo");
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        lm.on_plugin_initialize(&PluginMetadata::new("demo", "0.3.1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_str("action"), Some("initialize"));
        assert_eq!(events[0].get_str("plugin_name"), Some("demo"));
        assert_eq!(events[0].get_str("plugin_version"), Some("0.3.1"));
        assert!(events[0].get_str("timestamp").is_some());
        assert!(events[0].get("error").is_none());
    }

    #[test]
    fn error_events_carry_type_and_message() {
        let bus = EventBus::default();
        let seen = collect(&bus);
        let lm = PluginLifecycleManager::new(bus);
        let err = PluginError::Security {
            plugin: "evil".into(),
            reason: "imports libc".into(),
        };
        lm.on_plugin_error(&PluginMetadata::new("evil", "1.0.0"), &err);

        let events = seen.lock();
        assert_eq!(events[0].get_str("action"), Some("error"));
        assert_eq!(events[0].get_str("error_type"), Some("security"));
        assert!(events[0].get_str("error").unwrap().contains("imports libc"));
    }

    #[test]
    fn hooks_can_be_removed() {
        let lm = PluginLifecycleManager::new(EventBus::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = lm.register_hook(LifecycleEvent::Shutdown, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let meta = PluginMetadata::new("demo", "1.0.0");
        lm.on_plugin_shutdown(&meta);
        assert!(lm.unregister_hook(LifecycleEvent::Shutdown, id));
        assert!(!lm.unregister_hook(LifecycleEvent::Shutdown, id));
        assert!(!lm.unregister_hook(LifecycleEvent::Load, id));
        lm.on_plugin_shutdown(&meta);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
