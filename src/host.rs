use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::warn;
use wiseflow_plugin::{
    Event, EventCallback, EventType, PluginError, PluginHost, Resource, ResourceId, SubscriptionId,
};

use crate::{event_bus::EventBus, resources::ResourceManager};

/// What plugins see of the process: the bus and the resource tracker.
/// Subscriptions are tagged with the owning plugin so they can be dropped
/// in one sweep at shutdown.
///
/// Each live instance gets its own host from [`ManagerHost::for_instance`].
/// Once revoked, that host refuses to publish and undoes any subscription or
/// resource registered through it, so a plugin thread outliving its instance
/// cannot leave anything behind.
#[derive(Debug, Clone)]
pub struct ManagerHost {
    bus: EventBus,
    resources: Arc<ResourceManager>,
    revoked: Arc<AtomicBool>,
}

impl ManagerHost {
    pub fn new(bus: EventBus, resources: Arc<ResourceManager>) -> Self {
        Self {
            bus,
            resources,
            revoked: Arc::default(),
        }
    }

    /// Same bus and tracker, fresh revocation flag.
    pub fn for_instance(&self) -> Self {
        Self::new(self.bus.clone(), self.resources.clone())
    }

    /// Must be called before the owner's sweep so that registrations racing
    /// the sweep are either swept or undone by themselves.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl PluginHost for ManagerHost {
    fn publish(&self, event: Event) -> anyhow::Result<()> {
        if self.is_revoked() {
            return Err(PluginError::Permission {
                plugin: event.source().unwrap_or_default().to_string(),
                permission: "publish".into(),
            }
            .into());
        }
        self.bus.publish_sync(event)?;
        Ok(())
    }

    fn subscribe(&self, owner: &str, event_type: Option<EventType>, callback: EventCallback) -> SubscriptionId {
        let id = self.bus.subscribe(event_type, callback, Some(owner));
        if self.is_revoked() {
            warn!(plugin = owner, subscription = %id, "host revoked, dropping subscription");
            self.bus.unsubscribe_id(id);
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe_id(id)
    }

    fn register_resource(&self, owner: &str, kind: &str, resource: Box<dyn Resource>) -> ResourceId {
        let id = self.resources.register(owner, kind, resource);
        if self.is_revoked() {
            warn!(plugin = owner, resource = %id, "host revoked, releasing resource");
            // the owner's sweep may already have taken it
            let _ = self.resources.release(owner, id);
        }
        id
    }

    fn release_resource(&self, owner: &str, id: ResourceId) -> Result<(), PluginError> {
        self.resources.release(owner, id)
    }
}
