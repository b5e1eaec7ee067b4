//! Device definitions.
//!
//! A [`DeviceDefinition`] is the narrow interface between the declarative
//! assembly layer (wherever the application wires concrete callbacks to a
//! concrete transport) and the execution core: a named set of properties, a
//! named set of actions, the lifecycle callbacks, and the transport resource
//! id. The core treats every callback as an opaque callable.
//!
//! Presentation layers consume read-only snapshots ([`DeviceDefinition::
//! property_snapshots`], [`DeviceDefinition::action_snapshots`]) rather than
//! the typed property handles themselves.

use std::sync::Arc;

use futures::future::BoxFuture;
use log::debug;
use serde::Serialize;

use crate::action::DeviceAction;
use crate::error::InstrResult;
use crate::property::PropertyBase;
use crate::transport::SessionHandle;

/// Callback run after the transport session opens; receives the session so
/// the device assembly can stash it for its delegates.
pub type InitializeCallback =
    Arc<dyn Fn(SessionHandle) -> BoxFuture<'static, InstrResult<()>> + Send + Sync>;

/// Callback run while disconnecting, before the session closes.
pub type DeinitializeCallback = Arc<dyn Fn() -> BoxFuture<'static, InstrResult<()>> + Send + Sync>;

/// Callback producing the device's identification string.
pub type IdentifyCallback = Arc<dyn Fn() -> BoxFuture<'static, InstrResult<String>> + Send + Sync>;

/// Read-only view of one property for presentation layers.
#[derive(Clone, Debug, Serialize)]
pub struct PropertySnapshot {
    /// Property name.
    pub name: String,
    /// Cached value rendered through the property's codec.
    pub value: String,
    /// Whether the property has a real getter.
    pub can_read: bool,
    /// Whether the property has a real setter.
    pub can_write: bool,
}

/// Read-only view of one action for presentation layers.
#[derive(Clone, Debug, Serialize)]
pub struct ActionSnapshot {
    /// Action name.
    pub name: String,
    /// Whether an invocation would start a fresh run right now.
    pub invokable: bool,
}

/// Assembled device: properties, actions, lifecycle callbacks, resource id.
pub struct DeviceDefinition {
    name: String,
    resource: String,
    properties: Vec<Arc<dyn PropertyBase>>,
    actions: Vec<Arc<DeviceAction>>,
    initialize: Option<InitializeCallback>,
    deinitialize: Option<DeinitializeCallback>,
    identify: Option<IdentifyCallback>,
}

impl DeviceDefinition {
    /// Start assembling a device.
    pub fn builder(name: impl Into<String>, resource: impl Into<String>) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            resource: resource.into(),
            properties: Vec::new(),
            actions: Vec::new(),
            initialize: None,
            deinitialize: None,
            identify: None,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport resource identifier this device connects through.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Declared properties, in declaration order.
    pub fn properties(&self) -> &[Arc<dyn PropertyBase>] {
        &self.properties
    }

    /// Declared actions, in declaration order.
    pub fn actions(&self) -> &[Arc<DeviceAction>] {
        &self.actions
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Arc<dyn PropertyBase>> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Look up an action by name.
    pub fn action(&self, name: &str) -> Option<&Arc<DeviceAction>> {
        self.actions.iter().find(|a| a.name() == name)
    }

    /// The initialize callback, if one was supplied.
    pub fn initialize(&self) -> Option<&InitializeCallback> {
        self.initialize.as_ref()
    }

    /// The deinitialize callback, if one was supplied.
    pub fn deinitialize(&self) -> Option<&DeinitializeCallback> {
        self.deinitialize.as_ref()
    }

    /// The identify callback, if one was supplied.
    pub fn identify(&self) -> Option<&IdentifyCallback> {
        self.identify.as_ref()
    }

    /// Join every property lane and every action, swallowing failures.
    ///
    /// Used by the controller while disconnecting so the session never closes
    /// under in-flight device calls.
    pub async fn wait_for_idle(&self) {
        for prop in &self.properties {
            prop.join_read().await;
            prop.join_write().await;
        }
        for action in &self.actions {
            action.join().await;
        }
        debug!("device '{}' lanes drained", self.name);
    }

    /// Property name → cached value snapshots, in declaration order.
    pub fn property_snapshots(&self) -> Vec<PropertySnapshot> {
        self.properties
            .iter()
            .map(|p| PropertySnapshot {
                name: p.name().to_string(),
                value: p.value_string(),
                can_read: p.can_read(),
                can_write: p.can_write(),
            })
            .collect()
    }

    /// Action name → invokability snapshots, in declaration order.
    pub fn action_snapshots(&self) -> Vec<ActionSnapshot> {
        self.actions
            .iter()
            .map(|a| ActionSnapshot {
                name: a.name().to_string(),
                invokable: !a.is_running(),
            })
            .collect()
    }

    /// All cached values as one JSON object, keyed by property name.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .properties
            .iter()
            .map(|p| (p.name().to_string(), p.value_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Fluent assembly of a [`DeviceDefinition`].
pub struct DeviceBuilder {
    name: String,
    resource: String,
    properties: Vec<Arc<dyn PropertyBase>>,
    actions: Vec<Arc<DeviceAction>>,
    initialize: Option<InitializeCallback>,
    deinitialize: Option<DeinitializeCallback>,
    identify: Option<IdentifyCallback>,
}

impl DeviceBuilder {
    /// Declare a property.
    pub fn property(mut self, property: impl PropertyBase + 'static) -> Self {
        self.properties.push(Arc::new(property));
        self
    }

    /// Declare an already-shared property handle.
    pub fn property_arc(mut self, property: Arc<dyn PropertyBase>) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare an action.
    pub fn action(mut self, action: DeviceAction) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    /// Set the initialize callback.
    pub fn on_initialize(
        mut self,
        callback: impl Fn(SessionHandle) -> BoxFuture<'static, InstrResult<()>> + Send + Sync + 'static,
    ) -> Self {
        self.initialize = Some(Arc::new(callback));
        self
    }

    /// Set the deinitialize callback.
    pub fn on_deinitialize(
        mut self,
        callback: impl Fn() -> BoxFuture<'static, InstrResult<()>> + Send + Sync + 'static,
    ) -> Self {
        self.deinitialize = Some(Arc::new(callback));
        self
    }

    /// Set the identification callback.
    pub fn on_identify(
        mut self,
        callback: impl Fn() -> BoxFuture<'static, InstrResult<String>> + Send + Sync + 'static,
    ) -> Self {
        self.identify = Some(Arc::new(callback));
        self
    }

    /// Set the reset callback.
    ///
    /// Reset is an ordinary operation from the execution core's point of
    /// view, so it is registered as a [`DeviceAction`] named `"reset"`.
    pub fn on_reset(
        self,
        callback: impl Fn() -> BoxFuture<'static, InstrResult<()>> + Send + Sync + 'static,
    ) -> Self {
        self.action(DeviceAction::new("reset", callback))
    }

    /// Finish assembly.
    pub fn build(self) -> DeviceDefinition {
        DeviceDefinition {
            name: self.name,
            resource: self.resource,
            properties: self.properties,
            actions: self.actions,
            initialize: self.initialize,
            deinitialize: self.deinitialize,
            identify: self.identify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::AsyncProperty;

    fn sample_device() -> DeviceDefinition {
        DeviceDefinition::builder("pm101", "MOCK::INSTR0")
            .property(
                AsyncProperty::<f64>::new("power_mw").with_getter(|| Box::pin(async { Ok(1.5) })),
            )
            .property(
                AsyncProperty::<u32>::new("averaging")
                    .with_setter(|_| Box::pin(async { Ok(()) })),
            )
            .action(DeviceAction::new("zero", || Box::pin(async { Ok(()) })))
            .on_reset(|| Box::pin(async { Ok(()) }))
            .build()
    }

    #[tokio::test]
    async fn test_builder_assembles_names_in_order() {
        let device = sample_device();
        assert_eq!(device.name(), "pm101");
        assert_eq!(device.resource(), "MOCK::INSTR0");

        let names: Vec<_> = device.properties().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["power_mw", "averaging"]);

        let actions: Vec<_> = device.actions().iter().map(|a| a.name()).collect();
        assert_eq!(actions, vec!["zero", "reset"]);
        assert!(device.action("reset").is_some());
        assert!(device.property("missing").is_none());
    }

    #[tokio::test]
    async fn test_snapshots_render_cached_values() {
        let device = sample_device();

        let power = device.property("power_mw").expect("declared");
        power.update().await.expect("read succeeds");

        let snapshots = device.property_snapshots();
        assert_eq!(snapshots[0].name, "power_mw");
        assert_eq!(snapshots[0].value, "1.5");
        assert!(snapshots[0].can_read);
        assert!(!snapshots[0].can_write);
        // Write-only property renders its zero value.
        assert_eq!(snapshots[1].value, "0");
        assert!(snapshots[1].can_write);

        let json = device.snapshot_json();
        assert_eq!(json["power_mw"], serde_json::json!(1.5));

        let actions = device.action_snapshots();
        assert!(actions.iter().all(|a| a.invokable));
    }

    #[tokio::test]
    async fn test_wait_for_idle_resolves_on_quiet_device() {
        let device = sample_device();
        device.wait_for_idle().await;
    }
}
