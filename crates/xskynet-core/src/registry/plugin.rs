//! Plugins: named, versioned bundles of step handlers and bus integrations.

use std::sync::Arc;

use crate::event::bus::{EventBus, Subscription};

use super::handler::{BoxStepHandler, StepHandler};

/// An event-subscribing collaborator shipped inside a plugin (e.g. a chat
/// transport that forwards `plan.failed` notifications).
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to `bus` and return the subscriptions created.
    fn attach(&self, bus: &EventBus) -> Vec<Subscription>;
}

/// Diagnostic view of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    /// Kinds declared by the plugin's handlers, in declaration order.
    pub kinds: Vec<String>,
    pub integrations: Vec<String>,
}

/// A bundle registered as a unit via `ExecutorRegistry::register`.
pub struct Plugin {
    name: String,
    version: String,
    handlers: Vec<BoxStepHandler>,
    integrations: Vec<Arc<dyn Integration>>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            handlers: Vec::new(),
            integrations: Vec::new(),
        }
    }

    pub fn with_handler<H: StepHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(BoxStepHandler::new(handler));
        self
    }

    pub fn with_boxed_handler(mut self, handler: BoxStepHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_integration<I: Integration + 'static>(mut self, integration: I) -> Self {
        self.integrations.push(Arc::new(integration));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn handlers(&self) -> &[BoxStepHandler] {
        &self.handlers
    }

    pub fn integrations(&self) -> &[Arc<dyn Integration>] {
        &self.integrations
    }

    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            kinds: self.handlers.iter().map(|h| h.kind().to_string()).collect(),
            integrations: self
                .integrations
                .iter()
                .map(|i| i.name().to_string())
                .collect(),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("handlers", &self.handlers)
            .field("integrations", &self.integrations.len())
            .finish()
    }
}
