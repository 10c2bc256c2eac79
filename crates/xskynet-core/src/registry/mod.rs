//! Executor registry: binds step kinds to the handlers that execute them.
//!
//! - `handler` -- `StepHandler` trait and the type-erased `BoxStepHandler`
//! - `plugin` -- `Plugin` bundles of handlers and bus integrations
//!
//! Registration happens before any run starts. The registry is mutated
//! through `&mut self` only, so once it is shared with an executor behind an
//! `Arc` it can no longer change.

pub mod handler;
pub mod plugin;

use std::borrow::Borrow;
use std::collections::HashMap;

use thiserror::Error;
use xskynet_types::plan::Plan;

use crate::event::bus::{EventBus, Subscription};

pub use handler::{BoxStepHandler, StepHandler, StepHandlerDyn};
pub use plugin::{Integration, Plugin, PluginDescriptor};

/// Errors raised while registering a plugin.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("plugin name must not be empty")]
    EmptyPluginName,

    #[error("invalid step kind '{kind}' in plugin '{plugin}': {reason}")]
    InvalidKind {
        plugin: String,
        kind: String,
        reason: &'static str,
    },
}

/// A validated step kind: non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKind(String);

impl StepKind {
    pub fn parse(kind: &str) -> Result<Self, &'static str> {
        if kind.is_empty() {
            return Err("kind must not be empty");
        }
        if kind.chars().any(char::is_whitespace) {
            return Err("kind must not contain whitespace");
        }
        Ok(Self(kind.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StepKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Binding {
    handler: BoxStepHandler,
    plugin: String,
}

/// Registry of plugins and the kind-indexed handler table.
#[derive(Default)]
pub struct ExecutorRegistry {
    plugins: Vec<Plugin>,
    bindings: HashMap<StepKind, Binding>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every handler of `plugin`, indexed by its own kind.
    ///
    /// Kinds are validated up front; an invalid kind rejects the whole plugin
    /// without binding anything. A kind that is already bound is rebound to
    /// the new handler (last write wins); the earlier plugin stays listed.
    pub fn register(&mut self, plugin: Plugin) -> Result<(), RegistryError> {
        if plugin.name().trim().is_empty() {
            return Err(RegistryError::EmptyPluginName);
        }

        let kinds = plugin
            .handlers()
            .iter()
            .map(|h| {
                StepKind::parse(h.kind()).map_err(|reason| RegistryError::InvalidKind {
                    plugin: plugin.name().to_string(),
                    kind: h.kind().to_string(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (kind, handler) in kinds.into_iter().zip(plugin.handlers().iter().cloned()) {
            let binding = Binding {
                handler,
                plugin: plugin.name().to_string(),
            };
            if let Some(previous) = self.bindings.insert(kind.clone(), binding) {
                tracing::warn!(
                    kind = kind.as_str(),
                    previous = previous.plugin.as_str(),
                    plugin = plugin.name(),
                    "step kind rebound to a later plugin"
                );
            }
        }

        tracing::debug!(
            plugin = plugin.name(),
            version = plugin.version(),
            handlers = plugin.handlers().len(),
            "registered plugin"
        );
        self.plugins.push(plugin);
        Ok(())
    }

    /// The handler bound to `kind`, if any.
    pub fn get_executor(&self, kind: &str) -> Option<BoxStepHandler> {
        self.bindings.get(kind).map(|b| b.handler.clone())
    }

    /// Name of the plugin whose handler currently serves `kind`.
    pub fn plugin_for(&self, kind: &str) -> Option<&str> {
        self.bindings.get(kind).map(|b| b.plugin.as_str())
    }

    /// All registered plugins, in registration order.
    pub fn list_plugins(&self) -> Vec<PluginDescriptor> {
        self.plugins.iter().map(Plugin::descriptor).collect()
    }

    /// Bound kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.bindings.keys().map(StepKind::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Step kinds used by `plan` that have no bound handler, first-seen order.
    pub fn unresolved_kinds(&self, plan: &Plan) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for step in plan.tasks.iter().flat_map(|t| t.steps.iter()) {
            if !self.bindings.contains_key(step.kind.as_str()) && !missing.contains(&step.kind) {
                missing.push(step.kind.clone());
            }
        }
        missing
    }

    /// Let every plugin integration subscribe to `bus`.
    pub fn attach_integrations(&self, bus: &EventBus) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();
        for plugin in &self.plugins {
            for integration in plugin.integrations() {
                let subs = integration.attach(bus);
                tracing::debug!(
                    plugin = plugin.name(),
                    integration = integration.name(),
                    subscriptions = subs.len(),
                    "attached integration"
                );
                subscriptions.extend(subs);
            }
        }
        subscriptions
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("plugins", &self.plugins.len())
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use xskynet_types::context::RunContext;
    use xskynet_types::event::DomainEvent;
    use xskynet_types::plan::{Step, Task};
    use xskynet_types::result::{Artifact, StepResult};

    use crate::event::bus::EventBusConfig;
    use crate::event::store::InMemoryEventStore;

    struct Tagged {
        kind: &'static str,
        tag: &'static str,
    }

    impl StepHandler for Tagged {
        fn kind(&self) -> &str {
            self.kind
        }

        async fn execute(&self, _step: &Step, _ctx: &RunContext) -> anyhow::Result<StepResult> {
            Ok(StepResult::succeeded().with_output(Artifact::new("tag").with_name(self.tag)))
        }
    }

    fn tagged(kind: &'static str, tag: &'static str) -> Tagged {
        Tagged { kind, tag }
    }

    #[tokio::test]
    async fn later_registration_wins_for_same_kind() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Plugin::new("first", "1.0.0").with_handler(tagged("http", "first")))
            .unwrap();
        registry
            .register(Plugin::new("second", "2.0.0").with_handler(tagged("http", "second")))
            .unwrap();

        let handler = registry.get_executor("http").unwrap();
        let result = handler
            .execute(&Step::new("s", "s", "http"), &RunContext::new("r", "p"))
            .await
            .unwrap();
        assert_eq!(result.output.unwrap().name.as_deref(), Some("second"));
        assert_eq!(registry.plugin_for("http"), Some("second"));

        let plugins = registry.list_plugins();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].name, "first");
        assert_eq!(plugins[1].name, "second");
    }

    #[test]
    fn missing_kind_is_none() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get_executor("shell").is_none());
        assert!(registry.plugin_for("shell").is_none());
    }

    #[test]
    fn invalid_kind_rejects_whole_plugin() {
        let mut registry = ExecutorRegistry::new();
        let err = registry
            .register(
                Plugin::new("broken", "0.1.0")
                    .with_handler(tagged("ok", "x"))
                    .with_handler(tagged("", "y")),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKind { .. }));
        assert!(registry.get_executor("ok").is_none());
        assert!(registry.list_plugins().is_empty());

        let err = registry
            .register(Plugin::new("spaced", "0.1.0").with_handler(tagged("two words", "x")))
            .unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn empty_plugin_name_rejected() {
        let mut registry = ExecutorRegistry::new();
        assert_eq!(
            registry.register(Plugin::new("  ", "1")),
            Err(RegistryError::EmptyPluginName)
        );
    }

    #[test]
    fn descriptors_list_kinds_in_declaration_order() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(
                Plugin::new("core", "1.2.3")
                    .with_handler(tagged("shell", "a"))
                    .with_handler(tagged("http", "b")),
            )
            .unwrap();
        let descriptor = &registry.list_plugins()[0];
        assert_eq!(descriptor.version, "1.2.3");
        assert_eq!(descriptor.kinds, vec!["shell", "http"]);
        assert_eq!(registry.kinds(), vec!["http", "shell"]);
    }

    #[test]
    fn unresolved_kinds_reports_unbound_step_kinds() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Plugin::new("core", "1").with_handler(tagged("shell", "a")))
            .unwrap();
        let plan = Plan::new("p", "p")
            .with_task(
                Task::new("a", "a")
                    .with_step(Step::new("s1", "s1", "shell"))
                    .with_step(Step::new("s2", "s2", "llm")),
            )
            .with_task(Task::new("b", "b").with_step(Step::new("s3", "s3", "llm")));
        assert_eq!(registry.unresolved_kinds(&plan), vec!["llm".to_string()]);
    }

    struct Notifier {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Integration for Notifier {
        fn name(&self) -> &str {
            "notifier"
        }

        fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
            let seen = Arc::clone(&self.seen);
            vec![bus.on("plan.failed", move |e: &DomainEvent| {
                seen.lock().unwrap().push(e.event_type.clone())
            })]
        }
    }

    #[test]
    fn integrations_attach_to_bus() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExecutorRegistry::new();
        registry
            .register(Plugin::new("chat", "1").with_integration(Notifier {
                seen: Arc::clone(&seen),
            }))
            .unwrap();
        assert_eq!(registry.list_plugins()[0].integrations, vec!["notifier"]);

        let bus = EventBus::new(Arc::new(InMemoryEventStore::new()), EventBusConfig::default());
        let subs = registry.attach_integrations(&bus);
        assert_eq!(subs.len(), 1);

        bus.emit(DomainEvent::new("plan.started")).unwrap();
        bus.emit(DomainEvent::new("plan.failed")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["plan.failed".to_string()]);
    }
}
