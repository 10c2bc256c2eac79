//! Wiring helpers that assemble a runnable event bus and executor from the
//! on-disk configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use xskynet_core::event::bus::{EventBus, EventBusConfig, Subscription};
use xskynet_core::event::store::{EventStore, InMemoryEventStore};
use xskynet_core::plan::executor::{ExecutorConfig, PlanExecutor};
use xskynet_core::registry::ExecutorRegistry;
use xskynet_types::config::RuntimeConfig;

use crate::config::{load_runtime_config, resolve_state_dir};
use crate::event_log::FileEventStore;

/// Configured bus plus the paths it was built from.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub state_dir: PathBuf,
    pub bus: EventBus,
    /// Subscriptions made by plugin integrations attached through
    /// [`Runtime::executor`].
    integrations: Vec<Subscription>,
}

impl Runtime {
    /// Load `{cwd}/xskynet.toml` and build the runtime from it.
    pub async fn open(cwd: &Path) -> Self {
        let config = load_runtime_config(cwd).await;
        Self::with_config(cwd, config)
    }

    /// Build from an explicit config. Events go to the JSONL log under the
    /// state directory when persistence is on, otherwise to memory.
    pub fn with_config(cwd: &Path, config: RuntimeConfig) -> Self {
        let state_dir = resolve_state_dir(cwd, &config);
        let store: Arc<dyn EventStore> = if config.persist_events {
            let path = state_dir.join(&config.events_file);
            tracing::debug!(path = %path.display(), "using file event store");
            Arc::new(FileEventStore::new(path))
        } else {
            tracing::debug!("event persistence disabled, using in-memory store");
            Arc::new(InMemoryEventStore::new())
        };
        let bus = EventBus::new(store, EventBusConfig::from(&config));
        Self {
            config,
            state_dir,
            bus,
            integrations: Vec::new(),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(&self.config.events_file)
    }

    /// Freeze `registry`, attach its plugin integrations to the bus, and
    /// return an executor bound to both.
    ///
    /// The integration subscriptions are kept until
    /// [`Runtime::detach_integrations`].
    pub fn executor(&mut self, registry: ExecutorRegistry) -> PlanExecutor {
        let subscriptions = registry.attach_integrations(&self.bus);
        tracing::debug!(
            plugins = registry.list_plugins().len(),
            integrations = subscriptions.len(),
            "executor registry frozen"
        );
        self.integrations.extend(subscriptions);
        PlanExecutor::new(
            Arc::new(registry),
            self.bus.clone(),
            ExecutorConfig::from(&self.config),
        )
    }

    pub fn integrations(&self) -> &[Subscription] {
        &self.integrations
    }

    /// Unsubscribe every attached integration. Returns how many were removed.
    pub fn detach_integrations(&mut self) -> usize {
        let detached = self.integrations.len();
        for subscription in self.integrations.drain(..) {
            subscription.unsubscribe();
        }
        tracing::debug!(detached, "plugin integrations detached");
        detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;
    use xskynet_core::event::bus::Subscription;
    use xskynet_core::registry::{Integration, Plugin, StepHandler};
    use xskynet_types::context::RunContext;
    use xskynet_types::event::{DomainEvent, ListOptions, types};
    use xskynet_types::plan::{Plan, Step, Task};
    use xskynet_types::result::StepResult;

    struct Noop;

    impl StepHandler for Noop {
        fn kind(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _step: &Step, _ctx: &RunContext) -> anyhow::Result<StepResult> {
            Ok(StepResult::succeeded())
        }
    }

    struct CountTasks(Arc<AtomicUsize>);

    impl Integration for CountTasks {
        fn name(&self) -> &str {
            "count-tasks"
        }

        fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
            let counter = Arc::clone(&self.0);
            vec![bus.on(types::TASK_SUCCEEDED, move |_: &DomainEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            })]
        }
    }

    fn plan() -> Plan {
        Plan::new("p", "bootstrap")
            .with_task(Task::new("a", "a").with_step(Step::new("s", "s", "noop")))
            .with_task(
                Task::new("b", "b")
                    .with_step(Step::new("s", "s", "noop"))
                    .depends_on(["a"]),
            )
    }

    #[tokio::test]
    async fn persisted_run_lands_in_jsonl_log() {
        let tmp = TempDir::new().unwrap();
        let mut runtime = Runtime::with_config(tmp.path(), RuntimeConfig::default());
        assert_eq!(runtime.events_path(), tmp.path().join(".xskynet/events.jsonl"));

        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = ExecutorRegistry::new();
        registry
            .register(
                Plugin::new("builtin", "1.0.0")
                    .with_handler(Noop)
                    .with_integration(CountTasks(Arc::clone(&counter))),
            )
            .unwrap();

        let executor = runtime.executor(registry);
        let result = executor.execute(plan()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.integrations().len(), 1);

        // A fresh store over the same file sees the whole run.
        let reopened = FileEventStore::new(runtime.events_path());
        let events = reopened.list(&ListOptions::all()).unwrap();
        assert_eq!(events.first().unwrap().event_type, types::PLAN_STARTED);
        assert_eq!(events.last().unwrap().event_type, types::PLAN_SUCCEEDED);
        assert_eq!(events.len(), 10);
    }

    #[tokio::test]
    async fn open_reads_config_file() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("xskynet.toml"),
            "persist_events = false\nmax_history = 4\nmax_parallelism = 1\n",
        )
        .await
        .unwrap();

        let mut runtime = Runtime::open(tmp.path()).await;
        assert!(!runtime.config.persist_events);
        assert_eq!(runtime.bus.config().max_history, 4);

        let mut registry = ExecutorRegistry::new();
        registry
            .register(Plugin::new("builtin", "1.0.0").with_handler(Noop))
            .unwrap();
        let executor = runtime.executor(registry);
        assert_eq!(executor.config().max_parallelism, 1);

        executor.execute(plan()).await.unwrap();
        assert_eq!(runtime.bus.history(None).len(), 4);
        assert!(!runtime.events_path().exists());
    }

    #[tokio::test]
    async fn detached_integrations_stop_receiving_events() {
        let tmp = TempDir::new().unwrap();
        let config = RuntimeConfig {
            persist_events: false,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::with_config(tmp.path(), config);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = ExecutorRegistry::new();
        registry
            .register(
                Plugin::new("builtin", "1.0.0")
                    .with_handler(Noop)
                    .with_integration(CountTasks(Arc::clone(&counter))),
            )
            .unwrap();
        let executor = runtime.executor(registry);

        executor.execute(plan()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert_eq!(runtime.detach_integrations(), 1);
        assert_eq!(runtime.detach_integrations(), 0);
        assert_eq!(runtime.bus.subscriber_count(), 0);

        executor.execute(plan()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
