// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::middleware::Flow;
use crate::http::{Request, Response};
use crate::service::{ServerConfig, TaskPool};
use crate::{AppError, AppResult};

/// Lower values run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PluginPriority {
    Highest,
    VeryHigh,
    High,
    AboveNormal,
    Normal,
    BelowNormal,
    Low,
    VeryLow,
    Lowest,
}

impl PluginPriority {
    pub fn value(&self) -> u8 {
        match self {
            PluginPriority::Highest => 0,
            PluginPriority::VeryHigh => 10,
            PluginPriority::High => 20,
            PluginPriority::AboveNormal => 40,
            PluginPriority::Normal => 50,
            PluginPriority::BelowNormal => 60,
            PluginPriority::Low => 80,
            PluginPriority::VeryLow => 90,
            PluginPriority::Lowest => 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Registered,
    Initializing,
    Initialized,
    Started,
    Stopped,
    Failed,
}

/// An independently initialized unit of server functionality.
///
/// Lifecycle state is kept by the [`PluginRegistry`], not by the plugin.
pub trait Plugin: Send + Sync + 'static {
    /// Unique key.
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        ""
    }

    fn priority(&self) -> PluginPriority {
        PluginPriority::Normal
    }

    /// Ids of plugins that must be initialized before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn initialize(&self, _ctx: &PluginContext) -> AppResult<()> {
        Ok(())
    }

    fn start(&self) -> AppResult<()> {
        Ok(())
    }

    fn stop(&self) -> AppResult<()> {
        Ok(())
    }

    /// Called for every http request, in priority order across started plugins.
    fn on_request(&self, _request: &mut Request, _response: &mut Response) -> AppResult<Flow> {
        Ok(Flow::Continue)
    }
}

/// What a plugin gets to work with: configuration, background tasks, logging and the
/// other plugins.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    config: Arc<ServerConfig>,
    tasks: Option<TaskPool>,
    registry: Weak<PluginRegistry>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

impl PluginContext {
    pub fn new(
        config: Arc<ServerConfig>,
        tasks: Option<TaskPool>,
        registry: &Arc<PluginRegistry>,
    ) -> Self {
        PluginContext {
            plugin_id: "server".to_string(),
            config,
            tasks,
            registry: Arc::downgrade(registry),
        }
    }

    fn for_plugin(&self, plugin_id: &str) -> Self {
        PluginContext {
            plugin_id: plugin_id.to_string(),
            ..self.clone()
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn submit<F>(&self, task: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.tasks {
            Some(tasks) => tasks.submit(task),
            None => Err(AppError::IllegalStateError(format!(
                "no task pool available to plugin {}",
                self.plugin_id
            ))),
        }
    }

    pub fn log(&self, message: &str) {
        info!(plugin = %self.plugin_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(plugin = %self.plugin_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(plugin = %self.plugin_id, "{}", message);
    }

    pub fn has_plugin(&self, id: &str) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.has_plugin(id))
    }

    pub fn plugin<T: Plugin>(&self, id: &str) -> Option<Arc<T>> {
        self.registry.upgrade()?.get::<T>(id)
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    any: Arc<dyn Any + Send + Sync>,
    state: PluginState,
    seq: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Initialized,
    Started,
    Stopped,
}

struct Inner {
    entries: HashMap<String, Entry>,
    initialization_order: Vec<String>,
    started: Arc<Vec<Arc<dyn Plugin>>>,
    phase: Phase,
    context: Option<PluginContext>,
}

/// Registration, dependency resolution and lifecycle of plugins.
///
/// Lifecycle operations are serialized by one mutex; state lookups take a short read lock
/// so plugins can look each other up while they initialize.
pub struct PluginRegistry {
    lifecycle: Mutex<()>,
    inner: RwLock<Inner>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        PluginRegistry {
            lifecycle: Mutex::new(()),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                initialization_order: Vec::new(),
                started: Arc::new(Vec::new()),
                phase: Phase::Open,
                context: None,
            }),
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PluginRegistry")
            .field("plugins", &inner.entries.len())
            .field("phase", &inner.phase)
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. Before initialization it is only recorded; once the registry is
    /// initialized it is initialized on the spot. After start, registration is closed.
    pub fn register<P: Plugin>(&self, plugin: Arc<P>) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let id = plugin.id().to_string();
        let context = {
            let mut inner = self.inner.write();
            if matches!(inner.phase, Phase::Started | Phase::Stopped) {
                return Err(AppError::RegistrationClosed(id));
            }
            if inner.entries.contains_key(&id) {
                return Err(AppError::DuplicatePlugin(id));
            }
            let seq = inner.entries.len();
            let any: Arc<dyn Any + Send + Sync> = plugin.clone();
            inner.entries.insert(
                id.clone(),
                Entry {
                    plugin,
                    any,
                    state: PluginState::Registered,
                    seq,
                },
            );
            debug!("registered plugin {}", id);
            match inner.phase {
                Phase::Initialized => inner.context.clone(),
                _ => None,
            }
        };
        if let Some(context) = context {
            let mut visiting = HashSet::new();
            if let Err(e) = self.visit(&id, &mut visiting, &context) {
                // leave the registry as it was before the call
                let mut inner = self.inner.write();
                inner.entries.remove(&id);
                inner.initialization_order.retain(|i| i != &id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Initialize every plugin, dependencies first, in priority order otherwise.
    pub fn initialize_all(&self, context: &PluginContext) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock();
        {
            let inner = self.inner.read();
            if inner.phase != Phase::Open {
                return Err(AppError::IllegalStateError(
                    "plugins are already initialized".to_string(),
                ));
            }
        }
        let ids: Vec<String> = self
            .plugins_by_priority()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        let mut visiting = HashSet::new();
        for id in &ids {
            self.visit(id, &mut visiting, context)?;
        }
        let mut inner = self.inner.write();
        inner.phase = Phase::Initialized;
        inner.context = Some(context.clone());
        info!(
            "initialized {} plugins: {:?}",
            inner.initialization_order.len(),
            inner.initialization_order
        );
        Ok(())
    }

    fn visit(
        &self,
        id: &str,
        visiting: &mut HashSet<String>,
        context: &PluginContext,
    ) -> AppResult<()> {
        let plugin = {
            let inner = self.inner.read();
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| AppError::IllegalStateError(format!("unknown plugin {}", id)))?;
            match entry.state {
                PluginState::Initialized | PluginState::Started => return Ok(()),
                PluginState::Failed => {
                    return Err(AppError::PluginInit {
                        plugin: id.to_string(),
                        reason: "previously failed".to_string(),
                    })
                }
                _ => {}
            }
            entry.plugin.clone()
        };
        if !visiting.insert(id.to_string()) {
            return Err(AppError::CircularDependency(id.to_string()));
        }

        for dependency in plugin.dependencies() {
            if !self.has_plugin(&dependency) {
                return Err(AppError::MissingDependency {
                    plugin: id.to_string(),
                    dependency,
                });
            }
            self.visit(&dependency, visiting, context)?;
        }

        self.set_state(id, PluginState::Initializing);
        debug!("initializing plugin {}", id);
        match plugin.initialize(&context.for_plugin(id)) {
            Ok(()) => {
                let mut inner = self.inner.write();
                if let Some(entry) = inner.entries.get_mut(id) {
                    entry.state = PluginState::Initialized;
                }
                inner.initialization_order.push(id.to_string());
            }
            Err(e) => {
                self.set_state(id, PluginState::Failed);
                error!("plugin {} failed to initialize: {}", id, e);
                return Err(AppError::PluginInit {
                    plugin: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        visiting.remove(id);
        Ok(())
    }

    /// Start plugins in initialization order. The first failure marks that plugin failed,
    /// stops the ones already started and aborts.
    pub fn start_all(&self) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let order = {
            let inner = self.inner.read();
            if inner.phase != Phase::Initialized {
                return Err(AppError::IllegalStateError(format!(
                    "cannot start plugins in phase {:?}",
                    inner.phase
                )));
            }
            inner.initialization_order.clone()
        };

        let mut started: Vec<(String, Arc<dyn Plugin>)> = Vec::with_capacity(order.len());
        for id in &order {
            let Some(plugin) = self.plugin(id) else {
                continue;
            };
            if let Err(e) = plugin.start() {
                self.set_state(id, PluginState::Failed);
                error!("plugin {} failed to start: {}", id, e);
                for (done_id, done) in started.iter().rev() {
                    self.stop_one(done_id, done);
                }
                self.inner.write().phase = Phase::Stopped;
                return Err(AppError::PluginStart {
                    plugin: id.clone(),
                    reason: e.to_string(),
                });
            }
            self.set_state(id, PluginState::Started);
            debug!("started plugin {}", id);
            started.push((id.clone(), plugin));
        }

        let mut by_priority: Vec<(PluginPriority, usize, Arc<dyn Plugin>)> = {
            let inner = self.inner.read();
            started
                .iter()
                .filter_map(|(id, p)| inner.entries.get(id).map(|e| (p.priority(), e.seq, p.clone())))
                .collect()
        };
        by_priority.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        let mut inner = self.inner.write();
        inner.started = Arc::new(by_priority.into_iter().map(|(_, _, p)| p).collect());
        inner.phase = Phase::Started;
        Ok(())
    }

    fn stop_one(&self, id: &str, plugin: &Arc<dyn Plugin>) {
        match plugin.stop() {
            Ok(()) => {
                self.set_state(id, PluginState::Stopped);
                debug!("stopped plugin {}", id);
            }
            Err(e) => {
                self.set_state(id, PluginState::Failed);
                warn!("plugin {} failed to stop: {}", id, e);
            }
        }
    }

    /// Stop started plugins in reverse initialization order. Failures are logged and do
    /// not keep the others from stopping. A no-op unless started.
    pub fn stop_all(&self) {
        let _lifecycle = self.lifecycle.lock();
        let order = {
            let mut inner = self.inner.write();
            if inner.phase != Phase::Started {
                return;
            }
            inner.phase = Phase::Stopped;
            inner.started = Arc::new(Vec::new());
            inner.initialization_order.clone()
        };
        for id in order.iter().rev() {
            if self.state(id) != Some(PluginState::Started) {
                continue;
            }
            if let Some(plugin) = self.plugin(id) {
                self.stop_one(id, &plugin);
            }
        }
    }

    fn set_state(&self, id: &str, state: PluginState) {
        if let Some(entry) = self.inner.write().entries.get_mut(id) {
            entry.state = state;
        }
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.inner.read().entries.get(id).map(|e| e.state)
    }

    pub fn plugin(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().entries.get(id).map(|e| e.plugin.clone())
    }

    /// The plugin registered under `id`, if it is a `T`.
    pub fn get<T: Plugin>(&self, id: &str) -> Option<Arc<T>> {
        let any = self.inner.read().entries.get(id).map(|e| e.any.clone())?;
        any.downcast::<T>().ok()
    }

    pub fn has_plugin(&self, id: &str) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    pub fn plugin_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// All plugins by ascending priority, registration order breaking ties.
    pub fn plugins_by_priority(&self) -> Vec<Arc<dyn Plugin>> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| (e.plugin.priority(), e.seq));
        entries.iter().map(|e| e.plugin.clone()).collect()
    }

    /// Started plugins in request order.
    pub fn started_plugins(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        self.inner.read().started.clone()
    }

    pub fn initialization_order(&self) -> Vec<String> {
        self.inner.read().initialization_order.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().phase != Phase::Open
    }

    pub fn is_started(&self) -> bool {
        self.inner.read().phase == Phase::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct TestPlugin {
        id: String,
        priority: Option<PluginPriority>,
        deps: Vec<String>,
        fail_start: bool,
        fail_stop: bool,
        log: Arc<Mutex<Vec<String>>>,
        saw_dependency: AtomicBool,
    }

    impl TestPlugin {
        fn new(id: &str, deps: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Self {
            TestPlugin {
                id: id.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                log: log.clone(),
                ..TestPlugin::default()
            }
        }
    }

    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> PluginPriority {
            self.priority.unwrap_or(PluginPriority::Normal)
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn initialize(&self, ctx: &PluginContext) -> AppResult<()> {
            let ready = self.deps.iter().all(|d| ctx.has_plugin(d));
            self.saw_dependency.store(ready, Ordering::SeqCst);
            self.log.lock().push(format!("init {}", self.id));
            Ok(())
        }

        fn start(&self) -> AppResult<()> {
            if self.fail_start {
                return Err(AppError::HandlerError("no start".into()));
            }
            self.log.lock().push(format!("start {}", self.id));
            Ok(())
        }

        fn stop(&self) -> AppResult<()> {
            self.log.lock().push(format!("stop {}", self.id));
            if self.fail_stop {
                return Err(AppError::HandlerError("no stop".into()));
            }
            Ok(())
        }
    }

    #[fixture]
    fn registry() -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry::new())
    }

    fn context(registry: &Arc<PluginRegistry>) -> PluginContext {
        PluginContext::new(Arc::new(ServerConfig::default()), None, registry)
    }

    #[rstest]
    fn dependencies_initialize_first(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut early = TestPlugin::new("app", &["db"], &log);
        early.priority = Some(PluginPriority::Highest);
        registry.register(Arc::new(early)).unwrap();
        let mut db = TestPlugin::new("db", &[], &log);
        db.priority = Some(PluginPriority::Lowest);
        registry.register(Arc::new(db)).unwrap();

        registry.initialize_all(&context(&registry)).unwrap();
        assert_eq!(registry.initialization_order(), vec!["db", "app"]);
        assert_eq!(registry.state("app"), Some(PluginState::Initialized));
        let app = registry.get::<TestPlugin>("app").unwrap();
        assert!(app.saw_dependency.load(Ordering::SeqCst));

        registry.start_all().unwrap();
        registry.stop_all();
        assert_eq!(
            *log.lock(),
            vec!["init db", "init app", "start db", "start app", "stop app", "stop db"]
        );
        assert_eq!(registry.state("db"), Some(PluginState::Stopped));
    }

    #[rstest]
    fn missing_dependency_is_fatal(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(TestPlugin::new("b", &["a"], &log)))
            .unwrap();
        let err = registry.initialize_all(&context(&registry)).unwrap_err();
        assert!(matches!(
            err,
            AppError::MissingDependency { ref plugin, ref dependency } if plugin == "b" && dependency == "a"
        ));
    }

    #[rstest]
    fn cycles_are_detected(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(TestPlugin::new("a", &["b"], &log)))
            .unwrap();
        registry
            .register(Arc::new(TestPlugin::new("b", &["a"], &log)))
            .unwrap();
        let err = registry.initialize_all(&context(&registry)).unwrap_err();
        assert!(matches!(err, AppError::CircularDependency(_)));
        assert!(log.lock().is_empty());
    }

    #[rstest]
    fn duplicates_and_late_registration(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(TestPlugin::new("a", &[], &log)))
            .unwrap();
        assert!(matches!(
            registry.register(Arc::new(TestPlugin::new("a", &[], &log))),
            Err(AppError::DuplicatePlugin(_))
        ));
        registry.initialize_all(&context(&registry)).unwrap();
        assert!(matches!(
            registry.initialize_all(&context(&registry)),
            Err(AppError::IllegalStateError(_))
        ));

        // initialized immediately when added between initialize and start
        registry
            .register(Arc::new(TestPlugin::new("late", &["a"], &log)))
            .unwrap();
        assert_eq!(registry.state("late"), Some(PluginState::Initialized));
        assert!(registry
            .register(Arc::new(TestPlugin::new("broken", &["nope"], &log)))
            .is_err());
        assert!(!registry.has_plugin("broken"));

        registry.start_all().unwrap();
        assert!(matches!(
            registry.register(Arc::new(TestPlugin::new("after", &[], &log))),
            Err(AppError::RegistrationClosed(_))
        ));
        assert_eq!(registry.plugin_count(), 2);
    }

    #[rstest]
    fn start_failure_aborts_and_rolls_back(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(TestPlugin::new("first", &[], &log)))
            .unwrap();
        let mut bad = TestPlugin::new("bad", &["first"], &log);
        bad.fail_start = true;
        registry.register(Arc::new(bad)).unwrap();
        registry.initialize_all(&context(&registry)).unwrap();
        let err = registry.start_all().unwrap_err();
        assert!(matches!(err, AppError::PluginStart { .. }));
        assert_eq!(registry.state("bad"), Some(PluginState::Failed));
        assert_eq!(registry.state("first"), Some(PluginState::Stopped));
        assert!(!registry.is_started());
    }

    #[rstest]
    fn stop_failures_do_not_block_others(registry: Arc<PluginRegistry>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(TestPlugin::new("a", &[], &log)))
            .unwrap();
        let mut b = TestPlugin::new("b", &["a"], &log);
        b.fail_stop = true;
        registry.register(Arc::new(b)).unwrap();
        registry.initialize_all(&context(&registry)).unwrap();
        registry.start_all().unwrap();
        registry.stop_all();
        let log = log.lock();
        assert_eq!(&log[log.len() - 2..], &["stop b".to_string(), "stop a".to_string()]);
        assert_eq!(registry.state("b"), Some(PluginState::Failed));
        assert_eq!(registry.state("a"), Some(PluginState::Stopped));
        // stopping twice is harmless
        registry.stop_all();
    }

    #[rstest]
    fn start_requires_initialization(registry: Arc<PluginRegistry>) {
        assert!(matches!(
            registry.start_all(),
            Err(AppError::IllegalStateError(_))
        ));
        registry.stop_all();
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(PluginPriority::Highest < PluginPriority::Normal);
        assert!(PluginPriority::Normal < PluginPriority::BelowNormal);
        assert_eq!(PluginPriority::BelowNormal.value(), 60);
        assert_eq!(PluginPriority::Lowest.value(), 100);
    }
}
