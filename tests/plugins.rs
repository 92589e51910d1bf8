use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nova::http::{Request, Response};
use nova::pipeline::{
    Dispatcher, Flow, Plugin, PluginContext, PluginPriority, PluginRegistry, PluginState,
};
use nova::{AppError, AppResult, ServerConfig};

struct Named {
    id: &'static str,
    deps: Vec<String>,
}

impl Named {
    fn new(id: &'static str, deps: &[&str]) -> Arc<Self> {
        Arc::new(Named {
            id,
            deps: deps.iter().map(|d| d.to_string()).collect(),
        })
    }
}

impl Plugin for Named {
    fn id(&self) -> &str {
        self.id
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }
}

fn context(registry: &Arc<PluginRegistry>) -> PluginContext {
    PluginContext::new(Arc::new(ServerConfig::default()), None, registry)
}

#[test]
fn missing_dependency_fails_initialization() {
    let registry = Arc::new(PluginRegistry::new());
    registry.register(Named::new("b", &["a"])).unwrap();
    match registry.initialize_all(&context(&registry)) {
        Err(AppError::MissingDependency { plugin, dependency }) => {
            assert_eq!(plugin, "b");
            assert_eq!(dependency, "a");
        }
        other => panic!("unexpected {:?}", other.err()),
    }
    assert!(!registry.is_initialized());
}

#[test]
fn circular_dependency_fails_initialization() {
    let registry = Arc::new(PluginRegistry::new());
    registry.register(Named::new("a", &["b"])).unwrap();
    registry.register(Named::new("b", &["a"])).unwrap();
    assert!(matches!(
        registry.initialize_all(&context(&registry)),
        Err(AppError::CircularDependency(_))
    ));
    assert!(registry.start_all().is_err());
}

#[test]
fn diamond_initializes_each_plugin_once() {
    let registry = Arc::new(PluginRegistry::new());
    registry.register(Named::new("app", &["cache", "db"])).unwrap();
    registry.register(Named::new("cache", &["db"])).unwrap();
    registry.register(Named::new("db", &[])).unwrap();
    registry.initialize_all(&context(&registry)).unwrap();
    assert_eq!(registry.initialization_order(), vec!["db", "cache", "app"]);
    registry.start_all().unwrap();
    assert_eq!(registry.state("app"), Some(PluginState::Started));
    registry.stop_all();
    assert_eq!(registry.state("db"), Some(PluginState::Stopped));
}

struct Counter {
    id: &'static str,
    priority: PluginPriority,
    seen: Arc<AtomicUsize>,
    order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
}

impl Plugin for Counter {
    fn id(&self) -> &str {
        self.id
    }

    fn priority(&self) -> PluginPriority {
        self.priority
    }

    fn initialize(&self, ctx: &PluginContext) -> AppResult<()> {
        ctx.log("ready");
        Ok(())
    }

    fn on_request(&self, _req: &mut Request, res: &mut Response) -> AppResult<Flow> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        self.order.lock().push(self.id);
        if self.id == "terminal" {
            res.text("handled")?;
        }
        Ok(Flow::Continue)
    }
}

#[test]
fn lifecycle_hooks_run_by_priority() {
    let registry = Arc::new(PluginRegistry::new());
    let seen = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for (id, priority) in [
        ("late", PluginPriority::Lowest),
        ("terminal", PluginPriority::Normal),
        ("early", PluginPriority::Highest),
    ] {
        registry
            .register(Arc::new(Counter {
                id,
                priority,
                seen: seen.clone(),
                order: order.clone(),
            }))
            .unwrap();
    }
    registry.initialize_all(&context(&registry)).unwrap();
    registry.start_all().unwrap();

    let dispatcher = Dispatcher::new(registry.clone());
    let mut req = Request::from_bytes(
        b"GET /anything HTTP/1.1\r\n\r\n",
        "127.0.0.1:5000".parse().unwrap(),
    )
    .unwrap();
    let mut res = Response::new();
    dispatcher.dispatch(&mut req, &mut res);

    // a sent response ends the lifecycle
    assert_eq!(*order.lock(), vec!["early", "terminal"]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(&res.body()[..], b"handled");
}
