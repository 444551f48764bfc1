//! In-memory effect backend shared by the integration tests.

#![allow(dead_code)]

use fxpool::animation::{EffectInstance, EffectTemplate, InstanceId, TemplateId, TimedSubEffect};
use fxpool::logging::EngineLog;
use fxpool::{EffectRouter, RouterConfig};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Container ids stand in for scene-tree parents
pub type Container = u32;

type DeactivateHook = Box<dyn Fn(InstanceId)>;

/// Records what happened to every instance it created
#[derive(Default)]
pub struct Backend {
    next_id: Cell<i64>,
    instantiated: Cell<usize>,
    destroyed: RefCell<Vec<InstanceId>>,
    on_deactivate: RefCell<Option<DeactivateHook>>,
}

impl Backend {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn instantiated(&self) -> usize {
        self.instantiated.get()
    }

    pub fn destroyed(&self) -> Vec<InstanceId> {
        self.destroyed.borrow().clone()
    }

    pub fn was_destroyed(&self, id: InstanceId) -> bool {
        self.destroyed.borrow().contains(&id)
    }

    /// Called from inside every `deactivate`, like a scene-tree signal
    pub fn on_deactivate(&self, hook: impl Fn(InstanceId) + 'static) {
        *self.on_deactivate.borrow_mut() = Some(Box::new(hook));
    }

    /// An instance that no pool ever created
    pub fn stray(self: &Rc<Self>) -> MockFx {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        MockFx::new(InstanceId(10_000 + id), Rc::clone(self), Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub active: bool,
    pub destroyed: bool,
    pub restarts: usize,
    pub position: (f32, f32),
    pub parent: Option<Container>,
}

/// Reference to a mock effect object; clones share state
#[derive(Clone)]
pub struct MockFx {
    id: InstanceId,
    state: Rc<RefCell<MockState>>,
    backend: Rc<Backend>,
    sub_effects: Vec<TimedSubEffect>,
}

impl MockFx {
    fn new(id: InstanceId, backend: Rc<Backend>, sub_effects: Vec<TimedSubEffect>) -> Self {
        Self {
            id,
            state: Rc::new(RefCell::new(MockState::default())),
            backend,
            sub_effects,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    pub fn restarts(&self) -> usize {
        self.state.borrow().restarts
    }

    pub fn position(&self) -> (f32, f32) {
        self.state.borrow().position
    }

    pub fn parent(&self) -> Option<Container> {
        self.state.borrow().parent
    }

    pub fn move_to(&self, x: f32, y: f32, parent: Container) {
        let mut state = self.state.borrow_mut();
        state.position = (x, y);
        state.parent = Some(parent);
    }

    /// Free the object behind the pool's back
    pub fn free_externally(&self) {
        self.state.borrow_mut().destroyed = true;
    }
}

impl std::fmt::Debug for MockFx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFx")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl EffectInstance for MockFx {
    type Container = Container;

    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn activate(&mut self) {
        self.state.borrow_mut().active = true;
    }

    fn deactivate(&mut self) {
        self.state.borrow_mut().active = false;
        if let Some(hook) = self.backend.on_deactivate.borrow().as_ref() {
            hook(self.id);
        }
    }

    fn restart(&mut self) {
        self.state.borrow_mut().restarts += 1;
    }

    fn sub_effects(&self) -> Vec<TimedSubEffect> {
        self.sub_effects.clone()
    }

    fn reset_placement(&mut self, container: Option<&Container>) {
        let mut state = self.state.borrow_mut();
        state.position = (0.0, 0.0);
        state.parent = container.copied();
    }

    fn destroy(self) {
        self.state.borrow_mut().destroyed = true;
        self.backend.destroyed.borrow_mut().push(self.id);
    }

    fn is_valid(&self) -> bool {
        !self.state.borrow().destroyed
    }
}

pub struct MockTemplate {
    id: TemplateId,
    name: String,
    backend: Rc<Backend>,
    sub_effects: Vec<TimedSubEffect>,
    broken: bool,
}

impl MockTemplate {
    pub fn new(backend: &Rc<Backend>, id: i64, name: &str) -> Arc<Self> {
        Self::with_sub_effects(backend, id, name, Vec::new())
    }

    pub fn with_sub_effects(backend: &Rc<Backend>, id: i64, name: &str, sub_effects: Vec<TimedSubEffect>) -> Arc<Self> {
        Arc::new(Self {
            id: TemplateId(id),
            name: name.to_string(),
            backend: Rc::clone(backend),
            sub_effects,
            broken: false,
        })
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    /// Template whose instantiation always fails
    pub fn broken(backend: &Rc<Backend>, id: i64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: TemplateId(id),
            name: name.to_string(),
            backend: Rc::clone(backend),
            sub_effects: Vec::new(),
            broken: true,
        })
    }
}

impl EffectTemplate for MockTemplate {
    type Instance = MockFx;

    fn template_id(&self) -> TemplateId {
        self.id
    }

    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn instantiate(&self, container: Option<&Container>) -> Option<MockFx> {
        if self.broken {
            return None;
        }
        let id = self.backend.next_id.get() + 1;
        self.backend.next_id.set(id);
        self.backend.instantiated.set(self.backend.instantiated.get() + 1);

        let fx = MockFx::new(InstanceId(id), Rc::clone(&self.backend), self.sub_effects.clone());
        fx.state.borrow_mut().parent = container.copied();
        Some(fx)
    }
}

pub type MockRouter = EffectRouter<MockTemplate>;

pub fn router() -> MockRouter {
    EffectRouter::new(RouterConfig::default())
}

pub fn router_with(config: RouterConfig) -> MockRouter {
    EffectRouter::new(config)
}

thread_local! {
    static LOG_LINES: RefCell<Vec<(tracing::Level, String)>> = const { RefCell::new(Vec::new()) };
}

fn record_line(level: tracing::Level, line: &str) {
    LOG_LINES.with(|lines| lines.borrow_mut().push((level, line.to_string())));
}

/// Run `f` with diagnostics routed through the engine log bridge and return
/// the warnings and errors it produced
pub fn captured_warnings<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .without_time()
        .with_writer(EngineLog::with_sink(record_line))
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let lines = LOG_LINES.with(|lines| lines.take());
    (result, lines.into_iter().map(|(_, line)| line).collect())
}
