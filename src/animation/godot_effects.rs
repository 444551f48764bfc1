use crate::animation::effect::{EffectInstance, EffectTemplate, InstanceId, TemplateId, TimedSubEffect};
use crate::animation::effect_router::{EffectPreset, EffectRouter};
use crate::config::{PresetConfig, RouterConfig};
use dashmap::DashMap;
use godot::classes::object::ConnectFlags;
use godot::classes::{AnimatedSprite2D, CpuParticles2D, GpuParticles2D, Node, Node2D, PackedScene};
use godot::prelude::*;
use std::sync::Arc;

/// Render pooled effects between NPCs and healthbars
const EFFECT_Z_INDEX: i32 = 50;

// ============================================================================
// EFFECT SCENE - PackedScene template
// ============================================================================

/// Effect template backed by a loaded `PackedScene`
pub struct EffectScene {
    path: String,
    scene: Gd<PackedScene>,
    /// Called deferred with the node whenever an instance's visibility changes
    watcher: Option<Callable>,
}

impl EffectScene {
    /// Load the scene at `path` (e.g. "res://fx/blood_splash.tscn")
    pub fn load(path: &str) -> Option<Self> {
        match try_load::<PackedScene>(path) {
            Ok(scene) => Some(Self {
                path: path.to_string(),
                scene,
                watcher: None,
            }),
            Err(err) => {
                godot_error!("[EFFECT SCENE] Failed to load scene: {} - {:?}", path, err);
                None
            }
        }
    }

    /// Report every instance's visibility changes to `watcher`, which is
    /// invoked deferred with the instance node as its only argument.
    pub fn watched_by(mut self, watcher: Callable) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Whether a node counts as deactivated by the time a deferred
/// visibility notification reaches the router
fn reports_deactivation(valid: bool, visible: bool) -> bool {
    !valid || !visible
}

/// "res://fx/blood_splash.tscn" -> "blood_splash"
fn scene_stem(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('.').next().unwrap_or(file)
}

impl EffectTemplate for EffectScene {
    type Instance = EffectNode;

    fn template_id(&self) -> TemplateId {
        TemplateId(self.scene.instance_id().to_i64())
    }

    fn identifier(&self) -> String {
        scene_stem(&self.path).to_string()
    }

    fn instantiate(&self, container: Option<&Gd<Node2D>>) -> Option<EffectNode> {
        let Some(mut node) = self.scene.try_instantiate_as::<Node2D>() else {
            godot_error!("[EFFECT SCENE] Failed to instantiate scene as Node2D: {}", self.path);
            return None;
        };

        if let Some(container) = container {
            container.clone().add_child(&node);
        }

        // Deferred so the router is never re-entered while it is releasing
        if let Some(watcher) = &self.watcher {
            let callback = watcher.bindv(&varray![node.to_variant()]);
            node.connect_flags("visibility_changed", &callback, ConnectFlags::DEFERRED);
        }
        Some(EffectNode::new(node))
    }
}

// ============================================================================
// EFFECT NODE - pooled Node2D instance
// ============================================================================

/// Timed or replayable node inside an effect scene
#[derive(Clone)]
enum Emitter {
    Gpu(Gd<GpuParticles2D>),
    Cpu(Gd<CpuParticles2D>),
    Sprite(Gd<AnimatedSprite2D>),
}

impl Emitter {
    fn from_node(node: Gd<Node>) -> Option<Self> {
        let node = match node.try_cast::<GpuParticles2D>() {
            Ok(gpu) => return Some(Emitter::Gpu(gpu)),
            Err(node) => node,
        };
        let node = match node.try_cast::<CpuParticles2D>() {
            Ok(cpu) => return Some(Emitter::Cpu(cpu)),
            Err(node) => node,
        };
        node.try_cast::<AnimatedSprite2D>().ok().map(Emitter::Sprite)
    }

    /// Sprites replay but do not contribute timing
    fn timing(&self) -> Option<TimedSubEffect> {
        let (lifetime, explosiveness, speed_scale) = match self {
            Emitter::Gpu(p) => (p.get_lifetime(), p.get_explosiveness_ratio() as f64, p.get_speed_scale()),
            Emitter::Cpu(p) => (p.get_lifetime(), p.get_explosiveness_ratio() as f64, p.get_speed_scale()),
            Emitter::Sprite(_) => return None,
        };
        let speed_scale = if speed_scale > 0.0 { speed_scale } else { 1.0 };
        Some(TimedSubEffect::new(
            lifetime * (1.0 - explosiveness) / speed_scale,
            lifetime / speed_scale,
        ))
    }

    fn restart(&mut self) {
        match self {
            Emitter::Gpu(p) => {
                p.restart();
                p.set_emitting(true);
            }
            Emitter::Cpu(p) => {
                p.restart();
                p.set_emitting(true);
            }
            Emitter::Sprite(s) => {
                s.set_frame(0);
                s.play();
            }
        }
    }

    fn stop(&mut self) {
        match self {
            Emitter::Gpu(p) => p.set_emitting(false),
            Emitter::Cpu(p) => p.set_emitting(false),
            Emitter::Sprite(s) => s.stop(),
        }
    }
}

/// Pooled effect instance: a scene root plus the emitters found in its subtree
#[derive(Clone)]
pub struct EffectNode {
    node: Gd<Node2D>,
    emitters: Vec<Emitter>,
}

impl EffectNode {
    /// Wrap a scene root, collecting particle and sprite nodes once
    pub fn new(node: Gd<Node2D>) -> Self {
        let mut emitters = Vec::new();
        let mut stack = vec![node.clone().upcast::<Node>()];
        while let Some(current) = stack.pop() {
            for child in current.get_children().iter_shared() {
                stack.push(child);
            }
            if let Some(emitter) = Emitter::from_node(current) {
                emitters.push(emitter);
            }
        }
        Self { node, emitters }
    }

    pub fn node(&self) -> Gd<Node2D> {
        self.node.clone()
    }
}

impl EffectInstance for EffectNode {
    type Container = Gd<Node2D>;

    fn instance_id(&self) -> InstanceId {
        // Still answers after the node was freed externally
        InstanceId(self.node.instance_id_unchecked().to_i64())
    }

    fn activate(&mut self) {
        if self.is_valid() {
            self.node.set_visible(true);
        }
    }

    fn deactivate(&mut self) {
        if !self.is_valid() {
            return;
        }
        self.node.set_visible(false);
        for emitter in &mut self.emitters {
            emitter.stop();
        }
    }

    fn restart(&mut self) {
        if !self.is_valid() {
            return;
        }
        for emitter in &mut self.emitters {
            emitter.restart();
        }
    }

    fn sub_effects(&self) -> Vec<TimedSubEffect> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.emitters.iter().filter_map(Emitter::timing).collect()
    }

    fn reset_placement(&mut self, container: Option<&Gd<Node2D>>) {
        if !self.is_valid() {
            return;
        }

        if let Some(container) = container {
            let parent = self.node.get_parent();
            let under_container = parent
                .as_ref()
                .is_some_and(|p| p.instance_id() == container.instance_id());
            if !under_container {
                if let Some(mut parent) = parent {
                    parent.remove_child(&self.node);
                }
                container.clone().add_child(&self.node);
            }
        }

        self.node.set_position(Vector2::ZERO);
        self.node.set_rotation(0.0);
        self.node.set_scale(Vector2::ONE);
        self.node.set_z_index(EFFECT_Z_INDEX);
    }

    fn destroy(mut self) {
        if self.is_valid() {
            self.node.queue_free();
        }
    }

    fn is_valid(&self) -> bool {
        self.node.is_instance_valid()
    }
}

// ============================================================================
// GODOT EFFECT ROUTER - GDScript facade
// ============================================================================

/// Godot-facing effect pool router
///
/// Usage in GDScript (as an autoload named `Effects`):
/// ```gdscript
/// Effects.set_container($Layer4Objects)
/// Effects.register_preset("blood", "res://fx/blood_splash.tscn", 8, true)
/// Effects.warmup_presets()
///
/// var fx = Effects.spawn_by_name("blood", npc.position)
/// # returns to the pool on its own once its particles finish
/// ```
#[derive(GodotClass)]
#[class(base=Node)]
pub struct GodotEffectRouter {
    router: EffectRouter<EffectScene>,

    /// Loaded templates (resource path -> template)
    scenes: DashMap<String, Arc<EffectScene>>,

    /// Router clock, accumulated from process delta
    clock_ms: f64,

    base: Base<Node>,
}

#[godot_api]
impl INode for GodotEffectRouter {
    fn init(base: Base<Node>) -> Self {
        godot_print!("=== EffectRouter Initializing ===");
        Self {
            router: EffectRouter::new(RouterConfig::default()),
            scenes: DashMap::new(),
            clock_ms: 0.0,
            base,
        }
    }

    fn ready(&mut self) {
        let created = self.router.warmup_presets();
        godot_print!(
            "EffectRouter: Ready! {} presets, {} effects prewarmed.",
            self.router.presets().len(),
            created
        );
    }

    fn exit_tree(&mut self) {
        self.router.clear_all(true);
        godot_print!("EffectRouter: Freed all pooled effects on exit.");
    }

    fn process(&mut self, delta: f64) {
        self.clock_ms += delta * 1000.0;
        let reclaimed = self.router.tick(self.clock_ms as u64);
        if reclaimed > 0 {
            self.base_mut()
                .emit_signal("effects_reclaimed", &[(reclaimed as i64).to_variant()]);
        }
    }
}

impl GodotEffectRouter {
    /// Loaded template for `path`, loading it on first use
    fn scene(&self, path: &str) -> Option<Arc<EffectScene>> {
        if let Some(scene) = self.scenes.get(path) {
            return Some(Arc::clone(scene.value()));
        }
        let watcher = Callable::from_object_method(&self.to_gd(), "notify_deactivated");
        let scene = Arc::new(EffectScene::load(path)?.watched_by(watcher));
        self.scenes.insert(path.to_string(), Arc::clone(&scene));
        Some(scene)
    }

    fn place(dispatched: EffectNode, position: Vector2) -> Gd<Node2D> {
        let mut node = dispatched.node();
        node.set_position(position);
        node
    }
}

#[godot_api]
impl GodotEffectRouter {
    /// Emitted after effects were returned to their pools by lifetime expiry
    /// Parameters: (count: int)
    #[signal]
    fn effects_reclaimed(count: i64);

    // ===== Configuration =====

    /// Set the node pooled effects are parented under
    #[func]
    pub fn set_container(&mut self, container: Gd<Node2D>) {
        godot_print!("[EFFECT ROUTER] Setting scene container");
        self.router.set_container(container);
    }

    /// Replace router settings from a JSON object
    /// Usage: Effects.load_config_json('{"default_capacity": 4}')
    #[func]
    pub fn load_config_json(&mut self, json: GString) -> bool {
        match RouterConfig::from_json(&json.to_string()) {
            Ok(config) => {
                self.router.set_config(config);
                true
            }
            Err(err) => {
                godot_error!("[EFFECT ROUTER] {}", err);
                false
            }
        }
    }

    /// Register a named preset pool for a scene
    #[func]
    pub fn register_preset(&mut self, name: GString, scene_path: GString, prewarm: i32, collision_checks: bool) -> bool {
        let Some(template) = self.scene(&scene_path.to_string()) else {
            return false;
        };
        let preset = EffectPreset {
            name: name.to_string(),
            template,
            prewarm: prewarm.max(0) as usize,
            collision_checks,
        };
        match self.router.register_preset(preset) {
            Ok(_) => true,
            Err(err) => {
                godot_warn!("[EFFECT ROUTER] {}", err);
                false
            }
        }
    }

    /// Register presets from a JSON array of
    /// `{"name", "scene", "prewarm", "collision_checks"}` objects.
    /// Returns how many were registered.
    #[func]
    pub fn load_presets_json(&mut self, json: GString) -> i32 {
        let presets = match PresetConfig::list_from_json(&json.to_string()) {
            Ok(presets) => presets,
            Err(err) => {
                godot_error!("[EFFECT ROUTER] {}", err);
                return 0;
            }
        };

        let mut registered = 0;
        for preset in presets {
            let prewarm = preset.prewarm.min(i32::MAX as usize) as i32;
            if self.register_preset((&preset.name).into(), (&preset.scene).into(), prewarm, preset.collision_checks) {
                registered += 1;
            }
        }
        registered
    }

    /// Warm every preset to its configured size
    #[func]
    pub fn warmup_presets(&mut self) -> i32 {
        self.router.warmup_presets() as i32
    }

    /// Grow the pool for a scene to at least `count` effects
    #[func]
    pub fn warmup(&mut self, scene_path: GString, count: i32) -> i32 {
        let Some(template) = self.scene(&scene_path.to_string()) else {
            return 0;
        };
        self.router.warmup(template, None, count.max(0) as usize) as i32
    }

    // ===== Dispatch =====

    /// Spawn an effect from a scene path at `position`
    #[func]
    pub fn spawn(&mut self, scene_path: GString, position: Vector2) -> Option<Gd<Node2D>> {
        self.spawn_for(scene_path, position, 0.0)
    }

    /// Spawn an effect that stays active for `duration` seconds
    /// (0 = derive from its particles)
    #[func]
    pub fn spawn_for(&mut self, scene_path: GString, position: Vector2, duration: f64) -> Option<Gd<Node2D>> {
        let template = self.scene(&scene_path.to_string());
        match self.router.dispatch_with(template, None, Some(duration)) {
            Ok(dispatched) => Some(Self::place(dispatched.instance, position)),
            Err(err) => {
                godot_warn!("[EFFECT ROUTER] {}", err);
                None
            }
        }
    }

    /// Spawn an effect from a named preset at `position`
    #[func]
    pub fn spawn_by_name(&mut self, name: GString, position: Vector2) -> Option<Gd<Node2D>> {
        match self.router.dispatch_by_name(&name.to_string()) {
            Ok(dispatched) => Some(Self::place(dispatched.instance, position)),
            Err(err) => {
                godot_warn!("[EFFECT ROUTER] {}", err);
                None
            }
        }
    }

    // ===== Release =====

    /// Return an effect to its pool before its lifetime runs out.
    /// Effects that did not come from a pool are freed.
    #[func]
    pub fn release(&mut self, effect: Gd<Node2D>) -> bool {
        match self.router.release_instance(EffectNode::new(effect)) {
            Ok(_) => true,
            Err(err) => {
                godot_warn!("[EFFECT ROUTER] Release failed: {}", err);
                false
            }
        }
    }

    /// Reclaims an effect that was hidden or freed by game code.
    ///
    /// Every pooled node calls this deferred from `visibility_changed`; a
    /// node that is visible again by then (re-dispatched) is left alone.
    #[func]
    pub fn notify_deactivated(&mut self, effect: Gd<Node2D>) -> bool {
        let valid = effect.is_instance_valid();
        if !reports_deactivation(valid, valid && effect.is_visible()) {
            return false;
        }
        self.router
            .notify_deactivated(InstanceId(effect.instance_id_unchecked().to_i64()))
    }

    /// Free pooled effects and forget every pool
    #[func]
    pub fn clear_all(&mut self, destroy_active: bool) {
        self.router.clear_all(destroy_active);
        godot_print!("[EFFECT ROUTER] All pools cleared (destroy_active={})", destroy_active);
    }

    // ===== Diagnostics =====

    #[func]
    pub fn count_active(&self, name: GString) -> i32 {
        self.router
            .pool_by_name(&name.to_string())
            .map_or(0, |pool| pool.count_active() as i32)
    }

    #[func]
    pub fn count_inactive(&self, name: GString) -> i32 {
        self.router
            .pool_by_name(&name.to_string())
            .map_or(0, |pool| pool.count_inactive() as i32)
    }

    #[func]
    pub fn count_all(&self, name: GString) -> i32 {
        self.router
            .pool_by_name(&name.to_string())
            .map_or(0, |pool| pool.count_all() as i32)
    }

    /// Per-pool counts as a JSON array
    #[func]
    pub fn stats_json(&self) -> GString {
        let json = serde_json::to_string(&self.router.stats()).unwrap_or_else(|_| "[]".to_string());
        GString::from(&json)
    }
}
