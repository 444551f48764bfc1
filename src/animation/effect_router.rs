use crate::animation::effect::{ContainerOf, EffectInstance, EffectTemplate, InstanceId, TemplateId};
use crate::animation::effect_pool::{EffectHandle, EffectPool, PoolId, PoolStats, ReleaseOutcome};
use crate::animation::lifetime::{effective_duration, LifetimeScheduler};
use crate::config::RouterConfig;
use crate::error::{PoolError, PoolResult};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Instance handed to the caller by a dispatch
#[derive(Debug, Clone)]
pub struct DispatchedEffect<I> {
    pub handle: EffectHandle,
    pub instance: I,
}

/// Statically configured pool: symbolic name, template and warmup size
pub struct EffectPreset<T> {
    pub name: String,
    pub template: Arc<T>,
    pub prewarm: usize,
    pub collision_checks: bool,
}

impl<T> Clone for EffectPreset<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            template: Arc::clone(&self.template),
            prewarm: self.prewarm,
            collision_checks: self.collision_checks,
        }
    }
}

/// Routes dispatch and release requests to one [`EffectPool`] per template.
///
/// Pools are found by template identity or by symbolic name; several names
/// may alias the same pool. Every dispatch is recorded in `issued` so an
/// instance can be released without the caller knowing its pool, and every
/// dispatch arms the instance's lifetime timer so it comes back on its own.
///
/// Time only moves when [`EffectRouter::tick`] is called from the owner's
/// update loop.
pub struct EffectRouter<T: EffectTemplate> {
    /// Runtime-tunable settings
    config: ArcSwap<RouterConfig>,

    /// Placement target shared with every pool
    container: Arc<RwLock<Option<ContainerOf<T>>>>,

    /// Pool id -> pool
    pools: DashMap<PoolId, Arc<EffectPool<T>>>,

    /// Template identity -> pool id
    by_template: DashMap<TemplateId, PoolId>,

    /// Symbolic name -> pool id
    by_name: DashMap<String, PoolId>,

    /// Active instance -> handle of its current dispatch
    issued: DashMap<InstanceId, EffectHandle>,

    /// Statically configured pools, in registration order
    presets: RwLock<Vec<EffectPreset<T>>>,

    /// Pending lifetime timers
    scheduler: LifetimeScheduler,

    /// Router clock in milliseconds (advanced by `tick`)
    now_ms: AtomicU64,

    next_pool_id: AtomicU64,
}

impl<T: EffectTemplate> Default for EffectRouter<T> {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl<T: EffectTemplate> EffectRouter<T> {
    pub fn new(config: RouterConfig) -> Self {
        tracing::debug!(
            "[EFFECT ROUTER] Initializing: default_capacity={}, collision_checks={}",
            config.default_capacity,
            config.collision_checks
        );
        Self {
            config: ArcSwap::from_pointee(config),
            container: Arc::new(RwLock::new(None)),
            pools: DashMap::new(),
            by_template: DashMap::new(),
            by_name: DashMap::new(),
            issued: DashMap::new(),
            presets: RwLock::new(Vec::new()),
            scheduler: LifetimeScheduler::new(),
            now_ms: AtomicU64::new(0),
            next_pool_id: AtomicU64::new(1),
        }
    }

    // ===== Configuration =====

    pub fn config(&self) -> Arc<RouterConfig> {
        self.config.load_full()
    }

    /// Replace the settings. Existing pools keep their capacity and
    /// collision-check flag; only later decisions see the new values.
    pub fn set_config(&self, config: RouterConfig) {
        self.config.store(Arc::new(config));
    }

    /// Set the placement target instances are parented under while pooled
    pub fn set_container(&self, container: ContainerOf<T>) {
        *self.container.write() = Some(container);
    }

    // ===== Pool resolution =====

    fn pool(&self, id: PoolId) -> Option<Arc<EffectPool<T>>> {
        self.pools.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn pool_by_template(&self, template: TemplateId) -> Option<Arc<EffectPool<T>>> {
        let id = self.by_template.get(&template).map(|entry| *entry.value())?;
        self.pool(id)
    }

    pub fn pool_by_name(&self, name: &str) -> Option<Arc<EffectPool<T>>> {
        let id = self.by_name.get(name).map(|entry| *entry.value())?;
        self.pool(id)
    }

    fn create_pool(
        &self,
        template: &Arc<T>,
        name: &str,
        capacity: usize,
        collision_checks: bool,
    ) -> Arc<EffectPool<T>> {
        let id = PoolId(self.next_pool_id.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(EffectPool::new(
            id,
            name,
            Arc::clone(template),
            Arc::clone(&self.container),
            capacity,
            collision_checks,
        ));

        self.pools.insert(id, Arc::clone(&pool));
        self.by_template.entry(template.template_id()).or_insert(id);
        self.by_name.insert(name.to_string(), id);

        tracing::debug!(
            "[EFFECT ROUTER] Registered pool '{}' ({:?}) for {}",
            name,
            id,
            template.template_id()
        );
        pool
    }

    /// Find the pool for `template` (by identity, then by name) or create one
    /// at the default capacity.
    fn resolve(&self, template: &Arc<T>, name: Option<&str>) -> Arc<EffectPool<T>> {
        if let Some(pool) = self.pool_by_template(template.template_id()) {
            return pool;
        }

        let name = name.map(str::to_string).unwrap_or_else(|| template.identifier());
        if let Some(pool) = self.pool_by_name(&name) {
            return pool;
        }

        let config = self.config();
        self.create_pool(template, &name, config.default_capacity, config.collision_checks)
    }

    // ===== Dispatch =====

    /// Take an instance of `template` from its pool, creating the pool on
    /// first use. `name` defaults to the template's own identifier.
    pub fn dispatch(&self, template: Option<Arc<T>>, name: Option<&str>) -> PoolResult<DispatchedEffect<T::Instance>> {
        self.dispatch_with(template, name, None)
    }

    /// Like [`EffectRouter::dispatch`], with an explicit lifetime in seconds.
    /// A non-positive `duration_hint` is ignored.
    pub fn dispatch_with(
        &self,
        template: Option<Arc<T>>,
        name: Option<&str>,
        duration_hint: Option<f64>,
    ) -> PoolResult<DispatchedEffect<T::Instance>> {
        let Some(template) = template else {
            tracing::warn!("[EFFECT ROUTER] Dispatch requested without a template");
            return Err(PoolError::NullTemplate);
        };

        let pool = self.resolve(&template, name);
        self.dispatch_from(&pool, duration_hint)
    }

    /// Dispatch from the pool registered under `name`.
    /// Unknown names are rejected; no pool is created.
    pub fn dispatch_by_name(&self, name: &str) -> PoolResult<DispatchedEffect<T::Instance>> {
        self.dispatch_by_name_with(name, None)
    }

    pub fn dispatch_by_name_with(
        &self,
        name: &str,
        duration_hint: Option<f64>,
    ) -> PoolResult<DispatchedEffect<T::Instance>> {
        let Some(pool) = self.pool_by_name(name) else {
            tracing::warn!("[EFFECT ROUTER] No pool registered under name '{}'", name);
            return Err(PoolError::UnknownName(name.to_string()));
        };

        let dispatched = self.dispatch_with(Some(Arc::clone(pool.template())), Some(name), duration_hint)?;
        let has_hint = duration_hint.is_some_and(|h| h > 0.0 && h.is_finite());
        if !has_hint && dispatched.instance.sub_effects().is_empty() {
            tracing::warn!(
                "[EFFECT ROUTER] Effect '{}' has no timed sub-effects, using fallback lifetime",
                name
            );
        }
        Ok(dispatched)
    }

    fn dispatch_from(
        &self,
        pool: &Arc<EffectPool<T>>,
        duration_hint: Option<f64>,
    ) -> PoolResult<DispatchedEffect<T::Instance>> {
        let checkout = pool.get()?;
        let mut instance = checkout.instance;
        let handle = EffectHandle {
            pool: pool.id(),
            instance: instance.instance_id(),
            ticket: checkout.ticket,
        };
        self.issued.insert(handle.instance, handle);

        let container = self.container.read();
        instance.reset_placement(container.as_ref());
        drop(container);
        instance.restart();

        let config = self.config();
        let duration = effective_duration(duration_hint, &instance.sub_effects(), config.fallback_lifetime_secs);
        let now = self.now_ms();
        if let Some(timer) = pool.arm_lifetime(&handle, now, duration) {
            self.scheduler.schedule(handle, timer);
        }

        tracing::debug!(
            "[{} POOL] Dispatched {} for {:.3}s (active={}, inactive={})",
            pool.name(),
            handle.instance,
            duration,
            pool.count_active(),
            pool.count_inactive()
        );

        Ok(DispatchedEffect { handle, instance })
    }

    // ===== Release =====

    /// Return the instance behind `handle` to its pool.
    pub fn release(&self, handle: EffectHandle) -> PoolResult<ReleaseOutcome> {
        self.release_from(handle, false)
    }

    /// `expired` is set when the scheduler entry was already drained
    fn release_from(&self, handle: EffectHandle, expired: bool) -> PoolResult<ReleaseOutcome> {
        let Some(pool) = self.pool(handle.pool) else {
            tracing::warn!("[EFFECT ROUTER] Release of {} from unknown pool {:?}", handle.instance, handle.pool);
            return Err(PoolError::ForeignRelease {
                instance: handle.instance,
            });
        };

        // Drop the back-reference before deactivation so a reentrant
        // notification for this instance finds nothing left to do
        self.issued.remove_if(&handle.instance, |_, issued| *issued == handle);
        let cancels_timer = !expired && pool.lifetime_armed(&handle);
        let outcome = pool.release(&handle)?;
        if cancels_timer && self.scheduler.mark_stale() {
            self.compact_timers();
        }

        if outcome == ReleaseOutcome::Returned {
            tracing::debug!(
                "[{} POOL] Returned {} to pool (active={}, inactive={})",
                pool.name(),
                handle.instance,
                pool.count_active(),
                pool.count_inactive()
            );
        }
        Ok(outcome)
    }

    /// Release by instance, for callers that did not keep the handle.
    ///
    /// An instance owned by no pool is destroyed rather than leaked.
    pub fn release_instance(&self, instance: T::Instance) -> PoolResult<ReleaseOutcome> {
        let id = instance.instance_id();
        if let Some(handle) = self.issued.get(&id).map(|entry| *entry.value()) {
            return self.release(handle);
        }

        if let Some(pool) = self.owning_pool(id) {
            return pool.reject_release(id);
        }

        tracing::warn!("[EFFECT ROUTER] {} does not belong to any pool, destroying it", id);
        instance.destroy();
        Err(PoolError::ForeignRelease { instance: id })
    }

    /// The instance was turned off by something other than its timer.
    ///
    /// Reclaims it if its lifetime is still pending; returns whether it did.
    /// Notifications for instances that are already back in their pool are
    /// ignored without a diagnostic.
    pub fn notify_deactivated(&self, instance: InstanceId) -> bool {
        let Some(handle) = self.issued.get(&instance).map(|entry| *entry.value()) else {
            return false;
        };
        let armed = self.pool(handle.pool).is_some_and(|pool| pool.lifetime_armed(&handle));
        armed && self.release(handle).is_ok()
    }

    fn owning_pool(&self, instance: InstanceId) -> Option<Arc<EffectPool<T>>> {
        self.pools
            .iter()
            .find(|entry| entry.value().contains(instance))
            .map(|entry| Arc::clone(entry.value()))
    }

    // ===== Lifetime =====

    /// Advance the router clock and reclaim every instance whose lifetime has
    /// run out. Returns how many were reclaimed.
    pub fn tick(&self, now_ms: u64) -> usize {
        let now = self.now_ms.fetch_max(now_ms, Ordering::Relaxed).max(now_ms);

        let mut reclaimed = 0;
        for entry in self.scheduler.drain_due(now) {
            let Some(pool) = self.pool(entry.handle.pool) else {
                self.scheduler.discard_stale();
                continue;
            };
            // Cancelled or re-armed since scheduling
            if !pool.lifetime_armed_with(&entry.handle, entry.token) {
                self.scheduler.discard_stale();
                continue;
            }
            if matches!(self.release_from(entry.handle, true), Ok(ReleaseOutcome::Returned)) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Drop scheduler entries whose timer is no longer armed
    fn compact_timers(&self) {
        let removed = self.scheduler.compact(|entry| {
            self.pool(entry.handle.pool)
                .is_some_and(|pool| pool.lifetime_armed_with(&entry.handle, entry.token))
        });
        tracing::debug!(
            "[EFFECT ROUTER] Compacted timer queue: removed {} cancelled, {} pending",
            removed,
            self.scheduler.len()
        );
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    /// Scheduled timers, including cancelled ones not yet discarded
    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    // ===== Warmup =====

    /// Grow the pool for `template` to at least `count` instances.
    /// Never shrinks. Returns how many instances were created.
    pub fn warmup(&self, template: Arc<T>, name: Option<&str>, count: usize) -> usize {
        let pool = self.resolve(&template, name);
        Self::warmup_pool(&pool, count)
    }

    pub fn warmup_by_name(&self, name: &str, count: usize) -> PoolResult<usize> {
        let Some(pool) = self.pool_by_name(name) else {
            tracing::warn!("[EFFECT ROUTER] Cannot warm up unknown pool '{}'", name);
            return Err(PoolError::UnknownName(name.to_string()));
        };
        Ok(Self::warmup_pool(&pool, count))
    }

    fn warmup_pool(pool: &EffectPool<T>, count: usize) -> usize {
        let needed = count.saturating_sub(pool.count_all());
        if needed == 0 {
            return 0;
        }
        let created = pool.warmup(needed);
        tracing::debug!("[{} POOL] Warmed up {} instances (total={})", pool.name(), created, pool.count_all());
        created
    }

    // ===== Presets =====

    /// Register a statically configured pool. A name that is already taken
    /// is rejected and the earlier registration kept.
    pub fn register_preset(&self, preset: EffectPreset<T>) -> PoolResult<PoolId> {
        let taken = self.presets.read().iter().any(|p| p.name == preset.name)
            || self
                .pool_by_name(&preset.name)
                .is_some_and(|pool| pool.template().template_id() != preset.template.template_id());
        if taken {
            tracing::warn!("[EFFECT ROUTER] Preset name '{}' already registered, ignoring", preset.name);
            return Err(PoolError::DuplicateName(preset.name));
        }

        let pool = self.preset_pool(&preset);
        self.presets.write().push(preset);
        Ok(pool.id())
    }

    /// Pool for a preset: by name, then by template (adding the name as an
    /// alias), else a new empty pool with the preset's collision setting.
    fn preset_pool(&self, preset: &EffectPreset<T>) -> Arc<EffectPool<T>> {
        if let Some(pool) = self.pool_by_name(&preset.name) {
            return pool;
        }
        if let Some(pool) = self.pool_by_template(preset.template.template_id()) {
            self.by_name.insert(preset.name.clone(), pool.id());
            return pool;
        }
        self.create_pool(&preset.template, &preset.name, 0, preset.collision_checks)
    }

    /// Warm every registered preset to its configured size, if enabled.
    /// Returns the total number of instances created.
    pub fn warmup_presets(&self) -> usize {
        if !self.config().prewarm_presets {
            tracing::debug!("[EFFECT ROUTER] Preset prewarm disabled");
            return 0;
        }

        let presets: Vec<EffectPreset<T>> = self.presets.read().clone();
        let created: usize = presets
            .iter()
            .map(|preset| Self::warmup_pool(&self.preset_pool(preset), preset.prewarm))
            .sum();
        tracing::debug!("[EFFECT ROUTER] Prewarmed {} presets ({} instances)", presets.len(), created);
        created
    }

    pub fn presets(&self) -> Vec<String> {
        self.presets.read().iter().map(|p| p.name.clone()).collect()
    }

    // ===== Teardown =====

    /// Clear every pool and forget all pools, names and dispatches.
    /// Presets stay registered and are rebuilt by `warmup_presets`.
    pub fn clear_all(&self, destroy_active: bool) {
        let pools: Vec<Arc<EffectPool<T>>> = self.pools.iter().map(|entry| Arc::clone(entry.value())).collect();
        for pool in &pools {
            pool.clear(destroy_active);
        }

        self.pools.clear();
        self.by_template.clear();
        self.by_name.clear();
        self.issued.clear();
        self.scheduler.clear();
        tracing::debug!("[EFFECT ROUTER] Cleared {} pools (destroy_active={})", pools.len(), destroy_active);
    }

    // ===== Queries =====

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of dispatches not yet released
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    pub fn handle_of(&self, instance: InstanceId) -> Option<EffectHandle> {
        self.issued.get(&instance).map(|entry| *entry.value())
    }

    pub fn is_active(&self, handle: &EffectHandle) -> bool {
        self.pool(handle.pool).is_some_and(|pool| pool.is_current(handle))
    }

    /// Per-pool snapshot, ordered by pool id
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by_key(|s| s.pool);
        stats
    }
}
