use crate::animation::effect::{ContainerOf, EffectInstance, EffectTemplate, InstanceId, TemplateId};
use crate::animation::lifetime::{LifetimeController, LifetimeTimer};
use crate::error::{PoolError, PoolResult};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use ulid::Ulid;

/// Identifies a pool within its router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolId(pub u64);

/// Opaque handle issued for one dispatch of one instance.
///
/// The ticket is fresh per dispatch, so a handle kept past its release never
/// matches the instance's next activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectHandle {
    pub pool: PoolId,
    pub instance: InstanceId,
    pub ticket: Ulid,
}

/// Result of a release that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The instance went back to the inactive set
    Returned,
    /// Repeated or stale release absorbed without collision checks
    Ignored,
}

/// Instance taken out of the inactive set by [`EffectPool::get`]
#[derive(Debug, Clone)]
pub struct Checkout<I> {
    pub instance: I,
    pub ticket: Ulid,
}

/// Snapshot of one pool's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub pool: PoolId,
    pub name: String,
    pub template: TemplateId,
    pub active: usize,
    pub inactive: usize,
    pub instantiated: usize,
}

/// An owned instance together with its lifetime timer state
struct PooledEffect<I> {
    instance: I,
    lifetime: LifetimeController,
}

/// Pool of clones of a single template.
///
/// Keeps every owned instance in `pool`; ids of available instances sit in
/// `inactive`, ids of dispatched ones in `active` together with the ticket of
/// their current dispatch. Backend calls are never made while a map guard is
/// held, so an instance may call back into the pool from `deactivate`.
pub struct EffectPool<T: EffectTemplate> {
    /// Router-assigned id
    id: PoolId,

    /// Template every instance is cloned from
    template: Arc<T>,

    /// Every owned instance (instance id -> instance + lifetime)
    pool: DashMap<InstanceId, PooledEffect<T::Instance>>,

    /// Ids of available instances
    inactive: SegQueue<InstanceId>,

    /// Ids of dispatched instances -> ticket of the current dispatch
    active: DashMap<InstanceId, Ulid>,

    /// Total number of instances ever cloned from the template
    instantiated: AtomicUsize,

    /// Placement target shared with the router
    container: Arc<RwLock<Option<ContainerOf<T>>>>,

    /// Report repeated releases instead of silently absorbing them
    collision_checks: bool,

    /// Set once the missing-container warning has been logged
    warned_unplaced: AtomicBool,

    /// Pool name for logging
    pool_name: String,
}

impl<T: EffectTemplate> EffectPool<T> {
    /// Create a pool and pre-create `capacity` inactive instances
    pub fn new(
        id: PoolId,
        pool_name: &str,
        template: Arc<T>,
        container: Arc<RwLock<Option<ContainerOf<T>>>>,
        capacity: usize,
        collision_checks: bool,
    ) -> Self {
        let pool = Self {
            id,
            template,
            pool: DashMap::new(),
            inactive: SegQueue::new(),
            active: DashMap::new(),
            instantiated: AtomicUsize::new(0),
            container,
            collision_checks,
            warned_unplaced: AtomicBool::new(false),
            pool_name: pool_name.to_string(),
        };

        let created = pool.warmup(capacity);
        tracing::debug!(
            "[{} POOL] Initialized: template={}, capacity={}, created={}, collision_checks={}",
            pool.pool_name,
            pool.template.template_id(),
            capacity,
            created,
            collision_checks
        );
        pool
    }

    /// Clone one new instance from the template and park it as inactive
    fn instantiate(&self) -> Option<InstanceId> {
        let container = self.container.read();
        let unplaced = container.is_none();
        let instance = self.template.instantiate(container.as_ref());
        drop(container);
        let mut instance = instance?;

        if unplaced && !self.warned_unplaced.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "[{} POOL] Scene container not set! Instances stay unparented until one is set",
                self.pool_name
            );
        }

        instance.deactivate();
        let id = instance.instance_id();
        self.pool.insert(
            id,
            PooledEffect {
                instance,
                lifetime: LifetimeController::new(),
            },
        );
        self.instantiated.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Create exactly `count` new inactive instances, regardless of how many
    /// already exist. Returns how many were actually created.
    pub fn warmup(&self, count: usize) -> usize {
        let mut created = 0;
        for i in 0..count {
            match self.instantiate() {
                Some(id) => {
                    self.inactive.push(id);
                    created += 1;
                }
                None => {
                    tracing::warn!(
                        "[{} POOL] Failed to create effect {}/{}",
                        self.pool_name,
                        i + 1,
                        count
                    );
                    break;
                }
            }
        }
        created
    }

    /// Take an available instance (or clone a new one), mark it active and
    /// activate it.
    pub fn get(&self) -> PoolResult<Checkout<T::Instance>> {
        let (id, mut instance) = loop {
            match self.inactive.pop() {
                Some(id) => {
                    let Some(instance) = self.pool.get(&id).map(|slot| slot.instance.clone()) else {
                        self.corrupted_index("inactive", id);
                        continue;
                    };
                    if instance.is_valid() {
                        break (id, instance);
                    }
                    // Freed behind our back while pooled
                    tracing::debug!("[{} POOL] Dropping invalidated {}", self.pool_name, id);
                    self.pool.remove(&id);
                }
                None => {
                    let id = self.instantiate().ok_or_else(|| {
                        tracing::warn!(
                            "[{} POOL] Could not instantiate {}",
                            self.pool_name,
                            self.template.template_id()
                        );
                        PoolError::InstantiationFailed {
                            pool: self.pool_name.clone(),
                            template: self.template.template_id(),
                        }
                    })?;
                    let Some(instance) = self.pool.get(&id).map(|slot| slot.instance.clone()) else {
                        self.corrupted_index("new", id);
                        continue;
                    };
                    break (id, instance);
                }
            }
        };

        let ticket = Ulid::new();
        self.active.insert(id, ticket);
        instance.activate();

        Ok(Checkout { instance, ticket })
    }

    /// Return a dispatched instance to the inactive set.
    ///
    /// Only succeeds while `handle` matches the instance's current dispatch.
    /// A repeated or stale release leaves the pool untouched and is reported
    /// as [`PoolError::DoubleRelease`] when collision checks are enabled.
    pub fn release(&self, handle: &EffectHandle) -> PoolResult<ReleaseOutcome> {
        let id = handle.instance;
        if self.active.remove_if(&id, |_, ticket| *ticket == handle.ticket).is_none() {
            return self.reject_release(id);
        }

        let Some(mut instance) = self.pool.get_mut(&id).map(|mut slot| {
            slot.lifetime.cancel();
            slot.instance.clone()
        }) else {
            self.corrupted_index("active", id);
            return Ok(ReleaseOutcome::Ignored);
        };

        instance.deactivate();
        let container = self.container.read();
        instance.reset_placement(container.as_ref());
        drop(container);

        if instance.is_valid() {
            self.inactive.push(id);
        } else {
            self.pool.remove(&id);
        }

        Ok(ReleaseOutcome::Returned)
    }

    /// Outcome for a release that does not match an active dispatch
    pub fn reject_release(&self, instance: InstanceId) -> PoolResult<ReleaseOutcome> {
        if self.collision_checks {
            tracing::warn!(
                "[{} POOL] Ignoring release of {}: not active in this pool",
                self.pool_name,
                instance
            );
            Err(PoolError::DoubleRelease {
                pool: self.pool_name.clone(),
                instance,
            })
        } else {
            Ok(ReleaseOutcome::Ignored)
        }
    }

    /// Arm the lifetime timer of an active instance.
    /// Returns `None` if `handle` does not match the current dispatch.
    pub fn arm_lifetime(&self, handle: &EffectHandle, now_ms: u64, duration_secs: f64) -> Option<LifetimeTimer> {
        if !self.is_current(handle) {
            return None;
        }
        self.pool
            .get_mut(&handle.instance)
            .map(|mut slot| slot.lifetime.init(now_ms, duration_secs))
    }

    /// True while `handle`'s dispatch is live and its timer carries `token`
    pub fn lifetime_armed_with(&self, handle: &EffectHandle, token: u64) -> bool {
        self.is_current(handle)
            && self
                .pool
                .get(&handle.instance)
                .is_some_and(|slot| slot.lifetime.is_armed_with(token))
    }

    /// True while `handle`'s dispatch is live and its timer is pending
    pub fn lifetime_armed(&self, handle: &EffectHandle) -> bool {
        self.is_current(handle)
            && self
                .pool
                .get(&handle.instance)
                .is_some_and(|slot| slot.lifetime.is_armed())
    }

    /// True while `handle` matches the instance's current dispatch
    pub fn is_current(&self, handle: &EffectHandle) -> bool {
        handle.pool == self.id
            && self
                .active
                .get(&handle.instance)
                .is_some_and(|ticket| *ticket == handle.ticket)
    }

    /// Whether this pool owns `instance`, active or not
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.pool.contains_key(&instance)
    }

    /// Destroy every inactive instance, and every active one when
    /// `destroy_active` is set. Both sets are emptied either way.
    pub fn clear(&self, destroy_active: bool) {
        let mut destroyed = 0;
        while let Some(id) = self.inactive.pop() {
            if let Some((_, slot)) = self.pool.remove(&id) {
                slot.instance.destroy();
                destroyed += 1;
            }
        }

        let active: Vec<InstanceId> = self.active.iter().map(|entry| *entry.key()).collect();
        self.active.clear();
        for id in active {
            if let Some((_, slot)) = self.pool.remove(&id) {
                if destroy_active {
                    slot.instance.destroy();
                    destroyed += 1;
                }
            }
        }

        self.pool.clear();
        tracing::debug!(
            "[{} POOL] Cleared: destroyed={}, destroy_active={}",
            self.pool_name,
            destroyed,
            destroy_active
        );
    }

    fn corrupted_index(&self, set: &str, id: InstanceId) {
        tracing::error!(
            "[{} POOL] Corrupted index: {} listed as {} but not owned",
            self.pool_name,
            id,
            set
        );
        debug_assert!(false, "{} listed as {} but not owned by pool", id, set);
    }

    pub fn count_inactive(&self) -> usize {
        self.inactive.len()
    }

    pub fn count_active(&self) -> usize {
        self.active.len()
    }

    pub fn count_all(&self) -> usize {
        self.count_inactive() + self.count_active()
    }

    /// Number of instances the pool holds a reference to
    pub fn owned(&self) -> usize {
        self.pool.len()
    }

    /// Total number of instances cloned from the template
    pub fn instantiated(&self) -> usize {
        self.instantiated.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.pool_name
    }

    pub fn template(&self) -> &Arc<T> {
        &self.template
    }

    pub fn collision_checks(&self) -> bool {
        self.collision_checks
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool: self.id,
            name: self.pool_name.clone(),
            template: self.template.template_id(),
            active: self.count_active(),
            inactive: self.count_inactive(),
            instantiated: self.instantiated(),
        }
    }
}
