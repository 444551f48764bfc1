//! Animation and visual effects management module
//!
//! This module pools short-lived visual effects (death animations,
//! particles, hit sparks, ...) so they are cloned once and reused instead of
//! being instantiated and freed on every use.
//!
//! - `effect`: capabilities a rendering backend provides
//! - `effect_pool`: one pool of clones of a single template
//! - `effect_router`: routes templates and names to pools
//! - `lifetime`: automatic return to the pool once an effect has played
//! - `godot_effects`: Godot backend and the GDScript-facing router node

pub mod effect;
pub mod effect_pool;
pub mod effect_router;
pub mod godot_effects;
pub mod lifetime;

pub use effect::{EffectInstance, EffectTemplate, InstanceId, TemplateId, TimedSubEffect};
pub use effect_pool::{EffectHandle, EffectPool, PoolId, PoolStats, ReleaseOutcome};
pub use effect_router::{DispatchedEffect, EffectPreset, EffectRouter};
pub use godot_effects::{EffectNode, EffectScene, GodotEffectRouter};
pub use lifetime::{effective_duration, reclaim, LifetimeController, LifetimeScheduler};
