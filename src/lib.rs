use godot::prelude::*;

pub mod animation;
pub mod config;
pub mod error;
pub mod logging;

pub use animation::{
    DispatchedEffect, EffectHandle, EffectInstance, EffectPool, EffectPreset, EffectRouter, EffectTemplate,
    InstanceId, ReleaseOutcome, TemplateId, TimedSubEffect,
};
pub use config::{PresetConfig, RouterConfig};
pub use error::{PoolError, PoolResult};

struct FxPool;

#[gdextension]
unsafe impl ExtensionLibrary for FxPool {
    fn on_level_init(level: InitLevel) {
        if level == InitLevel::Scene {
            if !logging::init(tracing::Level::INFO) {
                godot_warn!("FxPool: a tracing subscriber is already installed, pool diagnostics go there");
            }
            godot_print!("FxPool v0.1.0 - effect pool GDExtension loaded successfully!");
        }
    }
}
