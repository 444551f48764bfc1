//! Capabilities the pooling core needs from a rendering backend.
//!
//! The pool never talks to a renderer directly. A template knows how to build
//! instances, and an instance knows how to switch itself on and off, replay
//! from time zero, and report the timed sub-effects it contains.

use serde::Serialize;
use std::fmt;

/// Identity of a template (e.g. the object id of a loaded scene resource)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TemplateId(pub i64);

/// Identity of one pooled instance (e.g. the object id of a scene node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub i64);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template#{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// A timed element embedded in an instance (a particle emitter, a sprite
/// animation, ...). Values are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimedSubEffect {
    /// Nominal play duration (emission window)
    pub duration: f64,
    /// Longest time a single emitted element stays alive
    pub max_element_lifetime: f64,
}

impl TimedSubEffect {
    /// Negative or NaN inputs are clamped to zero
    pub fn new(duration: f64, max_element_lifetime: f64) -> Self {
        Self {
            duration: non_negative(duration),
            max_element_lifetime: non_negative(max_element_lifetime),
        }
    }

    /// Time until the last element emitted by this sub-effect has faded out
    pub fn span(&self) -> f64 {
        self.duration + self.max_element_lifetime
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        0.0
    } else {
        value
    }
}

/// One pooled occurrence of a template.
///
/// Implementations are cheap reference types: cloning an instance clones a
/// reference to the same backend object, not the object itself.
pub trait EffectInstance: Clone {
    /// Placement target instances are parented under while pooled
    type Container;

    fn instance_id(&self) -> InstanceId;

    /// Make the instance visible and running
    fn activate(&mut self);

    /// Hide the instance and stop all output
    fn deactivate(&mut self);

    /// Clear transient state, resimulate from time zero and resume playback
    fn restart(&mut self);

    /// Timed sub-effects contained in this instance, possibly none
    fn sub_effects(&self) -> Vec<TimedSubEffect>;

    /// Put the instance back to a canonical placement: parented under
    /// `container` (when given) with no leftover transform from a prior use.
    fn reset_placement(&mut self, container: Option<&Self::Container>);

    /// Permanently free the backend object
    fn destroy(self);

    /// False once the backend object was freed by someone else
    fn is_valid(&self) -> bool {
        true
    }
}

/// Immutable descriptor instances are cloned from.
pub trait EffectTemplate {
    type Instance: EffectInstance;

    fn template_id(&self) -> TemplateId;

    /// Symbolic name used when a dispatch does not supply one
    fn identifier(&self) -> String;

    /// Build a fresh instance parented under `container`.
    /// Returns `None` when the backend cannot produce one.
    fn instantiate(
        &self,
        container: Option<&<Self::Instance as EffectInstance>::Container>,
    ) -> Option<Self::Instance>;
}

/// Container type of a template's instances
pub type ContainerOf<T> = <<T as EffectTemplate>::Instance as EffectInstance>::Container;
