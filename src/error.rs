use crate::animation::effect::{InstanceId, TemplateId};
use thiserror::Error;

/// Recoverable failures of the effect pooling subsystem.
///
/// None of these is fatal: each is logged where it is detected and handed
/// back to the caller, who is free to ignore it.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Dispatch was requested without a template
    #[error("dispatch requested without a template")]
    NullTemplate,

    /// No pool is registered under this name
    #[error("no effect pool registered under name '{0}'")]
    UnknownName(String),

    /// The instance or handle was never issued by any pool of this router.
    /// When an instance was supplied it has been destroyed.
    #[error("{instance} does not belong to any effect pool")]
    ForeignRelease { instance: InstanceId },

    /// The instance is already back in its pool (or the handle is stale)
    #[error("{instance} was already returned to pool '{pool}'")]
    DoubleRelease { pool: String, instance: InstanceId },

    /// Two presets share the same name; the later one was rejected
    #[error("preset name '{0}' is already registered")]
    DuplicateName(String),

    /// The backend could not build an instance from the template
    #[error("could not instantiate {template} for pool '{pool}'")]
    InstantiationFailed { pool: String, template: TemplateId },

    /// Malformed JSON configuration
    #[error("invalid effect pool configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;
