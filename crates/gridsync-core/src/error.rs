//! Error types for descriptor handling.

use thiserror::Error;

/// Result type alias for descriptor operations.
pub type DescriptorResult<T> = Result<T, DescriptorError>;

/// Errors raised while applying or instantiating descriptors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("update for application `{update}` cannot apply to `{application}`")]
    NameMismatch { application: String, update: String },

    #[error("unknown server template `{0}`")]
    UnknownServerTemplate(String),

    #[error("unknown service template `{0}`")]
    UnknownServiceTemplate(String),

    #[error("template `{template}`: no value for parameter `{parameter}`")]
    MissingParameter { template: String, parameter: String },

    #[error("unknown property set `{0}`")]
    UnknownPropertySet(String),

    #[error("property set `{0}` is referenced recursively")]
    PropertySetCycle(String),

    #[error("service instance has neither a template nor a descriptor")]
    EmptyServiceInstance,
}
