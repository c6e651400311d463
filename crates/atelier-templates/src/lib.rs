pub mod calculators;
pub mod model;
pub mod presets;
pub mod recommendation;
pub mod registry;
pub mod report;
pub mod validation;

pub use calculators::*;
pub use model::*;
pub use presets::*;
pub use recommendation::*;
pub use registry::*;
pub use report::*;
pub use validation::*;

use atelier_types::{ErrorCode, ErrorDetails, ErrorPayload};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template '{id}' not found")]
    NotFound { id: String },
    #[error("template '{id}' version '{version}' not found")]
    VersionNotFound { id: String, version: String },
    #[error("template validation failed with {} error(s)", report.errors().count())]
    ValidationFailed { report: validation::ValidationReport },
    #[error("input '{field}' invalid: {message}")]
    InputValidation { field: String, message: String },
    #[error("failed to read template file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse template file {path}: {message}")]
    Parse { path: String, message: String },
}

impl TemplateError {
    /// Convert into the caller-facing payload shape.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            TemplateError::NotFound { .. } | TemplateError::VersionNotFound { .. } => {
                ErrorPayload::new(ErrorCode::ResourceNotFound, self.to_string()).with_details(
                    ErrorDetails {
                        resource_type: Some("template".to_string()),
                        ..ErrorDetails::default()
                    },
                )
            }
            TemplateError::InputValidation { field, message } => {
                ErrorPayload::new(ErrorCode::ValidationError, message.clone()).with_details(
                    ErrorDetails {
                        field: Some(field.clone()),
                        ..ErrorDetails::default()
                    },
                )
            }
            other => ErrorPayload::new(ErrorCode::ValidationError, other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("preset '{id}' not found")]
    NotFound { id: String },
    #[error("preset '{preset}' incompatible with template '{template}': {reason}")]
    Incompatible {
        preset: String,
        template: String,
        reason: String,
    },
    #[error("preset '{id}' inherits from '{base}', which itself inherits; only one level is allowed")]
    InheritanceTooDeep { id: String, base: String },
    #[error("preset '{id}' inherits from unknown preset '{base}'")]
    UnknownBase { id: String, base: String },
    #[error("preset id '{id}' already exists")]
    Duplicate { id: String },
}
