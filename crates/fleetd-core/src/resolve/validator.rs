//! Structural validation of merged collector documents.
//!
//! Two levels: every document must be a mapping with a well-formed
//! `service.pipelines` section, and strict mode additionally requires every
//! component referenced by a pipeline (or by `service.extensions`) to be
//! defined in the matching top-level section. Validation is purely
//! structural; component behavior is never interpreted.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

/// Validation failures, naming the offending pipeline or component.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The document is not syntactically valid YAML.
    #[error("invalid YAML: {message}")]
    InvalidSyntax {
        /// Parse failure description.
        message: String,
    },

    /// The document does not parse as a mapping.
    #[error("document is not a mapping")]
    NotAMapping,

    /// The required `service` section is missing.
    #[error("missing required 'service' section")]
    MissingService,

    /// `service.pipelines` is missing or empty.
    #[error("no pipelines defined in service section")]
    NoPipelines,

    /// A pipeline defines no receivers.
    #[error("pipeline {pipeline:?} has no receivers")]
    NoReceivers {
        /// The offending pipeline.
        pipeline: String,
    },

    /// A pipeline defines no exporters.
    #[error("pipeline {pipeline:?} has no exporters")]
    NoExporters {
        /// The offending pipeline.
        pipeline: String,
    },

    /// A pipeline references a component with no top-level definition.
    #[error("pipeline {pipeline:?} references undefined {kind} {name:?}")]
    UndefinedComponent {
        /// The offending pipeline.
        pipeline: String,
        /// Component kind: receiver, processor, or exporter.
        kind: &'static str,
        /// The missing component name.
        name: String,
    },

    /// `service.extensions` references an extension with no definition.
    #[error("service references undefined extension {name:?}")]
    UndefinedExtension {
        /// The missing extension name.
        name: String,
    },
}

#[derive(Debug, Deserialize, Default)]
struct CollectorDocument {
    #[serde(default)]
    receivers: BTreeMap<String, Value>,
    #[serde(default)]
    processors: BTreeMap<String, Value>,
    #[serde(default)]
    exporters: BTreeMap<String, Value>,
    #[serde(default)]
    extensions: BTreeMap<String, Value>,
    service: Option<ServiceSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceSection {
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    pipelines: BTreeMap<String, Pipeline>,
}

#[derive(Debug, Deserialize, Default)]
struct Pipeline {
    #[serde(default)]
    receivers: Vec<String>,
    #[serde(default)]
    processors: Vec<String>,
    #[serde(default)]
    exporters: Vec<String>,
}

/// Structural validator for collector documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator {
    /// When set, referenced components must be defined at the top level.
    pub strict: bool,
}

impl ConfigValidator {
    /// Creates a validator.
    #[must_use]
    pub const fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Validates `content`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self, content: &[u8]) -> Result<(), ValidationError> {
        let value: Value =
            serde_yaml::from_slice(content).map_err(|e| ValidationError::InvalidSyntax {
                message: e.to_string(),
            })?;
        if !value.is_mapping() {
            return Err(ValidationError::NotAMapping);
        }

        let doc: CollectorDocument =
            serde_yaml::from_value(value).map_err(|e| ValidationError::InvalidSyntax {
                message: e.to_string(),
            })?;
        let service = doc.service.as_ref().ok_or(ValidationError::MissingService)?;
        if service.pipelines.is_empty() {
            return Err(ValidationError::NoPipelines);
        }

        for (name, pipeline) in &service.pipelines {
            if pipeline.receivers.is_empty() {
                return Err(ValidationError::NoReceivers {
                    pipeline: name.clone(),
                });
            }
            if pipeline.exporters.is_empty() {
                return Err(ValidationError::NoExporters {
                    pipeline: name.clone(),
                });
            }

            if self.strict {
                check_refs(name, "receiver", &pipeline.receivers, &doc.receivers)?;
                check_refs(name, "processor", &pipeline.processors, &doc.processors)?;
                check_refs(name, "exporter", &pipeline.exporters, &doc.exporters)?;
            }
        }

        if self.strict {
            for ext in &service.extensions {
                if !doc.extensions.contains_key(ext) {
                    return Err(ValidationError::UndefinedExtension { name: ext.clone() });
                }
            }
        }

        Ok(())
    }
}

fn check_refs(
    pipeline: &str,
    kind: &'static str,
    refs: &[String],
    defined: &BTreeMap<String, Value>,
) -> Result<(), ValidationError> {
    for name in refs {
        if !defined.contains_key(name) {
            return Err(ValidationError::UndefinedComponent {
                pipeline: pipeline.to_string(),
                kind,
                name: name.clone(),
            });
        }
    }
    Ok(())
}
