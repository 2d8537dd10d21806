//! Effective-configuration resolution.
//!
//! The resolver ties the pieces together: match the agent's labels against
//! the selector sequence, assemble the merge input list from the current
//! document snapshot, deep-merge, validate, and fingerprint. It is
//! referentially transparent over one snapshot: identical labels yield
//! byte-identical output and therefore identical fingerprints.

pub mod merger;
pub mod selector;
pub mod validator;

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

pub use merger::MergeError;
pub use selector::SelectorMatcher;
pub use validator::{ConfigValidator, ValidationError};

use crate::model::{Agent, ConfigSelector, EffectiveConfig, fingerprint};
use crate::store::{ConfigStore, LoadError};

/// Name used for the base fallback configuration.
const BASE_CONFIG_NAME: &str = "base";

/// Errors produced while resolving an effective configuration.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A selector points at an agent config path that is not in the
    /// document set.
    #[error("agent config not found: {path}")]
    ConfigNotFound {
        /// The missing relative path.
        path: String,
    },

    /// No selector with the requested name exists.
    #[error("selector not found: {name}")]
    SelectorNotFound {
        /// The requested selector name.
        name: String,
    },

    /// The merge inputs could not be combined.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The merged document is ill-formed.
    #[error("merged config validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Resolves effective configurations for agents against the current
/// document snapshot.
#[derive(Debug)]
pub struct Resolver {
    store: Arc<ConfigStore>,
    matcher: SelectorMatcher,
    validator: Option<ConfigValidator>,
}

impl Resolver {
    /// Creates a resolver over `store`. When `validator` is `None`, merged
    /// documents are delivered without structural checks.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, validator: Option<ConfigValidator>) -> Self {
        Self {
            store,
            matcher: SelectorMatcher::default(),
            validator,
        }
    }

    /// Reloads the document set from `dir` and refreshes the selector
    /// sequence. On error the previous snapshot and selectors stay active.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] when the directory cannot be loaded.
    pub fn reload(&self, dir: &Path) -> Result<(), LoadError> {
        self.store.load_from_directory(dir)?;
        self.matcher.update(self.store.snapshot().selectors.clone());
        Ok(())
    }

    /// Resolves the effective configuration for `agent`.
    ///
    /// Returns `Ok(None)` when no selector matches and no base document
    /// exists: the agent keeps whatever configuration it has.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the matched selector points at a
    /// missing config, the merge fails, or validation rejects the result.
    pub fn resolve(&self, agent: &Agent) -> Result<Option<EffectiveConfig>, ResolveError> {
        let snapshot = self.store.snapshot();

        let Some(selector) = self.matcher.match_first(&agent.labels) else {
            let Some(base) = snapshot.base.as_ref().filter(|b| !b.is_empty()) else {
                return Ok(None);
            };
            return Ok(Some(EffectiveConfig {
                name: BASE_CONFIG_NAME.to_string(),
                fingerprint: fingerprint(base),
                content: base.clone(),
                source_selector_name: String::new(),
            }));
        };

        self.build(&snapshot, &selector).map(Some)
    }

    /// Resolves the effective configuration a named selector would produce.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::SelectorNotFound`] for unknown names, plus
    /// the same errors as [`Resolver::resolve`].
    pub fn resolve_selector(&self, name: &str) -> Result<EffectiveConfig, ResolveError> {
        let selector = self
            .matcher
            .get()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ResolveError::SelectorNotFound {
                name: name.to_string(),
            })?;
        self.build(&self.store.snapshot(), &selector)
    }

    /// Returns a copy of the current selector sequence.
    #[must_use]
    pub fn selectors(&self) -> Vec<ConfigSelector> {
        self.matcher.get()
    }

    fn build(
        &self,
        snapshot: &crate::store::DocumentSet,
        selector: &ConfigSelector,
    ) -> Result<EffectiveConfig, ResolveError> {
        let agent_config = snapshot
            .agent_configs
            .get(&selector.config)
            .ok_or_else(|| ResolveError::ConfigNotFound {
                path: selector.config.clone(),
            })?;

        let mut inputs: Vec<&[u8]> = Vec::with_capacity(3);
        if let Some(base) = snapshot.base.as_ref().filter(|b| !b.is_empty()) {
            inputs.push(base);
        }
        if let Some(overlay_name) = &selector.overlay {
            match snapshot.overlays.get(overlay_name) {
                Some(overlay) => inputs.push(overlay),
                None => warn!(
                    overlay = %overlay_name,
                    selector = %selector.name,
                    "overlay named by selector not found, continuing without it"
                ),
            }
        }
        inputs.push(agent_config);

        let merged = merger::merge_all(&inputs)?;
        if let Some(validator) = &self.validator {
            validator.validate(&merged)?;
        }

        Ok(EffectiveConfig {
            name: selector.name.clone(),
            fingerprint: fingerprint(&merged),
            content: merged,
            source_selector_name: selector.name.clone(),
        })
    }
}
