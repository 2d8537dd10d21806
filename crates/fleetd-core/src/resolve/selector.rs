//! Ordered first-match label selector matching.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::model::ConfigSelector;

/// Matches agent labels against an ordered selector sequence.
///
/// Safe for concurrent readers and one writer; reads return clones so
/// callers are insulated from later [`SelectorMatcher::update`] calls.
#[derive(Debug, Default)]
pub struct SelectorMatcher {
    selectors: RwLock<Vec<ConfigSelector>>,
}

impl SelectorMatcher {
    /// Creates a matcher over an initial selector sequence.
    #[must_use]
    pub fn new(selectors: Vec<ConfigSelector>) -> Self {
        Self {
            selectors: RwLock::new(selectors),
        }
    }

    /// Returns the first selector, in file order, whose match labels are all
    /// present in `labels` with equal values. A selector with empty match
    /// labels is inert and never matches.
    #[must_use]
    pub fn match_first(&self, labels: &BTreeMap<String, String>) -> Option<ConfigSelector> {
        self.read().iter().find(|s| matches(labels, s)).cloned()
    }

    /// Returns every matching selector, in file order.
    #[must_use]
    pub fn match_all(&self, labels: &BTreeMap<String, String>) -> Vec<ConfigSelector> {
        self.read()
            .iter()
            .filter(|s| matches(labels, s))
            .cloned()
            .collect()
    }

    /// Replaces the selector sequence.
    pub fn update(&self, selectors: Vec<ConfigSelector>) {
        *self
            .selectors
            .write()
            .unwrap_or_else(PoisonError::into_inner) = selectors;
    }

    /// Returns a copy of the current selector sequence.
    #[must_use]
    pub fn get(&self) -> Vec<ConfigSelector> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<ConfigSelector>> {
        self.selectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn matches(labels: &BTreeMap<String, String>, selector: &ConfigSelector) -> bool {
    if selector.matches.labels.is_empty() {
        return false;
    }
    selector
        .matches
        .labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}
