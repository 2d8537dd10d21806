//! In-memory snapshot of the configuration repository contents.
//!
//! The store holds one immutable [`DocumentSet`] at a time. Reloading builds
//! a complete new set in isolation and swaps a single reference, so readers
//! always observe either the fully old or the fully new set. A failed load
//! leaves the previous snapshot active.
//!
//! # Repository layout
//!
//! ```text
//! base/collector.yaml              the base document (optional)
//! overlays/<name>/collector.yaml   one document per overlay
//! agents/_selectors.yaml           ordered selector list (optional)
//! agents/**/*.yaml                 agent configs, keyed by relative path
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::model::{ConfigSelector, SelectorsFile};

/// File name shared by the base document and every overlay.
const COLLECTOR_FILE: &str = "collector.yaml";

/// File name of the selector list inside `agents/`.
const SELECTORS_FILE: &str = "_selectors.yaml";

/// Errors produced while loading a document set from disk.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A file or directory could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the offending file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A document is not syntactically valid YAML.
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// One immutable snapshot of the configuration repository.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    /// The base document, if present.
    pub base: Option<Vec<u8>>,
    /// Overlay documents keyed by overlay name.
    pub overlays: HashMap<String, Vec<u8>>,
    /// Agent documents keyed by path relative to `agents/`.
    pub agent_configs: HashMap<String, Vec<u8>>,
    /// The ordered selector sequence.
    pub selectors: Vec<ConfigSelector>,
}

impl DocumentSet {
    /// Loads a complete document set from `dir`, walking the fixed layout.
    ///
    /// Missing optional files and directories are not errors; syntactically
    /// invalid YAML is.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] with path context on unreadable or invalid
    /// files.
    pub fn load(dir: &Path) -> Result<Self, LoadError> {
        let mut set = Self::default();

        let base_path = dir.join("base").join(COLLECTOR_FILE);
        if let Some(data) = read_optional(&base_path)? {
            check_yaml(&base_path, &data)?;
            debug!(path = %base_path.display(), "loaded base config");
            set.base = Some(data);
        }

        let overlays_dir = dir.join("overlays");
        if overlays_dir.is_dir() {
            let entries = std::fs::read_dir(&overlays_dir).map_err(|source| LoadError::Io {
                path: overlays_dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| LoadError::Io {
                    path: overlays_dir.clone(),
                    source,
                })?;
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let overlay_path = entry.path().join(COLLECTOR_FILE);
                if let Some(data) = read_optional(&overlay_path)? {
                    check_yaml(&overlay_path, &data)?;
                    debug!(overlay = %name, path = %overlay_path.display(), "loaded overlay");
                    set.overlays.insert(name, data);
                }
            }
        }

        let agents_dir = dir.join("agents");
        if agents_dir.is_dir() {
            walk_agent_configs(&agents_dir, &agents_dir, &mut set.agent_configs)?;

            let selectors_path = agents_dir.join(SELECTORS_FILE);
            if let Some(data) = read_optional(&selectors_path)? {
                let file: SelectorsFile =
                    serde_yaml::from_slice(&data).map_err(|source| LoadError::Parse {
                        path: selectors_path.clone(),
                        source,
                    })?;
                set.selectors = file.selectors;
            }
        }

        info!(
            base = set.base.is_some(),
            overlays = set.overlays.len(),
            agent_configs = set.agent_configs.len(),
            selectors = set.selectors.len(),
            "loaded document set"
        );
        Ok(set)
    }
}

/// Atomic holder of the latest [`DocumentSet`].
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<DocumentSet>>,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a new document set from `dir` and swaps it in. On error the
    /// previous snapshot remains active.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] when any file is unreadable or invalid.
    pub fn load_from_directory(&self, dir: &Path) -> Result<(), LoadError> {
        let set = DocumentSet::load(dir)?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(set);
        Ok(())
    }

    /// Returns the current snapshot. The returned set is immutable; later
    /// reloads do not affect it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<DocumentSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, LoadError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn check_yaml(path: &Path, data: &[u8]) -> Result<(), LoadError> {
    serde_yaml::from_slice::<serde_yaml::Value>(data)
        .map(|_| ())
        .map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn walk_agent_configs(
    root: &Path,
    dir: &Path,
    out: &mut HashMap<String, Vec<u8>>,
) -> Result<(), LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk_agent_configs(root, &path, out)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("yaml")
            || path.file_name().and_then(|n| n.to_str()) == Some(SELECTORS_FILE)
        {
            continue;
        }
        let data = std::fs::read(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        check_yaml(&path, &data)?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        debug!(path = %rel, "loaded agent config");
        out.insert(rel, data);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn seed_layout(dir: &Path) {
        write(dir, "base/collector.yaml", "receivers:\n  otlp: {}\n");
        write(
            dir,
            "overlays/production/collector.yaml",
            "exporters:\n  otlp/gateway: {}\n",
        );
        write(
            dir,
            "agents/kubernetes/daemonset.yaml",
            "service:\n  pipelines:\n    metrics:\n      receivers: [otlp]\n      exporters: [otlp/gateway]\n",
        );
        write(
            dir,
            "agents/_selectors.yaml",
            "selectors:\n  - name: kubernetes-daemonset\n    match:\n      labels:\n        role: daemonset\n    config: kubernetes/daemonset.yaml\n    overlay: production\n",
        );
    }

    #[test]
    fn test_load_full_layout() {
        let dir = tempfile::tempdir().unwrap();
        seed_layout(dir.path());

        let store = ConfigStore::new();
        store.load_from_directory(dir.path()).unwrap();
        let snap = store.snapshot();

        assert!(snap.base.is_some());
        assert!(snap.overlays.contains_key("production"));
        assert!(snap.agent_configs.contains_key("kubernetes/daemonset.yaml"));
        assert_eq!(snap.selectors.len(), 1);
        assert_eq!(snap.selectors[0].config, "kubernetes/daemonset.yaml");
    }

    #[test]
    fn test_missing_optional_files_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        // Entirely empty repository: no base, no overlays, no agents.
        let store = ConfigStore::new();
        store.load_from_directory(dir.path()).unwrap();
        let snap = store.snapshot();
        assert!(snap.base.is_none());
        assert!(snap.overlays.is_empty());
        assert!(snap.agent_configs.is_empty());
        assert!(snap.selectors.is_empty());
    }

    #[test]
    fn test_selectors_file_is_excluded_from_agent_configs() {
        let dir = tempfile::tempdir().unwrap();
        seed_layout(dir.path());
        let store = ConfigStore::new();
        store.load_from_directory(dir.path()).unwrap();
        assert!(!store
            .snapshot()
            .agent_configs
            .contains_key("_selectors.yaml"));
    }

    #[test]
    fn test_invalid_yaml_rejected_and_old_snapshot_kept() {
        let dir = tempfile::tempdir().unwrap();
        seed_layout(dir.path());
        let store = ConfigStore::new();
        store.load_from_directory(dir.path()).unwrap();

        write(dir.path(), "agents/_selectors.yaml", "selectors: [unclosed");
        let err = store.load_from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(err.to_string().contains("_selectors.yaml"));

        // The previous snapshot is still served.
        let snap = store.snapshot();
        assert_eq!(snap.selectors.len(), 1);
    }

    #[test]
    fn test_snapshot_is_immutable_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        seed_layout(dir.path());
        let store = ConfigStore::new();
        store.load_from_directory(dir.path()).unwrap();
        let before = store.snapshot();

        write(dir.path(), "base/collector.yaml", "receivers:\n  jaeger: {}\n");
        store.load_from_directory(dir.path()).unwrap();

        assert!(String::from_utf8_lossy(before.base.as_deref().unwrap()).contains("otlp"));
        assert!(String::from_utf8_lossy(store.snapshot().base.as_deref().unwrap())
            .contains("jaeger"));
    }
}
