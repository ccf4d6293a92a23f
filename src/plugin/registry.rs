use super::manifest::{PluginDefinition, PluginManifest};
use crate::config::PluginsConfig;
use crate::error::DiscoveryError;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of one scan: every valid plugin plus the per-plugin failures
#[derive(Debug, Default)]
pub struct Discovery {
    pub plugins: Vec<Arc<PluginDefinition>>,
    pub errors: Vec<DiscoveryError>,
}

/// Finds plugin manifests under a root directory
pub struct PluginRegistry {
    manifest_name: String,
    default_entry_point: String,
}

impl PluginRegistry {
    pub fn new(config: &PluginsConfig) -> Self {
        Self {
            manifest_name: config.manifest_name.clone(),
            default_entry_point: config.default_entry_point.clone(),
        }
    }

    /// Walk `root` recursively. Only an unreadable root fails the scan; a bad
    /// entry or manifest is recorded and the walk continues.
    pub fn discover(&self, root: &Path) -> Result<Discovery, DiscoveryError> {
        let entries = read_sorted(root).map_err(|e| DiscoveryError::RootUnreadable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();
        self.visit(entries, &mut discovery, &mut seen);

        tracing::info!(
            root = %root.display(),
            plugins = discovery.plugins.len(),
            errors = discovery.errors.len(),
            "Plugin discovery finished"
        );
        Ok(discovery)
    }

    fn visit(&self, entries: Vec<EntryResult>, discovery: &mut Discovery, seen: &mut HashSet<String>) {
        for entry in entries {
            let (path, file_type) = match entry {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!("{}", error);
                    discovery.errors.push(error);
                    continue;
                }
            };

            if file_type.is_dir() {
                match read_sorted(&path) {
                    Ok(children) => self.visit(children, discovery, seen),
                    Err(e) => {
                        let error = DiscoveryError::Traversal {
                            path,
                            reason: e.to_string(),
                        };
                        tracing::warn!("{}", error);
                        discovery.errors.push(error);
                    }
                }
                continue;
            }

            let is_manifest = path
                .file_name()
                .map(|name| name == self.manifest_name.as_str())
                .unwrap_or(false);
            if !file_type.is_file() || !is_manifest {
                continue;
            }

            match self.load(&path) {
                Ok(plugin) if !seen.insert(plugin.id().to_string()) => {
                    let error = DiscoveryError::DuplicatePlugin {
                        plugin: plugin.id().to_string(),
                        path,
                    };
                    tracing::warn!("{}", error);
                    discovery.errors.push(error);
                }
                Ok(plugin) => {
                    tracing::info!(
                        plugin = %plugin.id(),
                        name = %plugin.name(),
                        routes = plugin.routes().len(),
                        "Discovered plugin"
                    );
                    discovery.plugins.push(Arc::new(plugin));
                }
                Err(error) => {
                    tracing::warn!("{}", error);
                    discovery.errors.push(error);
                }
            }
        }
    }

    /// Parse one manifest and resolve its entry point
    pub fn load(&self, manifest_path: &Path) -> Result<PluginDefinition, DiscoveryError> {
        let malformed = |reason: String| DiscoveryError::MalformedManifest {
            path: manifest_path.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(manifest_path).map_err(|e| malformed(e.to_string()))?;
        let manifest: PluginManifest =
            serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))?;

        if manifest.id.trim().is_empty() {
            return Err(malformed("plugin id is empty".to_string()));
        }
        if manifest.name.trim().is_empty() {
            return Err(malformed("plugin name is empty".to_string()));
        }

        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let bin = manifest.services.bin.trim();
        let entry_point = root.join(if bin.is_empty() {
            self.default_entry_point.as_str()
        } else {
            bin
        });

        let is_file = fs::metadata(&entry_point)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(DiscoveryError::MissingEntryPoint {
                plugin: manifest.id,
                path: entry_point,
            });
        }

        Ok(PluginDefinition {
            manifest,
            root,
            entry_point,
        })
    }
}

type EntryResult = Result<(PathBuf, fs::FileType), DiscoveryError>;

/// Directory entries sorted by name so discovery order is stable
fn read_sorted(dir: &Path) -> std::io::Result<Vec<EntryResult>> {
    let mut entries: Vec<EntryResult> = fs::read_dir(dir)?
        .map(|entry| {
            let entry = entry.map_err(|e| DiscoveryError::Traversal {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
            let file_type = entry.file_type().map_err(|e| DiscoveryError::Traversal {
                path: entry.path(),
                reason: e.to_string(),
            })?;
            Ok((entry.path(), file_type))
        })
        .collect();

    entries.sort_by(|a, b| match (a, b) {
        (Ok((a, _)), Ok((b, _))) => a.cmp(b),
        (Err(_), Ok(_)) => std::cmp::Ordering::Less,
        (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => std::cmp::Ordering::Equal,
    });
    Ok(entries)
}
