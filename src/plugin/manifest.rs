use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A plugin's `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_url: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub services: PluginServices,
    #[serde(default)]
    pub interface: PluginInterface,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginServices {
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    #[serde(default)]
    pub middleware: Vec<MiddlewareDescriptor>,
    /// Entry point relative to the plugin directory
    #[serde(default)]
    pub bin: String,
    /// Documentation directory relative to the plugin directory
    #[serde(default)]
    pub docs: String,
}

/// One route a plugin asks the host to forward to it.
///
/// `route` is the route group name and stays a raw string here; it is
/// resolved when the route is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    #[serde(default)]
    pub name: String,
    pub route: String,
    pub method: String,
    pub url: String,
}

/// A middleware callout a plugin asks to run at a rank.
///
/// `rank` is kept as raw JSON so that a bad value only rejects this
/// middleware at registration, not the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareDescriptor {
    #[serde(default)]
    pub name: String,
    pub rank: serde_json::Value,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInterface {
    #[serde(default)]
    pub public: String,
    #[serde(default)]
    pub public_vendor: String,
}

/// A discovered plugin: its manifest plus where it lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDefinition {
    pub manifest: PluginManifest,
    pub root: PathBuf,
    pub entry_point: PathBuf,
}

impl PluginDefinition {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.manifest.services.routes
    }

    pub fn middleware(&self) -> &[MiddlewareDescriptor] {
        &self.manifest.services.middleware
    }

    pub fn public_dir(&self) -> Option<PathBuf> {
        self.subdir(&self.manifest.interface.public)
    }

    pub fn docs_dir(&self) -> Option<PathBuf> {
        self.subdir(&self.manifest.services.docs)
    }

    fn subdir(&self, relative: &str) -> Option<PathBuf> {
        let relative = relative.trim();
        if relative.is_empty() {
            return None;
        }
        Some(self.root.join(Path::new(relative)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let json = r#"{
            "id": "blog",
            "version": "1.2.0",
            "build": 12,
            "name": "Blog",
            "description": "Posts and pages",
            "author": "Jane",
            "authorUrl": "https://example.com",
            "authorEmail": "jane@example.com",
            "services": {
                "routes": [
                    {"name": "list", "route": "Public", "method": "GET", "url": "/posts"}
                ],
                "middleware": [
                    {"name": "audit", "rank": 1000, "url": "/audit"}
                ],
                "bin": "bin/blog",
                "docs": "docs"
            },
            "interface": {"public": "public", "publicVendor": "vendor"}
        }"#;

        let manifest: PluginManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.id, "blog");
        assert_eq!(manifest.build, 12);
        assert_eq!(manifest.author_url, "https://example.com");
        assert_eq!(manifest.services.routes[0].route, "Public");
        assert_eq!(manifest.services.middleware[0].rank, serde_json::json!(1000));
        assert_eq!(manifest.interface.public_vendor, "vendor");
    }

    #[test]
    fn test_out_of_range_rank_still_parses() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{
                "id": "x",
                "name": "X",
                "services": {
                    "routes": [{"name": "a", "route": "Public", "method": "GET", "url": "/a"}],
                    "middleware": [{"name": "m", "rank": -1, "url": "/m"}]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.services.routes.len(), 1);
        assert_eq!(manifest.services.middleware[0].rank, serde_json::json!(-1));
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest: PluginManifest =
            serde_json::from_str(r#"{"id": "x", "name": "X"}"#).unwrap();
        assert!(manifest.services.routes.is_empty());
        assert!(manifest.services.bin.is_empty());

        let def = PluginDefinition {
            manifest,
            root: PathBuf::from("/plugins/x"),
            entry_point: PathBuf::from("/plugins/x/main"),
        };
        assert_eq!(def.public_dir(), None);
        assert_eq!(def.docs_dir(), None);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        assert!(serde_json::from_str::<PluginManifest>(r#"{"name": "X"}"#).is_err());
    }
}
