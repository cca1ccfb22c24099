//! On-disk package layout
//!
//! A package `P` lives at `<root>/P/`. Its module descriptors are the
//! `*.json` files in `<root>/P/<manifest_dir>/`, read in file-name order, and
//! its bundle is `<root>/P/<bundle_dir>/<DLL_PREFIX>p<DLL_SUFFIX>` where `p`
//! is `P` with `-` replaced by `_`.

use std::fs;
use std::path::{Path, PathBuf};

use dock_core::DeployError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::system::config::RuntimeConfig;

/// Strip leading slashes so `/x.v1` and `x.v1` name the same route.
pub fn normalize_address(address: &str) -> String {
    address.trim_start_matches('/').to_string()
}

/// File name of the bundle built for `package`.
pub fn bundle_file_name(package: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        package.replace('-', "_"),
        std::env::consts::DLL_SUFFIX
    )
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "moduleClass")]
    class_ref: String,
    address: String,
    #[serde(rename = "initClass", default)]
    init_ref: Option<String>,
    #[serde(flatten)]
    config: serde_json::Map<String, serde_json::Value>,
}

/// One module a package exposes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleDescriptor {
    /// Exported module class.
    pub class_ref: String,
    /// Normalised address.
    pub address: String,
    /// Shared initializer declared by this descriptor.
    pub init_ref: Option<String>,
    /// Remaining descriptor keys, handed to the module.
    pub config: serde_json::Value,
    /// Descriptor file.
    pub source: PathBuf,
}

/// Everything needed to deploy a package, read from disk.
#[derive(Debug, Clone, Serialize)]
pub struct PackagePlan {
    /// Package name.
    pub package: String,
    /// Bundle to load.
    pub bundle: PathBuf,
    /// Module descriptors in file-name order.
    pub modules: Vec<ModuleDescriptor>,
    /// Shared initializer of the package, from the first descriptor declaring one.
    pub shared_init: Option<String>,
}

impl PackagePlan {
    /// Addresses in descriptor order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.address.as_str())
    }
}

/// Resolves package names to their directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLayout {
    root: PathBuf,
    manifest_dir: String,
    bundle_dir: String,
}

impl PackageLayout {
    /// Layout rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        manifest_dir: impl Into<String>,
        bundle_dir: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            manifest_dir: manifest_dir.into(),
            bundle_dir: bundle_dir.into(),
        }
    }

    /// Layout described by `config`.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.packages_root.clone(),
            config.manifest_dir.clone(),
            config.bundle_dir.clone(),
        )
    }

    /// Directory holding the packages.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `package`.
    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    /// Manifest directory of `package`.
    pub fn manifest_dir(&self, package: &str) -> PathBuf {
        self.package_dir(package).join(&self.manifest_dir)
    }

    /// Bundle path of `package`.
    pub fn bundle_path(&self, package: &str) -> PathBuf {
        self.package_dir(package)
            .join(&self.bundle_dir)
            .join(bundle_file_name(package))
    }

    /// Check the artifacts of `package` and read its descriptors.
    ///
    /// Blocking: touches the filesystem.
    pub fn plan(&self, package: &str) -> Result<PackagePlan, DeployError> {
        let missing = |what: &'static str, path: PathBuf| DeployError::ArtifactMissing {
            package: package.to_string(),
            what,
            path,
        };

        if !is_plain_name(package) {
            return Err(missing("package directory", self.package_dir(package)));
        }

        let manifest_dir = self.manifest_dir(package);
        if !manifest_dir.is_dir() {
            return Err(missing("manifest directory", manifest_dir));
        }

        let bundle = self.bundle_path(package);
        if !bundle.is_file() {
            return Err(missing("bundle", bundle));
        }

        let modules = read_descriptors(package, &manifest_dir)?;
        if modules.is_empty() {
            return Err(DeployError::NoManifests {
                package: package.to_string(),
                dir: manifest_dir,
            });
        }

        let shared_init = modules.iter().find_map(|m| m.init_ref.clone());
        if let Some(first) = &shared_init {
            for module in &modules {
                if let Some(other) = module.init_ref.as_ref().filter(|r| *r != first) {
                    warn!(
                        package = %package,
                        descriptor = %module.source.display(),
                        "Descriptor names shared initializer {} but the package uses {}",
                        other,
                        first
                    );
                }
            }
        }

        debug!(package = %package, modules = modules.len(), "Read package plan");

        Ok(PackagePlan {
            package: package.to_string(),
            bundle,
            modules,
            shared_init,
        })
    }
}

fn is_plain_name(package: &str) -> bool {
    !package.is_empty()
        && package != "."
        && package != ".."
        && !package.contains(['/', '\\'])
}

fn read_descriptors(package: &str, dir: &Path) -> Result<Vec<ModuleDescriptor>, DeployError> {
    let invalid = |path: &Path, reason: String| DeployError::InvalidManifest {
        package: package.to_string(),
        path: path.to_path_buf(),
        reason,
    };

    let entries = fs::read_dir(dir).map_err(|e| invalid(dir, e.to_string()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| invalid(dir, e.to_string()))?.path();
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    files
        .into_iter()
        .map(|path| {
            let content = fs::read_to_string(&path).map_err(|e| invalid(&path, e.to_string()))?;
            let raw: RawDescriptor =
                serde_json::from_str(&content).map_err(|e| invalid(&path, e.to_string()))?;

            let address = normalize_address(&raw.address);
            if address.is_empty() {
                return Err(invalid(&path, "address is empty".to_string()));
            }
            if raw.class_ref.is_empty() {
                return Err(invalid(&path, "module class is empty".to_string()));
            }

            Ok(ModuleDescriptor {
                class_ref: raw.class_ref,
                address,
                init_ref: raw.init_ref.filter(|r| !r.is_empty()),
                config: serde_json::Value::Object(raw.config),
                source: path,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn layout(dir: &TempDir) -> PackageLayout {
        PackageLayout::new(dir.path(), "config", "build")
    }

    #[test]
    fn test_bundle_naming() {
        let name = bundle_file_name("repo-a");
        assert!(name.contains("repo_a"));
        assert!(name.ends_with(std::env::consts::DLL_SUFFIX));
        assert_eq!(normalize_address("//x.v1"), "x.v1");
    }

    #[test]
    fn test_plan_reads_descriptors_in_order() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        write(dir.path(), &format!("repo-a/build/{}", bundle_file_name("repo-a")), "");
        write(
            dir.path(),
            "repo-a/config/b.json",
            r#"{"moduleClass": "echo::Shout", "address": "/shout.v1"}"#,
        );
        write(
            dir.path(),
            "repo-a/config/a.json",
            r#"{"moduleClass": "echo::Echo", "address": "/echo.v1", "initClass": "echo::Init", "greeting": "hey"}"#,
        );
        write(dir.path(), "repo-a/config/notes.txt", "ignored");

        let plan = layout.plan("repo-a").unwrap();
        assert_eq!(plan.addresses().collect::<Vec<_>>(), vec!["echo.v1", "shout.v1"]);
        assert_eq!(plan.shared_init.as_deref(), Some("echo::Init"));
        assert_eq!(plan.modules[0].config, serde_json::json!({"greeting": "hey"}));
        assert_eq!(plan.modules[1].class_ref, "echo::Shout");
    }

    #[test]
    fn test_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        let err = layout.plan("repoA").unwrap_err();
        assert!(matches!(err, DeployError::ArtifactMissing { what: "manifest directory", .. }));

        write(dir.path(), "repoA/config/x.json", r#"{"moduleClass": "X", "address": "x"}"#);
        let err = layout.plan("repoA").unwrap_err();
        assert!(matches!(err, DeployError::ArtifactMissing { what: "bundle", .. }));
        assert!(err.is_artifact_error());

        let err = layout.plan("../etc").unwrap_err();
        assert!(matches!(err, DeployError::ArtifactMissing { .. }));
    }

    #[test]
    fn test_empty_and_malformed_manifests() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        write(dir.path(), &format!("repoA/build/{}", bundle_file_name("repoA")), "");
        fs::create_dir_all(dir.path().join("repoA/config")).unwrap();

        assert!(matches!(layout.plan("repoA"), Err(DeployError::NoManifests { .. })));

        write(dir.path(), "repoA/config/x.json", r#"{"address": "/x.v1"}"#);
        assert!(matches!(layout.plan("repoA"), Err(DeployError::InvalidManifest { .. })));

        write(dir.path(), "repoA/config/x.json", r#"{"moduleClass": "X", "address": "/"}"#);
        assert!(matches!(layout.plan("repoA"), Err(DeployError::InvalidManifest { .. })));
    }
}
