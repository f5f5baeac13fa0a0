//! Runtime tree resolution.
//!
//! A runtime lives at `<runtimes_root>/<name>/` with an `isolated/` subtree
//! that becomes the job's `/` and a `runtime.yml` descriptor. Specs resolve
//! through either grammar accepted by [`RuntimeSpec`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use joblet_core::{Error, Result, RuntimeSpec};
use joblet_platform::Platform;

use crate::plan::BindMount;

/// Contents of `runtime.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Architectures the tree was built for; empty means any.
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub requires_gpu: bool,
    /// Extra host paths bound into the job root, e.g. a shared model cache.
    #[serde(default)]
    pub mounts: Vec<ExtraMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraMount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// A runtime that passed resolution: the directory exists, the descriptor
/// parses, and the architecture matches this host.
#[derive(Debug, Clone)]
pub struct ResolvedRuntime {
    pub name: String,
    pub descriptor: RuntimeDescriptor,
    pub dir: PathBuf,
    pub isolated_root: PathBuf,
}

impl ResolvedRuntime {
    pub fn extra_binds(&self) -> Vec<BindMount> {
        self.descriptor
            .mounts
            .iter()
            .map(|m| BindMount {
                source: m.source.clone(),
                target: m.target.trim_start_matches('/').to_string(),
                readonly: m.readonly,
            })
            .collect()
    }
}

pub struct RuntimeManager {
    platform: Arc<dyn Platform>,
    root: PathBuf,
}

impl RuntimeManager {
    pub fn new(platform: Arc<dyn Platform>, root: PathBuf) -> Self {
        Self { platform, root }
    }

    /// Enumerate installed runtimes, skipping directories without an
    /// isolated root.
    pub fn list(&self) -> Result<Vec<ResolvedRuntime>> {
        if !self.platform.exists(&self.root) {
            return Ok(Vec::new());
        }
        let mut runtimes = Vec::new();
        for dir in self.platform.list_dir(&self.root)? {
            if !self.platform.is_dir(&dir) {
                continue;
            }
            match self.load(&dir) {
                Ok(runtime) => runtimes.push(runtime),
                Err(err) => {
                    debug!(dir = %dir.display(), error = %err, "Skipping runtime dir");
                }
            }
        }
        Ok(runtimes)
    }

    /// Resolve a spec in either grammar to an installed, compatible tree.
    pub fn resolve(&self, spec: &str) -> Result<ResolvedRuntime> {
        let parsed = RuntimeSpec::parse(spec)?;
        let exact = self.root.join(parsed.dir_name());
        if self.platform.is_dir(&exact) {
            return self.check_arch(self.load(&exact)?);
        }
        if parsed.version.is_none() {
            // Version-less spec: newest installed version of the language.
            let mut candidates: Vec<PathBuf> = self
                .platform
                .list_dir(&self.root)
                .unwrap_or_default()
                .into_iter()
                .filter(|dir| {
                    dir.file_name()
                        .map(|n| n.to_string_lossy())
                        .is_some_and(|name| {
                            name == parsed.language
                                || name.starts_with(&format!("{}-", parsed.language))
                        })
                })
                .collect();
            candidates.sort();
            if let Some(best) = candidates.pop() {
                return self.check_arch(self.load(&best)?);
            }
        }
        Err(Error::NotFound(format!("runtime {spec} is not installed")))
    }

    /// Validation hook used by the workflow validator: a spec is valid iff it
    /// resolves.
    pub fn test(&self, spec: &str) -> Result<()> {
        self.resolve(spec).map(|_| ())
    }

    /// Delete a runtime tree. `name@version` scopes the removal to one
    /// version; a bare name removes every installed version of the language.
    pub fn remove(&self, spec: &str) -> Result<usize> {
        let (language, version) = match spec.split_once('@') {
            Some((language, version)) if !version.is_empty() => {
                (language.to_string(), Some(version.to_string()))
            }
            Some(_) => {
                return Err(Error::InvalidArgument(format!(
                    "malformed runtime removal spec: {spec}"
                )));
            }
            None => {
                let parsed = RuntimeSpec::parse(spec)?;
                (parsed.language, parsed.version)
            }
        };

        let wanted_prefix = match &version {
            Some(version) => format!("{language}-{version}"),
            None => language.clone(),
        };
        let mut removed = 0;
        for dir in self.platform.list_dir(&self.root).unwrap_or_default() {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let matches = name == wanted_prefix
                || name.starts_with(&format!("{wanted_prefix}-"))
                || (version.is_none() && name.starts_with(&format!("{language}-")));
            if matches {
                self.platform.remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(Error::NotFound(format!("runtime {spec} is not installed")));
        }
        Ok(removed)
    }

    fn load(&self, dir: &PathBuf) -> Result<ResolvedRuntime> {
        let isolated_root = dir.join("isolated");
        if !self.platform.is_dir(&isolated_root) {
            return Err(Error::Precondition(format!(
                "runtime {} has no isolated root",
                dir.display()
            )));
        }
        let descriptor_text = self.platform.read_to_string(&dir.join("runtime.yml"))?;
        let descriptor: RuntimeDescriptor = serde_yaml::from_str(&descriptor_text)
            .map_err(|e| Error::Precondition(format!("runtime.yml: {e}")))?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(ResolvedRuntime {
            name,
            descriptor,
            dir: dir.clone(),
            isolated_root,
        })
    }

    fn check_arch(&self, runtime: ResolvedRuntime) -> Result<ResolvedRuntime> {
        let host = std::env::consts::ARCH;
        if !runtime.descriptor.architectures.is_empty()
            && !runtime
                .descriptor
                .architectures
                .iter()
                .any(|a| a == host)
        {
            return Err(Error::Precondition(format!(
                "runtime {} does not support {host}",
                runtime.name
            )));
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    fn install(root: &std::path::Path, name: &str, yml: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("isolated/usr/bin")).unwrap();
        std::fs::write(dir.join("runtime.yml"), yml).unwrap();
    }

    fn manager(dir: &TempDir) -> RuntimeManager {
        RuntimeManager::new(Arc::new(LinuxPlatform::new()), dir.path().to_path_buf())
    }

    fn python_yml(version: &str) -> String {
        format!("language: python\nversion: \"{version}\"\ndescription: CPython\n")
    }

    #[test]
    fn resolves_both_grammars() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "python-3.11", &python_yml("3.11"));
        let mgr = manager(&dir);
        assert_eq!(mgr.resolve("python:3.11").unwrap().name, "python-3.11");
        assert_eq!(mgr.resolve("python-3.11").unwrap().name, "python-3.11");
    }

    #[test]
    fn versionless_spec_picks_newest() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "python-3.10", &python_yml("3.10"));
        install(dir.path(), "python-3.11", &python_yml("3.11"));
        let mgr = manager(&dir);
        assert_eq!(mgr.resolve("python").unwrap().name, "python-3.11");
    }

    #[test]
    fn missing_runtime_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(matches!(mgr.resolve("go:1.22"), Err(Error::NotFound(_))));
    }

    #[test]
    fn runtime_without_isolated_root_fails_validation() {
        let dir = TempDir::new().unwrap();
        let broken = dir.path().join("python-3.11");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("runtime.yml"), python_yml("3.11")).unwrap();
        let mgr = manager(&dir);
        assert!(mgr.test("python:3.11").is_err());
    }

    #[test]
    fn incompatible_architecture_is_rejected() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "python-3.11",
            "language: python\nversion: \"3.11\"\narchitectures: [not-this-one]\n",
        );
        let mgr = manager(&dir);
        assert!(matches!(
            mgr.resolve("python:3.11"),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn remove_scoped_to_version() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "python-3.10", &python_yml("3.10"));
        install(dir.path(), "python-3.11", &python_yml("3.11"));
        let mgr = manager(&dir);
        assert_eq!(mgr.remove("python@3.10").unwrap(), 1);
        assert!(dir.path().join("python-3.11").exists());
        assert!(!dir.path().join("python-3.10").exists());
    }

    #[test]
    fn remove_without_version_clears_the_language() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "python-3.10", &python_yml("3.10"));
        install(dir.path(), "python-3.11", &python_yml("3.11"));
        install(dir.path(), "openjdk-21", "language: openjdk\nversion: \"21\"\n");
        let mgr = manager(&dir);
        assert_eq!(mgr.remove("python").unwrap(), 2);
        assert!(dir.path().join("openjdk-21").exists());
    }

    #[test]
    fn extra_mounts_become_binds() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            "python-3.11",
            "language: python\nversion: \"3.11\"\nmounts:\n  - source: /opt/models\n    target: /models\n    readonly: true\n",
        );
        let mgr = manager(&dir);
        let resolved = mgr.resolve("python:3.11").unwrap();
        let binds = resolved.extra_binds();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].target, "models");
        assert!(binds[0].readonly);
    }
}
