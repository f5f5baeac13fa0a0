//! Named persistent volumes.
//!
//! A volume is a directory under the volumes root with a `data/` payload the
//! job sees and a `volume-info.json` metadata record. Size is advisory
//! metadata; nothing enforces it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use joblet_core::{Error, Result};
use joblet_platform::Platform;

/// Contents of `volume-info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    /// Advisory size note, e.g. "1GB".
    pub size: String,
    pub created_at: DateTime<Utc>,
}

pub struct VolumeManager {
    platform: Arc<dyn Platform>,
    root: PathBuf,
}

impl VolumeManager {
    pub fn new(platform: Arc<dyn Platform>, root: PathBuf) -> Self {
        Self { platform, root }
    }

    /// Create a new volume. Fails if the name is taken.
    pub fn create(&self, name: &str, size: &str) -> Result<VolumeInfo> {
        validate_name(name)?;
        let dir = self.root.join(name);
        if self.platform.exists(&dir) {
            return Err(Error::Precondition(format!("volume {name} already exists")));
        }
        self.platform.create_dir_all(&dir.join("data"))?;
        let info = VolumeInfo {
            name: name.to_string(),
            size: size.to_string(),
            created_at: Utc::now(),
        };
        self.write_info(&dir, &info)?;
        info!(volume = %name, size = %size, "Created volume");
        Ok(info)
    }

    /// Create the volume if it does not exist yet. Re-running on an existing
    /// volume is a no-op; workflow validation leans on that.
    pub fn ensure(&self, name: &str, default_size: &str) -> Result<VolumeInfo> {
        match self.get(name) {
            Ok(info) => Ok(info),
            Err(Error::NotFound(_)) => self.create(name, default_size),
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        validate_name(name)?;
        let info_path = self.root.join(name).join("volume-info.json");
        if !self.platform.exists(&info_path) {
            return Err(Error::NotFound(format!("volume {name}")));
        }
        let text = self.platform.read_to_string(&info_path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Internal(format!("volume-info.json for {name}: {e}")))
    }

    pub fn list(&self) -> Result<Vec<VolumeInfo>> {
        if !self.platform.exists(&self.root) {
            return Ok(Vec::new());
        }
        let mut volumes = Vec::new();
        for dir in self.platform.list_dir(&self.root)? {
            if let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) {
                if let Ok(info) = self.get(&name) {
                    volumes.push(info);
                }
            }
        }
        Ok(volumes)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.root.join(name);
        if !self.platform.exists(&dir) {
            return Err(Error::NotFound(format!("volume {name}")));
        }
        self.platform.remove_dir_all(&dir)
    }

    /// Host path of the data directory jobs see.
    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.root.join(name).join("data")
    }

    fn write_info(&self, dir: &PathBuf, info: &VolumeInfo) -> Result<()> {
        let text = serde_json::to_string_pretty(info)
            .map_err(|e| Error::Internal(format!("encoding volume info: {e}")))?;
        self.platform
            .write(&dir.join("volume-info.json"), text.as_bytes())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty volume name".into()));
    }
    if name.contains('/') || name.contains("..") || name.starts_with('.') {
        return Err(Error::InvalidArgument(format!(
            "volume name {name:?} must be a plain directory name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> VolumeManager {
        VolumeManager::new(Arc::new(LinuxPlatform::new()), dir.path().join("volumes"))
    }

    #[test]
    fn create_get_delete() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create("cache", "1GB").unwrap();
        let info = mgr.get("cache").unwrap();
        assert_eq!(info.size, "1GB");
        assert!(mgr.data_dir("cache").is_dir());
        mgr.delete("cache").unwrap();
        assert!(matches!(mgr.get("cache"), Err(Error::NotFound(_))));
    }

    #[test]
    fn duplicate_create_fails() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create("cache", "1GB").unwrap();
        assert!(matches!(
            mgr.create("cache", "1GB"),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let first = mgr.ensure("cache", "1GB").unwrap();
        let second = mgr.ensure("cache", "16GB").unwrap();
        // The second call is a no-op; the original metadata survives.
        assert_eq!(second.size, "1GB");
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(mgr.list().unwrap().len(), 1);
    }

    #[test]
    fn path_escapes_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.create("", "1GB").is_err());
        assert!(mgr.create("../evil", "1GB").is_err());
        assert!(mgr.create("a/b", "1GB").is_err());
    }
}
