//! Registry persistence.
//!
//! The registry lives in a dedicated owner-only directory containing the
//! registry file and its lock file. Reads recover gracefully: a missing,
//! unparsable, or wrong-version file is an empty registry, and the next
//! successful write repairs the on-disk state. Writes go through the
//! atomic writer, so no partial registry image is ever observable.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::atomic;
use crate::error::{LockError, Result};
use crate::model::{RegistryFile, REGISTRY_VERSION};

const REGISTRY_FILE_NAME: &str = "registry.toml";
const REGISTRY_LOCK_NAME: &str = "registry.lock";

/// Handle to a registry directory.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE_NAME)
    }

    /// Path of the semaphore that serializes access to this registry.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_LOCK_NAME)
    }

    /// Loads the registry, treating anything unusable as empty.
    ///
    /// Only a genuine read failure on an existing file surfaces as an
    /// error; corruption and version mismatches are recovered by
    /// starting over.
    pub fn load(&self) -> Result<RegistryFile> {
        let path = self.registry_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default());
            }
            Err(source) => {
                return Err(LockError::Read { path, source }.into());
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                warn!(path = %path.display(), "registry is not UTF-8, starting empty");
                return Ok(RegistryFile::default());
            }
        };

        let registry: RegistryFile = match toml::from_str(&content) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable registry, starting empty");
                return Ok(RegistryFile::default());
            }
        };

        if registry.version != REGISTRY_VERSION {
            warn!(
                path = %path.display(),
                version = registry.version,
                "unknown registry version, starting empty"
            );
            return Ok(RegistryFile::default());
        }

        Ok(registry)
    }

    /// Persists the registry atomically, creating the owner-only
    /// registry directory if needed.
    pub fn save(&self, registry: &RegistryFile) -> Result<()> {
        self.ensure_dir()?;
        let content = toml::to_string_pretty(registry)?;
        atomic::write_replace(&self.registry_path(), content.as_bytes())?;
        Ok(())
    }

    /// Creates the registry directory with owner-only permissions.
    /// Existing directories keep whatever mode they have.
    pub fn ensure_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir).map_err(|source| LockError::Write {
            path: self.dir.clone(),
            source,
        })?;
        Ok(())
    }
}
