use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::Registry;
use crate::error::RegistryError;
use crate::fs_util::write_bytes_atomic;

const REQUIRED_KEYS: [&str; 3] = ["version", "config", "records"];

#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: Utf8PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().is_file()
    }

    /// A missing or empty file yields the default registry.
    pub fn load(&self) -> Result<Registry, RegistryError> {
        let content = match fs::read_to_string(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path, "registry missing, using default");
                return Ok(Registry::default());
            }
            Err(_) => return Err(RegistryError::RegistryRead(self.path.clone())),
        };
        if content.trim().is_empty() {
            return Ok(Registry::default());
        }

        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|err| RegistryError::RegistryParse(err.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| RegistryError::RegistryParse("top level is not an object".to_string()))?;
        for key in REQUIRED_KEYS {
            if !object.contains_key(key) {
                return Err(RegistryError::RegistryShape(key.to_string()));
            }
        }

        let registry: Registry = serde_json::from_value(value)
            .map_err(|err| RegistryError::RegistryParse(err.to_string()))?;
        debug!(path = %self.path, records = registry.records.len(), "loaded registry");
        Ok(registry)
    }

    pub fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        let mut content = serde_json::to_string_pretty(registry)
            .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
        content.push('\n');
        write_bytes_atomic(self.path.as_std_path(), content.as_bytes())?;
        debug!(path = %self.path, records = registry.records.len(), "saved registry");
        Ok(())
    }
}

pub fn load_registry(path: &Utf8Path) -> Result<Registry, RegistryError> {
    RegistryStore::new(path).load()
}

pub fn save_registry(registry: &Registry, path: &Utf8Path) -> Result<(), RegistryError> {
    RegistryStore::new(path).save(registry)
}
