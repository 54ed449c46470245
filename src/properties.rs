//! Container properties persisted as JSON in the private directory

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;

use crate::directory::ContainerDirectory;
use crate::Result;

pub type Properties = HashMap<String, String>;

#[cfg_attr(test, mockall::automock)]
pub trait PropertyService: Send + Sync {
    fn properties(&self, directory: &ContainerDirectory) -> Result<Properties>;
    fn property(&self, directory: &ContainerDirectory, name: &str) -> Result<Option<String>>;
    fn set_property(&self, directory: &ContainerDirectory, name: &str, value: &str) -> Result<()>;
    fn set_properties(&self, directory: &ContainerDirectory, properties: &Properties) -> Result<()>;
    fn remove_property(&self, directory: &ContainerDirectory, name: &str) -> Result<()>;
}

/// One JSON object per container; read-modify-write is serialized in-process
pub struct LocalFilePropertyService {
    file_name: String,
    lock: Mutex<()>,
}

impl LocalFilePropertyService {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, directory: &ContainerDirectory) -> Result<String> {
        directory.map_private_path(&self.file_name)
    }

    fn load(path: &str) -> Result<Properties> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Properties::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Properties::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(path: &str, properties: &Properties) -> Result<()> {
        // Write beside and rename so readers never see a torn file
        let temp = format!("{path}.tmp");
        std::fs::write(&temp, serde_json::to_vec_pretty(properties)?)?;
        std::fs::rename(&temp, Path::new(path))?;
        Ok(())
    }

    fn update<F>(&self, directory: &ContainerDirectory, f: F) -> Result<()>
    where
        F: FnOnce(&mut Properties),
    {
        let _guard = self.lock.lock();
        let path = self.path(directory)?;
        let mut properties = Self::load(&path)?;
        f(&mut properties);
        Self::store(&path, &properties)
    }
}

impl Default for LocalFilePropertyService {
    fn default() -> Self {
        Self::new("properties.json")
    }
}

impl PropertyService for LocalFilePropertyService {
    fn properties(&self, directory: &ContainerDirectory) -> Result<Properties> {
        let _guard = self.lock.lock();
        Self::load(&self.path(directory)?)
    }

    fn property(&self, directory: &ContainerDirectory, name: &str) -> Result<Option<String>> {
        Ok(self.properties(directory)?.remove(name))
    }

    fn set_property(&self, directory: &ContainerDirectory, name: &str, value: &str) -> Result<()> {
        self.update(directory, |p| {
            p.insert(name.to_string(), value.to_string());
        })
    }

    fn set_properties(&self, directory: &ContainerDirectory, properties: &Properties) -> Result<()> {
        self.update(directory, |p| {
            p.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
    }

    fn remove_property(&self, directory: &ContainerDirectory, name: &str) -> Result<()> {
        self.update(directory, |p| {
            p.remove(name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::LocalFileSystem;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn directory(temp: &TempDir) -> ContainerDirectory {
        let base = temp.path().to_string_lossy().into_owned();
        let dir = ContainerDirectory::new(Arc::new(LocalFileSystem::new()), &base, "c1");
        dir.create_subdirectories("c_c1").unwrap();
        dir
    }

    #[test]
    fn missing_file_means_no_properties() {
        let temp = TempDir::new().unwrap();
        let dir = directory(&temp);
        let service = LocalFilePropertyService::default();
        assert!(service.properties(&dir).unwrap().is_empty());
        assert_eq!(service.property(&dir, "a").unwrap(), None);
    }

    #[test]
    fn set_get_remove() {
        let temp = TempDir::new().unwrap();
        let dir = directory(&temp);
        let service = LocalFilePropertyService::default();

        let mut initial = Properties::new();
        initial.insert("owner".into(), "diego".into());
        initial.insert("app".into(), "web".into());
        service.set_properties(&dir, &initial).unwrap();
        service.set_property(&dir, "app", "worker").unwrap();
        service.remove_property(&dir, "owner").unwrap();

        let stored = service.properties(&dir).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.get("app").map(String::as_str), Some("worker"));
        assert!(Path::new(&dir.map_private_path("properties.json").unwrap()).is_file());
    }
}
