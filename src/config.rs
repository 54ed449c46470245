//! Container service configuration with builder pattern

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default location for container roots on a Windows cell
pub const DEFAULT_CONTAINER_BASE_PATH: &str = r"C:\containerizer";

/// File name of the host binary copied into each container's `bin` directory
#[cfg(windows)]
pub const HOST_EXECUTABLE_NAME: &str = "ironframe-host.exe";
#[cfg(not(windows))]
pub const HOST_EXECUTABLE_NAME: &str = "ironframe-host";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerServiceConfig {
    pub container_base_path: String,
    /// Local group every container user joins
    pub user_group_name: String,
    /// Host executable; defaults to the sibling of the current executable
    pub host_executable: Option<PathBuf>,
    /// Extra files copied next to the host executable
    pub host_dependencies: Vec<PathBuf>,
    pub host_start_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub properties_file_name: String,
}

impl Default for ContainerServiceConfig {
    fn default() -> Self {
        Self {
            container_base_path: DEFAULT_CONTAINER_BASE_PATH.to_string(),
            user_group_name: "IronFrameContainerUsers".to_string(),
            host_executable: None,
            host_dependencies: Vec::new(),
            host_start_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
            stop_timeout_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            properties_file_name: "properties.json".to_string(),
        }
    }
}

impl ContainerServiceConfig {
    pub fn builder() -> ContainerServiceConfigBuilder {
        ContainerServiceConfigBuilder::default()
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.container_base_path.trim().is_empty() {
            return Err(crate::Error::InvalidArgument(
                "container_base_path cannot be empty".into(),
            ));
        }
        if self.user_group_name.trim().is_empty() {
            return Err(crate::Error::InvalidArgument(
                "user_group_name cannot be empty".into(),
            ));
        }
        if self.host_start_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(crate::Error::InvalidArgument(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.properties_file_name.contains(['/', '\\']) {
            return Err(crate::Error::InvalidArgument(
                "properties_file_name must be a bare file name".into(),
            ));
        }
        Ok(())
    }

    /// Resolved host executable path
    pub fn host_executable_path(&self) -> crate::Result<PathBuf> {
        if let Some(path) = &self.host_executable {
            return Ok(path.clone());
        }
        let current = std::env::current_exe()?;
        let dir = current.parent().ok_or_else(|| {
            crate::Error::InvalidArgument(format!(
                "cannot locate directory of {}",
                current.display()
            ))
        })?;
        Ok(dir.join(HOST_EXECUTABLE_NAME))
    }

    pub fn host_start_timeout(&self) -> Duration {
        Duration::from_millis(self.host_start_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Default)]
pub struct ContainerServiceConfigBuilder {
    config: ContainerServiceConfig,
}

impl ContainerServiceConfigBuilder {
    pub fn container_base_path(mut self, path: impl Into<String>) -> Self {
        self.config.container_base_path = path.into();
        self
    }

    pub fn user_group_name(mut self, name: impl Into<String>) -> Self {
        self.config.user_group_name = name.into();
        self
    }

    pub fn host_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.host_executable = Some(path.into());
        self
    }

    pub fn host_dependency(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.host_dependencies.push(path.into());
        self
    }

    pub fn host_start_timeout(mut self, timeout: Duration) -> Self {
        self.config.host_start_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn properties_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.properties_file_name = name.into();
        self
    }

    pub fn build(self) -> ContainerServiceConfig {
        self.config
    }
}
