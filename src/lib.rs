//! IronFrame container host
//!
//! A Rust library for isolating groups of Windows processes without a
//! hypervisor: each container is a local user account, a directory tree with
//! ACLs, a job object for resource limits, and a small host process that
//! launches work on the container's behalf.
//!
//! # Key Features
//!
//! - **Path mapping** - container paths resolve under the container's `user`
//!   directory and can never escape it
//! - **Resource limits** - memory, CPU weight, disk quota, process count and
//!   priority applied through the job object
//! - **Transactional creation** - a failed create releases everything it
//!   acquired, in reverse order
//! - **Restore** - containers left on disk by a previous run are re-registered
//!
//! # Example
//!
//! ```no_run
//! use ironframe::{ContainerService, ContainerServiceConfig, ContainerSpec, ProcessIo, ProcessSpec};
//!
//! let config = ContainerServiceConfig::builder()
//!     .container_base_path(r"C:\containerizer")
//!     .build();
//! let service = ContainerService::new(config)?;
//!
//! let container = service.create_container(ContainerSpec {
//!     handle: Some("build-42".into()),
//!     ..Default::default()
//! })?;
//! container.limit_memory(512 * 1024 * 1024)?;
//!
//! let process = container.run(
//!     ProcessSpec {
//!         executable_path: "/bin/app.exe".into(),
//!         ..Default::default()
//!     },
//!     ProcessIo::new().with_stdout(|line| print!("{line}")),
//! )?;
//! let exit_code = process.wait_for_exit()?;
//!
//! service.destroy_container("build-42")?;
//! # let _ = exit_code;
//! # Ok::<(), ironframe::Error>(())
//! ```

pub mod config;
pub mod container;
pub mod directory;
pub mod environment;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod host;
pub mod job;
pub mod messages;
pub mod messaging;
pub mod platform;
pub mod ports;
pub mod process;
pub mod properties;
pub mod quota;
pub mod service;
pub mod undo;
pub mod user;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ContainerServiceConfig;
pub use container::{
    Container, ContainerCpuStat, ContainerInfo, ContainerMemoryStat, ContainerMetrics,
    ContainerProcess, ContainerState, ProcessIo, ProcessSpec,
};
pub use directory::{BindMount, ContainerDirectory};
pub use environment::EnvironmentBlock;
pub use error::{Error, Result};
pub use handle::{generate_id, HandleGenerator};
pub use ports::{FirewallRuleSpec, Protocol};
pub use properties::Properties;
pub use service::{ContainerService, ContainerServiceBuilder, ContainerSpec};
