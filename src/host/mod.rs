//! The per-container host process and both ends of the channel to it
//!
//! The service side launches `ironframe-host` inside the container job and
//! talks to it through [`ContainerHostClient`]; the host side tracks the
//! processes it launched and answers requests through [`HostServer`].

mod client;
mod server;
mod service;
mod tracker;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::directory::ContainerDirectory;
use crate::job::JobObject;
use crate::messages::{
    CreateProcessParams, CreateProcessResult, FindProcessByIdParams, FindProcessByIdResult,
    ProcessDataEvent, WaitForProcessExitParams, WaitForProcessExitResult,
};
use crate::user::Credentials;
use crate::Result;

pub use client::{HostTimeouts, RemoteHostClient};
pub use server::HostServer;
pub use service::LocalContainerHostService;
pub use tracker::{EventPublisher, ProcessTracker};

pub type ProcessDataCallback = Arc<dyn Fn(ProcessDataEvent) + Send + Sync>;
pub type ExitedCallback = Box<dyn Fn() + Send + Sync>;

/// Line the host writes to stderr once it is ready for requests
pub const HANDSHAKE_OK: &str = "OK";

/// Synchronous view of a running container host
pub trait ContainerHostClient: Send + Sync {
    fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult>;

    /// `true` if the host answered within `timeout`; never errors
    fn ping(&self, timeout: Duration) -> bool;

    /// Close the channel and drain the container job. Idempotent.
    fn shutdown(&self) -> Result<()>;

    /// Ask the process to exit, killing it after `grace`
    fn stop_process(&self, key: Uuid, grace: Duration) -> Result<()>;

    fn stop_all_processes(&self, grace: Duration) -> Result<()>;

    fn subscribe_to_process_data(&self, key: Uuid, callback: ProcessDataCallback);

    fn unsubscribe_from_process_data(&self, key: Uuid);

    fn wait_for_process_exit(
        &self,
        params: WaitForProcessExitParams,
    ) -> Result<WaitForProcessExitResult>;

    fn find_process_by_id(
        &self,
        params: FindProcessByIdParams,
    ) -> Result<Option<FindProcessByIdResult>>;

    /// Called once if the host goes away without [`shutdown`](Self::shutdown)
    fn on_exited(&self, callback: ExitedCallback);

    fn has_exited(&self) -> bool;
}

#[cfg_attr(test, mockall::automock)]
pub trait ContainerHostService: Send + Sync {
    fn start_container_host(
        &self,
        container_id: &str,
        directory: &ContainerDirectory,
        job: Arc<dyn JobObject>,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn ContainerHostClient>>;
}
