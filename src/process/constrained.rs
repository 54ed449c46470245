use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{Process, ProcessRunSpec, ProcessRunner};
use crate::environment::EnvironmentBlock;
use crate::host::ContainerHostClient;
use crate::messages::{
    CreateProcessParams, FindProcessByIdParams, ProcessDataEvent, ProcessDataType,
    WaitForProcessExitParams,
};
use crate::{Error, Result};

/// Cleared when the host exits so every later call reports it unavailable
type HostSlot = Arc<RwLock<Option<Arc<dyn ContainerHostClient>>>>;

fn current_host(slot: &HostSlot) -> Result<Arc<dyn ContainerHostClient>> {
    slot.read().clone().ok_or(Error::HostUnavailable)
}

/// Runs processes inside the container by proxying to its host
pub struct ConstrainedProcessRunner {
    host: HostSlot,
    default_environment: EnvironmentBlock,
    stop_timeout: Duration,
}

impl ConstrainedProcessRunner {
    pub fn new(
        host: Arc<dyn ContainerHostClient>,
        default_environment: EnvironmentBlock,
        stop_timeout: Duration,
    ) -> Self {
        let slot: HostSlot = Arc::new(RwLock::new(Some(host.clone())));
        let weak = Arc::downgrade(&slot);
        host.on_exited(Box::new(move || {
            if let Some(slot) = weak.upgrade() {
                slot.write().take();
            }
        }));
        Self {
            host: slot,
            default_environment,
            stop_timeout,
        }
    }

    fn proxy(&self, key: Uuid, pid: u32, environment: HashMap<String, String>) -> Arc<ConstrainedProcess> {
        Arc::new(ConstrainedProcess {
            key,
            pid,
            environment,
            host: self.host.clone(),
            stop_timeout: self.stop_timeout,
            exit_code: Mutex::new(None),
        })
    }
}

impl ProcessRunner for ConstrainedProcessRunner {
    fn run(&self, spec: ProcessRunSpec) -> Result<Arc<dyn Process>> {
        let host = current_host(&self.host)?;
        let key = Uuid::new_v4();
        let environment = self
            .default_environment
            .clone()
            .merge(spec.environment.iter())
            .to_map();

        // Subscribe first so no early output is lost
        let (stdout, stderr) = (spec.output_callback, spec.error_callback);
        host.subscribe_to_process_data(
            key,
            Arc::new(move |event: ProcessDataEvent| {
                let callback = match event.data_type {
                    ProcessDataType::Stdout => &stdout,
                    ProcessDataType::Stderr => &stderr,
                };
                if let Some(callback) = callback {
                    callback(&event.data);
                }
            }),
        );

        let created = host.create_process(CreateProcessParams {
            key,
            executable_path: spec.executable_path,
            arguments: spec.arguments,
            environment: environment.clone(),
            working_directory: spec.working_directory,
        });
        match created {
            Ok(result) => {
                tracing::debug!(%key, pid = result.id, "started constrained process");
                Ok(self.proxy(key, result.id, environment))
            }
            Err(e) => {
                host.unsubscribe_from_process_data(key);
                Err(e)
            }
        }
    }

    fn find_process_by_id(&self, pid: u32) -> Result<Option<Arc<dyn Process>>> {
        let host = current_host(&self.host)?;
        Ok(host
            .find_process_by_id(FindProcessByIdParams { id: pid })?
            .map(|found| self.proxy(found.process_key, found.id, found.environment) as Arc<dyn Process>))
    }

    fn stop_all(&self, kill: bool) -> Result<()> {
        let grace = if kill { Duration::ZERO } else { self.stop_timeout };
        current_host(&self.host)?.stop_all_processes(grace)
    }

    fn dispose(&self) {
        self.host.write().take();
    }
}

/// Handle to a process running inside the container host
pub struct ConstrainedProcess {
    key: Uuid,
    pid: u32,
    environment: HashMap<String, String>,
    host: HostSlot,
    stop_timeout: Duration,
    exit_code: Mutex<Option<i32>>,
}

impl ConstrainedProcess {
    pub fn key(&self) -> Uuid {
        self.key
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Option<i32>> {
        if let Some(code) = *self.exit_code.lock() {
            return Ok(Some(code));
        }
        let host = current_host(&self.host)?;
        let result = host.wait_for_process_exit(WaitForProcessExitParams {
            key: self.key,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        })?;
        if !result.exited {
            return Ok(None);
        }
        // The host forgets the key once it reports the exit
        host.unsubscribe_from_process_data(self.key);
        *self.exit_code.lock() = Some(result.exit_code);
        Ok(Some(result.exit_code))
    }
}

impl Process for ConstrainedProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn exit_code(&self) -> Result<i32> {
        self.wait(Some(Duration::ZERO))?
            .ok_or(Error::ProcessNotExited)
    }

    fn environment(&self) -> HashMap<String, String> {
        self.environment.clone()
    }

    fn kill(&self) -> Result<()> {
        if self.exit_code.lock().is_some() {
            return Ok(());
        }
        current_host(&self.host)?.stop_process(self.key, Duration::ZERO)
    }

    fn request_exit(&self) -> Result<()> {
        if self.exit_code.lock().is_some() {
            return Ok(());
        }
        current_host(&self.host)?.stop_process(self.key, self.stop_timeout)
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.wait(timeout)?.is_some())
    }
}

impl std::fmt::Debug for ConstrainedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstrainedProcess")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .finish()
    }
}
