//! A single container: its resources, state machine and process launch

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::directory::{BindMount, ContainerDirectory};
use crate::environment::EnvironmentBlock;
use crate::host::ContainerHostClient;
use crate::job::{CpuStatistics, JobObject, MemoryLimitMonitor, PriorityClass, DEFAULT_POLL_PERIOD};
use crate::ports::{FirewallRuleSpec, PortManager};
use crate::process::{OutputCallback, Process, ProcessRunSpec, ProcessRunner};
use crate::properties::{Properties, PropertyService};
use crate::quota::DiskQuotaManager;
use crate::user::ContainerUser;
use crate::{Error, Result};

const DEFAULT_WORKING_DIRECTORY: &str = "/";

/// Lifecycle of a container; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Active,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Active => write!(f, "Active"),
            ContainerState::Stopped => write!(f, "Stopped"),
            ContainerState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// What to launch inside a container.
///
/// Paths are virtual paths under the container's user directory unless
/// `disable_path_mapping` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub working_directory: Option<String>,
    /// Run directly in the service's account instead of through the host
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub disable_path_mapping: bool,
}

/// Where a process's output goes
#[derive(Clone, Default)]
pub struct ProcessIo {
    pub stdout: Option<OutputCallback>,
    pub stderr: Option<OutputCallback>,
}

impl ProcessIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stdout = Some(Arc::new(callback));
        self
    }

    pub fn with_stderr(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stderr = Some(Arc::new(callback));
        self
    }
}

/// Caller-facing handle to a process started in a container
#[derive(Clone)]
pub struct ContainerProcess {
    process: Arc<dyn Process>,
}

impl ContainerProcess {
    pub fn new(process: Arc<dyn Process>) -> Self {
        Self { process }
    }

    pub fn id(&self) -> u32 {
        self.process.id()
    }

    pub fn environment(&self) -> HashMap<String, String> {
        self.process.environment()
    }

    pub fn exit_code(&self) -> Result<i32> {
        self.process.exit_code()
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    /// Block until the process exits and return its exit code
    pub fn wait_for_exit(&self) -> Result<i32> {
        self.process.wait_for_exit(None)?;
        self.process.exit_code()
    }

    /// `Ok(None)` when `timeout` elapsed first
    pub fn wait_for_exit_timeout(&self, timeout: Duration) -> Result<Option<i32>> {
        if self.process.wait_for_exit(Some(timeout))? {
            self.process.exit_code().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn kill(&self) -> Result<()> {
        self.process.kill()
    }

    pub fn request_exit(&self) -> Result<()> {
        self.process.request_exit()
    }
}

impl std::fmt::Debug for ContainerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProcess")
            .field("id", &self.process.id())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCpuStat {
    pub total_processor_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMemoryStat {
    pub peak_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub cpu_stat: ContainerCpuStat,
    pub memory_stat: ContainerMemoryStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub handle: String,
    pub state: ContainerState,
    pub container_path: String,
    pub reserved_ports: Vec<u16>,
    pub properties: Properties,
    pub cpu_stat: ContainerCpuStat,
    pub memory_stat: ContainerMemoryStat,
}

/// Everything a container is assembled from
pub(crate) struct ContainerParts {
    pub id: String,
    pub handle: String,
    pub user: ContainerUser,
    pub directory: ContainerDirectory,
    pub job: Arc<dyn JobObject>,
    pub host: Option<Arc<dyn ContainerHostClient>>,
    pub privileged_runner: Arc<dyn ProcessRunner>,
    pub constrained_runner: Option<Arc<dyn ProcessRunner>>,
    pub port_manager: Arc<dyn PortManager>,
    pub disk_quota: Arc<dyn DiskQuotaManager>,
    pub properties: Arc<dyn PropertyService>,
    pub default_environment: EnvironmentBlock,
    pub bind_mounts: Vec<BindMount>,
    pub shutdown_timeout: Duration,
}

pub struct Container {
    id: String,
    handle: String,
    user: ContainerUser,
    directory: ContainerDirectory,
    job: Arc<dyn JobObject>,
    host: Option<Arc<dyn ContainerHostClient>>,
    privileged_runner: Arc<dyn ProcessRunner>,
    constrained_runner: Option<Arc<dyn ProcessRunner>>,
    port_manager: Arc<dyn PortManager>,
    disk_quota: Arc<dyn DiskQuotaManager>,
    properties: Arc<dyn PropertyService>,
    default_environment: EnvironmentBlock,
    bind_mounts: Vec<BindMount>,
    shutdown_timeout: Duration,
    state: RwLock<ContainerState>,
    reserved_ports: Mutex<Vec<u16>>,
    memory_monitor: Mutex<Option<Arc<MemoryLimitMonitor>>>,
    // Serializes stop and destroy
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish()
    }
}

impl Container {
    pub(crate) fn new(parts: ContainerParts) -> Self {
        Self {
            id: parts.id,
            handle: parts.handle,
            user: parts.user,
            directory: parts.directory,
            job: parts.job,
            host: parts.host,
            privileged_runner: parts.privileged_runner,
            constrained_runner: parts.constrained_runner,
            port_manager: parts.port_manager,
            disk_quota: parts.disk_quota,
            properties: parts.properties,
            default_environment: parts.default_environment,
            bind_mounts: parts.bind_mounts,
            shutdown_timeout: parts.shutdown_timeout,
            state: RwLock::new(ContainerState::Active),
            reserved_ports: Mutex::new(Vec::new()),
            memory_monitor: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn state(&self) -> ContainerState {
        *self.state.read()
    }

    pub fn directory(&self) -> &ContainerDirectory {
        &self.directory
    }

    pub fn user(&self) -> &ContainerUser {
        &self.user
    }

    fn ensure_active(&self) -> Result<()> {
        let current = self.state();
        if current != ContainerState::Active {
            return Err(Error::InvalidState {
                current,
                expected: "Active".into(),
            });
        }
        Ok(())
    }

    fn ensure_not_destroyed(&self) -> Result<()> {
        let current = self.state();
        if current == ContainerState::Destroyed {
            return Err(Error::InvalidState {
                current,
                expected: "Active or Stopped".into(),
            });
        }
        Ok(())
    }

    fn constrained_runner(&self) -> Result<&Arc<dyn ProcessRunner>> {
        self.constrained_runner.as_ref().ok_or(Error::HostUnavailable)
    }

    pub fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<ContainerProcess> {
        self.ensure_active()?;

        let map = |path: &str| {
            if spec.disable_path_mapping {
                Ok(path.to_string())
            } else {
                self.directory.map_user_path(path)
            }
        };
        let executable_path = map(&spec.executable_path)?;
        let working_directory = map(
            spec.working_directory
                .as_deref()
                .unwrap_or(DEFAULT_WORKING_DIRECTORY),
        )?;

        let run_spec = ProcessRunSpec {
            executable_path,
            arguments: spec.arguments,
            environment: self
                .default_environment
                .clone()
                .merge(spec.environment.iter())
                .to_map(),
            working_directory: Some(working_directory),
            credentials: None,
            buffered_input_output: false,
            output_callback: io.stdout,
            error_callback: io.stderr,
        };

        let runner = if spec.privileged {
            &self.privileged_runner
        } else {
            self.constrained_runner()?
        };
        let process = runner.run(run_spec)?;
        tracing::info!(
            container = %self.id,
            pid = process.id(),
            privileged = spec.privileged,
            "process started"
        );
        Ok(ContainerProcess::new(process))
    }

    pub fn find_process_by_id(&self, pid: u32) -> Result<Option<ContainerProcess>> {
        self.ensure_not_destroyed()?;
        Ok(self
            .constrained_runner()?
            .find_process_by_id(pid)?
            .map(ContainerProcess::new))
    }

    /// Reserve `port` (0 picks a free one) for the container user
    pub fn reserve_port(&self, port: u16) -> Result<u16> {
        self.ensure_active()?;
        let reserved = self
            .port_manager
            .reserve_local_port(port, self.user.user_name())?;
        self.reserved_ports.lock().push(reserved);
        tracing::debug!(container = %self.id, port = reserved, "port reserved");
        Ok(reserved)
    }

    pub fn create_outbound_firewall_rule(&self, rule: &FirewallRuleSpec) -> Result<()> {
        self.ensure_active()?;
        self.port_manager
            .create_outbound_rule(self.user.user_name(), rule)
    }

    pub fn limit_memory(&self, bytes: u64) -> Result<()> {
        self.ensure_active()?;
        self.job.set_memory_limit(bytes)
    }

    /// 0 when no limit is set
    pub fn current_memory_limit(&self) -> Result<u64> {
        self.ensure_not_destroyed()?;
        self.job.memory_limit()
    }

    pub fn limit_cpu(&self, weight: u32) -> Result<()> {
        self.ensure_active()?;
        self.job.set_cpu_limit(weight)
    }

    pub fn current_cpu_limit(&self) -> Result<u32> {
        self.ensure_not_destroyed()?;
        self.job.cpu_limit()
    }

    pub fn limit_disk(&self, bytes: u64) -> Result<()> {
        self.ensure_active()?;
        self.disk_quota
            .set_quota(&self.directory.volume(), self.user.user_name(), bytes)
    }

    pub fn current_disk_limit(&self) -> Result<u64> {
        self.ensure_not_destroyed()?;
        Ok(self
            .disk_quota
            .quota(&self.directory.volume(), self.user.user_name())?
            .limit_bytes)
    }

    pub fn current_disk_usage(&self) -> Result<u64> {
        self.ensure_not_destroyed()?;
        Ok(self
            .disk_quota
            .quota(&self.directory.volume(), self.user.user_name())?
            .used_bytes)
    }

    pub fn set_active_process_limit(&self, limit: u32) -> Result<()> {
        self.ensure_active()?;
        self.job.set_active_process_limit(limit)
    }

    pub fn set_priority_class(&self, priority: PriorityClass) -> Result<()> {
        self.ensure_active()?;
        self.job.set_priority_class(priority)
    }

    /// Call `callback` whenever the job's peak memory reaches its limit
    pub fn on_memory_limit_reached(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.ensure_not_destroyed()?;
        let mut slot = self.memory_monitor.lock();
        let monitor = slot.get_or_insert_with(|| MemoryLimitMonitor::new(self.job.clone(), DEFAULT_POLL_PERIOD));
        monitor.on_limit_reached(callback);
        monitor.start();
        Ok(())
    }

    pub fn property(&self, name: &str) -> Result<Option<String>> {
        self.ensure_not_destroyed()?;
        self.properties.property(&self.directory, name)
    }

    pub fn properties(&self) -> Result<Properties> {
        self.ensure_not_destroyed()?;
        self.properties.properties(&self.directory)
    }

    pub fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.ensure_not_destroyed()?;
        self.properties.set_property(&self.directory, name, value)
    }

    pub fn remove_property(&self, name: &str) -> Result<()> {
        self.ensure_not_destroyed()?;
        self.properties.remove_property(&self.directory, name)
    }

    fn cpu_stat(&self) -> Result<ContainerCpuStat> {
        let cpu: CpuStatistics = self.job.cpu_statistics()?;
        Ok(ContainerCpuStat {
            total_processor_time: cpu.total(),
        })
    }

    fn memory_stat(&self) -> Result<ContainerMemoryStat> {
        Ok(ContainerMemoryStat {
            peak_bytes: self.job.peak_memory_used()?,
        })
    }

    pub fn metrics(&self) -> Result<ContainerMetrics> {
        self.ensure_not_destroyed()?;
        Ok(ContainerMetrics {
            cpu_stat: self.cpu_stat()?,
            memory_stat: self.memory_stat()?,
        })
    }

    pub fn info(&self) -> Result<ContainerInfo> {
        self.ensure_not_destroyed()?;
        Ok(ContainerInfo {
            id: self.id.clone(),
            handle: self.handle.clone(),
            state: self.state(),
            container_path: self.directory.root_path().to_string(),
            reserved_ports: self.reserved_ports.lock().clone(),
            properties: self.properties.properties(&self.directory)?,
            cpu_stat: self.cpu_stat()?,
            memory_stat: self.memory_stat()?,
        })
    }

    fn stop_runners(&self, kill: bool) -> Vec<Error> {
        let mut errors = Vec::new();
        if let Some(constrained) = &self.constrained_runner {
            match constrained.stop_all(kill) {
                Ok(()) => {}
                // A dead host leaves its children running in the job
                Err(e) if e.is_timeout() || matches!(e, Error::HostUnavailable) => {
                    tracing::warn!(container = %self.id, error = %e, "host could not stop processes, terminating job");
                    match self.job.terminate_processes_and_wait(Some(self.shutdown_timeout)) {
                        Ok(true) => {}
                        Ok(false) => errors.push(Error::timeout("job termination", self.shutdown_timeout)),
                        Err(e) => errors.push(e),
                    }
                }
                Err(e) => errors.push(e),
            }
            constrained.dispose();
        }
        if let Err(e) = self.privileged_runner.stop_all(kill) {
            errors.push(e);
        }
        self.privileged_runner.dispose();
        errors
    }

    /// Stop every process. `kill` skips the graceful phase.
    pub fn stop(&self, kill: bool) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_not_destroyed()?;

        let errors = self.stop_runners(kill);
        *self.state.write() = ContainerState::Stopped;
        tracing::info!(container = %self.id, kill, "container stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(errors))
        }
    }

    /// Release everything the container holds. Safe to call repeatedly.
    ///
    /// Every step is attempted; failures are collected and the container ends
    /// up `Destroyed` either way.
    pub fn destroy(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let previous = self.state();
        if previous == ContainerState::Destroyed {
            return Ok(());
        }

        let mut errors = Vec::new();
        if previous == ContainerState::Active {
            errors.extend(self.stop_runners(true));
        }
        *self.state.write() = ContainerState::Destroyed;

        if let Some(monitor) = self.memory_monitor.lock().take() {
            monitor.stop();
        }

        let mut attempt = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(container = %self.id, step, error = %e, "destroy step failed");
                errors.push(e);
            }
        };

        if let Some(host) = &self.host {
            attempt("shutdown host", host.shutdown());
        }
        let user_name = self.user.user_name();
        for port in std::mem::take(&mut *self.reserved_ports.lock()) {
            attempt("release port", self.port_manager.release_local_port(port, user_name));
        }
        attempt("remove firewall rules", self.port_manager.remove_firewall_rules(user_name));
        attempt(
            "delete bind mounts",
            self.directory.delete_bind_mounts(&self.bind_mounts, user_name),
        );
        attempt(
            "terminate job",
            match self.job.terminate_processes_and_wait(Some(self.shutdown_timeout)) {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::timeout("job termination", self.shutdown_timeout)),
                Err(e) => Err(e),
            },
        );
        self.job.dispose();
        attempt("delete directory", self.directory.destroy());

        // There is no way to ask whether a quota entry exists, so just try
        if let Err(e) = self.disk_quota.delete_quota(&self.directory.volume(), user_name) {
            tracing::debug!(container = %self.id, error = %e, "no disk quota removed");
        }

        attempt("delete profile", self.user.delete_profile());
        attempt("delete user", self.user.delete());

        tracing::info!(container = %self.id, handle = %self.handle, "container destroyed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MockFileSystem;
    use crate::ports::MockPortManager;
    use crate::process::{ConstrainedProcessRunner, MockProcessRunner};
    use crate::properties::MockPropertyService;
    use crate::quota::{DiskQuota, MockDiskQuotaManager};
    use crate::testing::{FakeHostClient, FakeJob, FakeProcess};
    use crate::user::MockUserManager;
    use mockall::predicate::eq;

    struct Fixture {
        file_system: MockFileSystem,
        users: MockUserManager,
        ports: MockPortManager,
        quota: MockDiskQuotaManager,
        properties: MockPropertyService,
        privileged: MockProcessRunner,
        job: Arc<FakeJob>,
        host: Arc<FakeHostClient>,
        with_host: bool,
    }

    impl Fixture {
        fn new() -> Self {
            let mut privileged = MockProcessRunner::new();
            privileged.expect_stop_all().returning(|_| Ok(()));
            privileged.expect_dispose().return_const(());
            Self {
                file_system: MockFileSystem::new(),
                users: MockUserManager::new(),
                ports: MockPortManager::new(),
                quota: MockDiskQuotaManager::new(),
                properties: MockPropertyService::new(),
                privileged,
                job: FakeJob::new(),
                host: FakeHostClient::new(),
                with_host: true,
            }
        }

        /// Expect one full teardown that succeeds
        fn expect_destroy(&mut self) {
            self.file_system
                .expect_delete_directory()
                .withf(|path| path == r"C:\Containers\ABC")
                .times(1)
                .returning(|_| Ok(()));
            self.ports
                .expect_remove_firewall_rules()
                .with(eq("c_ABC"))
                .times(1)
                .returning(|_| Ok(()));
            self.quota.expect_delete_quota().returning(|_, _| Ok(()));
            self.users.expect_delete_profile().times(1).returning(|_| Ok(()));
            self.users.expect_delete_user().times(1).returning(|_| Ok(()));
        }

        fn build(self) -> Container {
            let users: Arc<dyn crate::user::UserManager> = Arc::new(self.users);
            let constrained: Option<Arc<dyn ProcessRunner>> = self.with_host.then(|| {
                let defaults: EnvironmentBlock =
                    [("FOO".to_string(), "1".to_string())].into_iter().collect();
                Arc::new(ConstrainedProcessRunner::new(
                    self.host.clone(),
                    defaults,
                    Duration::from_secs(10),
                )) as Arc<dyn ProcessRunner>
            });
            Container::new(ContainerParts {
                id: "ABC".into(),
                handle: "handle1".into(),
                user: ContainerUser::restore(users, "ABC"),
                directory: ContainerDirectory::new(
                    Arc::new(self.file_system),
                    r"C:\Containers",
                    "ABC",
                ),
                job: self.job.clone(),
                host: self
                    .with_host
                    .then(|| self.host.clone() as Arc<dyn ContainerHostClient>),
                privileged_runner: Arc::new(self.privileged),
                constrained_runner: constrained,
                port_manager: Arc::new(self.ports),
                disk_quota: Arc::new(self.quota),
                properties: Arc::new(self.properties),
                default_environment: [("FOO".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                bind_mounts: Vec::new(),
                shutdown_timeout: Duration::from_secs(1),
            })
        }
    }

    #[test]
    fn constrained_run_maps_paths_and_merges_environment() {
        let fixture = Fixture::new();
        let host = fixture.host.clone();
        let container = fixture.build();

        let mut spec = ProcessSpec {
            executable_path: "/app/run.cmd".into(),
            arguments: vec!["go".into()],
            ..Default::default()
        };
        spec.environment.insert("BAR".into(), "x".into());
        let process = container.run(spec, ProcessIo::new()).unwrap();

        let created = host.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].executable_path, r"C:\Containers\ABC\user\app\run.cmd");
        assert_eq!(
            created[0].working_directory.as_deref(),
            Some(r"C:\Containers\ABC\user")
        );
        assert_eq!(created[0].environment.get("FOO").map(String::as_str), Some("1"));
        assert_eq!(created[0].environment.get("BAR").map(String::as_str), Some("x"));
        assert_eq!(process.id(), host.pid_of(created[0].key).unwrap());
    }

    #[test]
    fn run_reports_exit_code_and_stays_active() {
        let mut fixture = Fixture::new();
        fixture
            .properties
            .expect_properties()
            .returning(|_| Ok(Properties::new()));
        let host = fixture.host.clone();
        let container = fixture.build();

        let process = container
            .run(
                ProcessSpec {
                    executable_path: "cmd.exe".into(),
                    disable_path_mapping: true,
                    ..Default::default()
                },
                ProcessIo::new(),
            )
            .unwrap();
        host.finish(host.created()[0].key, 10);
        assert_eq!(process.wait_for_exit().unwrap(), 10);
        assert_eq!(host.created()[0].executable_path, "cmd.exe");
        assert_eq!(container.info().unwrap().state, ContainerState::Active);
    }

    #[test]
    fn privileged_run_uses_local_runner() {
        let mut fixture = Fixture::new();
        fixture
            .privileged
            .expect_run()
            .withf(|spec| {
                spec.executable_path == r"C:\Containers\ABC\user\tool.exe"
                    && spec.working_directory.as_deref() == Some(r"C:\Containers\ABC\user\work")
                    && spec.credentials.is_none()
            })
            .times(1)
            .returning(|_| Ok(FakeProcess::new(42) as Arc<dyn Process>));
        let host = fixture.host.clone();
        let container = fixture.build();

        let process = container
            .run(
                ProcessSpec {
                    executable_path: "tool.exe".into(),
                    working_directory: Some("/work".into()),
                    privileged: true,
                    ..Default::default()
                },
                ProcessIo::new(),
            )
            .unwrap();
        assert_eq!(process.id(), 42);
        assert!(host.created().is_empty());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let container = Fixture::new().build();
        let err = container
            .run(
                ProcessSpec {
                    executable_path: "/../../evil.exe".into(),
                    ..Default::default()
                },
                ProcessIo::new(),
            )
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn without_host_constrained_runs_are_unavailable() {
        let mut fixture = Fixture::new();
        fixture.with_host = false;
        let container = fixture.build();
        let err = container
            .run(
                ProcessSpec {
                    executable_path: "app.exe".into(),
                    ..Default::default()
                },
                ProcessIo::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::HostUnavailable));
    }

    #[test]
    fn stopped_container_rejects_mutation_but_reports_info() {
        let mut fixture = Fixture::new();
        fixture
            .properties
            .expect_properties()
            .returning(|_| Ok(Properties::new()));
        let host = fixture.host.clone();
        let container = fixture.build();

        container.stop(false).unwrap();
        assert_eq!(host.stops(), vec![(None, Duration::from_secs(10))]);
        assert_eq!(container.state(), ContainerState::Stopped);

        let spec = ProcessSpec {
            executable_path: "app.exe".into(),
            ..Default::default()
        };
        assert!(container.run(spec, ProcessIo::new()).unwrap_err().is_state_violation());
        assert!(container.reserve_port(0).unwrap_err().is_state_violation());
        assert!(container.limit_memory(1024).unwrap_err().is_state_violation());
        assert!(container.limit_cpu(5).unwrap_err().is_state_violation());
        assert!(container.limit_disk(1024).unwrap_err().is_state_violation());
        assert_eq!(container.info().unwrap().state, ContainerState::Stopped);
    }

    #[test]
    fn stop_after_host_exit_terminates_job() {
        let fixture = Fixture::new();
        let (host, job) = (fixture.host.clone(), fixture.job.clone());
        let container = fixture.build();

        host.simulate_exit();
        container.stop(true).unwrap();
        assert_eq!(job.terminate_calls(), 1);
        assert!(host.stops().is_empty());
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[test]
    fn limits_reach_the_job() {
        let fixture = Fixture::new();
        let job = fixture.job.clone();
        let container = fixture.build();

        container.limit_memory(64 * 1024 * 1024).unwrap();
        assert_eq!(container.current_memory_limit().unwrap(), 64 * 1024 * 1024);
        container.limit_cpu(7).unwrap();
        assert_eq!(container.current_cpu_limit().unwrap(), 7);
        assert!(container.limit_cpu(0).unwrap_err().is_validation());
        container.set_active_process_limit(20).unwrap();
        container.set_priority_class(PriorityClass::BelowNormal).unwrap();
        assert_eq!(job.active_process_limit(), Some(20));
        assert_eq!(job.priority_class(), Some(PriorityClass::BelowNormal));
    }

    #[test]
    fn disk_limit_uses_container_volume_and_user() {
        let mut fixture = Fixture::new();
        fixture
            .quota
            .expect_set_quota()
            .with(eq(r"C:\"), eq("c_ABC"), eq(1_000_000u64))
            .times(1)
            .returning(|_, _, _| Ok(()));
        fixture.quota.expect_quota().returning(|_, _| {
            Ok(DiskQuota {
                limit_bytes: 1_000_000,
                used_bytes: 1234,
            })
        });
        let container = fixture.build();

        container.limit_disk(1_000_000).unwrap();
        assert_eq!(container.current_disk_limit().unwrap(), 1_000_000);
        assert_eq!(container.current_disk_usage().unwrap(), 1234);
    }

    #[test]
    fn metrics_come_from_job_accounting() {
        let fixture = Fixture::new();
        fixture.job.set_peak_memory(4096);
        fixture.job.set_cpu_statistics(CpuStatistics {
            total_kernel_time: Duration::from_millis(5),
            total_user_time: Duration::from_millis(15),
        });
        let container = fixture.build();

        let metrics = container.metrics().unwrap();
        assert_eq!(metrics.cpu_stat.total_processor_time, Duration::from_millis(20));
        assert_eq!(metrics.memory_stat.peak_bytes, 4096);
    }

    #[test]
    fn properties_delegate_to_store() {
        let mut fixture = Fixture::new();
        fixture
            .properties
            .expect_set_property()
            .withf(|_, name, value| name == "owner" && value == "team-a")
            .times(1)
            .returning(|_, _, _| Ok(()));
        fixture
            .properties
            .expect_property()
            .withf(|_, name| name == "owner")
            .returning(|_, _| Ok(Some("team-a".into())));
        fixture
            .properties
            .expect_remove_property()
            .times(1)
            .returning(|_, _| Ok(()));
        let container = fixture.build();

        container.set_property("owner", "team-a").unwrap();
        assert_eq!(container.property("owner").unwrap().as_deref(), Some("team-a"));
        container.remove_property("owner").unwrap();
    }

    #[test]
    fn destroy_releases_everything_once() {
        let mut fixture = Fixture::new();
        fixture
            .ports
            .expect_reserve_local_port()
            .returning(|_, _| Ok(50123));
        fixture
            .ports
            .expect_release_local_port()
            .with(eq(50123u16), eq("c_ABC"))
            .times(1)
            .returning(|_, _| Ok(()));
        fixture.expect_destroy();
        let (host, job) = (fixture.host.clone(), fixture.job.clone());
        let container = fixture.build();

        assert_eq!(container.reserve_port(0).unwrap(), 50123);
        container.destroy().unwrap();
        container.destroy().unwrap();

        assert_eq!(container.state(), ContainerState::Destroyed);
        assert_eq!(host.stops(), vec![(None, Duration::ZERO)]);
        assert_eq!(host.shutdown_count(), 1);
        assert!(job.is_disposed());
        assert!(container.info().unwrap_err().is_state_violation());
        assert!(container.stop(true).unwrap_err().is_state_violation());
    }

    #[test]
    fn destroy_collects_failures_and_still_finishes() {
        let mut fixture = Fixture::new();
        fixture.file_system.expect_delete_directory().returning(|_| Ok(()));
        fixture
            .ports
            .expect_remove_firewall_rules()
            .returning(|_| Err(Error::InvalidArgument("netsh unavailable".into())));
        fixture
            .quota
            .expect_delete_quota()
            .returning(|_, _| Err(Error::InvalidArgument("no quota".into())));
        fixture.users.expect_delete_profile().returning(|_| Ok(()));
        fixture
            .users
            .expect_delete_user()
            .returning(|_| Err(Error::InvalidArgument("access denied".into())));
        let container = fixture.build();

        let err = container.destroy().unwrap_err();
        // A missing quota entry is not a failure
        assert!(matches!(err, Error::Cleanup(ref errors) if errors.len() == 2));
        assert_eq!(container.state(), ContainerState::Destroyed);
        container.destroy().unwrap();
    }

    #[test]
    fn memory_limit_callback_fires() {
        let fixture = Fixture::new();
        let job = fixture.job.clone();
        let container = fixture.build();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        container
            .on_memory_limit_reached(move || {
                let _ = tx.lock().send(());
            })
            .unwrap();

        container.limit_memory(100).unwrap();
        job.set_peak_memory(200);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
}
