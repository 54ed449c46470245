//! Container creation, registry and teardown

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ContainerServiceConfig;
use crate::container::{Container, ContainerParts};
use crate::directory::{BindMount, ContainerDirectory};
use crate::environment::EnvironmentBlock;
use crate::filesystem::{FileSystem, LocalFileSystem};
use crate::handle::{generate_id, HandleGenerator};
use crate::host::{ContainerHostService, LocalContainerHostService};
use crate::job::{JobObjectFactory, NativeJobObjectFactory};
use crate::ports::{LocalTcpPortManager, PortManager};
use crate::process::{ConstrainedProcessRunner, LocalProcessRunner, ProcessRunner};
use crate::properties::{LocalFilePropertyService, Properties, PropertyService};
use crate::quota::{DiskQuotaManager, FsutilQuotaManager};
use crate::undo::UndoStack;
use crate::user::{ContainerUser, LocalUserManager, UserManager};
use crate::{Error, Result};

/// Builds the privileged runner each container gets
pub type RunnerFactory = Arc<dyn Fn() -> Arc<dyn ProcessRunner> + Send + Sync>;

/// Caller's description of a new container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    pub handle: Option<String>,
    pub bind_mounts: Vec<BindMount>,
    pub properties: Properties,
    pub environment: HashMap<String, String>,
}

/// Creates containers and keeps the handle-indexed registry
pub struct ContainerService {
    config: ContainerServiceConfig,
    handles: HandleGenerator,
    file_system: Arc<dyn FileSystem>,
    users: Arc<dyn UserManager>,
    jobs: Arc<dyn JobObjectFactory>,
    host_service: Arc<dyn ContainerHostService>,
    privileged_runners: RunnerFactory,
    port_manager: Arc<dyn PortManager>,
    disk_quota: Arc<dyn DiskQuotaManager>,
    properties: Arc<dyn PropertyService>,
    default_environment: EnvironmentBlock,
    // Keyed by lower-cased handle
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerService {
    pub fn builder(config: ContainerServiceConfig) -> ContainerServiceBuilder {
        ContainerServiceBuilder::new(config)
    }

    /// A service wired to the local machine
    pub fn new(config: ContainerServiceConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ContainerServiceConfig {
        &self.config
    }

    pub fn container_by_handle(&self, handle: &str) -> Option<Arc<Container>> {
        self.containers.read().get(&handle.to_lowercase()).cloned()
    }

    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.read().is_empty()
    }

    fn validate(&self, spec: &ContainerSpec) -> Result<()> {
        if let Some(handle) = &spec.handle {
            if handle.trim().is_empty() {
                return Err(Error::InvalidArgument("container handle cannot be blank".into()));
            }
            if self.container_by_handle(handle).is_some() {
                return Err(Error::ContainerAlreadyExists(handle.clone()));
            }
        }
        Ok(())
    }

    /// Create a container; either every resource is acquired or none is kept
    pub fn create_container(&self, spec: ContainerSpec) -> Result<Arc<Container>> {
        self.validate(&spec)?;
        let handle = spec
            .handle
            .clone()
            .unwrap_or_else(|| self.handles.generate_handle());
        let id = generate_id(&handle);

        let mut undo = UndoStack::new();
        match self.build_container(&spec, &handle, &id, &mut undo) {
            Ok(container) => {
                undo.commit();
                tracing::info!(container = %id, handle = %handle, "container created");
                Ok(container)
            }
            Err(e) => {
                tracing::warn!(container = %id, handle = %handle, error = %e, "container creation failed, rolling back");
                Err(undo.rollback(e))
            }
        }
    }

    fn build_container(
        &self,
        spec: &ContainerSpec,
        handle: &str,
        id: &str,
        undo: &mut UndoStack,
    ) -> Result<Arc<Container>> {
        let user = ContainerUser::create(self.users.clone(), id, &self.config.user_group_name)?;
        let user_name = user.user_name().to_string();
        {
            let (users, name) = (self.users.clone(), user_name.clone());
            undo.push("delete user", move || users.delete_user(&name));
        }

        user.create_profile()?;
        {
            let (users, name) = (self.users.clone(), user_name.clone());
            undo.push("delete profile", move || users.delete_profile(&name));
        }

        let directory =
            ContainerDirectory::new(self.file_system.clone(), &self.config.container_base_path, id);
        directory.create_subdirectories(&user_name)?;
        {
            let doomed = ContainerDirectory::restore(self.file_system.clone(), directory.root_path());
            undo.push("delete directory", move || doomed.destroy());
        }

        directory.create_bind_mounts(&spec.bind_mounts, &user_name)?;
        {
            let mounted = ContainerDirectory::restore(self.file_system.clone(), directory.root_path());
            let (mounts, name) = (spec.bind_mounts.clone(), user_name.clone());
            undo.push("delete bind mounts", move || mounted.delete_bind_mounts(&mounts, &name));
        }

        let job = self.jobs.create(id)?;
        {
            let (job, timeout) = (job.clone(), self.config.shutdown_timeout());
            undo.push("dispose job", move || {
                let drained = job.terminate_processes_and_wait(Some(timeout));
                job.dispose();
                match drained? {
                    true => Ok(()),
                    false => Err(Error::timeout("job termination", timeout)),
                }
            });
        }

        let host = self.host_service.start_container_host(
            id,
            &directory,
            job.clone(),
            Some(user.credentials().clone()),
        )?;
        {
            let host = host.clone();
            undo.push("shut down host", move || host.shutdown());
        }

        let environment = self
            .default_environment
            .clone()
            .merge(spec.environment.iter());
        let constrained: Arc<dyn ProcessRunner> = Arc::new(ConstrainedProcessRunner::new(
            host.clone(),
            environment.clone(),
            self.config.stop_timeout(),
        ));

        let container = Arc::new(Container::new(ContainerParts {
            id: id.to_string(),
            handle: handle.to_string(),
            user,
            directory,
            job,
            host: Some(host),
            privileged_runner: (self.privileged_runners)(),
            constrained_runner: Some(constrained),
            port_manager: self.port_manager.clone(),
            disk_quota: self.disk_quota.clone(),
            properties: self.properties.clone(),
            default_environment: environment,
            bind_mounts: spec.bind_mounts.clone(),
            shutdown_timeout: self.config.shutdown_timeout(),
        }));

        self.properties
            .set_properties(container.directory(), &spec.properties)?;
        self.register(container.clone())?;
        Ok(container)
    }

    /// Insert unless the handle is taken
    fn register(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self.containers.write();
        let key = container.handle().to_lowercase();
        if containers.contains_key(&key) {
            return Err(Error::ContainerAlreadyExists(container.handle().to_string()));
        }
        containers.insert(key, container);
        Ok(())
    }

    pub fn destroy_container(&self, handle: &str) -> Result<()> {
        let container = self
            .containers
            .write()
            .remove(&handle.to_lowercase())
            .ok_or_else(|| Error::ContainerNotFound(handle.to_string()))?;
        container.destroy()
    }

    /// Re-register every container left under the base path by a previous run.
    ///
    /// Restored containers have no host, so only privileged runs work until
    /// they are destroyed.
    pub fn restore_from_container_base_path(&self) -> Result<Vec<Arc<Container>>> {
        let base = &self.config.container_base_path;
        if !self.file_system.directory_exists(base) {
            return Ok(Vec::new());
        }

        let mut restored = Vec::new();
        for root in self.file_system.enumerate_directories(base)? {
            let directory = ContainerDirectory::restore(self.file_system.clone(), &root);
            let Some(id) = directory
                .root_path()
                .rsplit(['/', '\\'])
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
            else {
                continue;
            };

            let job = self.jobs.open_or_create(&id)?;
            let container = Arc::new(Container::new(ContainerParts {
                id: id.clone(),
                handle: id.clone(),
                user: ContainerUser::restore(self.users.clone(), &id),
                directory,
                job,
                host: None,
                privileged_runner: (self.privileged_runners)(),
                constrained_runner: None,
                port_manager: self.port_manager.clone(),
                disk_quota: self.disk_quota.clone(),
                properties: self.properties.clone(),
                default_environment: self.default_environment.clone(),
                bind_mounts: Vec::new(),
                shutdown_timeout: self.config.shutdown_timeout(),
            }));

            match self.register(container.clone()) {
                Ok(()) => {
                    tracing::info!(container = %id, "container restored");
                    restored.push(container);
                }
                Err(e) => tracing::warn!(container = %id, error = %e, "skipping restored container"),
            }
        }
        Ok(restored)
    }
}

/// Wires a [`ContainerService`]; anything not supplied uses the local machine
pub struct ContainerServiceBuilder {
    config: ContainerServiceConfig,
    handles: Option<HandleGenerator>,
    file_system: Option<Arc<dyn FileSystem>>,
    users: Option<Arc<dyn UserManager>>,
    jobs: Option<Arc<dyn JobObjectFactory>>,
    host_service: Option<Arc<dyn ContainerHostService>>,
    privileged_runners: Option<RunnerFactory>,
    port_manager: Option<Arc<dyn PortManager>>,
    disk_quota: Option<Arc<dyn DiskQuotaManager>>,
    properties: Option<Arc<dyn PropertyService>>,
    default_environment: Option<EnvironmentBlock>,
}

impl ContainerServiceBuilder {
    pub fn new(config: ContainerServiceConfig) -> Self {
        Self {
            config,
            handles: None,
            file_system: None,
            users: None,
            jobs: None,
            host_service: None,
            privileged_runners: None,
            port_manager: None,
            disk_quota: None,
            properties: None,
            default_environment: None,
        }
    }

    pub fn handle_generator(mut self, handles: HandleGenerator) -> Self {
        self.handles = Some(handles);
        self
    }

    pub fn file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = Some(file_system);
        self
    }

    pub fn user_manager(mut self, users: Arc<dyn UserManager>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn job_factory(mut self, jobs: Arc<dyn JobObjectFactory>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn host_service(mut self, host_service: Arc<dyn ContainerHostService>) -> Self {
        self.host_service = Some(host_service);
        self
    }

    pub fn privileged_runners(
        mut self,
        factory: impl Fn() -> Arc<dyn ProcessRunner> + Send + Sync + 'static,
    ) -> Self {
        self.privileged_runners = Some(Arc::new(factory));
        self
    }

    pub fn port_manager(mut self, port_manager: Arc<dyn PortManager>) -> Self {
        self.port_manager = Some(port_manager);
        self
    }

    pub fn disk_quota(mut self, disk_quota: Arc<dyn DiskQuotaManager>) -> Self {
        self.disk_quota = Some(disk_quota);
        self
    }

    pub fn property_service(mut self, properties: Arc<dyn PropertyService>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn default_environment(mut self, environment: EnvironmentBlock) -> Self {
        self.default_environment = Some(environment);
        self
    }

    pub fn build(self) -> Result<ContainerService> {
        self.config.validate()?;
        let config = self.config;

        let file_system = self
            .file_system
            .unwrap_or_else(|| Arc::new(LocalFileSystem::new()));
        let host_service: Arc<dyn ContainerHostService> = match self.host_service {
            Some(host_service) => host_service,
            None => Arc::new(LocalContainerHostService::new(
                &config,
                file_system.clone(),
                host_launcher(&config),
            )?),
        };
        let default_environment = match self.default_environment {
            Some(environment) => environment,
            None => EnvironmentBlock::system_default()?,
        };
        let stop_timeout = config.stop_timeout();
        let properties_file = config.properties_file_name.clone();

        Ok(ContainerService {
            handles: self.handles.unwrap_or_default(),
            file_system,
            users: self
                .users
                .unwrap_or_else(|| Arc::new(LocalUserManager::new())),
            jobs: self.jobs.unwrap_or_else(|| Arc::new(NativeJobObjectFactory)),
            host_service,
            privileged_runners: self.privileged_runners.unwrap_or_else(|| {
                Arc::new(move || {
                    Arc::new(LocalProcessRunner::with_stop_timeout(stop_timeout)) as Arc<dyn ProcessRunner>
                })
            }),
            port_manager: self
                .port_manager
                .unwrap_or_else(|| Arc::new(LocalTcpPortManager::netsh())),
            disk_quota: self
                .disk_quota
                .unwrap_or_else(|| Arc::new(FsutilQuotaManager)),
            properties: self
                .properties
                .unwrap_or_else(|| Arc::new(LocalFilePropertyService::new(properties_file))),
            default_environment,
            containers: RwLock::new(HashMap::new()),
            config,
        })
    }
}

/// Runner that starts container hosts under the container user's account
#[cfg(windows)]
fn host_launcher(config: &ContainerServiceConfig) -> Arc<dyn ProcessRunner> {
    Arc::new(crate::process::ImpersonationProcessRunner::with_stop_timeout(
        config.stop_timeout(),
    ))
}

#[cfg(not(windows))]
fn host_launcher(config: &ContainerServiceConfig) -> Arc<dyn ProcessRunner> {
    Arc::new(LocalProcessRunner::with_stop_timeout(config.stop_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MockFileSystem;
    use crate::host::{ContainerHostClient, MockContainerHostService};
    use crate::job::{JobObject, MockJobObjectFactory};
    use crate::ports::MockPortManager;
    use crate::process::MockProcessRunner;
    use crate::properties::MockPropertyService;
    use crate::quota::MockDiskQuotaManager;
    use crate::testing::{FakeHostClient, FakeJob};
    use crate::user::MockUserManager;
    use crate::ContainerState;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    /// Mocks for every collaborator, each call recorded in order
    struct Harness {
        log: Log,
        file_system: MockFileSystem,
        users: MockUserManager,
        jobs: MockJobObjectFactory,
        hosts: MockContainerHostService,
        properties: MockPropertyService,
        job: Arc<FakeJob>,
        host: Arc<FakeHostClient>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                file_system: MockFileSystem::new(),
                users: MockUserManager::new(),
                jobs: MockJobObjectFactory::new(),
                hosts: MockContainerHostService::new(),
                properties: MockPropertyService::new(),
                job: FakeJob::new(),
                host: FakeHostClient::new(),
            }
        }

        /// Every creation step succeeds and every undo step is logged
        fn happy(mut self) -> Self {
            let log = self.log.clone();
            self.users.expect_create_user().returning(move |name, _, group| {
                record(&log, format!("create user {name} in {group}"));
                Ok(())
            });
            let log = self.log.clone();
            self.users.expect_create_profile().returning(move |name, _| {
                record(&log, format!("create profile {name}"));
                Ok(())
            });
            let log = self.log.clone();
            self.users.expect_delete_user().returning(move |name| {
                record(&log, format!("delete user {name}"));
                Ok(())
            });
            let log = self.log.clone();
            self.users.expect_delete_profile().returning(move |name| {
                record(&log, format!("delete profile {name}"));
                Ok(())
            });
            let log = self.log.clone();
            self.file_system.expect_create_directory().returning(move |path, _| {
                record(&log, format!("mkdir {path}"));
                Ok(())
            });
            let log = self.log.clone();
            self.file_system.expect_delete_directory().returning(move |path| {
                record(&log, format!("rmdir {path}"));
                Ok(())
            });
            let (log, job) = (self.log.clone(), self.job.clone());
            self.jobs.expect_create().returning(move |name| {
                record(&log, format!("create job {name}"));
                Ok(job.clone() as Arc<dyn JobObject>)
            });
            let (log, host) = (self.log.clone(), self.host.clone());
            self.hosts
                .expect_start_container_host()
                .returning(move |id, _, _, credentials| {
                    let user = credentials.map(|c| c.user_name).unwrap_or_default();
                    record(&log, format!("start host {id} as {user}"));
                    Ok(host.clone() as Arc<dyn ContainerHostClient>)
                });
            let log = self.log.clone();
            self.properties.expect_set_properties().returning(move |_, props| {
                record(&log, format!("save {} properties", props.len()));
                Ok(())
            });
            self
        }

        fn build(self) -> ContainerService {
            let config = ContainerServiceConfig::builder()
                .container_base_path(r"C:\Containers")
                .user_group_name("ContainerUsers")
                .shutdown_timeout(Duration::from_secs(1))
                .build();
            ContainerService::builder(config)
                .handle_generator(HandleGenerator::with_seed(7))
                .file_system(Arc::new(self.file_system))
                .user_manager(Arc::new(self.users))
                .job_factory(Arc::new(self.jobs))
                .host_service(Arc::new(self.hosts))
                .privileged_runners(|| {
                    let mut runner = MockProcessRunner::new();
                    runner.expect_stop_all().returning(|_| Ok(()));
                    runner.expect_dispose().return_const(());
                    Arc::new(runner) as Arc<dyn ProcessRunner>
                })
                .port_manager(Arc::new(MockPortManager::new()))
                .disk_quota(Arc::new(MockDiskQuotaManager::new()))
                .property_service(Arc::new(self.properties))
                .default_environment(
                    [("PATH".to_string(), r"C:\Windows".to_string())].into_iter().collect(),
                )
                .build()
                .unwrap()
        }
    }

    fn spec(handle: &str) -> ContainerSpec {
        ContainerSpec {
            handle: Some(handle.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn creation_runs_steps_in_order_and_registers() {
        let harness = Harness::new().happy();
        let log = harness.log.clone();
        let service = harness.build();

        let mut spec = spec("Handle1");
        spec.properties.insert("owner".into(), "ci".into());
        let container = service.create_container(spec).unwrap();

        let id = generate_id("Handle1");
        assert_eq!(container.id(), id);
        assert_eq!(container.handle(), "Handle1");
        let root = format!(r"C:\Containers\{id}");
        assert_eq!(
            *log.lock(),
            vec![
                format!("create user c_{id} in ContainerUsers"),
                format!("create profile c_{id}"),
                format!("mkdir {root}"),
                format!(r"mkdir {root}\private"),
                format!(r"mkdir {root}\bin"),
                format!(r"mkdir {root}\user"),
                format!("create job {id}"),
                format!("start host {id} as c_{id}"),
                "save 1 properties".to_string(),
            ]
        );
        assert!(service.container_by_handle("HANDLE1").is_some());
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn generated_handles_are_deterministic_when_seeded() {
        let first = Harness::new().happy().build();
        let second = Harness::new().happy().build();
        let a = first.create_container(ContainerSpec::default()).unwrap();
        let b = second.create_container(ContainerSpec::default()).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert_eq!(a.handle().len(), 11);
        assert_eq!(a.id(), generate_id(a.handle()));
    }

    #[test]
    fn spec_environment_overrides_defaults() {
        let harness = Harness::new().happy();
        let host = harness.host.clone();
        let service = harness.build();

        let mut spec = spec("env");
        spec.environment.insert("path".into(), r"C:\tools".into());
        let container = service.create_container(spec).unwrap();
        container
            .run(
                crate::ProcessSpec {
                    executable_path: "app.exe".into(),
                    ..Default::default()
                },
                crate::ProcessIo::new(),
            )
            .unwrap();

        let env = &host.created()[0].environment;
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("path").map(String::as_str), Some(r"C:\tools"));
    }

    #[test]
    fn blank_or_duplicate_handles_are_rejected_without_side_effects() {
        let harness = Harness::new().happy();
        let log = harness.log.clone();
        let service = harness.build();

        assert!(service.create_container(spec("  ")).unwrap_err().is_validation());
        assert!(log.lock().is_empty());

        service.create_container(spec("taken")).unwrap();
        let before = log.lock().len();
        let err = service.create_container(spec("TAKEN")).unwrap_err();
        assert!(matches!(err, Error::ContainerAlreadyExists(_)));
        assert_eq!(log.lock().len(), before);
    }

    #[test]
    fn host_failure_rolls_back_in_reverse_order() {
        let mut harness = Harness::new().happy();
        harness.hosts = MockContainerHostService::new();
        harness
            .hosts
            .expect_start_container_host()
            .times(1)
            .returning(|_, _, _, _| Err(Error::HostStartup("Access is denied.".into())));
        let (log, job) = (harness.log.clone(), harness.job.clone());
        let service = harness.build();

        let err = service.create_container(spec("doomed")).unwrap_err();
        assert!(matches!(err, Error::HostStartup(ref m) if m == "Access is denied."));
        assert!(service.is_empty());
        assert!(job.is_disposed());
        assert_eq!(job.terminate_calls(), 1);

        let id = generate_id("doomed");
        let log = log.lock();
        let undo: Vec<&String> = log.iter().skip_while(|e| !e.starts_with("rmdir")).collect();
        assert_eq!(
            undo,
            vec![
                &format!(r"rmdir C:\Containers\{id}"),
                &format!("delete profile c_{id}"),
                &format!("delete user c_{id}"),
            ]
        );
    }

    #[test]
    fn failing_undo_is_reported_with_the_cause() {
        let mut harness = Harness::new().happy();
        harness.properties = MockPropertyService::new();
        harness
            .properties
            .expect_set_properties()
            .returning(|_, _| Err(Error::InvalidArgument("disk full".into())));
        harness.users = MockUserManager::new();
        harness.users.expect_create_user().returning(|_, _, _| Ok(()));
        harness.users.expect_create_profile().returning(|_, _| Ok(()));
        harness.users.expect_delete_profile().times(1).returning(|_| Ok(()));
        harness
            .users
            .expect_delete_user()
            .times(1)
            .returning(|_| Err(Error::InvalidArgument("user is logged on".into())));
        let host = harness.host.clone();
        let service = harness.build();

        let err = service.create_container(spec("partial")).unwrap_err();
        match err {
            Error::CreationRollback { source, cleanup } => {
                assert!(source.to_string().contains("disk full"));
                assert_eq!(cleanup.len(), 1);
                assert!(cleanup[0].to_string().contains("logged on"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(host.shutdown_count(), 1);
        assert!(service.is_empty());
    }

    #[test]
    fn destroy_container_unregisters() {
        let mut harness = Harness::new().happy();
        harness.properties.expect_properties().returning(|_| Ok(Properties::new()));
        let mut ports = MockPortManager::new();
        ports.expect_remove_firewall_rules().returning(|_| Ok(()));
        let mut quota = MockDiskQuotaManager::new();
        quota.expect_delete_quota().returning(|_, _| Ok(()));
        let Harness {
            file_system,
            users,
            jobs,
            hosts,
            properties,
            ..
        } = harness;
        let config = ContainerServiceConfig::builder()
            .container_base_path(r"C:\Containers")
            .build();
        let service = ContainerService::builder(config)
            .file_system(Arc::new(file_system))
            .user_manager(Arc::new(users))
            .job_factory(Arc::new(jobs))
            .host_service(Arc::new(hosts))
            .privileged_runners(|| Arc::new(LocalProcessRunner::new()) as Arc<dyn ProcessRunner>)
            .port_manager(Arc::new(ports))
            .disk_quota(Arc::new(quota))
            .property_service(Arc::new(properties))
            .default_environment(EnvironmentBlock::new())
            .build()
            .unwrap();

        let container = service.create_container(spec("gone")).unwrap();
        service.destroy_container("GONE").unwrap();
        assert!(service.is_empty());
        assert_eq!(container.state(), ContainerState::Destroyed);
        assert!(container.info().unwrap_err().is_state_violation());
        assert!(matches!(
            service.destroy_container("gone"),
            Err(Error::ContainerNotFound(_))
        ));
    }

    #[test]
    fn restore_registers_existing_directories_without_hosts() {
        let mut harness = Harness::new();
        harness
            .file_system
            .expect_directory_exists()
            .returning(|_| true);
        harness.file_system.expect_enumerate_directories().returning(|base| {
            Ok(vec![format!(r"{base}\AAA"), format!(r"{base}\BBB")])
        });
        harness
            .jobs
            .expect_open_or_create()
            .times(2)
            .returning(|_| Ok(FakeJob::new() as Arc<dyn JobObject>));
        let service = harness.build();

        let restored = service.restore_from_container_base_path().unwrap();
        assert_eq!(restored.len(), 2);
        let container = service.container_by_handle("aaa").unwrap();
        assert_eq!(container.id(), "AAA");
        assert_eq!(container.user().user_name(), "c_AAA");
        assert_eq!(container.directory().root_path(), r"C:\Containers\AAA");

        let err = container
            .run(
                crate::ProcessSpec {
                    executable_path: "app.exe".into(),
                    ..Default::default()
                },
                crate::ProcessIo::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::HostUnavailable));
    }

    #[test]
    fn container_spec_reads_camel_case_json() {
        let spec: ContainerSpec = serde_json::from_str(
            r#"{"handle":"h1","bindMounts":[{"sourcePath":"C:\\data","destinationPath":"/data"}],"environment":{"A":"1"}}"#,
        )
        .unwrap();
        assert_eq!(spec.handle.as_deref(), Some("h1"));
        assert_eq!(spec.bind_mounts.len(), 1);
        assert!(spec.properties.is_empty());
    }
}
