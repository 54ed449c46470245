use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use super::client::{HostTimeouts, RemoteHostClient};
use super::{ContainerHostClient, ContainerHostService, HANDSHAKE_OK};
use crate::config::ContainerServiceConfig;
use crate::directory::ContainerDirectory;
use crate::filesystem::FileSystem;
use crate::job::JobObject;
use crate::process::{Process, ProcessRunSpec, ProcessRunner};
use crate::user::Credentials;
use crate::{Error, Result};

/// Launches `ironframe-host` inside each container and connects to it
pub struct LocalContainerHostService {
    file_system: Arc<dyn FileSystem>,
    runner: Arc<dyn ProcessRunner>,
    host_executable: PathBuf,
    host_dependencies: Vec<PathBuf>,
    handshake_timeout: Duration,
    timeouts: HostTimeouts,
    runtime: Arc<Runtime>,
}

impl LocalContainerHostService {
    /// `runner` must be able to launch under the container's credentials
    pub fn new(
        config: &ContainerServiceConfig,
        file_system: Arc<dyn FileSystem>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ironframe-rpc")
            .enable_all()
            .build()?;

        Ok(Self {
            file_system,
            runner,
            host_executable: config.host_executable_path()?,
            host_dependencies: config.host_dependencies.clone(),
            handshake_timeout: config.host_start_timeout(),
            timeouts: HostTimeouts {
                request: config.request_timeout(),
                shutdown: config.shutdown_timeout(),
            },
            runtime: Arc::new(runtime),
        })
    }

    /// Copy the host, its optional `.config` file and every dependency into `bin`
    fn install(&self, directory: &ContainerDirectory) -> Result<String> {
        let host = self.copy_into_bin(directory, &self.host_executable)?;

        let mut config_file = self.host_executable.clone().into_os_string();
        config_file.push(".config");
        let config_file = PathBuf::from(config_file);
        if config_file.is_file() {
            self.copy_into_bin(directory, &config_file)?;
        }

        for dependency in &self.host_dependencies {
            self.copy_into_bin(directory, dependency)?;
        }
        Ok(host)
    }

    fn copy_into_bin(&self, directory: &ContainerDirectory, source: &Path) -> Result<String> {
        let file_name = source
            .file_name()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("'{}' does not name a file", source.display()))
            })?
            .to_string_lossy()
            .into_owned();
        let destination = directory.map_bin_path(&file_name)?;
        self.file_system
            .copy_file(&source.to_string_lossy(), &destination)?;
        Ok(destination)
    }
}

impl ContainerHostService for LocalContainerHostService {
    fn start_container_host(
        &self,
        container_id: &str,
        directory: &ContainerDirectory,
        job: Arc<dyn JobObject>,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn ContainerHostClient>> {
        let executable = self.install(directory)?;

        let process = self.runner.run(ProcessRunSpec {
            executable_path: executable,
            arguments: vec![container_id.to_string()],
            working_directory: Some(directory.user_path()),
            credentials,
            buffered_input_output: true,
            ..Default::default()
        })?;

        let connected = job
            .assign_process(process.as_ref())
            .and_then(|()| self.connect(container_id, &process, job.clone()));
        match connected {
            Ok(client) => {
                tracing::info!(container = %container_id, pid = process.id(), "container host started");
                Ok(client)
            }
            Err(e) => {
                if let Err(kill) = process.kill() {
                    tracing::warn!(container = %container_id, error = %kill, "failed to kill container host");
                }
                Err(e)
            }
        }
    }
}

impl LocalContainerHostService {
    fn connect(
        &self,
        container_id: &str,
        process: &Arc<dyn Process>,
        job: Arc<dyn JobObject>,
    ) -> Result<Arc<dyn ContainerHostClient>> {
        let stdio = process
            .take_stdio()
            .ok_or_else(|| Error::HostStartup("container host has no standard streams".into()))?;
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdio.stdin, stdio.stdout, stdio.stderr)
        else {
            return Err(Error::HostStartup(
                "container host has no standard streams".into(),
            ));
        };

        await_handshake(container_id, stderr, self.handshake_timeout)?;

        let client = RemoteHostClient::connect(
            BufReader::new(stdout),
            stdin,
            job,
            Some(process.clone()),
            self.runtime.clone(),
            self.timeouts,
        )?;
        Ok(client)
    }
}

/// Wait for the host's first stderr line, then keep forwarding stderr to the log
pub(crate) fn await_handshake(
    container_id: &str,
    stderr: Box<dyn Read + Send>,
    timeout: Duration,
) -> Result<()> {
    let (first_line_tx, first_line_rx) = mpsc::sync_channel::<Option<String>>(1);
    let container = container_id.to_string();
    std::thread::Builder::new()
        .name(format!("ironframe-host-stderr-{container_id}"))
        .spawn(move || {
            let mut lines = BufReader::new(stderr).lines();
            let first = lines.next().and_then(|line| line.ok());
            let _ = first_line_tx.send(first);
            for line in lines.map_while(|line| line.ok()) {
                tracing::debug!(container = %container, "host: {line}");
            }
        })?;

    match first_line_rx.recv_timeout(timeout) {
        Ok(Some(line)) if line.trim() == HANDSHAKE_OK => Ok(()),
        Ok(Some(line)) => Err(Error::HostStartup(line.trim().to_string())),
        Ok(None) => Err(Error::HostStartup(
            "container host exited before signalling readiness".into(),
        )),
        Err(_) => Err(Error::HostStartup(format!(
            "container host did not signal readiness within {timeout:?}"
        ))),
    }
}
