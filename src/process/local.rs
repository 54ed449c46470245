use std::collections::HashMap;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{pump_lines, ExitSignal, OutputCallback, Process, ProcessRunSpec, ProcessRunner, ProcessStdio};
use crate::platform;
use crate::{Error, Result};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long exit publication waits for output readers to hit EOF
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A child launched in the caller's own account
pub struct LocalProcess {
    pid: u32,
    environment: HashMap<String, String>,
    exit: Arc<ExitSignal>,
    reaped: Arc<AtomicBool>,
    stdio: Mutex<Option<ProcessStdio>>,
    // The wait thread parks the Child here once it exits so the OS handle
    // stays valid for as long as this record lives.
    retired: Arc<Mutex<Option<Child>>>,
    #[cfg(windows)]
    raw: isize,
}

impl LocalProcess {
    #[cfg(windows)]
    fn terminate(&self) -> Result<()> {
        platform::terminate_handle(self.raw)
    }

    #[cfg(not(windows))]
    fn terminate(&self) -> Result<()> {
        platform::terminate_pid(self.pid)
    }

    #[cfg(windows)]
    fn signal_exit(&self) -> Result<()> {
        self.terminate()
    }

    #[cfg(not(windows))]
    fn signal_exit(&self) -> Result<()> {
        platform::request_exit_pid(self.pid)
    }

    fn unless_exited(&self, f: impl FnOnce() -> Result<()>) -> Result<()> {
        self.exit
            .while_running(|| {
                if self.reaped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                f()
            })
            .unwrap_or(Ok(()))
    }
}

impl Process for LocalProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn exit_code(&self) -> Result<i32> {
        self.exit.code().ok_or(Error::ProcessNotExited)
    }

    fn environment(&self) -> HashMap<String, String> {
        self.environment.clone()
    }

    fn kill(&self) -> Result<()> {
        self.unless_exited(|| self.terminate())
    }

    fn request_exit(&self) -> Result<()> {
        self.unless_exited(|| self.signal_exit())
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.exit.wait(timeout))
    }

    #[cfg(windows)]
    fn raw_handle(&self) -> Option<isize> {
        Some(self.raw)
    }

    fn take_stdio(&self) -> Option<ProcessStdio> {
        self.stdio.lock().take()
    }
}

impl std::fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcess")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit.code())
            .finish()
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

pub(super) fn spawn_reader<R>(stream: R, callback: OutputCallback, pid: u32) -> Result<Receiver<()>>
where
    R: std::io::Read + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("ironframe-output-{pid}"))
        .spawn(move || {
            pump_lines(stream, &callback);
            let _ = done_tx.send(());
        })?;
    Ok(done_rx)
}

/// Grandchildren may inherit the pipes and keep them open; don't let that
/// hold up the exit notification forever.
pub(super) fn drain_readers(readers: Vec<Receiver<()>>) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for done in readers {
        let _ = done.recv_timeout(deadline.saturating_duration_since(Instant::now()));
    }
}

fn watch(
    mut child: Child,
    exit: Arc<ExitSignal>,
    reaped: Arc<AtomicBool>,
    readers: Vec<Receiver<()>>,
    retired: Arc<Mutex<Option<Child>>>,
) {
    let pid = child.id();
    let code = match child.wait() {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed waiting for process");
            -1
        }
    };
    reaped.store(true, Ordering::SeqCst);
    drain_readers(readers);

    tracing::debug!(pid, code, "process exited");
    exit.set(code);
    *retired.lock() = Some(child);
}

/// Launches processes directly with the standard library
pub struct LocalProcessRunner {
    processes: Mutex<Vec<Arc<LocalProcess>>>,
    stop_timeout: Duration,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self::with_stop_timeout(DEFAULT_STOP_TIMEOUT)
    }

    /// `stop_timeout` bounds the graceful phase of [`ProcessRunner::stop_all`]
    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            stop_timeout,
        }
    }

    pub fn spawn(&self, spec: &ProcessRunSpec) -> Result<Arc<LocalProcess>> {
        if spec.credentials.is_some() {
            return Err(Error::Unsupported(
                "running as another user requires the impersonation runner".into(),
            ));
        }

        let mut command = Command::new(&spec.executable_path);
        command.args(&spec.arguments);
        if !spec.environment.is_empty() {
            command.env_clear().envs(&spec.environment);
        }
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let piped = |wanted: bool| if wanted { Stdio::piped() } else { Stdio::null() };
        if spec.buffered_input_output {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(piped(spec.output_callback.is_some()))
                .stderr(piped(spec.error_callback.is_some()));
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::os(&format!("spawn {}", spec.executable_path), e))?;
        let pid = child.id();

        let mut readers = Vec::new();
        let mut stdio = None;
        if spec.buffered_input_output {
            stdio = Some(ProcessStdio {
                stdin: child.stdin.take().map(|s| Box::new(s) as _),
                stdout: child.stdout.take().map(|s| Box::new(s) as _),
                stderr: child.stderr.take().map(|s| Box::new(s) as _),
            });
        } else {
            if let (Some(stream), Some(callback)) = (child.stdout.take(), &spec.output_callback) {
                readers.push(spawn_reader(stream, callback.clone(), pid)?);
            }
            if let (Some(stream), Some(callback)) = (child.stderr.take(), &spec.error_callback) {
                readers.push(spawn_reader(stream, callback.clone(), pid)?);
            }
        }

        let environment = if spec.environment.is_empty() {
            std::env::vars().collect()
        } else {
            spec.environment.clone()
        };

        #[cfg(windows)]
        let raw = {
            use std::os::windows::io::AsRawHandle;
            child.as_raw_handle() as isize
        };

        let process = Arc::new(LocalProcess {
            pid,
            environment,
            exit: ExitSignal::new(),
            reaped: Arc::new(AtomicBool::new(false)),
            stdio: Mutex::new(stdio),
            retired: Arc::new(Mutex::new(None)),
            #[cfg(windows)]
            raw,
        });

        let (exit, reaped, retired) = (
            process.exit.clone(),
            process.reaped.clone(),
            process.retired.clone(),
        );
        std::thread::Builder::new()
            .name(format!("ironframe-wait-{pid}"))
            .spawn(move || watch(child, exit, reaped, readers, retired))?;

        tracing::info!(pid, executable = %spec.executable_path, "started process");

        let mut processes = self.processes.lock();
        processes.retain(|p| !p.has_exited());
        processes.push(process.clone());
        Ok(process)
    }

    fn live_processes(&self) -> Vec<Arc<LocalProcess>> {
        self.processes
            .lock()
            .iter()
            .filter(|p| !p.has_exited())
            .cloned()
            .collect()
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for LocalProcessRunner {
    fn run(&self, spec: ProcessRunSpec) -> Result<Arc<dyn Process>> {
        Ok(self.spawn(&spec)?)
    }

    fn find_process_by_id(&self, pid: u32) -> Result<Option<Arc<dyn Process>>> {
        Ok(self
            .processes
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.clone() as Arc<dyn Process>))
    }

    fn stop_all(&self, kill: bool) -> Result<()> {
        let processes = self.live_processes();
        let mut first_error = None;

        for process in &processes {
            let result = if kill {
                process.kill()
            } else {
                process.request_exit()
            };
            if let Err(e) = result {
                tracing::warn!(pid = process.pid, error = %e, "failed to stop process");
                first_error.get_or_insert(e);
            }
        }

        if !kill {
            let deadline = Instant::now() + self.stop_timeout;
            for process in &processes {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !process.exit.wait(Some(remaining)) {
                    tracing::info!(pid = process.pid, "process ignored exit request, killing");
                    if let Err(e) = process.kill() {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispose(&self) {
        if let Err(e) = self.stop_all(true) {
            tracing::warn!(error = %e, "failed to kill processes while disposing runner");
        }
        self.processes.lock().clear();
    }
}
