//! Process launch and supervision
//!
//! Three runners share one contract:
//!
//! - [`LocalProcessRunner`]: direct launch in the caller's account
//! - `ImpersonationProcessRunner` (Windows): launch under another user's token
//! - [`ConstrainedProcessRunner`]: every call proxied to the container host

mod constrained;
mod external;
#[cfg(windows)]
mod impersonation;
mod local;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::user::Credentials;
use crate::Result;

pub use constrained::{ConstrainedProcess, ConstrainedProcessRunner};
pub use external::ExternalProcess;
#[cfg(windows)]
pub use impersonation::ImpersonationProcessRunner;
pub use local::{LocalProcess, LocalProcessRunner};

/// Receives one chunk of process output (a line including its terminator)
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProcessRunSpec {
    pub executable_path: String,
    pub arguments: Vec<String>,
    /// Exact environment for the child; empty inherits the caller's
    pub environment: HashMap<String, String>,
    pub working_directory: Option<String>,
    pub credentials: Option<Credentials>,
    /// Leave stdin/stdout/stderr to the caller instead of pumping callbacks
    pub buffered_input_output: bool,
    pub output_callback: Option<OutputCallback>,
    pub error_callback: Option<OutputCallback>,
}

impl std::fmt::Debug for ProcessRunSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunSpec")
            .field("executable_path", &self.executable_path)
            .field("arguments", &self.arguments)
            .field("working_directory", &self.working_directory)
            .field("credentials", &self.credentials)
            .field("buffered_input_output", &self.buffered_input_output)
            .finish_non_exhaustive()
    }
}

/// Standard streams of a buffered process
pub struct ProcessStdio {
    pub stdin: Option<Box<dyn Write + Send>>,
    pub stdout: Option<Box<dyn Read + Send>>,
    pub stderr: Option<Box<dyn Read + Send>>,
}

pub trait Process: Send + Sync {
    fn id(&self) -> u32;

    /// Exit code once the process has exited
    fn exit_code(&self) -> Result<i32>;

    fn has_exited(&self) -> bool {
        self.exit_code().is_ok()
    }

    fn environment(&self) -> HashMap<String, String>;

    fn kill(&self) -> Result<()>;

    /// Ask for a graceful exit
    fn request_exit(&self) -> Result<()>;

    /// `true` once exited; `None` waits forever
    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool>;

    /// OS handle for job assignment, when the process is local
    fn raw_handle(&self) -> Option<isize> {
        None
    }

    /// Streams of a buffered process; available once
    fn take_stdio(&self) -> Option<ProcessStdio> {
        None
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    fn run(&self, spec: ProcessRunSpec) -> Result<Arc<dyn Process>>;

    fn find_process_by_id(&self, pid: u32) -> Result<Option<Arc<dyn Process>>>;

    /// Stop everything this runner launched; `kill` skips the graceful phase
    fn stop_all(&self, kill: bool) -> Result<()>;

    fn dispose(&self);
}

/// Exit code published once by a wait thread, observed by any number of waiters
#[derive(Default)]
pub(crate) struct ExitSignal {
    code: Mutex<Option<i32>>,
    changed: Condvar,
}

impl ExitSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set(&self, code: i32) {
        let mut slot = self.code.lock();
        if slot.is_none() {
            *slot = Some(code);
        }
        self.changed.notify_all();
    }

    pub(crate) fn code(&self) -> Option<i32> {
        *self.code.lock()
    }

    /// Run `f` unless the exit has already been published
    pub(crate) fn while_running<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<Result<T>> {
        let slot = self.code.lock();
        if slot.is_some() {
            return None;
        }
        let result = f();
        drop(slot);
        Some(result)
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut slot = self.code.lock();
        match timeout {
            None => {
                while slot.is_none() {
                    self.changed.wait(&mut slot);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while slot.is_none() {
                    if self.changed.wait_until(&mut slot, deadline).timed_out() {
                        return slot.is_some();
                    }
                }
                true
            }
        }
    }
}

/// Forward a stream to a callback one line at a time until EOF
pub(crate) fn pump_lines<R: Read>(stream: R, callback: &OutputCallback) {
    use std::io::BufRead;

    let mut reader = std::io::BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => callback(&String::from_utf8_lossy(&line)),
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed");
                break;
            }
        }
    }
}
