//! Launch processes under another account's logon token

use std::collections::HashMap;
use std::fs::File;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, SetHandleInformation, BOOL, HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAGS,
};
use windows::Win32::Security::{
    LogonUserW, LOGON32_LOGON_BATCH, LOGON32_PROVIDER_DEFAULT, SECURITY_ATTRIBUTES,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessWithTokenW, GetExitCodeProcess, WaitForSingleObject, CREATE_NO_WINDOW,
    CREATE_UNICODE_ENVIRONMENT, INFINITE, LOGON_WITH_PROFILE, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOW,
};

use super::local::{drain_readers, spawn_reader};
use super::{ExitSignal, LocalProcessRunner, Process, ProcessRunSpec, ProcessRunner, ProcessStdio};
use crate::environment::{parse_wide_block, EnvironmentBlock};
use crate::user::Credentials;
use crate::{platform, Error, Result};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Quote one argument so `CommandLineToArgvW` reads it back unchanged
fn quote_argument(arg: &str, line: &mut String) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '"']) {
        line.push_str(arg);
        return;
    }
    line.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                line.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                line.push('"');
                backslashes = 0;
            }
            other => {
                line.extend(std::iter::repeat('\\').take(backslashes));
                line.push(other);
                backslashes = 0;
            }
        }
    }
    line.extend(std::iter::repeat('\\').take(backslashes * 2));
    line.push('"');
}

fn command_line(executable: &str, arguments: &[String]) -> String {
    let mut line = String::new();
    quote_argument(executable, &mut line);
    for arg in arguments {
        line.push(' ');
        quote_argument(arg, &mut line);
    }
    line
}

/// `KEY=value\0...\0\0`, sorted case-insensitively as the loader expects
fn environment_block(environment: &HashMap<String, String>) -> Vec<u16> {
    let mut entries: Vec<_> = environment.iter().collect();
    entries.sort_by_key(|(k, _)| k.to_uppercase());
    let mut block = Vec::new();
    for (key, value) in entries {
        block.extend(format!("{key}={value}").encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

struct Pipe {
    parent: File,
    child: OwnedHandle,
}

/// An inheritable pipe whose parent end is private to us
fn pipe(child_reads: bool) -> Result<Pipe> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: BOOL::from(true),
    };
    let (mut read, mut write) = (HANDLE::default(), HANDLE::default());
    unsafe {
        CreatePipe(&mut read, &mut write, Some(&attributes), 0)
            .map_err(|e| Error::win32("CreatePipe", e))?;
        let (read, write) = (
            OwnedHandle::from_raw_handle(read.0),
            OwnedHandle::from_raw_handle(write.0),
        );
        let (parent, child) = if child_reads { (write, read) } else { (read, write) };
        SetHandleInformation(HANDLE(parent.as_raw_handle()), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))
            .map_err(|e| Error::win32("SetHandleInformation", e))?;
        Ok(Pipe {
            parent: File::from(parent),
            child,
        })
    }
}

fn log_on(credentials: &Credentials) -> Result<OwnedHandle> {
    let user = wide(&credentials.user_name);
    let domain = wide(credentials.domain.as_deref().unwrap_or("."));
    let password = wide(&credentials.password);
    let mut token = HANDLE::default();
    unsafe {
        LogonUserW(
            PCWSTR(user.as_ptr()),
            PCWSTR(domain.as_ptr()),
            PCWSTR(password.as_ptr()),
            LOGON32_LOGON_BATCH,
            LOGON32_PROVIDER_DEFAULT,
            &mut token,
        )
        .map_err(|e| Error::win32(&format!("LogonUser({})", credentials.user_name), e))?;
        Ok(OwnedHandle::from_raw_handle(token.0))
    }
}

/// The user's default environment, overlaid with `overrides`
fn user_environment(
    token: &OwnedHandle,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut block = std::ptr::null_mut();
    let defaults = unsafe {
        CreateEnvironmentBlock(&mut block, HANDLE(token.as_raw_handle()), false)
            .map_err(|e| Error::win32("CreateEnvironmentBlock", e))?;
        let defaults = parse_wide_block(block as *const u16);
        let _ = DestroyEnvironmentBlock(block);
        defaults
    };
    Ok(overlay_environment(defaults, overrides))
}

fn overlay_environment(
    defaults: Vec<(String, String)>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    defaults
        .into_iter()
        .collect::<EnvironmentBlock>()
        .merge(overrides.iter())
        .to_map()
}

/// A process running under a container user's token
pub struct ImpersonatedProcess {
    pid: u32,
    handle: Arc<OwnedHandle>,
    environment: HashMap<String, String>,
    exit: Arc<ExitSignal>,
    stdio: Mutex<Option<ProcessStdio>>,
}

impl Process for ImpersonatedProcess {
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
        self.exit
            .while_running(|| platform::terminate_handle(self.handle.as_raw_handle() as isize))
            .unwrap_or(Ok(()))
    }

    fn request_exit(&self) -> Result<()> {
        self.kill()
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.exit.wait(timeout))
    }

    fn raw_handle(&self) -> Option<isize> {
        Some(self.handle.as_raw_handle() as isize)
    }

    fn take_stdio(&self) -> Option<ProcessStdio> {
        self.stdio.lock().take()
    }
}

/// Runs as the spec's credentials when given, otherwise as the caller
pub struct ImpersonationProcessRunner {
    local: LocalProcessRunner,
    processes: Mutex<Vec<Arc<ImpersonatedProcess>>>,
    stop_timeout: Duration,
}

impl ImpersonationProcessRunner {
    pub fn new() -> Self {
        Self::with_stop_timeout(DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            local: LocalProcessRunner::with_stop_timeout(stop_timeout),
            processes: Mutex::new(Vec::new()),
            stop_timeout,
        }
    }

    fn spawn_as(
        &self,
        spec: &ProcessRunSpec,
        credentials: &Credentials,
    ) -> Result<Arc<ImpersonatedProcess>> {
        let token = log_on(credentials)?;
        let environment = user_environment(&token, &spec.environment)?;
        let mut block = environment_block(&environment);

        let wants_out = spec.buffered_input_output || spec.output_callback.is_some();
        let wants_err = spec.buffered_input_output || spec.error_callback.is_some();
        let stdin = spec.buffered_input_output.then(|| pipe(true)).transpose()?;
        let stdout = wants_out.then(|| pipe(false)).transpose()?;
        let stderr = wants_err.then(|| pipe(false)).transpose()?;
        let child_end = |p: &Option<Pipe>| {
            p.as_ref()
                .map(|p| HANDLE(p.child.as_raw_handle()))
                .unwrap_or_default()
        };

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            dwFlags: STARTF_USESTDHANDLES,
            hStdInput: child_end(&stdin),
            hStdOutput: child_end(&stdout),
            hStdError: child_end(&stderr),
            ..Default::default()
        };
        let mut line = wide(&command_line(&spec.executable_path, &spec.arguments));
        let directory = spec.working_directory.as_deref().map(wide);
        let mut info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessWithTokenW(
                HANDLE(token.as_raw_handle()),
                LOGON_WITH_PROFILE,
                PCWSTR::null(),
                PWSTR(line.as_mut_ptr()),
                CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
                Some(block.as_mut_ptr() as *const _),
                directory
                    .as_ref()
                    .map(|d| PCWSTR(d.as_ptr()))
                    .unwrap_or(PCWSTR::null()),
                &startup,
                &mut info,
            )
            .map_err(|e| Error::win32(&format!("CreateProcessWithToken({})", spec.executable_path), e))?;
            let _ = CloseHandle(info.hThread);
        }
        let pid = info.dwProcessId;
        let handle = Arc::new(unsafe { OwnedHandle::from_raw_handle(info.hProcess.0) });

        // Only the child may hold its ends now
        let (stdin, stdout, stderr) = (
            stdin.map(|p| p.parent),
            stdout.map(|p| p.parent),
            stderr.map(|p| p.parent),
        );

        let mut readers = Vec::new();
        let mut stdio = None;
        if spec.buffered_input_output {
            stdio = Some(ProcessStdio {
                stdin: stdin.map(|f| Box::new(f) as _),
                stdout: stdout.map(|f| Box::new(f) as _),
                stderr: stderr.map(|f| Box::new(f) as _),
            });
        } else {
            if let (Some(stream), Some(callback)) = (stdout, &spec.output_callback) {
                readers.push(spawn_reader(stream, callback.clone(), pid)?);
            }
            if let (Some(stream), Some(callback)) = (stderr, &spec.error_callback) {
                readers.push(spawn_reader(stream, callback.clone(), pid)?);
            }
        }

        let process = Arc::new(ImpersonatedProcess {
            pid,
            handle: handle.clone(),
            environment,
            exit: ExitSignal::new(),
            stdio: Mutex::new(stdio),
        });

        let exit = process.exit.clone();
        std::thread::Builder::new()
            .name(format!("ironframe-wait-{pid}"))
            .spawn(move || {
                let raw = HANDLE(handle.as_raw_handle());
                let mut code = 0u32;
                let result = unsafe {
                    WaitForSingleObject(raw, INFINITE);
                    GetExitCodeProcess(raw, &mut code)
                };
                if let Err(e) = result {
                    tracing::warn!(pid, error = %e, "failed to read exit code");
                }
                drain_readers(readers);
                tracing::debug!(pid, code = code as i32, "process exited");
                exit.set(code as i32);
            })?;

        tracing::info!(pid, user = %credentials.user_name, executable = %spec.executable_path, "started process");
        let mut processes = self.processes.lock();
        processes.retain(|p| !p.has_exited());
        processes.push(process.clone());
        Ok(process)
    }

    fn live_processes(&self) -> Vec<Arc<ImpersonatedProcess>> {
        self.processes
            .lock()
            .iter()
            .filter(|p| !p.has_exited())
            .cloned()
            .collect()
    }
}

impl Default for ImpersonationProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ImpersonationProcessRunner {
    fn run(&self, spec: ProcessRunSpec) -> Result<Arc<dyn Process>> {
        match &spec.credentials {
            Some(credentials) => Ok(self.spawn_as(&spec, credentials)?),
            None => self.local.run(spec),
        }
    }

    fn find_process_by_id(&self, pid: u32) -> Result<Option<Arc<dyn Process>>> {
        let own = self
            .processes
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.clone() as Arc<dyn Process>);
        match own {
            Some(process) => Ok(Some(process)),
            None => self.local.find_process_by_id(pid),
        }
    }

    fn stop_all(&self, kill: bool) -> Result<()> {
        let mut first_error = self.local.stop_all(kill).err();
        let processes = self.live_processes();
        // No console to signal; the grace period only lets exits already under way finish
        if !kill {
            let deadline = Instant::now() + self.stop_timeout;
            for process in &processes {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = process.wait_for_exit(Some(remaining));
            }
        }
        for process in &processes {
            if let Err(e) = process.kill() {
                tracing::warn!(pid = process.pid, error = %e, "failed to stop process");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn dispose(&self) {
        if let Err(e) = self.stop_all(true) {
            tracing::warn!(error = %e, "failed to stop processes on dispose");
        }
        self.processes.lock().clear();
        self.local.dispose();
    }
}
