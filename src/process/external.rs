use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{ExitSignal, Process};
use crate::platform;
use crate::{Error, Result};

/// A process known only by pid, such as a job member started by another process.
///
/// The exit code is observable on Windows; elsewhere an observed exit reports `-1`.
pub struct ExternalProcess {
    pid: u32,
    exit: Arc<ExitSignal>,
}

impl ExternalProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit: ExitSignal::new(),
        }
    }

    #[cfg(windows)]
    fn poll_exit(&self, timeout: Option<Duration>) -> Result<Option<i32>> {
        use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0};
        use windows::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, WaitForSingleObject, INFINITE,
            PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
        };

        const ERROR_INVALID_PARAMETER: u32 = 87;

        let handle = match unsafe {
            OpenProcess(
                PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION,
                false,
                self.pid,
            )
        } {
            Ok(handle) => handle,
            // The pid no longer names a process
            Err(e) if e.code() == windows::core::HRESULT::from_win32(ERROR_INVALID_PARAMETER) => {
                return Ok(Some(-1))
            }
            Err(e) => return Err(Error::win32("OpenProcess", e)),
        };

        let millis = timeout
            .map(|t| t.as_millis().min(u128::from(INFINITE - 1)) as u32)
            .unwrap_or(INFINITE);
        let result = unsafe {
            if WaitForSingleObject(handle, millis) == WAIT_OBJECT_0 {
                let mut code = 0u32;
                GetExitCodeProcess(handle, &mut code)
                    .map(|_| Some(code as i32))
                    .map_err(|e| Error::win32("GetExitCodeProcess", e))
            } else {
                Ok(None)
            }
        };
        unsafe {
            let _ = CloseHandle(handle);
        }
        result
    }

    #[cfg(unix)]
    fn poll_exit(&self, timeout: Option<Duration>) -> Result<Option<i32>> {
        const POLL: Duration = Duration::from_millis(20);

        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if !platform::pid_alive(self.pid) {
                return Ok(Some(-1));
            }
            if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                return Ok(None);
            }
            std::thread::sleep(POLL);
        }
    }
}

impl Process for ExternalProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn exit_code(&self) -> Result<i32> {
        if let Some(code) = self.exit.code() {
            return Ok(code);
        }
        match self.poll_exit(Some(Duration::ZERO))? {
            Some(code) => {
                self.exit.set(code);
                Ok(code)
            }
            None => Err(Error::ProcessNotExited),
        }
    }

    fn environment(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn kill(&self) -> Result<()> {
        if self.exit.code().is_some() {
            return Ok(());
        }
        platform::terminate_pid(self.pid)
    }

    fn request_exit(&self) -> Result<()> {
        if self.exit.code().is_some() {
            return Ok(());
        }
        platform::request_exit_pid(self.pid)
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.exit.code().is_some() {
            return Ok(true);
        }
        match self.poll_exit(timeout)? {
            Some(code) => {
                self.exit.set(code);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
