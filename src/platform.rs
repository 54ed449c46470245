//! Thin OS helpers shared by the command-line adapters and process code

use std::process::Command;

use crate::{Error, Result};

/// Run a command to completion and return its stdout.
///
/// A non-zero exit becomes [`Error::Command`] carrying stderr (or stdout
/// when stderr is empty, which is where `netsh` reports failures).
pub fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %rendered, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::os(program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::Command {
            command: rendered,
            status: output.status.to_string(),
            stderr: if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr
            },
        });
    }
    Ok(stdout)
}

/// Run a PowerShell script without loading the user profile
pub fn run_powershell(script: &str) -> Result<String> {
    run_command("powershell", &["-NoProfile", "-NonInteractive", "-Command", script])
}

/// Quote a value for a single-quoted PowerShell string literal
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Principal that always gets full access to container directories
#[cfg(windows)]
pub fn administrators_principal() -> String {
    // BUILTIN\Administrators, by SID so it works on localized systems
    "*S-1-5-32-544".to_string()
}

#[cfg(not(windows))]
pub fn administrators_principal() -> String {
    "root".to_string()
}

/// Identity the service itself runs as
#[cfg(windows)]
pub fn current_user_name() -> String {
    match (std::env::var("USERDOMAIN"), std::env::var("USERNAME")) {
        (Ok(domain), Ok(user)) => format!(r"{domain}\{user}"),
        (_, Ok(user)) => user,
        // LocalSystem
        _ => "*S-1-5-18".to_string(),
    }
}

#[cfg(not(windows))]
pub fn current_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// Forcefully end a process by pid
#[cfg(windows)]
pub fn terminate_pid(pid: u32) -> Result<()> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, false, pid)
            .map_err(|e| Error::win32("OpenProcess", e))?;
        let result = TerminateProcess(handle, 1).map_err(|e| Error::win32("TerminateProcess", e));
        let _ = CloseHandle(handle);
        result
    }
}

/// Forcefully end a process through a handle the caller keeps open
#[cfg(windows)]
pub fn terminate_handle(raw: isize) -> Result<()> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Threading::TerminateProcess;

    unsafe { TerminateProcess(HANDLE(raw as _), 1) }
        .map_err(|e| Error::win32("TerminateProcess", e))
}

#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<()> {
    signal_pid(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Ask a process to exit; Windows has no portable equivalent so this kills
#[cfg(windows)]
pub fn request_exit_pid(pid: u32) -> Result<()> {
    terminate_pid(pid)
}

#[cfg(unix)]
pub fn request_exit_pid(pid: u32) -> Result<()> {
    signal_pid(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), signal) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::Os {
            operation: format!("kill({})", signal.as_str()),
            code: errno as i32,
            message: errno.desc().to_string(),
        }),
    }
}

/// Whether a pid still names a live process
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok() && !is_zombie(pid)
}

/// Exited but not yet reaped by its parent
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesized command name
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// A TCP port the OS considers free right now
pub fn free_tcp_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
