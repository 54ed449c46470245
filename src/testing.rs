//! Hand-written fakes shared by unit tests

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::host::{ContainerHostClient, ExitedCallback, ProcessDataCallback};
use crate::job::{
    validate_cpu_weight, CpuStatistics, JobNotification, JobNotificationCallback, JobObject,
    PriorityClass,
};
use crate::messages::{
    CreateProcessParams, CreateProcessResult, FindProcessByIdParams, FindProcessByIdResult,
    ProcessDataEvent, ProcessDataType, WaitForProcessExitParams, WaitForProcessExitResult,
};
use crate::process::{ExitSignal, Process, ProcessStdio};
use crate::{Error, Result};

// In-memory pipes

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Condvar,
}

/// Blocking read end; EOF once the writer is dropped and the buffer drained
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        while state.buffer.is_empty() && !state.closed {
            self.shared.readable.wait(&mut state);
        }
        let n = buf.len().min(state.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.state.lock().buffer.extend(buf);
        self.shared.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.readable.notify_all();
    }
}

pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(PipeShared::default());
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// One side of a [`duplex`] connection
pub struct PipeEnd {
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

/// Two connected ends: what one writes the other reads
pub fn duplex() -> (PipeEnd, PipeEnd) {
    let (a_reader, b_writer) = pipe();
    let (b_reader, a_writer) = pipe();
    (
        PipeEnd {
            reader: a_reader,
            writer: a_writer,
        },
        PipeEnd {
            reader: b_reader,
            writer: b_writer,
        },
    )
}

// Job object

#[derive(Default)]
struct FakeJobState {
    pids: Vec<u32>,
    assigned: Vec<u32>,
    peak_memory: u64,
    memory_limit: u64,
    cpu_weight: u32,
    cpu: CpuStatistics,
    active_process_limit: Option<u32>,
    priority: Option<PriorityClass>,
    terminate_calls: usize,
    disposed: bool,
}

/// In-memory job that records what was asked of it
#[derive(Default)]
pub struct FakeJob {
    name: Option<String>,
    state: Mutex<FakeJobState>,
    callbacks: Mutex<Vec<JobNotificationCallback>>,
}

impl FakeJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: Some(name.to_string()),
            ..Default::default()
        })
    }

    pub fn set_peak_memory(&self, bytes: u64) {
        self.state.lock().peak_memory = bytes;
    }

    pub fn set_cpu_statistics(&self, cpu: CpuStatistics) {
        self.state.lock().cpu = cpu;
    }

    pub fn add_pid(&self, pid: u32) {
        self.state.lock().pids.push(pid);
    }

    pub fn assigned(&self) -> Vec<u32> {
        self.state.lock().assigned.clone()
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.lock().terminate_calls
    }

    pub fn active_process_limit(&self) -> Option<u32> {
        self.state.lock().active_process_limit
    }

    pub fn priority_class(&self) -> Option<PriorityClass> {
        self.state.lock().priority
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn notify(&self, notification: JobNotification) {
        for callback in self.callbacks.lock().iter() {
            callback(notification);
        }
    }

    fn live(&self) -> Result<parking_lot::MutexGuard<'_, FakeJobState>> {
        let state = self.state.lock();
        if state.disposed {
            return Err(Error::Disposed("job object".into()));
        }
        Ok(state)
    }
}

impl JobObject for FakeJob {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn assign_process(&self, process: &dyn Process) -> Result<()> {
        let mut state = self.live()?;
        state.assigned.push(process.id());
        state.pids.push(process.id());
        Ok(())
    }

    fn assign_current_process(&self) -> Result<()> {
        self.live()?.pids.push(std::process::id());
        Ok(())
    }

    fn process_ids(&self) -> Result<Vec<u32>> {
        Ok(self.live()?.pids.clone())
    }

    fn cpu_statistics(&self) -> Result<CpuStatistics> {
        Ok(self.live()?.cpu)
    }

    fn peak_memory_used(&self) -> Result<u64> {
        Ok(self.live()?.peak_memory)
    }

    fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.live()?.memory_limit = bytes;
        Ok(())
    }

    fn memory_limit(&self) -> Result<u64> {
        Ok(self.live()?.memory_limit)
    }

    fn set_cpu_limit(&self, weight: u32) -> Result<()> {
        validate_cpu_weight(weight)?;
        self.live()?.cpu_weight = weight;
        Ok(())
    }

    fn cpu_limit(&self) -> Result<u32> {
        Ok(self.live()?.cpu_weight)
    }

    fn set_active_process_limit(&self, limit: u32) -> Result<()> {
        self.live()?.active_process_limit = Some(limit);
        Ok(())
    }

    fn set_priority_class(&self, priority: PriorityClass) -> Result<()> {
        self.live()?.priority = Some(priority);
        Ok(())
    }

    fn terminate_processes(&self) -> Result<()> {
        let mut state = self.live()?;
        state.terminate_calls += 1;
        state.pids.clear();
        Ok(())
    }

    fn terminate_processes_and_wait(&self, _timeout: Option<Duration>) -> Result<bool> {
        self.terminate_processes()?;
        Ok(true)
    }

    fn subscribe_notifications(&self, callback: JobNotificationCallback) -> Result<()> {
        self.live()?;
        self.callbacks.lock().push(callback);
        Ok(())
    }

    fn dispose(&self) {
        self.state.lock().disposed = true;
    }
}

// Process

/// Scriptable process: exits when told to, counts kills and exit requests
pub struct FakeProcess {
    pid: u32,
    exit: Arc<ExitSignal>,
    environment: Mutex<HashMap<String, String>>,
    kills: AtomicUsize,
    exit_requests: AtomicUsize,
    exit_on_request: AtomicBool,
    stdio: Mutex<Option<ProcessStdio>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self::build(pid, None))
    }

    pub fn with_stdio(
        pid: u32,
        stdin: Box<dyn Write + Send>,
        stdout: Box<dyn Read + Send>,
        stderr: Box<dyn Read + Send>,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            pid,
            Some(ProcessStdio {
                stdin: Some(stdin),
                stdout: Some(stdout),
                stderr: Some(stderr),
            }),
        ))
    }

    fn build(pid: u32, stdio: Option<ProcessStdio>) -> Self {
        Self {
            pid,
            exit: ExitSignal::new(),
            environment: Mutex::new(HashMap::new()),
            kills: AtomicUsize::new(0),
            exit_requests: AtomicUsize::new(0),
            exit_on_request: AtomicBool::new(false),
            stdio: Mutex::new(stdio),
        }
    }

    pub fn set_environment(&self, environment: HashMap<String, String>) {
        *self.environment.lock() = environment;
    }

    pub fn exit_with(&self, code: i32) {
        self.exit.set(code);
    }

    pub fn exit_on_request(&self, yes: bool) {
        self.exit_on_request.store(yes, Ordering::SeqCst);
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn exit_requests(&self) -> usize {
        self.exit_requests.load(Ordering::SeqCst)
    }
}

impl Process for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn exit_code(&self) -> Result<i32> {
        self.exit.code().ok_or(Error::ProcessNotExited)
    }

    fn environment(&self) -> HashMap<String, String> {
        self.environment.lock().clone()
    }

    fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.set(1);
        Ok(())
    }

    fn request_exit(&self) -> Result<()> {
        self.exit_requests.fetch_add(1, Ordering::SeqCst);
        if self.exit_on_request.load(Ordering::SeqCst) {
            self.exit.set(0);
        }
        Ok(())
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.exit.wait(timeout))
    }

    fn take_stdio(&self) -> Option<ProcessStdio> {
        self.stdio.lock().take()
    }
}

// Host client

struct FakeProcessRecord {
    params: CreateProcessParams,
    pid: u32,
}

/// In-process stand-in for a container host
pub struct FakeHostClient {
    next_pid: AtomicU32,
    processes: Mutex<Vec<FakeProcessRecord>>,
    exits: Mutex<HashMap<Uuid, i32>>,
    exit_changed: Condvar,
    subscriptions: Mutex<HashMap<Uuid, ProcessDataCallback>>,
    stops: Mutex<Vec<(Option<Uuid>, Duration)>>,
    fail_create: AtomicBool,
    exited: AtomicBool,
    shutdowns: AtomicUsize,
    exited_callbacks: Mutex<Vec<ExitedCallback>>,
}

impl FakeHostClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
            exit_changed: Condvar::new(),
            subscriptions: Mutex::new(HashMap::new()),
            stops: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            exited_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<CreateProcessParams> {
        self.processes
            .lock()
            .iter()
            .map(|p| p.params.clone())
            .collect()
    }

    pub fn pid_of(&self, key: Uuid) -> Option<u32> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.params.key == key)
            .map(|p| p.pid)
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, key: Uuid, data_type: ProcessDataType, data: &str) {
        let callback = self.subscriptions.lock().get(&key).cloned();
        if let Some(callback) = callback {
            callback(ProcessDataEvent {
                key,
                data_type,
                data: data.to_string(),
            });
        }
    }

    pub fn finish(&self, key: Uuid, code: i32) {
        self.exits.lock().insert(key, code);
        self.exit_changed.notify_all();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn stops(&self) -> Vec<(Option<Uuid>, Duration)> {
        self.stops.lock().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn simulate_exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        for callback in self.exited_callbacks.lock().iter() {
            callback();
        }
    }

    fn available(&self) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(Error::HostUnavailable);
        }
        Ok(())
    }
}

impl ContainerHostClient for FakeHostClient {
    fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult> {
        self.available()?;
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Rpc {
                code: -32603,
                message: "The system cannot find the file specified.".into(),
                data: None,
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().push(FakeProcessRecord { params, pid });
        Ok(CreateProcessResult { id: pid })
    }

    fn ping(&self, _timeout: Duration) -> bool {
        self.available().is_ok()
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_process(&self, key: Uuid, grace: Duration) -> Result<()> {
        self.available()?;
        self.stops.lock().push((Some(key), grace));
        self.exits.lock().entry(key).or_insert(1);
        self.exit_changed.notify_all();
        Ok(())
    }

    fn stop_all_processes(&self, grace: Duration) -> Result<()> {
        self.available()?;
        self.stops.lock().push((None, grace));
        let keys: Vec<Uuid> = self.processes.lock().iter().map(|p| p.params.key).collect();
        let mut exits = self.exits.lock();
        for key in keys {
            exits.entry(key).or_insert(1);
        }
        drop(exits);
        self.exit_changed.notify_all();
        Ok(())
    }

    fn subscribe_to_process_data(&self, key: Uuid, callback: ProcessDataCallback) {
        self.subscriptions.lock().insert(key, callback);
    }

    fn unsubscribe_from_process_data(&self, key: Uuid) {
        self.subscriptions.lock().remove(&key);
    }

    fn wait_for_process_exit(
        &self,
        params: WaitForProcessExitParams,
    ) -> Result<WaitForProcessExitResult> {
        self.available()?;
        let deadline = params
            .timeout_ms
            .map(|ms| std::time::Instant::now() + Duration::from_millis(ms));
        let mut exits = self.exits.lock();
        loop {
            if let Some(&exit_code) = exits.get(&params.key) {
                return Ok(WaitForProcessExitResult {
                    exited: true,
                    exit_code,
                });
            }
            match deadline {
                None => self.exit_changed.wait(&mut exits),
                Some(deadline) => {
                    if self.exit_changed.wait_until(&mut exits, deadline).timed_out()
                        && !exits.contains_key(&params.key)
                    {
                        return Ok(WaitForProcessExitResult {
                            exited: false,
                            exit_code: 0,
                        });
                    }
                }
            }
        }
    }

    fn find_process_by_id(
        &self,
        params: FindProcessByIdParams,
    ) -> Result<Option<FindProcessByIdResult>> {
        self.available()?;
        Ok(self
            .processes
            .lock()
            .iter()
            .find(|p| p.pid == params.id)
            .map(|p| FindProcessByIdResult {
                process_key: p.params.key,
                id: p.pid,
                environment: p.params.environment.clone(),
            }))
    }

    fn on_exited(&self, callback: ExitedCallback) {
        self.exited_callbacks.lock().push(callback);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_reports_eof_after_writer_drops() {
        let (mut reader, mut writer) = pipe();
        writer.write_all(b"abc").unwrap();
        drop(writer);
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "abc");
    }
}
