//! Win32 job object wrapper

use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use windows::core::{HRESULT, HSTRING, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::JobObjects::*;
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};

use super::{
    validate_cpu_weight, CpuStatistics, JobNotification, JobNotificationCallback, JobObject,
    PriorityClass,
};
use crate::process::Process;
use crate::{Error, Result};

const JOB_OBJECT_ALL_ACCESS_RIGHTS: u32 = 0x001F_001F;
const INITIAL_PID_SLOTS: usize = 16;
const LISTENER_POLL_MS: u32 = 250;
const DRAIN_POLL: Duration = Duration::from_millis(10);

const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_MORE_DATA: u32 = 234;
const WAIT_TIMEOUT: u32 = 258;
const ERROR_ABANDONED_WAIT_0: u32 = 735;

fn handle(raw: isize) -> HANDLE {
    HANDLE(raw as _)
}

fn is_win32(err: &windows::core::Error, code: u32) -> bool {
    err.code() == HRESULT::from_win32(code)
}

fn priority_value(priority: PriorityClass) -> u32 {
    match priority {
        PriorityClass::Idle => 0x0000_0040,
        PriorityClass::BelowNormal => 0x0000_4000,
        PriorityClass::Normal => 0x0000_0020,
        PriorityClass::AboveNormal => 0x0000_8000,
        PriorityClass::High => 0x0000_0080,
        PriorityClass::RealTime => 0x0000_0100,
    }
}

struct Listener {
    port: isize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Owns one job handle; kill-on-close is always set, so dropping the last
/// reference ends every member process.
pub struct Win32JobObject {
    name: Option<String>,
    raw: AtomicIsize,
    limits: Mutex<()>,
    listener: Mutex<Option<Listener>>,
    callbacks: Arc<RwLock<Vec<JobNotificationCallback>>>,
}

impl Win32JobObject {
    pub fn create(name: Option<&str>) -> Result<Self> {
        let wide = name.map(HSTRING::from);
        let pcwstr = wide
            .as_ref()
            .map(|h| PCWSTR(h.as_ptr()))
            .unwrap_or(PCWSTR::null());

        let job = unsafe { CreateJobObjectW(None, pcwstr) }
            .map_err(|e| Error::win32("CreateJobObjectW", e))?;
        let object = Self::from_handle(job, name);

        object.update_extended_limits(|info| {
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT(
                info.BasicLimitInformation.LimitFlags.0 | JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE.0,
            );
        })?;
        tracing::debug!(job = ?name, "created job object");
        Ok(object)
    }

    pub fn open(name: &str) -> Result<Self> {
        let wide = HSTRING::from(name);
        let job = unsafe {
            OpenJobObjectW(JOB_OBJECT_ALL_ACCESS_RIGHTS, false, PCWSTR(wide.as_ptr()))
        }
        .map_err(|e| Error::win32("OpenJobObjectW", e))?;
        Ok(Self::from_handle(job, Some(name)))
    }

    fn from_handle(job: HANDLE, name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            raw: AtomicIsize::new(job.0 as isize),
            limits: Mutex::new(()),
            listener: Mutex::new(None),
            callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn job_handle(&self) -> Result<HANDLE> {
        match self.raw.load(Ordering::SeqCst) {
            0 => Err(Error::Disposed("job object".into())),
            raw => Ok(handle(raw)),
        }
    }

    fn query<T>(&self, class: JOBOBJECTINFOCLASS, operation: &str) -> Result<T> {
        let job = self.job_handle()?;
        unsafe {
            let mut info: T = mem::zeroed();
            QueryInformationJobObject(
                job,
                class,
                &mut info as *mut T as *mut c_void,
                mem::size_of::<T>() as u32,
                None,
            )
            .map_err(|e| Error::win32(operation, e))?;
            Ok(info)
        }
    }

    fn set<T>(&self, class: JOBOBJECTINFOCLASS, info: &T, operation: &str) -> Result<()> {
        let job = self.job_handle()?;
        unsafe {
            SetInformationJobObject(
                job,
                class,
                info as *const T as *const c_void,
                mem::size_of::<T>() as u32,
            )
            .map_err(|e| Error::win32(operation, e))
        }
    }

    fn extended_limits(&self) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION> {
        self.query(
            JobObjectExtendedLimitInformation,
            "QueryInformationJobObject(ExtendedLimitInformation)",
        )
    }

    fn update_extended_limits<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut JOBOBJECT_EXTENDED_LIMIT_INFORMATION),
    {
        let _guard = self.limits.lock();
        let mut info = self.extended_limits()?;
        update(&mut info);
        self.set(
            JobObjectExtendedLimitInformation,
            &info,
            "SetInformationJobObject(ExtendedLimitInformation)",
        )
    }

    fn accounting(&self) -> Result<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION> {
        self.query(
            JobObjectBasicAccountingInformation,
            "QueryInformationJobObject(BasicAccountingInformation)",
        )
    }

    fn start_listener(&self, listener: &mut Option<Listener>) -> Result<()> {
        let job = self.job_handle()?;
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, HANDLE::default(), 0, 1) }
            .map_err(|e| Error::win32("CreateIoCompletionPort", e))?;

        let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: job.0 as *mut c_void,
            CompletionPort: port,
        };
        if let Err(e) = self.set(
            JobObjectAssociateCompletionPortInformation,
            &association,
            "SetInformationJobObject(AssociateCompletionPortInformation)",
        ) {
            unsafe {
                let _ = CloseHandle(port);
            }
            return Err(e);
        }

        let port_raw = port.0 as isize;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let callbacks = self.callbacks.clone();
        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name("ironframe-job-listener".into())
            .spawn(move || listen(port_raw, thread_stop, callbacks, name))?;

        *listener = Some(Listener {
            port: port_raw,
            stop,
            thread: Some(thread),
        });
        Ok(())
    }
}

fn listen(
    port: isize,
    stop: Arc<AtomicBool>,
    callbacks: Arc<RwLock<Vec<JobNotificationCallback>>>,
    name: Option<String>,
) {
    while !stop.load(Ordering::SeqCst) {
        let mut message = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let result = unsafe {
            GetQueuedCompletionStatus(
                handle(port),
                &mut message,
                &mut key,
                &mut overlapped,
                LISTENER_POLL_MS,
            )
        };
        match result {
            Ok(()) => {
                // For job messages the "overlapped" slot carries the pid
                let notification = JobNotification::from_message(message, overlapped as usize as u32);
                for callback in callbacks.read().iter() {
                    callback(notification);
                }
            }
            Err(e) if is_win32(&e, WAIT_TIMEOUT) => continue,
            // Port closed under us during dispose
            Err(e) if is_win32(&e, ERROR_ABANDONED_WAIT_0) || is_win32(&e, ERROR_INVALID_HANDLE) => {
                break
            }
            Err(e) => {
                tracing::warn!(job = ?name, error = %e, "job notification listener failed");
                break;
            }
        }
    }
    tracing::debug!(job = ?name, "job notification listener stopped");
}

impl JobObject for Win32JobObject {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn assign_process(&self, process: &dyn Process) -> Result<()> {
        let raw = process.raw_handle().ok_or_else(|| {
            Error::InvalidArgument(format!("process {} has no OS handle", process.id()))
        })?;
        unsafe { AssignProcessToJobObject(self.job_handle()?, handle(raw)) }
            .map_err(|e| Error::win32("AssignProcessToJobObject", e))
    }

    fn assign_current_process(&self) -> Result<()> {
        unsafe { AssignProcessToJobObject(self.job_handle()?, GetCurrentProcess()) }
            .map_err(|e| Error::win32("AssignProcessToJobObject", e))
    }

    fn process_ids(&self) -> Result<Vec<u32>> {
        let job = self.job_handle()?;
        let header_words = (2 * mem::size_of::<u32>()).div_ceil(mem::size_of::<usize>());
        let list_offset = mem::offset_of!(JOBOBJECT_BASIC_PROCESS_ID_LIST, ProcessIdList);
        let mut slots = INITIAL_PID_SLOTS;

        loop {
            let mut buffer = vec![0usize; header_words + slots];
            let bytes = (buffer.len() * mem::size_of::<usize>()) as u32;
            let result = unsafe {
                QueryInformationJobObject(
                    job,
                    JobObjectBasicProcessIdList,
                    buffer.as_mut_ptr() as *mut c_void,
                    bytes,
                    None,
                )
            };
            match result {
                Ok(()) => unsafe {
                    let list = buffer.as_ptr() as *const JOBOBJECT_BASIC_PROCESS_ID_LIST;
                    let count = ((*list).NumberOfProcessIdsInList as usize).min(slots);
                    let ids = (buffer.as_ptr() as *const u8).add(list_offset) as *const usize;
                    return Ok(std::slice::from_raw_parts(ids, count)
                        .iter()
                        .map(|&pid| pid as u32)
                        .collect());
                },
                Err(e) if is_win32(&e, ERROR_MORE_DATA) || is_win32(&e, ERROR_INSUFFICIENT_BUFFER) => {
                    slots *= 2;
                }
                Err(e) => {
                    return Err(Error::win32(
                        "QueryInformationJobObject(BasicProcessIdList)",
                        e,
                    ))
                }
            }
        }
    }

    fn cpu_statistics(&self) -> Result<CpuStatistics> {
        let info = self.accounting()?;
        // 100ns ticks
        Ok(CpuStatistics {
            total_kernel_time: Duration::from_nanos(info.TotalKernelTime as u64 * 100),
            total_user_time: Duration::from_nanos(info.TotalUserTime as u64 * 100),
        })
    }

    fn peak_memory_used(&self) -> Result<u64> {
        Ok(self.extended_limits()?.PeakJobMemoryUsed as u64)
    }

    fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.update_extended_limits(|info| {
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT(
                info.BasicLimitInformation.LimitFlags.0 | JOB_OBJECT_LIMIT_JOB_MEMORY.0,
            );
            info.JobMemoryLimit = bytes as usize;
        })
    }

    fn memory_limit(&self) -> Result<u64> {
        let info = self.extended_limits()?;
        if info.BasicLimitInformation.LimitFlags.0 & JOB_OBJECT_LIMIT_JOB_MEMORY.0 != 0 {
            Ok(info.JobMemoryLimit as u64)
        } else {
            Ok(0)
        }
    }

    fn set_cpu_limit(&self, weight: u32) -> Result<()> {
        validate_cpu_weight(weight)?;
        let info = JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
            ControlFlags: JOB_OBJECT_CPU_RATE_CONTROL(
                JOB_OBJECT_CPU_RATE_CONTROL_ENABLE.0 | JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED.0,
            ),
            Anonymous: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION_0 { Weight: weight },
        };
        self.set(
            JobObjectCpuRateControlInformation,
            &info,
            "SetInformationJobObject(CpuRateControlInformation)",
        )
    }

    fn cpu_limit(&self) -> Result<u32> {
        let info: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION = self.query(
            JobObjectCpuRateControlInformation,
            "QueryInformationJobObject(CpuRateControlInformation)",
        )?;
        if info.ControlFlags.0 & JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED.0 != 0 {
            Ok(unsafe { info.Anonymous.Weight })
        } else {
            Ok(0)
        }
    }

    fn set_active_process_limit(&self, limit: u32) -> Result<()> {
        self.update_extended_limits(|info| {
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT(
                info.BasicLimitInformation.LimitFlags.0 | JOB_OBJECT_LIMIT_ACTIVE_PROCESS.0,
            );
            info.BasicLimitInformation.ActiveProcessLimit = limit;
        })
    }

    fn set_priority_class(&self, priority: PriorityClass) -> Result<()> {
        self.update_extended_limits(|info| {
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT(
                info.BasicLimitInformation.LimitFlags.0 | JOB_OBJECT_LIMIT_PRIORITY_CLASS.0,
            );
            info.BasicLimitInformation.PriorityClass = priority_value(priority);
        })
    }

    fn terminate_processes(&self) -> Result<()> {
        unsafe { TerminateJobObject(self.job_handle()?, 0) }
            .map_err(|e| Error::win32("TerminateJobObject", e))
    }

    fn terminate_processes_and_wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.terminate_processes()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.accounting()?.ActiveProcesses == 0 {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }

    fn subscribe_notifications(&self, callback: JobNotificationCallback) -> Result<()> {
        self.callbacks.write().push(callback);
        let mut listener = self.listener.lock();
        if listener.is_none() {
            self.start_listener(&mut listener)?;
        }
        Ok(())
    }

    fn dispose(&self) {
        let raw = self.raw.swap(0, Ordering::SeqCst);
        if raw == 0 {
            return;
        }

        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop.store(true, Ordering::SeqCst);
            unsafe {
                let _ = CloseHandle(handle(listener.port));
            }
            if let Some(thread) = listener.thread.take() {
                if thread.thread().id() != std::thread::current().id() {
                    let _ = thread.join();
                }
            }
        }

        unsafe {
            let _ = CloseHandle(handle(raw));
        }
        tracing::debug!(job = ?self.name, "disposed job object");
    }
}

impl Drop for Win32JobObject {
    fn drop(&mut self) {
        self.dispose();
    }
}
