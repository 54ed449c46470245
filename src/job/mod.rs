//! Kernel job objects: resource grouping, accounting and limits
//!
//! The [`JobObject`] trait is the seam every container component talks to.
//! On Windows it is backed by [`Win32JobObject`]; elsewhere the factory
//! reports the platform as unsupported and callers supply their own
//! implementation.

mod limits;
#[cfg(windows)]
mod win32;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::Process;
use crate::Result;

pub use limits::{MemoryLimitMonitor, DEFAULT_POLL_PERIOD};
#[cfg(windows)]
pub use win32::Win32JobObject;

/// Valid range for [`JobObject::set_cpu_limit`] weights
pub const CPU_WEIGHT_RANGE: std::ops::RangeInclusive<u32> = 1..=9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuStatistics {
    pub total_kernel_time: Duration,
    pub total_user_time: Duration,
}

impl CpuStatistics {
    pub fn total(&self) -> Duration {
        self.total_kernel_time + self.total_user_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

/// Messages the kernel posts about a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobNotification {
    JobMemoryLimit,
    ProcessMemoryLimit { pid: u32 },
    ActiveProcessLimit,
    ActiveProcessZero,
    NewProcess { pid: u32 },
    ExitProcess { pid: u32 },
    AbnormalExitProcess { pid: u32 },
    Other { message: u32 },
}

impl JobNotification {
    /// Decode a `JOB_OBJECT_MSG_*` completion packet
    pub fn from_message(message: u32, pid: u32) -> Self {
        match message {
            3 => JobNotification::ActiveProcessLimit,
            4 => JobNotification::ActiveProcessZero,
            6 => JobNotification::NewProcess { pid },
            7 => JobNotification::ExitProcess { pid },
            8 => JobNotification::AbnormalExitProcess { pid },
            9 => JobNotification::ProcessMemoryLimit { pid },
            10 => JobNotification::JobMemoryLimit,
            other => JobNotification::Other { message: other },
        }
    }
}

pub type JobNotificationCallback = Box<dyn Fn(JobNotification) + Send + Sync>;

pub trait JobObject: Send + Sync {
    fn name(&self) -> Option<&str>;

    fn assign_process(&self, process: &dyn Process) -> Result<()>;

    /// Put the calling process itself into the job
    fn assign_current_process(&self) -> Result<()>;

    /// Snapshot of member pids
    fn process_ids(&self) -> Result<Vec<u32>>;

    fn cpu_statistics(&self) -> Result<CpuStatistics>;

    fn peak_memory_used(&self) -> Result<u64>;

    fn set_memory_limit(&self, bytes: u64) -> Result<()>;

    /// 0 when no job memory limit is set
    fn memory_limit(&self) -> Result<u64>;

    /// Relative scheduling weight in [`CPU_WEIGHT_RANGE`]
    fn set_cpu_limit(&self, weight: u32) -> Result<()>;

    fn cpu_limit(&self) -> Result<u32>;

    fn set_active_process_limit(&self, limit: u32) -> Result<()>;

    fn set_priority_class(&self, priority: PriorityClass) -> Result<()>;

    fn terminate_processes(&self) -> Result<()>;

    /// Terminate every member and wait for the job to drain.
    /// Returns `false` if `timeout` elapsed first.
    fn terminate_processes_and_wait(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Deliver kernel notifications; the first subscription starts the listener
    fn subscribe_notifications(&self, callback: JobNotificationCallback) -> Result<()>;

    /// Release the handle; members are killed. Idempotent.
    fn dispose(&self);
}

#[cfg_attr(test, mockall::automock)]
pub trait JobObjectFactory: Send + Sync {
    fn create(&self, name: &str) -> Result<Arc<dyn JobObject>>;

    /// Open an existing named job, creating it if it has disappeared
    fn open_or_create(&self, name: &str) -> Result<Arc<dyn JobObject>>;
}

#[derive(Debug, Default, Clone)]
pub struct NativeJobObjectFactory;

impl JobObjectFactory for NativeJobObjectFactory {
    #[cfg(windows)]
    fn create(&self, name: &str) -> Result<Arc<dyn JobObject>> {
        Ok(Arc::new(Win32JobObject::create(Some(name))?))
    }

    #[cfg(windows)]
    fn open_or_create(&self, name: &str) -> Result<Arc<dyn JobObject>> {
        match Win32JobObject::open(name) {
            Ok(job) => Ok(Arc::new(job)),
            Err(_) => self.create(name),
        }
    }

    #[cfg(not(windows))]
    fn create(&self, name: &str) -> Result<Arc<dyn JobObject>> {
        Err(crate::Error::Unsupported(format!("job object '{name}'")))
    }

    #[cfg(not(windows))]
    fn open_or_create(&self, name: &str) -> Result<Arc<dyn JobObject>> {
        self.create(name)
    }
}

pub(crate) fn validate_cpu_weight(weight: u32) -> Result<()> {
    if CPU_WEIGHT_RANGE.contains(&weight) {
        Ok(())
    } else {
        Err(crate::Error::InvalidArgument(format!(
            "CPU weight must be between {} and {}, got {weight}",
            CPU_WEIGHT_RANGE.start(),
            CPU_WEIGHT_RANGE.end()
        )))
    }
}
