use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::job::JobObject;
use crate::messages::{ProcessDataEvent, ProcessDataType, PROCESS_DATA_TOPIC};
use crate::messaging::MessageTransport;
use crate::process::{ExternalProcess, Process};
use crate::{Error, Result};

/// Outgoing event sink for the host side
#[cfg_attr(test, mockall::automock)]
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, body: Value) -> Result<()>;
}

impl EventPublisher for MessageTransport {
    fn publish(&self, topic: &str, body: Value) -> Result<()> {
        self.publish_event(topic, &body)
    }
}

/// Processes launched by the host, keyed by the caller's GUID
pub struct ProcessTracker {
    publisher: Arc<dyn EventPublisher>,
    host_job: Option<Arc<dyn JobObject>>,
    host_pid: u32,
    processes: RwLock<HashMap<Uuid, Arc<dyn Process>>>,
}

impl ProcessTracker {
    pub fn new(publisher: Arc<dyn EventPublisher>, host_job: Option<Arc<dyn JobObject>>) -> Self {
        Self {
            publisher,
            host_job,
            host_pid: std::process::id(),
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub fn track_process(&self, key: Uuid, process: Arc<dyn Process>) -> Result<()> {
        let mut processes = self.processes.write();
        if processes.contains_key(&key) {
            return Err(Error::DuplicateProcessKey(key));
        }
        tracing::debug!(%key, pid = process.id(), "tracking process");
        processes.insert(key, process);
        Ok(())
    }

    pub fn process_by_key(&self, key: Uuid) -> Option<Arc<dyn Process>> {
        self.processes.read().get(&key).cloned()
    }

    pub fn process_by_id(&self, pid: u32) -> Option<(Uuid, Arc<dyn Process>)> {
        self.processes
            .read()
            .iter()
            .find(|(_, process)| process.id() == pid)
            .map(|(key, process)| (*key, process.clone()))
    }

    pub fn remove_process(&self, key: Uuid) -> bool {
        self.processes.write().remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }

    /// Forward a chunk of output to the container side as a `processData` event
    pub fn handle_process_data(&self, key: Uuid, data_type: ProcessDataType, data: &str) {
        let event = ProcessDataEvent {
            key,
            data_type,
            data: data.to_string(),
        };
        let result = serde_json::to_value(&event)
            .map_err(Error::from)
            .and_then(|body| self.publisher.publish(PROCESS_DATA_TOPIC, body));
        if let Err(e) = result {
            tracing::error!(%key, %data_type, error = %e, "failed to publish process data");
        }
    }

    /// Every process in the host job except the host itself.
    ///
    /// Untracked descendants come back as pid-only handles. Without a host
    /// job only the tracked processes are known.
    pub fn all_child_processes(&self) -> Result<Vec<Arc<dyn Process>>> {
        let Some(job) = &self.host_job else {
            return Ok(self.processes.read().values().cloned().collect());
        };

        let pids = job.process_ids()?;
        let processes = self.processes.read();
        Ok(pids
            .into_iter()
            .filter(|&pid| pid != self.host_pid)
            .map(|pid| {
                processes
                    .values()
                    .find(|p| p.id() == pid)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(ExternalProcess::new(pid)))
            })
            .collect())
    }
}
