use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::{ContainerHostClient, ExitedCallback, ProcessDataCallback};
use crate::job::JobObject;
use crate::messages::{
    CreateProcess, CreateProcessParams, CreateProcessResult, FindProcessById,
    FindProcessByIdParams, FindProcessByIdResult, Ping, ProcessDataEvent, StopAllProcesses,
    StopAllProcessesParams, StopProcess, StopProcessParams, WaitForProcessExit,
    WaitForProcessExitParams, WaitForProcessExitResult, PROCESS_DATA_TOPIC,
};
use crate::messaging::{MessageTransport, MessagingClient, RpcMethod};
use crate::process::Process;
use crate::{Error, Result};

/// How long a host that has lost its stdin gets to exit on its own
const HOST_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct HostTimeouts {
    pub request: Duration,
    pub shutdown: Duration,
}

#[derive(Default)]
struct Lifecycle {
    exited: AtomicBool,
    shut_down: AtomicBool,
    callbacks: RwLock<Vec<ExitedCallback>>,
}

impl Lifecycle {
    fn mark_exited(&self) {
        if self.shut_down.load(Ordering::SeqCst) || self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("container host exited unexpectedly");
        for callback in self.callbacks.read().iter() {
            callback();
        }
    }
}

/// [`ContainerHostClient`] over a JSON-RPC channel.
///
/// Calls block the current thread on the shared runtime, so they must not be
/// made from inside an async task.
pub struct RemoteHostClient {
    runtime: Arc<Runtime>,
    messaging: Arc<MessagingClient>,
    job: Arc<dyn JobObject>,
    host_process: Option<Arc<dyn Process>>,
    timeouts: HostTimeouts,
    subscriptions: Arc<RwLock<HashMap<Uuid, ProcessDataCallback>>>,
    lifecycle: Arc<Lifecycle>,
}

impl RemoteHostClient {
    /// Wire a client to the host's output (`reader`) and input (`writer`) and
    /// start reading
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        job: Arc<dyn JobObject>,
        host_process: Option<Arc<dyn Process>>,
        runtime: Arc<Runtime>,
        timeouts: HostTimeouts,
    ) -> Result<Arc<Self>>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let transport = MessageTransport::new(reader, writer);
        let messaging = MessagingClient::new(transport.clone());

        let subscriptions: Arc<RwLock<HashMap<Uuid, ProcessDataCallback>>> = Arc::default();
        let routes = subscriptions.clone();
        messaging.subscribe::<ProcessDataEvent, _>(PROCESS_DATA_TOPIC, move |event| {
            let callback = routes.read().get(&event.key).cloned();
            match callback {
                Some(callback) => callback(event),
                None => tracing::debug!(key = %event.key, "process data for unknown key"),
            }
        });

        let lifecycle = Arc::new(Lifecycle::default());
        let watcher = lifecycle.clone();
        transport.on_closed(move || watcher.mark_exited());
        transport.start()?;

        Ok(Arc::new(Self {
            runtime,
            messaging,
            job,
            host_process,
            timeouts,
            subscriptions,
            lifecycle,
        }))
    }

    fn call<M: RpcMethod>(&self, params: M::Params, timeout: Option<Duration>) -> Result<M::Result> {
        if self.lifecycle.shut_down.load(Ordering::SeqCst) || self.has_exited() {
            return Err(Error::HostUnavailable);
        }
        let messaging = self.messaging.clone();
        self.runtime.block_on(async move {
            let response = messaging.send_message::<M>(&params);
            match timeout {
                None => response.await,
                Some(timeout) => tokio::time::timeout(timeout, response)
                    .await
                    .unwrap_or_else(|_| Err(Error::timeout(M::NAME, timeout))),
            }
        })
    }

    fn stop_host_process(&self) -> Result<()> {
        let Some(process) = &self.host_process else {
            return Ok(());
        };
        if !process.wait_for_exit(Some(HOST_EXIT_GRACE))? {
            tracing::warn!(pid = process.id(), "container host ignored shutdown, killing");
            process.kill()?;
        }
        Ok(())
    }
}

impl ContainerHostClient for RemoteHostClient {
    fn create_process(&self, params: CreateProcessParams) -> Result<CreateProcessResult> {
        self.call::<CreateProcess>(params, Some(self.timeouts.request))
    }

    fn ping(&self, timeout: Duration) -> bool {
        self.call::<Ping>((), Some(timeout)).is_ok()
    }

    fn shutdown(&self) -> Result<()> {
        if self.lifecycle.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(job = ?self.job.name(), "shutting down container host");
        self.messaging.dispose();
        self.subscriptions.write().clear();

        let drained = self
            .job
            .terminate_processes_and_wait(Some(self.timeouts.shutdown))?;
        self.stop_host_process()?;
        if !drained {
            return Err(Error::timeout("container job to drain", self.timeouts.shutdown));
        }
        Ok(())
    }

    fn stop_process(&self, key: Uuid, grace: Duration) -> Result<()> {
        let params = StopProcessParams {
            key,
            timeout_ms: grace.as_millis() as u64,
        };
        self.call::<StopProcess>(params, Some(grace + self.timeouts.request))
    }

    fn stop_all_processes(&self, grace: Duration) -> Result<()> {
        let params = StopAllProcessesParams {
            timeout_ms: grace.as_millis() as u64,
        };
        self.call::<StopAllProcesses>(params, Some(grace + self.timeouts.request))
    }

    fn subscribe_to_process_data(&self, key: Uuid, callback: ProcessDataCallback) {
        self.subscriptions.write().insert(key, callback);
    }

    fn unsubscribe_from_process_data(&self, key: Uuid) {
        self.subscriptions.write().remove(&key);
    }

    fn wait_for_process_exit(
        &self,
        params: WaitForProcessExitParams,
    ) -> Result<WaitForProcessExitResult> {
        let timeout = params
            .timeout_ms
            .map(|ms| Duration::from_millis(ms) + self.timeouts.request);
        self.call::<WaitForProcessExit>(params, timeout)
    }

    fn find_process_by_id(
        &self,
        params: FindProcessByIdParams,
    ) -> Result<Option<FindProcessByIdResult>> {
        self.call::<FindProcessById>(params, Some(self.timeouts.request))
    }

    fn on_exited(&self, callback: ExitedCallback) {
        let mut callbacks = self.lifecycle.callbacks.write();
        if self.lifecycle.exited.load(Ordering::SeqCst) {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(callback);
    }

    fn has_exited(&self) -> bool {
        self.lifecycle.exited.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RemoteHostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHostClient")
            .field("job", &self.job.name())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}
