use std::sync::{Arc, Weak};
use std::time::Duration;

use uuid::Uuid;

use super::tracker::ProcessTracker;
use crate::messages::{
    CreateProcess, CreateProcessParams, CreateProcessResult, FindProcessById,
    FindProcessByIdParams, FindProcessByIdResult, Ping, ProcessDataType, StopAllProcesses,
    StopAllProcessesParams, StopProcess, StopProcessParams, WaitForProcessExit,
    WaitForProcessExitParams, WaitForProcessExitResult,
};
use crate::messaging::{MessageDispatcher, MessageTransport};
use crate::process::{Process, ProcessRunSpec, ProcessRunner};
use crate::{Error, Result};

/// Request handlers of the container host
pub struct HostServer {
    tracker: Arc<ProcessTracker>,
    runner: Arc<dyn ProcessRunner>,
    dispatcher: MessageDispatcher,
}

impl HostServer {
    pub fn new(tracker: Arc<ProcessTracker>, runner: Arc<dyn ProcessRunner>) -> Arc<Self> {
        let dispatcher = MessageDispatcher::new();

        let (t, r) = (tracker.clone(), runner.clone());
        dispatcher.register::<CreateProcess, _>(move |params| create_process(&t, r.as_ref(), params));
        dispatcher.register::<Ping, _>(|()| Ok(()));
        let t = tracker.clone();
        dispatcher.register::<WaitForProcessExit, _>(move |params| wait_for_exit(&t, params));
        let t = tracker.clone();
        dispatcher.register::<StopProcess, _>(move |params| stop_process(&t, params));
        let t = tracker.clone();
        dispatcher.register::<StopAllProcesses, _>(move |params| stop_all_processes(&t, params));
        let t = tracker.clone();
        dispatcher.register::<FindProcessById, _>(move |params| Ok(find_process_by_id(&t, params)));

        Arc::new(Self {
            tracker,
            runner,
            dispatcher,
        })
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Answer requests arriving on `transport`, each on its own thread so a
    /// blocking wait never stalls the reader.
    pub fn serve(self: &Arc<Self>, transport: &Arc<MessageTransport>) {
        let server: Weak<Self> = Arc::downgrade(self);
        let replies: Weak<MessageTransport> = Arc::downgrade(transport);
        transport.subscribe_request(move |body| {
            let (server, replies) = (server.clone(), replies.clone());
            let spawned = std::thread::Builder::new()
                .name("ironframe-request".into())
                .spawn(move || {
                    let Some(server) = server.upgrade() else { return };
                    let response = server.dispatcher.dispatch(body);
                    if let Some(transport) = replies.upgrade() {
                        if let Err(e) = transport.publish_response(&response) {
                            tracing::error!(id = %response.id, error = %e, "failed to send response");
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::error!(error = %e, "failed to start request thread");
            }
        });
    }

    /// Kill everything the host launched or that descends from it
    pub fn kill_all(&self) {
        self.runner.dispose();
        match self.tracker.all_child_processes() {
            Ok(children) => {
                for child in children {
                    if let Err(e) = child.kill() {
                        tracing::warn!(pid = child.id(), error = %e, "failed to kill child process");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to enumerate child processes"),
        }
    }
}

fn create_process(
    tracker: &Arc<ProcessTracker>,
    runner: &dyn ProcessRunner,
    params: CreateProcessParams,
) -> Result<CreateProcessResult> {
    let key = params.key;
    if tracker.process_by_key(key).is_some() {
        return Err(Error::DuplicateProcessKey(key));
    }

    let stdout = tracker.clone();
    let stderr = tracker.clone();
    let spec = ProcessRunSpec {
        executable_path: params.executable_path,
        arguments: params.arguments,
        environment: params.environment,
        working_directory: params.working_directory,
        output_callback: Some(Arc::new(move |data: &str| {
            stdout.handle_process_data(key, ProcessDataType::Stdout, data)
        })),
        error_callback: Some(Arc::new(move |data: &str| {
            stderr.handle_process_data(key, ProcessDataType::Stderr, data)
        })),
        ..Default::default()
    };

    let process = runner.run(spec)?;
    let id = process.id();
    if let Err(e) = tracker.track_process(key, process.clone()) {
        let _ = process.kill();
        return Err(e);
    }
    tracing::info!(%key, pid = id, "started process");
    Ok(CreateProcessResult { id })
}

fn tracked(tracker: &ProcessTracker, key: Uuid) -> Result<Arc<dyn Process>> {
    tracker
        .process_by_key(key)
        .ok_or(Error::ProcessNotTracked(key))
}

fn wait_for_exit(
    tracker: &ProcessTracker,
    params: WaitForProcessExitParams,
) -> Result<WaitForProcessExitResult> {
    let process = tracked(tracker, params.key)?;
    let exited = process.wait_for_exit(params.timeout_ms.map(Duration::from_millis))?;
    if !exited {
        return Ok(WaitForProcessExitResult {
            exited: false,
            exit_code: 0,
        });
    }
    let exit_code = process.exit_code()?;
    tracker.remove_process(params.key);
    Ok(WaitForProcessExitResult {
        exited: true,
        exit_code,
    })
}

/// Request exit, then kill once `grace` runs out
fn stop_gracefully(process: &dyn Process, grace: Duration) -> Result<()> {
    if !grace.is_zero() {
        if let Err(e) = process.request_exit() {
            tracing::debug!(pid = process.id(), error = %e, "exit request failed");
        }
        if process.wait_for_exit(Some(grace))? {
            return Ok(());
        }
    }
    process.kill()
}

fn stop_process(tracker: &ProcessTracker, params: StopProcessParams) -> Result<()> {
    let process = tracked(tracker, params.key)?;
    stop_gracefully(process.as_ref(), Duration::from_millis(params.timeout_ms))
}

fn stop_all_processes(tracker: &ProcessTracker, params: StopAllProcessesParams) -> Result<()> {
    let grace = Duration::from_millis(params.timeout_ms);
    let children = tracker.all_child_processes()?;
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = children
            .iter()
            .map(|child| scope.spawn(move || stop_gracefully(child.as_ref(), grace)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Messaging("stop thread panicked".into())))
            })
            .collect()
    });
    results.into_iter().collect()
}

fn find_process_by_id(
    tracker: &ProcessTracker,
    params: FindProcessByIdParams,
) -> Option<FindProcessByIdResult> {
    tracker
        .process_by_id(params.id)
        .map(|(process_key, process)| FindProcessByIdResult {
            process_key,
            id: process.id(),
            environment: process.environment(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tracker::MockEventPublisher;
    use crate::messaging::jsonrpc::JsonRpcOutcome;
    use crate::messaging::RpcMethod;
    use crate::process::MockProcessRunner;
    use crate::testing::FakeProcess;
    use serde_json::{json, Value};

    fn server_with(runner: MockProcessRunner) -> Arc<HostServer> {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().returning(|_, _| Ok(()));
        let tracker = Arc::new(ProcessTracker::new(Arc::new(publisher), None));
        HostServer::new(tracker, Arc::new(runner))
    }

    fn call<M: RpcMethod>(server: &HostServer, params: Value) -> crate::Result<Value> {
        server
            .dispatcher()
            .dispatch(json!({"jsonrpc": "2.0", "id": "1", "method": M::NAME, "params": params}))
            .into_result()
    }

    #[test]
    fn create_process_tracks_under_key() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.executable_path == "app.exe" && spec.output_callback.is_some())
            .times(1)
            .returning(|_| Ok(FakeProcess::new(77) as Arc<dyn Process>));
        let server = server_with(runner);
        let key = Uuid::new_v4();

        let result = call::<CreateProcess>(
            &server,
            json!({"key": key, "executablePath": "app.exe", "arguments": ["-v"]}),
        )
        .unwrap();
        assert_eq!(result, json!({"id": 77}));
        assert_eq!(server.tracker().process_by_key(key).unwrap().id(), 77);

        // A second launch under the same key never reaches the runner
        let err = call::<CreateProcess>(&server, json!({"key": key, "executablePath": "app.exe"}))
            .unwrap_err();
        assert!(err.to_string().contains("already being tracked"));
    }

    #[test]
    fn wait_reports_exit_and_untracks() {
        let server = server_with(MockProcessRunner::new());
        let key = Uuid::new_v4();
        let process = FakeProcess::new(5);
        server.tracker().track_process(key, process.clone()).unwrap();

        let pending = call::<WaitForProcessExit>(&server, json!({"key": key, "timeoutMs": 10})).unwrap();
        assert_eq!(pending, json!({"exited": false, "exitCode": 0}));

        process.exit_with(10);
        let done = call::<WaitForProcessExit>(&server, json!({"key": key})).unwrap();
        assert_eq!(done, json!({"exited": true, "exitCode": 10}));
        assert!(server.tracker().process_by_key(key).is_none());

        let unknown = call::<WaitForProcessExit>(&server, json!({"key": key})).unwrap_err();
        assert!(unknown.to_string().contains("not being tracked"));
    }

    #[test]
    fn stop_with_zero_grace_kills_immediately() {
        let server = server_with(MockProcessRunner::new());
        let key = Uuid::new_v4();
        let process = FakeProcess::new(6);
        server.tracker().track_process(key, process.clone()).unwrap();

        call::<StopProcess>(&server, json!({"key": key, "timeoutMs": 0})).unwrap();
        assert_eq!(process.kill_count(), 1);
        assert_eq!(process.exit_requests(), 0);
    }

    #[test]
    fn stop_all_requests_exit_then_kills_stragglers() {
        let server = server_with(MockProcessRunner::new());
        let polite = FakeProcess::new(7);
        polite.exit_on_request(true);
        let stubborn = FakeProcess::new(8);
        server.tracker().track_process(Uuid::new_v4(), polite.clone()).unwrap();
        server.tracker().track_process(Uuid::new_v4(), stubborn.clone()).unwrap();

        call::<StopAllProcesses>(&server, json!({"timeoutMs": 20})).unwrap();
        assert_eq!((polite.exit_requests(), polite.kill_count()), (1, 0));
        assert_eq!((stubborn.exit_requests(), stubborn.kill_count()), (1, 1));
    }

    #[test]
    fn find_process_by_id_returns_key_or_null() {
        let server = server_with(MockProcessRunner::new());
        let key = Uuid::new_v4();
        server.tracker().track_process(key, FakeProcess::new(9)).unwrap();

        let found = call::<FindProcessById>(&server, json!({"id": 9})).unwrap();
        assert_eq!(found["processKey"], json!(key));
        assert_eq!(found["id"], 9);
        assert_eq!(call::<FindProcessById>(&server, json!({"id": 10})).unwrap(), Value::Null);
    }

    #[test]
    fn ping_answers_null() {
        let server = server_with(MockProcessRunner::new());
        let response = server
            .dispatcher()
            .dispatch(json!({"jsonrpc": "2.0", "id": "p", "method": "container.ping"}));
        assert!(matches!(response.outcome, JsonRpcOutcome::Result { result: Value::Null }));
    }
}
