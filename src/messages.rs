//! RPC methods and events spoken between a container and its host

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messaging::RpcMethod;
use crate::Error;

pub const PROCESS_DATA_TOPIC: &str = "processData";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessParams {
    pub key: Uuid,
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProcessResult {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForProcessExitParams {
    pub key: Uuid,
    /// `None` waits forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForProcessExitResult {
    pub exited: bool,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopProcessParams {
    pub key: Uuid,
    /// Grace period before the process is killed
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllProcessesParams {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindProcessByIdParams {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindProcessByIdResult {
    pub process_key: Uuid,
    pub id: u32,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessDataType {
    #[serde(rename = "STDOUT")]
    Stdout,
    #[serde(rename = "STDERR")]
    Stderr,
}

impl ProcessDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessDataType::Stdout => "STDOUT",
            ProcessDataType::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for ProcessDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessDataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STDOUT" => Ok(ProcessDataType::Stdout),
            "STDERR" => Ok(ProcessDataType::Stderr),
            other => Err(Error::InvalidArgument(format!("unknown process data type '{other}'"))),
        }
    }
}

/// A chunk of output from a process running inside the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDataEvent {
    pub key: Uuid,
    pub data_type: ProcessDataType,
    pub data: String,
}

pub struct CreateProcess;

impl RpcMethod for CreateProcess {
    const NAME: &'static str = "Container.CreateProcess";
    type Params = CreateProcessParams;
    type Result = CreateProcessResult;
}

pub struct Ping;

impl RpcMethod for Ping {
    const NAME: &'static str = "Container.Ping";
    type Params = ();
    type Result = ();
}

pub struct FindProcessById;

impl RpcMethod for FindProcessById {
    const NAME: &'static str = "Container.FindProcessById";
    type Params = FindProcessByIdParams;
    type Result = Option<FindProcessByIdResult>;
}

pub struct StopProcess;

impl RpcMethod for StopProcess {
    const NAME: &'static str = "Container.StopProcess";
    type Params = StopProcessParams;
    type Result = ();
}

pub struct StopAllProcesses;

impl RpcMethod for StopAllProcesses {
    const NAME: &'static str = "Container.StopAllProcesses";
    type Params = StopAllProcessesParams;
    type Result = ();
}

pub struct WaitForProcessExit;

impl RpcMethod for WaitForProcessExit {
    const NAME: &'static str = "Container.WaitForProcessExit";
    type Params = WaitForProcessExitParams;
    type Result = WaitForProcessExitResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_use_camel_case() {
        let key = Uuid::nil();
        let params = CreateProcessParams {
            key,
            executable_path: "cmd.exe".into(),
            arguments: vec!["/c".into()],
            environment: HashMap::new(),
            working_directory: Some(r"C:\c\user".into()),
        };
        let wire = serde_json::to_value(&params).unwrap();
        assert_eq!(wire["executablePath"], "cmd.exe");
        assert_eq!(wire["workingDirectory"], r"C:\c\user");

        let wait: WaitForProcessExitParams =
            serde_json::from_value(json!({"key": key.to_string()})).unwrap();
        assert_eq!(wait.timeout_ms, None);
    }

    #[test]
    fn process_data_event_wire_shape() {
        let event: ProcessDataEvent = serde_json::from_value(json!({
            "key": Uuid::nil().to_string(),
            "dataType": "STDERR",
            "data": "oops\n",
            "EventTopic": "processData"
        }))
        .unwrap();
        assert_eq!(event.data_type, ProcessDataType::Stderr);
        assert_eq!("STDOUT".parse::<ProcessDataType>().unwrap(), ProcessDataType::Stdout);
        assert!("stdout".parse::<ProcessDataType>().is_err());
    }
}
