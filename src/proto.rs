use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// Body of `POST /v1/exec`: the command to run inside the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecRequest {
    pub path: String,
    pub argv: Vec<String>,
}

/// Reply to an exec request, carrying the captured output of the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResponse {
    pub status: String,
    pub desc: String,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResponse {
    pub fn success(stdout: String, stderr: String) -> Self {
        ExecResponse {
            status: STATUS_SUCCESS.to_string(),
            desc: String::new(),
            stdout,
            stderr,
        }
    }

    pub fn failed(desc: &str) -> Self {
        ExecResponse {
            status: STATUS_FAILED.to_string(),
            desc: desc.to_string(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// One-line message the setns role writes onto the anonymous pipe once the
/// in-container child is forked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidMessage {
    pub pid: i32,
}
