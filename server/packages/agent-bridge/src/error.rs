use agent_bridge_error::BridgeProblem;
use thiserror::Error;

use crate::event::ClassifyError;
use crate::frame::FrameError;
use crate::launch::LaunchError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("failed to spawn subprocess `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("agent process exited with {}", exit_label(.code))]
    ProcessExited {
        code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("agent reported a fatal condition on stderr: {line}")]
    FatalStderr { line: String },
    #[error("agent error: {message}")]
    Agent { message: String },
    #[error("agent output was truncated mid-line ({bytes} bytes pending)")]
    TruncatedOutput { bytes: usize },
    #[error("unreadable `{kind}` event: {message}")]
    Protocol { kind: String, message: String },
    #[error("failed reading agent output: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for BridgeError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Truncated { bytes } => Self::TruncatedOutput { bytes },
        }
    }
}

impl From<ClassifyError> for BridgeError {
    fn from(value: ClassifyError) -> Self {
        match value {
            ClassifyError::Protocol { kind, source } => Self::Protocol {
                kind,
                message: source.to_string(),
            },
            other => Self::Protocol {
                kind: "unknown".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl BridgeError {
    pub fn to_problem(&self) -> BridgeProblem {
        match self {
            Self::Launch(err) => BridgeProblem::InvalidRequest {
                message: err.to_string(),
            },
            Self::Spawn { command, source } => BridgeProblem::SpawnFailed {
                command: command.clone(),
                stderr: Some(source.to_string()),
            },
            Self::MissingStdout | Self::MissingStderr => BridgeProblem::SpawnFailed {
                command: String::new(),
                stderr: Some(self.to_string()),
            },
            Self::ProcessExited { code, stderr } => BridgeProblem::AgentProcessExited {
                exit_code: *code,
                stderr: stderr.clone(),
            },
            Self::FatalStderr { line } => BridgeProblem::AgentError {
                message: line.clone(),
            },
            Self::Agent { message } => BridgeProblem::AgentError {
                message: message.clone(),
            },
            Self::TruncatedOutput { .. } | Self::Protocol { .. } | Self::Io(_) => {
                BridgeProblem::StreamError {
                    message: self.to_string(),
                }
            }
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}
