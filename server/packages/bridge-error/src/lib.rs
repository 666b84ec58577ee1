use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedMediaType,
    SpawnFailed,
    AgentProcessExited,
    AgentError,
    StreamError,
    StreamNotFound,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-bridge:error:invalid_request",
            Self::UnsupportedMediaType => "urn:agent-bridge:error:unsupported_media_type",
            Self::SpawnFailed => "urn:agent-bridge:error:spawn_failed",
            Self::AgentProcessExited => "urn:agent-bridge:error:agent_process_exited",
            Self::AgentError => "urn:agent-bridge:error:agent_error",
            Self::StreamError => "urn:agent-bridge:error:stream_error",
            Self::StreamNotFound => "urn:agent-bridge:error:stream_not_found",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::SpawnFailed => "Spawn Failed",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::AgentError => "Agent Error",
            Self::StreamError => "Stream Error",
            Self::StreamNotFound => "Stream Not Found",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedMediaType => 415,
            Self::SpawnFailed => 502,
            Self::AgentProcessExited => 502,
            Self::AgentError => 502,
            Self::StreamError => 502,
            Self::StreamNotFound => 404,
        }
    }
}

/// RFC 7807 problem document returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeProblem {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("failed to start agent process `{command}`")]
    SpawnFailed {
        command: String,
        stderr: Option<String>,
    },
    #[error("agent process exited")]
    AgentProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("agent reported an error: {message}")]
    AgentError { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("stream not found: {stream_id}")]
    StreamNotFound { stream_id: String },
}

impl BridgeProblem {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::AgentError { .. } => ErrorType::AgentError,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::StreamNotFound { .. } => ErrorType::StreamNotFound,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::SpawnFailed { command, stderr } => {
                map.insert("command".to_string(), Value::String(command.clone()));
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::AgentProcessExited { exit_code, stderr } => {
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::StreamNotFound { stream_id } => {
                map.insert("streamId".to_string(), Value::String(stream_id.clone()));
            }
            Self::InvalidRequest { .. }
            | Self::UnsupportedMediaType { .. }
            | Self::AgentError { .. }
            | Self::StreamError { .. } => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<BridgeProblem> for ProblemDetails {
    fn from(value: BridgeProblem) -> Self {
        value.to_problem_details()
    }
}

impl From<&BridgeProblem> for ProblemDetails {
    fn from(value: &BridgeProblem) -> Self {
        value.to_problem_details()
    }
}
