//! Typed view of the agent CLI's `stream-json` output.
//!
//! Each stdout line is one JSON object discriminated by `type`. Streaming
//! block events may arrive bare or wrapped in a `stream_event` envelope; both
//! forms classify to the same [`RawEvent`].

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Init {
        session_id: Option<String>,
    },
    /// Complete assistant message snapshot.
    Assistant {
        content: Vec<ContentBlock>,
    },
    MessageStart,
    BlockStart {
        index: u32,
        block: ContentBlock,
    },
    BlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    BlockStop {
        index: u32,
    },
    /// End of one assistant message. The invocation may continue with
    /// further messages after tool use.
    MessageStop,
    Result(ResultEvent),
    Error {
        message: String,
    },
    Unknown {
        kind: String,
        raw: Value,
    },
}

impl RawEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Init { session_id } => session_id.as_deref(),
            Self::Result(result) => result.session_id.as_deref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Init { .. } => "init",
            Self::Assistant { .. } => "assistant",
            Self::MessageStart => "message_start",
            Self::BlockStart { .. } => "content_block_start",
            Self::BlockDelta { .. } => "content_block_delta",
            Self::BlockStop { .. } => "content_block_stop",
            Self::MessageStop => "message_stop",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: Option<ResultUsage>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl ResultEvent {
    /// Message describing a failed result, `None` on success.
    pub fn failure(&self) -> Option<String> {
        if !self.is_error && !matches!(self.subtype.as_deref(), Some(s) if s.starts_with("error")) {
            return None;
        }
        Some(
            self.result
                .clone()
                .filter(|text| !text.trim().is_empty())
                .or_else(|| self.subtype.clone())
                .unwrap_or_else(|| "agent reported an error result".to_string()),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResultUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid json: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("event has no `type` discriminator")]
    MissingType,
    #[error("malformed `{kind}` event: {source}")]
    Protocol {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClassifyError {
    /// Terminal events that cannot be read leave the invocation without a
    /// defined outcome, so they abort it instead of being skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { kind, .. } if kind == "result" || kind == "error")
    }
}

#[derive(Deserialize)]
struct SystemLine {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct AssistantLine {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct StreamEnvelope {
    event: Value,
}

#[derive(Deserialize)]
struct BlockStartLine {
    index: u32,
    content_block: ContentBlock,
}

#[derive(Deserialize)]
struct BlockDeltaLine {
    index: u32,
    delta: BlockDelta,
}

#[derive(Deserialize)]
struct BlockStopLine {
    index: u32,
}

#[derive(Deserialize)]
struct ErrorLine {
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

pub fn classify(line: &[u8]) -> Result<RawEvent, ClassifyError> {
    let value: Value = serde_json::from_slice(line).map_err(ClassifyError::Decode)?;
    classify_value(value)
}

pub fn classify_value(value: Value) -> Result<RawEvent, ClassifyError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ClassifyError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "stream_event" => {
            let envelope: StreamEnvelope = typed(&kind, &value)?;
            return classify_value(envelope.event);
        }
        "system" => {
            let line: SystemLine = typed(&kind, &value)?;
            if line.subtype.as_deref() != Some("init") {
                return Ok(RawEvent::Unknown { kind, raw: value });
            }
            RawEvent::Init {
                session_id: line.session_id,
            }
        }
        "assistant" => {
            let line: AssistantLine = typed(&kind, &value)?;
            RawEvent::Assistant {
                content: line.message.content,
            }
        }
        "message_start" => RawEvent::MessageStart,
        "content_block_start" => {
            let line: BlockStartLine = typed(&kind, &value)?;
            RawEvent::BlockStart {
                index: line.index,
                block: line.content_block,
            }
        }
        "content_block_delta" => {
            let line: BlockDeltaLine = typed(&kind, &value)?;
            RawEvent::BlockDelta {
                index: line.index,
                delta: line.delta,
            }
        }
        "content_block_stop" => {
            let line: BlockStopLine = typed(&kind, &value)?;
            RawEvent::BlockStop { index: line.index }
        }
        "message_stop" => RawEvent::MessageStop,
        "result" => RawEvent::Result(typed(&kind, &value)?),
        "error" => {
            let line: ErrorLine = typed(&kind, &value)?;
            let message = line
                .error
                .and_then(|error| error.message.or(error.kind))
                .or(line.message)
                .unwrap_or_else(|| "agent reported an unspecified error".to_string());
            RawEvent::Error { message }
        }
        _ => RawEvent::Unknown { kind, raw: value },
    };
    Ok(event)
}

fn typed<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T, ClassifyError> {
    T::deserialize(value).map_err(|source| ClassifyError::Protocol {
        kind: kind.to_string(),
        source,
    })
}
