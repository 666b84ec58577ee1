//! Outward wire format.
//!
//! The dashboard's existing reader consumes a plain byte stream, so the
//! default [`WireFormat::Hybrid`] writes prose as raw UTF-8 and wraps every
//! structured chunk in an [`EVENT_START`]/[`EVENT_END`] marker pair.
//! [`WireFormat::Ndjson`] writes one JSON object per line for everything.
//!
//! Prose is written unescaped. A literal start marker in prose is recovered
//! by [`HybridReader`] once the next real event arrives; until then the
//! reader holds it back.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::ResultEvent;

pub const EVENT_START: &str = "<<AGENT_EVENT>>";
pub const EVENT_END: &str = "<</AGENT_EVENT>>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutwardChunk {
    Text {
        text: String,
    },
    ToolStarted {
        index: u32,
        id: String,
        name: String,
    },
    ToolInput {
        index: u32,
        id: String,
        #[serde(rename = "partialJson")]
        partial_json: String,
    },
    ToolEnded {
        index: u32,
        id: String,
        name: String,
        /// Complete JSON-encoded tool input.
        input: String,
    },
    Heartbeat,
    Done {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        usage: Usage,
    },
}

impl OutwardChunk {
    /// Everything except heartbeats counts as activity.
    pub fn is_real(&self) -> bool {
        !matches!(self, Self::Heartbeat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

impl Usage {
    pub fn from_result(result: &ResultEvent) -> Self {
        let counters = result.usage.unwrap_or_default();
        Self {
            input_tokens: counters.input_tokens,
            output_tokens: counters.output_tokens,
            cache_read_input_tokens: counters.cache_read_input_tokens,
            cache_creation_input_tokens: counters.cache_creation_input_tokens,
            total_tokens: counters.input_tokens + counters.output_tokens,
            cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum WireFormat {
    #[default]
    Hybrid,
    Ndjson,
}

impl WireFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Hybrid => "text/plain; charset=utf-8",
            Self::Ndjson => "application/x-ndjson",
        }
    }

    pub fn encode(self, chunk: &OutwardChunk) -> Bytes {
        match (self, chunk) {
            (Self::Hybrid, OutwardChunk::Text { text }) => Bytes::from(text.clone()),
            (Self::Hybrid, chunk) => {
                // `<` only occurs inside JSON strings, so escaping it keeps the
                // end marker from ever appearing in a payload.
                let payload = to_json(chunk).replace('<', "\\u003c");
                Bytes::from(format!("{EVENT_START}{payload}{EVENT_END}"))
            }
            (Self::Ndjson, chunk) => {
                let mut line = to_json(chunk);
                line.push('\n');
                Bytes::from(line)
            }
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hybrid => "hybrid",
            Self::Ndjson => "ndjson",
        })
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "ndjson" => Ok(Self::Ndjson),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

fn to_json(chunk: &OutwardChunk) -> String {
    serde_json::to_string(chunk).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize outward chunk");
        r#"{"type":"heartbeat"}"#.to_string()
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Prose(String),
    Event(OutwardChunk),
}

/// Splits a hybrid byte stream back into prose and structured events.
#[derive(Debug, Default)]
pub struct HybridReader {
    buffer: Vec<u8>,
}

impl HybridReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.buffer.extend_from_slice(chunk);
        let mut segments = Vec::new();

        loop {
            match find(&self.buffer, EVENT_START.as_bytes()) {
                Some(start) => {
                    if start > 0 {
                        let prose: Vec<u8> = self.buffer.drain(..start).collect();
                        segments.push(Segment::Prose(String::from_utf8_lossy(&prose).into_owned()));
                    }
                    let body_start = EVENT_START.len();
                    let Some(end) = find(&self.buffer[body_start..], EVENT_END.as_bytes()) else {
                        break;
                    };
                    // Encoded payloads never contain `<`, so a start marker
                    // inside the body means the outer one was prose.
                    let body = &self.buffer[body_start..body_start + end];
                    if let Some(inner) = find(body, EVENT_START.as_bytes()) {
                        let prose: Vec<u8> = self.buffer.drain(..body_start + inner).collect();
                        segments.push(Segment::Prose(
                            String::from_utf8_lossy(&prose).into_owned(),
                        ));
                        continue;
                    }
                    let frame: Vec<u8> = self
                        .buffer
                        .drain(..body_start + end + EVENT_END.len())
                        .collect();
                    let payload = &frame[body_start..body_start + end];
                    match serde_json::from_slice::<OutwardChunk>(payload) {
                        Ok(chunk) => segments.push(Segment::Event(chunk)),
                        Err(err) => {
                            tracing::warn!(error = %err, "malformed event marker in hybrid stream");
                            segments.push(Segment::Prose(
                                String::from_utf8_lossy(&frame).into_owned(),
                            ));
                        }
                    }
                }
                None => {
                    let held = marker_prefix_len(&self.buffer);
                    let candidate = &self.buffer[..self.buffer.len() - held];
                    let ready = match std::str::from_utf8(candidate) {
                        Ok(_) => candidate.len(),
                        Err(err) if err.error_len().is_none() => err.valid_up_to(),
                        Err(_) => candidate.len(),
                    };
                    if ready > 0 {
                        let prose: Vec<u8> = self.buffer.drain(..ready).collect();
                        segments.push(Segment::Prose(String::from_utf8_lossy(&prose).into_owned()));
                    }
                    break;
                }
            }
        }

        segments
    }

    /// Flushes whatever is left once the stream has ended.
    pub fn finish(self) -> Option<Segment> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Segment::Prose(String::from_utf8_lossy(&self.buffer).into_owned()))
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest buffer suffix that could still grow into a start
/// marker.
fn marker_prefix_len(buffer: &[u8]) -> usize {
    let marker = EVENT_START.as_bytes();
    (1..marker.len().min(buffer.len() + 1))
        .rev()
        .find(|len| buffer.ends_with(&marker[..*len]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done() -> OutwardChunk {
        OutwardChunk::Done {
            session_id: Some("s1".to_string()),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                ..Usage::default()
            },
        }
    }

    #[test]
    fn hybrid_writes_text_bare() {
        let bytes = WireFormat::Hybrid.encode(&OutwardChunk::Text {
            text: "hello".to_string(),
        });
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn hybrid_wraps_structured_chunks() {
        let bytes = WireFormat::Hybrid.encode(&OutwardChunk::Heartbeat);
        assert_eq!(&bytes[..], b"<<AGENT_EVENT>>{\"type\":\"heartbeat\"}<</AGENT_EVENT>>");
    }

    #[test]
    fn done_chunk_json_shape() {
        insta::assert_json_snapshot!(done(), @r###"
        {
          "type": "done",
          "sessionId": "s1",
          "usage": {
            "inputTokens": 10,
            "outputTokens": 5,
            "cacheReadInputTokens": 0,
            "cacheCreationInputTokens": 0,
            "totalTokens": 15
          }
        }
        "###);
    }

    #[test]
    fn ndjson_writes_one_object_per_line() {
        let bytes = WireFormat::Ndjson.encode(&OutwardChunk::Text {
            text: "a\nb".to_string(),
        });
        assert_eq!(&bytes[..], b"{\"type\":\"text\",\"text\":\"a\\nb\"}\n");
    }

    #[test]
    fn payload_cannot_close_the_marker() {
        let chunk = OutwardChunk::ToolEnded {
            index: 0,
            id: "t1".to_string(),
            name: "Write".to_string(),
            input: format!("{{\"content\":\"{EVENT_END}\"}}"),
        };
        let bytes = WireFormat::Hybrid.encode(&chunk);

        let mut reader = HybridReader::new();
        assert_eq!(reader.push(&bytes), vec![Segment::Event(chunk)]);
        assert!(reader.finish().is_none());
    }

    #[test]
    fn reader_splits_prose_and_events_across_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice("héllo ".as_bytes());
        stream.extend_from_slice(&WireFormat::Hybrid.encode(&OutwardChunk::Heartbeat));
        stream.extend_from_slice(b"world");
        stream.extend_from_slice(&WireFormat::Hybrid.encode(&done()));

        for chunk_size in 1..=stream.len() {
            let mut reader = HybridReader::new();
            let mut prose = String::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                for segment in reader.push(chunk) {
                    match segment {
                        Segment::Prose(text) => prose.push_str(&text),
                        Segment::Event(event) => events.push(event),
                    }
                }
            }
            assert!(reader.finish().is_none(), "chunk size {chunk_size}");
            assert_eq!(prose, "héllo world", "chunk size {chunk_size}");
            assert_eq!(events, vec![OutwardChunk::Heartbeat, done()]);
        }
    }

    #[test]
    fn marker_text_in_prose_does_not_swallow_the_next_event() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&WireFormat::Hybrid.encode(&OutwardChunk::Text {
            text: format!("the marker is {EVENT_START} literally"),
        }));
        stream.extend_from_slice(&WireFormat::Hybrid.encode(&done()));

        let mut reader = HybridReader::new();
        let mut prose = String::new();
        let mut events = Vec::new();
        for segment in reader.push(&stream) {
            match segment {
                Segment::Prose(text) => prose.push_str(&text),
                Segment::Event(event) => events.push(event),
            }
        }
        assert!(reader.finish().is_none());
        assert_eq!(prose, format!("the marker is {EVENT_START} literally"));
        assert_eq!(events, vec![done()]);
    }

    #[test]
    fn wire_format_parses_case_insensitively() {
        assert_eq!("NDJSON".parse::<WireFormat>(), Ok(WireFormat::Ndjson));
        assert!("sse".parse::<WireFormat>().is_err());
    }
}
