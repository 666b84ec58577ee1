#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_bridge::{
    BridgeConfig, BridgeError, BridgeStream, OutwardChunk, Role, StreamRequest, Turn,
};
use futures::StreamExt;
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// A shell script standing in for the agent CLI.
pub struct FakeAgent {
    pub dir: TempDir,
    pub bin: PathBuf,
}

impl FakeAgent {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("fake-claude");
        {
            let mut file = fs::File::create(&bin).expect("create script");
            write!(file, "#!/bin/sh\n{body}\n").expect("write script");
            file.sync_all().expect("sync script");
        }
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).expect("chmod script");
        Self { dir, bin }
    }

    /// Script that prints `lines` verbatim, one per line, then exits 0.
    pub fn printing(lines: &[&str]) -> Self {
        Self::new(&format!("cat <<'EOF'\n{}\nEOF", lines.join("\n")))
    }

    pub fn config(&self) -> BridgeConfig {
        BridgeConfig {
            claude_bin: self.bin.clone(),
            kill_grace: Duration::from_millis(200),
            ..BridgeConfig::default()
        }
    }

    pub fn start(&self, prompt: &str) -> BridgeStream {
        agent_bridge::BridgeSession::start(Arc::new(self.config()), &request(prompt))
            .expect("start bridge")
    }
}

pub fn request(prompt: &str) -> StreamRequest {
    StreamRequest {
        messages: vec![Turn {
            role: Role::User,
            content: prompt.to_string(),
        }],
        ..StreamRequest::default()
    }
}

pub async fn collect(stream: BridgeStream) -> Vec<Result<OutwardChunk, BridgeError>> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream finished in time")
}

pub fn chunks(items: Vec<Result<OutwardChunk, BridgeError>>) -> Vec<OutwardChunk> {
    items
        .into_iter()
        .map(|item| item.expect("chunk"))
        .collect()
}

pub const INIT_S1: &str = r#"{"type":"system","subtype":"init","session_id":"s1","tools":[]}"#;
pub const MESSAGE_START: &str =
    r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m1"}}}"#;
pub const MESSAGE_STOP: &str = r#"{"type":"stream_event","event":{"type":"message_stop"}}"#;
pub const RESULT_S1: &str = r#"{"type":"result","subtype":"success","is_error":false,"session_id":"s1","result":"hello","usage":{"input_tokens":10,"output_tokens":5}}"#;

pub fn text_block(index: u32, text: &str) -> Vec<String> {
    vec![
        format!(
            r#"{{"type":"stream_event","event":{{"type":"content_block_start","index":{index},"content_block":{{"type":"text","text":""}}}}}}"#
        ),
        format!(
            r#"{{"type":"stream_event","event":{{"type":"content_block_delta","index":{index},"delta":{{"type":"text_delta","text":"{text}"}}}}}}"#
        ),
        format!(
            r#"{{"type":"stream_event","event":{{"type":"content_block_stop","index":{index}}}}}"#
        ),
    ]
}

/// Layer that records the message of every event, so tests can count how
/// often a given log line fired.
#[derive(Clone, Default)]
pub struct EventLog {
    messages: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn count(&self, message: &str) -> usize {
        self.messages
            .lock()
            .expect("event log")
            .iter()
            .filter(|seen| seen.as_str() == message)
            .count()
    }
}

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.messages.lock().expect("event log").push(message);
        }
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}
