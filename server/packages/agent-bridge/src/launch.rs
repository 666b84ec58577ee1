use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BridgeConfig;

/// Credential variable cleared from the child so the CLI uses its own cached
/// login instead of API billing.
pub const CLEARED_AUTH_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub messages: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<StreamSettings>,
    /// Provider session to resume instead of starting a new conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_dirs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PermissionMode {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions", alias = "bypass")]
    BypassPermissions,
    #[serde(rename = "plan")]
    Plan,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StreamRequest {
    /// Text of the latest user turn, which becomes the CLI prompt.
    pub fn prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
            .filter(|content| !content.trim().is_empty())
    }

    pub fn resume_session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("request has no user turn to send")]
    MissingPrompt,
    #[error("working directory does not exist: {0}")]
    WorkingDirNotFound(PathBuf),
}

/// Fully resolved subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env_remove: Vec<String>,
}

impl LaunchSpec {
    pub fn for_request(config: &BridgeConfig, request: &StreamRequest) -> Result<Self, LaunchError> {
        let prompt = request.prompt().ok_or(LaunchError::MissingPrompt)?;
        let default_settings = StreamSettings::default();
        let settings = request.settings.as_ref().unwrap_or(&default_settings);

        let cwd = settings
            .working_dir
            .clone()
            .or_else(|| config.default_working_dir.clone());
        if let Some(dir) = &cwd {
            if !dir.is_dir() {
                return Err(LaunchError::WorkingDirNotFound(dir.clone()));
            }
        }

        let mut args: Vec<OsString> = vec![
            "-p".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        if config.include_partial_messages {
            args.push("--include-partial-messages".into());
        }
        if let Some(session_id) = request.resume_session() {
            args.push("--resume".into());
            args.push(session_id.into());
        }
        if let Some(system_prompt) = non_empty(settings.system_prompt.as_deref()) {
            args.push("--append-system-prompt".into());
            args.push(system_prompt.into());
        }
        if let Some(model) = non_empty(settings.model.as_deref()) {
            args.push("--model".into());
            args.push(model.into());
        }
        if let Some(agent) = non_empty(settings.agent.as_deref()) {
            args.push("--agent".into());
            args.push(agent.into());
        }
        for dir in cwd.iter().chain(settings.additional_dirs.iter()) {
            args.push("--add-dir".into());
            args.push(dir.as_os_str().to_os_string());
        }
        if let Some(tools) = tool_list(&settings.allowed_tools) {
            args.push("--allowedTools".into());
            args.push(tools.into());
        }
        if let Some(tools) = tool_list(&settings.disallowed_tools) {
            args.push("--disallowedTools".into());
            args.push(tools.into());
        }
        if let Some(mode) = settings.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.as_str().into());
        }
        // --add-dir and the tool lists are variadic; end option parsing so
        // they cannot swallow the prompt.
        args.push("--".into());
        args.push(prompt.into());

        Ok(Self {
            program: config.claude_bin.clone(),
            args,
            cwd,
            env_remove: vec![CLEARED_AUTH_ENV.to_string()],
        })
    }

    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for key in &self.env_remove {
            command.env_remove(key);
        }
        command
    }

    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program.to_string_lossy()));
        for arg in &self.args {
            parts.push(shell_quote(&arg.to_string_lossy()));
        }
        parts.join(" ")
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn tool_list(tools: &[String]) -> Option<String> {
    let names: Vec<&str> = tools
        .iter()
        .map(|tool| tool.trim())
        .filter(|tool| !tool.is_empty())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(","))
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(content: &str) -> Turn {
        Turn {
            role: Role::User,
            content: content.to_string(),
        }
    }

    fn args(spec: &LaunchSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn minimal_request_uses_stream_json_and_trailing_prompt() {
        let request = StreamRequest {
            messages: vec![user("first"), user("fix the tests")],
            ..StreamRequest::default()
        };
        let spec = LaunchSpec::for_request(&BridgeConfig::default(), &request).expect("launch");

        assert_eq!(spec.program, PathBuf::from("claude"));
        assert_eq!(
            args(&spec),
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--",
                "fix the tests"
            ]
        );
        assert_eq!(spec.env_remove, vec!["ANTHROPIC_API_KEY".to_string()]);
        assert!(spec.cwd.is_none());
    }

    #[test]
    fn settings_map_to_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request: StreamRequest = serde_json::from_value(json!({
            "messages": [
                { "role": "user", "content": "plan it" },
                { "role": "assistant", "content": "sure" },
            ],
            "sessionId": "s1",
            "settings": {
                "systemPrompt": "be brief",
                "model": "opus",
                "agent": "reviewer",
                "workingDir": dir.path(),
                "additionalDirs": ["/extra"],
                "allowedTools": ["Read", " Grep "],
                "disallowedTools": ["Bash"],
                "permissionMode": "bypass"
            }
        }))
        .expect("request json");

        let spec = LaunchSpec::for_request(&BridgeConfig::default(), &request).expect("launch");
        let dir_arg = dir.path().to_string_lossy().into_owned();
        assert_eq!(
            args(&spec),
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--resume",
                "s1",
                "--append-system-prompt",
                "be brief",
                "--model",
                "opus",
                "--agent",
                "reviewer",
                "--add-dir",
                dir_arg.as_str(),
                "--add-dir",
                "/extra",
                "--allowedTools",
                "Read,Grep",
                "--disallowedTools",
                "Bash",
                "--permission-mode",
                "bypassPermissions",
                "--",
                "plan it",
            ]
        );
        assert_eq!(spec.working_dir(), Some(dir.path()));
    }

    #[test]
    fn working_dir_alone_keeps_the_prompt_out_of_add_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = StreamRequest {
            messages: vec![user("-fix the tests")],
            settings: Some(StreamSettings {
                working_dir: Some(dir.path().to_path_buf()),
                ..StreamSettings::default()
            }),
            session_id: None,
        };

        let spec = LaunchSpec::for_request(&BridgeConfig::default(), &request).expect("launch");
        let args = args(&spec);
        let dir_arg = dir.path().to_string_lossy().into_owned();
        assert_eq!(
            &args[args.len() - 4..],
            &["--add-dir", dir_arg.as_str(), "--", "-fix the tests"]
        );
    }

    #[test]
    fn request_without_user_turn_is_rejected() {
        let request = StreamRequest {
            messages: vec![Turn {
                role: Role::Assistant,
                content: "hi".to_string(),
            }],
            ..StreamRequest::default()
        };
        assert!(matches!(
            LaunchSpec::for_request(&BridgeConfig::default(), &request),
            Err(LaunchError::MissingPrompt)
        ));
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let request = StreamRequest {
            messages: vec![user("hi")],
            settings: Some(StreamSettings {
                working_dir: Some(PathBuf::from("/definitely/not/here")),
                ..StreamSettings::default()
            }),
            session_id: None,
        };
        assert!(matches!(
            LaunchSpec::for_request(&BridgeConfig::default(), &request),
            Err(LaunchError::WorkingDirNotFound(_))
        ));
    }

    #[test]
    fn display_quotes_arguments() {
        let request = StreamRequest {
            messages: vec![user("it's done")],
            ..StreamRequest::default()
        };
        let config = BridgeConfig {
            include_partial_messages: false,
            ..BridgeConfig::default()
        };
        let spec = LaunchSpec::for_request(&config, &request).expect("launch");
        assert_eq!(
            spec.display(),
            r#"'claude' '-p' '--output-format' 'stream-json' '--verbose' '--' 'it'\''s done'"#
        );
    }
}
