use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use futures::{Stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::launch::{Role, StreamRequest, StreamSettings, Turn};
use crate::process::{BridgeSession, CancelHandle};
use crate::wire::{HybridReader, OutwardChunk, Segment, WireFormat};
use crate::{run_server, ServerConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7592;

#[derive(Parser, Debug)]
#[command(name = "agent-bridge", bin_name = "agent-bridge")]
#[command(about = "Stream a coding-agent CLI as text and tool events", version)]
#[command(arg_required_else_help = true)]
pub struct AgentBridgeCli {
    #[command(subcommand)]
    command: Command,

    /// Agent executable, overriding AGENT_BRIDGE_CLAUDE_BIN.
    #[arg(long, global = true)]
    claude_bin: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    wire_format: Option<WireFormat>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve streams over HTTP.
    Serve(ServeArgs),
    /// Run one prompt and write the stream to stdout.
    Run(RunArgs),
    /// Print JSON schemas for the request and chunk types.
    Schema,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    prompt: String,

    /// Provider session id to continue.
    #[arg(long)]
    resume: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Print one decoded segment per line instead of raw wire bytes.
    #[arg(long)]
    events: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_bridge() -> Result<(), CliError> {
    let cli = AgentBridgeCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }

    let mut config = BridgeConfig::from_env();
    if let Some(bin) = cli.claude_bin {
        config.claude_bin = bin;
    }
    if let Some(format) = cli.wire_format {
        config.wire_format = format;
    }
    run_command(&cli.command, config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, config: BridgeConfig) -> Result<(), CliError> {
    match command {
        Command::Serve(args) => serve(args, config),
        Command::Run(args) => run_prompt(args, config),
        Command::Schema => print_schema(),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn serve(args: &ServeArgs, config: BridgeConfig) -> Result<(), CliError> {
    let server = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        bridge: config,
    };
    build_runtime()?.block_on(async move {
        run_server(server)
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_prompt(args: &RunArgs, mut config: BridgeConfig) -> Result<(), CliError> {
    if args.events {
        // Events are recovered from the hybrid encoding, the same way a
        // streaming client would read them.
        config.wire_format = WireFormat::Hybrid;
    }
    let request = StreamRequest {
        messages: vec![Turn {
            role: Role::User,
            content: args.prompt.clone(),
        }],
        settings: Some(StreamSettings {
            model: args.model.clone(),
            working_dir: args.cwd.clone(),
            ..StreamSettings::default()
        }),
        session_id: args.resume.clone(),
    };
    let events = args.events;

    build_runtime()?.block_on(async move {
        let stream = BridgeSession::start(Arc::new(config), &request)?;
        let session = stream.session_handle();
        let cancel = stream.cancel_handle();
        let mut reader = HybridReader::new();

        pump(stream.into_bytes(), tokio::signal::ctrl_c(), &cancel, |chunk| {
            if events {
                for segment in reader.push(&chunk) {
                    write_segment(&segment)?;
                }
                Ok(())
            } else {
                write_stdout(&chunk)
            }
        })
        .await?;
        if let Some(segment) = reader.finish() {
            write_segment(&segment)?;
        }

        if let Some(session_id) = session.get() {
            write_stderr_line(&format!("session: {session_id}"))?;
        }
        Ok::<(), CliError>(())
    })
}

/// Feeds `bytes` to `sink` until the stream ends or `interrupt` resolves,
/// which cancels the run. `interrupt` is created once so a signal that lands
/// between chunks is still seen.
async fn pump<S, I, F>(
    bytes: S,
    interrupt: I,
    cancel: &CancelHandle,
    mut sink: F,
) -> Result<(), CliError>
where
    S: Stream<Item = Result<Bytes, BridgeError>>,
    I: Future,
    F: FnMut(Bytes) -> Result<(), CliError>,
{
    tokio::pin!(bytes);
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            item = bytes.next() => match item {
                Some(chunk) => sink(chunk?)?,
                None => return Ok(()),
            },
            _ = &mut interrupt => {
                cancel.cancel();
                tracing::info!("interrupted, stopping agent");
                return Ok(());
            }
        }
    }
}

fn write_segment(segment: &Segment) -> Result<(), CliError> {
    let line = match segment {
        Segment::Prose(text) => serde_json::to_string(&json!({ "type": "prose", "text": text }))?,
        Segment::Event(chunk) => serde_json::to_string(chunk)?,
    };
    write_stdout_line(&line)
}

fn print_schema() -> Result<(), CliError> {
    let schemas = json!({
        "StreamRequest": schemars::schema_for!(StreamRequest),
        "OutwardChunk": schemars::schema_for!(OutwardChunk),
    });
    write_stdout_line(&serde_json::to_string_pretty(&schemas)?)
}

fn write_stdout(bytes: &[u8]) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(bytes)?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
