use std::collections::VecDeque;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::blocks::BlockAccumulator;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event::{self, RawEvent};
use crate::frame::FrameDecoder;
use crate::heartbeat::HeartbeatScheduler;
use crate::launch::{LaunchSpec, StreamRequest};
use crate::lifecycle::{CloseReason, Lifecycle, LifecycleState};
use crate::session::{SessionCorrelator, SessionHandle};
use crate::wire::{OutwardChunk, Usage, WireFormat};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const STDERR_TAIL_LINES: usize = 20;
const PREVIEW_BYTES: usize = 200;

type StreamItem = Result<OutwardChunk, BridgeError>;

/// Requests that an invocation stop. Cheap to clone; only the first call
/// has any effect.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    claimed: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that actually requested cancellation.
    pub fn cancel(&self) -> bool {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled, immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Consumer side of one invocation: the ordered chunk stream plus accessors
/// that stay valid after the stream settles.
#[derive(Debug)]
pub struct BridgeStream {
    receiver: ReceiverStream<StreamItem>,
    session: SessionHandle,
    cancel: CancelHandle,
    lifecycle: Arc<Lifecycle>,
    format: WireFormat,
}

impl BridgeStream {
    /// Provider session id captured so far, `None` if the agent never
    /// reported one.
    pub fn session_id(&self) -> Option<String> {
        self.session.get()
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn wire_format(&self) -> WireFormat {
        self.format
    }

    /// Encodes every chunk with the configured [`WireFormat`].
    pub fn into_bytes(self) -> impl Stream<Item = Result<Bytes, BridgeError>> + Send + 'static {
        let format = self.format;
        self.map(move |item| item.map(|chunk| format.encode(&chunk)))
    }
}

impl Stream for BridgeStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            this.receiver.close();
            return Poll::Ready(None);
        }
        Pin::new(&mut this.receiver).poll_next(cx)
    }
}

enum Outcome {
    Completed,
    Failed(BridgeError),
    Cancelled,
    ConsumerGone,
}

impl Outcome {
    fn reason(&self) -> CloseReason {
        match self {
            Self::Completed => CloseReason::Completed,
            Self::Failed(_) => CloseReason::Failed,
            Self::Cancelled => CloseReason::Cancelled,
            Self::ConsumerGone => CloseReason::ConsumerGone,
        }
    }
}

/// `Err` ends the invocation with the carried outcome.
type Step = Result<(), Outcome>;

/// Per-invocation state, owned by the task that drives the subprocess.
pub struct BridgeSession {
    config: Arc<BridgeConfig>,
    decoder: FrameDecoder,
    blocks: BlockAccumulator,
    correlator: SessionCorrelator,
    heartbeat: HeartbeatScheduler,
    lifecycle: Arc<Lifecycle>,
    cancel: CancelHandle,
    sender: mpsc::Sender<StreamItem>,
    stderr_tail: VecDeque<String>,
    started_at: Instant,
    pid: u32,
    stdout_lines: u64,
    stderr_lines: u64,
}

impl BridgeSession {
    /// Spawns the agent for `request` and starts streaming its output.
    ///
    /// Launch and spawn failures are returned here, before any chunk exists.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Arc<BridgeConfig>,
        request: &StreamRequest,
    ) -> Result<BridgeStream, BridgeError> {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.advance(LifecycleState::Idle, LifecycleState::Spawning);

        let fail = |err: BridgeError| {
            lifecycle.close(CloseReason::Failed);
            err
        };

        let launch = LaunchSpec::for_request(&config, request).map_err(|err| fail(err.into()))?;
        let mut command = launch.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            program = ?launch.program,
            args = ?launch.args,
            cwd = ?launch.cwd,
            resume = request.resume_session().is_some(),
            "spawning agent process"
        );

        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            tracing::error!(
                program = ?launch.program,
                error = %source,
                "failed to spawn agent process"
            );
            fail(BridgeError::Spawn {
                command: launch.display(),
                source,
            })
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(
            pid,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| fail(BridgeError::MissingStdout))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| fail(BridgeError::MissingStderr))?;

        lifecycle.advance(LifecycleState::Spawning, LifecycleState::Streaming);

        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let cancel = CancelHandle::new();
        let correlator = SessionCorrelator::new();
        let session = correlator.handle();
        let format = config.wire_format;

        let bridge = BridgeSession {
            heartbeat: HeartbeatScheduler::new(config.heartbeat_interval, started_at),
            config,
            decoder: FrameDecoder::new(),
            blocks: BlockAccumulator::new(),
            correlator,
            lifecycle: lifecycle.clone(),
            cancel: cancel.clone(),
            sender,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            started_at,
            pid,
            stdout_lines: 0,
            stderr_lines: 0,
        };
        tokio::spawn(bridge.run(child, stdout, stderr));

        Ok(BridgeStream {
            receiver: ReceiverStream::new(receiver),
            session,
            cancel,
            lifecycle,
            format,
        })
    }

    async fn run(mut self, mut child: Child, mut stdout: ChildStdout, stderr: ChildStderr) {
        let mut stderr = BufReader::new(stderr);
        let mut stderr_line: Vec<u8> = Vec::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let tick = self.config.heartbeat_tick;
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cancel = self.cancel.clone();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut exit_status: Option<ExitStatus> = None;
        let mut drain_deadline: Option<Instant> = None;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            if let (Some(status), false, false) = (exit_status, stdout_open, stderr_open) {
                break self.on_exit(status).await;
            }

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Outcome::Cancelled),
                _ = self.sender.closed() => Err(Outcome::ConsumerGone),
                read = stdout.read(&mut buffer), if stdout_open => match read {
                    Ok(0) => {
                        tracing::debug!(
                            pid = self.pid,
                            total_lines = self.stdout_lines,
                            "agent stdout: stream ended"
                        );
                        stdout_open = false;
                        Ok(())
                    }
                    Ok(n) => self.on_stdout(&buffer[..n]).await,
                    Err(err) => Err(Outcome::Failed(BridgeError::Io(err))),
                },
                // Partial reads stay in `stderr_line` until the newline arrives.
                read = stderr.read_until(b'\n', &mut stderr_line), if stderr_open => match read {
                    Ok(0) => {
                        stderr_open = false;
                        self.on_stderr_bytes(&mut stderr_line)
                    }
                    Ok(_) => self.on_stderr_bytes(&mut stderr_line),
                    Err(err) => {
                        tracing::warn!(pid = self.pid, error = %err, "agent stderr: read failed");
                        stderr_open = false;
                        Ok(())
                    }
                },
                status = child.wait(), if exit_status.is_none() => match status {
                    Ok(status) => {
                        tracing::debug!(
                            pid = self.pid,
                            code = status.code(),
                            age_ms = self.started_at.elapsed().as_millis() as u64,
                            "agent process exited"
                        );
                        exit_status = Some(status);
                        drain_deadline = Some(Instant::now() + self.config.kill_grace);
                        Ok(())
                    }
                    Err(err) => Err(Outcome::Failed(BridgeError::Io(err))),
                },
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() && (stdout_open || stderr_open) =>
                {
                    tracing::warn!(
                        pid = self.pid,
                        stdout_open,
                        stderr_open,
                        "agent output still open after exit, abandoning it"
                    );
                    stdout_open = false;
                    stderr_open = false;
                    Ok(())
                }
                _ = ticker.tick() => self.on_tick().await,
            };

            if let Err(outcome) = step {
                break outcome;
            }
        };

        drop(ticker);
        self.teardown(outcome, child).await;
    }

    async fn on_stdout(&mut self, chunk: &[u8]) -> Step {
        let lines: Vec<Vec<u8>> = self.decoder.push(chunk).collect();
        for line in lines {
            self.on_line(&line).await?;
        }
        Ok(())
    }

    async fn on_line(&mut self, line: &[u8]) -> Step {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        self.stdout_lines += 1;
        if self.stdout_lines == 1 {
            tracing::info!(
                pid = self.pid,
                first_stdout_ms = self.started_at.elapsed().as_millis() as u64,
                line_bytes = line.len(),
                "agent process: first stdout line received"
            );
        }

        let event = match event::classify(line) {
            Ok(event) => event,
            Err(err) if err.is_fatal() => {
                tracing::error!(
                    error = %err,
                    line_number = self.stdout_lines,
                    "agent stdout: unreadable terminal event"
                );
                return Err(Outcome::Failed(err.into()));
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    line_number = self.stdout_lines,
                    raw = %preview(line),
                    "agent stdout: skipping unreadable line"
                );
                return Ok(());
            }
        };

        self.correlator.observe(event.session_id());

        match event {
            RawEvent::Init { .. } => {
                tracing::debug!(pid = self.pid, "agent session initialized");
                Ok(())
            }
            RawEvent::Assistant { content } => {
                let chunks = self.blocks.on_message(content);
                self.emit_all(chunks).await
            }
            RawEvent::MessageStart | RawEvent::MessageStop => {
                self.blocks.reset_turn();
                Ok(())
            }
            RawEvent::BlockStart { index, block } => {
                let chunks = self.blocks.on_block_start(index, block);
                self.emit_all(chunks).await
            }
            RawEvent::BlockDelta { index, delta } => {
                let chunks = self.blocks.on_block_delta(index, delta);
                self.emit_all(chunks).await
            }
            RawEvent::BlockStop { index } => {
                let chunks = self.blocks.on_block_stop(index);
                self.emit_all(chunks).await
            }
            RawEvent::Result(result) => {
                if let Some(message) = result.failure() {
                    return Err(Outcome::Failed(BridgeError::Agent { message }));
                }
                let done = OutwardChunk::Done {
                    session_id: self.correlator.current(),
                    usage: Usage::from_result(&result),
                };
                self.emit(done).await?;
                Err(Outcome::Completed)
            }
            RawEvent::Error { message } => Err(Outcome::Failed(BridgeError::Agent { message })),
            RawEvent::Unknown { kind, .. } => {
                tracing::trace!(kind = %kind, "agent stdout: ignoring event");
                Ok(())
            }
        }
    }

    /// Takes one raw stderr line out of `buffer`. The agent's stderr is not
    /// guaranteed to be UTF-8, so it is decoded lossily.
    fn on_stderr_bytes(&mut self, buffer: &mut Vec<u8>) -> Step {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut raw = buffer.as_slice();
        while let [rest @ .., b'\n' | b'\r'] = raw {
            raw = rest;
        }
        let line = String::from_utf8_lossy(raw).into_owned();
        buffer.clear();
        self.on_stderr(line)
    }

    fn on_stderr(&mut self, line: String) -> Step {
        self.stderr_lines += 1;
        tracing::info!(
            pid = self.pid,
            line_number = self.stderr_lines,
            age_ms = self.started_at.elapsed().as_millis() as u64,
            "agent stderr: {}",
            line
        );

        if self.config.is_fatal_stderr(&line) {
            return Err(Outcome::Failed(BridgeError::FatalStderr { line }));
        }

        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
        Ok(())
    }

    async fn on_tick(&mut self) -> Step {
        if self.heartbeat.poll(Instant::now()) {
            tracing::trace!(pid = self.pid, "emitting heartbeat");
            self.emit(OutwardChunk::Heartbeat).await?;
        }
        Ok(())
    }

    async fn on_exit(&mut self, status: ExitStatus) -> Outcome {
        if let Err(err) = std::mem::take(&mut self.decoder).finish() {
            return Outcome::Failed(err.into());
        }

        if !status.success() {
            return Outcome::Failed(BridgeError::ProcessExited {
                code: status.code(),
                stderr: self.stderr_excerpt(),
            });
        }

        tracing::warn!(pid = self.pid, "agent exited cleanly without a result event");
        let done = OutwardChunk::Done {
            session_id: self.correlator.current(),
            usage: Usage::default(),
        };
        match self.emit(done).await {
            Ok(()) => Outcome::Completed,
            Err(outcome) => outcome,
        }
    }

    async fn emit_all(&mut self, chunks: Vec<OutwardChunk>) -> Step {
        for chunk in chunks {
            self.emit(chunk).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, chunk: OutwardChunk) -> Step {
        if chunk.is_real() {
            self.heartbeat.record_activity(Instant::now());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Outcome::Cancelled),
            sent = self.sender.send(Ok(chunk)) => sent.map_err(|_| Outcome::ConsumerGone),
        }
    }

    fn stderr_excerpt(&self) -> Option<String> {
        if self.stderr_tail.is_empty() {
            None
        } else {
            Some(self.stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }

    /// The one place an invocation ends. The lifecycle guard makes repeated
    /// or racing triggers no-ops.
    async fn teardown(mut self, outcome: Outcome, mut child: Child) {
        let reason = outcome.reason();
        if !self.lifecycle.close(reason) {
            return;
        }

        let discarded = self.blocks.reset_turn();
        let age_ms = self.started_at.elapsed().as_millis() as u64;
        let grace = self.config.kill_grace;

        match outcome {
            Outcome::Completed => {
                // The reader already has `done`; release it before reaping.
                drop(self.sender);
                tracing::info!(pid = self.pid, age_ms, %reason, "agent stream closed");
                terminate(&mut child, self.pid, grace, Some(grace)).await;
            }
            Outcome::Failed(err) => {
                terminate(&mut child, self.pid, grace, None).await;
                tracing::warn!(
                    pid = self.pid,
                    age_ms,
                    discarded_blocks = discarded,
                    error = %err,
                    "agent stream failed"
                );
                if !self.cancel.is_cancelled() {
                    tokio::select! {
                        _ = self.sender.send(Err(err)) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                drop(self.sender);
            }
            Outcome::Cancelled | Outcome::ConsumerGone => {
                drop(self.sender);
                terminate(&mut child, self.pid, grace, None).await;
                tracing::info!(
                    pid = self.pid,
                    age_ms,
                    discarded_blocks = discarded,
                    %reason,
                    "agent stream closed"
                );
            }
        }
    }
}

/// Stops the child if it is still running: optionally wait for a natural
/// exit, then SIGTERM, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, pid: u32, grace: Duration, natural_exit: Option<Duration>) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    if let Some(wait) = natural_exit {
        if tokio::time::timeout(wait, child.wait()).await.is_ok() {
            return;
        }
    }

    tracing::debug!(pid, "terminating agent process");
    send_terminate(child);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(
            pid,
            grace_ms = grace.as_millis() as u64,
            "agent process ignored termination, killing"
        );
        if let Err(err) = child.kill().await {
            tracing::error!(pid, error = %err, "failed to kill agent process");
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if result != 0 {
                tracing::debug!(pid, "SIGTERM delivery failed");
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn preview(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.len() > PREVIEW_BYTES {
        let mut end = PREVIEW_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.into_owned()
    }
}
