//! Worker process supervisor.
//!
//! Owns one worker process at a time and presents it as a [`LintChannel`]
//! that survives restarts. Lifecycle:
//!
//! 1. `start()`: install dependencies, spawn, handshake (`"ready?"` answered
//!    by `"ready"` or `"booting"`).
//! 2. Each spawned process gets a generation number. A reader task feeds
//!    decoded frames to that generation's waiters; a monitor task waits for
//!    exit, rejects the generation's waiters with [`ChannelError::Restarted`]
//!    and marks the handle exited.
//! 3. The next request against an exited handle restarts the worker before
//!    anything is sent.
//!
//! Every lifecycle transition and the send half of each request run under
//! one FIFO lock, so concurrent restarts collapse into one.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Chunk, DEFAULT_MAX_FRAME_BYTES, FrameCodec};
use crate::bridge::protocol::{self, READY_PROBE};
use crate::channel::{ChannelError, LintChannel, Predicate, SharedPending};
use crate::config::{BridgeConfig, CommandSpec};
use crate::health::WorkerState;
use crate::progress::{Progress, ProgressReporter};

pub type WorkerInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerOutput = Box<dyn AsyncRead + Send + Unpin>;

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A freshly spawned worker: its stdin, its stdout, and a handle on its lifetime.
pub struct SpawnedWorker {
    pub input: WorkerInput,
    pub output: WorkerOutput,
    pub control: Box<dyn WorkerControl>,
}

/// Lifetime of one worker instance.
#[async_trait]
pub trait WorkerControl: Send {
    /// Wait for exit. `None` if terminated without an exit code.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the worker to stop. Follow with `wait()`.
    async fn terminate(&mut self) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to run `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} not captured")]
    MissingPipe(&'static str),
}

/// Extension point for different worker spawn strategies.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Run the dependency install step, streaming its output into `progress`.
    /// Returns the exit code.
    async fn install(&self, progress: &Progress) -> Result<Option<i32>, SpawnError>;

    fn spawn(&self) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns the worker as a child process.
pub struct CommandSpawner {
    dir: PathBuf,
    install: Option<CommandSpec>,
    worker: CommandSpec,
    grace: Duration,
}

impl CommandSpawner {
    pub fn new(dir: impl Into<PathBuf>, worker: CommandSpec) -> Self {
        Self {
            dir: dir.into(),
            install: None,
            worker,
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.worker_dir, config.worker_command.clone())
            .with_install(config.install_command.clone())
    }

    pub fn with_install(mut self, install: Option<CommandSpec>) -> Self {
        self.install = install;
        self
    }

    /// How long `terminate()` waits after SIGTERM before killing.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&self.dir)
            .kill_on_drop(true);
        cmd
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read install output");
                break;
            }
        }
    }
}

async fn log_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(target: "lintbridge::worker", stream = "stderr", "{}", line);
        }
    }
}

#[async_trait]
impl WorkerSpawner for CommandSpawner {
    async fn install(&self, progress: &Progress) -> Result<Option<i32>, SpawnError> {
        let Some(spec) = &self.install else {
            tracing::debug!("No install command configured, skipping");
            return Ok(Some(0));
        };

        tracing::info!(command = %spec, dir = %self.dir.display(), "Installing worker dependencies");
        let failed = |source: io::Error| SpawnError::Command {
            command: spec.to_string(),
            source,
        };
        let mut child = self
            .command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failed)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        while let Some(text) = rx.recv().await {
            progress.append(&text);
        }

        let status = child.wait().await.map_err(failed)?;
        tracing::info!(code = ?status.code(), "Install finished");
        Ok(status.code())
    }

    fn spawn(&self) -> Result<SpawnedWorker, SpawnError> {
        tracing::info!(command = %self.worker, dir = %self.dir.display(), "Spawning worker process");
        let mut child = self
            .command(&self.worker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Command {
                command: self.worker.to_string(),
                source,
            })?;

        let input = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let output = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        Ok(SpawnedWorker {
            input: Box::new(input),
            output: Box::new(output),
            control: Box::new(ChildControl {
                child,
                grace: self.grace,
            }),
        })
    }
}

struct ChildControl {
    child: Child,
    grace: Duration,
}

#[async_trait]
impl WorkerControl for ChildControl {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) {
                match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => {
                        if tokio::time::timeout(self.grace, self.child.wait())
                            .await
                            .is_ok()
                        {
                            return Ok(());
                        }
                        tracing::warn!(pid, "Worker ignored SIGTERM, killing");
                    }
                    Err(e) => tracing::debug!(pid, error = %e, "SIGTERM failed, killing"),
                }
            }
        }

        self.child.start_kill()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("dependency installation failed ({})", describe_exit(.0))]
    Install(Option<i32>),
    #[error("worker handshake failed: {0}")]
    Handshake(String),
    #[error("worker handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("worker has not been started")]
    NotStarted,
    #[error("supervisor has been shut down")]
    Stopped,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// State shared with the per-generation reader and monitor tasks.
struct Shared {
    pending: SharedPending,
    generation: AtomicU64,
    state: watch::Sender<WorkerState>,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Worker state changed");
        }
    }
}

struct WorkerHandle {
    generation: u64,
    writer: FramedWrite<WorkerInput, FrameCodec>,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn send(&mut self, payload: &serde_json::Value) -> io::Result<()> {
        self.writer.send(payload).await
    }

    /// Terminate the worker and wait for its monitor to finish.
    async fn stop(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if self.exited.wait_for(|exited| *exited).await.is_err() {
            tracing::debug!(generation = self.generation, "Exit monitor already gone");
        }
    }
}

/// Feed decoded frames to the generation's waiters; log everything else.
async fn read_output(
    generation: u64,
    mut reader: FramedRead<WorkerOutput, FrameCodec>,
    pending: SharedPending,
) {
    while let Some(chunk) = reader.next().await {
        match chunk {
            Ok(Chunk::Message(msg)) => {
                let matched = pending.lock().dispatch(generation, &msg);
                if matched == 0 {
                    tracing::trace!(generation, message = %msg, "No waiter for message");
                }
            }
            Ok(Chunk::Text(text)) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    tracing::debug!(target: "lintbridge::worker", generation, "{}", line);
                }
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "Worker output error");
                break;
            }
        }
    }
    tracing::debug!(generation, "Worker output closed");
}

/// Wait for the worker to exit (or be told to kill it), then reject its waiters.
async fn monitor_exit(
    generation: u64,
    mut control: Box<dyn WorkerControl>,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
    shared: Arc<Shared>,
) {
    let status = tokio::select! {
        status = control.wait() => status,
        _ = kill => {
            tracing::debug!(generation, "Terminating worker");
            if let Err(e) = control.terminate().await {
                tracing::warn!(generation, error = %e, "Failed to terminate worker");
            }
            control.wait().await
        }
    };

    match status {
        Ok(Some(0)) => tracing::info!(generation, "Worker exited"),
        Ok(Some(code)) => tracing::warn!(generation, code, "Worker exited with non-zero status"),
        Ok(None) => tracing::warn!(generation, "Worker terminated by signal"),
        Err(e) => tracing::error!(generation, error = %e, "Failed to wait for worker"),
    }

    let rejected = shared
        .pending
        .lock()
        .reject_generation(generation, &ChannelError::Restarted);
    if rejected > 0 {
        tracing::warn!(generation, rejected, "Rejected requests pending on exited worker");
    }

    if shared.generation.load(Ordering::Acquire) == generation {
        shared.state.send_if_modified(|state| {
            if matches!(*state, WorkerState::Ready | WorkerState::Booting) {
                *state = WorkerState::Exited;
                true
            } else {
                false
            }
        });
    }
    exited.send_replace(true);
}

/// Supervises the worker process and exposes it as a [`LintChannel`].
pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    progress: Progress,
    handshake_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_frame_bytes: usize,
    /// Serializes lifecycle transitions and request sends.
    worker: Mutex<Option<WorkerHandle>>,
    shared: Arc<Shared>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, reporter: Arc<dyn ProgressReporter>) -> Self {
        let (state, _) = watch::channel(WorkerState::Unknown);
        Self {
            spawner,
            progress: Progress::new(reporter),
            handshake_timeout: None,
            request_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            worker: Mutex::new(None),
            shared: Arc::new(Shared {
                pending: SharedPending::default(),
                generation: AtomicU64::new(0),
                state,
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Supervisor for a child process described by `config`.
    pub fn from_config(config: &BridgeConfig, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self::new(Arc::new(CommandSpawner::from_config(config)), reporter)
            .with_handshake_timeout(config.handshake_timeout)
            .with_request_timeout(config.request_timeout)
            .with_max_frame_bytes(config.max_frame_bytes)
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// Generation of the most recently spawned worker. 0 before the first spawn.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// The progress wrapper the supervisor reports through.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Install dependencies, spawn the worker, and complete the handshake.
    ///
    /// A non-zero install exit is fatal and not retried. Calling `start()`
    /// while a worker is live is a no-op.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.worker.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(SupervisorError::Stopped);
        }
        if slot.as_ref().is_some_and(|h| !h.has_exited()) {
            tracing::debug!("Worker already running");
            return Ok(());
        }

        let _scope = self.progress.scope();
        match self.install_and_boot().await {
            Ok(handle) => {
                *slot = Some(handle);
                self.started.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker start failed");
                self.shared.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    async fn install_and_boot(&self) -> Result<WorkerHandle, SupervisorError> {
        self.shared.set_state(WorkerState::Installing);
        self.progress.append("Installing dependencies...\n");
        let code = self.spawner.install(&self.progress).await?;
        if code != Some(0) {
            self.progress.append("\nInstallation failed\n");
            return Err(SupervisorError::Install(code));
        }
        self.boot().await
    }

    /// Restart the worker. Concurrent calls collapse into one restart.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let observed = self.generation();
        let mut slot = self.worker.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(SupervisorError::Stopped);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(SupervisorError::NotStarted);
        }
        if self.generation() != observed && slot.as_ref().is_some_and(|h| !h.has_exited()) {
            tracing::debug!(observed, current = self.generation(), "Restart already done by another caller");
            return Ok(());
        }
        self.restart_locked(&mut slot).await
    }

    async fn restart_locked(&self, slot: &mut Option<WorkerHandle>) -> Result<(), SupervisorError> {
        let _scope = self.progress.scope();
        self.progress.append("Restarting worker...\n");
        self.shared.set_state(WorkerState::Restarting);

        if let Some(old) = slot.take() {
            tracing::info!(generation = old.generation, "Stopping worker for restart");
            old.stop().await;
        }

        match self.boot().await {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker restart failed");
                self.shared.set_state(WorkerState::Failed);
                Err(e)
            }
        }
    }

    /// Spawn a worker and complete the handshake.
    async fn boot(&self) -> Result<WorkerHandle, SupervisorError> {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.set_state(WorkerState::Booting);
        self.progress.append("Starting worker...\n");

        let SpawnedWorker {
            input,
            output,
            control,
        } = self.spawner.spawn()?;
        tracing::info!(generation, "Worker spawned");

        // Registered before the reader starts so an early "booting" is not missed.
        let handshake = self
            .shared
            .pending
            .wait_for(generation, Box::new(protocol::is_handshake_reply));

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(read_output(
            generation,
            FramedRead::new(output, FrameCodec::with_max_frame_bytes(self.max_frame_bytes)),
            self.shared.pending.clone(),
        ));
        tokio::spawn(monitor_exit(
            generation,
            control,
            kill_rx,
            exited_tx,
            Arc::clone(&self.shared),
        ));

        let mut handle = WorkerHandle {
            generation,
            writer: FramedWrite::new(input, FrameCodec::new()),
            exited: exited_rx,
            kill: Some(kill_tx),
        };

        tracing::debug!(generation, "Sending handshake probe");
        if let Err(e) = handle.send(&serde_json::json!(READY_PROBE)).await {
            drop(handshake);
            handle.stop().await;
            return Err(SupervisorError::Handshake(format!("failed to send probe: {e}")));
        }

        let reply = match self.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake.recv()).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::error!(generation, ?limit, "Handshake timed out");
                    handle.stop().await;
                    return Err(SupervisorError::HandshakeTimeout(limit));
                }
            },
            None => handshake.recv().await,
        };

        match reply {
            Ok(msg) => {
                tracing::info!(generation, reply = %msg, "Worker ready");
                self.shared.set_state(WorkerState::Ready);
                Ok(handle)
            }
            Err(e) => {
                handle.stop().await;
                Err(SupervisorError::Handshake(e.to_string()))
            }
        }
    }

    /// Stop the worker and reject everything still pending. Later requests
    /// fail with [`ChannelError::Closed`].
    pub async fn shutdown(&self) {
        let mut slot = self.worker.lock().await;
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = slot.take() {
            tracing::info!(generation = handle.generation, "Shutting down worker");
            handle.stop().await;
        }
        let rejected = self.shared.pending.lock().reject_all(&ChannelError::Closed);
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending requests on shutdown");
        }
        self.shared.set_state(WorkerState::Stopped);
    }

    /// Make sure a live worker is in `slot`, restarting an exited one.
    async fn ensure_live(&self, slot: &mut Option<WorkerHandle>) -> Result<(), ChannelError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(ChannelError::NotStarted);
        }
        if slot.as_ref().is_some_and(|h| !h.has_exited()) {
            return Ok(());
        }
        tracing::info!("Worker not running, restarting before request");
        self.restart_locked(slot)
            .await
            .map_err(|e| ChannelError::Boot(e.to_string()))
    }
}

#[async_trait]
impl LintChannel for Supervisor {
    async fn request(
        &self,
        payload: serde_json::Value,
        accept: Predicate,
    ) -> Result<serde_json::Value, ChannelError> {
        let reply = {
            let mut slot = self.worker.lock().await;
            self.ensure_live(&mut slot).await?;
            let Some(handle) = slot.as_mut() else {
                return Err(ChannelError::Closed);
            };

            let reply = self.shared.pending.wait_for(handle.generation, accept);
            if let Err(e) = handle.send(&payload).await {
                tracing::warn!(generation = handle.generation, error = %e, "Failed to write request");
                return Err(ChannelError::Send(e.to_string()));
            }
            reply
        };

        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, reply.recv())
                .await
                .unwrap_or(Err(ChannelError::TimedOut(limit))),
            None => reply.recv().await,
        }
    }
}
