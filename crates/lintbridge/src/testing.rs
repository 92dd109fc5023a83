//! In-memory worker for tests: duplex pipes running the real worker runtime.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{LintInput, LintReport, Severity, Warning};
use crate::progress::{Progress, ProgressReporter};
use crate::supervisor::{SpawnError, SpawnedWorker, WorkerControl, WorkerSpawner};
use crate::worker::{EngineOutput, LintEngine, run_worker};

/// Flags named colors and fixes `red` to `#f00`. Rejects configs that are not JSON.
///
/// Every lint start is reported on the `started` channel. A gated engine
/// blocks each lint until a permit is available.
pub(crate) struct ScriptedEngine {
    gate: Option<Arc<Semaphore>>,
    started: mpsc::UnboundedSender<u64>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (started, rx) = mpsc::unbounded_channel();
        (
            Self {
                gate: None,
                started,
            },
            rx,
        )
    }

    pub(crate) fn gated(gate: Arc<Semaphore>) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (mut engine, rx) = Self::new();
        engine.gate = Some(gate);
        (engine, rx)
    }
}

#[async_trait]
impl LintEngine for ScriptedEngine {
    async fn lint(&self, input: &LintInput) -> anyhow::Result<EngineOutput> {
        let _ = self.started.send(input.sequence_number);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }

        serde_json::from_str::<serde_json::Value>(&input.config)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;

        let warnings = input
            .code
            .find("red")
            .map(|offset| Warning {
                line: 1,
                column: offset as i64 + 1,
                end_line: Some(1),
                end_column: Some(offset as i64 + 4),
                rule: "color-named".to_string(),
                severity: Severity::Error,
                text: "Unexpected named color \"red\" (color-named)".to_string(),
            })
            .into_iter()
            .collect();

        Ok(EngineOutput {
            result: LintReport {
                warnings,
                ..Default::default()
            },
            fix_result: LintReport::default(),
            output: input.code.replace("red", "#f00"),
        })
    }
}

/// Spawns in-process workers over `tokio::io::duplex` pipes.
pub(crate) struct InMemorySpawner {
    engine: Arc<ScriptedEngine>,
    install_code: Option<i32>,
    silent: bool,
    spawned: AtomicUsize,
    crash: Arc<Notify>,
}

impl InMemorySpawner {
    pub(crate) fn new(engine: ScriptedEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            install_code: Some(0),
            silent: false,
            spawned: AtomicUsize::new(0),
            crash: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn with_install_code(mut self, code: Option<i32>) -> Self {
        self.install_code = code;
        self
    }

    /// Workers keep their pipes open but never answer.
    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Kill the live worker with exit code 1.
    pub(crate) fn crash(&self) {
        self.crash.notify_waiters();
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerSpawner for InMemorySpawner {
    async fn install(&self, progress: &Progress) -> Result<Option<i32>, SpawnError> {
        progress.append("added 120 packages in 3s\n");
        Ok(self.install_code)
    }

    fn spawn(&self) -> Result<SpawnedWorker, SpawnError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (parent_in, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, parent_out) = tokio::io::duplex(64 * 1024);

        let engine = Arc::clone(&self.engine);
        let crash = Arc::clone(&self.crash);
        let silent = self.silent;
        let task = tokio::spawn(async move {
            let crashed = crash.notified();
            let run = async move {
                if silent {
                    let _pipes = (worker_in, worker_out);
                    std::future::pending::<()>().await;
                } else if let Err(e) = run_worker(worker_in, worker_out, engine).await {
                    tracing::debug!(error = %e, "In-memory worker failed");
                }
            };
            tokio::select! {
                _ = crashed => 1,
                _ = run => 0,
            }
        });

        Ok(SpawnedWorker {
            input: Box::new(parent_in),
            output: Box::new(parent_out),
            control: Box::new(TaskControl {
                task,
                exit: None,
            }),
        })
    }
}

/// [`WorkerControl`] over a task standing in for a process.
struct TaskControl {
    task: JoinHandle<i32>,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = match (&mut self.task).await {
            Ok(code) => Some(code),
            Err(e) if e.is_cancelled() => None,
            Err(e) => return Err(io::Error::other(e)),
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProgressEvent {
    Begin,
    Append(String),
    End,
}

/// Forwards progress events over an unbounded channel.
pub(crate) struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: ProgressEvent) {
        if self.tx.is_closed() {
            return;
        }
        let _ = self.tx.send(event);
    }
}

impl ProgressReporter for ChannelReporter {
    fn begin(&self) {
        self.send(ProgressEvent::Begin);
    }

    fn append(&self, text: &str) {
        self.send(ProgressEvent::Append(text.to_string()));
    }

    fn end(&self) {
        self.send(ProgressEvent::End);
    }
}

/// Collect the text of every queued `Append` event.
pub(crate) fn drain_progress(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> String {
    let mut text = String::new();
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Append(chunk) = event {
            text.push_str(&chunk);
        }
    }
    text
}
