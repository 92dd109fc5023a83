//! Worker runtime - runs inside the lint worker process.
//!
//! This module provides the child side of the framed stdio protocol. The
//! parent side (spawning, handshake, restart) is in supervisor.rs.
//!
//! The worker announces `"booting"` as soon as it starts reading, answers the
//! `"ready?"` probe, and lints one request at a time. Requests that arrive
//! while a lint is running are coalesced: only the latest one runs next.

use std::io;
use std::path::{Component, Path};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Chunk, FrameCodec};
use crate::bridge::protocol::{
    BOOTING, LintInput, LintReport, LintResponse, LintResult, READY, READY_PROBE,
};

/// Failure message for file names that escape the worker's source directory.
pub const OUT_OF_SCOPE_MESSAGE: &str = "An out-of-scope path was specified.";

type SharedWriter<W> = Arc<tokio::sync::Mutex<FramedWrite<W, FrameCodec>>>;

/// What the engine produces for one lint run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub result: LintReport,
    pub fix_result: LintReport,
    /// Source text after auto-fix.
    pub output: String,
}

/// Trait for the lint engine - abstracts the actual rule implementation.
///
/// Errors become `exit: 1` failure responses carrying the error's message.
#[async_trait::async_trait]
pub trait LintEngine: Send + Sync + 'static {
    async fn lint(&self, input: &LintInput) -> anyhow::Result<EngineOutput>;
}

/// True if `file_name` stays inside the directory it is resolved against.
fn is_in_scope(file_name: &str) -> bool {
    !file_name.is_empty()
        && Path::new(file_name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Lint a single request and build its response.
pub async fn lint_once<E: LintEngine + ?Sized>(engine: &E, input: LintInput) -> LintResponse {
    let sequence_number = input.sequence_number;
    tracing::info!(sequence = sequence_number, file_name = %input.file_name, "Linting file");

    let result = if !is_in_scope(&input.file_name) {
        tracing::warn!(sequence = sequence_number, file_name = %input.file_name, "Rejecting out-of-scope file name");
        LintResult::Failure {
            message: OUT_OF_SCOPE_MESSAGE.to_string(),
        }
    } else {
        match engine.lint(&input).await {
            Ok(EngineOutput {
                result,
                fix_result,
                output,
            }) => LintResult::Success {
                result,
                fix_result,
                output,
            },
            Err(e) => {
                tracing::warn!(sequence = sequence_number, error = %e, "Lint engine failed");
                LintResult::Failure {
                    message: e.to_string(),
                }
            }
        }
    };

    LintResponse {
        sequence_number,
        result,
    }
}

/// Run the worker event loop over the given streams.
///
/// Returns when the input closes.
pub async fn run_worker<R, W, E>(input: R, output: W, engine: Arc<E>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    E: LintEngine,
{
    let mut reader = FramedRead::new(input, FrameCodec::new());
    let writer: SharedWriter<W> = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        output,
        FrameCodec::new(),
    )));

    writer.lock().await.send(BOOTING).await?;
    tracing::info!("Worker booting");

    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut busy = false;
    let mut next: Option<LintInput> = None;

    loop {
        tokio::select! {
            chunk = reader.next() => {
                match chunk {
                    Some(Ok(Chunk::Message(msg))) => {
                        if msg.as_str() == Some(READY_PROBE) {
                            tracing::debug!("Handshake probe received");
                            writer.lock().await.send(READY).await?;
                            continue;
                        }
                        match serde_json::from_value::<LintInput>(msg) {
                            Ok(input) if busy => {
                                tracing::trace!(sequence = input.sequence_number, "Lint busy, queueing request");
                                if let Some(dropped) = next.replace(input) {
                                    tracing::debug!(sequence = dropped.sequence_number, "Queued request replaced by a newer one");
                                }
                            }
                            Ok(input) => {
                                busy = true;
                                spawn_lint(input, Arc::clone(&engine), Arc::clone(&writer), done_tx.clone());
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Ignoring unrecognized message");
                            }
                        }
                    }
                    Some(Ok(Chunk::Text(text))) => {
                        tracing::trace!(bytes = text.len(), "Ignoring unframed input");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Input error");
                        break;
                    }
                    None => {
                        tracing::info!("Input closed, exiting");
                        break;
                    }
                }
            }

            Some(()) = done_rx.recv() => {
                match next.take() {
                    Some(input) => {
                        spawn_lint(input, Arc::clone(&engine), Arc::clone(&writer), done_tx.clone());
                    }
                    None => busy = false,
                }
            }
        }
    }

    Ok(())
}

fn spawn_lint<E, W>(
    input: LintInput,
    engine: Arc<E>,
    writer: SharedWriter<W>,
    done: mpsc::Sender<()>,
) where
    E: LintEngine,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let sequence_number = input.sequence_number;
        let response = tokio::spawn(async move { lint_once(engine.as_ref(), input).await })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(sequence = sequence_number, error = %e, "Lint task panicked");
                LintResponse {
                    sequence_number,
                    result: LintResult::Failure {
                        message: format!("Task panicked: {e}"),
                    },
                }
            });
        {
            let mut w = writer.lock().await;
            if let Err(e) = w.send(&response).await {
                tracing::error!(sequence = response.sequence_number, error = %e, "Failed to send lint response");
            }
        }
        let _ = done.send(()).await;
    });
}

/// Run the worker on this process's stdin/stdout.
pub async fn serve_stdio<E: LintEngine>(engine: Arc<E>) -> io::Result<()> {
    run_worker(tokio::io::stdin(), tokio::io::stdout(), engine).await
}
