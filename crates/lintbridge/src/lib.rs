//! lintbridge: supervised lint worker with a framed stdio protocol.
//!
//! A [`Supervisor`] keeps one worker process alive behind a stable
//! [`LintChannel`]. A [`Coordinator`] on top of any channel serializes lint
//! requests, numbers them, and delivers only the latest result.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod coordinator;
mod health;
pub mod logging;
pub mod polling;
pub mod progress;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::protocol::{LintReport, LintRequest, LintResult, Severity, Span, Warning};
pub use channel::{ChannelError, LintChannel, Predicate};
pub use config::{BridgeConfig, CommandSpec, ConfigError};
pub use coordinator::{Coordinator, LintError};
pub use health::WorkerState;
pub use polling::FilePollingChannel;
pub use progress::{Progress, ProgressReporter, TracingReporter};
pub use supervisor::{CommandSpawner, Supervisor, SupervisorError, WorkerSpawner};
pub use worker::{EngineOutput, LintEngine, run_worker, serve_stdio};
