//! File-polling fallback channel.
//!
//! For environments without a byte stream to the worker. The worker watches
//! `.input.json` in a shared directory and writes its answer to
//! `.output.json`; `.meta.json` holding `{"boot": true}` signals that it is
//! watching. Requests run one at a time. Output left over from an earlier
//! request is removed before the next one is written. Output that does not
//! parse yet (half-written) or that the waiter rejects is retried on the
//! next tick.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelError, LintChannel, Predicate};
use crate::config::{BridgeConfig, DEFAULT_POLL_INTERVAL};

pub const INPUT_FILE: &str = ".input.json";
pub const OUTPUT_FILE: &str = ".output.json";
pub const META_FILE: &str = ".meta.json";

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    boot: bool,
}

pub struct FilePollingChannel {
    dir: PathBuf,
    interval: Duration,
    timeout: Option<Duration>,
    lock: Mutex<()>,
}

impl FilePollingChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.worker_dir)
            .with_interval(config.poll_interval)
            .with_timeout(config.request_timeout)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Applies to each request and to [`Self::wait_for_boot`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn with_limit<T>(&self, fut: impl Future<Output = T>) -> Result<T, ChannelError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ChannelError::TimedOut(limit)),
            None => Ok(fut.await),
        }
    }

    /// Wait until the worker has written `{"boot": true}` to the meta file.
    pub async fn wait_for_boot(&self) -> Result<(), ChannelError> {
        let path = self.dir.join(META_FILE);
        tracing::debug!(path = %path.display(), "Waiting for worker boot");
        self.with_limit(async {
            let mut ticker = self.ticker();
            loop {
                ticker.tick().await;
                if read_json::<Meta>(&path).await.is_some_and(|meta| meta.boot) {
                    break;
                }
            }
        })
        .await?;
        tracing::info!("Polling worker booted");
        Ok(())
    }

    async fn poll_output(&self, accept: &Predicate) -> serde_json::Value {
        let path = self.dir.join(OUTPUT_FILE);
        let mut ticker = self.ticker();
        loop {
            ticker.tick().await;
            match read_json::<serde_json::Value>(&path).await {
                Some(msg) if accept(&msg) => return msg,
                Some(_) => tracing::trace!("Output not for this request yet"),
                None => {}
            }
        }
    }
}

/// Parsed contents of `path`, or `None` if missing or not (yet) valid JSON.
async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "Incomplete JSON, retrying");
                None
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read polled file");
            None
        }
    }
}

#[async_trait]
impl LintChannel for FilePollingChannel {
    async fn request(
        &self,
        payload: serde_json::Value,
        accept: Predicate,
    ) -> Result<serde_json::Value, ChannelError> {
        let _guard = self.lock.lock().await;

        let body = serde_json::to_vec(&payload).map_err(|e| ChannelError::Send(e.to_string()))?;

        let output = self.dir.join(OUTPUT_FILE);
        match tokio::fs::remove_file(&output).await {
            Ok(()) => tracing::debug!(path = %output.display(), "Removed previous output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ChannelError::Send(format!("{}: {e}", output.display()))),
        }

        let path = self.dir.join(INPUT_FILE);
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ChannelError::Send(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Wrote request");

        self.with_limit(self.poll_output(&accept)).await
    }
}
