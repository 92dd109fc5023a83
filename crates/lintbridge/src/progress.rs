//! Progress reporting for dependency installation and worker restarts.
//!
//! The UI implements [`ProgressReporter`] to show and hide a transient progress
//! area. The core talks to it through [`Progress`], which reference-counts
//! `begin`/`end` so overlapping phases (install, boot, restart) only show the
//! area once and hide it when the last phase finishes.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

/// UI-facing progress surface.
pub trait ProgressReporter: Send + Sync {
    /// Show the progress area.
    fn begin(&self);
    /// Add text to the progress area. May contain terminal control sequences.
    fn append(&self, text: &str);
    /// Hide the progress area.
    fn end(&self);
}

/// Nesting-aware wrapper around a [`ProgressReporter`].
pub struct Progress {
    reporter: Arc<dyn ProgressReporter>,
    depth: StdMutex<usize>,
}

impl Progress {
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            depth: StdMutex::new(0),
        }
    }

    pub fn begin(&self) {
        let mut depth = self.depth.lock().unwrap_or_else(PoisonError::into_inner);
        if *depth == 0 {
            self.reporter.begin();
        }
        *depth += 1;
    }

    pub fn end(&self) {
        let mut depth = self.depth.lock().unwrap_or_else(PoisonError::into_inner);
        match *depth {
            0 => tracing::warn!("Progress end() without matching begin()"),
            1 => {
                *depth = 0;
                self.reporter.end();
            }
            _ => *depth -= 1,
        }
    }

    pub fn append(&self, text: &str) {
        if !text.is_empty() {
            self.reporter.append(text);
        }
    }

    /// Begin a phase that ends when the returned guard drops.
    pub fn scope(&self) -> ProgressScope<'_> {
        self.begin();
        ProgressScope { progress: self }
    }

    pub fn depth(&self) -> usize {
        *self.depth.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ProgressScope<'a> {
    progress: &'a Progress,
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.progress.end();
    }
}

/// Logs progress text through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn begin(&self) {
        tracing::debug!(target: "lintbridge::progress", "Progress started");
    }

    fn append(&self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "lintbridge::progress", "{}", line);
        }
    }

    fn end(&self) {
        tracing::debug!(target: "lintbridge::progress", "Progress finished");
    }
}
