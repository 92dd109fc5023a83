//! Logical request channel to a worker.
//!
//! The worker protocol is message based: a request goes out, and at some
//! later point a matching message comes back mixed in with everything else.
//! [`PendingTable`] turns that into awaitable calls. Each waiter carries a
//! predicate, and every decoded message is offered to every waiter of the
//! worker generation that produced it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Decides whether a decoded message answers a particular request.
pub type Predicate = Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel restarted while the request was pending")]
    Restarted,
    #[error("worker has not been started")]
    NotStarted,
    #[error("failed to boot worker: {0}")]
    Boot(String),
    #[error("failed to send to worker: {0}")]
    Send(String),
    #[error("no response within {0:?}")]
    TimedOut(std::time::Duration),
    #[error("channel closed")]
    Closed,
}

/// Stable request channel. Survives worker restarts.
///
/// This abstraction lets the coordinator run against a supervised process,
/// the file-polling fallback, or a scripted channel in tests.
#[async_trait]
pub trait LintChannel: Send + Sync {
    /// Send `payload` and wait for the first message accepted by `accept`.
    async fn request(
        &self,
        payload: serde_json::Value,
        accept: Predicate,
    ) -> Result<serde_json::Value, ChannelError>;
}

pub(crate) type Reply = Result<serde_json::Value, ChannelError>;

struct Waiter {
    generation: u64,
    accept: Predicate,
    reply: oneshot::Sender<Reply>,
}

/// Outstanding waiters in registration order.
#[derive(Default)]
pub(crate) struct PendingTable {
    next_id: u64,
    waiters: BTreeMap<u64, Waiter>,
    /// Highest generation whose waiters were rejected. Generations retire in order.
    retired: Option<u64>,
}

impl PendingTable {
    pub(crate) fn register(
        &mut self,
        generation: u64,
        accept: Predicate,
    ) -> (u64, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        if self.retired.is_some_and(|retired| generation <= retired) {
            tracing::debug!(waiter = id, generation, "Generation already exited, rejecting waiter");
            let _ = tx.send(Err(ChannelError::Restarted));
            return (id, rx);
        }
        self.waiters.insert(
            id,
            Waiter {
                generation,
                accept,
                reply: tx,
            },
        );
        tracing::trace!(waiter = id, generation, "Registered waiter");
        (id, rx)
    }

    /// Offer a message to every waiter of `generation`. Returns how many it resolved.
    pub(crate) fn dispatch(&mut self, generation: u64, msg: &serde_json::Value) -> usize {
        let matched: Vec<u64> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.generation == generation && (w.accept)(msg))
            .map(|(id, _)| *id)
            .collect();

        for id in &matched {
            if let Some(waiter) = self.waiters.remove(id)
                && waiter.reply.send(Ok(msg.clone())).is_err()
            {
                tracing::debug!(waiter = id, "Waiter dropped before its response arrived");
            }
        }
        matched.len()
    }

    /// Reject every waiter of `generation`, and any registered for it later.
    pub(crate) fn reject_generation(&mut self, generation: u64, error: &ChannelError) -> usize {
        self.retired = self.retired.max(Some(generation));
        let ids: Vec<u64> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(waiter) = self.waiters.remove(id) {
                let _ = waiter.reply.send(Err(error.clone()));
            }
        }
        ids.len()
    }

    pub(crate) fn reject_all(&mut self, error: &ChannelError) -> usize {
        let waiters = std::mem::take(&mut self.waiters);
        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.reply.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.waiters.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Shared handle to a [`PendingTable`].
#[derive(Clone, Default)]
pub(crate) struct SharedPending(Arc<StdMutex<PendingTable>>);

impl SharedPending {
    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter that unregisters itself if dropped unresolved.
    pub(crate) fn wait_for(&self, generation: u64, accept: Predicate) -> PendingReply {
        let (id, rx) = self.lock().register(generation, accept);
        PendingReply {
            pending: self.clone(),
            id,
            rx: Some(rx),
        }
    }
}

/// A registered waiter. Dropping it before resolution removes it from the table.
pub(crate) struct PendingReply {
    pending: SharedPending,
    id: u64,
    rx: Option<oneshot::Receiver<Reply>>,
}

impl PendingReply {
    pub(crate) async fn recv(mut self) -> Reply {
        let Some(rx) = self.rx.take() else {
            return Err(ChannelError::Closed);
        };
        rx.await.unwrap_or(Err(ChannelError::Closed))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending.lock().remove(self.id);
    }
}
