//! Request coordinator.
//!
//! Serializes lint requests over one [`LintChannel`]. At most one request is
//! in flight. Requests submitted meanwhile queue behind it, and each new
//! submission replaces the queued request, so only the most recent one is
//! sent when the in-flight request finishes. Callers whose request was
//! replaced, and the in-flight request's callers when something newer is
//! queued, resolve with the result of the request that runs after them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::oneshot;

use crate::bridge::protocol::{
    DEFAULT_FILE_NAME, LintInput, LintRequest, LintResponse, LintResult, response_sequence,
};
use crate::channel::{ChannelError, LintChannel};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LintError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A response for a newer request arrived while this one was awaited.
    #[error("request {expected} superseded by response {received}")]
    Superseded { expected: u64, received: u64 },
    #[error("invalid response: {0}")]
    Protocol(String),
    #[error("coordinator dropped the request")]
    Dropped,
}

type Outcome = Result<LintResult, LintError>;

/// A request plus every caller that will receive its result.
struct Batch {
    request: LintRequest,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

#[derive(Default)]
struct Queue {
    running: bool,
    next: Option<Batch>,
}

pub struct Coordinator {
    channel: Arc<dyn LintChannel>,
    file_name: String,
    next_sequence: AtomicU64,
    queue: StdMutex<Queue>,
}

impl Coordinator {
    pub fn new(channel: Arc<dyn LintChannel>) -> Self {
        Self {
            channel,
            file_name: DEFAULT_FILE_NAME.to_string(),
            next_sequence: AtomicU64::new(0),
            queue: StdMutex::new(Queue::default()),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Sequence number the next sent request will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Acquire)
    }

    /// Lint `code` against `config`.
    pub fn submit(
        self: &Arc<Self>,
        code: impl Into<String>,
        config: impl Into<String>,
    ) -> impl Future<Output = Outcome> + Send + 'static {
        self.lint(LintRequest::new(code, config))
    }

    /// Queue `request`. Ordering is fixed when this is called, not when the
    /// returned future is first polled.
    pub fn lint(
        self: &Arc<Self>,
        request: LintRequest,
    ) -> impl Future<Output = Outcome> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.running {
                match &mut queue.next {
                    Some(batch) => {
                        tracing::debug!(waiters = batch.waiters.len() + 1, "Replacing queued request");
                        batch.request = request;
                        batch.waiters.push(tx);
                    }
                    None => {
                        tracing::trace!("Request in flight, queueing");
                        queue.next = Some(Batch {
                            request,
                            waiters: vec![tx],
                        });
                    }
                }
                None
            } else {
                queue.running = true;
                Some(Batch {
                    request,
                    waiters: vec![tx],
                })
            }
        };

        if let Some(batch) = start {
            tokio::spawn(Arc::clone(self).drive(batch));
        }

        async move { rx.await.unwrap_or(Err(LintError::Dropped)) }
    }

    /// Run batches until the queue is empty.
    async fn drive(self: Arc<Self>, first: Batch) {
        let mut batch = first;
        loop {
            let outcome = self.run(&batch.request).await;
            let next = self.take_next();

            batch = match next {
                // Result is already stale: hand these callers to the newer request.
                Some(mut next) if forwards(&outcome) => {
                    tracing::debug!(
                        forwarded = batch.waiters.len(),
                        "Newer request queued, forwarding callers"
                    );
                    next.waiters.extend(batch.waiters);
                    next
                }
                next => {
                    for waiter in batch.waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                    match next {
                        Some(next) => next,
                        None => return,
                    }
                }
            };
        }
    }

    /// Pop the queued batch, or mark the coordinator idle if there is none.
    fn take_next(&self) -> Option<Batch> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let next = queue.next.take();
        if next.is_none() {
            queue.running = false;
        }
        next
    }

    async fn run(&self, request: &LintRequest) -> Outcome {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let input = LintInput::new(sequence, request, self.file_name.clone());
        let payload =
            serde_json::to_value(&input).map_err(|e| LintError::Protocol(e.to_string()))?;

        tracing::debug!(sequence, "Sending lint request");
        let reply = self
            .channel
            .request(
                payload,
                Box::new(move |msg: &serde_json::Value| {
                    response_sequence(msg).is_some_and(|received| received >= sequence)
                }),
            )
            .await?;

        let received = response_sequence(&reply).unwrap_or(sequence);
        if received != sequence {
            tracing::warn!(sequence, received, "Lint request superseded");
            return Err(LintError::Superseded {
                expected: sequence,
                received,
            });
        }

        let response: LintResponse =
            serde_json::from_value(reply).map_err(|e| LintError::Protocol(e.to_string()))?;
        tracing::debug!(sequence, success = response.result.is_success(), "Lint response received");
        Ok(response.result)
    }
}

/// Outcomes that a newer queued request replaces. Channel errors are always
/// delivered to the callers that hit them.
fn forwards(outcome: &Outcome) -> bool {
    matches!(outcome, Ok(_) | Err(LintError::Superseded { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Predicate;
    use tokio::sync::mpsc;

    type Responder = oneshot::Sender<Result<serde_json::Value, ChannelError>>;

    /// Hands each request to the test, which answers through the responder.
    struct ScriptedChannel {
        requests: mpsc::UnboundedSender<(serde_json::Value, Responder)>,
    }

    #[async_trait::async_trait]
    impl LintChannel for ScriptedChannel {
        async fn request(
            &self,
            payload: serde_json::Value,
            accept: Predicate,
        ) -> Result<serde_json::Value, ChannelError> {
            let (tx, rx) = oneshot::channel();
            self.requests
                .send((payload, tx))
                .map_err(|_| ChannelError::Closed)?;
            let reply = rx.await.map_err(|_| ChannelError::Closed)??;
            assert!(accept(&reply), "test replied with a message the waiter rejects");
            Ok(reply)
        }
    }

    fn scripted() -> (
        Arc<Coordinator>,
        mpsc::UnboundedReceiver<(serde_json::Value, Responder)>,
    ) {
        let (requests, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Coordinator::new(Arc::new(ScriptedChannel { requests })));
        (coordinator, rx)
    }

    fn success(sequence: u64, output: &str) -> serde_json::Value {
        serde_json::json!({
            "sequenceNumber": sequence,
            "exit": 0,
            "result": {"warnings": []},
            "fixResult": {"warnings": []},
            "output": output,
        })
    }

    fn output_of(result: &LintResult) -> &str {
        match result {
            LintResult::Success { output, .. } => output,
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_submit_sends_sequence_zero() {
        let (coordinator, mut requests) = scripted();

        let result = tokio::spawn(coordinator.submit("a{color:red}", "{}"));
        let (payload, respond) = requests.recv().await.unwrap();
        let input: LintInput = serde_json::from_value(payload).unwrap();
        assert_eq!(
            input,
            LintInput::new(0, &LintRequest::new("a{color:red}", "{}"), DEFAULT_FILE_NAME)
        );

        respond.send(Ok(success(0, "a{color:#f00}"))).unwrap();
        let result = result.await.unwrap().unwrap();
        assert_eq!(output_of(&result), "a{color:#f00}");
        assert_eq!(coordinator.next_sequence(), 1);
    }

    #[tokio::test]
    async fn queued_requests_coalesce_to_latest() {
        let (coordinator, mut requests) = scripted();

        let a = tokio::spawn(coordinator.submit("a{}", "{}"));
        let (first, respond_a) = requests.recv().await.unwrap();
        assert_eq!(first["code"], "a{}");

        let b = tokio::spawn(coordinator.submit("b{}", "{}"));
        let c = tokio::spawn(coordinator.submit("c{}", "{}"));

        respond_a.send(Ok(success(0, "a-fixed"))).unwrap();
        let (second, respond_c) = requests.recv().await.unwrap();
        assert_eq!(second["code"], "c{}");
        assert_eq!(second["sequenceNumber"], 1);

        respond_c.send(Ok(success(1, "c-fixed"))).unwrap();
        for handle in [a, b, c] {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(output_of(&result), "c-fixed");
        }
        assert!(requests.try_recv().is_err());
        assert_eq!(coordinator.next_sequence(), 2);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_across_runs() {
        let (coordinator, mut requests) = scripted();

        for expected in 0..3u64 {
            let result = tokio::spawn(coordinator.submit("a{}", "{}"));
            let (payload, respond) = requests.recv().await.unwrap();
            assert_eq!(payload["sequenceNumber"], expected);
            respond.send(Ok(success(expected, "a{}"))).unwrap();
            result.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn newer_response_supersedes_waiter() {
        let (coordinator, mut requests) = scripted();
        coordinator.next_sequence.store(4, Ordering::SeqCst);

        let result = tokio::spawn(coordinator.submit("a{}", "{}"));
        let (payload, respond) = requests.recv().await.unwrap();
        assert_eq!(payload["sequenceNumber"], 4);

        respond.send(Ok(success(5, "stale"))).unwrap();
        assert_eq!(
            result.await.unwrap(),
            Err(LintError::Superseded {
                expected: 4,
                received: 5
            })
        );
    }

    #[tokio::test]
    async fn worker_failure_is_a_result_not_an_error() {
        let (coordinator, mut requests) = scripted();

        let result = tokio::spawn(coordinator.submit("a{}", "{bad"));
        let (_, respond) = requests.recv().await.unwrap();
        respond
            .send(Ok(serde_json::json!({
                "sequenceNumber": 0, "exit": 1, "result": "Unexpected token"
            })))
            .unwrap();

        assert_eq!(
            result.await.unwrap(),
            Ok(LintResult::Failure {
                message: "Unexpected token".to_string()
            })
        );
    }

    #[tokio::test]
    async fn malformed_response_is_protocol_error() {
        let (coordinator, mut requests) = scripted();

        let result = tokio::spawn(coordinator.submit("a{}", "{}"));
        let (_, respond) = requests.recv().await.unwrap();
        respond
            .send(Ok(serde_json::json!({"sequenceNumber": 0, "exit": 7, "result": null})))
            .unwrap();

        assert!(matches!(
            result.await.unwrap(),
            Err(LintError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn channel_error_reaches_in_flight_callers_only() {
        let (coordinator, mut requests) = scripted();

        let a = tokio::spawn(coordinator.submit("a{}", "{}"));
        let (_, respond_a) = requests.recv().await.unwrap();
        let b = tokio::spawn(coordinator.submit("b{}", "{}"));

        respond_a.send(Err(ChannelError::Restarted)).unwrap();
        assert_eq!(
            a.await.unwrap(),
            Err(LintError::Channel(ChannelError::Restarted))
        );

        let (payload, respond_b) = requests.recv().await.unwrap();
        assert_eq!(payload["code"], "b{}");
        respond_b.send(Ok(success(1, "b-fixed"))).unwrap();
        assert_eq!(output_of(&b.await.unwrap().unwrap()), "b-fixed");
    }

    #[tokio::test]
    async fn dropped_caller_does_not_stop_the_run() {
        let (coordinator, mut requests) = scripted();

        drop(coordinator.submit("a{}", "{}"));
        let (payload, respond) = requests.recv().await.unwrap();
        assert_eq!(payload["code"], "a{}");
        respond.send(Ok(success(0, "a{}"))).unwrap();

        let next = tokio::spawn(coordinator.submit("b{}", "{}"));
        let (payload, respond) = requests.recv().await.unwrap();
        assert_eq!(payload["sequenceNumber"], 1);
        respond.send(Ok(success(1, "b{}"))).unwrap();
        next.await.unwrap().unwrap();
    }

    mod end_to_end {
        use super::*;
        use crate::progress::TracingReporter;
        use crate::supervisor::{Supervisor, WorkerSpawner};
        use crate::testing::{InMemorySpawner, ScriptedEngine};
        use tokio::sync::Semaphore;

        async fn started(spawner: &Arc<InMemorySpawner>) -> (Arc<Supervisor>, Arc<Coordinator>) {
            let supervisor = Arc::new(Supervisor::new(
                Arc::clone(spawner) as Arc<dyn WorkerSpawner>,
                Arc::new(TracingReporter),
            ));
            supervisor.start().await.unwrap();
            let coordinator = Arc::new(Coordinator::new(
                Arc::clone(&supervisor) as Arc<dyn LintChannel>
            ));
            (supervisor, coordinator)
        }

        #[tokio::test]
        async fn lint_through_supervised_worker() {
            let (engine, _started) = ScriptedEngine::new();
            let spawner = Arc::new(InMemorySpawner::new(engine));
            let (_supervisor, coordinator) = started(&spawner).await;

            match coordinator.submit("a{color:red}", "{}").await.unwrap() {
                LintResult::Success {
                    result, output, ..
                } => {
                    assert_eq!(output, "a{color:#f00}");
                    assert_eq!(result.warnings.len(), 1);
                    assert_eq!(result.warnings[0].rule, "color-named");
                    assert_eq!(
                        result.warnings[0].doc_url().as_deref(),
                        Some("https://stylelint.io/user-guide/rules/color-named")
                    );
                }
                other => panic!("expected success, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn code_containing_frame_markers_round_trips() {
            let (engine, _started) = ScriptedEngine::new();
            let spawner = Arc::new(InMemorySpawner::new(engine));
            let (_supervisor, coordinator) = started(&spawner).await;

            let code = "/* {{{stylelint-json-end}}} {{{stylelint-json-start}}} */ a{color:red}";
            let result = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                coordinator.submit(code, "{}"),
            )
            .await
            .expect("lint did not complete")
            .unwrap();

            assert_eq!(
                output_of(&result),
                "/* {{{stylelint-json-end}}} {{{stylelint-json-start}}} */ a{color:#f00}"
            );
        }

        #[tokio::test]
        async fn bad_config_resolves_with_failure() {
            let (engine, _started) = ScriptedEngine::new();
            let spawner = Arc::new(InMemorySpawner::new(engine));
            let (_supervisor, coordinator) = started(&spawner).await;

            let result = coordinator.submit("a{}", "{not json").await.unwrap();
            assert!(matches!(result, LintResult::Failure { .. }));
        }

        #[tokio::test]
        async fn overlapping_submits_deliver_latest_result() {
            let gate = Arc::new(Semaphore::new(0));
            let (engine, mut lint_started) = ScriptedEngine::gated(Arc::clone(&gate));
            let spawner = Arc::new(InMemorySpawner::new(engine));
            let (_supervisor, coordinator) = started(&spawner).await;

            let a = tokio::spawn(coordinator.submit("a{color:red}", "{}"));
            assert_eq!(lint_started.recv().await, Some(0));
            let b = tokio::spawn(coordinator.submit("b{color:red}", "{}"));

            gate.add_permits(10);
            let a = a.await.unwrap().unwrap();
            let b = b.await.unwrap().unwrap();
            assert_eq!(a, b);
            assert_eq!(output_of(&b), "b{color:#f00}");
            assert_eq!(lint_started.recv().await, Some(1));
        }

        #[tokio::test]
        async fn crash_mid_request_rejects_then_recovers() {
            let gate = Arc::new(Semaphore::new(0));
            let (engine, mut lint_started) = ScriptedEngine::gated(Arc::clone(&gate));
            let spawner = Arc::new(InMemorySpawner::new(engine));
            let (supervisor, coordinator) = started(&spawner).await;

            let a = tokio::spawn(coordinator.submit("a{}", "{}"));
            assert_eq!(lint_started.recv().await, Some(0));
            spawner.crash();
            assert_eq!(
                a.await.unwrap(),
                Err(LintError::Channel(ChannelError::Restarted))
            );

            gate.add_permits(10);
            let c = coordinator.submit("c{color:red}", "{}").await.unwrap();
            assert_eq!(output_of(&c), "c{color:#f00}");
            assert_eq!(spawner.spawn_count(), 2);
            assert_eq!(supervisor.generation(), 2);
        }
    }
}
