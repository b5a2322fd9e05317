//! Bounded-concurrency async fabric dispatching `(candidate, example_id)`
//! scoring calls against the external task oracle, consulting [`Cache`]
//! first (§4.4).
//!
//! Concurrency is grounded directly on `automations::server::serve`'s
//! `tokio::sync::Semaphore` + `OwnedSemaphorePermit` pattern: acquire a
//! permit per in-flight oracle call, spawn the call as its own task, release
//! the permit on completion. Cache hits never touch the semaphore.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fingerprint::EvalKey;
use tokio::sync::{watch, Semaphore};
use tracing::warn;
use types::{Candidate, EvaluationResult, ExampleId, ShardResult};

/// An error kind the task oracle distinguishes so the Evaluator knows
/// whether to retry (§4.4, §7).
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("transient oracle failure: {0}")]
    Transient(String),
    #[error("permanent oracle failure: {0}")]
    Permanent(String),
}

/// Scores one `(candidate, example)` pair against the external task oracle
/// (§6 glossary). Implementations for real LLM backends live outside this
/// crate; evoforge ships only a deterministic toy oracle for tests.
#[async_trait]
pub trait TaskOracle: Send + Sync {
    async fn score(&self, candidate: &Candidate, example_id: &ExampleId) -> Result<EvaluationResult, OracleError>;
}

/// Given a parent's text and a batch of failure traces, proposes zero or
/// more candidate texts (§6 glossary, invoked by the Mutator). Must not
/// raise for input it cannot handle; returning an empty vector is a valid
/// response.
#[async_trait]
pub trait ReflectionOracle: Send + Sync {
    async fn reflect(&self, parent_text: &str, traces: &[types::Trace]) -> Vec<String>;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
        }
    }
}

/// A cooperative cancellation flag: in-flight oracle calls poll it between
/// retries and before recording a result, never mid-call. Grounded on the
/// teacher's `tokio::select!`-based interruption of `ready_tasks`.
#[derive(Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Evaluator {
    cache: cache::Cache,
    oracle: Arc<dyn TaskOracle>,
    semaphore: Arc<Semaphore>,
    retry_policy: RetryPolicy,
    shard_version: u32,
    call_timeout: Duration,
}

impl Evaluator {
    pub fn new(
        cache: cache::Cache,
        oracle: Arc<dyn TaskOracle>,
        eval_concurrency: usize,
        retry_policy: RetryPolicy,
        shard_version: u32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            oracle,
            semaphore: Arc::new(Semaphore::new(eval_concurrency.max(1))),
            retry_policy,
            shard_version,
            call_timeout,
        }
    }

    /// Returns after every ID in `ids` has produced a result (cache or
    /// oracle) or exhausted retries. Positional order does not affect the
    /// aggregate: [`ShardResult::aggregate`] sums, it does not fold in
    /// order.
    pub async fn evaluate(&self, candidate: &Candidate, ids: &[ExampleId], cancel: &CancelToken) -> ShardResult {
        let started = std::time::Instant::now();
        let mut tasks = Vec::with_capacity(ids.len());

        for id in ids {
            let candidate = candidate.clone();
            let id = id.clone();
            let cache = self.cache.clone();
            let oracle = self.oracle.clone();
            let semaphore = self.semaphore.clone();
            let retry_policy = self.retry_policy;
            let shard_version = self.shard_version;
            let call_timeout = self.call_timeout;
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                evaluate_one(
                    &cache,
                    oracle,
                    semaphore,
                    &candidate,
                    &id,
                    shard_version,
                    retry_policy,
                    call_timeout,
                    &cancel,
                )
                .await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!(error = %join_err, "evaluation task panicked, recording as structural failure");
                    results.push(EvaluationResult::structural_failure("evaluation task panicked"));
                }
            }
        }

        ShardResult::aggregate(&results, started.elapsed())
    }
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_one(
    cache: &cache::Cache,
    oracle: Arc<dyn TaskOracle>,
    semaphore: Arc<Semaphore>,
    candidate: &Candidate,
    id: &ExampleId,
    shard_version: u32,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
    cancel: &CancelToken,
) -> EvaluationResult {
    let key = EvalKey::new(candidate.fingerprint(), &id.0, shard_version);

    if let Some(cached) = cache.get(&key) {
        return cached;
    }

    // Cache hits never consume the budget; only a real oracle call does.
    let permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return EvaluationResult::structural_failure("semaphore closed"),
    };

    let mut attempt = 0u32;
    let result = loop {
        if cancel.is_cancelled() {
            drop(permit);
            return EvaluationResult::structural_failure("cancelled before result recorded");
        }

        let call = tokio::time::timeout(call_timeout, oracle.score(candidate, id));
        let transient_reason = match call.await {
            Ok(Ok(result)) => break result,
            Ok(Err(OracleError::Permanent(reason))) => {
                break EvaluationResult::structural_failure(&reason);
            }
            Ok(Err(OracleError::Transient(reason))) => reason,
            Err(_) => "call timed out".to_string(),
        };

        if attempt < retry_policy.max_retries {
            attempt += 1;
            tokio::time::sleep(retry_policy.delay_for(attempt)).await;
            continue;
        }
        break EvaluationResult::structural_failure(&format!("retries exhausted: {transient_reason}"));
    };
    drop(permit);

    if let Err(err) = cache.put(&key, &result) {
        warn!(%err, "cache put failed after oracle call");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyOracle {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl TaskOracle for FlakyOracle {
        async fn score(&self, _candidate: &Candidate, _id: &ExampleId) -> Result<EvaluationResult, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(OracleError::Transient("not ready".into()));
            }
            let mut objectives = BTreeMap::new();
            objectives.insert("quality".to_string(), 0.9);
            objectives.insert("neg_cost".to_string(), -1.0);
            objectives.insert("tokens".to_string(), 10.0);
            Ok(EvaluationResult {
                objectives,
                trace: None,
                failure: false,
            })
        }
    }

    struct PermanentlyFailingOracle;

    #[async_trait]
    impl TaskOracle for PermanentlyFailingOracle {
        async fn score(&self, _candidate: &Candidate, _id: &ExampleId) -> Result<EvaluationResult, OracleError> {
            Err(OracleError::Permanent("bad input".into()))
        }
    }

    fn candidate() -> Candidate {
        Candidate::new("text".into(), vec![], types::Origin::Seed, 1)
    }

    #[tokio::test]
    async fn retries_succeed_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache::Cache::open(dir.path()).unwrap();
        let oracle = Arc::new(FlakyOracle {
            calls: AtomicUsize::new(0),
            fail_first_n: 2,
        });
        let eval = Evaluator::new(
            cache,
            oracle,
            4,
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                cap: Duration::from_millis(5),
            },
            1,
            Duration::from_secs(1),
        );
        let (_handle, token) = cancel_pair();
        let shard = eval
            .evaluate(&candidate(), &[ExampleId::from("ex-1")], &token)
            .await;
        assert_eq!(shard.objective("quality"), 0.9);
        assert_eq!(shard.structural_failures, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_a_structural_failure_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache::Cache::open(dir.path()).unwrap();
        let oracle = Arc::new(PermanentlyFailingOracle);
        let eval = Evaluator::new(cache, oracle, 4, RetryPolicy::default(), 1, Duration::from_secs(1));
        let (_handle, token) = cancel_pair();
        let shard = eval
            .evaluate(&candidate(), &[ExampleId::from("ex-1")], &token)
            .await;
        assert_eq!(shard.structural_failures, 1);
        assert_eq!(shard.objective("quality"), 0.0);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache::Cache::open(dir.path()).unwrap();
        let c = candidate();
        let key = EvalKey::new(c.fingerprint(), "ex-1", 1);
        let mut objectives = BTreeMap::new();
        objectives.insert("quality".to_string(), 0.42);
        cache
            .put(
                &key,
                &EvaluationResult {
                    objectives,
                    trace: None,
                    failure: false,
                },
            )
            .unwrap();

        let oracle = Arc::new(PermanentlyFailingOracle);
        let eval = Evaluator::new(cache, oracle, 4, RetryPolicy::default(), 1, Duration::from_secs(1));
        let (_handle, token) = cancel_pair();
        let shard = eval.evaluate(&c, &[ExampleId::from("ex-1")], &token).await;
        assert_eq!(shard.objective("quality"), 0.42);
    }
}
