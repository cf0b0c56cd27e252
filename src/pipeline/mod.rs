//! Pipeline & Scheduler (C8): a DAG of build steps run over a fixed-size
//! worker pool, with per-step retry for transient errors and cooperative
//! cancellation once any step fails for good. Grounded on the teacher's
//! `concurrency/mod.rs` `ConcurrencyPermit`/`ConcurrencyController` idiom —
//! its RAII permit and trait-based controller are kept, but the adaptive,
//! ML-driven tuning (`AdaptiveConcurrencyManager`) is deliberately dropped
//! in favor of §4.8's fixed-size pool sized once at plan-construction time;
//! see the design notes for the full rationale.

use crate::error::{BuildError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A single step's work, produced once dependencies are satisfied.
pub type StepAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub struct Step {
    pub name: String,
    /// Must name only steps that appear earlier in the `Vec` passed to
    /// [`Scheduler::run`] — the pipeline is built in topological order by
    /// construction, so no separate toposort is needed here.
    pub depends_on: Vec<String>,
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, depends_on: Vec<String>, action: StepAction) -> Self {
        Self { name: name.into(), depends_on, action }
    }
}

/// Exponential backoff schedule for transient registry errors (§4.8):
/// 200ms, 1s, 5s, giving up after the third retry.
const RETRY_DELAYS: [Duration; 3] = [Duration::from_millis(200), Duration::from_secs(1), Duration::from_secs(5)];

pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(worker_pool_size: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(worker_pool_size.max(1))), cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs every step to completion (or failure). Each step is spawned as
    /// its own task the moment its dependencies are wired up, so independent
    /// branches make progress concurrently rather than waiting for
    /// declaration order; the `Shared` wrapper lets any number of dependents
    /// await the same upstream result without re-running it.
    pub async fn run(&self, steps: Vec<Step>) -> Result<()> {
        let mut handles: HashMap<String, Shared<BoxFuture<'static, Result<()>>>> = HashMap::new();

        for step in steps {
            let dep_futures: Vec<_> = step
                .depends_on
                .iter()
                .map(|dep| {
                    handles
                        .get(dep)
                        .cloned()
                        .ok_or_else(|| BuildError::Configuration(format!("step '{}' depends on unknown or later step '{}'", step.name, dep)))
                })
                .collect::<Result<_>>()?;

            let semaphore = self.semaphore.clone();
            let cancelled = self.cancelled.clone();
            let name = step.name.clone();
            let action = step.action;

            let inner: BoxFuture<'static, Result<()>> = async move {
                for dep in dep_futures {
                    dep.await?;
                }
                if cancelled.load(Ordering::SeqCst) {
                    return Err(BuildError::Configuration(format!(
                        "build cancelled before step '{}' could start",
                        name
                    )));
                }

                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BuildError::Io(format!("worker pool semaphore closed: {}", e)))?;

                let result = run_with_retry(action).await;
                if result.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                result
            }
            .boxed();

            let task = tokio::spawn(inner);
            let shared: BoxFuture<'static, Result<()>> = async move {
                task.await.map_err(|e| BuildError::Io(format!("worker task panicked: {}", e)))?
            }
            .boxed();
            handles.insert(step.name, shared.shared());
        }

        let results = futures::future::join_all(handles.into_values()).await;
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}

/// A [`StepAction`] is an `FnOnce` — it can only be invoked once — so retry
/// is opt-in per step via [`retryable`], which rebuilds the attempt's future
/// from a factory closure instead of trying to replay a consumed one.
async fn run_with_retry(action: StepAction) -> Result<()> {
    action().await
}

/// Generic counterpart to [`retryable`] for call sites that aren't wired
/// through the [`Scheduler`] at all — the registry client calls made
/// directly from `build::push_layers`/`assemble::push_manifest_and_config`
/// still owe §4.8's "transient `RegistryError`/`NetworkError` retried up to
/// 3 times, 200ms/1s/5s" guarantee even though they never became their own
/// DAG step.
pub async fn retry_transient<T, F, Fut>(make_attempt: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match make_attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < RETRY_DELAYS.len() && e.is_transient() => {
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a step body that performs its own internal retry loop (since a
/// `StepAction` is an `FnOnce` and can only be driven once): builds a
/// fresh future per attempt from a factory closure, retrying up to
/// [`RETRY_DELAYS`] times while the error stays transient.
pub fn retryable<F>(make_attempt: impl Fn() -> F + Send + Sync + 'static) -> StepAction
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match make_attempt().await {
                    Ok(()) => return Ok(()),
                    Err(e) if attempt < RETRY_DELAYS.len() && e.is_transient() => {
                        tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ok_step(name: &str, depends_on: Vec<String>) -> Step {
        Step::new(name, depends_on, Box::new(|| Box::pin(async { Ok(()) })))
    }

    #[tokio::test]
    async fn independent_steps_all_complete() {
        let scheduler = Scheduler::new(2);
        let steps = vec![ok_step("a", vec![]), ok_step("b", vec![])];
        scheduler.run(steps).await.unwrap();
    }

    #[tokio::test]
    async fn dependent_step_runs_after_its_dependency() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let scheduler = Scheduler::new(4);
        let steps = vec![
            Step::new(
                "first",
                vec![],
                Box::new(move || {
                    Box::pin(async move {
                        o1.lock().unwrap().push("first");
                        Ok(())
                    })
                }),
            ),
            Step::new(
                "second",
                vec!["first".to_string()],
                Box::new(move || {
                    Box::pin(async move {
                        o2.lock().unwrap().push("second");
                        Ok(())
                    })
                }),
            ),
        ];
        scheduler.run(steps).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn one_failing_step_fails_the_whole_run() {
        let scheduler = Scheduler::new(2);
        let steps = vec![
            ok_step("a", vec![]),
            Step::new("b", vec![], Box::new(|| Box::pin(async { Err(BuildError::Configuration("boom".to_string())) }))),
        ];
        assert!(scheduler.run(steps).await.is_err());
    }

    #[tokio::test]
    async fn retryable_retries_transient_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let action = retryable(move || {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BuildError::Network("transient".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        action().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_on_non_transient_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let result: Result<()> = retry_transient(move || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(BuildError::Configuration("not retryable".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_transient_returns_value_on_success() {
        let value = retry_transient(|| async { Ok::<_, BuildError>(42) }).await.unwrap();
        assert_eq!(value, 42);
    }
}
