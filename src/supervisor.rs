// Supervised background tasks
//
// A supervised task is restarted on failure (error return or panic) with
// exponential backoff between 1 s and 300 s. Five consecutive failures stop
// it permanently with a critical log line. A run that outlived the caller's
// `healthy_runtime` before failing resets the failure accounting.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const FAILURE_BUDGET: u32 = 5;

/// Spawn `factory`'s future under supervision.
///
/// The factory is invoked for every (re)start. A normal `Ok(())` return ends
/// supervision; an `Err` or panic triggers a restart until the failure
/// budget is spent.
///
/// `healthy_runtime` is how long a run must last before its eventual failure
/// resets the consecutive-failure count. It must comfortably exceed the
/// task's own work interval: a periodic task that sleeps a tick and then
/// fails its first piece of work has not proven anything, and counting it
/// as healthy would make the failure budget unreachable.
///
/// Panic recovery relies on unwinding; the release profile must not set
/// `panic = "abort"`.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    healthy_runtime: Duration,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = MIN_BACKOFF;
        let mut consecutive_failures = 0u32;

        loop {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(factory()).catch_unwind().await;

            match outcome {
                Ok(Ok(())) => {
                    tracing::info!("background task '{name}' completed");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::error!("background task '{name}' failed: {e:#}");
                }
                Err(_) => {
                    tracing::error!("background task '{name}' panicked");
                }
            }

            if started.elapsed() >= healthy_runtime {
                consecutive_failures = 0;
                backoff = MIN_BACKOFF;
            }
            consecutive_failures += 1;

            if consecutive_failures >= FAILURE_BUDGET {
                tracing::error!(
                    "background task '{name}' exceeded {FAILURE_BUDGET} consecutive failures; \
                     stopping permanently"
                );
                return;
            }

            tracing::warn!(
                "restarting background task '{name}' in {:?} (failure {consecutive_failures}/{FAILURE_BUDGET})",
                backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const HEALTHY: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("flaky", HEALTHY, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_failure_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("doomed", HEALTHY, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always broken")
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_count_as_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("panicky", HEALTHY, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("boom");
                }
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_long_sleeps_do_not_reset_the_budget() {
        // A periodic task that sleeps one tick and then fails must still
        // exhaust the budget: the sleep alone is not a healthy run.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("broken-store", HEALTHY, move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("store unreachable")
            }
        });

        handle.await.unwrap();
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            5,
            "failures at tick cadence must accumulate to the budget"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runs_outliving_healthy_runtime_reset_the_budget() {
        // Seven failures, each after a run longer than the healthy runtime;
        // without the reset the budget of five would have stopped it earlier.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let handle = spawn_supervised("mostly-healthy", HEALTHY, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(HEALTHY + Duration::from_secs(100)).await;
                if n < 6 {
                    anyhow::bail!("occasional failure {n}");
                }
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 7);
    }
}
