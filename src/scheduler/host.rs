use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{SchedulingHost, TaskCallback, TaskOptions};
use crate::engine::FetchResult;

const MAX_BACKOFF_FACTOR: u32 = 4;

/// Runs registered tasks on the current tokio runtime for as long as the
/// process lives.
#[derive(Default)]
pub struct TokioHost {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    callbacks: HashMap<String, TaskCallback>,
    registrations: HashMap<String, Registration>,
}

struct Registration {
    options: TaskOptions,
    handle: JoinHandle<()>,
}

impl TokioHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TokioHost {
    fn drop(&mut self) {
        for (_, registration) in self.state().registrations.drain() {
            registration.handle.abort();
        }
    }
}

#[async_trait]
impl SchedulingHost for TokioHost {
    fn define(&self, name: &str, callback: TaskCallback) {
        self.state().callbacks.insert(name.to_string(), callback);
    }

    async fn is_registered(&self, name: &str) -> bool {
        self.state()
            .registrations
            .get(name)
            .is_some_and(|registration| !registration.handle.is_finished())
    }

    async fn register(&self, name: &str, options: TaskOptions) -> Result<()> {
        let mut state = self.state();
        let Some(callback) = state.callbacks.get(name).cloned() else {
            bail!("task '{name}' has not been defined");
        };
        if options.minimum_interval.is_zero() {
            bail!("task '{name}' needs a non-zero interval");
        }

        debug!(
            task = name,
            interval_secs = options.minimum_interval.as_secs(),
            stop_on_terminate = options.stop_on_terminate,
            start_on_boot = options.start_on_boot,
            "registering task"
        );
        let handle = tokio::spawn(run_periodic(
            name.to_string(),
            callback,
            options.minimum_interval,
        ));
        if let Some(previous) = state
            .registrations
            .insert(name.to_string(), Registration { options, handle })
        {
            previous.handle.abort();
        }
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        if let Some(registration) = self.state().registrations.remove(name) {
            registration.handle.abort();
            debug!(
                task = name,
                interval_secs = registration.options.minimum_interval.as_secs(),
                "task unregistered"
            );
        }
        Ok(())
    }
}

fn failure_backoff(interval: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(interval.saturating_mul(2))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(interval.saturating_mul(MAX_BACKOFF_FACTOR))
        .with_max_elapsed_time(None)
        .build()
}

async fn run_periodic(name: String, callback: TaskCallback, interval: Duration) {
    let mut backoff = failure_backoff(interval);
    let mut delay = interval;
    loop {
        tokio::time::sleep(delay).await;
        debug!(task = %name, "task woke up");
        let result = callback().await;
        delay = match result {
            FetchResult::Failed => backoff
                .next_backoff()
                .unwrap_or(interval.saturating_mul(MAX_BACKOFF_FACTOR)),
            FetchResult::NewData | FetchResult::NoData => {
                backoff.reset();
                interval
            }
        };
        info!(
            task = %name,
            result = result.as_str(),
            next_in_secs = delay.as_secs(),
            "background task finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use tokio::time::Instant;

    fn scripted(results: Vec<FetchResult>) -> (TaskCallback, Arc<Mutex<Vec<u64>>>) {
        let started = Instant::now();
        let script = Arc::new(Mutex::new(VecDeque::from(results)));
        let wakes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&wakes);
        let callback: TaskCallback = Arc::new(move || {
            let script = Arc::clone(&script);
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().unwrap().push(started.elapsed().as_secs());
                script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(FetchResult::NoData)
            })
        });
        (callback, wakes)
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_up_to_four_intervals() {
        let host = TokioHost::new();
        let (callback, wakes) = scripted(vec![
            FetchResult::Failed,
            FetchResult::Failed,
            FetchResult::Failed,
            FetchResult::NewData,
        ]);
        host.define("job", callback);
        host.register("job", TaskOptions::every(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(700)).await;

        // +60, then +120 and +240 after failures, capped at +240.
        assert_eq!(*wakes.lock().unwrap(), vec![60, 180, 420, 660]);
    }

    #[tokio::test]
    async fn undefined_task_cannot_register() {
        let host = TokioHost::new();
        let err = host
            .register("missing", TaskOptions::every(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been defined"));
        assert!(!host.is_registered("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_stops_wake_ups() {
        let host = TokioHost::new();
        let (callback, wakes) = scripted(Vec::new());
        host.define("job", callback);
        host.register("job", TaskOptions::every(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(host.is_registered("job").await);

        tokio::time::sleep(Duration::from_secs(25)).await;
        host.unregister("job").await.unwrap();
        assert!(!host.is_registered("job").await);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(*wakes.lock().unwrap(), vec![10, 20]);
    }
}
