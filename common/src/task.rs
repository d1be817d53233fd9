//! Named task spawning with logged join results.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, info_span, warn, Instrument};

/// A [`JoinHandle`] carrying the name of the task it joins, so join results
/// and panics are always attributable in logs.
///
/// All spawned futures run inside a tracing span labeled with the task name.
#[must_use]
pub struct NamedTask<T = ()> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T: Send + 'static> NamedTask<T> {
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let span = info_span!("task", name = %name);
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

/// Wait for every task to finish, logging each join result, and giving up
/// (with a warning naming the stragglers) after `timeout`.
///
/// Call this after the shutdown signal has been sent; it does not send one.
pub async fn join_all_with_timeout(
    tasks: Vec<NamedTask<()>>,
    timeout: Duration,
) {
    let mut remaining = tasks
        .into_iter()
        .map(|task| async move {
            let name = task.name.clone();
            let result = task.await;
            (name, result)
        })
        .collect::<FuturesUnordered<_>>();

    let join_all = async {
        while let Some((name, result)) = remaining.next().await {
            match result {
                Ok(()) => info!("task '{name}' finished"),
                Err(err) if err.is_cancelled() =>
                    info!("task '{name}' was cancelled"),
                Err(err) => error!("task '{name}' panicked: {err:#}"),
            }
        }
    };

    if tokio::time::timeout(timeout, join_all).await.is_err() {
        warn!("some tasks did not finish before the shutdown timeout");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn joins_all_tasks() {
        let tasks = vec![
            NamedTask::spawn("quick", async {}),
            NamedTask::spawn("slow", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        ];
        join_all_with_timeout(tasks, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_hung_task() {
        let tasks = vec![NamedTask::spawn("hung", async {
            std::future::pending::<()>().await;
        })];
        join_all_with_timeout(tasks, Duration::from_secs(1)).await;
    }
}
