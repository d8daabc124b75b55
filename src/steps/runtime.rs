use std::{future::Future, sync::Arc};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::PushError;

/// Shared worker pool and cancellation signal for one push invocation.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct StepPool {
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl StepPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel every step sharing this pool.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a short I/O-bound section on the pool, waiting for a free
    /// worker first. Step bodies call this *after* joining their
    /// predecessors; holding a worker while waiting on another step
    /// deadlocks a small pool.
    pub async fn run<T>(
        &self,
        work: impl Future<Output = Result<T, PushError>>,
    ) -> Result<T, PushError> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PushError::Cancelled),
            permit = self.workers.acquire() => permit
                .map_err(|_| PushError::Internal("worker pool closed".to_owned()))?,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(PushError::Cancelled),
            result = work => result,
        }
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, PushError>>>;

/// A deferred, single-assignment value: the unit of scheduling in the
/// push DAG.
///
/// The body runs exactly once; every clone of the handle observes the
/// same result. A step observing cancellation resolves to
/// [`PushError::Cancelled`] and stays that way.
#[derive(Clone)]
pub struct Step<T: Clone> {
    inner: SharedResult<T>,
}

impl<T> Step<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawn a leaf step: the body occupies one pool worker for its whole
    /// duration. Use for bodies that perform I/O and join nothing.
    pub fn spawn<F>(pool: &StepPool, body: F) -> Self
    where
        F: Future<Output = Result<T, PushError>> + Send + 'static,
    {
        let inner = pool.clone();
        Self::compose(pool, async move { inner.run(body).await })
    }

    /// Spawn a composing step: the body awaits other steps and hands
    /// I/O-bound sections to [`StepPool::run`] itself.
    pub fn compose<F>(pool: &StepPool, body: F) -> Self
    where
        F: Future<Output = Result<T, PushError>> + Send + 'static,
    {
        let cancel = pool.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(PushError::Cancelled),
                result = body => result,
            }
        });

        let inner = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(PushError::Cancelled),
                Err(err) => Err(PushError::Internal(format!("step body panicked: {err}"))),
            }
        }
        .boxed()
        .shared();

        Self { inner }
    }

    /// A step that already holds its value.
    pub fn ready(value: T) -> Self {
        Self {
            inner: async move { Ok(value) }.boxed().shared(),
        }
    }

    /// Await the value. Completion of the body happens-before this
    /// returns, for every caller.
    pub async fn join(&self) -> Result<T, PushError> {
        self.inner.clone().await
    }

    /// The result, if the body already completed. Never blocks.
    pub fn peek(&self) -> Option<Result<T, PushError>> {
        self.inner.peek().cloned()
    }

    /// Derive a step whose body runs on the pool once this step's value
    /// is ready.
    pub fn map<U, F, Fut>(&self, pool: &StepPool, body: F) -> Step<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, PushError>> + Send + 'static,
    {
        let input = self.clone();
        let inner = pool.clone();

        Step::compose(pool, async move {
            let value = input.join().await?;
            inner.run(body(value)).await
        })
    }
}

/// Join a set of steps, preserving input order. The first failure wins.
pub async fn all_of<T>(steps: &[Step<T>]) -> Result<Vec<T>, PushError>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::try_join_all(steps.iter().map(|step| step.join())).await
}
