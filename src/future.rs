//! The single assignment completion handle returned by communication hooks.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    FutureExt,
    channel::oneshot,
    future::{self, BoxFuture, Shared},
};

use crate::{error::CommErr, tensor::Tensor};

/// What a `CommFuture` eventually holds.
pub type Outcome = Result<Vec<Tensor>, CommErr>;

/// A cloneable handle to a tensor sequence that becomes available asynchronously.
///
/// Every clone observes the same outcome, reading it more than once is idempotent.
#[derive(Clone)]
pub struct CommFuture {
    inner: Shared<BoxFuture<'static, Outcome>>,
}

/// The writing end of a pending `CommFuture`.
///
/// Assigning consumes the completion, so a future transitions at most once. Dropping
/// it unassigned fails the future with `CommErr::Dropped`.
pub struct Completion {
    tx: oneshot::Sender<Outcome>,
}

impl CommFuture {
    /// Creates a pending future together with the completion that resolves it.
    pub fn pending() -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        let inner = rx
            .map(|res| res.unwrap_or(Err(CommErr::Dropped)))
            .boxed()
            .shared();

        (Completion { tx }, Self { inner })
    }

    /// Creates an already resolved future.
    pub fn ready(value: Vec<Tensor>) -> Self {
        Self::from_outcome(Ok(value))
    }

    /// Creates an already failed future.
    pub fn failed(err: CommErr) -> Self {
        Self::from_outcome(Err(err))
    }

    fn from_outcome(outcome: Outcome) -> Self {
        Self {
            inner: future::ready(outcome).boxed().shared(),
        }
    }

    /// Reads the outcome without blocking.
    ///
    /// # Returns
    /// `None` while the future is still pending.
    pub fn peek(&self) -> Option<Outcome> {
        self.inner.clone().now_or_never()
    }

    /// Whether the future was either resolved or failed.
    pub fn is_completed(&self) -> bool {
        self.peek().is_some()
    }

    /// Blocks the calling thread until the outcome is available.
    ///
    /// Must not be called from within a single threaded async runtime.
    pub fn wait(&self) -> Outcome {
        futures::executor::block_on(self.inner.clone())
    }

    /// Chains a continuation that runs on the resolved value.
    ///
    /// Failures skip `f` and propagate to the returned future.
    ///
    /// # Arguments
    /// * `f` - The continuation, may itself fail.
    ///
    /// # Returns
    /// A new future holding the continuation's outcome.
    pub fn chain<F>(&self, f: F) -> CommFuture
    where
        F: FnOnce(Vec<Tensor>) -> Outcome + Send + 'static,
    {
        let inner = self
            .inner
            .clone()
            .map(move |res| res.and_then(f))
            .boxed()
            .shared();

        Self { inner }
    }
}

impl Future for CommFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for CommFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.peek() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };

        f.debug_struct("CommFuture").field("state", &state).finish()
    }
}

impl Completion {
    /// Resolves the future with `value`.
    pub fn complete(self, value: Vec<Tensor>) {
        // The receiving end may be gone already, nobody is left to observe the value.
        let _ = self.tx.send(Ok(value));
    }

    /// Fails the future with `err`.
    pub fn fail(self, err: CommErr) {
        let _ = self.tx.send(Err(err));
    }

    /// Assigns either outcome.
    pub fn finish(self, outcome: Outcome) {
        let _ = self.tx.send(outcome);
    }

    /// Whether every `CommFuture` reading this completion was dropped.
    pub fn is_canceled(&self) -> bool {
        self.tx.is_canceled()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn pending_until_completed() {
        let (completion, fut) = CommFuture::pending();
        assert!(fut.peek().is_none());

        completion.complete(vec![tensor::full(&[2], 3.0)]);
        assert!(fut.is_completed());
        assert_eq!(fut.wait(), Ok(vec![tensor::full(&[2], 3.0)]));
    }

    #[test]
    fn reads_are_idempotent_across_clones() {
        let (completion, fut) = CommFuture::pending();
        let other = fut.clone();
        completion.fail(CommErr::PeerUnreachable { rank: 1 });

        let first = fut.peek();
        let second = other.peek();
        let third = fut.wait();

        assert_eq!(first, Some(Err(CommErr::PeerUnreachable { rank: 1 })));
        assert_eq!(first, second);
        assert_eq!(first, Some(third));
    }

    #[test]
    fn dropped_completion_fails_the_future() {
        let (completion, fut) = CommFuture::pending();
        drop(completion);
        assert_eq!(fut.wait(), Err(CommErr::Dropped));
    }

    #[test]
    fn completion_notices_dropped_readers() {
        let (completion, fut) = CommFuture::pending();
        assert!(!completion.is_canceled());
        drop(fut);
        assert!(completion.is_canceled());
    }

    #[test]
    fn continuations_run_on_success_only() {
        let doubled = CommFuture::ready(vec![tensor::full(&[1], 2.0)]).chain(|mut ts| {
            ts.iter_mut().for_each(|t| *t *= 2.0);
            Ok(ts)
        });
        assert_eq!(doubled.wait(), Ok(vec![tensor::full(&[1], 4.0)]));

        let skipped = CommFuture::failed(CommErr::Dropped).chain(|_| panic!("must not run"));
        assert_eq!(skipped.wait(), Err(CommErr::Dropped));
    }

    #[tokio::test]
    async fn completes_across_threads() {
        let (completion, fut) = CommFuture::pending();

        std::thread::spawn(move || completion.complete(vec![tensor::full(&[1], 1.0)]));

        assert_eq!(fut.await, Ok(vec![tensor::full(&[1], 1.0)]));
    }
}
