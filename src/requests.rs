//! Completion handles for operations that finish later on the engine task.
//!
//! Every command posted to the engine carries an [`AsyncRequest`]. The
//! engine completes it exactly once; completion consumes the handle, so a
//! second completion is unrepresentable. The caller side awaits the paired
//! `oneshot::Receiver`.

use tokio::sync::oneshot;

/// One-shot completion handle for an operation running on the engine task.
///
/// A request is either backed by a channel, a no-op (completion discarded),
/// and may carry a pre-completion hook used for bookkeeping such as removing
/// the request from a pending map before the waiting caller observes the
/// outcome.
pub(crate) struct AsyncRequest<T, E> {
    tx: Option<oneshot::Sender<Result<T, E>>>,
    hook: Option<Box<dyn FnOnce() + Send>>,
}

impl<T, E> std::fmt::Debug for AsyncRequest<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("noop", &self.tx.is_none())
            .field("wrapped", &self.hook.is_some())
            .finish()
    }
}

impl<T, E> AsyncRequest<T, E> {
    /// Creates a request and the receiver the caller awaits on.
    pub fn new() -> (Self, oneshot::Receiver<Result<T, E>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                hook: None,
            },
            rx,
        )
    }

    /// A request whose completion nobody observes.
    pub fn noop() -> Self {
        Self {
            tx: None,
            hook: None,
        }
    }

    /// Layers a bookkeeping hook that runs before the completion is
    /// delivered to the underlying handle.
    ///
    /// An existing hook is preserved and runs after the new one.
    pub fn wrap(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hook = match self.hook.take() {
            Some(prev) => Some(Box::new(move || {
                hook();
                prev();
            })),
            None => Some(Box::new(hook)),
        };
        self
    }

    /// Completes the request successfully.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Completes the request with an error.
    pub fn fail(self, error: E) {
        self.complete(Err(error));
    }

    fn complete(mut self, result: Result<T, E>) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
        if let Some(tx) = self.tx.take() {
            // The caller may have abandoned the request (timeout); that is
            // not an error for a plain completion.
            let _ = tx.send(result);
        }
    }

    /// Completes with an error, handing it back if the caller has
    /// abandoned the request.
    ///
    /// Lets the engine route failures nobody awaits (asynchronous sends
    /// and acknowledgements) to the exception listener instead of
    /// dropping them. A no-op request reports delivered: its completions
    /// are intentionally discarded.
    pub fn try_fail(mut self, error: E) -> Result<(), E> {
        if let Some(hook) = self.hook.take() {
            hook();
        }
        match self.tx.take() {
            Some(tx) => tx.send(Err(error)).map_err(|res| match res {
                Err(error) => error,
                // Only `Err` is ever sent on this path
                Ok(_) => unreachable!(),
            }),
            None => Ok(()),
        }
    }

    /// Completes successfully, handing the value back if the caller has
    /// abandoned the request.
    ///
    /// Used by the receiver dispatch path: a delivery whose waiting
    /// `recv` timed out between dequeue and completion is put back into
    /// the buffer instead of being dropped.
    pub fn try_succeed(mut self, value: T) -> Result<(), T> {
        if let Some(hook) = self.hook.take() {
            hook();
        }
        match self.tx.take() {
            Some(tx) => tx.send(Ok(value)).map_err(|res| match res {
                Ok(value) => value,
                // Only `Ok` is ever sent on this path
                Err(_) => unreachable!(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncRequest;

    #[tokio::test]
    async fn completes_once_and_delivers() {
        let (req, rx) = AsyncRequest::<u32, ()>::new();
        req.succeed(7);
        assert_eq!(rx.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn hooks_run_before_delivery_in_wrap_order() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let order = Arc::new(AtomicU32::new(0));
        let (req, rx) = AsyncRequest::<(), ()>::new();

        let first = order.clone();
        let second = order.clone();
        let req = req
            .wrap(move || {
                // inner hook runs last
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 1);
            })
            .wrap(move || {
                // outermost hook runs first
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 0);
            });

        req.succeed(());
        rx.await.unwrap().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_completion_returns_value() {
        let (req, rx) = AsyncRequest::<u32, ()>::new();
        drop(rx);
        assert_eq!(req.try_succeed(3), Err(3));
    }

    #[test]
    fn noop_discards_completion() {
        AsyncRequest::<u32, ()>::noop().succeed(1);
    }
}
