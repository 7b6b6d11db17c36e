use super::error::{StreamError, StreamResult};
use futures::{FutureExt, channel::oneshot};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

/// Outcome of a stream request (read, write, close, abort, cancel).
///
/// The request's synchronous steps run when it is issued; this future only
/// observes the result, so dropping it never undoes the request.
#[must_use = "dropping a completion discards the request's outcome"]
pub struct Completion<R> {
    state: CompletionState<R>,
}

enum CompletionState<R> {
    Ready(Option<StreamResult<R>>),
    Waiting(oneshot::Receiver<StreamResult<R>>),
}

// Never pin-projected; the receiver is Unpin and `Ready` holds a plain value.
impl<R> Unpin for Completion<R> {}

impl<R> Completion<R> {
    pub(crate) fn ready(result: StreamResult<R>) -> Self {
        Self {
            state: CompletionState::Ready(Some(result)),
        }
    }

    pub(crate) fn waiting(receiver: oneshot::Receiver<StreamResult<R>>) -> Self {
        Self {
            state: CompletionState::Waiting(receiver),
        }
    }

    /// Creates a pending request and the sender that settles it.
    pub(crate) fn channel() -> (oneshot::Sender<StreamResult<R>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::waiting(rx))
    }
}

impl<R> Future for Completion<R> {
    type Output = StreamResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            CompletionState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(StreamError::type_error("Completion polled after it finished"))),
            ),
            CompletionState::Waiting(rx) => rx
                .poll_unpin(cx)
                .map(|result| result.unwrap_or(Err(StreamError::TaskDropped))),
        }
    }
}

/// Wakers waiting on a level-triggered stream signal (`closed`, `ready`, ...).
#[derive(Default)]
pub(crate) struct WakerSet(Vec<Waker>);

impl WakerSet {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.0.drain(..) {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn ready_completion_resolves_immediately() {
        let completion = Completion::ready(Ok(5));
        assert_eq!(completion.now_or_never().unwrap().unwrap(), 5);
    }

    #[test]
    fn waiting_completion_resolves_when_settled() {
        let (tx, mut completion) = Completion::<u8>::channel();
        assert!((&mut completion).now_or_never().is_none());
        tx.send(Ok(1)).unwrap();
        assert_eq!(completion.now_or_never().unwrap().unwrap(), 1);
    }

    #[test]
    fn dropped_sender_reports_task_dropped() {
        let (tx, completion) = Completion::<()>::channel();
        drop(tx);
        assert!(matches!(
            completion.now_or_never().unwrap(),
            Err(StreamError::TaskDropped)
        ));
    }
}
