use super::{completion::WakerSet, error::StreamError};
use crate::platform::SharedPtr;
use futures::future::poll_fn;
use parking_lot::Mutex;
use std::{future::Future, task::Poll};

struct SignalState {
    reason: Option<StreamError>,
    wakers: WakerSet,
}

/// Owner side of an [`AbortSignal`].
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                state: SharedPtr::new(Mutex::new(SignalState {
                    reason: None,
                    wakers: WakerSet::new(),
                })),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the signal. Only the first call has any effect.
    ///
    /// Without a reason the signal reports `StreamError::Aborted(None)`.
    pub fn abort(&self, reason: Option<StreamError>) {
        let mut state = self.signal.state.lock();
        if state.reason.is_some() {
            return;
        }
        state.reason = Some(reason.unwrap_or(StreamError::Aborted(None)));
        state.wakers.wake_all();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation token observed by pipe operations.
#[derive(Clone)]
pub struct AbortSignal {
    state: SharedPtr<Mutex<SignalState>>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.state.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.state.lock().reason.clone()
    }

    /// Resolves with the abort reason once the signal fires.
    pub fn wait(&self) -> impl Future<Output = StreamError> + 'static {
        let state = self.state.clone();
        poll_fn(move |cx| {
            let mut state = state.lock();
            match &state.reason {
                Some(reason) => Poll::Ready(reason.clone()),
                None => {
                    state.wakers.register(cx.waker());
                    Poll::Pending
                }
            }
        })
    }
}
