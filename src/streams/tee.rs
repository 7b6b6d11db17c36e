use super::{
    CountQueuingStrategy, QueuingStrategy,
    completion::WakerSet,
    error::{StreamError, StreamResult},
    readable::{
        ControllerKind, DefaultSource, ReadableShared, ReadableSource, ReadableStream,
        ReadableStreamDefaultController, ReadableStreamDefaultReader, ReadableStreamInner,
    },
    validate_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr, WeakPtr};
use futures::future::{self, Either, poll_fn};
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

/// How the tee decides when to read the next chunk from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Matches `ReadableStream.prototype.tee()` in the WHATWG Streams standard.
    ///
    /// - Reads whenever *either* branch asks for data, so the faster consumer
    ///   drives progress.
    /// - The slower branch buffers without limit.
    #[default]
    FastestConsumer,

    /// Reads only once every branch that is still live wants more data.
    ///
    /// The slowest consumer throttles the whole tee, which bounds buffering at
    /// the cost of throughput.
    SlowestConsumer,
}

type BranchRef<T> = WeakPtr<Mutex<ReadableStreamInner<T>>>;

struct TeeState<T: MaybeSend + 'static> {
    source: ReadableShared<T>,
    branches: [Option<BranchRef<T>>; 2],
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    // Set when a branch's driver goes away without canceling.
    dropped: [bool; 2],
    pull_requested: bool,
    cancel_result: Option<StreamResult<()>>,
    cancel_wakers: WakerSet,
    coordinator_wakers: WakerSet,
}

impl<T: MaybeSend + 'static> TeeState<T> {
    fn new(source: ReadableShared<T>) -> Self {
        Self {
            source,
            branches: [None, None],
            canceled: [false; 2],
            reasons: [None, None],
            dropped: [false; 2],
            pull_requested: false,
            cancel_result: None,
            cancel_wakers: WakerSet::new(),
            coordinator_wakers: WakerSet::new(),
        }
    }

    fn is_gone(&self, branch: usize) -> bool {
        self.canceled[branch] || self.dropped[branch]
    }

    fn both_canceled(&self) -> bool {
        self.canceled[0] && self.canceled[1]
    }

    fn live_branch(&self, branch: usize) -> Option<ReadableStreamDefaultController<T>> {
        if self.is_gone(branch) {
            return None;
        }
        self.branches[branch]
            .as_ref()
            .and_then(ReadableStreamDefaultController::upgrade)
    }

    fn has_room(&self, mode: BackpressureMode) -> bool {
        match mode {
            BackpressureMode::FastestConsumer => true,
            BackpressureMode::SlowestConsumer => (0..2).all(|branch| {
                self.live_branch(branch)
                    .is_none_or(|controller| !controller.has_backpressure())
            }),
        }
    }

    /// Resolves `true` when a read should happen, `false` once no branch is left to feed.
    fn poll_pull_requested(&mut self, cx: &mut Context<'_>, mode: BackpressureMode) -> Poll<bool> {
        if self.is_gone(0) && self.is_gone(1) {
            return Poll::Ready(false);
        }
        if self.pull_requested && self.has_room(mode) {
            self.pull_requested = false;
            return Poll::Ready(true);
        }
        self.coordinator_wakers.register(cx.waker());
        Poll::Pending
    }

    fn poll_both_gone(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_gone(0) && self.is_gone(1) {
            return Poll::Ready(());
        }
        self.coordinator_wakers.register(cx.waker());
        Poll::Pending
    }

    fn poll_cancel_result(&mut self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        match &self.cancel_result {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                self.cancel_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    fn settle_cancel(&mut self, result: StreamResult<()>) {
        if self.cancel_result.is_none() {
            self.cancel_result = Some(result);
        }
        self.cancel_wakers.wake_all();
    }
}

type TeeShared<T> = SharedPtr<Mutex<TeeState<T>>>;

/// The source behind one tee branch. Pulls are forwarded to the coordinator.
struct TeeBranchSource<T: MaybeSend + 'static> {
    state: TeeShared<T>,
    branch: usize,
}

impl<T: MaybeSend + 'static> ReadableSource<T> for TeeBranchSource<T> {
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        {
            let mut state = self.state.lock();
            state.pull_requested = true;
            state.coordinator_wakers.wake_all();
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let source_cancel = {
            let mut state = self.state.lock();
            state.canceled[self.branch] = true;
            state.reasons[self.branch] = reason;
            state.coordinator_wakers.wake_all();
            if state.both_canceled() {
                let composite = StreamError::composite(state.reasons[0].take(), state.reasons[1].take());
                debug!(reason = %composite, "both tee branches canceled");
                let completion = state.source.lock().cancel(Some(composite));
                Some(completion)
            } else {
                None
            }
        };
        if let Some(completion) = source_cancel {
            let result = completion.await;
            self.state.lock().settle_cancel(result);
        }
        let state = self.state.clone();
        poll_fn(move |cx| state.lock().poll_cancel_result(cx)).await
    }
}

impl<T: MaybeSend + 'static> Drop for TeeBranchSource<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.dropped[self.branch] = true;
        state.coordinator_wakers.wake_all();
    }
}

fn distribute<T: MaybeSend + Clone + 'static>(state: &TeeShared<T>, chunk: T) {
    let (first, second) = {
        let state = state.lock();
        (state.live_branch(0), state.live_branch(1))
    };
    // Enqueue failures mean the branch closed under us; the other branch still gets the chunk.
    match (first, second) {
        (Some(first), Some(second)) => {
            let _ = first.enqueue(chunk.clone());
            let _ = second.enqueue(chunk);
        }
        (Some(only), None) | (None, Some(only)) => {
            let _ = only.enqueue(chunk);
        }
        (None, None) => {}
    }
}

fn finish<T: MaybeSend + 'static>(state: &TeeShared<T>, error: Option<StreamError>) {
    let branches = {
        let state = state.lock();
        [state.live_branch(0), state.live_branch(1)]
    };
    for branch in branches.into_iter().flatten() {
        match &error {
            None => {
                let _ = branch.close();
            }
            Some(error) => branch.error(error.clone()),
        }
    }
    let mut state = state.lock();
    if !state.both_canceled() {
        state.settle_cancel(Ok(()));
    }
    debug!(error = ?error, "tee source finished");
}

async fn tee_coordinator<T: MaybeSend + Clone + 'static>(
    reader: ReadableStreamDefaultReader<T>,
    state: TeeShared<T>,
    mode: BackpressureMode,
) {
    loop {
        let wanted = {
            let state = state.clone();
            poll_fn(move |cx| state.lock().poll_pull_requested(cx, mode)).await
        };
        if !wanted {
            break;
        }

        trace!("tee reading from source");
        let read = reader.read();
        let gone = {
            let state = state.clone();
            poll_fn(move |cx| state.lock().poll_both_gone(cx))
        };
        let result = match future::select(read, pin!(gone)).await {
            Either::Left((result, _)) => result,
            Either::Right(((), _)) => break,
        };

        match result {
            Ok(Some(chunk)) => distribute(&state, chunk),
            Ok(None) => {
                finish(&state, None);
                break;
            }
            Err(error) => {
                finish(&state, Some(error));
                break;
            }
        }
    }
    trace!("tee coordinator finished");
}

/// Builder for the two branches returned by [`ReadableStream::tee`].
pub struct TeeBuilder<T: MaybeSend + Clone + 'static> {
    stream: ReadableStream<T>,
    mode: BackpressureMode,
    branch1_strategy: BoxedStrategy<T>,
    branch2_strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + Clone + 'static> TeeBuilder<T> {
    pub fn new(stream: ReadableStream<T>) -> Self {
        Self {
            stream,
            mode: BackpressureMode::default(),
            branch1_strategy: Box::new(CountQueuingStrategy::new(1.0)),
            branch2_strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn backpressure_mode(mut self, mode: BackpressureMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use the same strategy for both branches.
    pub fn strategy<S>(self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + Clone + MaybeSend + MaybeSync + 'static,
    {
        self.branch1_strategy(strategy.clone()).branch2_strategy(strategy)
    }

    pub fn branch1_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.branch1_strategy = Box::new(strategy);
        self
    }

    pub fn branch2_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.branch2_strategy = Box::new(strategy);
        self
    }

    /// Lock the source and return both branches plus the future that drives them.
    ///
    /// Fails if the source is already locked or a branch strategy is invalid.
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T>,
        ReadableStream<T>,
        impl Future<Output = ()> + MaybeSend + 'static,
    )> {
        validate_high_water_mark(self.branch1_strategy.high_water_mark())?;
        validate_high_water_mark(self.branch2_strategy.high_water_mark())?;
        let reader = self.stream.get_reader()?;

        let state = SharedPtr::new(Mutex::new(TeeState::new(self.stream.shared().clone())));
        let (branch1, branch1_task) = ReadableStream::new_inner(
            DefaultSource(TeeBranchSource {
                state: state.clone(),
                branch: 0,
            }),
            ControllerKind::Default,
            self.branch1_strategy,
        )?;
        let (branch2, branch2_task) = ReadableStream::new_inner(
            DefaultSource(TeeBranchSource {
                state: state.clone(),
                branch: 1,
            }),
            ControllerKind::Default,
            self.branch2_strategy,
        )?;
        {
            let mut state = state.lock();
            state.branches = [
                Some(branch1.controller().downgrade()),
                Some(branch2.controller().downgrade()),
            ];
        }

        let coordinator = tee_coordinator(reader, state, self.mode);
        let fut = async move {
            future::join3(coordinator, branch1_task, branch2_task).await;
        };
        Ok((branch1, branch2, fut))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Source that records the reason it was canceled with.
    struct CancelRecordingSource {
        next: u32,
        canceled_with: Arc<Mutex<Option<Option<StreamError>>>>,
    }

    impl ReadableSource<u32> for CancelRecordingSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            self.next += 1;
            controller.enqueue(self.next)
        }

        async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            *self.canceled_with.lock() = Some(reason);
            Ok(())
        }
    }

    struct FailingSource {
        sent: bool,
    }

    impl ReadableSource<u32> for FailingSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<u32>,
        ) -> StreamResult<()> {
            if self.sent {
                return Err(StreamError::from("source broke"));
            }
            self.sent = true;
            controller.enqueue(7)
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn both_branches_see_every_chunk_then_close() {
        let source = ReadableStream::from_vec(vec!["a", "b", "c"])
            .spawn(tokio::spawn)
            .unwrap();
        let (left, right) = source.tee().spawn(tokio::spawn).unwrap();
        assert!(source.locked());

        let (left, right) = futures::join!(left.collect_all(), right.collect_all());
        assert_eq!(left.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(right.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn tee_of_locked_stream_fails() {
        let source = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn).unwrap();
        let _reader = source.get_reader().unwrap();
        let err = source.tee().spawn(tokio::spawn).unwrap_err();
        assert!(matches!(err, StreamError::Type(_)));
    }

    #[tokio::test]
    async fn invalid_branch_strategy_leaves_source_unlocked() {
        let source = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn).unwrap();
        let err = source
            .tee()
            .branch2_strategy(CountQueuingStrategy::new(-1.0))
            .spawn(tokio::spawn)
            .unwrap_err();
        assert!(matches!(err, StreamError::Range(_)));
        assert!(!source.locked());
    }

    #[tokio::test]
    async fn canceling_both_branches_cancels_source_with_both_reasons() {
        let canceled_with = Arc::new(Mutex::new(None));
        let source = ReadableStream::builder(CancelRecordingSource {
            next: 0,
            canceled_with: canceled_with.clone(),
        })
        .spawn(tokio::spawn)
        .unwrap();
        let (left, right) = source.tee().spawn(tokio::spawn).unwrap();

        let first = left.cancel(Some(StreamError::from("r1")));
        settle().await;
        assert!(first.now_or_never().is_none(), "first cancel waits for the sibling");
        assert!(canceled_with.lock().is_none());

        let second = right.cancel(Some(StreamError::from("r2")));
        timeout(Duration::from_secs(1), second).await.unwrap().unwrap();

        let reason = canceled_with.lock().clone().unwrap().unwrap();
        let (r1, r2) = reason.as_composite().unwrap();
        assert_eq!(r1.as_ref().unwrap().to_string(), "r1");
        assert_eq!(r2.as_ref().unwrap().to_string(), "r2");
    }

    #[tokio::test]
    async fn both_cancel_futures_settle_together() {
        let source = ReadableStream::builder(CancelRecordingSource {
            next: 0,
            canceled_with: Arc::new(Mutex::new(None)),
        })
        .spawn(tokio::spawn)
        .unwrap();
        let (left, right) = source.tee().spawn(tokio::spawn).unwrap();

        let first = left.cancel(None);
        let second = right.cancel(None);
        let (first, second) = timeout(Duration::from_secs(1), async { futures::join!(first, second) })
            .await
            .unwrap();
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn canceled_branch_does_not_stop_the_other() {
        let source = ReadableStream::from_vec(vec![1, 2, 3])
            .spawn(tokio::spawn)
            .unwrap();
        let (left, right) = source.tee().spawn(tokio::spawn).unwrap();

        let canceled = left.cancel(None);
        let chunks = timeout(Duration::from_secs(1), right.collect_all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunks, vec![1, 2, 3]);

        // Source ran out before the sibling canceled, so the pending cancel resolves.
        timeout(Duration::from_secs(1), canceled).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn source_error_errors_both_branches() {
        let source = ReadableStream::builder(FailingSource { sent: false })
            .spawn(tokio::spawn)
            .unwrap();
        let (left, right) = source.tee().spawn(tokio::spawn).unwrap();

        let left_reader = left.get_reader().unwrap();
        let right_reader = right.get_reader().unwrap();
        assert_eq!(left_reader.read().await.unwrap(), Some(7));
        assert_eq!(right_reader.read().await.unwrap(), Some(7));

        let left_err = timeout(Duration::from_secs(1), left_reader.read())
            .await
            .unwrap()
            .unwrap_err();
        let right_err = timeout(Duration::from_secs(1), right_reader.read())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(left_err.to_string(), "source broke");
        assert_eq!(right_err.to_string(), "source broke");
    }

    #[tokio::test]
    async fn slowest_consumer_holds_back_the_faster_branch() {
        let source = ReadableStream::from_iterator(0..10u32)
            .spawn(tokio::spawn)
            .unwrap();
        let (fast, slow) = source
            .tee()
            .backpressure_mode(BackpressureMode::SlowestConsumer)
            .spawn(tokio::spawn)
            .unwrap();
        let fast = fast.get_reader().unwrap();
        let slow = slow.get_reader().unwrap();

        assert_eq!(fast.read().await.unwrap(), Some(0));
        let blocked = fast.read();
        settle().await;
        assert!(blocked.now_or_never().is_none(), "slow branch is still full");

        assert_eq!(slow.read().await.unwrap(), Some(0));
        let next = timeout(Duration::from_secs(1), fast.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, Some(1));
    }

    #[tokio::test]
    async fn spec_compliant_lets_the_faster_branch_run_ahead() {
        let source = ReadableStream::from_iterator(0..5u32)
            .spawn(tokio::spawn)
            .unwrap();
        let (fast, slow) = source.tee().spawn(tokio::spawn).unwrap();

        let chunks = timeout(Duration::from_secs(1), fast.collect_all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunks, vec![0, 1, 2, 3, 4]);
        assert_eq!(slow.collect_all().await.unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
