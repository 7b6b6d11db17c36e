use super::{
    CountQueuingStrategy, QueuingStrategy,
    abort_signal::{AbortController, AbortSignal},
    completion::{Completion, WakerSet},
    error::{StreamError, StreamResult},
    queue::Queue,
    validate_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr, WeakPtr};
use futures::{
    FutureExt, StreamExt,
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, Either, poll_fn},
    sink::Sink,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    pin::{Pin, pin},
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink once every queued write has finished
    fn close(&mut self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink; queued writes have already been discarded
    fn abort(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

type Completer = oneshot::Sender<StreamResult<()>>;

enum WriteRecord<T> {
    // Taken out while the write is in flight; the size stays counted until it settles.
    Chunk(Option<T>),
    Close,
}

pub(crate) enum SinkJob<T> {
    Write(T),
    Close,
    Abort(Option<StreamError>),
}

struct PendingAbort {
    reason: Option<StreamError>,
    was_already_erroring: bool,
    write_failure: Option<StreamError>,
    completions: Vec<Completer>,
}

impl PendingAbort {
    fn settle(self, result: StreamResult<()>) {
        let result = match self.write_failure {
            Some(failure) => Err(failure),
            None => result,
        };
        for completion in self.completions {
            let _ = completion.send(result.clone());
        }
    }
}

// ----------- Inner State -----------
pub(crate) type WritableShared<T> = SharedPtr<Mutex<WritableStreamInner<T>>>;

pub(crate) struct WritableStreamInner<T> {
    state: WritableState,
    stored_error: Option<StreamError>,
    writer: Option<u64>,
    next_writer_id: u64,
    write_requests: VecDeque<Completer>,
    in_flight_write_request: Option<Completer>,
    close_request: Option<Completer>,
    in_flight_close_request: Option<Completer>,
    pending_abort: Option<PendingAbort>,
    // Abort handed to the sink and not yet settled; `closed` waits for it.
    aborting: Option<PendingAbort>,
    backpressure: bool,
    queue: Queue<WriteRecord<T>>,
    strategy: Option<BoxedStrategy<T>>,
    started: bool,
    // `None` once the sink algorithms have been cleared.
    jobs: Option<UnboundedSender<SinkJob<T>>>,
    abort_controller: AbortController,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
}

impl<T> WritableStreamInner<T> {
    fn new(strategy: BoxedStrategy<T>, jobs: UnboundedSender<SinkJob<T>>) -> Self {
        let queue = Queue::new(strategy.high_water_mark());
        let backpressure = queue.desired_size() <= 0.0;
        Self {
            state: WritableState::Writable,
            stored_error: None,
            writer: None,
            next_writer_id: 0,
            write_requests: VecDeque::new(),
            in_flight_write_request: None,
            close_request: None,
            in_flight_close_request: None,
            pending_abort: None,
            aborting: None,
            backpressure,
            queue,
            strategy: Some(strategy),
            started: false,
            jobs: Some(jobs),
            abort_controller: AbortController::new(),
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("Stream is errored"))
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            WritableState::Errored | WritableState::Erroring => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable => Some(self.queue.desired_size()),
        }
    }

    fn update_backpressure(&mut self) {
        let backpressure = self.queue.desired_size() <= 0.0;
        if backpressure != self.backpressure {
            trace!(backpressure, "writable backpressure changed");
            self.backpressure = backpressure;
            if !backpressure {
                self.ready_wakers.wake_all();
            }
        }
    }

    fn clear_algorithms(&mut self) {
        self.jobs = None;
        self.strategy = None;
    }

    pub(crate) fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.clear_algorithms();
            self.start_erroring(error);
        }
    }

    fn start_erroring(&mut self, reason: StreamError) {
        debug!(%reason, "writable stream erroring");
        self.state = WritableState::Erroring;
        self.stored_error = Some(reason);
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        debug!("writable stream errored");
        self.state = WritableState::Errored;
        self.queue.reset();
        let stored = self.stored_error();
        for request in self.write_requests.drain(..) {
            let _ = request.send(Err(stored.clone()));
        }
        self.ready_wakers.wake_all();

        let Some(abort) = self.pending_abort.take() else {
            self.reject_close_and_closed();
            return;
        };
        if abort.was_already_erroring {
            abort.settle(Err(stored));
            self.reject_close_and_closed();
            return;
        }

        let jobs = self.jobs.take();
        self.clear_algorithms();
        let reason = abort.reason.clone();
        self.aborting = Some(abort);
        let dispatched = jobs.is_some_and(|jobs| jobs.unbounded_send(SinkJob::Abort(reason)).is_ok());
        if !dispatched {
            self.finish_abort(Ok(()));
        }
    }

    fn finish_abort(&mut self, result: StreamResult<()>) {
        if let Some(abort) = self.aborting.take() {
            abort.settle(result);
        }
        self.reject_close_and_closed();
    }

    fn reject_close_and_closed(&mut self) {
        if let Some(close) = self.close_request.take() {
            let _ = close.send(Err(self.stored_error()));
        }
        self.closed_wakers.wake_all();
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    fn start_finished(&mut self, result: StreamResult<()>) {
        self.started = true;
        match result {
            Ok(()) => self.advance_queue_if_needed(),
            Err(error) => self.deal_with_rejection(error),
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.in_flight_write_request.is_some() {
            return;
        }
        match self.state {
            WritableState::Closed | WritableState::Errored => return,
            WritableState::Erroring => {
                self.finish_erroring();
                return;
            }
            WritableState::Writable => {}
        }
        match self.queue.peek() {
            None => {}
            Some(WriteRecord::Close) => self.process_close(),
            Some(WriteRecord::Chunk(_)) => self.process_write(),
        }
    }

    fn process_write(&mut self) {
        self.in_flight_write_request = self.write_requests.pop_front();
        let chunk = match self.queue.peek_mut() {
            Some(WriteRecord::Chunk(chunk)) => chunk.take(),
            _ => None,
        };
        let dispatched = match (chunk, &self.jobs) {
            (Some(chunk), Some(jobs)) => jobs.unbounded_send(SinkJob::Write(chunk)).is_ok(),
            _ => false,
        };
        if dispatched {
            trace!("write dispatched to sink");
        } else {
            self.finish_in_flight_write(Err(StreamError::TaskDropped));
        }
    }

    fn process_close(&mut self) {
        self.in_flight_close_request = self.close_request.take();
        self.queue.dequeue_value();
        let jobs = self.jobs.take();
        self.clear_algorithms();
        let dispatched = jobs.is_some_and(|jobs| jobs.unbounded_send(SinkJob::Close).is_ok());
        if dispatched {
            trace!("close dispatched to sink");
        } else {
            self.finish_in_flight_close(Err(StreamError::TaskDropped));
        }
    }

    fn finish_in_flight_write(&mut self, result: StreamResult<()>) {
        let request = self.in_flight_write_request.take();
        match result {
            Ok(()) => {
                if let Some(request) = request {
                    let _ = request.send(Ok(()));
                }
                self.queue.dequeue_value();
                if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
                    self.update_backpressure();
                }
                self.advance_queue_if_needed();
            }
            Err(error) => {
                if let Some(request) = request {
                    let _ = request.send(Err(error.clone()));
                }
                if self.state == WritableState::Writable {
                    self.clear_algorithms();
                }
                // The abort that was waiting on this write reports the write's failure.
                if let Some(abort) = &mut self.pending_abort {
                    if !abort.was_already_erroring {
                        abort.write_failure.get_or_insert_with(|| error.clone());
                    }
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_in_flight_close(&mut self, result: StreamResult<()>) {
        let request = self.in_flight_close_request.take();
        match result {
            Ok(()) => {
                if let Some(request) = request {
                    let _ = request.send(Ok(()));
                }
                if self.state == WritableState::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        abort.settle(Ok(()));
                    }
                }
                debug!("writable stream closed");
                self.state = WritableState::Closed;
                self.ready_wakers.wake_all();
                self.closed_wakers.wake_all();
            }
            Err(error) => {
                if let Some(request) = request {
                    let _ = request.send(Err(error.clone()));
                }
                if let Some(abort) = self.pending_abort.take() {
                    abort.settle(Err(error.clone()));
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn write(&mut self, chunk: T) -> Completion<()> {
        let size = match &self.strategy {
            Some(strategy) => strategy.size(&chunk),
            None => Ok(1.0),
        };
        let size = size.unwrap_or_else(|error| {
            self.error_if_needed(error);
            1.0
        });

        if self.state == WritableState::Errored {
            return Completion::ready(Err(self.stored_error()));
        }
        if self.close_queued_or_in_flight() || self.state == WritableState::Closed {
            return Completion::ready(Err(StreamError::type_error(
                "Cannot write to a stream that is closing or closed",
            )));
        }
        if self.state == WritableState::Erroring {
            return Completion::ready(Err(self.stored_error()));
        }

        let (request, completion) = Completion::channel();
        self.write_requests.push_back(request);
        if let Err(error) = self
            .queue
            .enqueue_value_with_size(WriteRecord::Chunk(Some(chunk)), size)
        {
            self.error_if_needed(error);
            return completion;
        }
        if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
            self.update_backpressure();
        }
        self.advance_queue_if_needed();
        completion
    }

    fn close(&mut self) -> Completion<()> {
        match self.state {
            WritableState::Closed => {
                return Completion::ready(Err(StreamError::type_error(
                    "Cannot close a stream that is already closed",
                )));
            }
            WritableState::Errored | WritableState::Erroring => {
                return Completion::ready(Err(self.stored_error()));
            }
            WritableState::Writable => {}
        }
        if self.close_queued_or_in_flight() {
            return Completion::ready(Err(StreamError::type_error(
                "Cannot close a stream that is already closing",
            )));
        }

        let (request, completion) = Completion::channel();
        self.close_request = Some(request);
        if self.backpressure {
            self.ready_wakers.wake_all();
        }
        let _ = self.queue.enqueue_value_with_size(WriteRecord::Close, 0.0);
        self.advance_queue_if_needed();
        completion
    }

    fn close_with_error_propagation(&mut self) -> Completion<()> {
        if self.close_queued_or_in_flight() || self.state == WritableState::Closed {
            return Completion::ready(Ok(()));
        }
        if self.state == WritableState::Errored {
            return Completion::ready(Err(self.stored_error()));
        }
        self.close()
    }

    fn abort(&mut self, reason: Option<StreamError>) -> Completion<()> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Completion::ready(Ok(()));
        }
        self.abort_controller.abort(reason.clone());

        let (request, completion) = Completion::channel();
        if let Some(pending) = &mut self.pending_abort {
            pending.completions.push(request);
            return completion;
        }

        let was_already_erroring = self.state == WritableState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        self.pending_abort = Some(PendingAbort {
            reason: reason.clone(),
            was_already_erroring,
            write_failure: None,
            completions: vec![request],
        });
        if !was_already_erroring {
            self.start_erroring(reason.unwrap_or(StreamError::Aborted(None)));
        }
        completion
    }

    fn acquire_writer(&mut self) -> StreamResult<u64> {
        if self.writer.is_some() {
            return Err(StreamError::type_error("WritableStream is locked"));
        }
        let id = self.next_writer_id;
        self.next_writer_id += 1;
        self.writer = Some(id);
        trace!(id, "writer acquired");
        Ok(id)
    }

    fn release_writer(&mut self, id: u64) {
        if self.writer != Some(id) {
            return;
        }
        self.writer = None;
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        trace!(id, "writer released");
    }

    fn poll_ready(&mut self, id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if self.writer != Some(id) {
            return Poll::Ready(Err(StreamError::type_error("Writer was released")));
        }
        match self.state {
            WritableState::Writable => {
                if self.backpressure && !self.close_queued_or_in_flight() {
                    self.ready_wakers.register(cx.waker());
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            WritableState::Erroring | WritableState::Errored => Poll::Ready(Err(self.stored_error())),
            WritableState::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_closed(&mut self, id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if self.writer != Some(id) {
            return Poll::Ready(Err(StreamError::type_error("Writer was released")));
        }
        match self.state {
            WritableState::Closed => Poll::Ready(Ok(())),
            WritableState::Errored if self.aborting.is_none() => {
                Poll::Ready(Err(self.stored_error()))
            }
            _ => {
                self.closed_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Type-erased view of a writable stream used by its controller.
pub(crate) trait WritableControl: MaybeSend + MaybeSync {
    fn error_if_needed(&self, error: StreamError);
    fn erroring_error(&self) -> Option<StreamError>;
}

impl<T: MaybeSend + 'static> WritableControl for Mutex<WritableStreamInner<T>> {
    fn error_if_needed(&self, error: StreamError) {
        self.lock().error_if_needed(error);
    }

    fn erroring_error(&self) -> Option<StreamError> {
        let inner = self.lock();
        (inner.state == WritableState::Erroring).then(|| inner.stored_error())
    }
}

// ----------- Controller -----------
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    stream: SharedPtr<dyn WritableControl>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    fn new<T: MaybeSend + 'static>(stream: WritableShared<T>) -> Self {
        let signal = stream.lock().abort_controller.signal();
        Self {
            stream: stream as SharedPtr<dyn WritableControl>,
            signal,
        }
    }

    /// Signal an error on the stream. Ignored unless the stream is still writable.
    pub fn error(&self, error: StreamError) {
        self.stream.error_if_needed(error);
    }

    /// The signal fired when the stream is aborted.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Returns `true` if the stream has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.signal.aborted()
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// Sinks can race this against slow writes so they stop promptly:
    ///
    /// ```no_run
    /// # use whatwg_streams::{StreamError, StreamResult, WritableStreamDefaultController};
    /// # async fn slow_io() {}
    /// async fn write(controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
    ///     tokio::select! {
    ///         _ = controller.abort_future() => Err(StreamError::Aborted(None)),
    ///         _ = slow_io() => Ok(()),
    ///     }
    /// }
    /// ```
    pub fn abort_future(&self) -> impl Future<Output = ()> + MaybeSend + 'static {
        let wait = self.signal.wait();
        async move {
            wait.await;
        }
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns the abort reason as the error.
    pub fn with_abort<F, R>(&self, fut: F) -> impl Future<Output = StreamResult<R>>
    where
        F: Future<Output = R>,
    {
        let wait = self.signal.wait();
        async move {
            match future::select(pin!(fut), pin!(wait)).await {
                Either::Left((value, _)) => Ok(value),
                Either::Right((reason, _)) => Err(reason),
            }
        }
    }

    pub(crate) fn erroring_error(&self) -> Option<StreamError> {
        self.stream.erroring_error()
    }

    pub(crate) fn downgrade(&self) -> WeakPtr<dyn WritableControl> {
        SharedPtr::downgrade(&self.stream)
    }

    pub(crate) fn upgrade(weak: &WeakPtr<dyn WritableControl>, signal: AbortSignal) -> Option<Self> {
        weak.upgrade().map(|stream| Self { stream, signal })
    }
}

// ----------- Main WritableStream -----------
pub struct WritableStream<T: MaybeSend + 'static> {
    inner: WritableShared<T>,
}

impl<T: MaybeSend + 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> WritableStream<T> {
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    pub(crate) fn new_inner<Sink: WritableSink<T>>(
        sink: Sink,
        strategy: BoxedStrategy<T>,
    ) -> StreamResult<(Self, impl Future<Output = ()> + MaybeSend + 'static)> {
        validate_high_water_mark(strategy.high_water_mark())?;
        let (jobs_tx, jobs_rx) = unbounded();
        let inner = SharedPtr::new(Mutex::new(WritableStreamInner::new(strategy, jobs_tx)));
        let task = writable_stream_task(sink, SharedPtr::downgrade(&inner), jobs_rx);
        Ok((Self { inner }, task))
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController {
        WritableStreamDefaultController::new(self.inner.clone())
    }

    pub(crate) fn state(&self) -> WritableState {
        self.inner.lock().state
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    pub fn abort(&self, reason: Option<StreamError>) -> Completion<()> {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            return Completion::ready(Err(StreamError::type_error(
                "Cannot abort a stream that is locked to a writer",
            )));
        }
        inner.abort(reason)
    }

    pub fn close(&self) -> Completion<()> {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            return Completion::ready(Err(StreamError::type_error(
                "Cannot close a stream that is locked to a writer",
            )));
        }
        inner.close()
    }

    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        let id = self.inner.lock().acquire_writer()?;
        Ok(WritableStreamDefaultWriter {
            stream: self.inner.clone(),
            id,
            last_write: None,
            closing: None,
        })
    }
}

// ----------- Stream Task Implementation -----------
async fn writable_stream_task<T, Sink>(
    mut sink: Sink,
    stream: WeakPtr<Mutex<WritableStreamInner<T>>>,
    mut jobs: UnboundedReceiver<SinkJob<T>>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    {
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut controller = WritableStreamDefaultController::new(shared.clone());
        let result = sink.start(&mut controller).await;
        shared.lock().start_finished(result);
    }

    while let Some(job) = jobs.next().await {
        let Some(shared) = stream.upgrade() else {
            break;
        };
        match job {
            SinkJob::Write(chunk) => {
                let mut controller = WritableStreamDefaultController::new(shared.clone());
                let result = sink.write(chunk, &mut controller).await;
                shared.lock().finish_in_flight_write(result);
            }
            SinkJob::Close => {
                let result = sink.close().await;
                shared.lock().finish_in_flight_close(result);
            }
            SinkJob::Abort(reason) => {
                let result = sink.abort(reason).await;
                shared.lock().finish_abort(result);
            }
        }
    }
    trace!("writable stream task finished");
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return the stream and the future that drives its sink.
    pub fn prepare(
        self,
    ) -> StreamResult<(WritableStream<T>, impl Future<Output = ()> + MaybeSend + 'static)> {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

// ----------- Writer -----------
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    stream: WritableShared<T>,
    id: u64,
    // Bookkeeping for the `Sink` impl.
    last_write: Option<Completion<()>>,
    closing: Option<Completion<()>>,
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    /// Resolves once the stream closes. Fails with the stored error after the
    /// stream errors (and any sink abort has settled), or with a type error
    /// once the writer is released.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let stream = self.stream.clone();
        let id = self.id;
        poll_fn(move |cx| stream.lock().poll_closed(id, cx))
    }

    /// Resolves while the stream has room below its high-water mark.
    ///
    /// Pending while backpressure is applied. A queued close counts as ready.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let stream = self.stream.clone();
        let id = self.id;
        poll_fn(move |cx| stream.lock().poll_ready(id, cx))
    }

    /// How much the stream can accept before applying backpressure.
    ///
    /// `None` while erroring or errored, `Some(0.0)` once closed.
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        let stream = self.stream.lock();
        if stream.writer != Some(self.id) {
            return Err(StreamError::type_error("Writer was released"));
        }
        Ok(stream.desired_size())
    }

    /// Queues a chunk and returns a future for that write's outcome.
    ///
    /// The chunk is queued when this is called, whether or not the future is
    /// awaited. Writing without waiting on [`ready()`](Self::ready) lets the
    /// queue grow past the high-water mark.
    pub fn write(&self, chunk: T) -> Completion<()> {
        let mut stream = self.stream.lock();
        if stream.writer != Some(self.id) {
            return Completion::ready(Err(StreamError::type_error("Writer was released")));
        }
        stream.write(chunk)
    }

    pub fn close(&self) -> Completion<()> {
        let mut stream = self.stream.lock();
        if stream.writer != Some(self.id) {
            return Completion::ready(Err(StreamError::type_error("Writer was released")));
        }
        stream.close()
    }

    pub(crate) fn close_with_error_propagation(&self) -> Completion<()> {
        let mut stream = self.stream.lock();
        if stream.writer != Some(self.id) {
            return Completion::ready(Err(StreamError::type_error("Writer was released")));
        }
        stream.close_with_error_propagation()
    }

    pub fn abort(&self, reason: Option<StreamError>) -> Completion<()> {
        let mut stream = self.stream.lock();
        if stream.writer != Some(self.id) {
            return Completion::ready(Err(StreamError::type_error("Writer was released")));
        }
        stream.abort(reason)
    }

    pub fn release_lock(self) -> WritableStream<T> {
        self.stream.lock().release_writer(self.id);
        WritableStream {
            inner: self.stream.clone(),
        }
    }

    pub(crate) fn state(&self) -> WritableState {
        self.stream.lock().state
    }

    pub(crate) fn is_closing_or_closed(&self) -> bool {
        let stream = self.stream.lock();
        stream.close_queued_or_in_flight() || stream.state == WritableState::Closed
    }
}

impl<T: MaybeSend + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.stream.lock().release_writer(self.id);
    }
}

impl<T: MaybeSend + 'static> Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.stream.lock().poll_ready(self.id, cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: T) -> StreamResult<()> {
        let write = self.write(item);
        self.last_write = Some(write);
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        // Writes settle in order, so the newest one finishing means all have.
        let Some(write) = self.last_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = futures::ready!(write.poll_unpin(cx));
        self.last_write = None;
        Poll::Ready(result)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        futures::ready!(self.as_mut().poll_flush(cx))?;
        let mut closing = match self.closing.take() {
            Some(closing) => closing,
            None => self.close(),
        };
        match closing.poll_unpin(cx) {
            Poll::Pending => {
                self.closing = Some(closing);
                Poll::Pending
            }
            Poll::Ready(result) => Poll::Ready(result),
        }
    }
}
