use super::{
    CountQueuingStrategy, QueuingStrategy,
    byte_state::ReadIntoRequest,
    completion::{Completion, WakerSet},
    error::{StreamError, StreamResult},
    pipe::{PipeBuilder, StreamPipeOptions, pipe_to},
    queue::Queue,
    tee::TeeBuilder,
    transform::TransformStream,
    validate_high_water_mark,
    writable::WritableStream,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr, WeakPtr};
use futures::{
    FutureExt, StreamExt,
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, Either, poll_fn},
    stream::Stream,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::{Pin, pin},
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

/// Marker for streams driven by a [`ReadableSource`].
pub struct DefaultStream;
/// Marker for byte streams driven by a [`ReadableByteSource`](super::ReadableByteSource).
pub struct ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControllerKind {
    Default,
    Byte,
}

pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

/// Algorithms the stream driver runs, independent of the controller flavour.
pub(crate) trait UnderlyingSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    type Controller: MaybeSend;

    fn controller(stream: ReadableShared<T>) -> Self::Controller;

    fn start(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn pull(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;
}

pub(crate) struct DefaultSource<S>(pub(crate) S);

impl<T, S> UnderlyingSource<T> for DefaultSource<S>
where
    T: MaybeSend + 'static,
    S: ReadableSource<T>,
{
    type Controller = ReadableStreamDefaultController<T>;

    fn controller(stream: ReadableShared<T>) -> Self::Controller {
        ReadableStreamDefaultController::new(stream)
    }

    fn start(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.start(controller)
    }

    fn pull(
        &mut self,
        controller: &mut Self::Controller,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.pull(controller)
    }

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.0.cancel(reason)
    }
}

// ----------- Inner State -----------
pub(crate) type ReadableShared<T> = SharedPtr<Mutex<ReadableStreamInner<T>>>;

pub(crate) type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;

pub(crate) enum ReadRequests<T> {
    Default(VecDeque<ReadRequest<T>>),
    Byob(VecDeque<ReadIntoRequest>),
}

pub(crate) struct ReaderSlot<T> {
    pub(crate) id: u64,
    pub(crate) requests: ReadRequests<T>,
}

pub(crate) enum SourceJob {
    Pull,
    Cancel {
        reason: Option<StreamError>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
}

pub(crate) struct ReadableStreamInner<T> {
    pub(crate) state: StreamState,
    stored_error: Option<StreamError>,
    disturbed: bool,
    pub(crate) reader: Option<ReaderSlot<T>>,
    next_reader_id: u64,
    pub(crate) kind: ControllerKind,
    pub(crate) queue: Queue<T>,
    strategy: Option<BoxedStrategy<T>>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    pub(crate) close_requested: bool,
    cancel_requested: bool,
    // `None` once the source algorithms have been cleared.
    jobs: Option<UnboundedSender<SourceJob>>,
    closed_wakers: WakerSet,
    cancel_wakers: WakerSet,
}

impl<T> ReadableStreamInner<T> {
    fn new(kind: ControllerKind, strategy: BoxedStrategy<T>, jobs: UnboundedSender<SourceJob>) -> Self {
        Self {
            state: StreamState::Readable,
            stored_error: None,
            disturbed: false,
            reader: None,
            next_reader_id: 0,
            kind,
            queue: Queue::new(strategy.high_water_mark()),
            strategy: Some(strategy),
            started: false,
            pulling: false,
            pull_again: false,
            close_requested: false,
            cancel_requested: false,
            jobs: Some(jobs),
            closed_wakers: WakerSet::new(),
            cancel_wakers: WakerSet::new(),
        }
    }

    pub(crate) fn locked(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn is_current_reader(&self, id: u64) -> bool {
        self.reader.as_ref().map(|reader| reader.id) == Some(id)
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("Stream is errored"))
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == StreamState::Readable
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0.0),
            StreamState::Readable => Some(self.queue.desired_size()),
        }
    }

    fn pending_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReadRequests::Default(requests),
                ..
            }) => requests.len(),
            Some(ReaderSlot {
                requests: ReadRequests::Byob(requests),
                ..
            }) => requests.len(),
            None => 0,
        }
    }

    fn should_call_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        self.pending_requests() > 0 || self.queue.desired_size() > 0.0
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        !self.should_call_pull()
    }

    pub(crate) fn call_pull_if_needed(&mut self) {
        if !self.should_call_pull() {
            return;
        }
        if self.pulling {
            self.pull_again = true;
            return;
        }
        let Some(jobs) = &self.jobs else {
            return;
        };
        trace!("scheduling pull");
        self.pulling = jobs.unbounded_send(SourceJob::Pull).is_ok();
    }

    fn start_finished(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.started = true;
                self.call_pull_if_needed();
            }
            Err(e) => self.error(e),
        }
    }

    fn pull_finished(&mut self, result: StreamResult<()>) {
        self.pulling = false;
        match result {
            Ok(()) => {
                if self.pull_again {
                    self.pull_again = false;
                    self.call_pull_if_needed();
                }
            }
            Err(e) => self.error(e),
        }
    }

    fn clear_algorithms(&mut self) {
        self.jobs = None;
        self.strategy = None;
    }

    /// Errors the stream unless it already left the readable state.
    pub(crate) fn error(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        self.queue.reset();
        self.clear_algorithms();
        self.error_stream(error);
    }

    fn error_stream(&mut self, error: StreamError) {
        debug!(%error, "readable stream errored");
        self.state = StreamState::Errored;
        self.stored_error = Some(error.clone());
        if let Some(reader) = &mut self.reader {
            match &mut reader.requests {
                ReadRequests::Default(requests) => {
                    for request in requests.drain(..) {
                        let _ = request.send(Err(error.clone()));
                    }
                }
                ReadRequests::Byob(requests) => {
                    for request in requests.drain(..) {
                        request.reject(error.clone());
                    }
                }
            }
        }
        self.closed_wakers.wake_all();
    }

    pub(crate) fn close_stream(&mut self) {
        debug!("readable stream closed");
        self.state = StreamState::Closed;
        if let Some(reader) = &mut self.reader {
            match &mut reader.requests {
                ReadRequests::Default(requests) => {
                    for request in requests.drain(..) {
                        let _ = request.send(Ok(None));
                    }
                }
                ReadRequests::Byob(requests) => {
                    for request in requests.drain(..) {
                        request.resolve_done();
                    }
                }
            }
        }
        self.closed_wakers.wake_all();
    }

    /// Hands `chunk` to the oldest live read request, or gives it back if none is waiting.
    pub(crate) fn fulfill_read_request(&mut self, chunk: T) -> Option<T> {
        let Some(ReaderSlot {
            requests: ReadRequests::Default(requests),
            ..
        }) = &mut self.reader
        else {
            return Some(chunk);
        };
        while let Some(request) = requests.pop_front() {
            if request.is_canceled() {
                continue;
            }
            let _ = request.send(Ok(Some(chunk)));
            return None;
        }
        Some(chunk)
    }

    pub(crate) fn enqueue(&mut self, chunk: T) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "Cannot enqueue a chunk into a stream that is closed or closing",
            ));
        }
        if let Some(chunk) = self.fulfill_read_request(chunk) {
            let size = match &self.strategy {
                Some(strategy) => strategy.size(&chunk),
                None => Ok(1.0),
            };
            let queued = size.and_then(|size| self.queue.enqueue_value_with_size(chunk, size));
            if let Err(e) = queued {
                self.error(e.clone());
                return Err(e);
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if !self.can_close_or_enqueue() {
            return;
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            self.clear_algorithms();
            self.close_stream();
        }
    }

    pub(crate) fn handle_queue_drain(&mut self) {
        if self.close_requested && self.queue.is_empty() {
            self.clear_algorithms();
            self.close_stream();
        } else {
            self.call_pull_if_needed();
        }
    }

    pub(crate) fn mark_disturbed(&mut self) {
        self.disturbed = true;
    }

    fn read(&mut self) -> Completion<Option<T>> {
        self.disturbed = true;
        match self.state {
            StreamState::Closed => return Completion::ready(Ok(None)),
            StreamState::Errored => return Completion::ready(Err(self.stored_error())),
            StreamState::Readable => {}
        }
        if let Some(chunk) = self.queue.dequeue_value() {
            self.handle_queue_drain();
            return Completion::ready(Ok(Some(chunk)));
        }
        let (tx, completion) = Completion::channel();
        if let Some(ReaderSlot {
            requests: ReadRequests::Default(requests),
            ..
        }) = &mut self.reader
        {
            requests.push_back(tx);
        }
        self.call_pull_if_needed();
        completion
    }

    pub(crate) fn cancel(&mut self, reason: Option<StreamError>) -> Completion<()> {
        self.disturbed = true;
        match self.state {
            StreamState::Closed => return Completion::ready(Ok(())),
            StreamState::Errored => return Completion::ready(Err(self.stored_error())),
            StreamState::Readable => {}
        }
        debug!(reason = ?reason, "readable stream canceled");
        self.close_stream();
        self.queue.reset();
        self.cancel_requested = true;
        self.cancel_wakers.wake_all();
        let jobs = self.jobs.take();
        self.clear_algorithms();
        match jobs {
            Some(jobs) => {
                let (completion_tx, completion) = Completion::channel();
                let _ = jobs.unbounded_send(SourceJob::Cancel {
                    reason,
                    completion: completion_tx,
                });
                completion
            }
            None => Completion::ready(Ok(())),
        }
    }

    pub(crate) fn acquire_reader(&mut self, requests: ReadRequests<T>) -> StreamResult<u64> {
        if self.locked() {
            return Err(StreamError::type_error("ReadableStream is locked"));
        }
        let id = self.next_reader_id;
        self.next_reader_id += 1;
        self.reader = Some(ReaderSlot { id, requests });
        trace!(id, "reader acquired");
        Ok(id)
    }

    pub(crate) fn release_reader(&mut self, id: u64) {
        if !self.is_current_reader(id) {
            return;
        }
        let Some(reader) = self.reader.take() else {
            return;
        };
        let released = || StreamError::type_error("Reader was released");
        match reader.requests {
            ReadRequests::Default(requests) => {
                for request in requests {
                    let _ = request.send(Err(released()));
                }
            }
            ReadRequests::Byob(requests) => {
                for request in requests {
                    request.reject(released());
                }
            }
        }
        self.closed_wakers.wake_all();
        trace!(id, "reader released");
    }

    pub(crate) fn poll_closed(&mut self, id: u64, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if !self.is_current_reader(id) {
            return Poll::Ready(Err(StreamError::type_error("Reader was released")));
        }
        match self.state {
            StreamState::Readable => {
                self.closed_wakers.register(cx.waker());
                Poll::Pending
            }
            StreamState::Closed => Poll::Ready(Ok(())),
            StreamState::Errored => Poll::Ready(Err(self.stored_error())),
        }
    }

    fn poll_cancel_requested(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.cancel_requested {
            Poll::Ready(())
        } else {
            self.cancel_wakers.register(cx.waker());
            Poll::Pending
        }
    }
}

// ----------- Controller -----------
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    stream: ReadableShared<T>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(stream: ReadableShared<T>) -> Self {
        Self { stream }
    }

    /// `None` once the stream has errored, `0` once it is closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.stream.lock().desired_size()
    }

    /// Queues a chunk, or hands it straight to a waiting read.
    ///
    /// Fails if the stream is closing or no longer readable. A sizing failure
    /// errors the stream and is returned here as well.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.stream.lock().enqueue(chunk)
    }

    /// Requests close. Queued chunks are still delivered; a stream that can no
    /// longer close is left alone.
    pub fn close(&self) -> StreamResult<()> {
        self.stream.lock().close();
        Ok(())
    }

    pub fn error(&self, error: StreamError) {
        self.stream.lock().error(error);
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.stream.lock().can_close_or_enqueue()
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.stream.lock().has_backpressure()
    }

    pub(crate) fn state(&self) -> StreamState {
        self.stream.lock().state
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stream.lock().stored_error()
    }

    pub(crate) fn downgrade(&self) -> WeakPtr<Mutex<ReadableStreamInner<T>>> {
        SharedPtr::downgrade(&self.stream)
    }

    pub(crate) fn upgrade(weak: &WeakPtr<Mutex<ReadableStreamInner<T>>>) -> Option<Self> {
        weak.upgrade().map(Self::new)
    }
}

// ----------- Main ReadableStream -----------
pub struct ReadableStream<T: MaybeSend + 'static> {
    inner: ReadableShared<T>,
}

#[cfg(test)]
impl<T: MaybeSend + 'static> std::fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStream").finish_non_exhaustive()
    }
}

impl<T: MaybeSend + 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStream<T> {
    pub fn builder<Source: ReadableSource<T>>(
        source: Source,
    ) -> ReadableStreamBuilder<T, Source, DefaultStream> {
        ReadableStreamBuilder::new(source)
    }

    pub fn from_vec(vec: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        Self::from_iterator(vec)
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I::IntoIter>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(IteratorSource {
            iter: iter.into_iter(),
        })
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        ReadableStreamBuilder::new(AsyncStreamSource { stream })
    }

    pub(crate) fn new_inner<S>(
        source: S,
        kind: ControllerKind,
        strategy: BoxedStrategy<T>,
    ) -> StreamResult<(Self, impl Future<Output = ()> + MaybeSend + 'static)>
    where
        S: UnderlyingSource<T>,
    {
        validate_high_water_mark(strategy.high_water_mark())?;
        let (jobs_tx, jobs_rx) = unbounded();
        let inner = SharedPtr::new(Mutex::new(ReadableStreamInner::new(kind, strategy, jobs_tx)));
        let task = readable_stream_task(source, SharedPtr::downgrade(&inner), jobs_rx);
        Ok((Self { inner }, task))
    }

    pub(crate) fn from_shared(inner: ReadableShared<T>) -> Self {
        Self { inner }
    }

    pub(crate) fn shared(&self) -> &ReadableShared<T> {
        &self.inner
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController::new(self.inner.clone())
    }

    pub(crate) fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().locked()
    }

    /// Whether anything has ever been read from or canceled on this stream.
    pub fn is_disturbed(&self) -> bool {
        self.inner.lock().disturbed
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        let mut inner = self.inner.lock();
        if inner.locked() {
            return Completion::ready(Err(StreamError::type_error(
                "Cannot cancel a stream that is locked to a reader",
            )));
        }
        inner.cancel(reason)
    }

    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        let id = self
            .inner
            .lock()
            .acquire_reader(ReadRequests::Default(VecDeque::new()))?;
        Ok(ReadableStreamDefaultReader {
            stream: self.inner.clone(),
            id,
            pending_read: None,
        })
    }

    /// Pipes every chunk into `destination`. Both streams are locked before
    /// this returns, so a locked stream fails right away.
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T>,
        options: Option<StreamPipeOptions>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        pipe_to(self, destination, options.unwrap_or_default())
    }

    pub fn pipe_through<O: MaybeSend + 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> PipeBuilder<T, O> {
        PipeBuilder::new(self.clone(), transform, options.unwrap_or_default())
    }

    /// Reads the stream to completion.
    pub fn collect_all(&self) -> impl Future<Output = StreamResult<Vec<T>>> + MaybeSend + 'static {
        let reader = self.get_reader();
        async move {
            let reader = reader?;
            let mut chunks = Vec::new();
            while let Some(chunk) = reader.read().await? {
                chunks.push(chunk);
            }
            Ok(chunks)
        }
    }
}

impl<T: MaybeSend + Clone + 'static> ReadableStream<T> {
    pub fn tee(&self) -> TeeBuilder<T> {
        TeeBuilder::new(self.clone())
    }
}

// ----------- Stream Task Implementation -----------
async fn readable_stream_task<T, S>(
    mut source: S,
    stream: WeakPtr<Mutex<ReadableStreamInner<T>>>,
    mut jobs: UnboundedReceiver<SourceJob>,
) where
    T: MaybeSend + 'static,
    S: UnderlyingSource<T>,
{
    {
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut controller = S::controller(shared.clone());
        let result = source.start(&mut controller).await;
        shared.lock().start_finished(result);
    }

    while let Some(job) = jobs.next().await {
        match job {
            SourceJob::Pull => {
                let Some(shared) = stream.upgrade() else {
                    break;
                };
                let mut controller = S::controller(shared.clone());
                let canceled = {
                    let shared = shared.clone();
                    poll_fn(move |cx| shared.lock().poll_cancel_requested(cx))
                };
                let result = {
                    let pull = pin!(source.pull(&mut controller));
                    match future::select(pull, canceled).await {
                        Either::Left((result, _)) => result,
                        // The pull is dropped; cancel runs next.
                        Either::Right(((), _)) => Ok(()),
                    }
                };
                shared.lock().pull_finished(result);
            }
            SourceJob::Cancel { reason, completion } => {
                let result = source.cancel(reason).await;
                let _ = completion.send(result);
            }
        }
    }
    trace!("readable stream task finished");
}

// ----------- Builder -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source, StreamType = DefaultStream> {
    pub(crate) source: Source,
    pub(crate) strategy: BoxedStrategy<T>,
    pub(crate) _stream_type: PhantomData<StreamType>,
}

impl<T, Source> ReadableStreamBuilder<T, Source, DefaultStream>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    pub fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
            _stream_type: PhantomData,
        }
    }

    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return the stream and the future that drives its source.
    ///
    /// Fails with a range error if the strategy's high-water mark is NaN or negative.
    pub fn prepare(
        self,
    ) -> StreamResult<(ReadableStream<T>, impl Future<Output = ()> + MaybeSend + 'static)> {
        ReadableStream::new_inner(DefaultSource(self.source), ControllerKind::Default, self.strategy)
    }

    /// Spawn the source driver with the given spawner
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

// ----------- Built-in sources -----------
pub struct IteratorSource<I: MaybeSend + 'static> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    T: MaybeSend + 'static,
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S: MaybeSend + 'static> {
    stream: S,
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    T: MaybeSend + 'static,
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

// ----------- Default Reader -----------
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static> {
    stream: ReadableShared<T>,
    id: u64,
    pending_read: Option<Completion<Option<T>>>,
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultReader<T> {
    /// Resolves when the stream closes, fails with the stored error once it
    /// errors, and fails with a type error after the lock is released.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let stream = self.stream.clone();
        let id = self.id;
        poll_fn(move |cx| stream.lock().poll_closed(id, cx))
    }

    /// Resolves with `Some(chunk)`, or `None` once the stream is closed.
    pub fn read(&self) -> Completion<Option<T>> {
        let mut stream = self.stream.lock();
        if !stream.is_current_reader(self.id) {
            return Completion::ready(Err(StreamError::type_error("Reader was released")));
        }
        stream.read()
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        let mut stream = self.stream.lock();
        if !stream.is_current_reader(self.id) {
            return Completion::ready(Err(StreamError::type_error("Reader was released")));
        }
        stream.cancel(reason)
    }

    /// Unlocks the stream. Reads still pending fail with a type error.
    pub fn release_lock(self) -> ReadableStream<T> {
        self.stream.lock().release_reader(self.id);
        ReadableStream::from_shared(self.stream.clone())
    }
}

impl<T: MaybeSend + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.stream.lock().release_reader(self.id);
    }
}

impl<T: MaybeSend + 'static> Stream for ReadableStreamDefaultReader<T> {
    type Item = StreamResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut read = match self.pending_read.take() {
            Some(read) => read,
            None => self.read(),
        };
        match read.poll_unpin(cx) {
            Poll::Pending => {
                self.pending_read = Some(read);
                Poll::Pending
            }
            Poll::Ready(Ok(Some(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
        }
    }
}
