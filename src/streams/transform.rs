use super::{
    CountQueuingStrategy, QueuingStrategy,
    abort_signal::AbortSignal,
    completion::WakerSet,
    error::{StreamError, StreamResult},
    readable::{
        ControllerKind, DefaultSource, ReadableSource, ReadableStream,
        ReadableStreamDefaultController, ReadableStreamInner, StreamState,
    },
    writable::{WritableControl, WritableSink, WritableStream, WritableStreamDefaultController},
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformFuture, SharedPtr, WeakPtr};
use futures::{
    future::{self, poll_fn},
    lock::Mutex as AsyncMutex,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    task::{Context, Poll},
};
use tracing::{debug, trace};

/// Transformer trait
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed, before the readable side closes
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called when the writable side is aborted or the readable side canceled
    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Shared State -----------
struct TransformState<O: MaybeSend + 'static> {
    // Set while the readable side has no room; writes wait for it to clear.
    backpressure: bool,
    backpressure_wakers: WakerSet,
    readable: Option<WeakPtr<Mutex<ReadableStreamInner<O>>>>,
    writable: Option<(WeakPtr<dyn WritableControl>, AbortSignal)>,
}

type TransformShared<O> = SharedPtr<Mutex<TransformState<O>>>;

impl<O: MaybeSend + 'static> TransformState<O> {
    fn new() -> Self {
        Self {
            backpressure: true,
            backpressure_wakers: WakerSet::new(),
            readable: None,
            writable: None,
        }
    }

    fn readable(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.readable
            .as_ref()
            .and_then(ReadableStreamDefaultController::upgrade)
    }

    fn writable(&self) -> Option<WritableStreamDefaultController> {
        let (stream, signal) = self.writable.as_ref()?;
        WritableStreamDefaultController::upgrade(stream, signal.clone())
    }

    fn set_backpressure(&mut self, backpressure: bool) {
        if self.backpressure != backpressure {
            trace!(backpressure, "transform backpressure changed");
            self.backpressure = backpressure;
            self.backpressure_wakers.wake_all();
        }
    }

    fn poll_backpressure_cleared(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.backpressure {
            self.backpressure_wakers.register(cx.waker());
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

fn error_writable_and_unblock_write<O: MaybeSend + 'static>(
    shared: &TransformShared<O>,
    error: StreamError,
) {
    let writable = shared.lock().writable();
    if let Some(writable) = writable {
        writable.error(error);
    }
    shared.lock().set_backpressure(false);
}

fn error_both_sides<O: MaybeSend + 'static>(shared: &TransformShared<O>, error: StreamError) {
    debug!(%error, "transform stream errored");
    let readable = shared.lock().readable();
    if let Some(readable) = readable {
        readable.error(error.clone());
    }
    error_writable_and_unblock_write(shared, error);
}

// ----------- Controller -----------
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    shared: TransformShared<O>,
}

impl<O: MaybeSend + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    /// Enqueue to readable side
    ///
    /// A failed enqueue errors the writable side with the same error. Once
    /// the readable side is full, further writes wait until it is read from.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let readable = self.shared.lock().readable();
        let Some(readable) = readable else {
            return Err(StreamError::type_error("Readable side has been dropped"));
        };
        if let Err(error) = readable.enqueue(chunk) {
            error_writable_and_unblock_write(&self.shared, error.clone());
            return Err(error);
        }
        if readable.has_backpressure() {
            self.shared.lock().set_backpressure(true);
        }
        Ok(())
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        error_both_sides(&self.shared, error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        let readable = self.shared.lock().readable();
        if let Some(readable) = readable {
            let _ = readable.close();
        }
        error_writable_and_unblock_write(
            &self.shared,
            StreamError::type_error("TransformStream terminated"),
        );
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<f64> {
        let readable = self.shared.lock().readable();
        readable.and_then(|readable| readable.desired_size())
    }
}

// ----------- Sides -----------
struct TransformSink<I, O: MaybeSend + 'static, Tr> {
    transformer: SharedPtr<AsyncMutex<Tr>>,
    shared: TransformShared<O>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> TransformSink<I, O, Tr>
where
    O: MaybeSend + 'static,
{
    fn controller(&self) -> TransformStreamDefaultController<O> {
        TransformStreamDefaultController {
            shared: self.shared.clone(),
        }
    }
}

impl<I, O, Tr> WritableSink<I> for TransformSink<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn start(&mut self, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let mut controller = self.controller();
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.start(&mut controller).await
        };
        if let Err(error) = &result {
            error_both_sides(&self.shared, error.clone());
        }
        result
    }

    async fn write(
        &mut self,
        chunk: I,
        controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let shared = self.shared.clone();
        let unblocked = poll_fn(move |cx| shared.lock().poll_backpressure_cleared(cx));
        controller.with_abort(unblocked).await?;
        if let Some(error) = controller.erroring_error() {
            return Err(error);
        }

        let mut transform_controller = self.controller();
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.transform(chunk, &mut transform_controller).await
        };
        if let Err(error) = &result {
            error_both_sides(&self.shared, error.clone());
        }
        result
    }

    async fn close(&mut self) -> StreamResult<()> {
        let mut controller = self.controller();
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.flush(&mut controller).await
        };
        let readable = self.shared.lock().readable();
        let Some(readable) = readable else {
            return result;
        };
        match result {
            Ok(()) => {
                if readable.state() == StreamState::Errored {
                    return Err(readable.stored_error());
                }
                readable.close()
            }
            Err(error) => {
                readable.error(error.clone());
                Err(error)
            }
        }
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.cancel(reason.clone()).await
        };
        let readable = self.shared.lock().readable();
        let Some(readable) = readable else {
            return result;
        };
        match result {
            Ok(()) => {
                if readable.state() == StreamState::Errored {
                    return Err(readable.stored_error());
                }
                readable.error(reason.unwrap_or(StreamError::Aborted(None)));
                Ok(())
            }
            Err(error) => {
                readable.error(error.clone());
                Err(error)
            }
        }
    }
}

struct TransformSource<I, O: MaybeSend + 'static, Tr> {
    transformer: SharedPtr<AsyncMutex<Tr>>,
    shared: TransformShared<O>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, Tr> ReadableSource<O> for TransformSource<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        self.shared.lock().set_backpressure(false);
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let result = {
            let mut transformer = self.transformer.lock().await;
            transformer.cancel(reason.clone()).await
        };
        match result {
            Ok(()) => {
                error_writable_and_unblock_write(
                    &self.shared,
                    reason.unwrap_or(StreamError::Canceled),
                );
                Ok(())
            }
            Err(error) => {
                error_writable_and_unblock_write(&self.shared, error.clone());
                Err(error)
            }
        }
    }
}

// ----------- Main TransformStream -----------
/// TransformStream connecting readable and writable sides
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    pub fn builder<Tr: Transformer<I, O>>(transformer: Tr) -> TransformStreamBuilder<I, O, Tr> {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    /// Get the writable side
    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }

    /// Split into both sides
    pub fn split(self) -> (ReadableStream<O>, WritableStream<I>) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// Builder for a transform stream that passes chunks through unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

// ----------- Builder -----------
pub struct TransformStreamBuilder<I: MaybeSend + 'static, O: MaybeSend + 'static, Tr> {
    transformer: Tr,
    readable_strategy: BoxedStrategy<O>,
    writable_strategy: BoxedStrategy<I>,
}

impl<I, O, Tr> TransformStreamBuilder<I, O, Tr>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Tr: Transformer<I, O>,
{
    pub fn new(transformer: Tr) -> Self {
        Self {
            transformer,
            readable_strategy: Box::new(CountQueuingStrategy::new(0.0)),
            writable_strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn readable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<O> + MaybeSend + MaybeSync + 'static,
    {
        self.readable_strategy = Box::new(strategy);
        self
    }

    pub fn writable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<I> + MaybeSend + MaybeSync + 'static,
    {
        self.writable_strategy = Box::new(strategy);
        self
    }

    /// Return the stream and one future driving both of its sides.
    pub fn prepare(
        self,
    ) -> StreamResult<(TransformStream<I, O>, impl Future<Output = ()> + MaybeSend + 'static)> {
        let transformer = SharedPtr::new(AsyncMutex::new(self.transformer));
        let shared: TransformShared<O> = SharedPtr::new(Mutex::new(TransformState::new()));

        let source = TransformSource {
            transformer: transformer.clone(),
            shared: shared.clone(),
            _input: PhantomData::<fn(I)>,
        };
        let sink = TransformSink {
            transformer,
            shared: shared.clone(),
            _input: PhantomData::<fn(I)>,
        };
        let (readable, readable_task) =
            ReadableStream::new_inner(DefaultSource(source), ControllerKind::Default, self.readable_strategy)?;
        let (writable, writable_task) = WritableStream::new_inner(sink, self.writable_strategy)?;

        {
            let writable_controller = writable.controller();
            let mut state = shared.lock();
            state.readable = Some(readable.controller().downgrade());
            state.writable = Some((writable_controller.downgrade(), writable_controller.signal()));
        }

        let task = async move {
            future::join(readable_task, writable_task).await;
        };
        Ok((TransformStream { readable, writable }, task))
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<TransformStream<I, O>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

/// An identity transformer that passes chunks through unchanged.
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn(T)>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk))
    }
}
