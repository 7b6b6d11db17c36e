use super::{
    abort_signal::AbortSignal,
    completion::Completion,
    error::{StreamError, StreamResult},
    readable::{ReadableStream, ReadableStreamDefaultReader, StreamState},
    transform::TransformStream,
    writable::{WritableState, WritableStream, WritableStreamDefaultWriter},
};
use crate::platform::{MaybeSend, PlatformFuture};
use futures::{
    FutureExt,
    future::{self, Either},
    select_biased,
};
use std::future::Future;
use tracing::debug;

#[derive(Clone, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Stops the pipe when fired, aborting and canceling per the flags above.
    pub signal: Option<AbortSignal>,
}

/// What to do to the other side before the pipe settles.
#[derive(Debug)]
enum ShutdownAction {
    AbortDestination(StreamError),
    CancelSource(StreamError),
    CloseDestination,
    AbortSignal(StreamError),
}

#[derive(Debug)]
struct Shutdown {
    action: Option<ShutdownAction>,
    error: Option<StreamError>,
}

impl Shutdown {
    fn with_action(action: ShutdownAction, error: Option<StreamError>) -> Self {
        Self {
            action: Some(action),
            error,
        }
    }

    fn without_action(error: Option<StreamError>) -> Self {
        Self {
            action: None,
            error,
        }
    }
}

/// Locks both streams now and returns the future that drives the pipe.
pub(crate) fn pipe_to<T: MaybeSend + 'static>(
    source: &ReadableStream<T>,
    destination: &WritableStream<T>,
    options: StreamPipeOptions,
) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static + use<T> {
    let locked = acquire_locks(source, destination);
    async move {
        let (reader, writer) = locked?;
        PipeOperation {
            reader,
            writer,
            options,
            pending_write: None,
        }
        .run()
        .await
    }
}

fn acquire_locks<T: MaybeSend + 'static>(
    source: &ReadableStream<T>,
    destination: &WritableStream<T>,
) -> StreamResult<(ReadableStreamDefaultReader<T>, WritableStreamDefaultWriter<T>)> {
    if source.locked() {
        return Err(StreamError::type_error("Cannot pipe a locked ReadableStream"));
    }
    if destination.locked() {
        return Err(StreamError::type_error("Cannot pipe to a locked WritableStream"));
    }
    let reader = source.get_reader()?;
    let writer = destination.get_writer()?;
    source.shared().lock().mark_disturbed();
    Ok((reader, writer))
}

struct PipeOperation<T: MaybeSend + 'static> {
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    options: StreamPipeOptions,
    // Writes settle in order, so the newest one stands for all of them.
    pending_write: Option<Completion<()>>,
}

impl<T: MaybeSend + 'static> PipeOperation<T> {
    async fn run(mut self) -> StreamResult<()> {
        let shutdown = self.pump().await;
        debug!(?shutdown, "pipe shutting down");
        self.shutdown(shutdown).await
    }

    fn signal_wait(&self) -> impl Future<Output = StreamError> + MaybeSend + 'static {
        match &self.options.signal {
            Some(signal) => Either::Left(signal.wait()),
            None => Either::Right(future::pending::<StreamError>()),
        }
    }

    /// Checks both ends in priority order: errors forward, errors backward,
    /// closing forward, closing backward.
    fn check_ends(&self) -> Option<Shutdown> {
        let source = self.reader.closed().now_or_never();
        let destination = self.writer.closed().now_or_never();
        let options = &self.options;

        if let Some(Err(error)) = source {
            return Some(if options.prevent_abort {
                Shutdown::without_action(Some(error))
            } else {
                Shutdown::with_action(ShutdownAction::AbortDestination(error.clone()), Some(error))
            });
        }
        if let Some(Err(error)) = destination {
            return Some(if options.prevent_cancel {
                Shutdown::without_action(Some(error))
            } else {
                Shutdown::with_action(ShutdownAction::CancelSource(error.clone()), Some(error))
            });
        }
        if let Some(Ok(())) = source {
            return Some(if options.prevent_close {
                Shutdown::without_action(None)
            } else {
                Shutdown::with_action(ShutdownAction::CloseDestination, None)
            });
        }
        if self.writer.is_closing_or_closed() {
            let error = StreamError::type_error("The destination stream is closing or closed");
            return Some(if options.prevent_cancel {
                Shutdown::without_action(Some(error))
            } else {
                Shutdown::with_action(ShutdownAction::CancelSource(error.clone()), Some(error))
            });
        }
        None
    }

    async fn pump(&mut self) -> Shutdown {
        if let Some(reason) = self.options.signal.as_ref().and_then(AbortSignal::reason) {
            return Shutdown::with_action(ShutdownAction::AbortSignal(reason.clone()), Some(reason));
        }

        // Set once the destination rejects `ready`; from then on only its
        // `closed` signal can move the pipe forward.
        let mut destination_failing = false;
        loop {
            if let Some(shutdown) = self.check_ends() {
                return shutdown;
            }

            let signal = self.signal_wait();
            let source_closed = self.reader.closed();
            let destination_closed = self.writer.closed();
            let ready = if destination_failing {
                Either::Left(future::pending::<StreamResult<()>>())
            } else {
                Either::Right(self.writer.ready())
            };
            select_biased! {
                reason = signal.fuse() => {
                    return Shutdown::with_action(ShutdownAction::AbortSignal(reason.clone()), Some(reason));
                }
                _ = source_closed.fuse() => continue,
                _ = destination_closed.fuse() => continue,
                ready_result = ready.fuse() => {
                    if ready_result.is_err() {
                        destination_failing = true;
                        continue;
                    }
                }
            }

            let signal = self.signal_wait();
            let destination_closed = self.writer.closed();
            let read = self.reader.read();
            select_biased! {
                reason = signal.fuse() => {
                    return Shutdown::with_action(ShutdownAction::AbortSignal(reason.clone()), Some(reason));
                }
                _ = destination_closed.fuse() => continue,
                chunk = read.fuse() => {
                    if let Ok(Some(chunk)) = chunk {
                        self.pending_write = Some(self.writer.write(chunk));
                    }
                    // `Ok(None)` and errors show up in the source's `closed` signal.
                }
            }
        }
    }

    async fn shutdown(mut self, shutdown: Shutdown) -> StreamResult<()> {
        if self.writer.state() == WritableState::Writable && !self.writer.is_closing_or_closed() {
            if let Some(write) = self.pending_write.take() {
                let _ = write.await;
            }
        }

        let result = match shutdown.action {
            None => Ok(()),
            Some(ShutdownAction::AbortDestination(error)) => self.writer.abort(Some(error)).await,
            Some(ShutdownAction::CancelSource(error)) => self.reader.cancel(Some(error)).await,
            Some(ShutdownAction::CloseDestination) => {
                self.writer.close_with_error_propagation().await
            }
            Some(ShutdownAction::AbortSignal(reason)) => {
                let abort = if !self.options.prevent_abort
                    && self.writer.state() == WritableState::Writable
                {
                    Either::Left(self.writer.abort(Some(reason.clone())))
                } else {
                    Either::Right(future::ready(Ok(())))
                };
                let cancel = if !self.options.prevent_cancel
                    && self.reader_state() == StreamState::Readable
                {
                    Either::Left(self.reader.cancel(Some(reason)))
                } else {
                    Either::Right(future::ready(Ok(())))
                };
                let (aborted, canceled) = future::join(abort, cancel).await;
                aborted.and(canceled)
            }
        };

        self.finalize(result.and_then(|()| shutdown.error.map_or(Ok(()), Err)))
    }

    fn reader_state(&self) -> StreamState {
        match self.reader.closed().now_or_never() {
            None => StreamState::Readable,
            Some(Ok(())) => StreamState::Closed,
            Some(Err(_)) => StreamState::Errored,
        }
    }

    fn finalize(self, result: StreamResult<()>) -> StreamResult<()> {
        let Self { reader, writer, .. } = self;
        writer.release_lock();
        reader.release_lock();
        debug!(ok = result.is_ok(), "pipe finished");
        result
    }
}

// ----------- pipeThrough -----------
pub struct PipeBuilder<T: MaybeSend + 'static, O: MaybeSend + 'static> {
    source: ReadableStream<T>,
    readable: ReadableStream<O>,
    writable: WritableStream<T>,
    options: StreamPipeOptions,
}

impl<T: MaybeSend + 'static, O: MaybeSend + 'static> PipeBuilder<T, O> {
    pub fn new(
        source: ReadableStream<T>,
        transform: &TransformStream<T, O>,
        options: StreamPipeOptions,
    ) -> Self {
        Self {
            source,
            readable: transform.readable(),
            writable: transform.writable(),
            options,
        }
    }

    /// Prepare without spawning: returns the readable and the unspawned pipe future
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<O>,
        impl Future<Output = StreamResult<()>> + MaybeSend + 'static,
    ) {
        let pipe = pipe_to(&self.source, &self.writable, self.options);
        (self.readable, pipe)
    }

    /// Spawn the pipeline with an owned spawner closure
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (readable, pipe) = self.prepare();
        spawn_fn(Box::pin(async move {
            if let Err(error) = pipe.await {
                debug!(%error, "pipe through failed");
            }
        }));
        readable
    }
}
