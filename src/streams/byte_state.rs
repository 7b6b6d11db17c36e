use super::{
    ByteLengthQueuingStrategy,
    byte_source_trait::{ByteSource, ReadableByteSource},
    completion::Completion,
    error::{StreamError, StreamResult},
    queue::Queue,
    readable::{
        ByteStream, ControllerKind, ReadRequests, ReadableShared, ReadableStream,
        ReadableStreamBuilder, ReadableStreamDefaultReader, ReadableStreamInner, ReaderSlot,
        StreamState,
    },
};
use crate::platform::{MaybeSend, PlatformFuture};
use futures::{channel::oneshot, future::poll_fn};
use std::{collections::VecDeque, future::Future, marker::PhantomData};
use tracing::trace;

/// Result of a BYOB read: the caller's buffer, truncated to the bytes written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIntoResult {
    pub view: Vec<u8>,
    pub done: bool,
}

pub(crate) struct ReadIntoRequest {
    view: Vec<u8>,
    filled: usize,
    min: usize,
    completion: oneshot::Sender<StreamResult<ReadIntoResult>>,
}

impl ReadIntoRequest {
    /// Copies queued bytes into the view. Returns true once `min` bytes are in.
    fn fill_from(&mut self, queue: &mut Queue<Vec<u8>>) -> bool {
        self.filled += queue.take_bytes(&mut self.view[self.filled..]);
        self.filled >= self.min
    }

    fn resolve(self, done: bool) {
        let mut view = self.view;
        view.truncate(self.filled);
        let _ = self.completion.send(Ok(ReadIntoResult { view, done }));
    }

    pub(crate) fn resolve_done(self) {
        self.resolve(true);
    }

    pub(crate) fn reject(self, error: StreamError) {
        let _ = self.completion.send(Err(error));
    }
}

impl ReadableStreamInner<Vec<u8>> {
    fn enqueue_bytes(&mut self, chunk: Vec<u8>) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "Cannot enqueue bytes into a stream that is closed or closing",
            ));
        }
        if chunk.is_empty() {
            return Err(StreamError::type_error("Cannot enqueue an empty chunk"));
        }
        if let Some(chunk) = self.fulfill_read_request(chunk) {
            let size = chunk.len() as f64;
            self.queue.enqueue_value_with_size(chunk, size)?;
            self.process_read_into_requests();
        }
        self.call_pull_if_needed();
        Ok(())
    }

    /// Fills pending BYOB reads, oldest first, while queued bytes remain.
    fn process_read_into_requests(&mut self) {
        let Some(ReaderSlot {
            requests: ReadRequests::Byob(requests),
            ..
        }) = &mut self.reader
        else {
            return;
        };
        while !self.queue.is_empty() {
            let Some(request) = requests.front_mut() else {
                break;
            };
            if !request.fill_from(&mut self.queue) {
                break;
            }
            if let Some(request) = requests.pop_front() {
                request.resolve(false);
            }
        }
    }

    fn read_into(&mut self, view: Vec<u8>, min: usize) -> Completion<ReadIntoResult> {
        self.mark_disturbed();
        match self.state {
            StreamState::Errored => return Completion::ready(Err(self.stored_error())),
            StreamState::Closed => {
                let mut view = view;
                view.clear();
                return Completion::ready(Ok(ReadIntoResult { view, done: true }));
            }
            StreamState::Readable => {}
        }

        let (completion_tx, completion) = Completion::channel();
        let mut request = ReadIntoRequest {
            view,
            filled: 0,
            min,
            completion: completion_tx,
        };

        let Some(ReaderSlot {
            requests: ReadRequests::Byob(requests),
            ..
        }) = &mut self.reader
        else {
            request.reject(StreamError::type_error("Reader was released"));
            return completion;
        };

        if requests.is_empty() && !self.queue.is_empty() {
            if request.fill_from(&mut self.queue) {
                request.resolve(false);
                self.handle_queue_drain();
                return completion;
            }
            if self.close_requested {
                let error = StreamError::type_error("Insufficient bytes to fill the view before close");
                self.error(error.clone());
                request.reject(error);
                return completion;
            }
        }

        requests.push_back(request);
        self.call_pull_if_needed();
        completion
    }
}

// ----------- Controller -----------
pub struct ReadableByteStreamController {
    stream: ReadableShared<Vec<u8>>,
}

impl Clone for ReadableByteStreamController {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl ReadableByteStreamController {
    pub(crate) fn new(stream: ReadableShared<Vec<u8>>) -> Self {
        Self { stream }
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.stream.lock().desired_size()
    }

    /// Queues bytes. Pending BYOB reads are filled first, oldest first.
    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        self.stream.lock().enqueue_bytes(chunk)
    }

    pub fn close(&self) -> StreamResult<()> {
        self.stream.lock().close();
        Ok(())
    }

    pub fn error(&self, error: StreamError) {
        self.stream.lock().error(error);
    }
}

// ----------- Builder -----------
impl<Source: ReadableByteSource> ReadableStreamBuilder<Vec<u8>, Source, ByteStream> {
    pub fn new_bytes(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(ByteLengthQueuingStrategy::new(0.0)),
            _stream_type: PhantomData,
        }
    }

    /// Byte streams always size chunks by length; only the mark is configurable.
    pub fn high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.strategy = Box::new(ByteLengthQueuingStrategy::new(high_water_mark));
        self
    }

    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<Vec<u8>>,
        impl Future<Output = ()> + MaybeSend + 'static,
    )> {
        ReadableStream::new_inner(ByteSource(self.source), ControllerKind::Byte, self.strategy)
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<Vec<u8>>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderMode {
    #[default]
    Default,
    Byob,
}

pub enum ReadableStreamReader {
    Default(ReadableStreamDefaultReader<Vec<u8>>),
    Byob(ReadableStreamBYOBReader),
}

impl ReadableStream<Vec<u8>> {
    pub fn builder_bytes<Source: ReadableByteSource>(
        source: Source,
    ) -> ReadableStreamBuilder<Vec<u8>, Source, ByteStream> {
        ReadableStreamBuilder::new_bytes(source)
    }

    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader> {
        let mut inner = self.shared().lock();
        if inner.kind != ControllerKind::Byte {
            return Err(StreamError::type_error(
                "BYOB readers require a byte stream",
            ));
        }
        let id = inner.acquire_reader(ReadRequests::Byob(VecDeque::new()))?;
        Ok(ReadableStreamBYOBReader {
            stream: self.shared().clone(),
            id,
        })
    }

    pub fn get_reader_with_mode(&self, mode: ReaderMode) -> StreamResult<ReadableStreamReader> {
        match mode {
            ReaderMode::Default => self.get_reader().map(ReadableStreamReader::Default),
            ReaderMode::Byob => self.get_byob_reader().map(ReadableStreamReader::Byob),
        }
    }
}

// ----------- BYOB Reader -----------
pub struct ReadableStreamBYOBReader {
    stream: ReadableShared<Vec<u8>>,
    id: u64,
}

impl ReadableStreamBYOBReader {
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + MaybeSend + 'static {
        let stream = self.stream.clone();
        let id = self.id;
        poll_fn(move |cx| stream.lock().poll_closed(id, cx))
    }

    /// Reads into `view`, resolving as soon as at least one byte is available.
    pub fn read(&self, view: Vec<u8>) -> Completion<ReadIntoResult> {
        self.read_with_min(view, 1)
    }

    /// Reads into `view`, waiting until `min` bytes are filled unless the
    /// stream closes first.
    pub fn read_with_min(&self, view: Vec<u8>, min: usize) -> Completion<ReadIntoResult> {
        if view.is_empty() {
            return Completion::ready(Err(StreamError::type_error(
                "BYOB read view must not be empty",
            )));
        }
        if min == 0 {
            return Completion::ready(Err(StreamError::type_error(
                "min must be greater than zero",
            )));
        }
        if min > view.len() {
            return Completion::ready(Err(StreamError::range_error(format!(
                "min ({}) exceeds the view length ({})",
                min,
                view.len()
            ))));
        }
        let mut stream = self.stream.lock();
        if !stream.is_current_reader(self.id) {
            return Completion::ready(Err(StreamError::type_error("Reader was released")));
        }
        trace!(len = view.len(), min, "byob read");
        stream.read_into(view, min)
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Completion<()> {
        let mut stream = self.stream.lock();
        if !stream.is_current_reader(self.id) {
            return Completion::ready(Err(StreamError::type_error("Reader was released")));
        }
        stream.cancel(reason)
    }

    pub fn release_lock(self) -> ReadableStream<Vec<u8>> {
        self.stream.lock().release_reader(self.id);
        ReadableStream::from_shared(self.stream.clone())
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        self.stream.lock().release_reader(self.id);
    }
}
