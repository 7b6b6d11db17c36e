//! Cross-module behavior: locking, backpressure, close draining, terminal
//! operations, tee, pipe propagation and the writable erroring protocol.
#![cfg(feature = "send")]

use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::{sync::Notify, time::timeout};
use whatwg_streams::{
    ReadableSource, ReadableStream, ReadableStreamDefaultController, SizeFnStrategy, StreamError,
    StreamPipeOptions, StreamResult, WritableSink, WritableStream,
    WritableStreamDefaultController,
};

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;

struct PushSource {
    controller: Slot<ReadableStreamDefaultController<Vec<u8>>>,
    pulls: Arc<AtomicUsize>,
}

impl ReadableSource<Vec<u8>> for PushSource {
    async fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<Vec<u8>>,
    ) -> StreamResult<()> {
        *self.controller.lock() = Some(controller.clone());
        Ok(())
    }

    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<Vec<u8>>,
    ) -> StreamResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn push_stream(
    high_water_mark: f64,
) -> (
    ReadableStream<Vec<u8>>,
    ReadableStreamDefaultController<Vec<u8>>,
    Arc<AtomicUsize>,
) {
    let slot = Arc::new(Mutex::new(None));
    let pulls = Arc::new(AtomicUsize::new(0));
    let stream = ReadableStream::builder(PushSource {
        controller: slot.clone(),
        pulls: pulls.clone(),
    })
    .strategy(SizeFnStrategy::new(high_water_mark, |chunk: &Vec<u8>| {
        Ok(chunk.len() as f64)
    }))
    .spawn(tokio::spawn)
    .unwrap();
    settle().await;
    let controller = slot.lock().clone().unwrap();
    (stream, controller, pulls)
}

struct NullSink;

impl WritableSink<u32> for NullSink {
    async fn write(&mut self, _chunk: u32, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn locks_are_exclusive_until_released() {
    let readable = ReadableStream::from_vec(vec![1u32]).spawn(tokio::spawn).unwrap();
    let reader = readable.get_reader().unwrap();
    assert!(readable.locked());
    assert!(matches!(readable.get_reader(), Err(StreamError::Type(_))));
    let readable = reader.release_lock();
    assert!(!readable.locked());
    assert_eq!(readable.collect_all().await.unwrap(), vec![1]);

    let writable = WritableStream::builder(NullSink).spawn(tokio::spawn).unwrap();
    let writer = writable.get_writer().unwrap();
    assert!(writable.locked());
    assert!(matches!(writable.get_writer(), Err(StreamError::Type(_))));
    drop(writer);
    assert!(!writable.locked());
    let writer = writable.get_writer().unwrap();
    writer.write(1).await.unwrap();
}

#[tokio::test]
async fn desired_size_tracks_queued_sizes_and_gates_pulls() {
    let (stream, controller, pulls) = push_stream(10.0).await;
    assert_eq!(controller.desired_size(), Some(10.0));

    controller.enqueue(vec![0; 4]).unwrap();
    assert_eq!(controller.desired_size(), Some(6.0));
    controller.enqueue(vec![0; 6]).unwrap();
    assert_eq!(controller.desired_size(), Some(0.0));
    settle().await;

    let before = pulls.load(Ordering::SeqCst);
    controller.enqueue(vec![0; 2]).unwrap();
    assert_eq!(controller.desired_size(), Some(-2.0));
    settle().await;
    assert_eq!(pulls.load(Ordering::SeqCst), before, "no pull while desired size <= 0");

    let reader = stream.get_reader().unwrap();
    assert_eq!(reader.read().await.unwrap().map(|chunk| chunk.len()), Some(4));
    assert_eq!(controller.desired_size(), Some(2.0));
    settle().await;
    assert!(pulls.load(Ordering::SeqCst) > before);
}

#[tokio::test]
async fn close_waits_for_the_queue_to_drain() {
    let (stream, controller, _) = push_stream(10.0).await;
    controller.enqueue(vec![1]).unwrap();
    controller.enqueue(vec![2]).unwrap();
    controller.close().unwrap();
    assert!(matches!(controller.enqueue(vec![3]), Err(StreamError::Type(_))));

    let reader = stream.get_reader().unwrap();
    let closed = reader.closed();
    settle().await;
    let mut closed = Box::pin(closed);
    assert!((&mut closed).now_or_never().is_none(), "queue still holds chunks");

    assert_eq!(reader.read().await.unwrap(), Some(vec![1]));
    assert_eq!(reader.read().await.unwrap(), Some(vec![2]));
    assert_eq!(reader.read().await.unwrap(), None);
    timeout(Duration::from_secs(1), closed).await.unwrap().unwrap();
}

#[tokio::test]
async fn terminal_operations_are_idempotent() {
    let readable = ReadableStream::<u32>::from_vec(vec![]).spawn(tokio::spawn).unwrap();
    assert!(readable.collect_all().await.unwrap().is_empty());
    readable.cancel(None).await.unwrap();
    readable.cancel(Some("again".into())).await.unwrap();

    let closed = WritableStream::builder(NullSink).spawn(tokio::spawn).unwrap();
    closed.close().await.unwrap();
    closed.abort(Some("late".into())).await.unwrap();

    let slot: Slot<WritableStreamDefaultController> = Arc::new(Mutex::new(None));
    let errored = WritableStream::builder(ControllerGrabbingSink { slot: slot.clone() })
        .spawn(tokio::spawn)
        .unwrap();
    settle().await;
    let controller = slot.lock().clone().unwrap();
    controller.error("sink failed".into());
    errored.abort(None).await.unwrap();
}

struct ControllerGrabbingSink {
    slot: Slot<WritableStreamDefaultController>,
}

impl WritableSink<u32> for ControllerGrabbingSink {
    async fn start(&mut self, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        *self.slot.lock() = Some(controller.clone());
        Ok(())
    }

    async fn write(&mut self, _chunk: u32, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Collector(Arc<Mutex<Vec<char>>>);

impl WritableSink<char> for Collector {
    async fn write(&mut self, chunk: char, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        self.0.lock().push(chunk);
        Ok(())
    }
}

#[tokio::test]
async fn tee_branches_pipe_independently() {
    let source = ReadableStream::from_vec(vec!['a', 'b', 'c'])
        .spawn(tokio::spawn)
        .unwrap();
    let (left, right) = source.tee().spawn(tokio::spawn).unwrap();

    let left_sink = Collector::default();
    let right_sink = Collector::default();
    let left_dest = WritableStream::builder(left_sink.clone()).spawn(tokio::spawn).unwrap();
    let right_dest = WritableStream::builder(right_sink.clone()).spawn(tokio::spawn).unwrap();

    let (first, second) = futures::join!(
        left.pipe_to(&left_dest, None),
        right.pipe_to(&right_dest, None)
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(*left_sink.0.lock(), vec!['a', 'b', 'c']);
    assert_eq!(*right_sink.0.lock(), vec!['a', 'b', 'c']);
}

struct Counter {
    next: u32,
    canceled_with: Slot<Option<StreamError>>,
}

impl ReadableSource<u32> for Counter {
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
        self.next += 1;
        controller.enqueue(self.next)
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        *self.canceled_with.lock() = Some(reason);
        Ok(())
    }
}

struct FailingSink;

impl WritableSink<u32> for FailingSink {
    async fn write(&mut self, _chunk: u32, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        Err("disk full".into())
    }
}

#[tokio::test]
async fn destination_failure_cancels_source_with_the_same_reason() {
    let canceled_with = Arc::new(Mutex::new(None));
    let source = ReadableStream::builder(Counter {
        next: 0,
        canceled_with: canceled_with.clone(),
    })
    .spawn(tokio::spawn)
    .unwrap();
    let dest = WritableStream::builder(FailingSink).spawn(tokio::spawn).unwrap();

    let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, None))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "disk full");
    settle().await;
    let reason = canceled_with.lock().clone().unwrap().unwrap();
    assert_eq!(reason.to_string(), "disk full");
}

#[tokio::test]
async fn prevent_cancel_leaves_the_source_readable() {
    let canceled_with = Arc::new(Mutex::new(None));
    let source = ReadableStream::builder(Counter {
        next: 0,
        canceled_with: canceled_with.clone(),
    })
    .spawn(tokio::spawn)
    .unwrap();
    let dest = WritableStream::builder(FailingSink).spawn(tokio::spawn).unwrap();

    let options = StreamPipeOptions {
        prevent_cancel: true,
        ..Default::default()
    };
    let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, Some(options)))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "disk full");
    settle().await;
    assert!(canceled_with.lock().is_none());
    assert!(!source.locked());
    let reader = source.get_reader().unwrap();
    assert!(reader.read().await.unwrap().is_some());
}

struct GatedSink {
    gate: Arc<Notify>,
    fail: bool,
}

impl WritableSink<u32> for GatedSink {
    async fn write(&mut self, _chunk: u32, _controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        self.gate.notified().await;
        if self.fail {
            Err("write failed".into())
        } else {
            Ok(())
        }
    }
}

async fn abort_during_write(fail: bool) -> (StreamResult<()>, StreamResult<()>) {
    let gate = Arc::new(Notify::new());
    let stream = WritableStream::builder(GatedSink {
        gate: gate.clone(),
        fail,
    })
    .spawn(tokio::spawn)
    .unwrap();
    settle().await;

    let writer = stream.get_writer().unwrap();
    let write = writer.write(1);
    settle().await;

    let abort = writer.abort(Some("stop".into()));
    assert_eq!(writer.desired_size().unwrap(), None, "erroring while the write is in flight");
    settle().await;
    let mut abort = Box::pin(abort);
    assert!((&mut abort).now_or_never().is_none());

    gate.notify_one();
    let _ = timeout(Duration::from_secs(1), write).await.unwrap();
    let abort_result = timeout(Duration::from_secs(1), abort).await.unwrap();
    let closed_result = timeout(Duration::from_secs(1), writer.closed()).await.unwrap();
    (abort_result, closed_result)
}

#[tokio::test]
async fn abort_resolves_after_a_successful_in_flight_write() {
    let (abort, closed) = abort_during_write(false).await;
    abort.unwrap();
    assert_eq!(closed.unwrap_err().to_string(), "stop");
}

#[tokio::test]
async fn abort_reports_the_in_flight_write_failure() {
    let (abort, closed) = abort_during_write(true).await;
    assert_eq!(abort.unwrap_err().to_string(), "write failed");
    assert_eq!(closed.unwrap_err().to_string(), "stop");
}
