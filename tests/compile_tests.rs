//! Compile-time checks of the Send/Sync contract for each feature.
//!
//!   cargo test                                    (send, default)
//!   cargo test --no-default-features --features local

use whatwg_streams::{ReadableStream, StreamError, TransformStream, WritableStream};

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[cfg(feature = "send")]
#[test]
fn send_feature_handles_are_send_and_sync() {
    use whatwg_streams::{
        AbortSignal, Completion, ReadableByteStreamController, ReadableStreamBYOBReader,
        ReadableStreamDefaultController, ReadableStreamDefaultReader,
        TransformStreamDefaultController, WritableStreamDefaultController,
        WritableStreamDefaultWriter,
    };

    assert_send::<ReadableStream<String>>();
    assert_sync::<ReadableStream<String>>();
    assert_send::<WritableStream<String>>();
    assert_sync::<WritableStream<String>>();
    assert_send::<TransformStream<String, Vec<u8>>>();
    assert_sync::<TransformStream<String, Vec<u8>>>();

    assert_send::<ReadableStreamDefaultReader<String>>();
    assert_send::<ReadableStreamBYOBReader>();
    assert_send::<WritableStreamDefaultWriter<String>>();

    assert_send::<ReadableStreamDefaultController<String>>();
    assert_sync::<ReadableStreamDefaultController<String>>();
    assert_send::<ReadableByteStreamController>();
    assert_send::<WritableStreamDefaultController>();
    assert_sync::<WritableStreamDefaultController>();
    assert_send::<TransformStreamDefaultController<String>>();

    assert_send::<Completion<Option<String>>>();
    assert_send::<AbortSignal>();
    assert_sync::<AbortSignal>();
    assert_send::<StreamError>();
    assert_sync::<StreamError>();
}

#[cfg(feature = "send")]
#[test]
fn send_feature_driver_futures_are_send() {
    fn assert_send_value<T: Send>(_: &T) {}

    let (_stream, driver) = ReadableStream::from_vec(vec![1, 2, 3]).prepare().unwrap();
    assert_send_value(&driver);

    let (_transform, driver) = TransformStream::<u8, u8>::identity().prepare().unwrap();
    assert_send_value(&driver);
}

#[cfg(feature = "local")]
#[test]
fn local_feature_accepts_non_send_chunks() {
    use std::rc::Rc;

    // Rc chunks are !Send; this only builds when the Send bounds are gone.
    let (_stream, _driver) = ReadableStream::from_vec(vec![Rc::new(1)]).prepare().unwrap();
}

#[test]
fn stream_types_are_nameable_under_every_feature() {
    let _: Option<ReadableStream<i32>> = None;
    let _: Option<WritableStream<i32>> = None;
    let _: Option<TransformStream<i32, String>> = None;
    let _: Option<StreamError> = None;
}
