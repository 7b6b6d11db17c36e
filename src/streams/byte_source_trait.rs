use super::{
    byte_state::ReadableByteStreamController,
    error::{StreamError, StreamResult},
    readable::{ReadableShared, UnderlyingSource},
};
use crate::platform::MaybeSend;
use futures::future;
use std::future::Future;

/// Source for byte streams. Chunks are pushed with
/// [`ReadableByteStreamController::enqueue`] and may be split across BYOB reads.
pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

pub(crate) struct ByteSource<S>(pub(crate) S);

impl<S: ReadableByteSource> UnderlyingSource<Vec<u8>> for ByteSource<S> {
    type Controller = ReadableByteStreamController;

    fn controller(stream: ReadableShared<Vec<u8>>) -> Self::Controller {
        ReadableByteStreamController::new(stream)
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
