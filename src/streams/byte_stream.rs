//! Byte-oriented readable streams.
//!
//! A [`ReadableByteSource`] fills a buffer handed to it by the stream task.
//! The buffer is sized from the oldest outstanding BYOB read, or from the
//! builder's auto-allocate size when only default reads are waiting.

use super::{
    ByteLengthQueuingStrategy, DEFAULT_BYTE_HIGH_WATER_MARK, StreamResult,
    error::StreamError,
    lock::{HandleGuard, LockGuard},
    readable::{
        ByteStream, ReadableShared, ReadableStream, ReadableStreamBuilder,
        ReadableStreamDefaultController, SourceAction, TaskGuard,
    },
};
use crate::platform::{MaybeSend, SharedPtr};
use futures::future::{self, poll_fn};
use std::{
    future::Future,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::trace;

pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Fill `buffer` from the front and return how many bytes were written.
    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
        buffer: &mut [u8],
    ) -> impl Future<Output = StreamResult<usize>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

fn split_bytes(chunk: &mut Vec<u8>, max_len: usize) -> Option<Vec<u8>> {
    (chunk.len() > max_len).then(|| chunk.split_off(max_len))
}

#[derive(Default)]
struct PullState {
    in_pull: AtomicBool,
    close_deferred: AtomicBool,
}

pub struct ReadableByteStreamController {
    inner: ReadableStreamDefaultController<Vec<u8>>,
    pull_state: SharedPtr<PullState>,
}

impl Clone for ReadableByteStreamController {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pull_state: self.pull_state.clone(),
        }
    }
}

impl ReadableByteStreamController {
    fn new(shared: SharedPtr<ReadableShared<Vec<u8>>>) -> Self {
        Self {
            inner: ReadableStreamDefaultController::new(shared),
            pull_state: SharedPtr::new(PullState::default()),
        }
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.inner.desired_size()
    }

    /// Length of the buffer supplied by the oldest waiting BYOB read.
    pub fn byob_request(&self) -> Option<usize> {
        self.inner.shared_ref().pending_read_len()
    }

    /// Enqueue bytes directly, bypassing the pull buffer. Empty chunks are
    /// ignored.
    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        if self.pull_state.close_deferred.load(Ordering::Acquire) {
            return Err(StreamError::Closing);
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.inner.enqueue(chunk)
    }

    /// Close the stream. Called from inside `pull`, the close takes effect
    /// after the bytes that pull reports have been enqueued.
    pub fn close(&self) -> StreamResult<()> {
        if self.pull_state.in_pull.load(Ordering::Acquire) {
            if self.pull_state.close_deferred.swap(true, Ordering::AcqRel) {
                return Err(StreamError::Closing);
            }
            return Ok(());
        }
        self.inner.close()
    }

    pub fn error(&self, error: StreamError) {
        self.inner.error(error)
    }

    fn begin_pull(&self) {
        self.pull_state.in_pull.store(true, Ordering::Release);
    }

    fn finish_pull(&self, filled: StreamResult<usize>, buffer: &[u8]) -> StreamResult<()> {
        self.pull_state.in_pull.store(false, Ordering::Release);
        let close_deferred = self.pull_state.close_deferred.swap(false, Ordering::AcqRel);
        let filled = filled?;
        if filled > buffer.len() {
            return Err(StreamError::from(format!(
                "byte source reported {filled} bytes for a {} byte buffer",
                buffer.len()
            )));
        }
        if filled > 0 {
            self.inner.enqueue(buffer[..filled].to_vec())?;
        }
        if close_deferred {
            self.inner.close()?;
        }
        Ok(())
    }
}

fn drive_byte_source<Source: ReadableByteSource>(
    shared: SharedPtr<ReadableShared<Vec<u8>>>,
    mut source: Source,
    auto_allocate_chunk_size: usize,
) -> impl Future<Output = ()> {
    let guard = TaskGuard(shared);
    async move {
        let shared = &guard.0;
        let mut controller = ReadableByteStreamController::new(shared.clone());
        let mut buffer = Vec::new();

        let started = source.start(&mut controller).await;
        shared.start_finished(started);

        loop {
            match poll_fn(|cx| shared.poll_action(cx)).await {
                SourceAction::Pull => {
                    let len = shared
                        .pending_read_len()
                        .unwrap_or(auto_allocate_chunk_size);
                    buffer.clear();
                    buffer.resize(len, 0);
                    trace!(stream = shared.id, len, "pulling into byte buffer");

                    controller.begin_pull();
                    let filled = source.pull(&mut controller, &mut buffer).await;
                    let result = controller.finish_pull(filled, &buffer);
                    shared.pull_finished(result);
                }
                SourceAction::Cancel(reason) => {
                    let result = source.cancel(reason).await;
                    shared.cancel_finished(result);
                }
                SourceAction::Exit => break,
            }
        }
    }
}

impl<Source: ReadableByteSource> ReadableStream<Vec<u8>, Source, ByteStream> {
    /// Returns a builder for byte streams
    pub fn builder_bytes(source: Source) -> ReadableStreamBuilder<Vec<u8>, Source, ByteStream> {
        ReadableStreamBuilder::with_strategy(
            source,
            Box::new(ByteLengthQueuingStrategy::new(DEFAULT_BYTE_HIGH_WATER_MARK)),
        )
    }
}

impl<Source> ReadableStream<Vec<u8>, Source, ByteStream> {
    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamBYOBReader<Source>> {
        ReadableStreamBYOBReader::new(&self.shared)
    }
}

// Byte stream builder - specialized for Vec<u8>
impl<Source: ReadableByteSource> ReadableStreamBuilder<Vec<u8>, Source, ByteStream> {
    /// Size of the buffer handed to `pull` when no BYOB read is waiting.
    pub fn auto_allocate_chunk_size(mut self, size: usize) -> Self {
        self.auto_allocate_chunk_size = size.max(1);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<Vec<u8>, Source, ByteStream>,
        impl Future<Output = ()>,
    ) {
        let shared = SharedPtr::new(ReadableShared::new(self.strategy, Some(split_bytes)));
        let stream = ReadableStream::from_shared(shared.clone());
        let fut = drive_byte_source(shared, self.source, self.auto_allocate_chunk_size);
        (stream, fut)
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<Vec<u8>, Source, ByteStream>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream<Vec<u8>, Source, ByteStream>
    where
        F: Fn(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// ----------- BYOB Reader -----------
/// Reader that copies into caller-supplied buffers. A chunk larger than the
/// buffer is split and its remainder stays at the head of the queue.
pub struct ReadableStreamBYOBReader<Source> {
    shared: SharedPtr<ReadableShared<Vec<u8>>>,
    lock: LockGuard<ReadableShared<Vec<u8>>>,
    _handle: HandleGuard<ReadableShared<Vec<u8>>>,
    _marker: PhantomData<fn() -> Source>,
}

impl<Source> ReadableStreamBYOBReader<Source> {
    fn new(shared: &SharedPtr<ReadableShared<Vec<u8>>>) -> StreamResult<Self> {
        Ok(Self {
            lock: LockGuard::acquire(shared)?,
            shared: shared.clone(),
            _handle: HandleGuard::new(shared),
            _marker: PhantomData,
        })
    }

    /// Read into `buffer`, returning the number of bytes written. `0` means
    /// the stream is closed (or `buffer` is empty).
    pub async fn read(&self, buffer: &mut [u8]) -> StreamResult<usize> {
        if buffer.is_empty() {
            self.lock.token().check()?;
            return Ok(0);
        }
        match self
            .shared
            .read(self.lock.token(), Some(buffer.len()))
            .await?
        {
            Some(chunk) => {
                let len = chunk.len().min(buffer.len());
                buffer[..len].copy_from_slice(&chunk[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<Source> {
        let shared = self.shared.clone();
        let token = self.lock.token().clone();
        poll_fn(move |cx| shared.poll_closed(&token, cx))
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        self.lock.token().check()?;
        self.shared.cancel(reason).await
    }

    pub fn release_lock(self) {}
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct SliceSource {
        data: Vec<u8>,
        pos: usize,
        requests: Arc<Mutex<Vec<(Option<usize>, usize)>>>,
    }

    impl SliceSource {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ReadableByteSource for SliceSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableByteStreamController,
            buffer: &mut [u8],
        ) -> StreamResult<usize> {
            self.requests
                .lock()
                .unwrap()
                .push((controller.byob_request(), buffer.len()));
            let len = (self.data.len() - self.pos).min(buffer.len());
            buffer[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
            self.pos += len;
            if self.pos == self.data.len() {
                controller.close()?;
            }
            Ok(len)
        }
    }

    #[tokio::test]
    async fn byob_reads_fill_caller_buffers() {
        let source = SliceSource::new(b"0123456789");
        let requests = source.requests.clone();
        let stream = ReadableStream::builder_bytes(source).spawn(tokio::spawn);
        let reader = stream.get_byob_reader().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        reader.closed().await.unwrap();

        let requests = requests.lock().unwrap();
        assert!(requests.iter().all(|&(request, len)| request == Some(4) && len == 4));
    }

    #[tokio::test]
    async fn oversized_chunks_keep_their_remainder_queued() {
        struct Burst;

        impl ReadableByteSource for Burst {
            async fn start(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
                controller.enqueue(b"abcdefghij".to_vec())?;
                controller.close()
            }

            async fn pull(
                &mut self,
                _controller: &mut ReadableByteStreamController,
                _buffer: &mut [u8],
            ) -> StreamResult<usize> {
                Ok(0)
            }
        }

        let stream = ReadableStream::builder_bytes(Burst).spawn(tokio::spawn);
        let reader = stream.get_byob_reader().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"efgh");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ij");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut []).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn default_reader_uses_auto_allocate_size() {
        let source = SliceSource::new(b"abcdefg");
        let requests = source.requests.clone();
        let stream = ReadableStream::builder_bytes(source)
            .auto_allocate_chunk_size(3)
            .spawn(tokio::spawn);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"def".to_vec()));
        assert_eq!(reader.read().await.unwrap(), Some(b"g".to_vec()));
        assert_eq!(reader.read().await.unwrap(), None);

        let requests = requests.lock().unwrap();
        assert!(requests.iter().all(|&(request, len)| request.is_none() && len == 3));
    }

    #[tokio::test]
    async fn byob_reader_holds_the_lock() {
        let stream = ReadableStream::builder_bytes(SliceSource::new(b"xy")).spawn(tokio::spawn);
        let reader = stream.get_byob_reader().unwrap();
        assert!(matches!(stream.get_reader(), Err(StreamError::Locked)));
        reader.release_lock();
        assert!(stream.get_byob_reader().is_ok());
    }

    #[test]
    fn split_bytes_only_splits_oversized_chunks() {
        let mut chunk = b"hello".to_vec();
        assert_eq!(split_bytes(&mut chunk, 8), None);
        assert_eq!(split_bytes(&mut chunk, 2), Some(b"llo".to_vec()));
        assert_eq!(chunk, b"he".to_vec());
    }
}
