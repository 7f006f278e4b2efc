//! End-to-end behavior across the public API.
#![cfg(feature = "send")]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use streamflow::{
    ReadableSource, ReadableStream, ReadableStreamDefaultController, StreamError, StreamResult,
    TransformStream, WritableSink, WritableState, WritableStream, WritableStreamDefaultController,
};

struct Counter {
    calls: usize,
    fail_after: Option<usize>,
    cancels: Arc<AtomicUsize>,
}

impl Counter {
    fn new() -> Self {
        Self {
            calls: 0,
            fail_after: None,
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ReadableSource<usize> for Counter {
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<usize>,
    ) -> StreamResult<()> {
        self.calls += 1;
        if self.fail_after.is_some_and(|limit| self.calls > limit) {
            return Err(StreamError::from("counter failed"));
        }
        controller.enqueue(self.calls)?;
        if self.calls == 5 {
            controller.close()?;
        }
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<String>) -> StreamResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Recording {
    written: Arc<parking_lot::Mutex<Vec<usize>>>,
    aborted: Arc<parking_lot::Mutex<Option<Option<String>>>>,
}

impl WritableSink<usize> for Recording {
    async fn write(
        &mut self,
        chunk: usize,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        self.written.lock().push(chunk);
        Ok(())
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        *self.aborted.lock() = Some(reason);
        Ok(())
    }
}

#[tokio::test]
async fn pulled_counter_reads_in_order_then_ends() {
    let stream = ReadableStream::builder(Counter::new()).spawn(tokio::spawn);
    let reader = stream.get_reader().unwrap();

    for expected in 1..=5 {
        assert_eq!(reader.read().await.unwrap(), Some(expected));
    }
    assert_eq!(reader.read().await.unwrap(), None);
    assert_eq!(reader.read().await.unwrap(), None);
}

#[tokio::test]
async fn transform_adds_one() {
    let (readable, writable) = TransformStream::map(|x: i32| x + 1)
        .spawn(tokio::spawn)
        .split();
    let writer = writable.get_writer().unwrap();
    let reader = readable.get_reader().unwrap();

    let write = writer.write(41);
    assert_eq!(reader.read().await.unwrap(), Some(42));
    write.await.unwrap();
}

#[tokio::test]
async fn write_after_close_is_rejected_and_close_is_idempotent() {
    let stream = WritableStream::builder(Recording::default()).spawn(tokio::spawn);
    let writer = stream.get_writer().unwrap();

    let (first, second) = tokio::join!(writer.close(), writer.close());
    first.unwrap();
    second.unwrap();
    assert!(matches!(stream.state(), WritableState::Closed));

    let err = writer.write(1).await.unwrap_err();
    assert!(err.is_type_error());
}

#[tokio::test]
async fn cancel_discards_buffer_and_cancels_source_once() {
    let source = Counter::new();
    let cancels = source.cancels.clone();
    let stream = ReadableStream::builder(source)
        .strategy(streamflow::CountQueuingStrategy::new(3))
        .spawn(tokio::spawn);
    let reader = stream.get_reader().unwrap();

    assert_eq!(reader.read().await.unwrap(), Some(1));
    let (a, b) = tokio::join!(
        reader.cancel(Some("done".into())),
        reader.cancel(Some("again".into()))
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(reader.read().await.unwrap(), None);
}

#[tokio::test]
async fn failing_source_aborts_pipe_destination() {
    let mut source = Counter::new();
    source.fail_after = Some(2);
    let readable = ReadableStream::builder(source).spawn(tokio::spawn);

    let sink = Recording::default();
    let written = sink.written.clone();
    let aborted = sink.aborted.clone();
    let writable = WritableStream::builder(sink).spawn(tokio::spawn);

    let err = readable.pipe_to(&writable, None).await.unwrap_err();
    assert_eq!(err.to_string(), "counter failed");
    assert_eq!(*written.lock(), vec![1, 2]);
    assert_eq!(*aborted.lock(), Some(Some("counter failed".to_string())));
    assert!(matches!(writable.state(), WritableState::Errored(_)));
}
