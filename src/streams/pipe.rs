use super::{
    StreamResult,
    error::StreamError,
    readable::{DefaultStream, ReadableStream, StreamTypeMarker},
    transform::{TransformReadableSource, TransformStream},
    writable::{WritableState, WritableStream},
};
use crate::platform::{MaybeSend, PlatformFuture};
use futures::future::{self, AbortRegistration, Abortable, Either, Future};
use std::{
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::debug;

/// Options for [`ReadableStream::pipe_to`].
///
/// Aborting the handle paired with `signal` stops the pipe: the destination
/// is aborted and the source canceled, subject to the `prevent_*` flags.
#[derive(Default)]
pub struct StreamPipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortRegistration>,
}

impl<T, Source, StreamType> ReadableStream<T, Source, StreamType>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    /// Pipe every chunk of this stream into `destination`.
    ///
    /// Both streams stay locked until the pipe settles. A source error aborts
    /// the destination, a destination error cancels the source, and the end
    /// of the source closes the destination; the pipe resolves with the error
    /// that stopped it.
    pub async fn pipe_to<Sink>(
        &self,
        destination: &WritableStream<T, Sink>,
        options: Option<StreamPipeOptions>,
    ) -> StreamResult<()> {
        let StreamPipeOptions {
            prevent_close,
            prevent_abort,
            prevent_cancel,
            signal,
        } = options.unwrap_or_default();

        let writer = destination.get_writer()?;
        let reader = self.get_reader()?;
        let source = self.shared.id;
        let dest = destination.id();
        debug!(source, dest, "pipe started");

        // Set once a terminal action has been chosen; the signal is ignored
        // from then on.
        let shutting_down = AtomicBool::new(false);

        let pipe_loop = async {
            let mut source_closed = pin!(reader.closed());
            let mut dest_closed = pin!(writer.closed());
            let mut last_write = None;

            let source_failed = |error: StreamError| {
                shutting_down.store(true, Ordering::Release);
                debug!(source, dest, %error, "pipe source failed");
                error
            };
            let dest_failed = |error: StreamError| {
                shutting_down.store(true, Ordering::Release);
                debug!(source, dest, %error, "pipe destination failed");
                error
            };

            loop {
                match future::select(pin!(writer.ready()), source_closed.as_mut()).await {
                    Either::Left((Err(error), _)) => {
                        let error = dest_failed(error);
                        if !prevent_cancel {
                            let _ = reader.cancel(error.reason()).await;
                        }
                        return Err(error);
                    }
                    Either::Right((Err(error), _)) => {
                        let error = source_failed(error);
                        if !prevent_abort {
                            let _ = writer.abort(error.reason()).await;
                        }
                        return Err(error);
                    }
                    // Closed sources are picked up by the read below.
                    _ => {}
                }

                // A closing destination would reject the write after the chunk
                // has already been taken from the source.
                if matches!(
                    destination.state(),
                    WritableState::Closing | WritableState::Closed
                ) {
                    let error = dest_failed(StreamError::Closed);
                    if !prevent_cancel {
                        let _ = reader.cancel(error.reason()).await;
                    }
                    return Err(error);
                }

                let read = match future::select(pin!(reader.read()), dest_closed.as_mut()).await {
                    Either::Left((read, _)) => read,
                    Either::Right((closed, _)) => {
                        let error = dest_failed(closed.err().unwrap_or(StreamError::Closed));
                        if !prevent_cancel {
                            let _ = reader.cancel(error.reason()).await;
                        }
                        return Err(error);
                    }
                };

                match read {
                    Ok(Some(chunk)) => last_write = Some(writer.write(chunk)),
                    Ok(None) => {
                        shutting_down.store(true, Ordering::Release);
                        debug!(source, dest, "pipe source finished");
                        if !prevent_close {
                            return writer.close().await;
                        }
                        if let Some(write) = last_write {
                            write.await?;
                        }
                        return Ok(());
                    }
                    Err(error) => {
                        let error = source_failed(error);
                        if !prevent_abort {
                            let _ = writer.abort(error.reason()).await;
                        }
                        return Err(error);
                    }
                }
            }
        };

        let Some(registration) = signal else {
            return pipe_loop.await;
        };

        let mut pipe_loop = pin!(pipe_loop);
        let aborted = Abortable::new(future::pending::<()>(), registration);
        match future::select(pipe_loop.as_mut(), aborted).await {
            Either::Left((result, _)) => result,
            Either::Right((_, pipe_loop)) if shutting_down.load(Ordering::Acquire) => {
                pipe_loop.await
            }
            Either::Right(_) => {
                shutting_down.store(true, Ordering::Release);
                debug!(source, dest, "pipe aborted by signal");
                let error = StreamError::Aborted(Some("pipe aborted".into()));
                let abort_dest = async {
                    if !prevent_abort {
                        let _ = writer.abort(error.reason()).await;
                    }
                };
                let cancel_source = async {
                    if !prevent_cancel {
                        let _ = reader.cancel(error.reason()).await;
                    }
                };
                future::join(abort_dest, cancel_source).await;
                Err(error)
            }
        }
    }

    /// Pipe this stream through `transform`, returning a builder for the
    /// transform's readable side.
    pub fn pipe_through<O>(
        self,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> PipeBuilder<T, O, Source, StreamType>
    where
        O: MaybeSend + 'static,
        Source: 'static,
    {
        PipeBuilder::new(self, transform, options)
    }
}

pub struct PipeBuilder<T, O, Source, StreamType = DefaultStream>
where
    T: MaybeSend + 'static,
    O: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    source: ReadableStream<T, Source, StreamType>,
    transform: TransformStream<T, O>,
    options: Option<StreamPipeOptions>,
}

impl<T, O, Source, StreamType> PipeBuilder<T, O, Source, StreamType>
where
    T: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Source: 'static,
    StreamType: StreamTypeMarker,
{
    fn new(
        source: ReadableStream<T, Source, StreamType>,
        transform: TransformStream<T, O>,
        options: Option<StreamPipeOptions>,
    ) -> Self {
        Self {
            source,
            transform,
            options,
        }
    }

    /// Prepare without spawning: returns the readable and the unspawned pipe future
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<O, TransformReadableSource<O>>,
        impl Future<Output = StreamResult<()>>,
    ) {
        let Self {
            source,
            transform,
            options,
        } = self;
        let (readable, writable) = transform.split();
        let pipe = async move { source.pipe_to(&writable, options).await };
        (readable, pipe)
    }

    /// Spawn the pipeline with an owned spawner closure
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O, TransformReadableSource<O>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (readable, pipe) = self.prepare();
        spawn_fn(Box::pin(async move {
            if let Err(error) = pipe.await {
                debug!(%error, "pipe through transform failed");
            }
        }));
        readable
    }

    /// Spawn the pipeline with a static function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream<O, TransformReadableSource<O>>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (readable, pipe) = self.prepare();
        spawn_fn(Box::pin(async move {
            if let Err(error) = pipe.await {
                debug!(%error, "pipe through transform failed");
            }
        }));
        readable
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use crate::streams::{
        ReadableSource, ReadableStreamDefaultController, StreamState, WritableSink,
        WritableState, WritableStreamDefaultController,
    };
    use futures::future::AbortHandle;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<Mutex<Vec<i32>>>,
        aborts: Arc<Mutex<Vec<Option<String>>>>,
        closed: Arc<AtomicBool>,
        fail_on: Option<i32>,
    }

    impl WritableSink<i32> for RecordingSink {
        async fn write(
            &mut self,
            chunk: i32,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err(format!("cannot write {chunk}").into());
            }
            self.written.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.aborts.lock().unwrap().push(reason);
            Ok(())
        }
    }

    /// Counts upward forever, optionally failing once `fail_after` chunks
    /// have been produced.
    #[derive(Clone, Default)]
    struct CounterSource {
        next: i32,
        fail_after: Option<i32>,
        cancels: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl ReadableSource<i32> for CounterSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            if self.fail_after == Some(self.next) {
                return Err(StreamError::from("source exploded"));
            }
            self.next += 1;
            controller.enqueue(self.next)
        }

        async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.cancels.lock().unwrap().push(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pipes_all_chunks_and_closes_destination() {
        let sink = RecordingSink::default();
        let source = ReadableStream::from_vec(vec![1, 2, 3, 4]).spawn(tokio::spawn);
        let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

        timeout(Duration::from_secs(1), source.pipe_to(&dest, None))
            .await
            .expect("pipe stalled")
            .unwrap();

        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 3, 4]);
        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(matches!(dest.state(), WritableState::Closed));
        assert!(!source.locked());
        assert!(!dest.locked());
    }

    #[tokio::test]
    async fn source_error_aborts_destination() {
        let sink = RecordingSink::default();
        let source = ReadableStream::builder(CounterSource {
            fail_after: Some(3),
            ..Default::default()
        })
        .spawn(tokio::spawn);
        let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

        let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, None))
            .await
            .expect("pipe stalled")
            .unwrap_err();

        assert_eq!(err.to_string(), "source exploded");
        assert_eq!(
            *sink.aborts.lock().unwrap(),
            vec![Some("source exploded".to_string())]
        );
        assert!(matches!(dest.state(), WritableState::Errored(_)));
    }

    #[tokio::test]
    async fn destination_error_cancels_source() {
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let source = ReadableStream::builder(CounterSource {
            cancels: cancels.clone(),
            ..Default::default()
        })
        .spawn(tokio::spawn);
        let dest = WritableStream::builder(RecordingSink {
            fail_on: Some(2),
            ..Default::default()
        })
        .spawn(tokio::spawn);

        let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, None))
            .await
            .expect("pipe stalled")
            .unwrap_err();

        assert_eq!(err.to_string(), "cannot write 2");
        assert_eq!(
            *cancels.lock().unwrap(),
            vec![Some("cannot write 2".to_string())]
        );
        assert!(matches!(source.state(), StreamState::Closed));
    }

    #[tokio::test]
    async fn prevent_flags_leave_streams_usable() {
        let sink = RecordingSink::default();
        let source = ReadableStream::from_vec(vec![1, 2]).spawn(tokio::spawn);
        let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

        let options = StreamPipeOptions {
            prevent_close: true,
            ..Default::default()
        };
        source.pipe_to(&dest, Some(options)).await.unwrap();
        assert!(matches!(dest.state(), WritableState::Writable));

        let writer = dest.get_writer().unwrap();
        writer.write(3).await.unwrap();
        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 3]);
        drop(writer);

        let failing = ReadableStream::builder(CounterSource {
            fail_after: Some(0),
            ..Default::default()
        })
        .spawn(tokio::spawn);
        let options = StreamPipeOptions {
            prevent_abort: true,
            ..Default::default()
        };
        assert!(failing.pipe_to(&dest, Some(options)).await.is_err());
        assert!(matches!(dest.state(), WritableState::Writable));
        assert!(sink.aborts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_destination_keeps_source_chunks_when_cancel_prevented() {
        let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
        let dest = WritableStream::builder(RecordingSink::default()).spawn(tokio::spawn);
        dest.close().await.unwrap();

        let options = StreamPipeOptions {
            prevent_cancel: true,
            ..Default::default()
        };
        let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, Some(options)))
            .await
            .expect("pipe stalled")
            .unwrap_err();
        assert!(matches!(err, StreamError::Closed));

        let reader = source.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn closed_destination_cancels_source() {
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let source = ReadableStream::builder(CounterSource {
            cancels: cancels.clone(),
            ..Default::default()
        })
        .spawn(tokio::spawn);
        let sink = RecordingSink::default();
        let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);
        dest.close().await.unwrap();

        let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, None))
            .await
            .expect("pipe stalled")
            .unwrap_err();

        assert!(err.is_type_error());
        assert_eq!(cancels.lock().unwrap().len(), 1);
        assert!(sink.written.lock().unwrap().is_empty());
        assert!(matches!(source.state(), StreamState::Closed));
    }

    #[tokio::test]
    async fn destination_error_with_prevent_cancel_leaves_source_readable() {
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let source = ReadableStream::builder(CounterSource {
            cancels: cancels.clone(),
            ..Default::default()
        })
        .spawn(tokio::spawn);
        let dest = WritableStream::builder(RecordingSink {
            fail_on: Some(2),
            ..Default::default()
        })
        .spawn(tokio::spawn);

        let options = StreamPipeOptions {
            prevent_cancel: true,
            ..Default::default()
        };
        let err = timeout(Duration::from_secs(1), source.pipe_to(&dest, Some(options)))
            .await
            .expect("pipe stalled")
            .unwrap_err();

        assert_eq!(err.to_string(), "cannot write 2");
        assert!(cancels.lock().unwrap().is_empty());
        assert!(matches!(source.state(), StreamState::Readable));
        assert!(!source.locked());

        let reader = source.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn signal_aborts_a_stalled_pipe() {
        struct Silent(Arc<Mutex<Vec<Option<String>>>>);

        impl ReadableSource<i32> for Silent {
            async fn pull(
                &mut self,
                _controller: &mut ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                Ok(())
            }

            async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
                self.0.lock().unwrap().push(reason);
                Ok(())
            }
        }

        let cancels = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink::default();
        let source = ReadableStream::builder(Silent(cancels.clone())).spawn(tokio::spawn);
        let dest = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

        let (handle, registration) = AbortHandle::new_pair();
        let options = StreamPipeOptions {
            signal: Some(registration),
            ..Default::default()
        };
        let pipe = source.pipe_to(&dest, Some(options));
        let abort = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.abort();
        };
        let (result, ()) = timeout(Duration::from_secs(1), async { tokio::join!(pipe, abort) })
            .await
            .expect("abort did not stop the pipe");

        assert!(matches!(result, Err(StreamError::Aborted(_))));
        assert_eq!(cancels.lock().unwrap().len(), 1);
        assert_eq!(sink.aborts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pipe_to_locked_destination_fails() {
        let source = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn);
        let dest = WritableStream::builder(RecordingSink::default()).spawn(tokio::spawn);
        let _writer = dest.get_writer().unwrap();

        assert!(matches!(
            source.pipe_to(&dest, None).await,
            Err(StreamError::Locked)
        ));
        assert!(!source.locked());
    }

    #[tokio::test]
    async fn pipe_through_transform() {
        let transform = TransformStream::map(|n: i32| n * 10).spawn(tokio::spawn);
        let readable = ReadableStream::from_vec(vec![1, 2, 3])
            .spawn(tokio::spawn)
            .pipe_through(transform, None)
            .spawn(tokio::spawn);

        let reader = readable.get_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(value) = timeout(Duration::from_secs(1), reader.read())
            .await
            .expect("read timed out")
            .unwrap()
        {
            seen.push(value);
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }
}
