use super::{
    CountQueuingStrategy, DEFAULT_TRANSFORM_READABLE_HIGH_WATER_MARK,
    DEFAULT_WRITABLE_HIGH_WATER_MARK, QueuingStrategy, StreamResult, WakerSet,
    error::StreamError,
    readable::{
        DefaultStream, ReadableShared, ReadableSource, ReadableStream, ReadableStreamBuilder,
        ReadableStreamDefaultController,
    },
    writable::{WritableSink, WritableStream, WritableStreamDefaultController},
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    channel::{
        mpsc::{UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, Future, poll_fn},
    stream::{self, Stream, StreamExt},
};
use parking_lot::Mutex;
use std::{marker::PhantomData, task::Poll};
use tracing::debug;

/// Commands sent to the task that owns the transformer
enum TransformCommand<I> {
    Write {
        chunk: I,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Flush {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Cancel(CancelRequest),
}

#[derive(Debug, Clone, Copy)]
enum CancelOrigin {
    /// The readable side was canceled by its consumer.
    Readable,
    /// The writable side was aborted or errored.
    Writable,
}

struct CancelRequest {
    reason: Option<String>,
    origin: CancelOrigin,
    completion: oneshot::Sender<StreamResult<()>>,
}

/// Backpressure flag shared by both sides of a transform stream.
///
/// Asserted while the readable side has no room; writes wait for its release
/// before reaching the transformer.
pub(crate) struct BackpressureGate {
    asserted: Mutex<bool>,
    wakers: WakerSet,
}

impl BackpressureGate {
    fn new() -> Self {
        Self {
            asserted: Mutex::new(true),
            wakers: WakerSet::new(),
        }
    }

    fn set(&self, asserted: bool) {
        *self.asserted.lock() = asserted;
        if !asserted {
            self.wakers.wake_all();
        }
    }

    fn is_asserted(&self) -> bool {
        *self.asserted.lock()
    }

    fn released(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            self.wakers.register(cx.waker());
            if self.is_asserted() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
    }
}

/// How the transform stream finished. Recorded once; later cancel, write
/// and flush requests settle from it without calling the transformer.
struct Finished {
    result: StreamResult<()>,
    error: StreamError,
}

struct TransformShared<O: MaybeSend + 'static> {
    readable: SharedPtr<ReadableShared<O>>,
    writable: WritableStreamDefaultController,
    gate: SharedPtr<BackpressureGate>,
    finished: Mutex<Option<Finished>>,
}

impl<O: MaybeSend + 'static> TransformShared<O> {
    fn finish(&self, result: StreamResult<()>, error: StreamError) {
        let mut finished = self.finished.lock();
        if finished.is_none() {
            *finished = Some(Finished { result, error });
        }
    }

    fn finished_error(&self) -> Option<StreamError> {
        self.finished.lock().as_ref().map(|f| f.error.clone())
    }

    fn finished_result(&self) -> Option<StreamResult<()>> {
        self.finished.lock().as_ref().map(|f| f.result.clone())
    }

    fn error_writable_and_unblock(&self, error: StreamError) {
        self.writable.error(error);
        self.gate.set(false);
    }
}

/// Controller for transform operations
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    shared: SharedPtr<TransformShared<O>>,
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
    /// Reasserts backpressure when the readable side has no room left. If the
    /// readable side can no longer take chunks, the writable side is errored
    /// with the same error.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let gate = &self.shared.gate;
        match self
            .shared
            .readable
            .enqueue_with_backpressure(chunk, || gate.set(true))
        {
            Ok(()) => Ok(()),
            Err(error) => {
                self.shared.error_writable_and_unblock(error.clone());
                Err(error)
            }
        }
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        self.shared.readable.error(error.clone());
        self.shared.error_writable_and_unblock(error.clone());
        self.shared.finish(Ok(()), error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        if let Err(error) = self.shared.readable.close() {
            debug!(stream = self.shared.readable.id, %error, "readable side already finished");
        }
        self.shared.error_writable_and_unblock(StreamError::Terminated);
        self.shared.finish(Ok(()), StreamError::Terminated);
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<isize> {
        self.shared.readable.desired_size()
    }
}

/// Transformer trait
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>:
    MaybeSend + Sized + 'static
{
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

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called when the readable side is canceled or the writable side aborted
    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

fn request_cancel(
    origin: CancelOrigin,
    reason: Option<String>,
) -> (CancelRequest, oneshot::Receiver<StreamResult<()>>) {
    let (completion, rx) = oneshot::channel();
    let request = CancelRequest {
        reason,
        origin,
        completion,
    };
    (request, rx)
}

/// Readable source for the transform stream
pub struct TransformReadableSource<O> {
    gate: SharedPtr<BackpressureGate>,
    cancels: UnboundedSender<CancelRequest>,
    _chunk: PhantomData<fn() -> O>,
}

impl<O: MaybeSend + 'static> ReadableSource<O> for TransformReadableSource<O> {
    fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.gate.set(false);
        future::ready(Ok(()))
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        let (request, rx) = request_cancel(CancelOrigin::Readable, reason);
        self.cancels
            .unbounded_send(request)
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

/// Writable sink feeding the transformer
pub struct TransformWritableSink<I> {
    gate: SharedPtr<BackpressureGate>,
    commands: UnboundedSender<TransformCommand<I>>,
}

impl<I: MaybeSend + 'static> TransformWritableSink<I> {
    async fn send(
        &self,
        command: TransformCommand<I>,
        rx: oneshot::Receiver<StreamResult<()>>,
    ) -> StreamResult<()> {
        self.commands
            .unbounded_send(command)
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

impl<I: MaybeSend + 'static> WritableSink<I> for TransformWritableSink<I> {
    async fn write(
        &mut self,
        chunk: I,
        controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        if self.gate.is_asserted() {
            // An abort must not wait for a reader that may never come.
            controller.with_abort(self.gate.released()).await?;
        }
        let (completion, rx) = oneshot::channel();
        self.send(TransformCommand::Write { chunk, completion }, rx)
            .await
    }

    async fn close(self) -> StreamResult<()> {
        let (completion, rx) = oneshot::channel();
        self.send(TransformCommand::Flush { completion }, rx).await
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        let (request, rx) = request_cancel(CancelOrigin::Writable, reason);
        self.send(TransformCommand::Cancel(request), rx).await
    }
}

async fn run_transformer<I, O, T, C>(
    mut transformer: T,
    mut commands: C,
    mut controller: TransformStreamDefaultController<O>,
) where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
    C: Stream<Item = TransformCommand<I>> + Unpin,
{
    let id = controller.shared.readable.id;
    if let Err(error) = transformer.start(&mut controller).await {
        debug!(stream = id, %error, "transformer start failed");
        controller.error(error);
    }

    // Runs until both the source and the sink have been dropped.
    while let Some(command) = commands.next().await {
        match command {
            TransformCommand::Write { chunk, completion } => {
                let result = match controller.shared.finished_error() {
                    Some(error) => Err(error),
                    None => {
                        let result = transformer.transform(chunk, &mut controller).await;
                        if let Err(error) = &result {
                            debug!(stream = id, %error, "transform failed");
                            controller.error(error.clone());
                        }
                        result
                    }
                };
                let _ = completion.send(result);
            }
            TransformCommand::Flush { completion } => {
                let result = match controller.shared.finished_error() {
                    Some(error) => Err(error),
                    None => match transformer.flush(&mut controller).await {
                        Ok(()) => {
                            // Flush may already have terminated the stream.
                            let _ = controller.shared.readable.close();
                            controller.shared.finish(Ok(()), StreamError::Closed);
                            Ok(())
                        }
                        Err(error) => {
                            debug!(stream = id, %error, "transformer flush failed");
                            controller.shared.readable.error(error.clone());
                            controller
                                .shared
                                .finish(Err(error.clone()), error.clone());
                            Err(error)
                        }
                    },
                };
                let _ = completion.send(result);
            }
            TransformCommand::Cancel(request) => {
                let result = match controller.shared.finished_result() {
                    Some(result) => result,
                    None => {
                        debug!(
                            stream = id,
                            origin = ?request.origin,
                            reason = ?request.reason,
                            "canceling transformer"
                        );
                        let result = transformer.cancel(request.reason.clone()).await;
                        let error = match &result {
                            Ok(()) => match request.origin {
                                CancelOrigin::Readable => StreamError::Canceled(request.reason),
                                CancelOrigin::Writable => StreamError::Aborted(request.reason),
                            },
                            Err(error) => error.clone(),
                        };
                        match request.origin {
                            CancelOrigin::Readable => {
                                controller.shared.error_writable_and_unblock(error.clone())
                            }
                            CancelOrigin::Writable => {
                                controller.shared.readable.error(error.clone())
                            }
                        }
                        controller.shared.finish(result.clone(), error);
                        result
                    }
                };
                let _ = request.completion.send(result);
            }
        }
    }
}

/// TransformStream connecting readable and writable sides
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O, TransformReadableSource<O>>,
    writable: WritableStream<I, TransformWritableSink<I>>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    /// Returns a builder for a transform stream driven by `transformer`
    pub fn builder<T>(transformer: T) -> TransformStreamBuilder<I, O, T>
    where
        T: Transformer<I, O>,
    {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(self) -> ReadableStream<O, TransformReadableSource<O>> {
        self.readable
    }

    /// Get the writable side
    pub fn writable(self) -> WritableStream<I, TransformWritableSink<I>> {
        self.writable
    }

    /// Split into both sides
    pub fn split(
        self,
    ) -> (
        ReadableStream<O, TransformReadableSource<O>>,
        WritableStream<I, TransformWritableSink<I>>,
    ) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// A transform stream that passes chunks through unchanged.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    /// A transform stream applying `f` to every chunk.
    pub fn map<F>(f: F) -> TransformStreamBuilder<I, O, MapTransformer<F>>
    where
        F: FnMut(I) -> O + MaybeSend + 'static,
    {
        TransformStreamBuilder::new(MapTransformer::new(f))
    }
}

pub struct TransformStreamBuilder<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    transformer: T,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
}

impl<I, O, T> TransformStreamBuilder<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    fn new(transformer: T) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(
                DEFAULT_WRITABLE_HIGH_WATER_MARK,
            )),
            readable_strategy: Box::new(CountQueuingStrategy::new(
                DEFAULT_TRANSFORM_READABLE_HIGH_WATER_MARK,
            )),
        }
    }

    pub fn writable_strategy<S: QueuingStrategy<I> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.writable_strategy = Box::new(s);
        self
    }

    pub fn readable_strategy<S: QueuingStrategy<O> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.readable_strategy = Box::new(s);
        self
    }

    /// Return the stream and one future driving both sides and the
    /// transformer, without spawning
    pub fn prepare(self) -> (TransformStream<I, O>, impl Future<Output = ()>) {
        let gate = SharedPtr::new(BackpressureGate::new());
        let (command_tx, command_rx) = unbounded::<TransformCommand<I>>();
        let (cancel_tx, cancel_rx) = unbounded::<CancelRequest>();

        let source = TransformReadableSource {
            gate: gate.clone(),
            cancels: cancel_tx,
            _chunk: PhantomData,
        };
        let sink = TransformWritableSink {
            gate: gate.clone(),
            commands: command_tx,
        };

        let (readable, readable_fut) = ReadableStreamBuilder::<O, _, DefaultStream>::with_strategy(
            source,
            self.readable_strategy,
        )
        .prepare();
        let (writable, writable_fut) = WritableStream::builder(sink)
            .boxed_strategy(self.writable_strategy)
            .prepare();

        let controller = TransformStreamDefaultController {
            shared: SharedPtr::new(TransformShared {
                readable: readable.shared.clone(),
                writable: writable.controller(),
                gate,
                finished: Mutex::new(None),
            }),
        };
        let commands = stream::select(command_rx, cancel_rx.map(TransformCommand::Cancel));
        let transform_fut = run_transformer(self.transformer, commands, controller);

        let fut = async move {
            future::join3(readable_fut, writable_fut, transform_fut).await;
        };
        (TransformStream { readable, writable }, fut)
    }

    /// Spawn bundled into one task
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> TransformStream<I, O>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

/// An identity transformer that passes chunks through unchanged.
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn() -> T>,
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

/// Applies a closure to every chunk.
pub struct MapTransformer<F> {
    f: F,
}

impl<F> MapTransformer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<I, O, F> Transformer<I, O> for MapTransformer<F>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    F: FnMut(I) -> O + MaybeSend + 'static,
{
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue((self.f)(chunk)))
    }
}
