use super::{
    CountQueuingStrategy, DEFAULT_WRITABLE_HIGH_WATER_MARK, QueuingStrategy, StreamResult,
    WakerSet,
    error::StreamError,
    lock::{HandleGuard, LockGuard, LockOwner, LockToken},
    next_stream_id,
    queue::SizedQueue,
};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, Either, poll_fn},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    pin::pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll},
};
use tracing::{debug, trace};

/// Lifecycle of a writable stream.
///
/// `Erroring` is transient: the stream stays there until the write in flight
/// settles, then the sink is aborted and the state becomes `Errored`.
#[derive(Debug, Clone)]
pub enum WritableState {
    Writable,
    Closing,
    Erroring(StreamError),
    Errored(StreamError),
    Closed,
}

pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

struct PendingWrite<T> {
    chunk: T,
    completion: oneshot::Sender<StreamResult<()>>,
}

enum AbortPhase {
    Idle,
    Running,
    Done(StreamResult<()>),
}

enum SinkAction<T> {
    Write(T),
    Close,
    Abort(Option<String>),
    Exit,
}

struct WritableInner<T> {
    state: WritableState,
    queue: SizedQueue<PendingWrite<T>>,
    strategy: BoxedStrategy<T>,
    in_flight: Option<oneshot::Sender<StreamResult<()>>>,
    in_flight_size: usize,
    close_in_flight: bool,
    close_waiters: Vec<oneshot::Sender<StreamResult<()>>>,
    abort_phase: AbortPhase,
    abort_waiters: Vec<oneshot::Sender<StreamResult<()>>>,
}

impl<T> WritableInner<T> {
    /// The write in flight still counts against the high water mark.
    fn desired_size(&self) -> Option<isize> {
        match self.state {
            WritableState::Erroring(_) | WritableState::Errored(_) => None,
            WritableState::Closing | WritableState::Closed => Some(0),
            WritableState::Writable => {
                let total = self.queue.total_size() + self.in_flight_size;
                Some(self.strategy.high_water_mark() as isize - total as isize)
            }
        }
    }

    fn settle(waiters: &mut Vec<oneshot::Sender<StreamResult<()>>>, result: &StreamResult<()>) {
        for waiter in waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Abort notification handed to sinks through their controller.
#[derive(Default)]
struct AbortSignal {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    wakers: WakerSet,
}

impl AbortSignal {
    fn trigger(&self, reason: Option<String>) {
        *self.reason.lock() = reason;
        self.aborted.store(true, Ordering::Release);
        self.wakers.wake_all();
    }
}

/// Target of `WritableStreamDefaultController::error`, erased over the
/// chunk type so the controller stays non-generic.
pub(crate) trait ErrorTarget: MaybeSend + MaybeSync {
    fn error(&self, error: StreamError);
}

pub(crate) struct WritableShared<T> {
    pub(crate) id: u64,
    inner: Mutex<WritableInner<T>>,
    task_waker: AtomicWaker,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    locked: AtomicBool,
    handles: AtomicUsize,
    signal: SharedPtr<AbortSignal>,
}

impl<T: MaybeSend + 'static> WritableShared<T> {
    fn new(strategy: BoxedStrategy<T>) -> Self {
        Self {
            id: next_stream_id(),
            inner: Mutex::new(WritableInner {
                state: WritableState::Writable,
                queue: SizedQueue::new(),
                strategy,
                in_flight: None,
                in_flight_size: 0,
                close_in_flight: false,
                close_waiters: Vec::new(),
                abort_phase: AbortPhase::Idle,
                abort_waiters: Vec::new(),
            }),
            task_waker: AtomicWaker::new(),
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
            locked: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
            signal: SharedPtr::new(AbortSignal::default()),
        }
    }

    fn state(&self) -> WritableState {
        self.inner.lock().state.clone()
    }

    fn desired_size(&self) -> Option<isize> {
        self.inner.lock().desired_size()
    }

    fn wake_observers(&self) {
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
    }

    fn write(
        &self,
        token: &LockToken<Self>,
        chunk: T,
    ) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
        let mut inner = self.inner.lock();
        token.check()?;
        match &inner.state {
            WritableState::Writable => {}
            WritableState::Closing => return Err(StreamError::Closing),
            WritableState::Closed => return Err(StreamError::Closed),
            WritableState::Erroring(error) | WritableState::Errored(error) => {
                return Err(error.clone());
            }
        }
        let size = inner.strategy.size(&chunk);
        let (tx, rx) = oneshot::channel();
        inner.queue.push_back(
            PendingWrite {
                chunk,
                completion: tx,
            },
            size,
        );
        trace!(stream = self.id, queued = inner.queue.len(), "write queued");
        self.task_waker.wake();
        Ok(rx)
    }

    async fn close(&self) -> StreamResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            match &inner.state {
                WritableState::Closed => return Ok(()),
                WritableState::Erroring(error) | WritableState::Errored(error) => {
                    return Err(error.clone());
                }
                WritableState::Closing => {}
                WritableState::Writable => {
                    debug!(
                        stream = self.id,
                        queued = inner.queue.len(),
                        "writable close requested"
                    );
                    inner.state = WritableState::Closing;
                    self.ready_wakers.wake_all();
                    self.task_waker.wake();
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.close_waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            let (tx, rx) = oneshot::channel();
            match &inner.state {
                WritableState::Closed => return Ok(()),
                WritableState::Errored(_) => match &inner.abort_phase {
                    AbortPhase::Idle => return Ok(()),
                    AbortPhase::Done(result) => return result.clone(),
                    AbortPhase::Running => inner.abort_waiters.push(tx),
                },
                WritableState::Erroring(_) => inner.abort_waiters.push(tx),
                // A close already underway decides the outcome.
                WritableState::Closing => inner.close_waiters.push(tx),
                WritableState::Writable => {
                    debug!(stream = self.id, ?reason, "writable stream aborted");
                    self.signal.trigger(reason.clone());
                    self.start_erroring(&mut inner, StreamError::Aborted(reason));
                    inner.abort_waiters.push(tx);
                }
            }
            rx
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    fn start_erroring(&self, inner: &mut WritableInner<T>, error: StreamError) {
        let can_error = match inner.state {
            WritableState::Writable => true,
            WritableState::Closing => !inner.close_in_flight,
            _ => false,
        };
        if !can_error {
            return;
        }
        debug!(stream = self.id, %error, "writable stream erroring");
        inner.state = WritableState::Erroring(error);
        self.ready_wakers.wake_all();
        self.task_waker.wake();
    }

    fn poll_ready(&self, token: &LockToken<Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.ready_wakers.register(cx.waker());
        let inner = self.inner.lock();
        if token.is_released() {
            return Poll::Ready(Err(StreamError::LockReleased));
        }
        match &inner.state {
            WritableState::Erroring(error) | WritableState::Errored(error) => {
                Poll::Ready(Err(error.clone()))
            }
            WritableState::Closing | WritableState::Closed => Poll::Ready(Ok(())),
            WritableState::Writable => {
                if inner.desired_size().is_some_and(|size| size > 0) {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_closed(&self, token: &LockToken<Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.closed_wakers.register(cx.waker());
        let inner = self.inner.lock();
        if token.released_early() {
            return Poll::Ready(Err(StreamError::LockReleased));
        }
        match &inner.state {
            WritableState::Closed => Poll::Ready(Ok(())),
            WritableState::Errored(error) => Poll::Ready(Err(error.clone())),
            _ => Poll::Pending,
        }
    }

    // ----------- Driver side -----------

    fn poll_action(&self, cx: &mut Context<'_>) -> Poll<SinkAction<T>> {
        self.task_waker.register(cx.waker());
        let mut inner = self.inner.lock();

        if let WritableState::Erroring(error) = &inner.state {
            let error = error.clone();
            let pending: Vec<_> = inner.queue.drain().collect();
            for write in pending {
                let _ = write.completion.send(Err(error.clone()));
            }
            WritableInner::<T>::settle(&mut inner.close_waiters, &Err(error.clone()));
            debug!(stream = self.id, %error, "writable stream errored, aborting sink");
            let reason = error.reason();
            inner.state = WritableState::Errored(error);
            inner.abort_phase = AbortPhase::Running;
            self.wake_observers();
            return Poll::Ready(SinkAction::Abort(reason));
        }

        match inner.state {
            WritableState::Writable | WritableState::Closing => {}
            _ => return Poll::Ready(SinkAction::Exit),
        }

        if let Some((write, size)) = inner.queue.pop_front() {
            inner.in_flight = Some(write.completion);
            inner.in_flight_size = size;
            return Poll::Ready(SinkAction::Write(write.chunk));
        }

        if matches!(inner.state, WritableState::Closing) {
            inner.close_in_flight = true;
            return Poll::Ready(SinkAction::Close);
        }

        if self.handles.load(Ordering::Acquire) == 0 {
            trace!(stream = self.id, "all handles dropped, stopping sink task");
            return Poll::Ready(SinkAction::Exit);
        }
        Poll::Pending
    }

    fn start_finished(&self, result: StreamResult<()>) {
        if let Err(error) = result {
            debug!(stream = self.id, %error, "sink start failed");
            let mut inner = self.inner.lock();
            self.start_erroring(&mut inner, error);
        }
    }

    fn write_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        inner.in_flight_size = 0;
        if let Some(completion) = inner.in_flight.take() {
            let _ = completion.send(result.clone());
        }
        match result {
            Ok(()) => trace!(stream = self.id, "write accepted by sink"),
            Err(error) => self.start_erroring(&mut inner, error),
        }
        self.ready_wakers.wake_all();
    }

    fn close_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        inner.close_in_flight = false;
        match &result {
            Ok(()) => {
                debug!(stream = self.id, "writable stream closed");
                inner.state = WritableState::Closed;
            }
            Err(error) => {
                debug!(stream = self.id, %error, "sink close failed");
                inner.state = WritableState::Errored(error.clone());
            }
        }
        WritableInner::<T>::settle(&mut inner.close_waiters, &result);
        self.wake_observers();
    }

    fn abort_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        debug!(stream = self.id, ok = result.is_ok(), "sink abort settled");
        WritableInner::<T>::settle(&mut inner.abort_waiters, &result);
        inner.abort_phase = AbortPhase::Done(result);
    }

    /// The driver is gone: fail everything still waiting on it.
    fn abandon(&self) {
        let mut inner = self.inner.lock();
        let error = StreamError::TaskDropped;
        if !matches!(
            inner.state,
            WritableState::Closed | WritableState::Errored(_)
        ) {
            inner.state = WritableState::Errored(error.clone());
        }
        let pending: Vec<_> = inner.queue.drain().collect();
        for write in pending {
            let _ = write.completion.send(Err(error.clone()));
        }
        if let Some(completion) = inner.in_flight.take() {
            let _ = completion.send(Err(error.clone()));
        }
        WritableInner::<T>::settle(&mut inner.close_waiters, &Err(error.clone()));
        if matches!(inner.abort_phase, AbortPhase::Running) || !inner.abort_waiters.is_empty() {
            WritableInner::<T>::settle(&mut inner.abort_waiters, &Err(error.clone()));
            inner.abort_phase = AbortPhase::Done(Err(error));
        }
        self.wake_observers();
    }
}

impl<T: MaybeSend + 'static> ErrorTarget for WritableShared<T> {
    fn error(&self, error: StreamError) {
        let mut inner = self.inner.lock();
        self.start_erroring(&mut inner, error);
    }
}

impl<T: MaybeSend + 'static> LockOwner for WritableShared<T> {
    fn lock_flag(&self) -> &AtomicBool {
        &self.locked
    }

    fn handle_count(&self) -> &AtomicUsize {
        &self.handles
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.inner.lock().state,
            WritableState::Closed | WritableState::Errored(_)
        )
    }

    fn on_release(&self) {
        self.wake_observers();
    }

    fn on_detach(&self) {
        self.task_waker.wake();
    }
}

struct SinkTaskGuard<T: MaybeSend + 'static>(SharedPtr<WritableShared<T>>);

impl<T: MaybeSend + 'static> Drop for SinkTaskGuard<T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

fn drive_sink<T, Sink>(shared: SharedPtr<WritableShared<T>>, sink: Sink) -> impl Future<Output = ()>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let guard = SinkTaskGuard(shared);
    async move {
        let shared = &guard.0;
        let target: SharedPtr<dyn ErrorTarget> = shared.clone();
        let mut controller = WritableStreamDefaultController::new(target, shared.signal.clone());

        let mut sink = sink;
        let started = sink.start(&mut controller).await;
        shared.start_finished(started);

        // `close` consumes the sink.
        let mut sink = Some(sink);
        loop {
            match poll_fn(|cx| shared.poll_action(cx)).await {
                SinkAction::Write(chunk) => {
                    let result = match sink.as_mut() {
                        Some(sink) => sink.write(chunk, &mut controller).await,
                        None => Err(StreamError::Closed),
                    };
                    shared.write_finished(result);
                }
                SinkAction::Close => {
                    let result = match sink.take() {
                        Some(sink) => sink.close().await,
                        None => Ok(()),
                    };
                    shared.close_finished(result);
                }
                SinkAction::Abort(reason) => {
                    let result = match sink.as_mut() {
                        Some(sink) => sink.abort(reason).await,
                        None => Ok(()),
                    };
                    shared.abort_finished(result);
                }
                SinkAction::Exit => break,
            }
        }
    }
}

// ----------- Controller -----------
pub struct WritableStreamDefaultController {
    target: SharedPtr<dyn ErrorTarget>,
    signal: SharedPtr<AbortSignal>,
}

impl Clone for WritableStreamDefaultController {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl WritableStreamDefaultController {
    fn new(target: SharedPtr<dyn ErrorTarget>, signal: SharedPtr<AbortSignal>) -> Self {
        Self { target, signal }
    }

    /// Signal an error on the stream
    ///
    /// Ignored once the stream is closed, errored, or its close has already
    /// been handed to the sink.
    pub fn error(&self, error: StreamError) {
        self.target.error(error);
    }

    /// Returns `true` if the stream has been aborted.
    ///
    /// This is a synchronous check of the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.signal.aborted.load(Ordering::Acquire)
    }

    /// Returns a future that resolves once the stream is aborted.
    ///
    /// # Usage
    ///
    /// Sink implementors should `select!` or `tokio::select!` on this future
    /// alongside their actual write work, so they can stop promptly if
    /// the stream aborts:
    ///
    /// ```no_run
    /// # use streamflow::{StreamError, StreamResult, WritableStreamDefaultController};
    /// async fn write(
    ///     chunk: Vec<u8>,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     tokio::select! {
    ///         _ = controller.abort_future() => {
    ///             Err(StreamError::Aborted(None))
    ///         }
    ///         _ = async {
    ///             // do actual I/O
    ///         } => {
    ///             Ok(())
    ///         }
    ///     }
    /// }
    /// ```
    pub fn abort_future(&self) -> impl Future<Output = ()> + use<> {
        let signal = self.signal.clone();
        poll_fn(move |cx| {
            signal.wakers.register(cx.waker());
            if signal.aborted.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted)` carrying
    /// the abort reason. Otherwise, returns the result of the future wrapped
    /// in `Ok`.
    pub async fn with_abort<F: Future>(&self, fut: F) -> StreamResult<F::Output> {
        let fut = pin!(fut);
        let abort = pin!(self.abort_future());
        match future::select(fut, abort).await {
            Either::Left((value, _)) => Ok(value),
            Either::Right(((), _)) => Err(StreamError::Aborted(self.signal.reason.lock().clone())),
        }
    }
}

// ----------- Stream Handle -----------
pub struct WritableStream<T: MaybeSend + 'static, Sink> {
    shared: SharedPtr<WritableShared<T>>,
    _handle: HandleGuard<WritableShared<T>>,
    _sink: PhantomData<fn() -> Sink>,
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink> {
    fn from_shared(shared: SharedPtr<WritableShared<T>>) -> Self {
        Self {
            _handle: HandleGuard::new(&shared),
            shared,
            _sink: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WritableState {
        self.shared.state()
    }

    /// Acquire the exclusive writer lock.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T, Sink>> {
        let guard = LockGuard::acquire(&self.shared)?;
        trace!(stream = self.shared.id, "writer lock acquired");
        Ok(WritableStreamDefaultWriter {
            shared: self.shared.clone(),
            lock: SharedPtr::new(WriterLock {
                guard,
                _handle: HandleGuard::new(&self.shared),
            }),
            _sink: PhantomData,
        })
    }

    /// Abort an unlocked stream
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        self.shared.abort(reason).await
    }

    /// Close an unlocked stream
    pub async fn close(&self) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        self.shared.close().await
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn controller(&self) -> WritableStreamDefaultController {
        let target: SharedPtr<dyn ErrorTarget> = self.shared.clone();
        WritableStreamDefaultController::new(target, self.shared.signal.clone())
    }
}

impl<T, Sink> WritableStream<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }
}

// ----------- Writer -----------
struct WriterLock<T: MaybeSend + 'static> {
    guard: LockGuard<WritableShared<T>>,
    _handle: HandleGuard<WritableShared<T>>,
}

/// Write capability on a locked stream.
///
/// Clones share one lock: releasing it through any clone, or dropping the
/// last clone, invalidates all of them.
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    shared: SharedPtr<WritableShared<T>>,
    lock: SharedPtr<WriterLock<T>>,
    _sink: PhantomData<fn() -> Sink>,
}

impl<T: MaybeSend + 'static, Sink> Clone for WritableStreamDefaultWriter<T, Sink> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            lock: self.lock.clone(),
            _sink: PhantomData,
        }
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    fn token(&self) -> &SharedPtr<LockToken<WritableShared<T>>> {
        self.lock.guard.token()
    }

    /// Queue `chunk` and return a future that resolves once the sink has
    /// accepted it.
    ///
    /// The chunk is queued before this method returns, so several writes can
    /// be issued without awaiting each one; the sink still sees them one at a
    /// time, in call order.
    ///
    /// ```no_run
    /// # async fn demo(writer: streamflow::WritableStreamDefaultWriter<Vec<u8>, ()>) -> streamflow::StreamResult<()> {
    /// let first = writer.write(b"hello".to_vec());
    /// let second = writer.write(b"world".to_vec());
    /// first.await?;
    /// second.await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Calling `write()` without awaiting `ready()` ignores backpressure and
    /// lets the queue grow without bound; see [`enqueue_when_ready()`].
    ///
    /// [`enqueue_when_ready()`]: Self::enqueue_when_ready
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let queued = self.shared.write(self.token(), chunk);
        async move { queued?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    /// Waits for the stream to be ready (i.e., no backpressure) before
    /// queuing a write whose completion is not tracked.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        self.ready().await?;
        self.enqueue(chunk)
    }

    /// Immediately enqueue a chunk for writing without waiting for completion.
    ///
    /// Fails only if the chunk cannot be queued at all (released lock,
    /// closing, closed or errored stream). Backpressure is not honored.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.shared.write(self.token(), chunk).map(drop)
    }

    /// Close the stream once every queued write has been accepted.
    pub async fn close(&self) -> StreamResult<()> {
        self.token().check()?;
        self.shared.close().await
    }

    /// Abort the stream with an optional reason
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        self.token().check()?;
        self.shared.abort(reason).await
    }

    /// How much more the stream wants queued. `None` once the stream is
    /// erroring or errored, or the lock was released.
    pub fn desired_size(&self) -> Option<isize> {
        if self.token().is_released() {
            return None;
        }
        self.shared.desired_size()
    }

    /// Resolves while the stream has spare capacity (or is closing), rejects
    /// once it is erroring or errored.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let shared = self.shared.clone();
        let token = self.token().clone();
        poll_fn(move |cx| shared.poll_ready(&token, cx))
    }

    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let shared = self.shared.clone();
        let token = self.token().clone();
        poll_fn(move |cx| shared.poll_closed(&token, cx))
    }

    /// Release the lock for this writer and all of its clones.
    pub fn release_lock(self) {
        trace!(stream = self.shared.id, "writer lock released");
        self.token().release();
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(DEFAULT_WRITABLE_HIGH_WATER_MARK)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    pub(crate) fn boxed_strategy(mut self, strategy: BoxedStrategy<T>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (WritableStream<T, Sink>, impl Future<Output = ()>) {
        let shared = SharedPtr::new(WritableShared::new(self.strategy));
        let stream = WritableStream::from_shared(shared.clone());
        (stream, drive_sink(shared, self.sink))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Sink>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> WritableStream<T, Sink>
    where
        F: Fn(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
