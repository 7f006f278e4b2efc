use super::{
    CountQueuingStrategy, DEFAULT_READABLE_HIGH_WATER_MARK, DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE,
    QueuingStrategy, StreamResult, WakerSet,
    error::StreamError,
    lock::{HandleGuard, LockGuard, LockOwner, LockToken},
    next_stream_id,
    queue::SizedQueue,
};
use crate::platform::{BoxedStrategy, MaybeSend, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, poll_fn},
    stream::{self, Stream, StreamExt},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub enum StreamState {
    Readable,
    Closed,
    Errored(StreamError),
}

// ----------- Stream Type Markers -----------
pub struct DefaultStream;
pub struct ByteStream;

pub trait StreamTypeMarker: MaybeSend + 'static {}

impl StreamTypeMarker for DefaultStream {}
impl StreamTypeMarker for ByteStream {}

// ----------- Source Traits -----------
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Core State -----------
pub(crate) type SplitChunk<T> = fn(&mut T, usize) -> Option<T>;

struct PendingRead<T> {
    /// Upper bound on the delivered chunk, set by BYOB reads.
    max_len: Option<usize>,
    completion: oneshot::Sender<StreamResult<Option<T>>>,
}

enum CancelState {
    Idle,
    Requested(Option<String>),
    Running,
    Finished(StreamResult<()>),
}

pub(crate) enum SourceAction {
    Pull,
    Cancel(Option<String>),
    Exit,
}

struct ReadableInner<T> {
    state: StreamState,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    pending_reads: VecDeque<PendingRead<T>>,
    started: bool,
    close_requested: bool,
    pulling: bool,
    pull_again: bool,
    pull_scheduled: bool,
    cancel: CancelState,
    cancel_waiters: Vec<oneshot::Sender<StreamResult<()>>>,
    split_chunk: Option<SplitChunk<T>>,
}

impl<T> ReadableInner<T> {
    fn desired_size(&self) -> Option<isize> {
        match self.state {
            StreamState::Errored(_) => None,
            StreamState::Closed => Some(0),
            StreamState::Readable => Some(
                self.strategy.high_water_mark() as isize - self.queue.total_size() as isize,
            ),
        }
    }

    fn has_live_reads(&self) -> bool {
        self.pending_reads
            .iter()
            .any(|read| !read.completion.is_canceled())
    }

    fn should_call_pull(&self) -> bool {
        matches!(self.state, StreamState::Readable)
            && self.started
            && !self.close_requested
            && matches!(self.cancel, CancelState::Idle)
            && (self.has_live_reads() || self.desired_size().is_some_and(|size| size > 0))
    }

    /// Hand `chunk` to the oldest live pending read, queueing whatever is
    /// left over once no read is waiting.
    fn deliver(&mut self, mut chunk: T) {
        while let Some(read) = self.pending_reads.pop_front() {
            if read.completion.is_canceled() {
                continue;
            }
            let rest = match (read.max_len, self.split_chunk) {
                (Some(max_len), Some(split)) => split(&mut chunk, max_len),
                _ => None,
            };
            match read.completion.send(Ok(Some(chunk))) {
                Ok(()) => match rest {
                    Some(rest) => chunk = rest,
                    None => return,
                },
                // The reader went away between the check and the send.
                Err(Ok(Some(head))) => {
                    self.deliver(head);
                    if let Some(rest) = rest {
                        self.deliver(rest);
                    }
                    return;
                }
                Err(_) => return,
            }
        }
        let size = self.strategy.size(&chunk);
        self.queue.push_back(chunk, size);
    }

    fn reject_pending_reads(&mut self, error: &StreamError) {
        for read in self.pending_reads.drain(..) {
            let _ = read.completion.send(Err(error.clone()));
        }
    }

    fn finish_pending_reads(&mut self) {
        for read in self.pending_reads.drain(..) {
            let _ = read.completion.send(Ok(None));
        }
    }
}

/// State shared between the stream handle, its reader, its controllers and
/// the task driving the source.
pub(crate) struct ReadableShared<T> {
    pub(crate) id: u64,
    inner: Mutex<ReadableInner<T>>,
    task_waker: AtomicWaker,
    closed_wakers: WakerSet,
    locked: AtomicBool,
    handles: AtomicUsize,
}

impl<T: MaybeSend + 'static> ReadableShared<T> {
    pub(crate) fn new(strategy: BoxedStrategy<T>, split_chunk: Option<SplitChunk<T>>) -> Self {
        Self {
            id: next_stream_id(),
            inner: Mutex::new(ReadableInner {
                state: StreamState::Readable,
                queue: SizedQueue::new(),
                strategy,
                pending_reads: VecDeque::new(),
                started: false,
                close_requested: false,
                pulling: false,
                pull_again: false,
                pull_scheduled: false,
                cancel: CancelState::Idle,
                cancel_waiters: Vec::new(),
                split_chunk,
            }),
            task_waker: AtomicWaker::new(),
            closed_wakers: WakerSet::new(),
            locked: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.inner.lock().state.clone()
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        self.inner.lock().desired_size()
    }

    /// Size limit of the oldest outstanding BYOB read, if any.
    pub(crate) fn pending_read_len(&self) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .pending_reads
            .iter()
            .find(|read| !read.completion.is_canceled())
            .and_then(|read| read.max_len)
    }

    fn call_pull_if_needed(&self, inner: &mut ReadableInner<T>) {
        if !inner.should_call_pull() {
            return;
        }
        if inner.pulling {
            inner.pull_again = true;
            return;
        }
        inner.pulling = true;
        inner.pull_scheduled = true;
        self.task_waker.wake();
    }

    fn check_enqueue(inner: &ReadableInner<T>) -> StreamResult<()> {
        match &inner.state {
            StreamState::Errored(error) => Err(error.clone()),
            StreamState::Closed => Err(StreamError::Closed),
            StreamState::Readable if inner.close_requested => Err(StreamError::Closing),
            StreamState::Readable => Ok(()),
        }
    }

    pub(crate) fn enqueue(&self, chunk: T) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        Self::check_enqueue(&inner)?;
        inner.deliver(chunk);
        trace!(stream = self.id, queued = inner.queue.len(), "chunk enqueued");
        self.call_pull_if_needed(&mut inner);
        Ok(())
    }

    /// Enqueue and, still under the core's lock, run `on_backpressure` if
    /// the stream now asserts backpressure towards its producer. A pull
    /// scheduled afterwards always observes the flag it sets.
    pub(crate) fn enqueue_with_backpressure(
        &self,
        chunk: T,
        on_backpressure: impl FnOnce(),
    ) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        Self::check_enqueue(&inner)?;
        inner.deliver(chunk);
        self.call_pull_if_needed(&mut inner);
        if !inner.should_call_pull() {
            on_backpressure();
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        Self::check_enqueue(&inner)?;
        inner.close_requested = true;
        debug!(stream = self.id, queued = inner.queue.len(), "readable close requested");
        if inner.queue.is_empty() {
            self.finish_close(&mut inner);
        }
        Ok(())
    }

    fn finish_close(&self, inner: &mut ReadableInner<T>) {
        debug!(stream = self.id, "readable stream closed");
        inner.state = StreamState::Closed;
        inner.finish_pending_reads();
        self.closed_wakers.wake_all();
        self.task_waker.wake();
    }

    pub(crate) fn error(&self, error: StreamError) {
        let mut inner = self.inner.lock();
        self.error_locked(&mut inner, error);
    }

    fn error_locked(&self, inner: &mut ReadableInner<T>, error: StreamError) {
        if !matches!(inner.state, StreamState::Readable) {
            return;
        }
        debug!(stream = self.id, %error, "readable stream errored");
        inner.queue.clear();
        inner.reject_pending_reads(&error);
        inner.state = StreamState::Errored(error);
        self.closed_wakers.wake_all();
        self.task_waker.wake();
    }

    /// Dequeue immediately when possible, otherwise register a pending read.
    fn read_locked(
        &self,
        inner: &mut ReadableInner<T>,
        max_len: Option<usize>,
    ) -> Result<StreamResult<Option<T>>, oneshot::Receiver<StreamResult<Option<T>>>> {
        if let Some((mut chunk, _)) = inner.queue.pop_front() {
            if let (Some(max_len), Some(split)) = (max_len, inner.split_chunk) {
                if let Some(rest) = split(&mut chunk, max_len) {
                    let size = inner.strategy.size(&rest);
                    inner.queue.push_front(rest, size);
                }
            }
            trace!(stream = self.id, queued = inner.queue.len(), "chunk read");
            if inner.close_requested && inner.queue.is_empty() {
                self.finish_close(inner);
            } else {
                self.call_pull_if_needed(inner);
            }
            return Ok(Ok(Some(chunk)));
        }
        match &inner.state {
            StreamState::Closed => Ok(Ok(None)),
            StreamState::Errored(error) => Ok(Err(error.clone())),
            StreamState::Readable => {
                let (tx, rx) = oneshot::channel();
                inner.pending_reads.push_back(PendingRead {
                    max_len,
                    completion: tx,
                });
                self.call_pull_if_needed(inner);
                Err(rx)
            }
        }
    }

    pub(crate) async fn read(
        &self,
        token: &LockToken<Self>,
        max_len: Option<usize>,
    ) -> StreamResult<Option<T>> {
        let rx = {
            let mut inner = self.inner.lock();
            // Checked under the core lock so a concurrent release either sees
            // this read as pending or this read sees the release.
            token.check()?;
            match self.read_locked(&mut inner, max_len) {
                Ok(result) => return result,
                Err(rx) => rx,
            }
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub(crate) async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        let rx = {
            let mut inner = self.inner.lock();
            if let CancelState::Finished(result) = &inner.cancel {
                return result.clone();
            }
            if matches!(inner.cancel, CancelState::Idle) {
                match &inner.state {
                    StreamState::Errored(error) => return Err(error.clone()),
                    StreamState::Closed => return Ok(()),
                    StreamState::Readable => {}
                }
                debug!(stream = self.id, ?reason, "readable stream canceled");
                inner.state = StreamState::Closed;
                inner.queue.clear();
                inner.finish_pending_reads();
                inner.cancel = CancelState::Requested(reason);
                self.closed_wakers.wake_all();
                self.task_waker.wake();
            }
            let (tx, rx) = oneshot::channel();
            inner.cancel_waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub(crate) fn poll_closed(
        &self,
        token: &LockToken<Self>,
        cx: &mut Context<'_>,
    ) -> Poll<StreamResult<()>> {
        self.closed_wakers.register(cx.waker());
        let inner = self.inner.lock();
        if token.released_early() {
            return Poll::Ready(Err(StreamError::LockReleased));
        }
        match &inner.state {
            StreamState::Readable => Poll::Pending,
            StreamState::Closed => Poll::Ready(Ok(())),
            StreamState::Errored(error) => Poll::Ready(Err(error.clone())),
        }
    }

    // ----------- Driver side -----------

    pub(crate) fn poll_action(&self, cx: &mut Context<'_>) -> Poll<SourceAction> {
        self.task_waker.register(cx.waker());
        let mut inner = self.inner.lock();

        if matches!(inner.cancel, CancelState::Requested(_)) {
            if let CancelState::Requested(reason) =
                std::mem::replace(&mut inner.cancel, CancelState::Running)
            {
                return Poll::Ready(SourceAction::Cancel(reason));
            }
        }

        if inner.pull_scheduled {
            inner.pull_scheduled = false;
            if matches!(inner.state, StreamState::Readable) {
                return Poll::Ready(SourceAction::Pull);
            }
            inner.pulling = false;
        }

        let cancel_settled = matches!(inner.cancel, CancelState::Idle | CancelState::Finished(_));
        if !matches!(inner.state, StreamState::Readable) && cancel_settled {
            return Poll::Ready(SourceAction::Exit);
        }
        if self.handles.load(Ordering::Acquire) == 0 && cancel_settled {
            trace!(stream = self.id, "all handles dropped, stopping source task");
            return Poll::Ready(SourceAction::Exit);
        }
        Poll::Pending
    }

    pub(crate) fn start_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.started = true;
                self.call_pull_if_needed(&mut inner);
            }
            Err(error) => {
                debug!(stream = self.id, %error, "source start failed");
                self.error_locked(&mut inner, error);
            }
        }
    }

    pub(crate) fn pull_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        inner.pulling = false;
        match result {
            Ok(()) => {
                if inner.pull_again {
                    inner.pull_again = false;
                    self.call_pull_if_needed(&mut inner);
                }
            }
            Err(error) => {
                debug!(stream = self.id, %error, "source pull failed");
                self.error_locked(&mut inner, error);
            }
        }
    }

    pub(crate) fn cancel_finished(&self, result: StreamResult<()>) {
        let mut inner = self.inner.lock();
        debug!(stream = self.id, ok = result.is_ok(), "source cancel settled");
        for waiter in inner.cancel_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        inner.cancel = CancelState::Finished(result);
    }

    /// The driver is gone: nothing will ever pull or cancel again.
    fn abandon(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.cancel, CancelState::Requested(_) | CancelState::Running) {
            let result = Err(StreamError::TaskDropped);
            for waiter in inner.cancel_waiters.drain(..) {
                let _ = waiter.send(result.clone());
            }
            inner.cancel = CancelState::Finished(result);
        }
        self.error_locked(&mut inner, StreamError::TaskDropped);
    }
}

impl<T: MaybeSend + 'static> LockOwner for ReadableShared<T> {
    fn lock_flag(&self) -> &AtomicBool {
        &self.locked
    }

    fn handle_count(&self) -> &AtomicUsize {
        &self.handles
    }

    fn is_settled(&self) -> bool {
        !matches!(self.inner.lock().state, StreamState::Readable)
    }

    fn on_release(&self) {
        let mut inner = self.inner.lock();
        inner.reject_pending_reads(&StreamError::LockReleased);
        self.closed_wakers.wake_all();
    }

    fn on_detach(&self) {
        self.task_waker.wake();
    }
}

/// Owned by the driver future; abandons the core if the future is dropped
/// before the core reached a terminal state.
pub(crate) struct TaskGuard<T: MaybeSend + 'static>(pub(crate) SharedPtr<ReadableShared<T>>);

impl<T: MaybeSend + 'static> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

fn drive_source<T, Source>(
    shared: SharedPtr<ReadableShared<T>>,
    mut source: Source,
) -> impl Future<Output = ()>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    let guard = TaskGuard(shared);
    async move {
        let shared = &guard.0;
        let mut controller = ReadableStreamDefaultController::new(shared.clone());

        let started = source.start(&mut controller).await;
        shared.start_finished(started);

        loop {
            match poll_fn(|cx| shared.poll_action(cx)).await {
                SourceAction::Pull => {
                    let result = source.pull(&mut controller).await;
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

// ----------- Controllers -----------
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    shared: SharedPtr<ReadableShared<T>>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(shared: SharedPtr<ReadableShared<T>>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared_ref(&self) -> &SharedPtr<ReadableShared<T>> {
        &self.shared
    }

    /// `None` once the stream has errored, `0` once it is closed.
    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    /// Close the stream once every queued chunk has been read.
    pub fn close(&self) -> StreamResult<()> {
        self.shared.close()
    }

    /// Deliver a chunk to the oldest waiting read or append it to the queue.
    ///
    /// Fails with a type error once the stream is closing or closed, and
    /// with the stored error once it has errored.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.shared.enqueue(chunk)
    }

    pub fn error(&self, error: StreamError) {
        self.shared.error(error)
    }
}

// ----------- Stream Handle -----------
pub struct ReadableStream<T, Source, StreamType = DefaultStream>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    pub(crate) shared: SharedPtr<ReadableShared<T>>,
    _handle: HandleGuard<ReadableShared<T>>,
    _marker: PhantomData<fn() -> (Source, StreamType)>,
}

impl<T, Source, StreamType> ReadableStream<T, Source, StreamType>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    pub(crate) fn from_shared(shared: SharedPtr<ReadableShared<T>>) -> Self {
        Self {
            _handle: HandleGuard::new(&shared),
            shared,
            _marker: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Acquire the exclusive reader lock.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T, Source, StreamType>> {
        ReadableStreamDefaultReader::new(&self.shared)
    }

    /// Cancel an unlocked stream. Fails with `Locked` while a reader holds
    /// the lock; cancel through the reader instead.
    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        self.shared.cancel(reason).await
    }

    pub(crate) fn controller(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController::new(self.shared.clone())
    }
}

impl<T: MaybeSend + 'static, Source> ReadableStream<T, Source, DefaultStream>
where
    Source: ReadableSource<T>,
{
    /// Returns a builder for this readable stream
    pub fn builder(source: Source) -> ReadableStreamBuilder<T, Source, DefaultStream> {
        ReadableStreamBuilder::new(source)
    }
}

// Shortcut methods on ReadableStream for common cases
impl<T: MaybeSend + 'static> ReadableStream<T, IteratorSource<std::vec::IntoIter<T>>> {
    /// Create from Vec - shortcut for ReadableStreamBuilder::from_vec()
    pub fn from_vec(
        vec: Vec<T>,
    ) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>, DefaultStream> {
        ReadableStreamBuilder::from_vec(vec)
    }
}

impl<T: MaybeSend + 'static, I> ReadableStream<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// Create from Iterator - shortcut for ReadableStreamBuilder::from_iterator()
    pub fn from_iterator(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>, DefaultStream> {
        ReadableStreamBuilder::from_iterator(iter)
    }
}

impl<T: MaybeSend + 'static, S> ReadableStream<T, AsyncStreamSource<S>>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// Create from Stream - shortcut for ReadableStreamBuilder::from_stream()
    pub fn from_stream(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>, DefaultStream> {
        ReadableStreamBuilder::from_stream(stream)
    }
}

// ----------- Example Source Implementations  -----------
pub struct IteratorSource<I: MaybeSend + 'static> {
    iter: I,
}

impl<I: MaybeSend + 'static, T: MaybeSend + 'static> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.iter.next() {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S: MaybeSend + 'static> {
    stream: S,
}

impl<S: MaybeSend + 'static, T: MaybeSend + 'static> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.stream.next().await {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

// ----------- Default Reader -----------
/// Exclusive read capability. Dropping the reader releases its lock.
pub struct ReadableStreamDefaultReader<T, Source, StreamType = DefaultStream>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    shared: SharedPtr<ReadableShared<T>>,
    lock: LockGuard<ReadableShared<T>>,
    _handle: HandleGuard<ReadableShared<T>>,
    _marker: PhantomData<fn() -> (Source, StreamType)>,
}

impl<T, Source, StreamType> ReadableStreamDefaultReader<T, Source, StreamType>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    pub(crate) fn new(shared: &SharedPtr<ReadableShared<T>>) -> StreamResult<Self> {
        let lock = LockGuard::acquire(shared)?;
        trace!(stream = shared.id, "reader lock acquired");
        Ok(Self {
            shared: shared.clone(),
            lock,
            _handle: HandleGuard::new(shared),
            _marker: PhantomData,
        })
    }

    /// Resolves with the next chunk in enqueue order, or `None` once the
    /// stream is closed and drained.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        self.shared.read(self.lock.token(), None).await
    }

    /// Resolves when the stream closes, rejects when it errors or when this
    /// reader's lock is released first.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Source, StreamType> {
        let shared = self.shared.clone();
        let token = self.lock.token().clone();
        poll_fn(move |cx| shared.poll_closed(&token, cx))
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        self.lock.token().check()?;
        self.shared.cancel(reason).await
    }

    /// Release the lock. Reads still pending are rejected with
    /// `LockReleased`.
    pub fn release_lock(self) {
        trace!(stream = self.shared.id, "reader lock released");
    }

    /// Adapt the reader into a `futures::Stream` that ends after the stream
    /// closes or yields its error once.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> {
        stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T, Source, StreamType = DefaultStream>
where
    T: MaybeSend + 'static,
    StreamType: StreamTypeMarker,
{
    pub(crate) source: Source,
    pub(crate) strategy: BoxedStrategy<T>,
    pub(crate) auto_allocate_chunk_size: usize,
    _phantom: PhantomData<fn() -> StreamType>,
}

impl<T: MaybeSend + 'static, Source, StreamType: StreamTypeMarker>
    ReadableStreamBuilder<T, Source, StreamType>
{
    pub(crate) fn with_strategy(source: Source, strategy: BoxedStrategy<T>) -> Self {
        Self {
            source,
            strategy,
            auto_allocate_chunk_size: DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE,
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }
}

impl<T: MaybeSend + 'static, Source> ReadableStreamBuilder<T, Source, DefaultStream>
where
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self::with_strategy(
            source,
            Box::new(CountQueuingStrategy::new(DEFAULT_READABLE_HIGH_WATER_MARK)),
        )
    }

    /// Return stream + future without spawning
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<T, Source, DefaultStream>,
        impl Future<Output = ()>,
    ) {
        let shared = SharedPtr::new(ReadableShared::new(self.strategy, None));
        let stream = ReadableStream::from_shared(shared.clone());
        (stream, drive_source(shared, self.source))
    }

    /// Spawn bundled into one task
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, Source, DefaultStream>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream<T, Source, DefaultStream>
    where
        F: Fn(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// Convenience constructors as static methods on the builder
impl<T: MaybeSend + 'static> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
    /// Create a builder from a Vec
    pub fn from_vec(vec: Vec<T>) -> Self {
        Self::new(IteratorSource {
            iter: vec.into_iter(),
        })
    }
}

impl<T: MaybeSend + 'static, I> ReadableStreamBuilder<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// Create a builder from an Iterator
    pub fn from_iterator(iter: I) -> Self {
        Self::new(IteratorSource { iter })
    }
}

impl<T: MaybeSend + 'static, S> ReadableStreamBuilder<T, AsyncStreamSource<S>>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// Create a builder from a Stream
    pub fn from_stream(stream: S) -> Self {
        Self::new(AsyncStreamSource { stream })
    }
}


#[cfg(all(test, feature = "send"))]
mod builder_tests {
    use super::*;

    pub struct TestSource {
        pub data: Vec<String>,
        pub index: usize,
    }

    impl TestSource {
        pub fn new(data: Vec<String>) -> Self {
            Self { data, index: 0 }
        }
    }

    impl ReadableSource<String> for TestSource {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<String>,
        ) -> Result<(), StreamError> {
            if self.index < self.data.len() {
                let item = self.data[self.index].clone();
                self.index += 1;
                controller.enqueue(item)?;
            } else {
                controller.close()?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn builder_prepare_allows_manual_task_spawn() {
        let source = TestSource::new(vec!["test".to_string()]);
        let (stream, fut) = ReadableStream::builder(source).prepare();

        tokio::spawn(fut);

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some("test".to_string()));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    fn spawn_fn(fut: futures::future::BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }

    #[tokio::test]
    async fn builder_spawn_ref_works_with_function_pointer() {
        let source = TestSource::new(vec!["reference".to_string()]);
        let stream = ReadableStream::builder(source).spawn_ref(&spawn_fn);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some("reference".to_string()));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn builds_from_async_stream() {
        let async_stream = futures::stream::iter(vec!["x", "y", "z"]);
        let stream = ReadableStreamBuilder::from_stream(async_stream).spawn(tokio::spawn);
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some("x"));
        assert_eq!(reader.read().await.unwrap(), Some("y"));
        assert_eq!(reader.read().await.unwrap(), Some("z"));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_an_unpolled_task_errors_the_stream() {
        let source = TestSource::new(vec!["never".to_string()]);
        let (stream, fut) = ReadableStream::builder(source).prepare();
        drop(fut);

        let reader = stream.get_reader().unwrap();
        assert!(matches!(reader.read().await, Err(StreamError::TaskDropped)));
    }
}
