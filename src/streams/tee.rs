use super::{
    CountQueuingStrategy, DEFAULT_READABLE_HIGH_WATER_MARK, QueuingStrategy, StreamResult,
    readable::{
        DefaultStream, ReadableSource, ReadableStream, ReadableStreamBuilder,
        ReadableStreamDefaultController, ReadableStreamDefaultReader, StreamTypeMarker,
    },
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    future::{self, Either, Future, poll_fn},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{
    marker::PhantomData,
    pin::pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Default)]
struct BranchState {
    canceled: bool,
    reason: Option<String>,
    detached: bool,
}

#[derive(Default)]
struct TeeInner {
    pull_requested: bool,
    cancel_sent: bool,
    branches: [BranchState; 2],
}

enum TeeEvent {
    Pull,
    Cancel(Option<String>),
    Exit,
}

/// Coordination point between the two branches and the task reading the
/// parent stream.
struct TeeShared {
    parent: u64,
    inner: Mutex<TeeInner>,
    waker: AtomicWaker,
}

impl TeeShared {
    fn request_pull(&self) {
        self.inner.lock().pull_requested = true;
        self.waker.wake();
    }

    fn cancel_branch(&self, branch: usize, reason: Option<String>) {
        let mut inner = self.inner.lock();
        let state = &mut inner.branches[branch];
        state.canceled = true;
        state.reason = reason;
        debug!(stream = self.parent, branch, "tee branch canceled");
        self.waker.wake();
    }

    fn detach_branch(&self, branch: usize) {
        self.inner.lock().branches[branch].detached = true;
        self.waker.wake();
    }

    fn is_canceled(&self, branch: usize) -> bool {
        self.inner.lock().branches[branch].canceled
    }

    /// Both branches canceled: the parent is canceled with their reasons
    /// joined in branch order.
    fn poll_cancel(&self, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.waker.register(cx.waker());
        let mut inner = self.inner.lock();
        if inner.cancel_sent || !inner.branches.iter().all(|b| b.canceled) {
            return Poll::Pending;
        }
        inner.cancel_sent = true;
        let reasons: Vec<_> = inner
            .branches
            .iter()
            .filter_map(|b| b.reason.clone())
            .collect();
        Poll::Ready((!reasons.is_empty()).then(|| reasons.join("; ")))
    }

    fn poll_event(&self, cx: &mut Context<'_>) -> Poll<TeeEvent> {
        if let Poll::Ready(reason) = self.poll_cancel(cx) {
            return Poll::Ready(TeeEvent::Cancel(reason));
        }
        let mut inner = self.inner.lock();
        if inner.branches.iter().all(|b| b.canceled || b.detached) {
            return Poll::Ready(TeeEvent::Exit);
        }
        if std::mem::take(&mut inner.pull_requested) {
            return Poll::Ready(TeeEvent::Pull);
        }
        Poll::Pending
    }
}

/// Source of one tee branch. Pulls are forwarded to the task reading the
/// parent stream.
pub struct TeeSource<T> {
    shared: SharedPtr<TeeShared>,
    branch: usize,
    _chunk: PhantomData<fn() -> T>,
}

impl<T: MaybeSend + 'static> ReadableSource<T> for TeeSource<T> {
    fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.shared.request_pull();
        future::ready(Ok(()))
    }

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.shared.cancel_branch(self.branch, reason);
        future::ready(Ok(()))
    }
}

impl<T> Drop for TeeSource<T> {
    fn drop(&mut self) {
        self.shared.detach_branch(self.branch);
    }
}

async fn run_tee<T, Source, StreamType>(
    reader: ReadableStreamDefaultReader<T, Source, StreamType>,
    shared: SharedPtr<TeeShared>,
    branches: [ReadableStreamDefaultController<T>; 2],
) where
    T: MaybeSend + Clone + 'static,
    StreamType: StreamTypeMarker,
{
    let [first, second] = branches;
    loop {
        match poll_fn(|cx| shared.poll_event(cx)).await {
            TeeEvent::Pull => {
                let next = pin!(reader.read());
                let canceled = pin!(poll_fn(|cx| shared.poll_cancel(cx)));
                let read = match future::select(next, canceled).await {
                    Either::Left((read, _)) => read,
                    Either::Right((reason, _)) => {
                        let _ = reader.cancel(reason).await;
                        return;
                    }
                };
                match read {
                    Ok(Some(chunk)) => {
                        trace!(stream = shared.parent, "tee chunk");
                        match (shared.is_canceled(0), shared.is_canceled(1)) {
                            (false, false) => {
                                let _ = first.enqueue(chunk.clone());
                                let _ = second.enqueue(chunk);
                            }
                            (false, true) => {
                                let _ = first.enqueue(chunk);
                            }
                            (true, false) => {
                                let _ = second.enqueue(chunk);
                            }
                            (true, true) => {}
                        }
                    }
                    Ok(None) => {
                        debug!(stream = shared.parent, "tee parent closed");
                        let _ = first.close();
                        let _ = second.close();
                        return;
                    }
                    Err(error) => {
                        debug!(stream = shared.parent, %error, "tee parent errored");
                        first.error(error.clone());
                        second.error(error);
                        return;
                    }
                }
            }
            TeeEvent::Cancel(reason) => {
                debug!(stream = shared.parent, ?reason, "canceling tee parent");
                let _ = reader.cancel(reason).await;
                return;
            }
            TeeEvent::Exit => return,
        }
    }
}

/// Builder for the two branches returned by [`ReadableStream::tee`].
pub struct TeeBuilder<T, Source, StreamType = DefaultStream>
where
    T: MaybeSend + Clone + 'static,
    StreamType: StreamTypeMarker,
{
    stream: ReadableStream<T, Source, StreamType>,
    branch1_strategy: BoxedStrategy<T>,
    branch2_strategy: BoxedStrategy<T>,
}

impl<T, Source, StreamType> TeeBuilder<T, Source, StreamType>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
    StreamType: StreamTypeMarker,
{
    fn new(stream: ReadableStream<T, Source, StreamType>) -> Self {
        Self {
            stream,
            branch1_strategy: Box::new(CountQueuingStrategy::new(DEFAULT_READABLE_HIGH_WATER_MARK)),
            branch2_strategy: Box::new(CountQueuingStrategy::new(DEFAULT_READABLE_HIGH_WATER_MARK)),
        }
    }

    /// Set queuing strategy for the first branch
    pub fn branch1_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.branch1_strategy = Box::new(s);
        self
    }

    /// Set queuing strategy for the second branch
    pub fn branch2_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.branch2_strategy = Box::new(s);
        self
    }

    /// Set the same queuing strategy for both branches
    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + Clone + 'static>(mut self, s: S) -> Self {
        self.branch1_strategy = Box::new(s.clone());
        self.branch2_strategy = Box::new(s);
        self
    }

    /// Prepare without spawning: returns both branches and one future driving
    /// them together with the parent reader.
    ///
    /// Fails with `Locked` if the parent already has a reader.
    #[allow(clippy::type_complexity)]
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T, TeeSource<T>>,
        ReadableStream<T, TeeSource<T>>,
        impl Future<Output = ()>,
    )> {
        let reader = self.stream.get_reader()?;
        let shared = SharedPtr::new(TeeShared {
            parent: self.stream.shared.id,
            inner: Mutex::new(TeeInner::default()),
            waker: AtomicWaker::new(),
        });
        let source = |branch| TeeSource {
            shared: shared.clone(),
            branch,
            _chunk: PhantomData,
        };

        let (branch1, fut1) = ReadableStreamBuilder::<T, _, DefaultStream>::with_strategy(
            source(0),
            self.branch1_strategy,
        )
        .prepare();
        let (branch2, fut2) = ReadableStreamBuilder::<T, _, DefaultStream>::with_strategy(
            source(1),
            self.branch2_strategy,
        )
        .prepare();

        let controllers = [branch1.controller(), branch2.controller()];
        let coordinator = run_tee(reader, shared, controllers);
        let fut = async move {
            future::join3(coordinator, fut1, fut2).await;
        };
        Ok((branch1, branch2, fut))
    }

    /// Spawn the coordinator and both branches in a single task
    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> StreamResult<(ReadableStream<T, TeeSource<T>>, ReadableStream<T, TeeSource<T>>)>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }

    /// Spawn the coordinator and both branches using a static function reference
    pub fn spawn_ref<F, R>(
        self,
        spawn_fn: &'static F,
    ) -> StreamResult<(ReadableStream<T, TeeSource<T>>, ReadableStream<T, TeeSource<T>>)>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }
}

impl<T, Source, StreamType> ReadableStream<T, Source, StreamType>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
    StreamType: StreamTypeMarker,
{
    /// Split this stream into two branches that each see every chunk.
    ///
    /// The parent is locked to the tee. It is canceled once both branches
    /// are canceled; its close or error reaches both branches.
    pub fn tee(self) -> TeeBuilder<T, Source, StreamType> {
        TeeBuilder::new(self)
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use crate::streams::{StreamError, StreamState};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn drain<S>(stream: &ReadableStream<i32, S>) -> Vec<i32> {
        let reader = stream.get_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(value) = timeout(Duration::from_secs(1), reader.read())
            .await
            .expect("read timed out")
            .unwrap()
        {
            seen.push(value);
        }
        seen
    }

    struct Recorded {
        items: std::vec::IntoIter<i32>,
        cancels: CancelLog,
        fail_at_end: bool,
    }

    impl ReadableSource<i32> for Recorded {
        async fn pull(
            &mut self,
            controller: &mut ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            match self.items.next() {
                Some(item) => controller.enqueue(item),
                None if self.fail_at_end => Err(StreamError::from("parent broke")),
                None => controller.close(),
            }
        }

        async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.cancels.lock().unwrap().push(reason);
            Ok(())
        }
    }

    type CancelLog = Arc<StdMutex<Vec<Option<String>>>>;

    fn recorded(items: Vec<i32>, fail_at_end: bool) -> (Recorded, CancelLog) {
        let cancels = Arc::new(StdMutex::new(Vec::new()));
        let source = Recorded {
            items: items.into_iter(),
            cancels: cancels.clone(),
            fail_at_end,
        };
        (source, cancels)
    }

    #[tokio::test]
    async fn both_branches_see_every_chunk() {
        let parent = ReadableStream::from_vec(vec![1, 2, 3, 4]).spawn(tokio::spawn);
        let (left, right) = parent.tee().spawn(tokio::spawn).unwrap();

        let (a, b) = tokio::join!(drain(&left), drain(&right));
        assert_eq!(a, vec![1, 2, 3, 4]);
        assert_eq!(b, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn slow_branch_buffers_while_fast_branch_reads() {
        let parent = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
        let (fast, slow) = parent.tee().spawn(tokio::spawn).unwrap();

        assert_eq!(drain(&fast).await, vec![1, 2, 3]);
        assert_eq!(drain(&slow).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn parent_canceled_only_after_both_branches() {
        let (source, cancels) = recorded(vec![1, 2, 3, 4, 5], false);
        let parent = ReadableStream::builder(source).spawn(tokio::spawn);
        let (left, right) = parent.tee().spawn(tokio::spawn).unwrap();

        left.cancel(Some("left done".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cancels.lock().unwrap().is_empty());

        // The remaining branch keeps receiving data.
        let reader = right.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        reader.cancel(Some("right done".into())).await.unwrap();

        timeout(Duration::from_secs(1), async {
            while cancels.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("parent was never canceled");
        assert_eq!(
            *cancels.lock().unwrap(),
            vec![Some("left done; right done".to_string())]
        );
    }

    #[tokio::test]
    async fn parent_error_reaches_both_branches() {
        let (source, _) = recorded(vec![7], true);
        let parent = ReadableStream::builder(source).spawn(tokio::spawn);
        let (left, right) = parent.tee().spawn(tokio::spawn).unwrap();

        let left_reader = left.get_reader().unwrap();
        let right_reader = right.get_reader().unwrap();

        assert_eq!(left_reader.read().await.unwrap(), Some(7));
        let left_err = timeout(Duration::from_secs(1), left_reader.read())
            .await
            .expect("left branch never settled")
            .unwrap_err();
        let right_err = timeout(Duration::from_secs(1), right_reader.closed())
            .await
            .expect("right branch never settled")
            .unwrap_err();
        assert_eq!(left_err.to_string(), "parent broke");
        assert_eq!(right_err.to_string(), "parent broke");
        assert!(matches!(left.state(), StreamState::Errored(_)));
    }

    #[tokio::test]
    async fn tee_of_locked_stream_fails() {
        let parent = ReadableStream::from_vec(vec![1]).spawn(tokio::spawn);
        let _reader = parent.get_reader().unwrap();
        assert!(matches!(
            parent.tee().spawn(tokio::spawn),
            Err(StreamError::Locked)
        ));
    }
}
