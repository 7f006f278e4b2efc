use super::{StreamResult, error::StreamError};
use crate::platform::SharedPtr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A stream core that hands out an exclusive reader/writer lock and tracks
/// how many public handles still refer to it.
pub(crate) trait LockOwner {
    fn lock_flag(&self) -> &AtomicBool;

    fn handle_count(&self) -> &AtomicUsize;

    /// Whether the core has reached a terminal state.
    fn is_settled(&self) -> bool;

    /// Runs once per acquisition, after the token is marked released and
    /// before the lock flag is cleared.
    fn on_release(&self);

    /// Runs when the last public handle goes away.
    fn on_detach(&self);
}

/// One acquisition of a core's exclusive lock.
///
/// Futures handed out by a reader or writer keep a clone of the token so
/// they can observe the release even after the handle itself is gone.
pub(crate) struct LockToken<O: LockOwner> {
    released: AtomicBool,
    settled_at_release: AtomicBool,
    owner: SharedPtr<O>,
}

impl<O: LockOwner> LockToken<O> {
    pub(crate) fn acquire(owner: &SharedPtr<O>) -> StreamResult<SharedPtr<Self>> {
        owner
            .lock_flag()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StreamError::Locked)?;
        Ok(SharedPtr::new(Self {
            released: AtomicBool::new(false),
            settled_at_release: AtomicBool::new(false),
            owner: owner.clone(),
        }))
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Released while the core was still live. A `closed` future only
    /// rejects with `LockReleased` in that case.
    pub(crate) fn released_early(&self) -> bool {
        self.is_released() && !self.settled_at_release.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> StreamResult<()> {
        if self.is_released() {
            Err(StreamError::LockReleased)
        } else {
            Ok(())
        }
    }

    pub(crate) fn release(&self) {
        if self.is_released() {
            return;
        }
        self.settled_at_release
            .store(self.owner.is_settled(), Ordering::Release);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.owner.on_release();
        self.owner.lock_flag().store(false, Ordering::Release);
    }
}

/// Releases the lock when the owning handle is dropped.
pub(crate) struct LockGuard<O: LockOwner>(SharedPtr<LockToken<O>>);

impl<O: LockOwner> LockGuard<O> {
    pub(crate) fn acquire(owner: &SharedPtr<O>) -> StreamResult<Self> {
        LockToken::acquire(owner).map(Self)
    }

    pub(crate) fn token(&self) -> &SharedPtr<LockToken<O>> {
        &self.0
    }
}

impl<O: LockOwner> Drop for LockGuard<O> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Counts a public handle (stream, reader or writer) against its core.
pub(crate) struct HandleGuard<O: LockOwner>(SharedPtr<O>);

impl<O: LockOwner> HandleGuard<O> {
    pub(crate) fn new(owner: &SharedPtr<O>) -> Self {
        owner.handle_count().fetch_add(1, Ordering::AcqRel);
        Self(owner.clone())
    }
}

impl<O: LockOwner> Drop for HandleGuard<O> {
    fn drop(&mut self) {
        if self.0.handle_count().fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.on_detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Owner {
        locked: AtomicBool,
        handles: AtomicUsize,
        releases: AtomicUsize,
        detached: AtomicBool,
        settled: AtomicBool,
    }

    impl LockOwner for Owner {
        fn lock_flag(&self) -> &AtomicBool {
            &self.locked
        }

        fn handle_count(&self) -> &AtomicUsize {
            &self.handles
        }

        fn is_settled(&self) -> bool {
            self.settled.load(Ordering::SeqCst)
        }

        fn on_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn on_detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn second_acquisition_fails_until_release() {
        let owner = SharedPtr::new(Owner::default());
        let first = LockGuard::acquire(&owner).unwrap();
        assert!(matches!(
            LockGuard::acquire(&owner),
            Err(StreamError::Locked)
        ));

        let token = first.token().clone();
        drop(first);
        assert!(token.is_released());
        assert!(matches!(token.check(), Err(StreamError::LockReleased)));

        let _second = LockGuard::acquire(&owner).unwrap();
        assert_eq!(owner.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_runs_once() {
        let owner = SharedPtr::new(Owner::default());
        let guard = LockGuard::acquire(&owner).unwrap();
        guard.token().release();
        guard.token().release();
        drop(guard);
        assert_eq!(owner.releases.load(Ordering::SeqCst), 1);
        assert!(!owner.locked.load(Ordering::SeqCst));
    }

    #[test]
    fn release_remembers_whether_owner_had_settled() {
        let owner = SharedPtr::new(Owner::default());
        let live = LockGuard::acquire(&owner).unwrap();
        let token = live.token().clone();
        drop(live);
        assert!(token.released_early());

        owner.settled.store(true, Ordering::SeqCst);
        let late = LockGuard::acquire(&owner).unwrap();
        let token = late.token().clone();
        drop(late);
        assert!(token.is_released());
        assert!(!token.released_early());
    }

    #[test]
    fn detach_fires_with_last_handle() {
        let owner = SharedPtr::new(Owner::default());
        let a = HandleGuard::new(&owner);
        let b = HandleGuard::new(&owner);
        drop(a);
        assert!(!owner.detached.load(Ordering::SeqCst));
        drop(b);
        assert!(owner.detached.load(Ordering::SeqCst));
    }
}
