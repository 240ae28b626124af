//! Lifetime scopes
//!
//! A scope collects the handles created for one unit of work (typically the
//! temporaries of one call) and disposes all of them together when it
//! closes. Closing happens on drop as well, so early returns, `?` and panics
//! all clean up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gdbind_sdk::{ObjectPtr, RawHandle, ResourceKind};
use parking_lot::Mutex;

use crate::arena::{Arena, Handle, Ownership, OwnershipError};
use crate::owned::{Owned, Resource, Shared};

/// Batch of handles released together.
///
/// `closed` only flips while `handles` is locked, so a handle is either
/// pushed before close takes the set or rejected.
#[derive(Debug)]
pub struct LifetimeScope {
    arena: Arc<Arena>,
    handles: Mutex<Vec<Handle>>,
    closed: AtomicBool,
}

impl LifetimeScope {
    /// Open a scope over an arena
    pub fn new(arena: Arc<Arena>) -> Self {
        LifetimeScope {
            arena,
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Arena the scope releases into
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Add an existing handle to the release set.
    pub fn register(&self, handle: Handle) -> Result<Handle, OwnershipError> {
        let mut handles = self.handles.lock();
        if self.is_closed() {
            return Err(OwnershipError::ScopeClosed);
        }
        handles.push(handle);
        Ok(handle)
    }

    /// Acquire a handle and register it in one step.
    ///
    /// On `ScopeClosed` the raw value was not taken over.
    pub fn acquire<R: Resource>(&self, raw: RawHandle, tag: Ownership) -> Result<Handle, OwnershipError> {
        let mut handles = self.handles.lock();
        if self.is_closed() {
            return Err(OwnershipError::ScopeClosed);
        }
        let handle = self.arena.acquire::<R>(raw, tag)?;
        handles.push(handle);
        Ok(handle)
    }

    /// Move an owned value into the scope. A closed scope releases it.
    pub fn adopt<R: Resource>(&self, owned: Owned<R>) -> Result<Handle, OwnershipError> {
        let mut handles = self.handles.lock();
        if self.is_closed() {
            drop(handles);
            drop(owned);
            return Err(OwnershipError::ScopeClosed);
        }
        let handle = owned.into_handle();
        handles.push(handle);
        Ok(handle)
    }

    /// Release a handle now and drop it from the release set.
    ///
    /// When the arena refuses (a borrowed handle, say) the handle stays in
    /// the set and is still disposed on close.
    pub fn release(&self, handle: Handle) -> Result<(), OwnershipError> {
        let position = self.remove(handle);
        let result = self.arena.release(handle);
        if let (Err(_), Some(position)) = (&result, position) {
            if self.arena.tag(handle).is_ok() {
                self.restore(handle, position);
            }
        }
        result
    }

    /// Take an exclusive handle out of the scope as an [`Owned`] value.
    pub fn escape<R: Resource>(&self, handle: Handle) -> Result<Owned<R>, OwnershipError> {
        let raw = self.check(handle, R::KIND, Ownership::Exclusive)?;
        if self.remove(handle).is_none() {
            return Err(OwnershipError::NotInScope(handle));
        }
        Ok(Owned::from_parts(Arc::clone(&self.arena), handle, raw))
    }

    /// Take a shared handle out of the scope.
    pub fn escape_shared(&self, handle: Handle) -> Result<Shared, OwnershipError> {
        let raw = self.check(handle, ResourceKind::Object, Ownership::Shared)?;
        let object = ObjectPtr::from_word(raw.word()).ok_or(OwnershipError::NullObject)?;
        if self.remove(handle).is_none() {
            return Err(OwnershipError::NotInScope(handle));
        }
        Ok(Shared::from_parts(Arc::clone(&self.arena), handle, object))
    }

    /// Whether a handle is in the release set
    pub fn contains(&self, handle: Handle) -> bool {
        self.handles.lock().contains(&handle)
    }

    /// Number of handles in the release set
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether the release set is empty
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Whether the scope has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dispose every registered handle, newest first.
    ///
    /// Borrowed handles are forgotten, all others released. Violations the
    /// arena detects (for example a handle already released behind the
    /// scope's back) are returned, not swallowed. Closing twice is a no-op.
    pub fn close(&self) -> Vec<OwnershipError> {
        let handles = {
            let mut handles = self.handles.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Vec::new();
            }
            std::mem::take(&mut *handles)
        };

        handles
            .into_iter()
            .rev()
            .filter_map(|handle| self.dispose(handle).err())
            .collect()
    }

    fn dispose(&self, handle: Handle) -> Result<(), OwnershipError> {
        match self.arena.tag(handle)? {
            Ownership::Borrowed => self.arena.forget(handle).map(|_| ()),
            _ => self.arena.release(handle),
        }
    }

    fn remove(&self, handle: Handle) -> Option<usize> {
        let mut handles = self.handles.lock();
        let position = handles.iter().rposition(|h| *h == handle)?;
        handles.remove(position);
        Some(position)
    }

    /// Put a handle back where [`remove`](Self::remove) found it, or
    /// dispose of it if the scope closed in between.
    fn restore(&self, handle: Handle, position: usize) {
        {
            let mut handles = self.handles.lock();
            if !self.is_closed() {
                let position = position.min(handles.len());
                handles.insert(position, handle);
                return;
            }
        }
        if let Err(error) = self.dispose(handle) {
            self.arena.enforce(&error);
        }
    }

    fn check(
        &self,
        handle: Handle,
        kind: ResourceKind,
        tag: Ownership,
    ) -> Result<RawHandle, OwnershipError> {
        let actual = self.arena.kind(handle)?;
        if actual != kind {
            return Err(OwnershipError::KindMismatch {
                handle,
                expected: kind,
                actual,
            });
        }
        let actual = self.arena.tag(handle)?;
        if actual != tag {
            return Err(OwnershipError::WrongOwnership {
                handle,
                expected: tag,
                actual,
            });
        }
        self.arena.borrow(handle)
    }
}

impl Drop for LifetimeScope {
    fn drop(&mut self) {
        for error in self.close() {
            self.arena.enforce(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owned::{Dictionary, GString, Object};
    use gdbind_sdk::mock::MockHost;
    use gdbind_sdk::{AbiLayout, HostInterface};

    fn setup() -> (Arc<MockHost>, Arc<Arena>) {
        let host = Arc::new(MockHost::new());
        let arena = Arc::new(Arena::new(host.clone(), AbiLayout::default()).unwrap());
        (host, arena)
    }

    #[test]
    fn test_close_releases_all() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        for i in 0..5 {
            scope
                .acquire::<GString>(host.new_resource(&i.to_string()), Ownership::Exclusive)
                .unwrap();
        }
        assert_eq!(scope.len(), 5);

        assert!(scope.close().is_empty());
        assert_eq!(host.destroyed(ResourceKind::String), 5);
        assert_eq!(arena.live_handles(), 0);

        // Idempotent
        assert!(scope.close().is_empty());
        assert_eq!(host.destroyed(ResourceKind::String), 5);
    }

    #[test]
    fn test_mid_scope_release_not_repeated() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        let a = scope
            .acquire::<GString>(host.new_resource("a"), Ownership::Exclusive)
            .unwrap();
        scope
            .acquire::<Dictionary>(host.new_resource(""), Ownership::Exclusive)
            .unwrap();

        scope.release(a).unwrap();
        assert!(!scope.contains(a));
        drop(scope);

        assert_eq!(host.destroyed(ResourceKind::String), 1);
        assert_eq!(host.destroyed(ResourceKind::Dictionary), 1);
        assert_eq!(host.stats().invalid_frees, 0);
    }

    #[test]
    fn test_release_behind_scope_is_reported() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        let h = scope
            .acquire::<GString>(host.new_resource("x"), Ownership::Exclusive)
            .unwrap();
        arena.release(h).unwrap();

        let errors = scope.close();
        assert_eq!(errors, vec![OwnershipError::Stale(h)]);
        assert_eq!(host.destroyed(ResourceKind::String), 1);
        assert_eq!(host.stats().invalid_frees, 0);
    }

    #[test]
    fn test_borrowed_forgotten_on_close() {
        let (host, arena) = setup();
        let raw = host.new_resource("engine");
        let scope = LifetimeScope::new(arena.clone());
        scope.acquire::<GString>(raw, Ownership::Borrowed).unwrap();
        assert!(scope.close().is_empty());

        assert!(host.is_resource_alive(raw));
        assert_eq!(arena.stats().forgotten, 1);
    }

    #[test]
    fn test_escape_excludes_from_release() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        let kept = scope
            .acquire::<GString>(host.new_resource("result"), Ownership::Exclusive)
            .unwrap();
        scope
            .acquire::<GString>(host.new_resource("temp"), Ownership::Exclusive)
            .unwrap();

        let owned = scope.escape::<GString>(kept).unwrap();
        drop(scope);
        assert_eq!(host.destroyed(ResourceKind::String), 1);
        assert_eq!(owned.text().unwrap(), "result");
    }

    #[test]
    fn test_escape_checks_type() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        let h = scope
            .acquire::<GString>(host.new_resource("s"), Ownership::Exclusive)
            .unwrap();
        assert!(matches!(
            scope.escape::<Dictionary>(h),
            Err(OwnershipError::KindMismatch { .. })
        ));

        let b = scope
            .acquire::<GString>(host.new_resource("b"), Ownership::Borrowed)
            .unwrap();
        assert!(matches!(
            scope.escape::<GString>(b),
            Err(OwnershipError::WrongOwnership { .. })
        ));
        assert!(scope.contains(h) && scope.contains(b));
    }

    #[test]
    fn test_adopt_and_shared_escape() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena.clone());
        let owned = Owned::<GString>::from_text(&arena, "adopted").unwrap();
        scope.adopt(owned).unwrap();

        let object = host.classdb_construct_object("RefCounted").unwrap();
        let h = scope
            .acquire::<Object>(RawHandle::from_word(object.word()), Ownership::Shared)
            .unwrap();
        let shared = scope.escape_shared(h).unwrap();

        assert!(scope.close().is_empty());
        assert_eq!(host.destroyed(ResourceKind::String), 1);
        assert!(host.is_alive(object));
        drop(shared);
        assert!(!host.is_alive(object));
    }

    #[test]
    fn test_closed_scope_rejects_registration() {
        let (host, arena) = setup();
        let scope = LifetimeScope::new(arena);
        scope.close();
        let err = scope
            .acquire::<GString>(host.new_resource("late"), Ownership::Exclusive)
            .unwrap_err();
        assert_eq!(err, OwnershipError::ScopeClosed);
    }

    #[test]
    fn test_cleanup_on_error_path() {
        fn fails(scope: &LifetimeScope, host: &MockHost) -> Result<(), OwnershipError> {
            scope.acquire::<GString>(host.new_resource("1"), Ownership::Exclusive)?;
            scope.acquire::<GString>(host.new_resource("2"), Ownership::Exclusive)?;
            scope.acquire::<GString>(host.new_resource("3"), Ownership::Shared)?;
            Ok(())
        }

        let (host, arena) = setup();
        {
            let scope = LifetimeScope::new(arena.clone());
            assert!(fails(&scope, &host).is_err());
        }
        assert_eq!(host.destroyed(ResourceKind::String), 2);
        assert_eq!(arena.live_handles(), 0);
    }

    #[test]
    fn test_refused_release_stays_in_scope() {
        let (host, arena) = setup();
        let raw = host.new_resource("engine");
        let scope = LifetimeScope::new(arena.clone());
        let first = scope
            .acquire::<GString>(host.new_resource("1"), Ownership::Exclusive)
            .unwrap();
        let h = scope.acquire::<GString>(raw, Ownership::Borrowed).unwrap();
        let last = scope
            .acquire::<GString>(host.new_resource("3"), Ownership::Exclusive)
            .unwrap();

        assert!(matches!(
            scope.release(h),
            Err(OwnershipError::ReleaseBorrowed { .. })
        ));
        assert!(scope.contains(h));
        assert_eq!(scope.len(), 3);
        assert!(scope.contains(first) && scope.contains(last));

        assert!(scope.close().is_empty());
        assert_eq!(arena.live_handles(), 0);
        assert!(host.is_resource_alive(raw));
        assert_eq!(host.destroyed(ResourceKind::String), 2);
    }

    #[test]
    fn test_concurrent_register_and_close() {
        use std::sync::Barrier;
        use std::thread;

        const THREADS: usize = 8;

        for _ in 0..50 {
            let (host, arena) = setup();
            let scope = Arc::new(LifetimeScope::new(arena.clone()));
            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let host = Arc::clone(&host);
                    let scope = Arc::clone(&scope);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        let mut taken = 0usize;
                        for i in 0..20 {
                            let raw = host.new_resource(&i.to_string());
                            match scope.acquire::<GString>(raw, Ownership::Exclusive) {
                                Ok(_) => taken += 1,
                                Err(e) => assert_eq!(e, OwnershipError::ScopeClosed),
                            }
                        }
                        taken
                    })
                })
                .collect();

            barrier.wait();
            assert!(scope.close().is_empty());
            let taken: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

            assert_eq!(arena.live_handles(), 0);
            assert_eq!(host.destroyed(ResourceKind::String), taken);
        }
    }
}
