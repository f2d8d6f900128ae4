use super::*;
use arc_swap::ArcSwapOption;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::task::{Context, Poll, Waker};
use util_mica::{Guid, ShortTypeName};

// One cached instance for one guid within one server. The owning server's table
// holds every cell for the lifetime of the server; entries are never removed,
// only unloaded in place and possibly loaded again later
pub(crate) struct ResourceCell<R: Resource>
{
    guid: Guid,
    ref_count: AtomicIsize,
    pub(crate) state: AtomicLoadState,

    // written by the load task while Loading, taken by garbage collection on
    // unload; the state machine keeps those two writers temporally disjoint
    payload: ArcSwapOption<R>,

    ready_waker: Mutex<Option<Waker>>,

    // feeds the owning server's pending-unload list
    unloader: Sender<Guid>,
}
impl<R: Resource> ResourceCell<R>
{
    #[must_use]
    pub fn new(guid: Guid, unloader: Sender<Guid>) -> Self
    {
        Self
        {
            guid,
            ref_count: AtomicIsize::new(0), // the creator must reference() before handing this out
            state: AtomicLoadState::new(LoadState::Loading),
            payload: ArcSwapOption::new(None),
            ready_waker: Mutex::new(None),
            unloader,
        }
    }

    #[inline] #[must_use]
    pub fn guid(&self) -> Guid { self.guid }

    #[inline] #[must_use]
    pub fn state(&self) -> LoadState { self.state.load() }

    #[inline] #[must_use]
    pub fn ref_count(&self) -> isize { self.ref_count.load(Ordering::Acquire) }

    #[inline] #[must_use]
    pub fn payload(&self) -> Option<Arc<R>> { self.payload.load_full() }

    #[inline]
    pub fn reference(&self)
    {
        // see Arc::clone() for details on ordering requirements
        let old_refs = self.ref_count.fetch_add(1, Ordering::Acquire);
        debug_assert_ne!(old_refs, isize::MAX);
    }

    pub fn dereference(&self)
    {
        // see Arc::drop() for details on ordering requirements
        let old_refs = self.ref_count.fetch_sub(1, Ordering::Release);
        debug_assert!(old_refs > 0, "resource refcount underflow for {:?}", self.guid);
        if old_refs == 1
        {
            // the server re-checks the count under its table lock before unloading;
            // a send failure means the server is already tearing down
            let _ = self.unloader.send(self.guid);
        }
    }

    pub fn store_loaded(&self, payload: R)
    {
        self.payload.store(Some(Arc::new(payload)));
        self.state.store(LoadState::Loaded);
        self.wake();
    }

    pub fn store_failed(&self)
    {
        self.state.store(LoadState::Failed);
        self.wake();
    }

    // swap in a fresh payload without touching the load state (hot reload)
    pub fn store_reloaded(&self, payload: R) -> Arc<R>
    {
        let payload = Arc::new(payload);
        self.payload.store(Some(payload.clone()));
        payload
    }

    // release the payload and mark the slot reusable; callers must have
    // verified state() is Loaded or Failed
    pub fn unload(&self)
    {
        if let Some(payload) = self.payload.swap(None)
        {
            payload.on_release();
        }
        self.state.store(LoadState::Unloaded);
    }

    fn wake(&self)
    {
        let mut waker = self.ready_waker.lock();
        if let Some(waker) = waker.take()
        {
            waker.wake();
        }
    }
}

// A refcounted view of one cached resource. Clone adds a reference, drop
// removes one; the drop that reaches zero queues the instance for the owning
// server's next garbage collection pass
pub struct ResourceHandle<R: Resource>
{
    pub(crate) cell: Arc<ResourceCell<R>>,
}
impl<R: Resource> ResourceHandle<R>
{
    #[must_use]
    pub(crate) fn retain(cell: Arc<ResourceCell<R>>) -> Self
    {
        cell.reference();
        Self { cell }
    }

    #[inline] #[must_use]
    pub fn guid(&self) -> Guid { self.cell.guid() }

    #[inline] #[must_use]
    pub fn state(&self) -> LoadState { self.cell.state() }

    // true once the load task has settled; says nothing about usability
    #[inline] #[must_use]
    pub fn is_ready(&self) -> bool
    {
        matches!(self.state(), LoadState::Loaded | LoadState::Failed)
    }

    // ready, loaded, and the payload passes its own validity check
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.state() == LoadState::Loaded && self.cell.payload().is_some_and(|payload| payload.is_valid())
    }

    // the current payload; None until loaded and after unload
    #[inline] #[must_use]
    pub fn payload(&self) -> Option<Arc<R>> { self.cell.payload() }

    // the number of outstanding references to this instance
    #[inline] #[must_use]
    pub fn ref_count(&self) -> isize { self.cell.ref_count() }

    // block the calling thread until the load settles. Last resort: real call
    // sites should poll is_ready() once per frame (or await the handle) instead
    pub fn wait_for_ready(&self) -> LoadState
    {
        futures::executor::block_on(self)
    }

    #[cfg(test)]
    pub fn spin_wait_for_ready(&self) -> LoadState
    {
        while !self.is_ready() { std::hint::spin_loop(); }
        self.state()
    }
}
impl<R: Resource> Clone for ResourceHandle<R>
{
    fn clone(&self) -> Self
    {
        Self::retain(self.cell.clone())
    }
}
impl<R: Resource> Drop for ResourceHandle<R>
{
    fn drop(&mut self)
    {
        self.cell.dereference();
    }
}
impl<R: Resource> PartialEq for ResourceHandle<R>
{
    // handle equality is instance identity
    fn eq(&self, other: &Self) -> bool
    {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}
impl<R: Resource> Debug for ResourceHandle<R>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
    {
        f.write_fmt(format_args!("{}:{}", R::short_type_name(), self.guid()))
    }
}
impl<R: Resource> Future for &ResourceHandle<R>
{
    type Output = LoadState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output>
    {
        let state = self.state();
        if state != LoadState::Loading { return Poll::Ready(state); }

        let mut waker = self.cell.ready_waker.lock();
        // the load task takes the same lock after settling the state, so
        // re-checking here closes the check-then-store wakeup race
        let state = self.state();
        if state != LoadState::Loading { return Poll::Ready(state); }
        *waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crossbeam::channel::unbounded;

    struct Trivial;
    impl Resource for Trivial
    {
        fn resource_type() -> ResourceTypeId { ResourceTypeId::Test1 }
    }

    #[test]
    fn clone_and_drop_track_refcount()
    {
        let (send, recv) = unbounded();
        let cell = Arc::new(ResourceCell::<Trivial>::new(Guid::from_u128(1), send));

        let first = ResourceHandle::retain(cell.clone());
        assert_eq!(first.ref_count(), 1);
        let second = first.clone();
        assert_eq!(first.ref_count(), 2);
        assert_eq!(first, second);

        drop(second);
        assert_eq!(first.ref_count(), 1);
        assert!(recv.try_recv().is_err()); // count never reached zero

        drop(first);
        assert_eq!(recv.try_recv().unwrap(), Guid::from_u128(1));
    }

    #[test]
    fn readiness_tracks_state()
    {
        let (send, _recv) = unbounded();
        let cell = Arc::new(ResourceCell::<Trivial>::new(Guid::from_u128(2), send));
        let handle = ResourceHandle::retain(cell.clone());

        assert_eq!(handle.state(), LoadState::Loading);
        assert!(!handle.is_ready());
        assert!(!handle.is_valid());
        assert!(handle.payload().is_none());

        cell.store_loaded(Trivial);
        assert!(handle.is_ready());
        assert!(handle.is_valid());
        assert!(handle.payload().is_some());
        assert_eq!(handle.wait_for_ready(), LoadState::Loaded);
    }

    #[test]
    fn failed_is_ready_but_invalid()
    {
        let (send, _recv) = unbounded();
        let cell = Arc::new(ResourceCell::<Trivial>::new(Guid::from_u128(3), send));
        let handle = ResourceHandle::retain(cell.clone());

        cell.store_failed();
        assert!(handle.is_ready());
        assert!(!handle.is_valid());
        assert!(handle.payload().is_none());
    }

    #[test]
    fn wait_wakes_on_settle()
    {
        let (send, _recv) = unbounded();
        let cell = Arc::new(ResourceCell::<Trivial>::new(Guid::from_u128(4), send));
        let handle = ResourceHandle::retain(cell.clone());

        let settler = std::thread::spawn(move ||
        {
            std::thread::sleep(std::time::Duration::from_millis(10));
            cell.store_loaded(Trivial);
        });
        assert_eq!(handle.wait_for_ready(), LoadState::Loaded);
        settler.join().unwrap();
    }
}
