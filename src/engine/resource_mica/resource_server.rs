use super::*;
use async_mica::AsyncExecutor;
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use util_mica::{Guid, ShortTypeName};

// type-erased server surface the manager drives; one per registered type
pub(crate) trait ResourceServerOps: Send + Sync + 'static
{
    fn do_garbage_collection(&self);
    fn notify_hot_reload(&self, guid: Guid);
    fn num_cached(&self) -> usize;
    fn live_instances(&self) -> usize;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct GcState
{
    unload_recv: Receiver<Guid>,
    // instances that reached refcount zero, waiting for the next pass;
    // includes carry-overs whose loads were still in flight last frame
    pending: Vec<Guid>,
}

// The cache for exactly one resource type: a guid-keyed table of instances
// plus the deferred-unload machinery that reclaims them
pub struct ResourceServer<R: Resource>
{
    loader: Box<dyn UntypedResourceLoader<R>>,
    executor: Arc<AsyncExecutor>,
    data_root: PathBuf,

    table: Mutex<HashMap<Guid, Arc<ResourceCell<R>>>>,
    unload_send: Sender<Guid>,
    gc: Mutex<GcState>, // only ever taken by the frame thread's poll
}
impl<R: Resource> ResourceServer<R>
{
    #[must_use]
    pub(crate) fn new<L>(loader: L, executor: Arc<AsyncExecutor>, data_root: PathBuf) -> Arc<Self>
        where L: ResourceLoader<Resource = R>
    {
        let (unload_send, unload_recv) = unbounded();
        Arc::new(Self
        {
            loader: Box::new(loader),
            executor,
            data_root,
            table: Mutex::new(HashMap::new()),
            unload_send,
            gc: Mutex::new(GcState { unload_recv, pending: Vec::new() }),
        })
    }

    // Find or create the instance for this guid. Lookup and insert happen under
    // one lock acquisition, so concurrent callers racing on a fresh guid all
    // end up sharing the single instance the winner created
    #[must_use]
    pub fn get_or_load(self: &Arc<Self>, guid: Guid, priority: ResourcePriority) -> ResourceHandle<R>
    {
        let (handle, needs_load) =
        {
            let mut table = self.table.lock();
            match table.get(&guid)
            {
                Some(cell) =>
                {
                    let handle = ResourceHandle::retain(cell.clone());
                    // a collected entry restarts its load in place; failed
                    // loads stay failed and are not retried
                    let needs_load = cell.state.compare_exchange(LoadState::Unloaded, LoadState::Loading).is_ok();
                    (handle, needs_load)
                },
                None =>
                {
                    let cell = Arc::new(ResourceCell::new(guid, self.unload_send.clone()));
                    table.insert(guid, cell.clone());
                    // reference before anything can queue this for collection
                    (ResourceHandle::retain(cell), true)
                },
            }
        };

        if needs_load
        {
            self.submit_load(handle.cell.clone(), priority, None);
        }
        handle
    }

    // Same discipline as get_or_load, but the load (if one starts) reads from
    // the given stream instead of the backing file. The stream is only
    // consumed when this call actually starts a load. Tools and tests
    #[must_use]
    pub fn get_or_load_from(
        self: &Arc<Self>,
        guid: Guid,
        priority: ResourcePriority,
        input: impl ResourceRead + 'static) -> ResourceHandle<R>
    {
        let (handle, needs_load) =
        {
            let mut table = self.table.lock();
            match table.get(&guid)
            {
                Some(cell) =>
                {
                    let handle = ResourceHandle::retain(cell.clone());
                    let needs_load = cell.state.compare_exchange(LoadState::Unloaded, LoadState::Loading).is_ok();
                    (handle, needs_load)
                },
                None =>
                {
                    let cell = Arc::new(ResourceCell::new(guid, self.unload_send.clone()));
                    table.insert(guid, cell.clone());
                    (ResourceHandle::retain(cell), true)
                },
            }
        };

        if needs_load
        {
            self.submit_load(handle.cell.clone(), priority, Some(Box::new(input)));
        }
        handle
    }

    fn submit_load(self: &Arc<Self>, cell: Arc<ResourceCell<R>>, priority: ResourcePriority, input: Option<Box<dyn ResourceRead>>)
    {
        let server = self.clone();
        let name = format!("load {}:{}", R::short_type_name(), cell.guid());
        self.executor.submit_detached(name, priority.task_priority(), Box::new(move ||
        {
            server.run_load_task(cell, input);
            Ok(())
        }));
    }

    // the load task body; runs on an executor worker thread
    fn run_load_task(&self, cell: Arc<ResourceCell<R>>, input: Option<Box<dyn ResourceRead>>)
    {
        let guid = cell.guid();
        let input = match input
        {
            Some(input) => input,
            None =>
            {
                let file_path = self.resource_file_path(guid);
                match File::open(&file_path)
                {
                    Ok(file) => Box::new(file) as Box<dyn ResourceRead>,
                    Err(err) =>
                    {
                        log::warn!("Failed to fetch {} resource file {file_path:?}: {err}", R::short_type_name());
                        cell.store_failed();
                        return;
                    },
                }
            },
        };

        match self.loader.load_untyped(ResourceLoadRequest { guid, input })
        {
            Ok(payload) => cell.store_loaded(payload),
            Err(err) =>
            {
                log::error!("Failed to parse {}:{guid}: {err}", R::short_type_name());
                cell.store_failed();
            },
        }
    }

    #[inline] #[must_use]
    fn resource_file_path(&self, guid: Guid) -> PathBuf
    {
        self.data_root.join(format!("{guid}.{RESOURCE_FILE_EXTENSION}"))
    }

    // Deferred reclamation of instances whose refcount reached zero. Must be
    // called from exactly one thread, once per frame; not reentrant. Holding
    // the table lock for the pass serializes the refcount double-check against
    // any get_or_load reviving an entry
    pub fn do_garbage_collection(&self)
    {
        let mut gc = self.gc.lock();
        let table = self.table.lock();

        while let Ok(guid) = gc.unload_recv.try_recv()
        {
            gc.pending.push(guid);
        }

        let pending = std::mem::take(&mut gc.pending);
        let mut carry_over = Vec::new();
        for guid in pending
        {
            let Some(cell) = table.get(&guid) else
            {
                debug_assert!(false, "pending unload for {guid} which was never cached");
                continue;
            };

            // the count may have gone back up since this was queued
            if cell.ref_count() > 0 { continue; }
            match cell.state()
            {
                // already collected by an earlier queue entry
                LoadState::Unloaded => {},
                // an in-flight load cannot be cancelled; retry next frame
                LoadState::Loading => carry_over.push(guid),
                LoadState::Loaded | LoadState::Failed => cell.unload(),
            }
        }
        gc.pending = carry_over;
    }

    // Re-parse a changed backing file into a live instance. Serial by
    // contract: the manager drains the executor before fanning this out, so no
    // load task runs concurrently with the reload hooks
    pub fn notify_hot_reload(&self, guid: Guid)
    {
        if !R::supports_hot_reload() { return; }

        let Some(cell) = self.table.lock().get(&guid).cloned() else { return; };
        // only refresh instances that settled into a usable payload; failed
        // loads stay failed until collected
        if cell.state() != LoadState::Loaded { return; }

        if let Some(old_payload) = cell.payload()
        {
            old_payload.on_reload_begin();
        }

        let file_path = self.resource_file_path(guid);
        let loaded = File::open(&file_path)
            .map_err(|err| Box::new(err) as Box<dyn Error>)
            .and_then(|file| self.loader.load_untyped(ResourceLoadRequest { guid, input: Box::new(file) }));
        match loaded
        {
            Ok(payload) =>
            {
                let payload = cell.store_reloaded(payload);
                payload.on_reload_complete();
                log::debug!("Hot reloaded {}:{guid}", R::short_type_name());
            },
            Err(err) =>
            {
                log::warn!("Failed to hot reload {}:{guid}, keeping previous data: {err}", R::short_type_name());
                if let Some(old_payload) = cell.payload()
                {
                    old_payload.on_reload_complete();
                }
            },
        }
    }

    // the number of table entries, live or not
    #[must_use]
    pub fn num_cached(&self) -> usize
    {
        self.table.lock().len()
    }
}
impl<R: Resource> ResourceServerOps for ResourceServer<R>
{
    fn do_garbage_collection(&self) { ResourceServer::do_garbage_collection(self); }
    fn notify_hot_reload(&self, guid: Guid) { ResourceServer::notify_hot_reload(self, guid); }
    fn num_cached(&self) -> usize { ResourceServer::num_cached(self) }

    fn live_instances(&self) -> usize
    {
        self.table.lock().values().filter(|cell| cell.ref_count() > 0).count()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> { self }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crossbeam::channel::{Receiver as GateReceiver, bounded};
    use parking_lot::Mutex as PlMutex;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    const TEST_GUID: Guid = Guid::from_u128(0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa);

    #[derive(Default)]
    struct Telemetry
    {
        load_count: AtomicUsize,
        release_count: AtomicUsize,
        reload_events: PlMutex<Vec<&'static str>>,
    }

    struct TestResource
    {
        contents: String,
        telemetry: Arc<Telemetry>,
    }
    impl Resource for TestResource
    {
        fn resource_type() -> ResourceTypeId { ResourceTypeId::Test1 }
        fn is_valid(&self) -> bool { self.contents != "invalid" }
        fn on_release(&self) { self.telemetry.release_count.fetch_add(1, AtomicOrdering::AcqRel); }
        fn supports_hot_reload() -> bool { true }
        fn on_reload_begin(&self) { self.telemetry.reload_events.lock().push("begin"); }
        fn on_reload_complete(&self) { self.telemetry.reload_events.lock().push("complete"); }
    }

    struct TestLoader
    {
        telemetry: Arc<Telemetry>,
        gate: Option<GateReceiver<()>>, // loads block here when present
        fail: bool,
    }
    impl ResourceLoader for TestLoader
    {
        type Resource = TestResource;
        fn load(&self, mut request: ResourceLoadRequest) -> Result<TestResource, Box<dyn Error>>
        {
            if let Some(gate) = &self.gate
            {
                gate.recv()?;
            }
            self.telemetry.load_count.fetch_add(1, AtomicOrdering::AcqRel);
            if self.fail { return Err("forced load failure".into()); }
            Ok(TestResource { contents: request.read_all_text()?, telemetry: self.telemetry.clone() })
        }
    }

    struct TestServer
    {
        server: Arc<ResourceServer<TestResource>>,
        telemetry: Arc<Telemetry>,
        _executor: Arc<AsyncExecutor>,
    }
    fn test_server(gate: Option<GateReceiver<()>>, fail: bool) -> TestServer
    {
        let executor = Arc::new(AsyncExecutor::new(1));
        let telemetry = Arc::new(Telemetry::default());
        let loader = TestLoader { telemetry: telemetry.clone(), gate, fail };
        let server = ResourceServer::new(loader, executor.clone(), PathBuf::from("TEST_DIR"));
        TestServer { server, telemetry, _executor: executor }
    }

    fn loads(t: &TestServer) -> usize { t.telemetry.load_count.load(AtomicOrdering::Acquire) }
    fn releases(t: &TestServer) -> usize { t.telemetry.release_count.load(AtomicOrdering::Acquire) }
    fn cell_state(t: &TestServer, guid: Guid) -> LoadState
    {
        t.server.table.lock().get(&guid).unwrap().state()
    }

    #[test]
    fn identity_for_shared_guid()
    {
        let t = test_server(None, false);
        let first = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("abc"));
        let second = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("xyz"));

        assert_eq!(first, second);
        assert_eq!(first.ref_count(), 2);
        assert_eq!(t.server.num_cached(), 1);

        first.wait_for_ready();
        assert_eq!(loads(&t), 1); // the second stream was never consumed
        assert_eq!(first.payload().unwrap().contents, "abc");
    }

    #[test]
    fn missing_file_fails_fetch()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load(TEST_GUID, ResourcePriority::Background);
        assert_eq!(handle.wait_for_ready(), LoadState::Failed);
        assert!(!handle.is_valid());
        assert_eq!(loads(&t), 0); // the loader never ran
    }

    #[test]
    fn parse_failure_settles_failed()
    {
        let t = test_server(None, true);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new(""));
        assert_eq!(handle.wait_for_ready(), LoadState::Failed);
        assert!(handle.payload().is_none());
    }

    #[test]
    fn loaded_but_invalid_payload()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("invalid"));
        assert_eq!(handle.wait_for_ready(), LoadState::Loaded);
        // ready and loaded, but the payload's own validity check says no
        assert!(handle.is_ready());
        assert!(!handle.is_valid());
        assert!(handle.payload().is_some());
    }

    #[test]
    fn failed_loads_are_not_retried()
    {
        let t = test_server(None, true);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new(""));
        handle.wait_for_ready();
        assert_eq!(loads(&t), 1);

        let again = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new(""));
        assert_eq!(again.state(), LoadState::Failed);
        assert_eq!(loads(&t), 1);
    }

    #[test]
    fn referenced_instances_survive_collection()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("abc"));
        handle.wait_for_ready();

        let clone = handle.clone();
        drop(clone); // 2 -> 1, never reached zero
        t.server.do_garbage_collection();
        assert_eq!(handle.state(), LoadState::Loaded);
        assert_eq!(releases(&t), 0);
    }

    #[test]
    fn revived_instances_are_skipped()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("abc"));
        handle.wait_for_ready();
        drop(handle); // queued for collection

        // revived before the pass runs; the queued entry must be discarded
        let revived = t.server.get_or_load(TEST_GUID, ResourcePriority::Background);
        t.server.do_garbage_collection();
        assert_eq!(revived.state(), LoadState::Loaded);
        assert_eq!(releases(&t), 0);
        assert_eq!(loads(&t), 1); // no reload either

        // and it still collects once the revival ends
        drop(revived);
        t.server.do_garbage_collection();
        assert_eq!(releases(&t), 1);
        assert_eq!(cell_state(&t, TEST_GUID), LoadState::Unloaded);
    }

    #[test]
    fn release_fires_exactly_once()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("abc"));
        handle.wait_for_ready();

        // bounce the count off zero twice; each bounce queues another entry
        drop(handle);
        let again = t.server.get_or_load(TEST_GUID, ResourcePriority::Background);
        drop(again);

        // first queued entry unloads, the second finds it already Unloaded
        t.server.do_garbage_collection();
        assert_eq!(releases(&t), 1);
        t.server.do_garbage_collection();
        assert_eq!(releases(&t), 1);
        assert_eq!(cell_state(&t, TEST_GUID), LoadState::Unloaded);
    }

    #[test]
    fn in_flight_loads_carry_over()
    {
        let (gate_send, gate_recv) = bounded(0);
        let t = test_server(Some(gate_recv), false);

        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("abc"));
        drop(handle); // zero refs while the load is still blocked on the gate

        // cannot cancel the load: the instance must survive this pass untouched
        t.server.do_garbage_collection();
        assert_eq!(cell_state(&t, TEST_GUID), LoadState::Loading);
        assert_eq!(releases(&t), 0);

        gate_send.send(()).unwrap();
        let cell = t.server.table.lock().get(&TEST_GUID).unwrap().clone();
        while cell.state() == LoadState::Loading { std::thread::sleep(std::time::Duration::from_millis(1)); }

        // the carry-over is picked up on the next frame's pass
        t.server.do_garbage_collection();
        assert_eq!(cell.state(), LoadState::Unloaded);
        assert_eq!(releases(&t), 1);
    }

    #[test]
    fn collected_entries_reload_in_place()
    {
        let t = test_server(None, false);
        let handle = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("first"));
        handle.wait_for_ready();
        drop(handle);
        t.server.do_garbage_collection();
        assert_eq!(cell_state(&t, TEST_GUID), LoadState::Unloaded);

        let reloaded = t.server.get_or_load_from(TEST_GUID, ResourcePriority::Background, Cursor::new("second"));
        assert_eq!(reloaded.wait_for_ready(), LoadState::Loaded);
        assert_eq!(reloaded.payload().unwrap().contents, "second");
        assert_eq!(loads(&t), 2);
        assert_eq!(t.server.num_cached(), 1); // same table slot throughout
    }

    #[test]
    fn hot_reload_swaps_payload()
    {
        // file-backed so the reload has something to re-read
        let data_root = std::env::temp_dir().join(format!("mica_hot_reload_{}", std::process::id()));
        std::fs::create_dir_all(&data_root).unwrap();
        let file_path = data_root.join(format!("{TEST_GUID}.{RESOURCE_FILE_EXTENSION}"));
        std::fs::write(&file_path, "v1").unwrap();

        let executor = Arc::new(AsyncExecutor::new(1));
        let telemetry = Arc::new(Telemetry::default());
        let loader = TestLoader { telemetry: telemetry.clone(), gate: None, fail: false };
        let server = ResourceServer::new(loader, executor.clone(), data_root.clone());

        let handle = server.get_or_load(TEST_GUID, ResourcePriority::Foreground);
        handle.wait_for_ready();
        assert_eq!(handle.payload().unwrap().contents, "v1");

        std::fs::write(&file_path, "v2").unwrap();
        executor.wait_idle();
        server.notify_hot_reload(TEST_GUID);

        assert_eq!(handle.payload().unwrap().contents, "v2");
        assert_eq!(handle.state(), LoadState::Loaded);
        assert_eq!(*telemetry.reload_events.lock(), vec!["begin", "complete"]);

        drop(handle);
        let _ = std::fs::remove_dir_all(&data_root);
    }
}
