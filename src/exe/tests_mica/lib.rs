// Scenario tests that drive the resource cache end to end: real executor
// threads, real files, the public manager surface only.

use async_mica::AsyncExecutor;
use resource_mica::{
    BlobLoader, BlobResource, JsonResource, LoadState, ResourceConfig, ResourceLoaders,
    ResourceManager, ResourcePriority, RESOURCE_FILE_EXTENSION,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use util_mica::Guid;
use watch_mica::HotReloadWatcher;

const BLOB_GUID: Guid = Guid::from_u128(0x11111111111111111111111111111111);
const JSON_GUID: Guid = Guid::from_u128(0x22222222222222222222222222222222);

struct DataDir
{
    root: PathBuf,
}
impl DataDir
{
    fn new(tag: &str) -> Self
    {
        let root = std::env::temp_dir().join(format!("mica_tests_{}_{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn write(&self, guid: Guid, contents: impl AsRef<[u8]>)
    {
        std::fs::write(self.root.join(format!("{guid}.{RESOURCE_FILE_EXTENSION}")), contents).unwrap();
    }

    fn write_nicknames(&self, entries: &[(&str, Guid)])
    {
        let table: serde_json::Map<String, serde_json::Value> = entries.iter()
            .map(|(name, guid)| (name.to_string(), serde_json::Value::String(guid.to_string())))
            .collect();
        self.write(Guid::NIL, serde_json::to_vec(&table).unwrap());
    }
}
impl Drop for DataDir
{
    fn drop(&mut self)
    {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn boot_manager(data: &DataDir, loaders: ResourceLoaders) -> (Arc<AsyncExecutor>, ResourceManager)
{
    let executor = Arc::new(AsyncExecutor::new(2));
    let manager = ResourceManager::new(executor.clone(), loaders, ResourceConfig { data_root: data.root.clone() });
    (executor, manager)
}

#[test]
fn concurrent_requests_share_one_instance()
{
    const NUM_THREADS: usize = 8;

    let data = DataDir::new("identity");
    data.write(BLOB_GUID, [7u8; 64]);
    let (_executor, manager) = boot_manager(&data, ResourceLoaders::default().register(BlobLoader));
    let manager = Arc::new(manager);

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let threads: Vec<_> = (0..NUM_THREADS).map(|_|
    {
        let manager = manager.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move ||
        {
            barrier.wait();
            manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Background).unwrap()
        })
    }).collect();

    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    // every caller got the same instance, and the count is exact
    for handle in &handles
    {
        assert_eq!(*handle, handles[0]);
    }
    assert_eq!(handles[0].ref_count(), NUM_THREADS as isize);
    assert_eq!(handles[0].wait_for_ready(), LoadState::Loaded);
    assert_eq!(handles[0].payload().unwrap().bytes(), [7u8; 64].as_slice());

    drop(handles);
    manager.poll();
}

#[test]
fn unload_happens_only_at_zero_refs()
{
    let data = DataDir::new("staged_unload");
    data.write(BLOB_GUID, b"v1");
    let (_executor, manager) = boot_manager(&data, ResourceLoaders::default().register(BlobLoader));

    let first = manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Background).unwrap();
    first.wait_for_ready();
    let second = first.clone();

    drop(second); // 2 -> 1
    manager.poll();
    assert_eq!(first.state(), LoadState::Loaded); // still referenced

    drop(first); // 1 -> 0
    manager.poll();

    // prove collection happened: the next request reloads from disk and sees
    // content written after the first load
    data.write(BLOB_GUID, b"v2");
    let reloaded = manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Background).unwrap();
    assert_eq!(reloaded.wait_for_ready(), LoadState::Loaded);
    assert_eq!(reloaded.payload().unwrap().bytes(), b"v2".as_slice());

    drop(reloaded);
    manager.poll();
}

#[test]
fn failed_loads_settle_and_stay_failed()
{
    let data = DataDir::new("failed"); // note: no blob file written
    let (_executor, manager) = boot_manager(&data, ResourceLoaders::default().register(BlobLoader));

    let handle = manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Background).unwrap();
    assert_eq!(handle.wait_for_ready(), LoadState::Failed);
    assert!(handle.is_ready()); // ready does not mean usable
    assert!(!handle.is_valid());
    assert!(handle.payload().is_none());

    // no automatic retry: a second request sees the settled failure immediately
    let again = manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Background).unwrap();
    assert_eq!(again.state(), LoadState::Failed);

    drop(handle);
    drop(again);
    manager.poll();
}

#[test]
fn nicknames_resolve_through_the_table()
{
    let data = DataDir::new("nicknames");
    data.write_nicknames(&[("player_mesh", BLOB_GUID)]);
    data.write(BLOB_GUID, b"mesh bytes");
    let (_executor, manager) = boot_manager(&data, ResourceLoaders::default().register(BlobLoader));

    assert_eq!(manager.guid_for_nickname("player_mesh"), Some(BLOB_GUID));

    let by_nickname = manager.get_or_load::<BlobResource>("player_mesh", ResourcePriority::Highest).unwrap();
    assert_eq!(by_nickname.guid(), BLOB_GUID);
    assert_eq!(by_nickname.wait_for_ready(), LoadState::Loaded);

    // identity holds across the two naming paths
    let by_guid = manager.get_or_load::<BlobResource>(BLOB_GUID, ResourcePriority::Highest).unwrap();
    assert_eq!(by_guid, by_nickname);

    // unknown nicknames fail closed with an empty handle
    assert!(manager.get_or_load::<BlobResource>("unknown_nick", ResourcePriority::Highest).is_none());

    drop(by_nickname);
    drop(by_guid);
    manager.poll();
}

#[test]
fn hot_reload_refreshes_payloads_and_nicknames()
{
    let data = DataDir::new("hot_reload");
    data.write_nicknames(&[("settings", JSON_GUID)]);
    data.write(JSON_GUID, br#"{"volume": 1}"#);

    let executor = Arc::new(AsyncExecutor::new(2));
    let watcher = HotReloadWatcher::new(&data.root);
    let mut manager = ResourceManager::new(
        executor.clone(),
        ResourceLoaders::default().register(BlobLoader),
        ResourceConfig { data_root: data.root.clone() });
    manager.enable_hot_reload(watcher.register_category());

    let settings = manager.get_or_load::<JsonResource>("settings", ResourcePriority::Foreground).unwrap();
    assert_eq!(settings.wait_for_ready(), LoadState::Loaded);
    assert_eq!(settings.payload().unwrap().entries().count(), 1);

    // change both the config and the nickname table on disk, then inject the
    // change notifications the fs watcher would have produced
    data.write(JSON_GUID, br#"{"volume": 2, "muted": false}"#);
    data.write_nicknames(&[("settings", JSON_GUID), ("extra_nick", BLOB_GUID)]);
    watcher.push_path_update(Path::new(&format!("{JSON_GUID}.{RESOURCE_FILE_EXTENSION}")));
    watcher.push_path_update(Path::new(&format!("{}.{RESOURCE_FILE_EXTENSION}", Guid::NIL)));

    manager.poll();

    // the live handle sees the new payload without having been re-requested
    assert_eq!(settings.payload().unwrap().entries().count(), 2);
    // and the nickname table was rebuilt
    assert_eq!(manager.guid_for_nickname("extra_nick"), Some(BLOB_GUID));

    drop(settings);
    manager.poll();
}
