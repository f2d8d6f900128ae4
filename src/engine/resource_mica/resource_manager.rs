use super::*;
use async_mica::AsyncExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use util_mica::{Guid, ShortTypeName, hashing::hash_str64};
#[cfg(feature = "hot_reload")]
use watch_mica::HotReloadCategory;

pub struct ResourceConfig
{
    pub data_root: PathBuf, // should be absolute
}
impl ResourceConfig
{
    #[cfg(test)]
    pub fn test() -> Self
    {
        Self { data_root: PathBuf::from("TEST_DIR") }
    }
}

// How callers name a resource: directly by guid, or through the nickname table
#[derive(Debug, Clone, Copy)]
pub enum ResourceKey<'a>
{
    Guid(Guid),
    Nickname(&'a str),
}
impl From<Guid> for ResourceKey<'static>
{
    fn from(guid: Guid) -> Self { Self::Guid(guid) }
}
impl<'a> From<&'a str> for ResourceKey<'a>
{
    fn from(nickname: &'a str) -> Self { Self::Nickname(nickname) }
}

// Owns one resource server per registered type plus the nickname table, and
// drives the once-per-frame poll that collects garbage (and, in tooling
// builds, propagates hot reloads). Construct one and pass it around; there is
// no global instance
pub struct ResourceManager
{
    servers: HashMap<ResourceTypeId, Arc<dyn ResourceServerOps>>,
    nicknames: Mutex<HashMap<u64, Guid>>,
    executor: Arc<AsyncExecutor>,

    #[cfg(feature = "hot_reload")]
    hot_reload: Option<HotReloadCategory>,
}
impl ResourceManager
{
    #[must_use]
    pub fn new(executor: Arc<AsyncExecutor>, loaders: ResourceLoaders, config: ResourceConfig) -> Self
    {
        let bootstrap = ServerBootstrap { executor: executor.clone(), data_root: config.data_root };

        let mut servers: HashMap<ResourceTypeId, Arc<dyn ResourceServerOps>> = HashMap::new();
        for factory in loaders.factories
        {
            let (type_id, server) = factory(&bootstrap);
            if servers.insert(type_id, server).is_some()
            {
                log::warn!("Replacing an earlier resource server registration for {type_id:?}");
            }
        }
        // the json server always exists; the nickname table is itself a json resource
        servers.entry(ResourceTypeId::Json).or_insert_with(||
        {
            let server: Arc<dyn ResourceServerOps> =
                ResourceServer::new(JsonLoader, bootstrap.executor.clone(), bootstrap.data_root.clone());
            server
        });

        let manager = Self
        {
            servers,
            nicknames: Mutex::new(HashMap::new()),
            executor,
            #[cfg(feature = "hot_reload")]
            hot_reload: None,
        };
        manager.reload_nicknames();
        manager
    }

    #[cfg(feature = "hot_reload")]
    pub fn enable_hot_reload(&mut self, category: HotReloadCategory)
    {
        self.hot_reload = Some(category);
    }

    // Resolve the key and hand the request to the matching server. An unknown
    // nickname or unregistered type logs an error and returns None; payload
    // failures surface later through the handle itself
    #[must_use]
    pub fn get_or_load<'a, R: Resource>(
        &self,
        key: impl Into<ResourceKey<'a>>,
        priority: ResourcePriority) -> Option<ResourceHandle<R>>
    {
        let guid = match key.into()
        {
            ResourceKey::Guid(guid) => guid,
            ResourceKey::Nickname(nickname) => match self.guid_for_nickname(nickname)
            {
                Some(guid) => guid,
                None =>
                {
                    log::error!("Resource of nickname {nickname:?} not found");
                    return None;
                },
            },
        };

        let Some(server) = self.server::<R>() else
        {
            log::error!("No resource server registered for {}", R::short_type_name());
            return None;
        };
        Some(server.get_or_load(guid, priority))
    }

    #[must_use]
    pub fn guid_for_nickname(&self, nickname: &str) -> Option<Guid>
    {
        self.nicknames.lock().get(&hash_str64(nickname)).copied()
    }

    #[must_use]
    fn server<R: Resource>(&self) -> Option<Arc<ResourceServer<R>>>
    {
        let server = self.servers.get(&R::resource_type())?;
        server.clone().as_any_arc().downcast::<ResourceServer<R>>().ok()
    }

    // Rebuild the nickname table from the reserved nil-guid json resource: a
    // flat object of nickname -> 32-hex guid. Blocks until that one resource
    // settles; this runs at startup and on nickname hot reload, not per frame
    pub fn reload_nicknames(&self)
    {
        let Some(handle) = self.get_or_load::<JsonResource>(Guid::NIL, ResourcePriority::Highest) else { return; };
        handle.wait_for_ready();
        if !handle.is_valid()
        {
            log::error!("Failed to load resource nicknames");
            return;
        }
        let Some(payload) = handle.payload() else { return; };

        let mut nicknames = HashMap::new();
        for (name, value) in payload.entries()
        {
            match value.as_str().and_then(Guid::try_parse)
            {
                Some(guid) => { nicknames.insert(hash_str64(name), guid); },
                None => log::warn!("Skipping nickname {name:?}: value is not a resource guid"),
            }
        }
        log::debug!("Loaded {} resource nickname(s)", nicknames.len());
        *self.nicknames.lock() = nicknames;
    }

    // Once per engine frame, from exactly one thread: run every server's
    // garbage collection, then fold in any hot-reload changes
    pub fn poll(&self)
    {
        for server in self.servers.values()
        {
            server.do_garbage_collection();
        }

        #[cfg(feature = "hot_reload")]
        self.process_hot_reload();
    }

    #[cfg(feature = "hot_reload")]
    fn process_hot_reload(&self)
    {
        let Some(category) = &self.hot_reload else { return; };
        if !category.has_changes() { return; }

        // no load may be touching a resource that is about to be invalidated
        self.executor.wait_idle();

        {
            let mut read = category.begin_read();
            for path in read.paths()
            {
                // the file name is the guid
                let guid = Guid::from_file_stem(path);
                for server in self.servers.values()
                {
                    server.notify_hot_reload(guid);
                }
            }
            read.clear();
        }

        // the nickname table may have been among the changed files
        self.reload_nicknames();
    }

    // total table entries across all servers, live or not
    #[must_use]
    pub fn num_cached_resources(&self) -> usize
    {
        self.servers.values().map(|server| server.num_cached()).sum()
    }
}
#[cfg(debug_assertions)]
impl Drop for ResourceManager
{
    fn drop(&mut self)
    {
        let leaked: usize = self.servers.values().map(|server| server.live_instances()).sum();
        if leaked > 0
        {
            log::error!("! Leak detected: {leaked} resource handle(s) still referenced at manager teardown");
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::error::Error;

    struct UnregisteredResource;
    impl Resource for UnregisteredResource
    {
        fn resource_type() -> ResourceTypeId { ResourceTypeId::Test2 }
    }
    struct UnregisteredLoader;
    impl ResourceLoader for UnregisteredLoader
    {
        type Resource = UnregisteredResource;
        fn load(&self, _request: ResourceLoadRequest) -> Result<UnregisteredResource, Box<dyn Error>>
        {
            Ok(UnregisteredResource)
        }
    }

    fn test_manager() -> (Arc<AsyncExecutor>, ResourceManager)
    {
        let executor = Arc::new(AsyncExecutor::new(1));
        // TEST_DIR does not exist, so the startup nickname load fails closed
        let manager = ResourceManager::new(executor.clone(), ResourceLoaders::default(), ResourceConfig::test());
        (executor, manager)
    }

    #[test]
    fn json_server_is_always_registered()
    {
        let (_executor, manager) = test_manager();
        let handle = manager.get_or_load::<JsonResource>(Guid::from_u128(7), ResourcePriority::Background);
        assert!(handle.is_some());
    }

    #[test]
    fn unregistered_type_fails_closed()
    {
        let (_executor, manager) = test_manager();
        let handle = manager.get_or_load::<UnregisteredResource>(Guid::from_u128(7), ResourcePriority::Background);
        assert!(handle.is_none());
    }

    #[test]
    fn unknown_nickname_fails_closed()
    {
        let (_executor, manager) = test_manager();
        assert!(manager.guid_for_nickname("unknown_nick").is_none());
        let handle = manager.get_or_load::<JsonResource>("unknown_nick", ResourcePriority::Highest);
        assert!(handle.is_none());
    }

    #[test]
    fn registered_loaders_get_servers()
    {
        let executor = Arc::new(AsyncExecutor::new(1));
        let loaders = ResourceLoaders::default().register(UnregisteredLoader);
        let manager = ResourceManager::new(executor, loaders, ResourceConfig::test());

        let handle = manager.get_or_load::<UnregisteredResource>(Guid::from_u128(8), ResourcePriority::Background);
        assert!(handle.is_some());
    }

    #[test]
    fn poll_collects_across_servers()
    {
        let (_executor, manager) = test_manager();
        let handle = manager.get_or_load::<JsonResource>(Guid::from_u128(9), ResourcePriority::Background).unwrap();
        handle.wait_for_ready(); // fails (no file), but settles
        drop(handle);
        manager.poll();
        // the entry stays cached, unloaded in place
        assert!(manager.num_cached_resources() >= 1);
    }
}
