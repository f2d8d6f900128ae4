use super::*;
use async_mica::AsyncExecutor;
use std::error::Error;
use std::io::{Read, Seek};
use std::path::PathBuf;
use std::sync::Arc;
use util_mica::Guid;

pub trait ResourceRead: Read + Seek + Send { }
impl<T: Read + Seek + Send> ResourceRead for T { }

// Everything a loader gets handed on a worker thread: the identity of the
// resource and its backing byte stream
pub struct ResourceLoadRequest
{
    pub guid: Guid,
    pub input: Box<dyn ResourceRead>,
}
impl ResourceLoadRequest
{
    // read the remainder of the stream, all or nothing
    pub fn read_all_bytes(&mut self) -> Result<Vec<u8>, std::io::Error>
    {
        let mut bytes = Vec::new();
        self.input.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_all_text(&mut self) -> Result<String, std::io::Error>
    {
        let mut text = String::new();
        self.input.read_to_string(&mut text)?;
        Ok(text)
    }
}

// The per-type factory contract: turn a byte stream into a payload.
// Runs on an executor worker thread; must be threadsafe
pub trait ResourceLoader: Send + Sync + 'static
{
    type Resource: Resource;

    fn load(&self, request: ResourceLoadRequest) -> Result<Self::Resource, Box<dyn Error>>;
}

// object-safe view of a loader, keyed by payload type only so servers can be
// downcast without knowing the concrete loader
pub(crate) trait UntypedResourceLoader<R>: Send + Sync
{
    fn load_untyped(&self, request: ResourceLoadRequest) -> Result<R, Box<dyn Error>>;
}
impl<L: ResourceLoader> UntypedResourceLoader<L::Resource> for L
{
    #[inline]
    fn load_untyped(&self, request: ResourceLoadRequest) -> Result<L::Resource, Box<dyn Error>>
    {
        self.load(request)
    }
}

pub(crate) struct ServerBootstrap
{
    pub executor: Arc<AsyncExecutor>,
    pub data_root: PathBuf,
}

type ServerFactory = Box<dyn FnOnce(&ServerBootstrap) -> (ResourceTypeId, Arc<dyn ResourceServerOps>)>;

// Loader registration, once at startup; the manager turns each entry into a
// resource server for that loader's payload type
#[derive(Default)]
pub struct ResourceLoaders
{
    pub(crate) factories: Vec<ServerFactory>,
}
impl ResourceLoaders
{
    #[must_use]
    pub fn register<L: ResourceLoader>(mut self, loader: L) -> Self
    {
        self.factories.push(Box::new(move |bootstrap|
        {
            let server: Arc<dyn ResourceServerOps> =
                ResourceServer::new(loader, bootstrap.executor.clone(), bootstrap.data_root.clone());
            (L::Resource::resource_type(), server)
        }));
        self
    }
}
