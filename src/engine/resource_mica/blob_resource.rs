use super::*;
use std::error::Error;

// Untyped byte payload for data some other system interprets
pub struct BlobResource
{
    bytes: Box<[u8]>,
}
impl BlobResource
{
    #[inline] #[must_use]
    pub fn bytes(&self) -> &[u8] { &self.bytes }
}
impl Resource for BlobResource
{
    fn resource_type() -> ResourceTypeId { ResourceTypeId::Blob }
}

pub struct BlobLoader;
impl ResourceLoader for BlobLoader
{
    type Resource = BlobResource;

    fn load(&self, mut request: ResourceLoadRequest) -> Result<BlobResource, Box<dyn Error>>
    {
        let bytes = request.read_all_bytes()?;
        Ok(BlobResource { bytes: bytes.into_boxed_slice() })
    }
}
