use super::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::error::Error;

// Generic JSON config payload. Gameplay systems either walk the tree through
// root()/entries() or pull a typed view out with deserialize()
pub struct JsonResource
{
    root: Value,
}
impl JsonResource
{
    #[must_use]
    pub fn new(root: Value) -> Self { Self { root } }

    #[inline] #[must_use]
    pub fn root(&self) -> &Value { &self.root }

    // key/value pairs of the root object; empty if the root is not an object
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)>
    {
        self.root.as_object().into_iter().flatten().map(|(key, value)| (key.as_str(), value))
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error>
    {
        T::deserialize(&self.root)
    }
}
impl Resource for JsonResource
{
    fn resource_type() -> ResourceTypeId { ResourceTypeId::Json }

    // config consumers expect an object at the top level
    fn is_valid(&self) -> bool { self.root.is_object() }

    fn supports_hot_reload() -> bool { true }
}

pub struct JsonLoader;
impl ResourceLoader for JsonLoader
{
    type Resource = JsonResource;

    fn load(&self, request: ResourceLoadRequest) -> Result<JsonResource, Box<dyn Error>>
    {
        let root: Value = serde_json::from_reader(request.input)?;
        Ok(JsonResource { root })
    }
}
