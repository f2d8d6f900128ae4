mod resource;
pub use resource::*;

mod resource_types;
pub use resource_types::*;

mod resource_handle;
pub use resource_handle::*;

mod resource_loader;
pub use resource_loader::*;

mod resource_server;
pub use resource_server::*;

mod resource_manager;
pub use resource_manager::*;

mod json_resource;
pub use json_resource::*;

mod blob_resource;
pub use blob_resource::*;
