pub mod loader;
pub mod model;
pub mod snapshot;

pub use loader::Loader;
pub use snapshot::{Registry, RegistryBuilder, RegistryHandle};
