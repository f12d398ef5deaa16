pub mod ncnn;
pub mod registry;
pub mod store;

pub use registry::{Manifest, ModelEntry, RegistryError};
pub use store::{ModelStore, StoreError};
