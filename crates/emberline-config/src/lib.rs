pub mod loader;
pub mod model;
pub mod registry;

pub use loader::ConfigLoader;
pub use model::{AppConfig, BackendConfig, SearchConfig};
pub use registry::{LimitKind, ModelDescriptor, ModelRegistry, PromptFormat};
