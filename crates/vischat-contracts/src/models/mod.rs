mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_OPENAI_API_BASE};
pub use selectors::{ModelSelection, ModelSelector};
