pub mod app;
pub mod shutdown;

pub use app::{build_registry, AppMode, Application};
pub use shutdown::ShutdownManager;
