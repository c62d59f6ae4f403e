pub mod app_config;
pub mod database;
pub mod engine;
pub mod logging;
pub mod resources;

pub use app_config::*;
pub use database::*;
pub use engine::*;
pub use logging::*;
pub use resources::*;
