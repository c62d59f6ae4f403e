pub mod adapters;
pub mod database;
pub mod observability;
pub mod staging;

pub use adapters::*;
pub use database::*;
pub use observability::*;
pub use staging::*;
