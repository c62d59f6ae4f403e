pub mod entities;
pub mod messaging;
pub mod models;
pub mod ports;
pub mod repositories;
pub mod value_objects;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use messaging::*;
pub use repositories::*;
pub use scheduler_errors::{
    AdapterError, AdapterErrorKind, FailureClass, FailureReason, SchedulerError, SchedulerResult,
};
