mod scheduler_state;
mod staging;
mod task;
mod worker;

pub use scheduler_state::*;
pub use staging::*;
pub use task::*;
pub use worker::*;
