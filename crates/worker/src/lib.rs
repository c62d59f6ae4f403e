pub mod agent;
pub mod components;
pub mod connector;

pub use agent::{AgentExit, WorkerAgent, WorkerIdentity};
pub use components::{JobEvent, JobRunner, RunningJob};
pub use connector::{InProcessConnector, SchedulerConnector, SchedulerLink};
