//! Operation execution: per-host runs, fan-out/fan-in, polling and the task queue

pub mod operation;
pub mod poll;
pub mod queue;
pub mod scheduler;

pub use operation::run_on_host;
pub use poll::{await_terminal, PollOptions, PollOutcome};
pub use queue::TaskQueue;
pub use scheduler::{aggregate, dispatch, submit};
