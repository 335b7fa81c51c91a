#![deny(clippy::as_conversions)]

mod executor;
mod node;
mod task;

pub use executor::{Executor, ShellExecutor};
pub use node::{Node, NodeCtrl, Parameters, SendError, SendResult, SubmitError, SubmitResult};
pub use peerd_api as api;
