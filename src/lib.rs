//! Turbine — shell-script tasks on an elastic fleet of workers.

pub mod config;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod queue;
pub mod staging;
pub mod task;
pub mod worker;

pub use engine::{Engine, StartRequest};
pub use error::{Error, Result};
