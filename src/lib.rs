//! Workflow execution scheduler.
//!
//! Jobs arrive as dependency graphs of tasks; tasks expand into partitioned
//! workunits; worker clients lease units from a FIFO queue, stage inputs
//! through a content-addressed cache, run the command, and push outputs back
//! to the object store. The [`manager::ResourceManager`] is the front door:
//! it owns the single scheduler lock, the notice channel, and the background
//! maintenance loops.

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod lock;
pub mod manager;
pub mod model;
pub mod queue;
pub mod registry;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use manager::ResourceManager;
