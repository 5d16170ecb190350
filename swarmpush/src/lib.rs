//! swarmpush node: the management surface and orchestrator wrapped around
//! the [`swarmpush_p2p`] engine. One binary serves both roles; the server is
//! the control plane and the mandatory seeder, agents pull pieces from the
//! server and from each other.

pub mod config;
pub mod service;

pub use config::Config;
pub use service::orchestrator::{CreateTask, DestStatus, TaskState, TaskStatus};
pub use service::Node;
pub use swarmpush_p2p::Role;
