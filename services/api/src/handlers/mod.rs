//! HTTP handlers for the task dispatch API.
pub mod health;
pub mod tasks;

pub use health::register_routes as register_health;
pub use tasks::register_routes as register_tasks;
