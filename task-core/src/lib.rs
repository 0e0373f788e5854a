//! Task lifecycle state machine and durable store.

pub mod task;

pub use task::{
    NewTask, Priority, SqlxTaskStore, Task, TaskListFilter, TaskStatus, TaskStore,
};
