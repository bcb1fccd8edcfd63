//! Task Collaborator Module
//!
//! The task queue/scheduler owns task records and their execution. This module defines the
//! narrow contract the coordinator consumes from it (list, cancel, create) together with the
//! scheduling-relevant view of a task.
//!
//! ## Submodules
//! - **`types`**: Task identifiers, statuses, requirements and the `NewTask` builder.
//! - **`service`**: The `TaskService` trait implemented by the scheduler.
//! - **`store`**: `InMemoryTaskStore`, a local implementation for standalone runs and tests.

pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
