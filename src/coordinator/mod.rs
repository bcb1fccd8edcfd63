//! Coordinator
//!
//! Owns one instance of every component, connects them through the event bus and controls
//! the lifetime of their background loops.

pub mod service;
