//! Grid Events
//!
//! Publish/subscribe channel through which failure handling is observed: `nodeFailure`,
//! `nodeRecovered`, `nodeQuarantined`, `nodeRecoveryFailed`, `taskFailure` and
//! `nodeUnhealthy`. Components publish; the coordinator and operators subscribe.

pub mod bus;
pub mod types;
