//! Library half of `desyncd`: the queue worker, raw injector, firewall
//! abstraction, bypass engine, and control plane, all usable independently
//! of the `main` binary so integration tests can exercise them directly.

pub mod cli;
pub mod control;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod netlink;
pub mod queue_worker;
pub mod raw_injector;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;
