//! Build daemon core.
//!
//! A long-running background process hosting a shared build environment,
//! serving remote clients over its RPC socket and optionally participating in
//! build clusters as a task invoker.
//!
//! ## Architecture
//!
//! - **Environment (`environment.rs`)**: lifecycle orchestrator owning the
//!   build environment, the slot lock, the listeners and the reconnectors.
//! - **Slot lock (`slot_lock.rs`)**: byte-range-locked registry coordinating
//!   every daemon on one storage directory and publishing their ports.
//! - **RPC server (`rpc_server.rs`)**: accepts connections and wires their
//!   per-connection access context.
//! - **Reconnect (`reconnect.rs`)**: outbound coordinator connections with
//!   bounded backoff.
//! - **Invoker (`invoker.rs`)**: cluster task invocation bound to project
//!   caches and mirror areas.
//! - **Cache (`cache.rs`)**: time-bounded resource cache backing connection
//!   and project reuse.

pub mod cache;
pub mod client_server;
pub mod connection;
pub mod environment;
pub mod error;
pub mod invoker;
pub mod project;
pub mod reconnect;
pub mod rpc_server;
#[cfg(target_os = "linux")]
pub mod slot_lock;

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod cache_tests;

#[cfg(all(test, target_os = "linux"))]
#[path = "tests/slot_lock_tests.rs"]
mod slot_lock_tests;

#[cfg(all(test, target_os = "linux"))]
#[path = "tests/environment_tests.rs"]
mod environment_tests;

#[cfg(all(test, target_os = "linux"))]
#[path = "tests/cluster_tests.rs"]
mod cluster_tests;
