//! Parley daemon library.
//!
//! A thin chat gateway in front of a local model CLI. Requests are admitted
//! (rate and concurrency limits), answered deterministically where possible,
//! and otherwise brokered through a supervised subprocess whose output is
//! normalized before anything reaches the caller.

pub mod admission;
pub mod broker;
pub mod metrics;
pub mod persist;
pub mod routes;
pub mod server;
pub mod session;
pub mod store;
