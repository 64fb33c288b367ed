//! Supervisor core for a leader-elected primary/replica database cluster.
//!
//! The crate is split along the same seam as the decisions it makes:
//! [`kv`] owns coordination-store primitives, [`db`] owns the local
//! daemon's lifecycle, [`ha`] is the decision procedure that ties the two
//! together each tick, and [`driver`] sequences startup, the main loop,
//! and shutdown around it.

pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod ha;
pub mod kv;

pub use config::Config;
pub use driver::SupervisorDriver;
pub use error::{KvError, StateError, SupervisorError};
