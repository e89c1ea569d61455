//! `limo-kernel` – fleet liveness.
//!
//! Robots never say goodbye; the only evidence that a robot is alive is its
//! periodic `keep_alive`.  This crate keeps the authoritative table of live
//! robots and decides when silence means departure.
//!
//! # Modules
//!
//! - [`registry`] – [`RobotRegistry`][registry::RobotRegistry]: concurrent
//!   table of live robots with their last heartbeat, position and goal.
//!   [`RobotRegistry::sweep`][registry::RobotRegistry::sweep] evicts robots
//!   whose keep-alive deadline has passed and cancels their per-robot
//!   listener tokens.
//!
//! The registry performs no I/O.  Mirroring, fan-out and bus subscriptions
//! are driven by the caller from the outcomes it returns.

pub mod registry;

pub use registry::{DEFAULT_KEEP_ALIVE_TIMEOUT, Evicted, Heartbeat, RobotRegistry, RobotSnapshot};
