//! `limo-middleware` – the plumbing between robots, the store and consoles.
//!
//! # Modules
//!
//! - [`bus`] – [`MessageBus`] trait with the Redis-backed [`RedisBus`] and
//!   the in-process [`MemoryBus`], plus the startup
//!   [`connect_with_retry`] probe.
//! - [`sinks`] – [`SinkTable`]: per-topic fan-out to console connections
//!   through bounded queues.
//! - [`router`] – [`UpdateRouter`]: decodes robot traffic, drives the
//!   registry, fans out to sinks, mirrors into the store and runs the
//!   eviction sweep.
//!
//! ```text
//!  robots ──publish──▶ store ──subscription──▶ UpdateRouter ──▶ RobotRegistry
//!                        ▲                         │
//!                        └──── mirror writes ──────┤
//!                                                  ▼
//!                                       SinkTable (map / position / goal)
//!                                                  │
//!                                                  ▼
//!                                          console connections
//! ```

pub mod bus;
pub mod router;
pub mod sinks;

pub use bus::{
    BusSettings, MemoryBus, MessageBus, MessageHandler, RedisBus, Subscription,
    connect_with_retry, self_test,
};
pub use router::{DEFAULT_MAX_POINTS_PER_FRAME, RouterSettings, UpdateRouter};
pub use sinks::{DEFAULT_SINK_CAPACITY, FanOut, SinkId, SinkTable, Sinks};
