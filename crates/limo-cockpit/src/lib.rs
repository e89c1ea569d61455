//! `limo-cockpit` – the console bridge.
//!
//! Boots a lightweight HTTP + WebSocket server (default port `8080`) that:
//!
//! 1. **Streams** fleet updates to consoles on three WebSocket endpoints,
//!    one per [`Topic`]:
//!
//!    | Path | Frames |
//!    |---|---|
//!    | `/ws/update-map` | quantized map diff bodies `W1.0,1.0 U2.0,2.0 …` |
//!    | `/ws/robot-pos` | `"<id> x,y,angle"`, tombstone `"<id> remove"` |
//!    | `/ws/update-goal` | `"<id> x,y"`, `"<id> remove"` |
//!
//! 2. **Replays** the current state of a topic when a console sends the text
//!    frame `"sendall"`, split into frames of bounded size.
//!
//! 3. **Accepts** goal instructions on `/ws/update-goal`, publishes them on
//!    the bus and keeps the sending console from receiving its own echo
//!    ([`echo::EchoFilter`]).
//!
//! 4. **Answers** `GET /api/test` and `GET /api/health` for liveness probes.
//!
//! [`Topic`]: limo_types::Topic

pub mod echo;
pub mod server;

pub use echo::{DEFAULT_ECHO_TTL, EchoFilter};
pub use server::{CockpitServer, CockpitSettings, DEFAULT_PORT, SENDALL, parse_goal_instruction};
