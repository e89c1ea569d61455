//! `limo-types` – shared vocabulary of the Limo control center.
//!
//! Everything that crosses a crate boundary lives here: robot poses and
//! goals in their text wire form, the three console [`Topic`]s, the bus
//! channel names and mirrored store keys, and the workspace-wide
//! [`LimoError`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal used on the wire in place of a coordinate when an entity is gone
/// (robot tombstone, cleared goal).
pub const REMOVE: &str = "remove";

/// Bus channel names.
pub mod channels {
    /// Heartbeats: `"<robotId> keep_alive"`.
    pub const GENERAL: &str = "general";
    /// Positions: `"<robotId> <x>,<y>,<angle>"`.
    pub const UPDATE_POS: &str = "update_pos";
    /// Map diffs: `"<robotId> <diffBody>"`.
    pub const UPDATE_MAP: &str = "update_map";
    /// Goals: `"<robotId> <x>,<y>"` or `"<robotId> remove"`.
    pub const UPDATE_GOAL: &str = "update_goal";

    /// Heartbeat command carried on [`GENERAL`].
    pub const KEEP_ALIVE: &str = "keep_alive";

    /// Name of the robot-scoped variant of `base`, e.g. `"r1 update_pos"`.
    pub fn robot_scoped(robot_id: &str, base: &str) -> String {
        format!("{robot_id} {base}")
    }
}

/// Keys of the state mirrored into the key-value store.
pub mod keys {
    /// Set of live robot ids.
    pub const ROBOTS: &str = "robots";
    /// Hash robot id → `"x,y,angle"`.
    pub const ROBOT_POSITIONS: &str = "robots:pos";
    /// Hash robot id → `"x,y"`.
    pub const ROBOT_GOALS: &str = "robots:goals";
    /// Hash `"x,y[,z]"` → type char.
    pub const MAP: &str = "map";
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinate text
// ────────────────────────────────────────────────────────────────────────────

/// Format a coordinate for the wire.
///
/// Whole numbers keep one decimal (`1.0`, not `1`) so that the text robots
/// and consoles send survives a parse/format cycle unchanged. Everything
/// else uses the shortest representation that parses back to the same
/// `f64`.
pub fn format_coord(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e7 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Parse a comma-separated list of finite coordinates.
pub fn parse_coords(text: &str) -> Result<Vec<f64>, WireError> {
    text.split(',')
        .map(|part| {
            let value: f64 = part
                .trim()
                .parse()
                .map_err(|_| WireError::InvalidNumber(part.to_string()))?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(WireError::InvalidNumber(part.to_string()))
            }
        })
        .collect()
}

/// Errors produced while parsing the text wire formats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} comma-separated values, got {found}")]
    WrongArity { expected: usize, found: usize },

    #[error("invalid number: {0:?}")]
    InvalidNumber(String),

    #[error("missing separator between robot id and payload")]
    MissingSeparator,

    #[error("empty robot id")]
    EmptyRobotId,
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Last reported robot position, wire form `"x,y,angle"` (angle in radians).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading_rad: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading_rad: f64) -> Self {
        Self { x, y, heading_rad }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            format_coord(self.x),
            format_coord(self.y),
            format_coord(self.heading_rad)
        )
    }
}

impl FromStr for Pose {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_coords(s)?.as_slice() {
            [x, y, heading_rad] => Ok(Self::new(*x, *y, *heading_rad)),
            other => Err(WireError::WrongArity {
                expected: 3,
                found: other.len(),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Goal
// ────────────────────────────────────────────────────────────────────────────

/// Navigation target assigned to a robot, wire form `"x,y"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub x: f64,
    pub y: f64,
}

impl Goal {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", format_coord(self.x), format_coord(self.y))
    }
}

impl FromStr for Goal {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_coords(s)?.as_slice() {
            [x, y] => Ok(Self::new(*x, *y)),
            other => Err(WireError::WrongArity {
                expected: 2,
                found: other.len(),
            }),
        }
    }
}

/// A goal assignment or removal for one robot.
///
/// Wire form `"<robotId> <x>,<y>"` or `"<robotId> remove"`.  The same text is
/// used on the `update_goal` channel, on the goal WebSocket topic, and as the
/// key of the per-connection echo filter, so [`fmt::Display`] must be
/// canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalUpdate {
    pub robot_id: String,
    pub goal: Option<Goal>,
}

impl GoalUpdate {
    pub fn set(robot_id: impl Into<String>, goal: Goal) -> Self {
        Self {
            robot_id: robot_id.into(),
            goal: Some(goal),
        }
    }

    pub fn remove(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            goal: None,
        }
    }

    /// Payload part of the wire form: `"x,y"` or `"remove"`.
    pub fn payload(&self) -> String {
        match self.goal {
            Some(goal) => goal.to_string(),
            None => REMOVE.to_string(),
        }
    }
}

impl fmt::Display for GoalUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.robot_id, self.payload())
    }
}

impl FromStr for GoalUpdate {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (robot_id, payload) = split_robot_id(s)?;
        let goal = if payload.trim() == REMOVE {
            None
        } else {
            Some(payload.trim().parse()?)
        };
        Ok(Self {
            robot_id: robot_id.to_string(),
            goal,
        })
    }
}

/// Split `"<robotId> <rest>"` at the first space.
pub fn split_robot_id(message: &str) -> Result<(&str, &str), WireError> {
    let (robot_id, rest) = message
        .split_once(' ')
        .ok_or(WireError::MissingSeparator)?;
    if robot_id.is_empty() {
        return Err(WireError::EmptyRobotId);
    }
    Ok((robot_id, rest))
}

// ────────────────────────────────────────────────────────────────────────────
// Console topics
// ────────────────────────────────────────────────────────────────────────────

/// The three console-facing WebSocket topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Quantized occupancy-map diffs.
    Map,
    /// Robot positions and robot tombstones.
    Position,
    /// Goal assignments and removals.
    Goal,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Map, Topic::Position, Topic::Goal];

    /// WebSocket endpoint path serving this topic.
    pub fn ws_path(self) -> &'static str {
        match self {
            Topic::Map => "/ws/update-map",
            Topic::Position => "/ws/robot-pos",
            Topic::Goal => "/ws/update-goal",
        }
    }

    /// Resolve a request path to its topic.  Query strings are ignored.
    pub fn from_ws_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        Self::ALL.into_iter().find(|t| t.ws_path() == path)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Map => write!(f, "map"),
            Topic::Position => write!(f, "position"),
            Topic::Goal => write!(f, "goal"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimoError {
    /// The key-value store / message bus cannot be reached.
    #[error("bus unreachable: {0}")]
    Connectivity(String),

    /// A robot message did not match its channel's wire format.
    #[error("malformed message on {channel:?}: {reason} (message: {message:?})")]
    Protocol {
        channel: String,
        message: String,
        reason: String,
    },

    /// A console instruction was rejected.
    #[error("invalid instruction {instruction:?}: {reason}")]
    Validation { instruction: String, reason: String },

    /// Socket or listener failure.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LimoError {
    pub fn protocol(channel: &str, message: &str, reason: impl fmt::Display) -> Self {
        Self::Protocol {
            channel: channel.to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn validation(instruction: &str, reason: impl fmt::Display) -> Self {
        Self::Validation {
            instruction: instruction.to_string(),
            reason: reason.to_string(),
        }
    }
}
