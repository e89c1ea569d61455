//! `limo-perception` – occupancy-map representation.
//!
//! Robots observe their surroundings independently and report what they see
//! as text diffs.  This crate turns that text into grid-aligned points so
//! that observations of the same physical cell from different robots
//! collide on the same key.
//!
//! # Modules
//!
//! - [`grid`] – [`Quantizer`][grid::Quantizer]: snaps raw coordinates onto
//!   the fixed grid, and [`GridCoord`][grid::GridCoord], the hashable
//!   coordinate key.
//! - [`map_diff`] – [`MapDiff`][map_diff::MapDiff]: the last-write-wins set
//!   of typed points and its `W1.0,2.0 P0.5,0.5` wire codec.

pub mod grid;
pub mod map_diff;

pub use grid::{DEFAULT_CELL_SIZE, GridCoord, Quantizer};
pub use map_diff::{CellType, DiffError, MapDiff, MapPoint};
