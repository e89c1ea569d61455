//! Grid coordinates and quantization.
//!
//! A [`GridCoord`] is a 2-D or 3-D point used as a map key.  The
//! [`Quantizer`] maps raw sensor coordinates onto the grid with
//! `round(raw / cell_size) * cell_size` per axis, so any two raw points
//! within half a cell of the same grid node collapse to one key.
//!
//! # Example
//!
//! ```rust
//! use limo_perception::grid::{GridCoord, Quantizer};
//!
//! let q = Quantizer::new(0.05);
//! let a = q.quantize(GridCoord::new_2d(1.01, 2.0));
//! let b = q.quantize(GridCoord::new_2d(0.99, 2.01));
//! assert_eq!(a, b);
//! assert_eq!(a.unwrap().to_string(), "1.0,2.0");
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use limo_types::{WireError, format_coord, parse_coords};

/// Physical size of one grid cell, in metres.
pub const DEFAULT_CELL_SIZE: f64 = 0.05;

// ────────────────────────────────────────────────────────────────────────────
// GridCoord
// ────────────────────────────────────────────────────────────────────────────

/// A map coordinate `(x, y[, z])`.
///
/// Equality and hashing compare the exact bit patterns of the components,
/// after `-0.0` has been folded into `0.0` by the constructors.  Components
/// are always finite when produced by [`FromStr`] or [`Quantizer::quantize`].
#[derive(Debug, Clone, Copy)]
pub struct GridCoord {
    x: f64,
    y: f64,
    z: Option<f64>,
}

impl GridCoord {
    pub fn new_2d(x: f64, y: f64) -> Self {
        Self {
            x: fold_zero(x),
            y: fold_zero(y),
            z: None,
        }
    }

    pub fn new_3d(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: fold_zero(x),
            y: fold_zero(y),
            z: Some(fold_zero(z)),
        }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn z(&self) -> Option<f64> {
        self.z
    }

    fn bits(&self) -> (u64, u64, Option<u64>) {
        (self.x.to_bits(), self.y.to_bits(), self.z.map(f64::to_bits))
    }
}

fn fold_zero(v: f64) -> f64 {
    v + 0.0
}

impl PartialEq for GridCoord {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for GridCoord {}

impl Hash for GridCoord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Store-key form: `"x,y"` or `"x,y,z"`.
impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", format_coord(self.x), format_coord(self.y))?;
        if let Some(z) = self.z {
            write!(f, ",{}", format_coord(z))?;
        }
        Ok(())
    }
}

impl FromStr for GridCoord {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_coords(s)?.as_slice() {
            [x, y] => Ok(Self::new_2d(*x, *y)),
            [x, y, z] => Ok(Self::new_3d(*x, *y, *z)),
            other => Err(WireError::WrongArity {
                expected: 2,
                found: other.len(),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Quantizer
// ────────────────────────────────────────────────────────────────────────────

/// Snaps coordinates onto a grid of fixed `cell_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    cell_size: f64,
}

impl Quantizer {
    /// Create a quantizer.  Non-positive or non-finite sizes fall back to
    /// [`DEFAULT_CELL_SIZE`].
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self { cell_size }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Snap one axis value.  `None` when the snapped value is not finite,
    /// which happens for inputs near `f64::MAX`.
    pub fn quantize_value(&self, raw: f64) -> Option<f64> {
        let snapped = (raw / self.cell_size).round() * self.cell_size;
        snapped.is_finite().then(|| fold_zero(snapped))
    }

    /// Snap every axis of `coord`; `None` if any axis leaves the finite range.
    pub fn quantize(&self, coord: GridCoord) -> Option<GridCoord> {
        let x = self.quantize_value(coord.x)?;
        let y = self.quantize_value(coord.y)?;
        match coord.z {
            Some(z) => Some(GridCoord::new_3d(x, y, self.quantize_value(z)?)),
            None => Some(GridCoord::new_2d(x, y)),
        }
    }
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}
