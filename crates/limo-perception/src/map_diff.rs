//! Occupancy-map diffs and their text codec.
//!
//! A diff body is a space-separated list of tokens `<type><x>,<y>[,<z>]`
//! where `<type>` is one of `W` (wall), `U` (unknown) or `P` (passable):
//!
//! ```text
//! W1.0,1.0 W1.05,1.0 P0.5,0.5,0.0 U2.0,2.0
//! ```
//!
//! Within one [`MapDiff`] every coordinate holds exactly one [`CellType`];
//! a later observation of the same coordinate overwrites the earlier one.
//! There is no delete: a cell changes only by being observed again.

use std::fmt;

use indexmap::IndexMap;
use limo_types::WireError;
use thiserror::Error;

use crate::grid::{GridCoord, Quantizer};

/// Tokens shorter than this (`W1,2`) are treated as truncation debris.
const MIN_TOKEN_LEN: usize = 4;

/// Errors produced while decoding or quantizing a diff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("unknown cell type {0:?} in token {1:?}")]
    UnknownCellType(char, String),

    #[error("bad coordinates in token {token:?}: {source}")]
    BadCoordinates {
        token: String,
        #[source]
        source: WireError,
    },

    #[error("token {0:?} falls outside the representable grid")]
    OutOfRange(String),
}

// ────────────────────────────────────────────────────────────────────────────
// CellType
// ────────────────────────────────────────────────────────────────────────────

/// Occupancy class of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Wall,
    Unknown,
    Passable,
}

impl CellType {
    pub fn as_char(self) -> char {
        match self {
            CellType::Wall => 'W',
            CellType::Unknown => 'U',
            CellType::Passable => 'P',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'W' => Some(CellType::Wall),
            'U' => Some(CellType::Unknown),
            'P' => Some(CellType::Passable),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapPoint
// ────────────────────────────────────────────────────────────────────────────

/// One typed observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapPoint {
    pub coord: GridCoord,
    pub cell: CellType,
}

impl MapPoint {
    pub fn new(coord: GridCoord, cell: CellType) -> Self {
        Self { coord, cell }
    }
}

/// Token form: `W1.0,2.0`.
impl fmt::Display for MapPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.cell.as_char(), self.coord)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapDiff
// ────────────────────────────────────────────────────────────────────────────

/// A last-write-wins set of typed points.
///
/// Insertion order is kept so that encoding is deterministic, but equality
/// ignores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapDiff {
    points: IndexMap<GridCoord, CellType>,
}

impl MapDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation, replacing any previous type at `coord`.
    pub fn insert(&mut self, coord: GridCoord, cell: CellType) {
        self.points.insert(coord, cell);
    }

    pub fn get(&self, coord: &GridCoord) -> Option<CellType> {
        self.points.get(coord).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MapPoint> + '_ {
        self.points
            .iter()
            .map(|(coord, cell)| MapPoint::new(*coord, *cell))
    }

    /// Fold `other` into `self`; points of `other` win on collision.
    pub fn merge(&mut self, other: &MapDiff) {
        for point in other.iter() {
            self.insert(point.coord, point.cell);
        }
    }

    /// Snap every point onto the grid.  Points that land on the same cell
    /// keep the type of the one that came last.
    ///
    /// # Errors
    ///
    /// [`DiffError::OutOfRange`] when a point snaps to a non-finite
    /// coordinate; such a point could never be decoded again.
    pub fn quantized(&self, quantizer: &Quantizer) -> Result<MapDiff, DiffError> {
        let mut out = MapDiff::new();
        for point in self.iter() {
            let coord = quantizer
                .quantize(point.coord)
                .ok_or_else(|| DiffError::OutOfRange(point.to_string()))?;
            out.insert(coord, point.cell);
        }
        Ok(out)
    }

    /// Encode as a single body.
    pub fn encode(&self) -> String {
        encode_points(self.iter())
    }

    /// Encode as bodies of at most `max_points` tokens each.
    ///
    /// Always returns at least one body, which is empty for an empty diff.
    pub fn encode_chunks(&self, max_points: usize) -> Vec<String> {
        let max_points = max_points.max(1);
        if self.len() <= max_points {
            return vec![self.encode()];
        }
        let points: Vec<MapPoint> = self.iter().collect();
        points
            .chunks(max_points)
            .map(|chunk| encode_points(chunk.iter().copied()))
            .collect()
    }

    /// Decode a diff body.
    ///
    /// Empty and too-short tokens are skipped without error; any other
    /// malformed token rejects the whole body.
    pub fn decode(body: &str) -> Result<MapDiff, DiffError> {
        let mut diff = MapDiff::new();
        for token in body.split(' ') {
            if token.len() < MIN_TOKEN_LEN {
                continue;
            }
            let mut chars = token.chars();
            let Some(type_char) = chars.next() else {
                continue;
            };
            let cell = CellType::from_char(type_char)
                .ok_or_else(|| DiffError::UnknownCellType(type_char, token.to_string()))?;
            let coord: GridCoord =
                chars
                    .as_str()
                    .parse()
                    .map_err(|source| DiffError::BadCoordinates {
                        token: token.to_string(),
                        source,
                    })?;
            diff.insert(coord, cell);
        }
        Ok(diff)
    }
}

impl FromIterator<MapPoint> for MapDiff {
    fn from_iter<I: IntoIterator<Item = MapPoint>>(iter: I) -> Self {
        let mut diff = MapDiff::new();
        for point in iter {
            diff.insert(point.coord, point.cell);
        }
        diff
    }
}

fn encode_points(points: impl Iterator<Item = MapPoint>) -> String {
    let mut body = String::new();
    for point in points {
        if !body.is_empty() {
            body.push(' ');
        }
        body.push_str(&point.to_string());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2(cell: CellType, x: f64, y: f64) -> MapPoint {
        MapPoint::new(GridCoord::new_2d(x, y), cell)
    }

    #[test]
    fn decode_parses_typed_tokens() {
        let diff = MapDiff::decode("W1.0,1.0 U2.0,2.0 P0.5,0.5,0.25").unwrap();
        assert_eq!(diff.len(), 3);
        assert_eq!(
            diff.get(&GridCoord::new_2d(1.0, 1.0)),
            Some(CellType::Wall)
        );
        assert_eq!(
            diff.get(&GridCoord::new_3d(0.5, 0.5, 0.25)),
            Some(CellType::Passable)
        );
    }

    #[test]
    fn decode_skips_empty_and_short_tokens() {
        let diff = MapDiff::decode("  W1.0,1.0  P1 U2.0,2.0 ").unwrap();
        assert_eq!(diff.len(), 2);
        assert!(MapDiff::decode("").unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(matches!(
            MapDiff::decode("W1.0,1.0 X2.0,2.0"),
            Err(DiffError::UnknownCellType('X', _))
        ));
    }

    #[test]
    fn decode_rejects_bad_coordinates() {
        assert!(matches!(
            MapDiff::decode("W1.0;1.0"),
            Err(DiffError::BadCoordinates { .. })
        ));
        assert!(matches!(
            MapDiff::decode("W1.0,2.0,3.0,4.0"),
            Err(DiffError::BadCoordinates { .. })
        ));
    }

    #[test]
    fn later_token_wins_on_same_coordinate() {
        let diff = MapDiff::decode("W1.0,1.0 P1.0,1.0").unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(
            diff.get(&GridCoord::new_2d(1.0, 1.0)),
            Some(CellType::Passable)
        );
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let diff: MapDiff = [
            p2(CellType::Wall, 1.0, 1.0),
            p2(CellType::Unknown, -2.35, 0.15000000000000002),
            MapPoint::new(GridCoord::new_3d(0.1, 0.2, 0.3), CellType::Passable),
            p2(CellType::Passable, 1234.5, -0.05),
        ]
        .into_iter()
        .collect();
        assert_eq!(MapDiff::decode(&diff.encode()).unwrap(), diff);
    }

    #[test]
    fn equality_ignores_order() {
        let a = MapDiff::decode("W1.0,1.0 U2.0,2.0").unwrap();
        let b = MapDiff::decode("U2.0,2.0 W1.0,1.0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn aligned_diff_quantizes_to_identical_tokens() {
        let q = Quantizer::new(0.05);
        let diff = MapDiff::decode("W1.0,1.0 U2.0,2.0").unwrap();
        let snapped = diff.quantized(&q).unwrap();
        assert_eq!(snapped, diff);
        assert_eq!(snapped.encode(), "W1.0,1.0 U2.0,2.0");
    }

    #[test]
    fn quantize_collapses_nearby_observations() {
        let q = Quantizer::new(0.05);
        let diff = MapDiff::decode("W1.01,1.0 P0.99,1.02").unwrap();
        let snapped = diff.quantized(&q).unwrap();
        assert_eq!(snapped.len(), 1);
        assert_eq!(snapped.encode(), "P1.0,1.0");
    }

    #[test]
    fn quantize_commutes_with_union() {
        let q = Quantizer::new(0.05);
        let a = MapDiff::decode("W1.01,1.0 U3.02,0.49").unwrap();
        let b = MapDiff::decode("P-0.51,2.0 W0.26,0.74,0.1").unwrap();

        let mut union = a.clone();
        union.merge(&b);

        let mut snapped_union = a.quantized(&q).unwrap();
        snapped_union.merge(&b.quantized(&q).unwrap());

        assert_eq!(union.quantized(&q).unwrap(), snapped_union);
    }

    #[test]
    fn quantize_rejects_points_beyond_the_grid() {
        let q = Quantizer::new(0.05);
        let diff = MapDiff::decode("W1e308,1.0").unwrap();
        assert!(matches!(
            diff.quantized(&q),
            Err(DiffError::OutOfRange(token)) if token.starts_with('W')
        ));

        let ok = MapDiff::decode("W1e300,1.0").unwrap().quantized(&q).unwrap();
        assert_eq!(MapDiff::decode(&ok.encode()).unwrap(), ok);
    }

    #[test]
    fn encode_chunks_bounds_points_per_body() {
        let diff: MapDiff = (0..45)
            .map(|i| p2(CellType::Wall, f64::from(i), 0.0))
            .collect();
        let chunks = diff.encode_chunks(20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].split(' ').count(), 20);
        assert_eq!(chunks[2].split(' ').count(), 5);

        let mut rebuilt = MapDiff::new();
        for chunk in &chunks {
            rebuilt.merge(&MapDiff::decode(chunk).unwrap());
        }
        assert_eq!(rebuilt, diff);
    }

    #[test]
    fn encode_chunks_of_small_diff_is_single_body() {
        let diff = MapDiff::decode("W1.0,1.0").unwrap();
        assert_eq!(diff.encode_chunks(20000), vec!["W1.0,1.0".to_string()]);
        assert_eq!(MapDiff::new().encode_chunks(20000), vec![String::new()]);
    }
}
