use serde::{Deserialize, Serialize};

/// Edge length of one grid cell in degrees of latitude (~1.1 km).
pub const CELL_EDGE_DEG: f64 = 0.01;

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const COLS: u64 = 36_000;
const ROWS: u64 = 18_000;

/// Identifier of one fixed-resolution cell of the lat/lng grid.
///
/// Cells are materialized on engineer records at location-write time so the
/// candidate query can pre-filter by cell membership instead of scanning
/// every engineer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(u64);

impl CellId {
    fn from_row_col(row: u64, col: u64) -> Self {
        CellId(row * COLS + col)
    }

    fn row(self) -> u64 {
        self.0 / COLS
    }

    fn col(self) -> u64 {
        self.0 % COLS
    }
}

/// Maps a coordinate onto its grid cell. Deterministic; the poles and the
/// antimeridian fall into the outermost row/column.
pub fn cell_of(lat: f64, lng: f64) -> CellId {
    let row = (((lat + 90.0) / CELL_EDGE_DEG) as u64).min(ROWS - 1);
    let col = (((lng + 180.0) / CELL_EDGE_DEG) as u64).min(COLS - 1);
    CellId::from_row_col(row, col)
}

/// All cells within `k` concentric rings of `cell` (the (2k+1)^2 block).
pub fn ring(cell: CellId, k: u64) -> Vec<CellId> {
    rect_ring(cell, k, k)
}

/// Cells covering a circle of `radius_m` around the coordinate. Rows are
/// sized from meters-per-degree latitude; columns are widened by 1/cos(lat)
/// so the ring never under-covers east-west at high latitudes. One extra
/// ring absorbs the offset of the center point inside its own cell.
pub fn covering_cells(lat: f64, lng: f64, radius_m: f64) -> Vec<CellId> {
    let cell = cell_of(lat, lng);
    let edge_m = CELL_EDGE_DEG * METERS_PER_DEG_LAT;
    let k_rows = (radius_m / edge_m).ceil() as u64 + 1;
    let cos_lat = lat.to_radians().cos().max(0.01);
    let k_cols = (radius_m / (edge_m * cos_lat)).ceil() as u64 + 1;
    rect_ring(cell, k_rows, k_cols)
}

fn rect_ring(cell: CellId, k_rows: u64, k_cols: u64) -> Vec<CellId> {
    let k_rows = k_rows.min(ROWS);
    let k_cols = k_cols.min((COLS - 1) / 2);

    let row = cell.row();
    let col = cell.col() as i64;

    let row_lo = row.saturating_sub(k_rows);
    let row_hi = (row + k_rows).min(ROWS - 1);

    let mut cells = Vec::with_capacity(((row_hi - row_lo + 1) * (2 * k_cols + 1)) as usize);
    for r in row_lo..=row_hi {
        for dc in -(k_cols as i64)..=(k_cols as i64) {
            let c = (col + dc).rem_euclid(COLS as i64) as u64;
            cells.push(CellId::from_row_col(r, c));
        }
    }
    cells
}
