//! Spatial binning of a listing table into a uniform lat/lon grid.
//!
//! Labels are generated from integer step indices rather than by repeated
//! float addition, so `[40.00, 40.03]` at `0.01` always yields exactly four
//! labels.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::table::ListingTable;
use crate::types::{ListingRecord, Metric};

/// Tolerance, in step units, when snapping a coordinate to a bin edge.
const EDGE_EPS: f64 = 1e-9;

/// Largest step index a grid edge may sit at; keeps index math exact in
/// both `f64` and `i64`.
const MAX_INDEX: f64 = 4_503_599_627_370_496.0; // 2^52

/// Refuse to allocate grids larger than this many cells.
pub const MAX_CELLS: usize = 4_000_000;

/// Default bin size in degrees.
pub const DEFAULT_STEP: f64 = 0.01;

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Result<Self, PipelineError> {
        let b = Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        };
        if ![min_lat, max_lat, min_lon, max_lon].iter().all(|v| v.is_finite()) {
            return Err(PipelineError::InvalidBounds(format!("non-finite bound in {:?}", b)));
        }
        if min_lat > max_lat || min_lon > max_lon {
            return Err(PipelineError::InvalidBounds(format!("min exceeds max in {:?}", b)));
        }
        Ok(b)
    }

    /// Min/max of the rows' coordinates, or `None` for no rows.
    pub fn observed(rows: &[ListingRecord]) -> Option<Self> {
        let first = rows.first()?;
        let init = Self {
            min_lat: first.latitude,
            max_lat: first.latitude,
            min_lon: first.longitude,
            max_lon: first.longitude,
        };
        Some(rows.iter().fold(init, |b, r| Self {
            min_lat: b.min_lat.min(r.latitude),
            max_lat: b.max_lat.max(r.latitude),
            min_lon: b.min_lon.min(r.longitude),
            max_lon: b.max_lon.max(r.longitude),
        }))
    }

    /// Read the `mapBounds` box out of a search URL's encoded query state.
    pub fn from_query_url(raw: &str) -> Result<Self, PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidBounds(reason);
        let url = url::Url::parse(raw).map_err(|e| invalid(format!("bad url: {}", e)))?;

        for (_, value) in url.query_pairs() {
            let Ok(state) = serde_json::from_str::<serde_json::Value>(&value) else {
                continue;
            };
            let map = &state["mapBounds"];
            if map.is_null() {
                continue;
            }
            let get = |key: &str| {
                map[key]
                    .as_f64()
                    .ok_or_else(|| invalid(format!("mapBounds.{} missing or not a number", key)))
            };
            return Self::new(get("south")?, get("north")?, get("west")?, get("east")?);
        }

        Err(invalid("url has no mapBounds in its query state".to_string()))
    }
}

/// Where grid bounds come from for one build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundsPolicy {
    /// The search query's bounding box; cells beyond the data stay empty.
    Query(Bounds),
    /// The table's own coordinate extent.
    Observed,
}

/// Selector for [`BoundsPolicy`] before a query box is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsSource {
    Query,
    #[default]
    Observed,
}

impl std::str::FromStr for BoundsSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(BoundsSource::Query),
            "observed" => Ok(BoundsSource::Observed),
            other => Err(format!("unknown bounds policy '{}' (expected query or observed)", other)),
        }
    }
}

/// Averaged metric per (latitude bin, longitude bin).
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialGrid {
    pub step: f64,
    /// Decimal places of the labels.
    pub decimals: u32,
    /// Ascending row labels.
    pub lat_labels: Vec<f64>,
    /// Ascending column labels.
    pub lon_labels: Vec<f64>,
    /// `values[row][col]`, running mean of the metric; zero for empty cells.
    pub values: Vec<Vec<f64>>,
    pub counts: Vec<Vec<u32>>,
    /// Rows that fell outside the labels and were clipped to the edge bin.
    pub clipped: usize,
    /// Rows with no metric value (e.g. undefined price per area).
    pub excluded: usize,
    lat_origin: i64,
    lon_origin: i64,
}

impl SpatialGrid {
    /// Zeroed grid covering `bounds`, rounded outward to `step` multiples.
    pub fn with_bounds(bounds: &Bounds, step: f64) -> Result<Self, PipelineError> {
        check_step(step)?;
        let decimals = step_decimals(step);

        let (lat_lo, lat_hi) = (floor_index(bounds.min_lat, step)?, ceil_index(bounds.max_lat, step)?);
        let (lon_lo, lon_hi) = (floor_index(bounds.min_lon, step)?, ceil_index(bounds.max_lon, step)?);
        let too_many = || {
            PipelineError::InvalidBounds(format!(
                "grid at step {} over {:?} exceeds {} cells",
                step, bounds, MAX_CELLS
            ))
        };
        let rows = span(lat_lo, lat_hi).ok_or_else(too_many)?;
        let cols = span(lon_lo, lon_hi).ok_or_else(too_many)?;
        if rows.saturating_mul(cols) > MAX_CELLS {
            return Err(PipelineError::InvalidBounds(format!(
                "{} x {} cells at step {} exceeds {} cells",
                rows, cols, step, MAX_CELLS
            )));
        }

        let labels = |lo: i64, hi: i64| -> Vec<f64> {
            (lo..=hi).map(|i| round_to(i as f64 * step, decimals)).collect()
        };

        Ok(Self {
            step,
            decimals,
            lat_labels: labels(lat_lo, lat_hi),
            lon_labels: labels(lon_lo, lon_hi),
            values: vec![vec![0.0; cols]; rows],
            counts: vec![vec![0; cols]; rows],
            clipped: 0,
            excluded: 0,
            lat_origin: lat_lo,
            lon_origin: lon_lo,
        })
    }

    pub fn rows(&self) -> usize {
        self.lat_labels.len()
    }

    pub fn cols(&self) -> usize {
        self.lon_labels.len()
    }

    /// Cell holding a coordinate, clipped into range. The flag is true
    /// when clipping was needed.
    pub fn cell_of(&self, lat: f64, lon: f64) -> (usize, usize, bool) {
        let (row, row_clipped) = self.clip(lat, self.lat_origin, self.rows());
        let (col, col_clipped) = self.clip(lon, self.lon_origin, self.cols());
        (row, col, row_clipped || col_clipped)
    }

    /// Fold one sample into its cell's running mean.
    pub fn observe(&mut self, lat: f64, lon: f64, value: f64) {
        let (row, col, clipped) = self.cell_of(lat, lon);
        if clipped {
            self.clipped += 1;
        }
        let count = &mut self.counts[row][col];
        *count += 1;
        let mean = &mut self.values[row][col];
        *mean += (value - *mean) / f64::from(*count);
    }

    /// Mean at the cell labelled `(lat, lon)`, if that cell has samples.
    pub fn value_at(&self, lat: f64, lon: f64) -> Option<f64> {
        let (row, col) = self.label_position(lat, lon)?;
        (self.counts[row][col] > 0).then(|| self.values[row][col])
    }

    pub fn count_at(&self, lat: f64, lon: f64) -> u32 {
        self.label_position(lat, lon)
            .map_or(0, |(row, col)| self.counts[row][col])
    }

    /// Smallest and largest mean over occupied cells.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.occupied()
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn occupied_cells(&self) -> usize {
        self.occupied().count()
    }

    fn occupied(&self) -> impl Iterator<Item = f64> + '_ {
        self.values
            .iter()
            .zip(&self.counts)
            .flat_map(|(vals, counts)| vals.iter().zip(counts))
            .filter(|(_, &c)| c > 0)
            .map(|(&v, _)| v)
    }

    /// Offset of `v`'s bin from `origin`, clamped to `0..len`. Computed in
    /// `f64` so coordinates far outside the grid cannot overflow.
    fn clip(&self, v: f64, origin: i64, len: usize) -> (usize, bool) {
        let idx = (v / self.step + EDGE_EPS).floor() - origin as f64;
        let max = len.saturating_sub(1);
        if !(idx >= 0.0) {
            (0, true)
        } else if idx > max as f64 {
            (max, true)
        } else {
            (idx as usize, false)
        }
    }

    fn label_position(&self, lat: f64, lon: f64) -> Option<(usize, usize)> {
        let row = self.lat_labels.iter().position(|&l| same_label(l, lat, self.step))?;
        let col = self.lon_labels.iter().position(|&l| same_label(l, lon, self.step))?;
        Some((row, col))
    }
}

/// Bin `metric` over the table's rows.
pub fn bin(
    table: &ListingTable,
    metric: Metric,
    step: f64,
    policy: &BoundsPolicy,
) -> Result<SpatialGrid, PipelineError> {
    check_step(step)?;
    let bounds = match policy {
        BoundsPolicy::Query(b) => *b,
        BoundsPolicy::Observed => Bounds::observed(&table.rows).ok_or(PipelineError::EmptyTable)?,
    };

    let mut grid = SpatialGrid::with_bounds(&bounds, step)?;
    for row in &table.rows {
        match metric.value(row) {
            Some(v) => grid.observe(row.latitude, row.longitude, v),
            None => grid.excluded += 1,
        }
    }

    debug!(
        metric = %metric,
        rows = grid.rows(),
        cols = grid.cols(),
        occupied = grid.occupied_cells(),
        clipped = grid.clipped,
        excluded = grid.excluded,
        "binned table"
    );
    Ok(grid)
}

fn check_step(step: f64) -> Result<(), PipelineError> {
    if step > 0.0 && step.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::InvalidStep(step))
    }
}

fn floor_index(v: f64, step: f64) -> Result<i64, PipelineError> {
    edge_index((v / step + EDGE_EPS).floor(), step)
}

fn ceil_index(v: f64, step: f64) -> Result<i64, PipelineError> {
    edge_index((v / step - EDGE_EPS).ceil(), step)
}

fn edge_index(idx: f64, step: f64) -> Result<i64, PipelineError> {
    if idx.is_finite() && idx.abs() <= MAX_INDEX {
        Ok(idx as i64)
    } else {
        Err(PipelineError::InvalidStep(step))
    }
}

/// Number of labels in `lo..=hi`.
fn span(lo: i64, hi: i64) -> Option<usize> {
    let n = hi.checked_sub(lo)?.checked_add(1)?;
    usize::try_from(n).ok()
}

fn same_label(label: f64, v: f64, step: f64) -> bool {
    (label - v).abs() < step * 1e-6
}

/// Decimal places needed to print multiples of `step` exactly.
pub fn step_decimals(step: f64) -> u32 {
    let mut scaled = step;
    let mut decimals = 0;
    while (scaled - scaled.round()).abs() > 1e-9 && decimals < 12 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

fn round_to(v: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (v * scale).round() / scale
}
