//! Turns a page blob into aligned listing records.
//!
//! Four extraction passes (latitude, longitude, price, area) run over the
//! same blob. Their anchor counts must agree before anything is zipped,
//! otherwise a single missing block would shift every following price
//! onto the wrong coordinates.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::extract::{extract, ExtractMode, FieldRule};
use crate::types::ListingRecord;

/// Declarative rule set for one provider's page format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub latitude: FieldRule,
    pub longitude: FieldRule,
    pub price: FieldRule,
    pub area: FieldRule,
    #[serde(default)]
    pub mode: ExtractMode,
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self {
            latitude: FieldRule::new("latitude", "latLong", "latitude", ",", 10).with_absent_marker("{}"),
            longitude: FieldRule::new("longitude", "latLong", "longitude", "}", 11).with_absent_marker("{}"),
            price: FieldRule::new("price", "unformattedPrice", "unformattedPrice", ",", 18),
            area: FieldRule::new("area", "livingArea", "livingArea", ",", 12),
            mode: ExtractMode::Strict,
        }
    }
}

impl ExtractionSchema {
    /// Load a schema from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema {}", path.display()))?;
        let schema: ExtractionSchema = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse schema {}", path.display()))?;
        Ok(schema)
    }

    pub fn with_mode(mut self, mode: ExtractMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn rules(&self) -> [&FieldRule; 4] {
        [&self.latitude, &self.longitude, &self.price, &self.area]
    }

    /// Check every rule, then optionally build a sample document.
    ///
    /// Returns the number of records the sample produced. A sample with no
    /// listings at all is rejected, since it cannot confirm the anchors.
    pub fn validate(&self, sample: Option<&str>) -> Result<usize, PipelineError> {
        for rule in self.rules() {
            rule.validate()?;
        }
        let Some(sample) = sample else {
            return Ok(0);
        };
        let columns = build_columns(sample, self)?;
        if columns.is_empty() && columns.skipped.is_empty() {
            return Err(PipelineError::InvalidRule {
                field: self.latitude.name.clone(),
                reason: format!("anchor '{}' not found in sample document", self.latitude.anchor),
            });
        }
        Ok(columns.len())
    }
}

/// Index-aligned typed columns for one blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldColumns {
    /// `(latitude, longitude)` pairs.
    pub coords: Vec<(f64, f64)>,
    pub prices: Vec<i64>,
    pub areas: Vec<f64>,
    /// Listing indices dropped from all columns (no coordinates, or an
    /// empty value tolerated in permissive mode).
    pub skipped: Vec<usize>,
}

impl FieldColumns {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Zip the columns into records stamped with `observed_at`.
    pub fn into_records(self, observed_at: DateTime<Utc>) -> Vec<ListingRecord> {
        self.coords
            .into_iter()
            .zip(self.prices)
            .zip(self.areas)
            .map(|(((lat, lon), price), area)| ListingRecord::new(lat, lon, price, area, observed_at))
            .collect()
    }
}

/// Run all four passes over `blob` and coerce the results.
pub fn build_columns(blob: &str, schema: &ExtractionSchema) -> Result<FieldColumns, PipelineError> {
    let lats = extract(blob, &schema.latitude, schema.mode)?;
    let lons = extract(blob, &schema.longitude, schema.mode)?;
    let prices = extract(blob, &schema.price, schema.mode)?;
    let areas = extract(blob, &schema.area, schema.mode)?;

    let n = lats.len();
    if lons.len() != n || prices.len() != n || areas.len() != n {
        return Err(PipelineError::FieldCountMismatch {
            latitudes: n,
            longitudes: lons.len(),
            prices: prices.len(),
            areas: areas.len(),
        });
    }

    let mut columns = FieldColumns::default();
    for index in 0..n {
        let (Some(lat), Some(lon)) = (lats[index].as_value(), lons[index].as_value()) else {
            columns.skipped.push(index);
            continue;
        };
        let (Some(price), Some(area)) = (prices[index].as_value(), areas[index].as_value()) else {
            columns.skipped.push(index);
            continue;
        };

        if schema.mode == ExtractMode::Permissive
            && [lat, lon, price, area].iter().any(|v| v.trim().is_empty())
        {
            columns.skipped.push(index);
            continue;
        }

        columns.coords.push((
            parse_float(lat, &schema.latitude, index)?,
            parse_float(lon, &schema.longitude, index)?,
        ));
        columns.prices.push(parse_int(price, &schema.price, index)?);
        columns.areas.push(parse_float(area, &schema.area, index)?);
    }

    Ok(columns)
}

/// Build one blob straight into records.
pub fn build_records(
    blob: &str,
    schema: &ExtractionSchema,
    observed_at: DateTime<Utc>,
) -> Result<(Vec<ListingRecord>, Vec<usize>), PipelineError> {
    let mut columns = build_columns(blob, schema)?;
    let skipped = std::mem::take(&mut columns.skipped);
    Ok((columns.into_records(observed_at), skipped))
}

fn malformed(rule: &FieldRule, index: usize, raw: &str) -> PipelineError {
    PipelineError::MalformedField {
        field: rule.name.clone(),
        index,
        raw: raw.to_string(),
    }
}

fn parse_float(raw: &str, rule: &FieldRule, index: usize) -> Result<f64, PipelineError> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(malformed(rule, index, raw)),
    }
}

fn parse_int(raw: &str, rule: &FieldRule, index: usize) -> Result<i64, PipelineError> {
    raw.trim().parse::<i64>().map_err(|_| malformed(rule, index, raw))
}

#[cfg(test)]
pub(crate) fn listing_json(lat: f64, lon: f64, price: i64, area: f64) -> String {
    format!(
        r#"{{"zpid":"1","latLong":{{"latitude":{lat},"longitude":{lon}}},"hdpData":{{"homeInfo":{{"unformattedPrice":{price},"livingArea":{area},"homeType":"SINGLE_FAMILY"}}}}}},"#
    )
}
