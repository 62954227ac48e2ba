//! Listing records and the small enums shared across the pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Which search a table or raw document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Sale,
    Sold,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 2] = [TransactionKind::Sale, TransactionKind::Sold];

    pub fn label(&self) -> &str {
        match self {
            TransactionKind::Sale => "sale",
            TransactionKind::Sold => "sold",
        }
    }

    /// Human-readable title used in rendered output.
    pub fn title(&self) -> &str {
        match self {
            TransactionKind::Sale => "For Sale",
            TransactionKind::Sold => "Sold",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sale" | "for-sale" | "forsale" => Ok(TransactionKind::Sale),
            "sold" => Ok(TransactionKind::Sold),
            other => Err(format!("unknown transaction kind '{}' (expected sale or sold)", other)),
        }
    }
}

/// One observed property listing.
///
/// Column names match the persisted table header, so the struct is
/// serialized directly with `csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub latitude: f64,
    pub longitude: f64,
    /// Unformatted listing price in whole currency units.
    pub price: i64,
    /// Living area in square feet. May be zero.
    pub area: f64,
    /// `price / area`; `None` when the area is zero (written as an empty field).
    #[serde(alias = "p/a")]
    pub price_per_area: Option<f64>,
    /// Wall-clock time the record was built. `None` only for rows read
    /// from files written without a `time_run` column.
    #[serde(rename = "time_run", default, deserialize_with = "deserialize_time_run")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl ListingRecord {
    pub fn new(latitude: f64, longitude: f64, price: i64, area: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            price,
            area,
            price_per_area: price_per_area(price, area),
            observed_at: Some(observed_at),
        }
    }
}

/// Naive timestamp layout written by older table files.
const NAIVE_TIME_RUN: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a `time_run` cell: RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.ffffff]`
/// taken as UTC. An empty cell is `None`.
pub fn parse_time_run(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(raw, NAIVE_TIME_RUN)
        .map(|naive| Some(naive.and_utc()))
        .map_err(|e| format!("invalid time_run '{}': {}", raw, e))
}

fn deserialize_time_run<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_time_run(&raw).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Derived price per unit area, or `None` when it is undefined.
pub fn price_per_area(price: i64, area: f64) -> Option<f64> {
    if area == 0.0 || !area.is_finite() {
        return None;
    }
    let ppa = price as f64 / area;
    ppa.is_finite().then_some(ppa)
}

/// Value aggregated per grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Price,
    PricePerArea,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Price, Metric::PricePerArea];

    /// Metric value for a row; `None` excludes the row from aggregation.
    pub fn value(&self, record: &ListingRecord) -> Option<f64> {
        match self {
            Metric::Price => Some(record.price as f64),
            Metric::PricePerArea => record.price_per_area,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Metric::Price => "price",
            Metric::PricePerArea => "price_per_area",
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Metric::Price => "Price",
            Metric::PricePerArea => "Price/Area",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "price" => Ok(Metric::Price),
            "price_per_area" | "ppa" | "p/a" => Ok(Metric::PricePerArea),
            other => Err(format!("unknown metric '{}' (expected price or price_per_area)", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_price_per_area_defined() {
        let ppa = price_per_area(500_000, 2000.0).unwrap();
        assert!((ppa - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_price_per_area_zero_area_is_undefined() {
        assert_eq!(price_per_area(500_000, 0.0), None);
        assert_eq!(price_per_area(500_000, -0.0), None);
        assert_eq!(price_per_area(500_000, f64::NAN), None);
    }

    #[test]
    fn test_record_new_derives_ppa() {
        let now = Utc::now();
        let r = ListingRecord::new(39.7, -104.9, 300_000, 1500.0, now);
        assert_eq!(r.price_per_area, Some(200.0));
        assert_eq!(r.observed_at, Some(now));

        let r = ListingRecord::new(39.7, -104.9, 300_000, 0.0, now);
        assert_eq!(r.price_per_area, None);
    }

    #[test]
    fn test_parse_time_run_formats() {
        let rfc = parse_time_run("2026-01-15T10:30:00Z").unwrap().unwrap();
        assert_eq!(rfc, Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap());

        let naive = parse_time_run("2021-03-04 17:22:09.123456").unwrap().unwrap();
        assert_eq!(naive.timestamp_subsec_micros(), 123_456);
        assert_eq!(naive.format("%Y-%m-%d %H:%M:%S").to_string(), "2021-03-04 17:22:09");
        assert!(parse_time_run("2021-03-04 17:22:09").unwrap().is_some());

        assert_eq!(parse_time_run("").unwrap(), None);
        assert!(parse_time_run("yesterday").is_err());
    }

    #[test]
    fn test_metric_excludes_undefined_ppa() {
        let r = ListingRecord::new(39.7, -104.9, 300_000, 0.0, Utc::now());
        assert_eq!(Metric::Price.value(&r), Some(300_000.0));
        assert_eq!(Metric::PricePerArea.value(&r), None);
    }

    #[test]
    fn test_parse_kind_and_metric() {
        assert_eq!("sold".parse::<TransactionKind>().unwrap(), TransactionKind::Sold);
        assert_eq!("For-Sale".parse::<TransactionKind>().unwrap(), TransactionKind::Sale);
        assert!("rent".parse::<TransactionKind>().is_err());
        assert_eq!("p/a".parse::<Metric>().unwrap(), Metric::PricePerArea);
        assert!("volume".parse::<Metric>().is_err());
    }
}
