//! Market configuration file and run settings.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::builder::ExtractionSchema;
use crate::error::PipelineError;
use crate::grid::{BoundsSource, DEFAULT_STEP};
use crate::table::DedupKey;
use crate::types::TransactionKind;

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Pages fetched per market and transaction kind.
pub const DEFAULT_PAGES: u32 = 20;

/// Search URL templates per market, as stored in `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(rename = "forSale_urls", default)]
    pub for_sale_urls: BTreeMap<String, String>,
    #[serde(rename = "sold_urls", default)]
    pub sold_urls: BTreeMap<String, String>,
}

/// Resolved search templates for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPair {
    pub sale: String,
    pub sold: String,
}

impl UrlPair {
    pub fn get(&self, kind: TransactionKind) -> &str {
        match kind {
            TransactionKind::Sale => &self.sale,
            TransactionKind::Sold => &self.sold,
        }
    }
}

impl MarketConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::ConfigMissing(path.to_path_buf()).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config {}", path.display()));
            }
        };
        serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Placeholder config with empty URLs for `market`.
    pub fn template(market: &str) -> Self {
        let mut cfg = Self::default();
        cfg.for_sale_urls.insert(market.to_string(), String::new());
        cfg.sold_urls.insert(market.to_string(), String::new());
        cfg
    }

    /// Both search templates for `market`. Empty entries count as missing.
    pub fn urls(&self, market: &str) -> Result<UrlPair, PipelineError> {
        let lookup = |map: &BTreeMap<String, String>, missing: &'static str| {
            map.get(market)
                .filter(|u| !u.trim().is_empty())
                .cloned()
                .ok_or_else(|| PipelineError::ConfigKey {
                    market: market.to_string(),
                    missing,
                })
        };
        Ok(UrlPair {
            sale: lookup(&self.for_sale_urls, "forSale_urls")?,
            sold: lookup(&self.sold_urls, "sold_urls")?,
        })
    }

    /// Markets with a usable URL in both maps, sorted.
    pub fn markets(&self) -> Vec<&str> {
        self.for_sale_urls
            .keys()
            .filter(|m| self.urls(m).is_ok())
            .map(String::as_str)
            .collect()
    }
}

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root folder holding one sub-folder per market.
    pub data_dir: PathBuf,
    pub pages: u32,
    pub dedup: DedupKey,
    pub schema: ExtractionSchema,
    pub step: f64,
    pub bounds: BoundsSource,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            pages: DEFAULT_PAGES,
            dedup: DedupKey::Exact,
            schema: ExtractionSchema::default(),
            step: DEFAULT_STEP,
            bounds: BoundsSource::Observed,
        }
    }
}
