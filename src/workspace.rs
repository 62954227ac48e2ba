//! On-disk layout per market, the raw page store, and first-run setup.
//!
//! ```text
//! <data>/<market>/<market>.txt        raw for-sale pages
//! <data>/<market>/<market>_sold.txt   raw sold pages
//! <data>/<market>/<market>_sale.csv   for-sale listing table
//! <data>/<market>/<market>_sold.csv   sold listing table
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::MarketConfig;
use crate::types::TransactionKind;

/// File locations for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketPaths {
    pub market: String,
    pub dir: PathBuf,
}

impl MarketPaths {
    pub fn new(data_dir: &Path, market: &str) -> Self {
        Self {
            market: market.to_string(),
            dir: data_dir.join(market),
        }
    }

    pub fn raw(&self, kind: TransactionKind) -> PathBuf {
        match kind {
            TransactionKind::Sale => self.dir.join(format!("{}.txt", self.market)),
            TransactionKind::Sold => self.dir.join(format!("{}_sold.txt", self.market)),
        }
    }

    pub fn table(&self, kind: TransactionKind) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", self.market, kind.label()))
    }

    fn all_files(&self) -> Vec<PathBuf> {
        TransactionKind::ALL
            .iter()
            .flat_map(|&k| [self.raw(k), self.table(k)])
            .collect()
    }
}

/// Byte sink for fetched documents.
pub struct RawStore {
    paths: MarketPaths,
}

impl RawStore {
    pub fn new(paths: MarketPaths) -> Self {
        Self { paths }
    }

    /// Page 1 replaces the file, later pages append to it.
    pub fn write_page(&self, kind: TransactionKind, page: u32, body: &str) -> Result<()> {
        let path = self.paths.raw(kind);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(page > 1)
            .truncate(page <= 1)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, kind: TransactionKind) -> Result<String> {
        let path = self.paths.raw(kind);
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

/// What [`ensure_layout`] had to create.
#[derive(Debug, Default)]
pub struct LayoutCheck {
    pub created: Vec<PathBuf>,
    /// The config file was missing and a placeholder was written.
    pub config_created: bool,
}

/// Make sure the config file, market folder and placeholder files exist.
pub fn ensure_layout(config_path: &Path, data_dir: &Path, market: &str) -> Result<LayoutCheck> {
    let mut check = LayoutCheck::default();

    if !config_path.exists() {
        let text = serde_json::to_string_pretty(&MarketConfig::template(market))?;
        fs::write(config_path, text)
            .with_context(|| format!("failed to create {}", config_path.display()))?;
        warn!(path = %config_path.display(), "config file was missing, wrote an empty template");
        check.config_created = true;
    }

    let paths = MarketPaths::new(data_dir, market);
    if !paths.dir.is_dir() {
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("failed to create {}", paths.dir.display()))?;
        check.created.push(paths.dir.clone());
    }

    for file in paths.all_files() {
        if !file.exists() {
            fs::File::create(&file).with_context(|| format!("failed to create {}", file.display()))?;
            check.created.push(file);
        }
    }

    info!(market, created = check.created.len(), "layout check complete");
    Ok(check)
}
