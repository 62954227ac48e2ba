//! One market run: fetch, build, merge, and grid rendering.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::builder::{build_records, ExtractionSchema};
use crate::config::{RunConfig, UrlPair};
use crate::error::PipelineError;
use crate::fetch::{fetch_pages, Fetcher};
use crate::grid::{bin, Bounds, BoundsPolicy, BoundsSource, SpatialGrid};
use crate::render::GridRenderer;
use crate::table::{merge_into_file, ListingTable, MergeSummary};
use crate::types::{ListingRecord, Metric, TransactionKind};
use crate::workspace::{MarketPaths, RawStore};

/// Result of one transaction kind within a run.
#[derive(Debug, Clone)]
pub struct KindOutcome {
    pub kind: TransactionKind,
    pub pages: usize,
    pub records: usize,
    pub skipped: usize,
    pub summary: MergeSummary,
}

/// Summary of a market run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub market: String,
    pub observed_at: DateTime<Utc>,
    pub kinds: Vec<KindOutcome>,
}

impl RunReport {
    /// Print a formatted text report to stdout.
    pub fn print(&self) {
        println!();
        println!("{}", "=".repeat(55));
        println!("  Market: {}    ({})", self.market, self.observed_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("{}", "=".repeat(55));
        for k in &self.kinds {
            println!();
            println!("  --- {} {}", k.kind.title(), "-".repeat(45 - k.kind.title().len()));
            println!("  Pages fetched:   {}", k.pages);
            println!("  Listings built:  {}", k.records);
            println!("  Skipped:         {}", k.skipped);
            println!(
                "  Table rows:      {} -> {}  (+{} incoming)",
                k.summary.previous, k.summary.merged, k.summary.incoming
            );
        }
        println!();
        println!("{}", "=".repeat(55));
        println!();
    }
}

/// Build each page independently and concatenate the records.
///
/// Keeping pages separate means a page whose passes disagree fails on its
/// own instead of shifting indices in every later page. Any failure
/// rejects the whole batch.
pub fn build_pages(
    pages: &[String],
    schema: &ExtractionSchema,
    observed_at: DateTime<Utc>,
) -> Result<(Vec<ListingRecord>, usize)> {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (i, page) in pages.iter().enumerate() {
        let (built, dropped) = build_records(page, schema, observed_at)
            .with_context(|| format!("failed to build page {}", i + 1))?;
        if !dropped.is_empty() {
            info!(page = i + 1, indices = ?dropped, "skipped listings without usable values");
        }
        skipped += dropped.len();
        records.extend(built);
    }

    Ok((records, skipped))
}

/// Fetch, build and merge both transaction kinds for `market`.
///
/// Both kinds are fetched and built before anything is merged, so an
/// extraction failure leaves both tables untouched.
pub fn run_market(market: &str, urls: &UrlPair, fetcher: &dyn Fetcher, cfg: &RunConfig) -> Result<RunReport> {
    let paths = MarketPaths::new(&cfg.data_dir, market);
    let raw = RawStore::new(paths.clone());
    let observed_at = Utc::now();

    let mut batches = Vec::with_capacity(TransactionKind::ALL.len());
    for kind in TransactionKind::ALL {
        info!(market, kind = %kind, pages = cfg.pages, "fetching");
        let pages = fetch_pages(fetcher, urls.get(kind), cfg.pages, |page, body| {
            raw.write_page(kind, page, body)
        })
        .with_context(|| format!("{} {}: fetch failed", market, kind))?;

        let (records, skipped) = build_pages(&pages, &cfg.schema, observed_at)
            .with_context(|| format!("{} {}: extraction failed", market, kind))?;
        info!(market, kind = %kind, records = records.len(), skipped, "built listings");
        batches.push((kind, pages.len(), records, skipped));
    }

    let mut kinds = Vec::with_capacity(batches.len());
    for (kind, pages, records, skipped) in batches {
        let built = records.len();
        let (_, summary) = merge_into_file(&paths.table(kind), records, cfg.dedup)
            .with_context(|| format!("{} {}: merge failed", market, kind))?;
        kinds.push(KindOutcome {
            kind,
            pages,
            records: built,
            skipped,
            summary,
        });
    }

    Ok(RunReport {
        market: market.to_string(),
        observed_at,
        kinds,
    })
}

/// Turn a bounds selector into a concrete policy.
///
/// Query bounds come from the market's for-sale search URL and are used
/// for both kinds.
pub fn resolve_bounds(source: BoundsSource, urls: Option<&UrlPair>) -> Result<BoundsPolicy> {
    match source {
        BoundsSource::Observed => Ok(BoundsPolicy::Observed),
        BoundsSource::Query => {
            let urls = urls.context("query bounds need the market's configured search URLs")?;
            let bounds = Bounds::from_query_url(&urls.sale).context("failed to read bounds from search URL")?;
            Ok(BoundsPolicy::Query(bounds))
        }
    }
}

/// Load a persisted table and bin one metric.
pub fn build_grid(
    paths: &MarketPaths,
    kind: TransactionKind,
    metric: Metric,
    step: f64,
    policy: &BoundsPolicy,
) -> Result<SpatialGrid, PipelineError> {
    let table = ListingTable::load(&paths.table(kind))?;
    bin(&table, metric, step, policy)
}

/// Panels shown for a market: prices first, then price per area.
pub fn all_panels() -> Vec<(TransactionKind, Metric)> {
    Metric::ALL
        .iter()
        .flat_map(|&m| TransactionKind::ALL.iter().map(move |&k| (k, m)))
        .collect()
}

/// Bin and render each panel. Kinds with no rows yet are skipped.
///
/// Returns the number of panels rendered.
pub fn render_market(
    market: &str,
    cfg: &RunConfig,
    policy: &BoundsPolicy,
    panels: &[(TransactionKind, Metric)],
    renderer: &mut dyn GridRenderer,
) -> Result<usize> {
    let paths = MarketPaths::new(&cfg.data_dir, market);
    let mut rendered = 0;

    for &(kind, metric) in panels {
        let title = format!("{} - {} {}", market, kind.title(), metric.title());
        match build_grid(&paths, kind, metric, cfg.step, policy) {
            Ok(grid) => {
                renderer
                    .render(&title, &grid)
                    .with_context(|| format!("failed to render {}", title))?;
                rendered += 1;
            }
            Err(PipelineError::EmptyTable) => {
                warn!(market, kind = %kind, "table has no rows yet, skipping panel");
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bin {}", title)),
        }
    }

    Ok(rendered)
}
