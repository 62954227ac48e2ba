use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use pricegrid::builder::{build_records, ExtractionSchema};
use pricegrid::config::{MarketConfig, RunConfig, DEFAULT_PAGES};
use pricegrid::extract::{extract_spans, ExtractMode};
use pricegrid::fetch::HttpFetcher;
use pricegrid::grid::{BoundsSource, DEFAULT_STEP};
use pricegrid::pipeline::{all_panels, render_market, resolve_bounds, run_market};
use pricegrid::render::{CsvGridRenderer, GridRenderer, TerminalHeatmap};
use pricegrid::table::DedupKey;
use pricegrid::types::{Metric, TransactionKind};
use pricegrid::workspace::ensure_layout;
use pricegrid::PipelineError;

#[derive(Parser)]
#[command(name = "pg", about = "pricegrid -- listing scraper and price heatmaps")]
struct Cli {
    /// Market config file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Folder holding one sub-folder per market
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config template and market folder if missing
    Init {
        /// Market name, e.g. "Denver"
        market: String,
    },

    /// Fetch, extract and merge listings, then render grids
    Run {
        /// Markets to run
        #[arg(required = true)]
        markets: Vec<String>,

        /// Pages per transaction kind
        #[arg(long, default_value_t = DEFAULT_PAGES)]
        pages: u32,

        /// Dedup key: exact, rounded or rounded:N
        #[arg(long, default_value = "exact")]
        dedup: DedupKey,

        /// Skip listings with empty values instead of failing
        #[arg(long)]
        permissive: bool,

        /// Extraction schema JSON (default: built-in provider layout)
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Sample document the schema must match before fetching
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Grid extent: query or observed
        #[arg(long, default_value = "observed")]
        bounds: BoundsSource,

        /// Grid step in degrees
        #[arg(long, default_value_t = DEFAULT_STEP)]
        step: f64,

        /// Write grids as CSV into this folder instead of the terminal
        #[arg(long)]
        out: Option<PathBuf>,

        /// Skip grid rendering
        #[arg(long)]
        no_render: bool,
    },

    /// Extract listings from a stored page file
    Extract {
        /// Raw page file
        file: PathBuf,

        /// Print raw listing chunks instead of records
        #[arg(long)]
        chunks: bool,

        /// Chunk start anchor
        #[arg(long, default_value = "latLong")]
        start: String,

        /// Chunk end marker
        #[arg(long, default_value = "homeType")]
        end: String,

        #[arg(long)]
        permissive: bool,

        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Bin a stored table into a grid
    Grid {
        market: String,

        /// Transaction kind: sale or sold
        #[arg(long, default_value = "sale")]
        kind: TransactionKind,

        /// Metric: price or price_per_area
        #[arg(long, default_value = "price")]
        metric: Metric,

        /// Render all four panels
        #[arg(long)]
        all: bool,

        #[arg(long, default_value_t = DEFAULT_STEP)]
        step: f64,

        #[arg(long, default_value = "observed")]
        bounds: BoundsSource,

        /// Write CSV into this folder instead of the terminal
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Check an extraction schema, optionally against a sample document
    Validate {
        #[arg(long)]
        sample: Option<PathBuf>,

        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// List markets with both search URLs configured
    Markets,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { market } => cmd_init(&cli.config, &cli.data_dir, &market),
        Commands::Run {
            markets,
            pages,
            dedup,
            permissive,
            schema,
            sample,
            bounds,
            step,
            out,
            no_render,
        } => {
            let cfg = RunConfig {
                data_dir: cli.data_dir,
                pages,
                dedup,
                schema: load_schema(schema.as_deref(), permissive)?,
                step,
                bounds,
            };
            cmd_run(&cli.config, &markets, &cfg, sample.as_deref(), out, no_render)
        }
        Commands::Extract {
            file,
            chunks,
            start,
            end,
            permissive,
            schema,
        } => cmd_extract(&file, chunks, &start, &end, schema.as_deref(), permissive),
        Commands::Grid {
            market,
            kind,
            metric,
            all,
            step,
            bounds,
            out,
        } => {
            let cfg = RunConfig {
                data_dir: cli.data_dir,
                step,
                bounds,
                ..RunConfig::default()
            };
            let panels = if all { all_panels() } else { vec![(kind, metric)] };
            cmd_grid(&cli.config, &market, &cfg, &panels, out)
        }
        Commands::Validate { sample, schema } => cmd_validate(schema.as_deref(), sample.as_deref()),
        Commands::Markets => cmd_markets(&cli.config),
    }
}

fn load_schema(path: Option<&Path>, permissive: bool) -> Result<ExtractionSchema> {
    let schema = match path {
        Some(p) => ExtractionSchema::from_json_file(p)?,
        None => ExtractionSchema::default(),
    };
    Ok(if permissive {
        schema.with_mode(ExtractMode::Permissive)
    } else {
        schema
    })
}

fn renderer_for(out: Option<PathBuf>) -> Result<Box<dyn GridRenderer>> {
    match out {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create output folder {}", dir.display()))?;
            Ok(Box::new(CsvGridRenderer::new(&dir)))
        }
        None => Ok(Box::new(TerminalHeatmap)),
    }
}

fn cmd_init(config: &Path, data_dir: &Path, market: &str) -> Result<()> {
    let check = ensure_layout(config, data_dir, market)?;

    println!();
    if check.config_created {
        println!("Wrote config template to {}", config.display());
        println!("  Fill in the forSale_urls and sold_urls entries for '{}'.", market);
    }
    if check.created.is_empty() {
        println!("Layout for '{}' already complete.", market);
    } else {
        println!("Created:");
        for path in &check.created {
            println!("  {}", path.display());
        }
    }
    println!();
    Ok(())
}

fn cmd_run(
    config: &Path,
    markets: &[String],
    cfg: &RunConfig,
    sample: Option<&Path>,
    out: Option<PathBuf>,
    no_render: bool,
) -> Result<()> {
    if let Some(sample) = sample {
        let text = std::fs::read_to_string(sample)
            .with_context(|| format!("failed to read sample {}", sample.display()))?;
        let n = cfg
            .schema
            .validate(Some(&text))
            .context("extraction schema does not match the sample document")?;
        println!("Schema matched {} listings in {}", n, sample.display());
    } else {
        cfg.schema.validate(None).context("invalid extraction schema")?;
    }

    let fetcher = HttpFetcher::default();
    let mut renderer = renderer_for(out)?;
    let mut failed = 0;

    for market in markets {
        ensure_layout(config, &cfg.data_dir, market)?;
        let market_config = MarketConfig::load(config)?;

        let urls = match market_config.urls(market) {
            Ok(urls) => urls,
            Err(e @ PipelineError::ConfigKey { .. }) => {
                warn!(market = %market, error = %e, "skipping market");
                failed += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let report = run_market(market, &urls, &fetcher, cfg)?;
        report.print();

        if !no_render {
            let policy = resolve_bounds(cfg.bounds, Some(&urls))?;
            render_market(market, cfg, &policy, &all_panels(), renderer.as_mut())?;
        }
    }

    if failed == markets.len() {
        bail!("no requested market has both search URLs configured in {}", config.display());
    }
    Ok(())
}

fn cmd_extract(
    file: &Path,
    chunks: bool,
    start: &str,
    end: &str,
    schema: Option<&Path>,
    permissive: bool,
) -> Result<()> {
    let blob = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    if chunks {
        let spans = extract_spans(&blob, start, end);
        for (i, span) in spans.iter().enumerate() {
            println!("[{}] {}", i, span);
        }
        println!();
        println!("{} chunks between '{}' and '{}'", spans.len(), start, end);
        return Ok(());
    }

    let schema = load_schema(schema, permissive)?;
    let (records, skipped) = build_records(&blob, &schema, chrono::Utc::now())
        .with_context(|| format!("failed to extract listings from {}", file.display()))?;

    println!();
    println!(
        "  {:>10} {:>11} {:>10} {:>8} {:>10}",
        "lat", "lon", "price", "area", "price/area"
    );
    for r in &records {
        let ppa = r
            .price_per_area
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>10.5} {:>11.5} {:>10} {:>8.0} {:>10}",
            r.latitude, r.longitude, r.price, r.area, ppa
        );
    }
    println!();
    println!("Extracted {} listings ({} skipped)", records.len(), skipped.len());
    if !skipped.is_empty() {
        println!("  Skipped indices: {:?}", skipped);
    }
    println!();
    Ok(())
}

fn cmd_grid(
    config: &Path,
    market: &str,
    cfg: &RunConfig,
    panels: &[(TransactionKind, Metric)],
    out: Option<PathBuf>,
) -> Result<()> {
    let urls = match cfg.bounds {
        BoundsSource::Query => Some(MarketConfig::load(config)?.urls(market)?),
        BoundsSource::Observed => None,
    };
    let policy = resolve_bounds(cfg.bounds, urls.as_ref())?;

    let mut renderer = renderer_for(out)?;
    let rendered = render_market(market, cfg, &policy, panels, renderer.as_mut())?;
    if rendered == 0 {
        bail!("no listings stored for '{}' yet; run `pg run {}` first", market, market);
    }
    Ok(())
}

fn cmd_validate(schema: Option<&Path>, sample: Option<&Path>) -> Result<()> {
    let schema = load_schema(schema, false)?;
    let text = match sample {
        Some(p) => Some(
            std::fs::read_to_string(p).with_context(|| format!("failed to read sample {}", p.display()))?,
        ),
        None => None,
    };

    let n = schema.validate(text.as_deref())?;

    println!();
    println!("Schema OK ({:?} mode)", schema.mode);
    for rule in schema.rules() {
        println!(
            "  {:<10} anchor={:<18} marker={:<12} offset={}",
            rule.name, rule.anchor, rule.marker, rule.offset
        );
    }
    if text.is_some() {
        println!("  Sample listings matched: {}", n);
    }
    println!();
    Ok(())
}

fn cmd_markets(config: &Path) -> Result<()> {
    let cfg = MarketConfig::load(config)?;
    let markets = cfg.markets();

    println!();
    if markets.is_empty() {
        println!("No markets configured in {}", config.display());
    } else {
        println!("Configured markets:");
        println!();
        for market in markets {
            println!("  {}", market);
        }
    }
    println!();
    Ok(())
}
