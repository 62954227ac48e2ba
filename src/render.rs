//! Grid output. A renderer receives a finished grid with its labels and
//! decides how to show it; binning never depends on a renderer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::grid::SpatialGrid;

/// Consumer of binned grids.
pub trait GridRenderer {
    fn render(&mut self, title: &str, grid: &SpatialGrid) -> Result<()>;
}

/// Write a grid as a labelled CSV matrix, one row per latitude.
pub fn write_grid_csv(grid: &SpatialGrid, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create CSV at {}", path.display()))?;

    let prec = grid.decimals as usize;
    let mut header = vec!["lat\\lon".to_string()];
    header.extend(grid.lon_labels.iter().map(|l| format!("{:.*}", prec, l)));
    wtr.write_record(&header).context("failed to write grid header")?;

    for (label, values) in grid.lat_labels.iter().zip(&grid.values) {
        let mut record = vec![format!("{:.*}", prec, label)];
        record.extend(values.iter().map(|v| v.to_string()));
        wtr.write_record(&record)
            .with_context(|| format!("failed to write grid row {}", label))?;
    }

    wtr.flush().context("failed to flush grid CSV")?;
    Ok(())
}

/// Writes each rendered grid to `<dir>/<slug(title)>.csv`.
pub struct CsvGridRenderer {
    dir: PathBuf,
    pub written: Vec<PathBuf>,
}

impl CsvGridRenderer {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            written: Vec::new(),
        }
    }
}

impl GridRenderer for CsvGridRenderer {
    fn render(&mut self, title: &str, grid: &SpatialGrid) -> Result<()> {
        let path = self.dir.join(format!("{}.csv", slug(title)));
        write_grid_csv(grid, &path)?;
        self.written.push(path);
        Ok(())
    }
}

/// Shaded text heatmap on stdout, north at the top.
pub struct TerminalHeatmap;

const RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

impl TerminalHeatmap {
    /// Render into a string instead of printing.
    pub fn draw(title: &str, grid: &SpatialGrid) -> String {
        let mut out = String::new();
        let prec = grid.decimals as usize;

        out.push_str(&"=".repeat(55));
        out.push('\n');
        out.push_str(&format!("  {}\n", title));
        out.push_str(&"=".repeat(55));
        out.push('\n');

        let Some((lo, hi)) = grid.value_range() else {
            out.push_str("  (no data)\n");
            return out;
        };

        for (label, (values, counts)) in grid
            .lat_labels
            .iter()
            .zip(grid.values.iter().zip(&grid.counts))
            .rev()
        {
            let row: String = values
                .iter()
                .zip(counts)
                .map(|(&v, &c)| if c == 0 { ' ' } else { shade(v, lo, hi) })
                .collect();
            out.push_str(&format!("  {:>9.*} |{}|\n", prec, label, row));
        }

        let first = grid.lon_labels.first().copied().unwrap_or_default();
        let last = grid.lon_labels.last().copied().unwrap_or_default();
        out.push_str(&format!("  {:>9} lon {:.*} .. {:.*}\n", "", prec, first, prec, last));
        out.push_str(&format!(
            "  scale: '{}' {:.0} .. '{}' {:.0}    cells: {}  clipped: {}  excluded: {}\n",
            RAMP[1],
            lo,
            RAMP[RAMP.len() - 1],
            hi,
            grid.occupied_cells(),
            grid.clipped,
            grid.excluded
        ));
        out
    }
}

impl GridRenderer for TerminalHeatmap {
    fn render(&mut self, title: &str, grid: &SpatialGrid) -> Result<()> {
        println!();
        print!("{}", Self::draw(title, grid));
        Ok(())
    }
}

/// Occupied cells never use the blank shade.
fn shade(v: f64, lo: f64, hi: f64) -> char {
    let top = RAMP.len() - 1;
    if hi <= lo {
        return RAMP[top];
    }
    let t = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
    RAMP[1 + (t * (top - 1) as f64).round() as usize]
}

fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Bounds;
    use tempfile::TempDir;

    fn sample_grid() -> SpatialGrid {
        let b = Bounds::new(40.00, 40.02, -105.01, -105.00).unwrap();
        let mut grid = SpatialGrid::with_bounds(&b, 0.01).unwrap();
        grid.observe(40.005, -105.005, 100.0);
        grid.observe(40.025, -105.005, 300.0);
        grid
    }

    #[test]
    fn test_write_grid_csv_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grid.csv");
        write_grid_csv(&sample_grid(), &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "lat\\lon,-105.01,-105.00");
        assert_eq!(lines[1], "40.00,100,0");
        assert_eq!(lines[3], "40.02,300,0");
    }

    #[test]
    fn test_csv_renderer_names_files() {
        let tmp = TempDir::new().unwrap();
        let mut r = CsvGridRenderer::new(tmp.path());
        r.render("Denver - For Sale Price/Area", &sample_grid()).unwrap();
        assert_eq!(r.written, vec![tmp.path().join("denver_for_sale_price_area.csv")]);
        assert!(r.written[0].exists());
    }

    #[test]
    fn test_draw_shades_occupied_cells() {
        let out = TerminalHeatmap::draw("t", &sample_grid());
        // North first: 40.02 row holds the maximum.
        let rows: Vec<&str> = out.lines().filter(|l| l.contains('|')).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].contains("40.02") && rows[0].ends_with("|@ |"));
        assert!(rows[2].contains("40.00") && rows[2].ends_with("|. |"));
        assert!(rows[1].ends_with("|  |"));
    }

    #[test]
    fn test_draw_empty_grid() {
        let b = Bounds::new(40.0, 40.01, -105.0, -105.0).unwrap();
        let grid = SpatialGrid::with_bounds(&b, 0.01).unwrap();
        assert!(TerminalHeatmap::draw("empty", &grid).contains("(no data)"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Denver - Sold Price"), "denver_sold_price");
        assert_eq!(slug("  x  "), "x");
    }
}
