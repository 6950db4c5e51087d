#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use tilemerge::config::{Scenario, TileConfig, TileId};
use tilemerge::grid::{BinCodec, Dataset, GridCodec, GridVar};
use tilemerge::layout::{SplitLayout, TileLayout, SLURM_RUNNER};
use tilemerge::mask::{MaskWindow, PixelCoord, RunMask, RunStatus, STATUS_COMPLETE, STATUS_FAILED};
use tilemerge::TileError;

pub const MONTHS: usize = 24;

pub const RUNNER: &str = "#!/bin/bash -l
#SBATCH --job-name=\"H10_V15-batch-0\"
#SBATCH -p spot
#SBATCH --time=24:00:00
#SBATCH -o /old/logs/batch-0

module load openmpi

mpirun dvmdostem -f /old/batch_0/config/config.js --restart-run
";

/// A `{tile}_sc` tree in a temp dir, built one batch at a time.
pub struct TileFixture {
    pub dir: Rc<TempDir>,
    pub tile: TileId,
    pub scenario: Scenario,
    pub rows: usize,
    pub cols: usize,
}

/// Value a pixel reports for a month; distinct per pixel and month.
pub fn value_at(p: PixelCoord, month: usize) -> f64 {
    (p.row * 1000 + p.col * 10) as f64 + month as f64 * 0.5
}

impl TileFixture {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::with_scenario(rows, cols, "ssp2_4_5_mri_esm2_0")
    }

    pub fn with_scenario(rows: usize, cols: usize, scenario: &str) -> Self {
        Self {
            dir: Rc::new(tempfile::tempdir().unwrap()),
            tile: "H10_V15".parse().unwrap(),
            scenario: scenario.parse().unwrap(),
            rows,
            cols,
        }
    }

    /// Another tile of the same scenario and grid under the same root.
    pub fn neighbour(&self, tile: &str) -> Self {
        Self {
            dir: Rc::clone(&self.dir),
            tile: tile.parse().unwrap(),
            scenario: self.scenario.clone(),
            rows: self.rows,
            cols: self.cols,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn codec(&self) -> BinCodec {
        BinCodec
    }

    pub fn config(&self) -> TileConfig {
        let mut config = TileConfig::custom(self.root().to_path_buf());
        config.scenarios = vec![self.scenario.clone()];
        config.base_scenario = self.scenario.clone();
        config
    }

    pub fn tile_layout(&self) -> TileLayout {
        TileLayout::new(self.root(), &self.tile, BinCodec.extension())
    }

    pub fn split(&self) -> SplitLayout {
        self.tile_layout().split(&self.scenario)
    }

    pub fn split_dir(&self) -> PathBuf {
        self.split().dir().to_path_buf()
    }

    pub fn write_tile_mask(&self, mask: &RunMask) {
        let path = self.tile_layout().tile_mask(&self.scenario);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        BinCodec.write(&path, &Dataset::new().with_var(mask.to_var())).unwrap();
    }

    /// Tile mask with every pixel enabled.
    pub fn full_mask(&self) -> RunMask {
        let pixels = (0..self.rows).flat_map(|r| (0..self.cols).map(move |c| PixelCoord::new(r, c)));
        RunMask::from_pixels(self.rows, self.cols, pixels)
    }

    /// Writes `batch_{n}/input/run-mask` for the rows `[first_row, first_row + rows)`,
    /// enabling the pixels of `tile_mask` in that band.
    pub fn add_band_batch(&self, n: usize, first_row: usize, rows: usize, tile_mask: &RunMask) -> MaskWindow {
        let mut mask = RunMask::new(rows, self.cols);
        for r in 0..rows {
            for c in 0..self.cols {
                if tile_mask.is_enabled(PixelCoord::new(first_row + r, c)) {
                    mask.set(PixelCoord::new(r, c), true);
                }
            }
        }
        let window = MaskWindow {
            row_offset: first_row,
            col_offset: 0,
            mask,
        };
        self.write_window(n, &window);
        window
    }

    pub fn write_window(&self, n: usize, window: &MaskWindow) {
        let split = self.split();
        fs::create_dir_all(split.batch_output(n)).unwrap();
        fs::create_dir_all(split.batch_mask(n).parent().unwrap()).unwrap();
        BinCodec.write(&split.batch_mask(n), &window.to_dataset()).unwrap();
    }

    /// Monthly `(time, y, x)` shard with [`value_at`] for every window cell.
    pub fn write_monthly_shard(&self, n: usize, var: &str, window: &MaskWindow) {
        let (rows, cols) = (window.mask.rows(), window.mask.cols());
        let mut data = Vec::with_capacity(MONTHS * rows * cols);
        for t in 0..MONTHS {
            for r in 0..rows {
                for c in 0..cols {
                    data.push(value_at(window.to_tile(PixelCoord::new(r, c)), t));
                }
            }
        }
        let grid = GridVar::new(var, &["time", "y", "x"], &[MONTHS, rows, cols], data).unwrap();
        let path = self.split().batch_output(n).join(format!("{}_monthly_tr.grid", var));
        BinCodec.write(&path, &Dataset::new().with_var(grid)).unwrap();
    }

    /// Shard `{stem}.grid` with lead dims `lead` of extents `shape`, every value `value`.
    pub fn write_constant_shard(&self, n: usize, stem: &str, lead: &[(&str, usize)], value: f64, window: &MaskWindow) {
        let mut dims: Vec<&str> = lead.iter().map(|(d, _)| *d).collect();
        let mut shape: Vec<usize> = lead.iter().map(|(_, len)| *len).collect();
        dims.extend(["y", "x"]);
        shape.extend([window.mask.rows(), window.mask.cols()]);
        let var_name = stem.split('_').next().unwrap();
        let data = vec![value; shape.iter().product()];
        let grid = GridVar::new(var_name, &dims, &shape, data).unwrap();
        let path = self.split().batch_output(n).join(format!("{}.grid", stem));
        BinCodec.write(&path, &Dataset::new().with_var(grid)).unwrap();
    }

    /// Run status with `complete` window pixels at 100 and the rest failed.
    pub fn write_status(&self, n: usize, window: &MaskWindow, complete: impl Fn(PixelCoord) -> bool) {
        let mut status = RunStatus::uniform(window.mask.rows(), window.mask.cols(), 0.0);
        for local in window.mask.enabled() {
            let code = if complete(window.to_tile(local)) { STATUS_COMPLETE } else { STATUS_FAILED };
            status.set(local, code);
        }
        status.write(&BinCodec, &self.split().batch_status(n)).unwrap();
    }

    /// Runner script, config and restart file so the batch can be retried.
    pub fn write_job_files(&self, n: usize) {
        let split = self.split();
        let batch = split.batch_dir(n);
        fs::write(batch.join(SLURM_RUNNER), RUNNER.replace("batch-0", &format!("batch-{}", n))).unwrap();
        fs::create_dir_all(batch.join("config")).unwrap();
        let config = format!(
            "{{\"IO\": {{\"runmask_file\": \"{0}/input/run-mask.grid\", \"output_dir\": \"{0}/output/\", \"parameter_dir\": \"{0}/parameters/\"}}, \"model_settings\": {{\"cell_timelimit\": 3600}}}}",
            batch.display()
        );
        fs::write(batch.join("config").join("config.js"), config).unwrap();
        fs::create_dir_all(batch.join("parameters")).unwrap();
        fs::write(batch.join("parameters").join("cmt_calparbgc.txt"), "params").unwrap();
        fs::write(split.batch_output(n).join("restart-tr.grid"), b"restart").unwrap();
    }

    /// Standard layout: `bands` batches of `rows / bands` rows, every pixel
    /// enabled, one GPP shard each, statuses from `complete`.
    pub fn build_bands(&self, bands: usize, complete: impl Fn(PixelCoord) -> bool + Copy) -> Vec<MaskWindow> {
        let mask = self.full_mask();
        self.write_tile_mask(&mask);
        let band = self.rows / bands;
        (0..bands)
            .map(|n| {
                let window = self.add_band_batch(n, n * band, band, &mask);
                self.write_monthly_shard(n, "GPP", &window);
                self.write_status(n, &window, complete);
                window
            })
            .collect()
    }

    pub fn read_merged(&self, stem: &str) -> Result<GridVar, TileError> {
        let path = self.split().merged_dir().join(format!("{}.grid", stem));
        let ds = BinCodec.read(&path)?;
        ds.vars
            .into_iter()
            .next()
            .ok_or_else(|| TileError::Other(format!("{} is empty", path.display())))
    }
}

/// Cell `(row, col)` of lead index `i` in a `(lead, y, x)` variable.
pub fn cell(var: &GridVar, i: usize, p: PixelCoord) -> f64 {
    let rows = var.shape[var.shape.len() - 2];
    let cols = var.shape[var.shape.len() - 1];
    var.data[i * rows * cols + p.row * cols + p.col]
}
