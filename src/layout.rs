use crate::config::{Scenario, TileId};
use std::path::{Path, PathBuf};

pub const MERGED_DIR: &str = "all_merged";
pub const RETRY_DIR: &str = "retry";
pub const RETRY_MANIFEST: &str = "retry_manifest.json";
pub const MERGE_MANIFEST: &str = "merge_manifest.json";
pub const LOCK_FILE: &str = ".lock";
pub const SLURM_RUNNER: &str = "slurm_runner.sh";
pub const RUN_MASK_STEM: &str = "run-mask";
pub const RUN_STATUS_STEM: &str = "run_status";

/// `{root}/{tile}_sc/...`
#[derive(Debug, Clone)]
pub struct TileLayout {
    root: PathBuf,
    tile: TileId,
    ext: &'static str,
}

impl TileLayout {
    pub fn new(root: &Path, tile: &TileId, ext: &'static str) -> Self {
        Self {
            root: root.to_path_buf(),
            tile: tile.clone(),
            ext,
        }
    }

    pub fn tile(&self) -> &TileId {
        &self.tile
    }

    pub fn tile_dir(&self) -> PathBuf {
        self.root.join(format!("{}_sc", self.tile))
    }

    pub fn scenario_dir(&self, scenario: &Scenario) -> PathBuf {
        self.tile_dir().join(scenario.as_str())
    }

    pub fn tile_mask(&self, scenario: &Scenario) -> PathBuf {
        self.scenario_dir(scenario).join(format!("{}.{}", RUN_MASK_STEM, self.ext))
    }

    pub fn split(&self, scenario: &Scenario) -> SplitLayout {
        SplitLayout::new(&self.tile_dir().join(format!("{}_split", scenario)), self.ext)
    }
}

/// Paths inside one `{scenario}_split` directory.
#[derive(Debug, Clone)]
pub struct SplitLayout {
    dir: PathBuf,
    ext: &'static str,
}

impl SplitLayout {
    pub fn new(dir: &Path, ext: &'static str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            ext,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ext(&self) -> &'static str {
        self.ext
    }

    pub fn grid_file(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.ext)
    }

    /// Scenario name taken from the `{scenario}_split` directory name.
    pub fn scenario_name(&self) -> Option<String> {
        let name = self.dir.file_name()?.to_str()?;
        name.strip_suffix("_split").map(|s| s.to_string())
    }

    /// Tile-level run mask in the sibling `{scenario}` directory, if it can be named.
    pub fn tile_mask(&self) -> Option<PathBuf> {
        let scenario = self.scenario_name()?;
        let parent = self.dir.parent()?;
        Some(parent.join(scenario).join(self.grid_file(RUN_MASK_STEM)))
    }

    pub fn batch_dir(&self, n: usize) -> PathBuf {
        self.dir.join(format!("batch_{}", n))
    }

    pub fn batch_mask(&self, n: usize) -> PathBuf {
        self.batch_dir(n).join("input").join(self.grid_file(RUN_MASK_STEM))
    }

    pub fn batch_output(&self, n: usize) -> PathBuf {
        self.batch_dir(n).join("output")
    }

    pub fn batch_status(&self, n: usize) -> PathBuf {
        self.batch_output(n).join(self.grid_file(RUN_STATUS_STEM))
    }

    pub fn batch_fail_log(&self, n: usize) -> PathBuf {
        self.batch_output(n).join(crate::fail_log::FAIL_LOG_FILE)
    }

    pub fn slurm_runner(&self, n: usize) -> PathBuf {
        self.batch_dir(n).join(SLURM_RUNNER)
    }

    pub fn config_js(&self, n: usize) -> PathBuf {
        self.batch_dir(n).join("config").join("config.js")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.dir.join(MERGED_DIR)
    }

    pub fn merged_staging_dir(&self) -> PathBuf {
        self.dir.join(format!("{}.partial-{}", MERGED_DIR, std::process::id()))
    }

    pub fn merge_manifest(&self) -> PathBuf {
        self.merged_dir().join(MERGE_MANIFEST)
    }

    pub fn retry_root(&self) -> PathBuf {
        self.dir.join(RETRY_DIR)
    }

    pub fn retry_manifest(&self) -> PathBuf {
        self.retry_root().join(RETRY_MANIFEST)
    }

    pub fn retry_dir(&self, name: &str) -> PathBuf {
        self.retry_root().join(name)
    }

    pub fn retry_lock(&self) -> PathBuf {
        self.retry_root().join(LOCK_FILE)
    }
}

/// Object-store key of a scenario split, relative to the bucket location.
pub fn remote_split_key(tile: &TileId, scenario: &Scenario) -> String {
    format!("{}/{}_split", tile, scenario)
}

pub fn remote_scenario_key(tile: &TileId, scenario: &Scenario) -> String {
    format!("{}/{}", tile, scenario)
}
