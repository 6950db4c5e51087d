//! Batch discovery and the consistency checks that gate a merge.

use crate::error::CountDeviation;
use crate::fail_log::FAIL_LOG_FILE;
use crate::grid::GridCodec;
use crate::layout::SplitLayout;
use crate::mask::{MaskWindow, PixelCoord, RunMask};
use crate::TileError;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub index: usize,
    pub dir: PathBuf,
    pub output_files: BTreeSet<String>,
}

impl BatchEntry {
    pub fn file_count(&self) -> usize {
        self.output_files.len()
    }
}

/// `batch_12` -> 12. Anything else is not a batch directory.
pub fn parse_batch_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("batch_")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn list_output_files(output_dir: &Path) -> Result<BTreeSet<String>, TileError> {
    let mut files = BTreeSet::new();
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(TileError::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == FAIL_LOG_FILE {
            continue;
        }
        files.insert(name);
    }
    Ok(files)
}

/// Lists `batch_{n}` directories in numeric order. An empty or absent split
/// directory is `NoBatchFoldersFound`.
pub fn scan_batches(split_dir: &Path) -> Result<Vec<BatchEntry>, TileError> {
    let no_batches = || TileError::NoBatchFoldersFound {
        path: split_dir.to_path_buf(),
    };
    let entries = match fs::read_dir(split_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(no_batches()),
        Err(e) => return Err(TileError::Io(e)),
    };

    let mut indexed = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(index) = parse_batch_index(&entry.file_name().to_string_lossy()) {
            indexed.push((index, entry.path()));
        }
    }
    if indexed.is_empty() {
        return Err(no_batches());
    }
    indexed.sort_by_key(|(index, _)| *index);

    indexed
        .into_iter()
        .map(|(index, dir)| {
            let output_files = list_output_files(&dir.join("output"))?;
            Ok(BatchEntry {
                index,
                dir,
                output_files,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Inventory {
    pub split_dir: PathBuf,
    pub batches: Vec<BatchEntry>,
}

impl Inventory {
    /// Scans without checking file counts.
    pub fn scan(split_dir: &Path) -> Result<Self, TileError> {
        let batches = scan_batches(split_dir)?;
        info!(path = %split_dir.display(), batches = batches.len(), "scanned batch directories");
        Ok(Self {
            split_dir: split_dir.to_path_buf(),
            batches,
        })
    }

    /// Scans and requires every batch to hold the same number of output files.
    pub fn scan_validated(split_dir: &Path) -> Result<Self, TileError> {
        let inventory = Self::scan(split_dir)?;
        inventory.validate_counts()?;
        Ok(inventory)
    }

    /// Most common file count; ties go to the smaller count.
    pub fn reference_count(&self) -> usize {
        let mut tally: BTreeMap<usize, usize> = BTreeMap::new();
        for batch in &self.batches {
            *tally.entry(batch.file_count()).or_default() += 1;
        }
        tally
            .iter()
            .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then(cb.cmp(ca)))
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    pub fn validate_counts(&self) -> Result<(), TileError> {
        let reference = self.reference_count();
        let deviations: Vec<CountDeviation> = self
            .batches
            .iter()
            .filter(|b| b.file_count() != reference)
            .map(|b| CountDeviation {
                batch: b.index,
                count: b.file_count(),
                delta: b.file_count() as i64 - reference as i64,
            })
            .collect();
        if deviations.is_empty() {
            Ok(())
        } else {
            Err(TileError::BatchCountMismatch {
                path: self.split_dir.clone(),
                reference,
                deviations,
            })
        }
    }

    pub fn indices(&self) -> Vec<usize> {
        self.batches.iter().map(|b| b.index).collect()
    }

    /// The batch with the fewest output files defines the file set every
    /// other batch is trimmed down to.
    pub fn trim_plan(&self) -> TrimPlan {
        let Some(reference) = self.batches.iter().min_by_key(|b| (b.file_count(), b.index)) else {
            return TrimPlan::default();
        };
        let mut removals = Vec::new();
        for batch in &self.batches {
            for name in batch.output_files.difference(&reference.output_files) {
                removals.push(TrimRemoval {
                    batch: batch.index,
                    path: batch.dir.join("output").join(name),
                });
            }
        }
        TrimPlan {
            reference_batch: Some(reference.index),
            reference_files: reference.output_files.len(),
            removals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimRemoval {
    pub batch: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimPlan {
    pub reference_batch: Option<usize>,
    pub reference_files: usize,
    pub removals: Vec<TrimRemoval>,
}

impl TrimPlan {
    /// Deletes the listed files unless `dry_run`. Returns how many were (or would be) removed.
    pub fn apply(&self, dry_run: bool) -> Result<usize, TileError> {
        for removal in &self.removals {
            if dry_run {
                println!("[trim] would remove {}", removal.path.display());
            } else {
                fs::remove_file(&removal.path)?;
                debug!(batch = removal.batch, path = %removal.path.display(), "removed extra output file");
            }
        }
        Ok(self.removals.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWindow {
    pub index: usize,
    pub window: MaskWindow,
}

pub fn load_windows(
    inventory: &Inventory,
    layout: &SplitLayout,
    codec: &dyn GridCodec,
) -> Result<Vec<BatchWindow>, TileError> {
    inventory
        .batches
        .iter()
        .map(|b| {
            Ok(BatchWindow {
                index: b.index,
                window: MaskWindow::read(codec, &layout.batch_mask(b.index))?,
            })
        })
        .collect()
}

/// Injective map from tile pixel to the batch that simulates it.
#[derive(Debug, Clone)]
pub struct PixelMap {
    rows: usize,
    cols: usize,
    owners: FxHashMap<PixelCoord, usize>,
    enabled: RunMask,
}

impl PixelMap {
    /// Validates that batch windows cover the enabled tile pixels exactly once.
    /// Without a tile mask the grid is the union of the batch windows.
    pub fn build(windows: &[BatchWindow], tile_mask: Option<&RunMask>, path: &Path) -> Result<Self, TileError> {
        let (rows, cols) = match tile_mask {
            Some(mask) => (mask.rows(), mask.cols()),
            None => windows.iter().fold((0, 0), |(r, c), w| {
                (
                    r.max(w.window.row_offset + w.window.mask.rows()),
                    c.max(w.window.col_offset + w.window.mask.cols()),
                )
            }),
        };

        let mut owners = FxHashMap::default();
        let mut enabled = RunMask::new(rows, cols);
        for bw in windows {
            for local in bw.window.mask.enabled() {
                let pixel = bw.window.to_tile(local);
                if pixel.row >= rows || pixel.col >= cols {
                    return Err(TileError::WindowOutOfBounds {
                        batch: bw.index,
                        pixel,
                        rows,
                        cols,
                    });
                }
                if let Some(first) = owners.insert(pixel, bw.index) {
                    return Err(TileError::DuplicatePixelMapping {
                        pixel,
                        first_batch: first,
                        second_batch: bw.index,
                    });
                }
                enabled.set(pixel, true);
            }
        }

        if let Some(mask) = tile_mask {
            let stray = enabled.enabled().any(|p| !mask.is_enabled(p));
            if stray || owners.len() != mask.enabled_count() {
                return Err(TileError::PixelCountMismatch {
                    path: path.to_path_buf(),
                    batch_pixels: owners.len(),
                    enabled_pixels: mask.enabled_count(),
                });
            }
        }

        Ok(Self {
            rows,
            cols,
            owners,
            enabled,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn owner(&self, pixel: PixelCoord) -> Option<usize> {
        self.owners.get(&pixel).copied()
    }

    pub fn enabled(&self) -> &RunMask {
        &self.enabled
    }

    pub fn enabled_count(&self) -> usize {
        self.owners.len()
    }
}
