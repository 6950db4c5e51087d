//! Pixel merge engine.
//!
//! Shards are read in parallel, one task per batch and variable. Every
//! enabled pixel comes back either as a series or as a [`ShardError`]; the
//! results are then scattered into the tile canvas in batch order, so the
//! output does not depend on thread scheduling. Nothing is written until all
//! canvases are built, and the output directory is swapped in whole.

use crate::canvas::{Canvas, ShardKey, DISABLED_FILL};
use crate::fail_log::{read_fail_log, FailureLog, ShardError, ShardErrorKind, FAIL_LOG_FILE};
use crate::grid::{Dataset, GridCodec};
use crate::inventory::{load_windows, BatchWindow, Inventory, PixelMap};
use crate::layout::{SplitLayout, RUN_STATUS_STEM};
use crate::mask::{PixelCoord, RunMask, RunStatus, STATUS_FAILED, STATUS_MASKED};
use crate::output_spec::{self, OutputSpec};
use crate::synthesis::{StageToggles, Synthesizer};
use crate::TileError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub toggles: StageToggles,
    pub output_spec: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub pft_weights: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeManifest {
    pub tile_rows: usize,
    pub tile_cols: usize,
    pub enabled_pixels: usize,
    pub batches: Vec<usize>,
    pub variables: Vec<String>,
    pub stages: Vec<String>,
    pub failed_pixels: usize,
    #[serde(default)]
    pub synthesis_failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub output_dir: PathBuf,
    pub manifest: MergeManifest,
    pub failures: FailureLog,
}

#[derive(Debug, Clone, PartialEq)]
enum PixelRead {
    Series(Vec<f64>),
    Failed(ShardError),
}

#[derive(Debug)]
struct BatchRead {
    index: usize,
    lead: Option<(Vec<String>, Vec<usize>)>,
    pixels: Vec<(PixelCoord, PixelRead)>,
}

/// Engine fill values inside a series become NaN.
fn clean(value: f64) -> f64 {
    if value == DISABLED_FILL { f64::NAN } else { value }
}

fn read_batch_shard(
    codec: &dyn GridCodec,
    path: &Path,
    key: &ShardKey,
    bw: &BatchWindow,
    engine_failures: &BTreeMap<PixelCoord, String>,
) -> BatchRead {
    let window = &bw.window;
    let local_pixels: Vec<PixelCoord> = window.mask.enabled().collect();
    let fail_all = |kind: ShardErrorKind, message: String| BatchRead {
        index: bw.index,
        lead: None,
        pixels: local_pixels
            .iter()
            .map(|p| (window.to_tile(*p), PixelRead::Failed(ShardError::new(kind, message.clone()))))
            .collect(),
    };

    let dataset = match codec.read(path) {
        Ok(ds) => ds,
        Err(e) => {
            warn!(batch = bw.index, path = %path.display(), error = %e, "shard unreadable");
            return fail_all(ShardErrorKind::Unreadable, e.to_string());
        }
    };
    let Some(var) = dataset.var(&key.var) else {
        return fail_all(ShardErrorKind::WrongFormat, format!("variable {} missing from {}", key.var, path.display()));
    };
    let (rows, cols) = (window.mask.rows(), window.mask.cols());
    if var.spatial_shape() != Some((rows, cols)) {
        return fail_all(
            ShardErrorKind::WrongFormat,
            format!("{} has shape {:?}, run mask is {}x{}", key, var.shape, rows, cols),
        );
    }

    let plane = rows * cols;
    let lead_len: usize = var.lead_shape().iter().product();
    let pixels = local_pixels
        .iter()
        .map(|local| {
            let tile = window.to_tile(*local);
            if let Some(message) = engine_failures.get(local) {
                return (tile, PixelRead::Failed(ShardError::new(ShardErrorKind::EngineReported, message.clone())));
            }
            let offset = local.row * cols + local.col;
            let series: Option<Vec<f64>> = (0..lead_len)
                .map(|i| var.data.get(i * plane + offset).copied().map(clean))
                .collect();
            match series {
                Some(series) => (tile, PixelRead::Series(series)),
                None => {
                    debug!(batch = bw.index, row = tile.row, col = tile.col, "pixel slice past end of shard data");
                    (
                        tile,
                        PixelRead::Failed(ShardError::new(
                            ShardErrorKind::PartialWrite,
                            format!("{} holds {} of {} values", key, var.data.len(), var.expected_len()),
                        )),
                    )
                }
            }
        })
        .collect();

    BatchRead {
        index: bw.index,
        lead: Some((var.lead_dims().to_vec(), var.lead_shape().to_vec())),
        pixels,
    }
}

/// Shard keys of the reference batch, the first one holding the reference file count.
fn shard_keys(inventory: &Inventory, ext: &str) -> BTreeSet<ShardKey> {
    let reference = inventory.reference_count();
    inventory
        .batches
        .iter()
        .find(|b| b.file_count() == reference)
        .map(|b| {
            b.output_files
                .iter()
                .filter_map(|name| ShardKey::from_file_name(name, ext))
                .collect()
        })
        .unwrap_or_default()
}

/// Reads every batch's shard for `key` and scatters it into one canvas.
fn build_canvas(
    key: &ShardKey,
    layout: &SplitLayout,
    codec: &dyn GridCodec,
    windows: &[BatchWindow],
    engine_failures: &BTreeMap<usize, BTreeMap<PixelCoord, String>>,
    enabled: &RunMask,
    failures: &mut FailureLog,
) -> Result<Canvas, TileError> {
    let empty = BTreeMap::new();
    let file_name = layout.grid_file(&key.stem());
    let reads: Vec<BatchRead> = windows
        .par_iter()
        .map(|bw| {
            let path = layout.batch_output(bw.index).join(&file_name);
            let reported = engine_failures.get(&bw.index).unwrap_or(&empty);
            read_batch_shard(codec, &path, key, bw, reported)
        })
        .collect();

    let (lead_dims, lead_shape) = match reads.iter().find_map(|r| r.lead.clone()) {
        Some(lead) => lead,
        None => {
            warn!(key = %key, "no batch produced a readable shard");
            (Vec::new(), Vec::new())
        }
    };
    let mut canvas = Canvas::new(key.clone(), lead_dims.clone(), &lead_shape, enabled);

    for read in reads {
        let lead_matches = read
            .lead
            .as_ref()
            .map(|(dims, shape)| *dims == lead_dims && *shape == lead_shape)
            .unwrap_or(true);
        for (pixel, outcome) in read.pixels {
            match outcome {
                PixelRead::Series(series) if lead_matches => canvas.populate(pixel, &series)?,
                PixelRead::Series(_) => failures.record(
                    pixel,
                    read.index,
                    &key.var,
                    ShardError::new(
                        ShardErrorKind::WrongFormat,
                        format!("{} lead dims differ from the other batches", key),
                    ),
                ),
                PixelRead::Failed(error) => failures.record(pixel, read.index, &key.var, error),
            }
        }
    }
    Ok(canvas)
}

/// Tile-wide run status: batch codes for enabled pixels, masked elsewhere.
/// Pixels the merge could not read are failed even if the engine said otherwise.
fn merged_status(
    layout: &SplitLayout,
    codec: &dyn GridCodec,
    windows: &[BatchWindow],
    map: &PixelMap,
    failures: &FailureLog,
) -> RunStatus {
    let mut status = RunStatus::uniform(map.rows(), map.cols(), STATUS_MASKED);
    for bw in windows {
        let batch_status = match RunStatus::read(codec, &layout.batch_status(bw.index)) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(batch = bw.index, error = %e, "batch run status unavailable");
                None
            }
        };
        for local in bw.window.mask.enabled() {
            let code = batch_status
                .as_ref()
                .and_then(|s| s.get(local))
                .unwrap_or(STATUS_FAILED);
            status.set(bw.window.to_tile(local), code);
        }
    }
    for (pixel, _) in failures.iter() {
        if status.is_complete(*pixel) {
            status.set(*pixel, STATUS_FAILED);
        }
    }
    status
}

fn write_outputs(
    dir: &Path,
    codec: &dyn GridCodec,
    canvases: &BTreeMap<String, Canvas>,
    status: &RunStatus,
    failures: &FailureLog,
    manifest: &MergeManifest,
) -> Result<(), TileError> {
    for (stem, canvas) in canvases {
        let ds = Dataset::new().with_var(canvas.to_grid_var());
        codec.write(&dir.join(codec.file_name(stem)), &ds)?;
    }
    status.write(codec, &dir.join(codec.file_name(RUN_STATUS_STEM)))?;
    fs::write(dir.join(FAIL_LOG_FILE), failures.to_text())?;
    fs::write(dir.join(crate::layout::MERGE_MANIFEST), serde_json::to_string_pretty(manifest)?)?;
    Ok(())
}

/// Merges every batch of a scenario split into `all_merged`.
pub fn merge_split(split_dir: &Path, codec: &dyn GridCodec, options: &MergeOptions) -> Result<MergeReport, TileError> {
    let layout = SplitLayout::new(split_dir, codec.extension());
    let inventory = Inventory::scan_validated(split_dir)?;
    let windows = load_windows(&inventory, &layout, codec)?;

    let tile_mask = match layout.tile_mask().filter(|p| p.is_file()) {
        Some(path) => Some(RunMask::read(codec, &path)?),
        None => {
            warn!(path = %split_dir.display(), "no tile run mask found, tile grid taken from batch windows");
            None
        }
    };
    let map = PixelMap::build(&windows, tile_mask.as_ref(), split_dir)?;
    println!(
        "[merge] {} batches, {}x{} tile, {} enabled pixels",
        windows.len(),
        map.rows(),
        map.cols(),
        map.enabled_count()
    );

    let mut engine_failures = BTreeMap::new();
    for bw in &windows {
        let reported = read_fail_log(&layout.batch_fail_log(bw.index))?;
        if !reported.is_empty() {
            info!(batch = bw.index, pixels = reported.len(), "engine reported failed pixels");
        }
        engine_failures.insert(bw.index, reported);
    }

    let spec = match output_spec::locate(options.output_spec.as_deref(), split_dir, options.data_root.as_deref()) {
        Some(path) => Some(OutputSpec::load(&path)?),
        None => {
            warn!("output_spec.csv not found, synthesis skipped");
            None
        }
    };
    let synthesizer = spec
        .as_ref()
        .map(|s| Synthesizer::new(s, options.toggles, options.pft_weights.as_deref()));

    let mut failures = FailureLog::new();
    let keys = shard_keys(&inventory, layout.ext());
    let engine_stems: BTreeSet<String> = keys.iter().map(|k| k.stem()).collect();
    let mut canvases: BTreeMap<String, Canvas> = BTreeMap::new();
    for key in &keys {
        let canvas = build_canvas(key, &layout, codec, &windows, &engine_failures, map.enabled(), &mut failures)?;
        info!(key = %key, populated = canvas.populated_count(), "canvas built");
        let Some(synth) = &synthesizer else {
            canvases.insert(key.stem(), canvas);
            continue;
        };
        let mut derived = canvas.clone();
        if let Err(e) = synth.run(&mut derived) {
            warn!(key = %key, error = %e, "synthesis failed, writing the unsynthesized canvas");
            failures.record_synthesis(&key.stem(), &e);
            canvases.insert(key.stem(), canvas);
            continue;
        }
        let stem = derived.key.stem();
        if stem == key.stem() {
            canvases.insert(stem, derived);
            continue;
        }
        canvases.insert(key.stem(), canvas);
        if engine_stems.contains(&stem) {
            warn!(from = %key, to = %stem, "engine already produced this shard, synthesized canvas dropped");
            continue;
        }
        canvases.insert(stem, derived);
    }

    let status = merged_status(&layout, codec, &windows, &map, &failures);
    let manifest = MergeManifest {
        tile_rows: map.rows(),
        tile_cols: map.cols(),
        enabled_pixels: map.enabled_count(),
        batches: inventory.indices(),
        variables: canvases.keys().cloned().collect(),
        stages: synthesizer
            .as_ref()
            .map(|s| s.enabled_stage_names().iter().map(|n| n.to_string()).collect())
            .unwrap_or_default(),
        failed_pixels: failures.len(),
        synthesis_failures: failures.synthesis_failures().keys().cloned().collect(),
    };

    let staging = layout.merged_staging_dir();
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    if let Err(e) = write_outputs(&staging, codec, &canvases, &status, &failures, &manifest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(TileError::ShardWrite {
            path: staging,
            message: e.to_string(),
        });
    }

    let output_dir = layout.merged_dir();
    if output_dir.exists() {
        fs::remove_dir_all(&output_dir)?;
    }
    fs::rename(&staging, &output_dir)?;

    println!(
        "[merge] wrote {} variables to {} ({} failed pixels)",
        manifest.variables.len(),
        output_dir.display(),
        failures.len()
    );
    Ok(MergeReport {
        output_dir,
        manifest,
        failures,
    })
}
