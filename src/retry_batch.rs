//! Retry batches: the inverse of the initial split, regrouping the pixels a
//! scenario still owes into new submit-ready batch directories.

use crate::canvas::ShardKey;
use crate::completion::{CompletionRecord, LocalScan, Verdict};
use crate::config::TileConfig;
use crate::fail_log::{read_fail_log, write_fail_log};
use crate::grid::GridCodec;
use crate::job_script::{edit_config_file, retarget_paths, rewrite_for_retry};
use crate::layout::{SplitLayout, RUN_MASK_STEM, RUN_STATUS_STEM, SLURM_RUNNER};
use crate::lock::{default_holder, ScenarioLock};
use crate::mask::{MaskWindow, PixelCoord, RunStatus, STATUS_COMPLETE, STATUS_FILL, STATUS_MASKED};
use crate::scheduler::{JobHandle, Scheduler};
use crate::store::{relative_key, walk};
use crate::TileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const RETRY_PREFIX: &str = "retry_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBatchPlan {
    pub name: String,
    pub source_batch: usize,
    /// Tile coordinates, row-major.
    pub pixels: Vec<PixelCoord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryManifest {
    pub scenario: String,
    pub batches: Vec<RetryBatchPlan>,
}

impl RetryManifest {
    pub fn load(path: &Path) -> Result<Option<Self>, TileError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TileError::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), TileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)? + "\n")?;
        Ok(())
    }

    pub fn pixel_count(&self) -> usize {
        self.batches.iter().map(|b| b.pixels.len()).sum()
    }
}

/// Missing pixels per source batch, chunked into retry batches of at most
/// `max_pixels` each. Same scan, same plan.
pub fn plan_retry(scan: &LocalScan, scenario: &str, max_pixels: usize) -> RetryManifest {
    plan_retry_from(scan, scenario, max_pixels, &BTreeSet::new(), 0)
}

/// [`plan_retry`] without the `covered` pixels, numbering batches from `first`.
pub fn plan_retry_from(
    scan: &LocalScan,
    scenario: &str,
    max_pixels: usize,
    covered: &BTreeSet<PixelCoord>,
    first: usize,
) -> RetryManifest {
    let chunk = max_pixels.max(1);
    let mut sources: Vec<_> = scan.batches.iter().collect();
    sources.sort_by_key(|b| b.index);

    let mut batches = Vec::new();
    for source in sources {
        let mut missing: Vec<PixelCoord> = source.missing().into_iter().filter(|p| !covered.contains(p)).collect();
        missing.sort();
        for pixels in missing.chunks(chunk) {
            batches.push(RetryBatchPlan {
                name: format!("{}{}", RETRY_PREFIX, first + batches.len()),
                source_batch: source.index,
                pixels: pixels.to_vec(),
            });
        }
    }
    RetryManifest {
        scenario: scenario.to_string(),
        batches,
    }
}

pub fn retry_index(name: &str) -> Option<usize> {
    name.strip_prefix(RETRY_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The manifest on disk already matches the plan.
    Unchanged(RetryManifest),
    /// The full manifest and the names of the batches this build wrote.
    Built(RetryManifest, Vec<String>),
    DryRun(RetryManifest),
}

impl BuildOutcome {
    pub fn manifest(&self) -> &RetryManifest {
        match self {
            BuildOutcome::Unchanged(m) | BuildOutcome::Built(m, _) | BuildOutcome::DryRun(m) => m,
        }
    }

    /// Only the batches written by this build; live retries kept from an
    /// earlier build are already queued.
    pub fn created(&self) -> RetryManifest {
        let manifest = self.manifest();
        let batches = match self {
            BuildOutcome::Built(_, created) => manifest
                .batches
                .iter()
                .filter(|b| created.contains(&b.name))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        RetryManifest {
            scenario: manifest.scenario.clone(),
            batches,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsorbReport {
    pub absorbed_pixels: usize,
    pub retired: Vec<String>,
    pub pending: Vec<String>,
}

/// Copies `src` into `dst`, skipping files `skip` accepts. A missing `src` copies nothing.
fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<usize, TileError>
where
    F: Fn(&Path) -> bool,
{
    if !src.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for file in walk(src)? {
        if skip(&file) {
            continue;
        }
        let target = dst.join(relative_key(src, &file)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file, &target)?;
        copied += 1;
    }
    Ok(copied)
}

fn local_pixels(window: &MaskWindow, tile_pixels: &[PixelCoord]) -> Vec<PixelCoord> {
    tile_pixels.iter().filter_map(|p| window.to_local(*p)).collect()
}

pub struct RetryBuilder<'a> {
    layout: &'a SplitLayout,
    codec: &'a dyn GridCodec,
    config: &'a TileConfig,
    holder: String,
}

impl<'a> RetryBuilder<'a> {
    pub fn new(layout: &'a SplitLayout, codec: &'a dyn GridCodec, config: &'a TileConfig) -> Self {
        Self {
            layout,
            codec,
            config,
            holder: default_holder(),
        }
    }

    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }

    fn lock(&self) -> Result<ScenarioLock, TileError> {
        ScenarioLock::acquire(&self.layout.retry_lock(), &self.holder, self.config.lock_grace_secs)
    }

    /// The engine has settled every planned pixel: none is still unrun.
    fn is_finished(&self, rb: &RetryBatchPlan) -> Result<bool, TileError> {
        let status_path = self
            .layout
            .retry_dir(&rb.name)
            .join("output")
            .join(self.layout.grid_file(RUN_STATUS_STEM));
        if !status_path.is_file() {
            return Ok(false);
        }
        let window = MaskWindow::read(self.codec, &self.layout.batch_mask(rb.source_batch))?;
        let status = RunStatus::read(self.codec, &status_path)?;
        Ok(local_pixels(&window, &rb.pixels)
            .into_iter()
            .all(|p| matches!(status.get(p), Some(code) if code != STATUS_MASKED && code != STATUS_FILL)))
    }

    /// Retry batches from the manifest whose jobs may still be queued or running.
    fn live_batches(&self, manifest: Option<&RetryManifest>) -> Result<Vec<RetryBatchPlan>, TileError> {
        let mut live = Vec::new();
        for rb in manifest.map(|m| m.batches.as_slice()).unwrap_or_default() {
            if !self.layout.retry_dir(&rb.name).join(SLURM_RUNNER).is_file() {
                debug!(retry = %rb.name, "retry batch never materialized, replanned");
                continue;
            }
            if self.is_finished(rb)? {
                debug!(retry = %rb.name, "retry batch finished, remaining pixels replanned");
                continue;
            }
            live.push(rb.clone());
        }
        Ok(live)
    }

    /// Plans retry batches for a FAILED record and writes them. Retry batches
    /// still queued or running are kept as they are and their pixels are not
    /// planned again; if nothing else is owed the manifest is left untouched.
    pub fn build(&self, record: &CompletionRecord, scan: &LocalScan, dry_run: bool) -> Result<BuildOutcome, TileError> {
        if record.verdict == Verdict::Passed {
            return Err(TileError::Other(format!(
                "{} {} passed at {:.1}%, no retry batches needed",
                record.tile, record.scenario, record.percentage
            )));
        }
        let _lock = if dry_run { None } else { Some(self.lock()?) };

        let existing = RetryManifest::load(&self.layout.retry_manifest())?;
        let live = self.live_batches(existing.as_ref())?;
        let covered: BTreeSet<PixelCoord> = live.iter().flat_map(|b| b.pixels.iter().copied()).collect();
        let next = existing
            .iter()
            .flat_map(|m| m.batches.iter())
            .filter_map(|b| retry_index(&b.name))
            .max()
            .map_or(0, |i| i + 1);
        let fresh = plan_retry_from(
            scan,
            record.scenario.as_str(),
            self.config.max_pixels_per_retry,
            &covered,
            next,
        );
        let plan = RetryManifest {
            scenario: record.scenario.as_str().to_string(),
            batches: live.iter().chain(fresh.batches.iter()).cloned().collect(),
        };

        if dry_run {
            for rb in &fresh.batches {
                println!(
                    "[retry] would create {} from batch_{} with {} pixels",
                    rb.name,
                    rb.source_batch,
                    rb.pixels.len()
                );
            }
            return Ok(BuildOutcome::DryRun(plan));
        }

        if fresh.batches.is_empty() && existing.as_ref() == Some(&plan) {
            info!(scenario = %record.scenario, batches = plan.batches.len(), "retry batches already up to date");
            return Ok(BuildOutcome::Unchanged(plan));
        }

        self.clear_retry_dirs(&live)?;
        for rb in &fresh.batches {
            let source = scan.batch(rb.source_batch).ok_or_else(|| {
                TileError::Other(format!("batch_{} vanished while planning retries", rb.source_batch))
            })?;
            self.materialize(rb, &source.window)?;
        }
        // Written last: an interrupted build leaves no manifest and is redone.
        plan.save(&self.layout.retry_manifest())?;

        println!(
            "[retry] {} {}: {} new retry batches covering {} pixels, {} still running",
            record.tile,
            record.scenario,
            fresh.batches.len(),
            fresh.pixel_count(),
            live.len()
        );
        let created = fresh.batches.into_iter().map(|b| b.name).collect();
        Ok(BuildOutcome::Built(plan, created))
    }

    /// Removes the manifest and every retry directory not in `keep`.
    fn clear_retry_dirs(&self, keep: &[RetryBatchPlan]) -> Result<(), TileError> {
        let root = self.layout.retry_root();
        if !root.is_dir() {
            return Ok(());
        }
        let manifest = self.layout.retry_manifest();
        if manifest.exists() {
            fs::remove_file(&manifest)?;
        }
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type()?.is_dir() || !name.starts_with(RETRY_PREFIX) {
                continue;
            }
            if keep.iter().any(|b| b.name == name) {
                continue;
            }
            debug!(retry = %name, "removing stale retry batch");
            fs::remove_dir_all(entry.path())?;
        }
        Ok(())
    }

    fn materialize(&self, rb: &RetryBatchPlan, window: &MaskWindow) -> Result<(), TileError> {
        let src = self.layout.batch_dir(rb.source_batch);
        let dst = self.layout.retry_dir(&rb.name);
        fs::create_dir_all(&dst)?;

        let mask_name = self.layout.grid_file(RUN_MASK_STEM);
        copy_tree(&src.join("input"), &dst.join("input"), |p| {
            p.file_name().map(|n| n == mask_name.as_str()).unwrap_or(false)
        })?;
        let restricted = window.restricted_to(&local_pixels(window, &rb.pixels));
        fs::create_dir_all(dst.join("input"))?;
        self.codec.write(&dst.join("input").join(&mask_name), &restricted.to_dataset())?;

        copy_tree(&src.join("config"), &dst.join("config"), |_| false)?;
        edit_config_file(&dst.join("config").join("config.js"), |config| retarget_paths(config, &dst))?;
        copy_tree(&src.join("parameters"), &dst.join("parameters"), |_| false)?;

        fs::create_dir_all(dst.join("output"))?;
        let restarts = copy_tree(&src.join("output"), &dst.join("output"), |p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().starts_with("restart-"))
                .unwrap_or(false)
        })?;
        if restarts == 0 {
            warn!(batch = rb.source_batch, retry = %rb.name, "no restart files to carry into retry batch");
        }

        let script = fs::read_to_string(self.layout.slurm_runner(rb.source_batch))?;
        let rewritten = rewrite_for_retry(
            &script,
            &dst,
            &self.layout.logs_dir(),
            rb.source_batch,
            &rb.name,
            &self.config.partition,
        )?;
        fs::write(dst.join(SLURM_RUNNER), rewritten)?;
        debug!(retry = %rb.name, batch = rb.source_batch, pixels = rb.pixels.len(), "retry batch written");
        Ok(())
    }

    /// Folds completed retry pixels back into their source batches. Fully
    /// complete retry batches are removed; the rest stay listed.
    pub fn absorb(&self, dry_run: bool) -> Result<AbsorbReport, TileError> {
        let Some(manifest) = RetryManifest::load(&self.layout.retry_manifest())? else {
            return Ok(AbsorbReport::default());
        };
        let _lock = if dry_run { None } else { Some(self.lock()?) };

        let mut report = AbsorbReport::default();
        let mut kept = Vec::new();
        for rb in manifest.batches {
            let retry_dir = self.layout.retry_dir(&rb.name);
            let status_path = retry_dir.join("output").join(self.layout.grid_file(RUN_STATUS_STEM));
            if !status_path.is_file() {
                report.pending.push(rb.name.clone());
                kept.push(rb);
                continue;
            }
            let window = MaskWindow::read(self.codec, &self.layout.batch_mask(rb.source_batch))?;
            let retry_status = RunStatus::read(self.codec, &status_path)?;
            let done: Vec<PixelCoord> = local_pixels(&window, &rb.pixels)
                .into_iter()
                .filter(|p| retry_status.is_complete(*p))
                .collect();

            if dry_run {
                println!(
                    "[retry] would absorb {} of {} pixels from {} into batch_{}",
                    done.len(),
                    rb.pixels.len(),
                    rb.name,
                    rb.source_batch
                );
                report.absorbed_pixels += done.len();
                kept.push(rb);
                continue;
            }
            if !done.is_empty() {
                self.absorb_into_source(&rb, &window, &retry_dir, &done)?;
                report.absorbed_pixels += done.len();
            }

            if done.len() == rb.pixels.len() {
                fs::remove_dir_all(&retry_dir)?;
                info!(retry = %rb.name, batch = rb.source_batch, "retry batch absorbed and retired");
                report.retired.push(rb.name);
            } else {
                report.pending.push(rb.name.clone());
                kept.push(rb);
            }
        }

        if !dry_run {
            let path = self.layout.retry_manifest();
            if kept.is_empty() {
                fs::remove_file(&path)?;
            } else {
                RetryManifest {
                    scenario: manifest.scenario,
                    batches: kept,
                }
                .save(&path)?;
            }
        }
        Ok(report)
    }

    fn absorb_into_source(
        &self,
        rb: &RetryBatchPlan,
        window: &MaskWindow,
        retry_dir: &Path,
        done: &[PixelCoord],
    ) -> Result<(), TileError> {
        let ext = self.codec.extension();
        let source_output = self.layout.batch_output(rb.source_batch);
        let (rows, cols) = (window.mask.rows(), window.mask.cols());
        let plane = rows * cols;

        for file in walk(&retry_dir.join("output"))? {
            let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let Some(key) = ShardKey::from_file_name(&name, ext) else {
                continue;
            };
            let target = source_output.join(&name);
            let retry_ds = self.codec.read(&file)?;
            let mut source_ds = match self.codec.read(&target) {
                Ok(ds) => ds,
                Err(e) => {
                    warn!(batch = rb.source_batch, shard = %key, error = %e, "source shard unreadable, not absorbed");
                    continue;
                }
            };
            let (Some(from), Some(into)) = (retry_ds.var(&key.var), source_ds.var_mut(&key.var)) else {
                warn!(batch = rb.source_batch, shard = %key, "variable missing, not absorbed");
                continue;
            };
            if from.shape != into.shape || into.spatial_shape() != Some((rows, cols)) {
                warn!(batch = rb.source_batch, shard = %key, "shard shapes differ, not absorbed");
                continue;
            }
            let lead_len: usize = into.lead_shape().iter().product();
            for p in done {
                let offset = p.row * cols + p.col;
                for i in 0..lead_len {
                    let at = i * plane + offset;
                    if let (Some(v), Some(slot)) = (from.data.get(at), into.data.get_mut(at)) {
                        *slot = *v;
                    }
                }
            }
            self.codec.write(&target, &source_ds)?;
        }

        let status_path = self.layout.batch_status(rb.source_batch);
        let mut status = if status_path.is_file() {
            RunStatus::read(self.codec, &status_path)?
        } else {
            RunStatus::filled(rows, cols)
        };
        for p in done {
            status.set(*p, STATUS_COMPLETE);
        }
        fs::create_dir_all(&source_output)?;
        status.write(self.codec, &status_path)?;

        let fail_log = self.layout.batch_fail_log(rb.source_batch);
        let mut entries = read_fail_log(&fail_log)?;
        let before = entries.len();
        for p in done {
            entries.remove(p);
        }
        if entries.len() != before {
            write_fail_log(&fail_log, &entries)?;
        }
        debug!(retry = %rb.name, batch = rb.source_batch, pixels = done.len(), "absorbed retry pixels");
        Ok(())
    }
}

/// Submits every retry batch in the manifest.
pub fn submit_retries(
    layout: &SplitLayout,
    manifest: &RetryManifest,
    scheduler: &dyn Scheduler,
) -> Result<Vec<JobHandle>, TileError> {
    manifest
        .batches
        .iter()
        .map(|rb| {
            let handle = scheduler.submit(&layout.retry_dir(&rb.name).join(SLURM_RUNNER))?;
            println!("[retry] submitted {} as job {}", rb.name, handle.id);
            Ok(handle)
        })
        .collect()
}
