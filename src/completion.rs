//! Completion checking: what fraction of a scenario's enabled pixels finished.
//!
//! Counts come from an ordered list of sources. The local split directory is
//! asked first; the merged run status in the bucket is the fallback. The
//! first source that answers wins and the answer is tagged with its origin.

use crate::backoff::RetryPolicy;
use crate::config::{Scenario, TileConfig, TileId};
use crate::grid::GridCodec;
use crate::inventory::Inventory;
use crate::layout::{remote_scenario_key, remote_split_key, SplitLayout, TileLayout, MERGED_DIR, RUN_MASK_STEM, RUN_STATUS_STEM};
use crate::mask::{MaskWindow, PixelCoord, RunMask, RunStatus};
use crate::retry_batch::RetryManifest;
use crate::store::{download, join_key, ObjectStore};
use crate::TileError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PASS_THRESHOLD: f64 = 99.0;
pub const FULL_RESUBMISSION_THRESHOLD: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Bucket,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Local => write!(f, "local"),
            SourceKind::Bucket => write!(f, "bucket"),
        }
    }
}

/// A value together with the source that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub source: SourceKind,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionCounts {
    pub completed: usize,
    pub enabled: usize,
}

impl CompletionCounts {
    /// Complete share of enabled pixels in `[0, 100]`. An empty or fully
    /// disabled status certifies nothing and counts as 0.
    pub fn percentage(&self) -> f64 {
        if self.enabled == 0 {
            return 0.0;
        }
        (self.completed.min(self.enabled) * 100) as f64 / self.enabled as f64
    }
}

pub trait CompletionSource {
    fn kind(&self) -> SourceKind;

    fn counts(&self, tile: &TileId, scenario: &Scenario) -> Result<CompletionCounts, TileError>;
}

/// Completion of one batch, in tile coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCompletion {
    pub index: usize,
    pub window: MaskWindow,
    pub complete: BTreeSet<PixelCoord>,
}

impl BatchCompletion {
    pub fn enabled(&self) -> impl Iterator<Item = PixelCoord> + '_ {
        self.window.mask.enabled().map(|p| self.window.to_tile(p))
    }

    pub fn enabled_count(&self) -> usize {
        self.window.mask.enabled_count()
    }

    /// Enabled pixels not yet complete, row-major.
    pub fn missing(&self) -> Vec<PixelCoord> {
        self.enabled().filter(|p| !self.complete.contains(p)).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.complete.len() == self.enabled_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScan {
    pub batches: Vec<BatchCompletion>,
}

impl LocalScan {
    pub fn counts(&self) -> CompletionCounts {
        CompletionCounts {
            completed: self.batches.iter().map(|b| b.complete.len()).sum(),
            enabled: self.batches.iter().map(|b| b.enabled_count()).sum(),
        }
    }

    pub fn batch(&self, index: usize) -> Option<&BatchCompletion> {
        self.batches.iter().find(|b| b.index == index)
    }
}

fn complete_in(status: Option<&RunStatus>, window: &MaskWindow) -> BTreeSet<PixelCoord> {
    match status {
        Some(status) => window
            .mask
            .enabled()
            .filter(|p| status.is_complete(*p))
            .map(|p| window.to_tile(p))
            .collect(),
        None => BTreeSet::new(),
    }
}

/// Reads every batch's run status, plus the statuses of any retry batches
/// listed in the retry manifest. A missing status file leaves the batch's
/// pixels incomplete.
pub fn scan_local(layout: &SplitLayout, codec: &dyn GridCodec) -> Result<LocalScan, TileError> {
    let inventory = Inventory::scan(layout.dir())?;

    let mut retry_statuses: BTreeMap<usize, Vec<RunStatus>> = BTreeMap::new();
    if let Some(manifest) = RetryManifest::load(&layout.retry_manifest())? {
        for rb in &manifest.batches {
            let path = layout.retry_dir(&rb.name).join("output").join(layout.grid_file(RUN_STATUS_STEM));
            if path.is_file() {
                match RunStatus::read(codec, &path) {
                    Ok(status) => retry_statuses.entry(rb.source_batch).or_default().push(status),
                    Err(e) => warn!(retry = %rb.name, error = %e, "retry run status unreadable"),
                }
            }
        }
    }

    let mut batches = Vec::with_capacity(inventory.batches.len());
    for entry in &inventory.batches {
        let window = MaskWindow::read(codec, &layout.batch_mask(entry.index))?;
        let status_path = layout.batch_status(entry.index);
        let status = if status_path.is_file() {
            Some(RunStatus::read(codec, &status_path)?)
        } else {
            debug!(batch = entry.index, "no run status yet");
            None
        };
        let mut complete = complete_in(status.as_ref(), &window);
        for retry in retry_statuses.get(&entry.index).into_iter().flatten() {
            complete.extend(complete_in(Some(retry), &window));
        }
        batches.push(BatchCompletion {
            index: entry.index,
            window,
            complete,
        });
    }
    Ok(LocalScan { batches })
}

pub struct LocalSource {
    root: std::path::PathBuf,
    codec: Arc<dyn GridCodec>,
}

impl LocalSource {
    pub fn new(root: &std::path::Path, codec: Arc<dyn GridCodec>) -> Self {
        Self {
            root: root.to_path_buf(),
            codec,
        }
    }
}

impl CompletionSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn counts(&self, tile: &TileId, scenario: &Scenario) -> Result<CompletionCounts, TileError> {
        let layout = TileLayout::new(&self.root, tile, self.codec.extension()).split(scenario);
        Ok(scan_local(&layout, self.codec.as_ref())?.counts())
    }
}

/// Merged run status and tile run mask fetched from the bucket.
pub struct BucketSource {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn GridCodec>,
    policy: RetryPolicy,
}

impl BucketSource {
    pub fn new(store: Arc<dyn ObjectStore>, codec: Arc<dyn GridCodec>, policy: RetryPolicy) -> Self {
        Self { store, codec, policy }
    }
}

impl CompletionSource for BucketSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Bucket
    }

    fn counts(&self, tile: &TileId, scenario: &Scenario) -> Result<CompletionCounts, TileError> {
        let status_key = join_key(
            &remote_split_key(tile, scenario),
            &format!("{}/{}", MERGED_DIR, self.codec.file_name(RUN_STATUS_STEM)),
        );
        let mask_key = join_key(&remote_scenario_key(tile, scenario), &self.codec.file_name(RUN_MASK_STEM));

        let scratch = tempfile::tempdir()?;
        let status_path = scratch.path().join(self.codec.file_name(RUN_STATUS_STEM));
        let mask_path = scratch.path().join(self.codec.file_name(RUN_MASK_STEM));
        download(self.store.as_ref(), &self.policy, &status_key, &status_path)?;
        download(self.store.as_ref(), &self.policy, &mask_key, &mask_path)?;

        let status = RunStatus::read(self.codec.as_ref(), &status_path)?;
        let mask = RunMask::read(self.codec.as_ref(), &mask_path)?;
        if (status.rows(), status.cols()) != (mask.rows(), mask.cols()) {
            return Err(TileError::codec(
                status_path,
                format!(
                    "merged run status is {}x{} but the tile mask is {}x{}",
                    status.rows(),
                    status.cols(),
                    mask.rows(),
                    mask.cols()
                ),
            ));
        }
        Ok(CompletionCounts {
            completed: status.complete_count(&mask),
            enabled: mask.enabled_count(),
        })
    }
}

/// Tries each source in order and returns the first answer.
///
/// When every source fails the result is `CompletionUnavailable`, except that
/// a local `NoBatchFoldersFound` is surfaced as itself.
pub fn resolve(
    sources: &[&dyn CompletionSource],
    tile: &TileId,
    scenario: &Scenario,
) -> Result<Resolved<CompletionCounts>, TileError> {
    let mut attempts = Vec::new();
    let mut no_batches = None;
    for source in sources {
        match source.counts(tile, scenario) {
            Ok(value) => {
                return Ok(Resolved {
                    source: source.kind(),
                    value,
                });
            }
            Err(e) => {
                debug!(source = %source.kind(), tile = %tile, scenario = %scenario, error = %e, "completion source failed");
                attempts.push(format!("{}: {}", source.kind(), e));
                if source.kind() == SourceKind::Local && matches!(e, TileError::NoBatchFoldersFound { .. }) {
                    no_batches = Some(e);
                }
            }
        }
    }
    if let Some(e) = no_batches {
        return Err(e);
    }
    Err(TileError::CompletionUnavailable {
        tile: tile.to_string(),
        scenario: scenario.to_string(),
        attempts,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

impl Verdict {
    /// Strictly above the threshold passes.
    pub fn from_percentage(pct: f64) -> Self {
        if pct > PASS_THRESHOLD { Verdict::Passed } else { Verdict::Failed }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASSED"),
            Verdict::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub tile: TileId,
    pub scenario: Scenario,
    pub completed: usize,
    pub enabled: usize,
    pub percentage: f64,
    pub source: SourceKind,
    pub verdict: Verdict,
    pub full_resubmission: bool,
}

impl CompletionRecord {
    pub fn new(tile: &TileId, scenario: &Scenario, resolved: Resolved<CompletionCounts>) -> Self {
        let percentage = resolved.value.percentage();
        let verdict = Verdict::from_percentage(percentage);
        Self {
            tile: tile.clone(),
            scenario: scenario.clone(),
            completed: resolved.value.completed,
            enabled: resolved.value.enabled,
            percentage,
            source: resolved.source,
            verdict,
            full_resubmission: verdict == Verdict::Failed && percentage < FULL_RESUBMISSION_THRESHOLD,
        }
    }
}

/// Result of checking one scenario.
#[derive(Debug)]
pub enum ScenarioCheck {
    Checked(CompletionRecord),
    Unavailable { scenario: Scenario, error: TileError },
}

impl ScenarioCheck {
    pub fn record(&self) -> Option<&CompletionRecord> {
        match self {
            ScenarioCheck::Checked(record) => Some(record),
            ScenarioCheck::Unavailable { .. } => None,
        }
    }
}

/// Checks every configured scenario of a tile, base scenario first.
pub fn check_tile(config: &TileConfig, tile: &TileId, sources: &[&dyn CompletionSource]) -> Vec<ScenarioCheck> {
    config
        .ordered_scenarios()
        .into_iter()
        .map(|scenario| match resolve(sources, tile, &scenario) {
            Ok(resolved) => {
                let record = CompletionRecord::new(tile, &scenario, resolved);
                info!(
                    tile = %tile,
                    scenario = %scenario,
                    completed = record.completed,
                    enabled = record.enabled,
                    source = %record.source,
                    "completion checked"
                );
                ScenarioCheck::Checked(record)
            }
            Err(error) => {
                warn!(tile = %tile, scenario = %scenario, error = %error, "completion unavailable");
                ScenarioCheck::Unavailable { scenario, error }
            }
        })
        .collect()
}

/// Per-tile table: scenario, completed/enabled, percentage, source, verdict.
pub fn render_report(tile: &TileId, checks: &[ScenarioCheck]) -> String {
    let header = ["scenario", "completed", "pct", "source", "verdict"];
    let rows: Vec<[String; 5]> = checks
        .iter()
        .map(|check| match check {
            ScenarioCheck::Checked(r) => [
                r.scenario.to_string(),
                format!("{}/{}", r.completed, r.enabled),
                format!("{:.1}%", r.percentage),
                r.source.to_string(),
                if r.full_resubmission {
                    format!("{} (resubmit)", r.verdict)
                } else {
                    r.verdict.to_string()
                },
            ],
            ScenarioCheck::Unavailable { scenario, .. } => [
                scenario.to_string(),
                "-".to_string(),
                "-".to_string(),
                "-".to_string(),
                format!("{} (unavailable)", Verdict::Failed),
            ],
        })
        .collect();

    let mut widths = header.map(|h| h.len());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{:width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join(" │ ")
    };

    let mut out = format!("Tile {}\n", tile);
    out.push_str(&line(&header.map(|h| h.to_string())));
    out.push('\n');
    out.push_str(&widths.iter().map(|w| "─".repeat(*w)).collect::<Vec<_>>().join("─┼─"));
    out.push('\n');
    for row in &rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fixed {
        kind: SourceKind,
        answer: Result<CompletionCounts, fn() -> TileError>,
        calls: Cell<usize>,
    }

    impl CompletionSource for Fixed {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn counts(&self, _: &TileId, _: &Scenario) -> Result<CompletionCounts, TileError> {
            self.calls.set(self.calls.get() + 1);
            self.answer.clone().map_err(|f| f())
        }
    }

    fn ids() -> (TileId, Scenario) {
        ("H10_V15".parse().unwrap(), "ssp2_4_5_mri_esm2_0".parse().unwrap())
    }

    #[test]
    fn thresholds_are_strict() {
        let (tile, scenario) = ids();
        let record = |completed| {
            CompletionRecord::new(
                &tile,
                &scenario,
                Resolved {
                    source: SourceKind::Local,
                    value: CompletionCounts { completed, enabled: 500 },
                },
            )
        };
        let r = record(495);
        assert_eq!(r.percentage, 99.0);
        assert_eq!(r.verdict, Verdict::Failed);
        assert!(!r.full_resubmission);
        assert_eq!(record(496).verdict, Verdict::Passed);
        let r = record(450);
        assert_eq!(r.percentage, 90.0);
        assert!(!r.full_resubmission);
        assert!(record(449).full_resubmission);
    }

    #[test]
    fn nothing_enabled_never_passes() {
        let counts = CompletionCounts { completed: 0, enabled: 0 };
        assert_eq!(counts.percentage(), 0.0);
        assert_eq!(Verdict::from_percentage(counts.percentage()), Verdict::Failed);
    }

    #[test]
    fn first_answering_source_wins() {
        let (tile, scenario) = ids();
        let local = Fixed {
            kind: SourceKind::Local,
            answer: Ok(CompletionCounts { completed: 3, enabled: 4 }),
            calls: Cell::new(0),
        };
        let bucket = Fixed {
            kind: SourceKind::Bucket,
            answer: Ok(CompletionCounts { completed: 4, enabled: 4 }),
            calls: Cell::new(0),
        };
        let resolved = resolve(&[&local, &bucket], &tile, &scenario).unwrap();
        assert_eq!(resolved.source, SourceKind::Local);
        assert_eq!(resolved.value.completed, 3);
        assert_eq!(bucket.calls.get(), 0);
    }

    #[test]
    fn missing_batches_surface_when_bucket_also_fails() {
        let (tile, scenario) = ids();
        let local = Fixed {
            kind: SourceKind::Local,
            answer: Err(|| TileError::NoBatchFoldersFound { path: "/x".into() }),
            calls: Cell::new(0),
        };
        let bucket = Fixed {
            kind: SourceKind::Bucket,
            answer: Err(|| TileError::store(crate::StoreErrorKind::NotFound, "k", "missing")),
            calls: Cell::new(0),
        };
        match resolve(&[&local, &bucket], &tile, &scenario) {
            Err(TileError::NoBatchFoldersFound { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }

        let local = Fixed {
            kind: SourceKind::Local,
            answer: Err(|| TileError::Other("bad mask".into())),
            calls: Cell::new(0),
        };
        let bucket = Fixed {
            kind: SourceKind::Bucket,
            answer: Err(|| TileError::store(crate::StoreErrorKind::NotFound, "k", "missing")),
            calls: Cell::new(0),
        };
        match resolve(&[&local, &bucket], &tile, &scenario) {
            Err(TileError::CompletionUnavailable { attempts, .. }) => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn report_lists_every_scenario() {
        let (tile, scenario) = ids();
        let checks = vec![
            ScenarioCheck::Checked(CompletionRecord::new(
                &tile,
                &scenario,
                Resolved {
                    source: SourceKind::Bucket,
                    value: CompletionCounts { completed: 450, enabled: 500 },
                },
            )),
            ScenarioCheck::Unavailable {
                scenario: "ssp5_8_5_mri_esm2_0".parse().unwrap(),
                error: TileError::Other("x".into()),
            },
        ];
        let report = render_report(&tile, &checks);
        assert!(report.contains("450/500"));
        assert!(report.contains("90.0%"));
        assert!(report.contains("bucket"));
        assert!(report.contains("FAILED (unavailable)"));
    }
}
