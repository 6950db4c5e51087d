//! Mirroring between local split directories and the object store.
//!
//! Every sync is planned first. A plan lists one action per file and the
//! conflicts that need `force`; executing a plan with conflicts and no force
//! fails before anything is touched, and a dry run only prints.

use crate::backoff::{with_backoff, RetryPolicy};
use crate::config::{Scenario, TileId};
use crate::grid::GridCodec;
use crate::inventory::Inventory;
use crate::layout::{remote_scenario_key, remote_split_key, TileLayout, MERGED_DIR};
use crate::merge::{merge_split, MergeOptions, MergeReport};
use crate::store::{download, join_key, relative_key, upload, walk, ObjectStore};
use crate::TileError;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upload { local: PathBuf, key: String },
    Overwrite { local: PathBuf, key: String },
    Skip { key: String },
    DeleteRemote { key: String },
    KeepRemote { key: String },
    Download { key: String, local: PathBuf },
}

impl SyncAction {
    pub fn mutates(&self) -> bool {
        !matches!(self, SyncAction::Skip { .. } | SyncAction::KeepRemote { .. })
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Upload { local, key } => write!(f, "upload    {} -> {}", local.display(), key),
            SyncAction::Overwrite { local, key } => write!(f, "overwrite {} -> {}", local.display(), key),
            SyncAction::Skip { key } => write!(f, "skip      {}", key),
            SyncAction::DeleteRemote { key } => write!(f, "delete    {}", key),
            SyncAction::KeepRemote { key } => write!(f, "keep      {} (remote only)", key),
            SyncAction::Download { key, local } => write!(f, "download  {} -> {}", key, local.display()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    /// Remote keys whose size differs from the local file.
    pub conflicts: Vec<String>,
    pub force: bool,
}

impl SyncPlan {
    pub fn count(&self, pred: impl Fn(&SyncAction) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(a)).count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub transferred: usize,
    pub deleted: usize,
    pub skipped: usize,
}

fn remote_listing(store: &dyn ObjectStore, policy: &RetryPolicy, prefix: &str) -> Result<BTreeMap<String, u64>, TileError> {
    let dir_prefix = format!("{}/", prefix.trim_end_matches('/'));
    let listed = with_backoff(policy, "list", || store.list(&dir_prefix))?;
    Ok(listed
        .into_iter()
        .filter_map(|o| o.key.strip_prefix(&dir_prefix).map(|rel| (rel.to_string(), o.size)))
        .collect())
}

/// Plans mirroring `local_dir` to `remote_prefix`. Files are compared by size.
pub fn plan_push(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    local_dir: &Path,
    remote_prefix: &str,
    force: bool,
) -> Result<SyncPlan, TileError> {
    let mut remote = remote_listing(store, policy, remote_prefix)?;
    let mut plan = SyncPlan {
        force,
        ..Default::default()
    };

    for file in walk(local_dir)? {
        let rel = relative_key(local_dir, &file)?;
        let key = join_key(remote_prefix, &rel);
        let size = fs::metadata(&file)?.len();
        match remote.remove(&rel) {
            None => plan.actions.push(SyncAction::Upload { local: file, key }),
            // A redone merge keeps file sizes, so force rewrites every existing key.
            Some(_) if force => plan.actions.push(SyncAction::Overwrite { local: file, key }),
            Some(remote_size) if remote_size == size => plan.actions.push(SyncAction::Skip { key }),
            Some(_) => {
                plan.conflicts.push(key.clone());
                plan.actions.push(SyncAction::Skip { key });
            }
        }
    }
    for rel in remote.into_keys() {
        let key = join_key(remote_prefix, &rel);
        if force {
            plan.actions.push(SyncAction::DeleteRemote { key });
        } else {
            plan.actions.push(SyncAction::KeepRemote { key });
        }
    }
    Ok(plan)
}

/// Plans fetching every remote file under `remote_prefix` that is absent locally.
pub fn plan_pull(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    remote_prefix: &str,
    local_dir: &Path,
) -> Result<SyncPlan, TileError> {
    let remote = remote_listing(store, policy, remote_prefix)?;
    let mut plan = SyncPlan::default();
    for rel in remote.into_keys() {
        let local = rel.split('/').fold(local_dir.to_path_buf(), |p, s| p.join(s));
        let key = join_key(remote_prefix, &rel);
        if local.exists() {
            plan.actions.push(SyncAction::Skip { key });
        } else {
            plan.actions.push(SyncAction::Download { key, local });
        }
    }
    Ok(plan)
}

pub fn execute(
    store: &dyn ObjectStore,
    plan: &SyncPlan,
    dry_run: bool,
    policy: &RetryPolicy,
) -> Result<SyncSummary, TileError> {
    if dry_run {
        for action in plan.actions.iter().filter(|a| a.mutates()) {
            println!("[sync] (dry run) {}", action);
        }
        for conflict in &plan.conflicts {
            println!("[sync] (dry run) conflict {} differs, needs force", conflict);
        }
        return Ok(SyncSummary {
            skipped: plan.count(|a| !a.mutates()),
            ..Default::default()
        });
    }
    if !plan.conflicts.is_empty() && !plan.force {
        return Err(TileError::SyncConflict {
            conflicts: plan.conflicts.clone(),
        });
    }

    let mut summary = SyncSummary::default();
    for action in &plan.actions {
        match action {
            SyncAction::Upload { local, key } | SyncAction::Overwrite { local, key } => {
                upload(store, policy, local, key)?;
                summary.transferred += 1;
            }
            SyncAction::Download { key, local } => {
                download(store, policy, key, local)?;
                summary.transferred += 1;
            }
            SyncAction::DeleteRemote { key } => {
                with_backoff(policy, "delete", || store.delete(key))?;
                summary.deleted += 1;
            }
            SyncAction::Skip { .. } | SyncAction::KeepRemote { .. } => summary.skipped += 1,
        }
        debug!(action = %action, "sync action done");
    }
    info!(
        store = %store.describe(),
        transferred = summary.transferred,
        deleted = summary.deleted,
        skipped = summary.skipped,
        "sync finished"
    );
    Ok(summary)
}

/// Pulls a tile scenario's split and run mask into `root`.
pub fn pull_scenario(
    store: &dyn ObjectStore,
    policy: &RetryPolicy,
    root: &Path,
    tile: &TileId,
    scenario: &Scenario,
    ext: &'static str,
    dry_run: bool,
) -> Result<SyncSummary, TileError> {
    let layout = TileLayout::new(root, tile, ext);
    let mut plan = plan_pull(store, policy, &remote_split_key(tile, scenario), layout.split(scenario).dir())?;
    let scenario_plan = plan_pull(store, policy, &remote_scenario_key(tile, scenario), &layout.scenario_dir(scenario))?;
    plan.actions.extend(scenario_plan.actions);
    println!(
        "[sync] pulling {} {}: {} files to fetch",
        tile,
        scenario,
        plan.count(|a| matches!(a, SyncAction::Download { .. }))
    );
    execute(store, &plan, dry_run, policy)
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub tile: TileId,
    pub scenario: Scenario,
    /// Directory holding the `{tile}_sc` tree.
    pub root: PathBuf,
    pub trim: bool,
    pub merge: bool,
    pub push: bool,
    pub merged_only: bool,
    pub force_merge: bool,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub trimmed: usize,
    pub merge: Option<MergeReport>,
    pub push: Option<SyncSummary>,
}

/// Trim, merge and push one scenario split, each step optional.
pub fn run_sync(
    request: &SyncRequest,
    store: Option<&dyn ObjectStore>,
    codec: &dyn GridCodec,
    merge_options: &MergeOptions,
    policy: &RetryPolicy,
) -> Result<SyncReport, TileError> {
    let split = TileLayout::new(&request.root, &request.tile, codec.extension()).split(&request.scenario);
    let mut report = SyncReport::default();

    if request.trim {
        let plan = Inventory::scan(split.dir())?.trim_plan();
        report.trimmed = plan.apply(request.dry_run)?;
        println!("[sync] trim: {} extra output files", report.trimmed);
    }

    if request.merge {
        if split.merge_manifest().is_file() && !request.force_merge {
            println!(
                "[sync] {} already merged, skipping (use --force-merge to redo)",
                split.merged_dir().display()
            );
        } else if request.dry_run {
            println!("[sync] (dry run) would merge {}", split.dir().display());
        } else {
            report.merge = Some(merge_split(split.dir(), codec, merge_options)?);
        }
    }

    if request.push {
        let store = store.ok_or_else(|| TileError::Config("push requested but no bucket configured".to_string()))?;
        let base_key = remote_split_key(&request.tile, &request.scenario);
        let (local_dir, key) = if request.merged_only {
            (split.merged_dir(), join_key(&base_key, MERGED_DIR))
        } else {
            (split.dir().to_path_buf(), base_key)
        };
        if !local_dir.is_dir() {
            return Err(TileError::Other(format!("nothing to push, {} does not exist", local_dir.display())));
        }
        let plan = plan_push(store, policy, &local_dir, &key, request.force)?;
        println!(
            "[sync] push {} -> {}/{}: {} upload, {} overwrite, {} conflicts",
            local_dir.display(),
            store.describe(),
            key,
            plan.count(|a| matches!(a, SyncAction::Upload { .. })),
            plan.count(|a| matches!(a, SyncAction::Overwrite { .. })),
            plan.conflicts.len()
        );
        report.push = Some(execute(store, &plan, request.dry_run, policy)?);
    }
    Ok(report)
}
