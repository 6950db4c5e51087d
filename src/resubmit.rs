use crate::completion::LocalScan;
use crate::config::TileConfig;
use crate::job_script::{edit_config_file, refresh_fresh_run_config, rewrite_for_fresh_run};
use crate::layout::SplitLayout;
use crate::scheduler::{JobHandle, Scheduler};
use crate::TileError;
use std::fs;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ResubmitOptions {
    pub partition: Option<String>,
    pub nowalltime: bool,
    pub submit: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResubmitReport {
    pub rewritten: Vec<usize>,
    pub submitted: Vec<JobHandle>,
}

/// Rewrites every unfinished batch for a fresh, non-restart run and
/// optionally submits it.
pub fn resubmit_unfinished(
    layout: &SplitLayout,
    scan: &LocalScan,
    config: &TileConfig,
    options: &ResubmitOptions,
    scheduler: &dyn Scheduler,
) -> Result<ResubmitReport, TileError> {
    let mut report = ResubmitReport::default();
    let unfinished: Vec<_> = scan.batches.iter().filter(|b| !b.is_finished()).collect();
    if unfinished.is_empty() {
        println!("[resubmit] every batch in {} finished", layout.dir().display());
        return Ok(report);
    }

    for batch in unfinished {
        let n = batch.index;
        if options.dry_run {
            println!(
                "[resubmit] would rewrite batch_{} ({}/{} complete){}",
                n,
                batch.complete.len(),
                batch.enabled_count(),
                if options.submit { " and submit it" } else { "" }
            );
            report.rewritten.push(n);
            continue;
        }

        let runner = layout.slurm_runner(n);
        let script = fs::read_to_string(&runner)?;
        let rewritten = rewrite_for_fresh_run(
            &script,
            &layout.batch_dir(n),
            &layout.logs_dir(),
            n,
            options.partition.as_deref(),
            options.nowalltime,
            &config.engine_command,
        )?;
        fs::write(&runner, rewritten)?;
        let changed = edit_config_file(&layout.config_js(n), |c| Ok(refresh_fresh_run_config(c, &layout.batch_dir(n))))?;
        info!(batch = n, config_changes = changed, "batch rewritten for a fresh run");
        report.rewritten.push(n);

        if options.submit {
            fs::create_dir_all(layout.logs_dir())?;
            let handle = scheduler.submit(&runner)?;
            println!("[resubmit] submitted batch_{} as job {}", n, handle.id);
            report.submitted.push(handle);
        }
    }
    Ok(report)
}
