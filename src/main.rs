use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tilemerge::completion::{
    check_tile, render_report, scan_local, BucketSource, CompletionRecord, CompletionSource, LocalSource, Resolved,
    ScenarioCheck, SourceKind, Verdict,
};
use tilemerge::config::{parse_weights, Scenario, TileConfig, TileId};
use tilemerge::grid::{codec_for, GridCodec};
use tilemerge::inventory::Inventory;
use tilemerge::layout::TileLayout;
use tilemerge::merge::{merge_split, MergeOptions};
use tilemerge::mosaic::{default_output_dir, mosaic_scenario};
use tilemerge::resubmit::{resubmit_unfinished, ResubmitOptions};
use tilemerge::retry_batch::{submit_retries, BuildOutcome, RetryBuilder};
use tilemerge::scheduler::SlurmScheduler;
use tilemerge::store::{open_store, ObjectStore};
use tilemerge::sync::{pull_scenario, run_sync, SyncRequest};
use tilemerge::synthesis::StageToggles;
use tilemerge::{init_tracing, TileError};

#[derive(Parser)]
#[command(name = "tilemerge")]
#[command(about = "Merge, check and repair batched tile simulation runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every batch of a scenario split into all_merged
    Merge {
        /// Path to a {scenario}_split directory
        split_path: PathBuf,
        #[arg(long)]
        no_yearsynth: bool,
        #[arg(long)]
        no_compsynth: bool,
        #[arg(long)]
        no_pftsynth: bool,
        #[arg(long)]
        no_layersynth: bool,
        /// output_spec.csv to use instead of the usual lookup
        #[arg(long)]
        output_spec: Option<PathBuf>,
        /// Comma separated PFT weights for weighted PFT synthesis
        #[arg(long)]
        pft_weights: Option<String>,
    },
    /// Report completion per tile and scenario, optionally repairing failures
    CheckAndFix {
        /// File with one tile id per line
        tile_file: Option<PathBuf>,
        #[arg(long)]
        tile: Vec<String>,
        /// Build retry batches (or rewrite batches for a fresh run below 90%)
        #[arg(long)]
        fix: bool,
        /// Submit what --fix produced
        #[arg(long, requires = "fix")]
        submit: bool,
        /// Merge and push scenarios that passed
        #[arg(long, requires = "fix")]
        sync: bool,
        /// Bucket location, overrides TILEMERGE_BUCKET
        #[arg(long)]
        bucket_path: Option<String>,
        #[arg(long)]
        partition: Option<String>,
        /// Drop the walltime limit from resubmitted batches
        #[arg(long)]
        nowalltime: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Trim, merge and push one tile scenario
    Sync {
        tile: String,
        scenario: String,
        /// Directory holding the {tile}_sc tree
        local_path: PathBuf,
        #[arg(long)]
        trim: bool,
        #[arg(long)]
        merge: bool,
        /// Push to the bucket
        #[arg(long)]
        sync: bool,
        /// Push only all_merged
        #[arg(long = "all_merged")]
        all_merged: bool,
        #[arg(long)]
        force_merge: bool,
        /// Overwrite differing remote files and delete remote-only ones
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        bucket_path: Option<String>,
    },
    /// Place every merged tile of a scenario into one regional grid per variable
    Mosaic {
        scenario: String,
        /// Output directory, defaults to {root}/mosaic/{scenario}
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove output files that are not present in every batch
    Trim {
        split_path: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

fn open_bucket(config: &TileConfig, override_path: Option<String>) -> Result<Option<Arc<dyn ObjectStore>>, TileError> {
    match override_path.or_else(|| config.bucket.clone()) {
        Some(location) => Ok(Some(Arc::from(open_store(&location)?))),
        None => Ok(None),
    }
}

fn read_tiles(tile_file: Option<&Path>, extra: &[String]) -> Result<Vec<TileId>, TileError> {
    let mut tiles = Vec::new();
    if let Some(path) = tile_file {
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            tiles.push(line.parse()?);
        }
    }
    for t in extra {
        tiles.push(t.parse()?);
    }
    if tiles.is_empty() {
        return Err(TileError::Config("no tiles given, pass a tile file or --tile".to_string()));
    }
    Ok(tiles)
}

fn merge_options(config: &TileConfig, toggles: StageToggles, output_spec: Option<PathBuf>) -> MergeOptions {
    MergeOptions {
        toggles,
        output_spec,
        data_root: Some(config.root.clone()),
        pft_weights: config.pft_weights.clone(),
    }
}

struct FixFlags {
    submit: bool,
    sync: bool,
    partition: Option<String>,
    nowalltime: bool,
    dry_run: bool,
}

fn fix_scenario(
    config: &TileConfig,
    codec: &dyn GridCodec,
    store: Option<&dyn ObjectStore>,
    record: &CompletionRecord,
    flags: &FixFlags,
) -> Result<(), TileError> {
    let tile_layout = TileLayout::new(&config.root, &record.tile, codec.extension());
    let split = tile_layout.split(&record.scenario);

    if record.verdict == Verdict::Passed {
        if flags.sync {
            let request = SyncRequest {
                tile: record.tile.clone(),
                scenario: record.scenario.clone(),
                root: config.root.clone(),
                trim: false,
                merge: split.dir().is_dir(),
                push: split.merged_dir().is_dir() || split.dir().is_dir(),
                merged_only: true,
                force_merge: false,
                force: false,
                dry_run: flags.dry_run,
            };
            run_sync(&request, store, codec, &merge_options(config, StageToggles::default(), None), &config.retry)?;
        }
        return Ok(());
    }

    if !split.dir().is_dir() {
        let store = store.ok_or_else(|| TileError::NoBatchFoldersFound {
            path: split.dir().to_path_buf(),
        })?;
        pull_scenario(store, &config.retry, &config.root, &record.tile, &record.scenario, codec.extension(), flags.dry_run)?;
        if flags.dry_run {
            return Ok(());
        }
    }

    let scheduler = SlurmScheduler::new();
    if record.full_resubmission {
        let scan = scan_local(&split, codec)?;
        let options = ResubmitOptions {
            partition: flags.partition.clone(),
            nowalltime: flags.nowalltime,
            submit: flags.submit,
            dry_run: flags.dry_run,
        };
        let report = resubmit_unfinished(&split, &scan, config, &options, &scheduler)?;
        println!(
            "[check] {} {}: {} batches rewritten for a fresh run",
            record.tile,
            record.scenario,
            report.rewritten.len()
        );
        return Ok(());
    }

    let mut retry_config = config.clone();
    if let Some(p) = &flags.partition {
        retry_config.partition = p.clone();
    }
    let builder = RetryBuilder::new(&split, codec, &retry_config);
    let absorbed = builder.absorb(flags.dry_run)?;
    if absorbed.absorbed_pixels > 0 {
        println!(
            "[retry] absorbed {} pixels, retired {:?}",
            absorbed.absorbed_pixels, absorbed.retired
        );
    }

    let scan = scan_local(&split, codec)?;
    let local = CompletionRecord::new(
        &record.tile,
        &record.scenario,
        Resolved {
            source: SourceKind::Local,
            value: scan.counts(),
        },
    );
    if local.verdict == Verdict::Passed {
        println!(
            "[check] {} {} now at {:.1}% locally, no retry needed",
            local.tile, local.scenario, local.percentage
        );
        return Ok(());
    }

    match builder.build(&local, &scan, flags.dry_run)? {
        outcome @ BuildOutcome::Built(..) if flags.submit => {
            submit_retries(&split, &outcome.created(), &scheduler)?;
        }
        BuildOutcome::Unchanged(manifest) => println!(
            "[retry] {} retry batches already in place for {} {}, not resubmitted",
            manifest.batches.len(),
            local.tile,
            local.scenario
        ),
        _ => {}
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), TileError> {
    let config = TileConfig::from_env()?;
    let codec = codec_for(config.codec)?;

    match cli.command {
        Commands::Merge {
            split_path,
            no_yearsynth,
            no_compsynth,
            no_pftsynth,
            no_layersynth,
            output_spec,
            pft_weights,
        } => {
            let toggles = StageToggles {
                yearly: !no_yearsynth,
                compartment: !no_compsynth,
                pft: !no_pftsynth,
                layer: !no_layersynth,
            };
            let mut options = merge_options(&config, toggles, output_spec);
            if let Some(raw) = pft_weights {
                options.pft_weights = Some(parse_weights(&raw)?);
            }
            merge_split(&split_path, codec.as_ref(), &options)?;
        }
        Commands::CheckAndFix {
            tile_file,
            tile,
            fix,
            submit,
            sync,
            bucket_path,
            partition,
            nowalltime,
            dry_run,
        } => {
            let tiles = read_tiles(tile_file.as_deref(), &tile)?;
            let store = open_bucket(&config, bucket_path)?;
            let local = LocalSource::new(&config.root, codec.clone());
            let bucket = store
                .as_ref()
                .map(|s| BucketSource::new(s.clone(), codec.clone(), config.retry.clone()));
            let mut sources: Vec<&dyn CompletionSource> = Vec::new();
            sources.push(&local);
            if let Some(b) = &bucket {
                sources.push(b);
            }
            let flags = FixFlags {
                submit,
                sync,
                partition,
                nowalltime,
                dry_run,
            };

            for tile in &tiles {
                let checks = check_tile(&config, tile, &sources);
                println!("{}", render_report(tile, &checks));
                if !fix {
                    continue;
                }
                for check in &checks {
                    let ScenarioCheck::Checked(record) = check else {
                        continue;
                    };
                    if let Err(e) = fix_scenario(&config, codec.as_ref(), store.as_deref(), record, &flags) {
                        println!("[check] {} {}: {}", record.tile, record.scenario, e);
                    }
                }
            }
        }
        Commands::Sync {
            tile,
            scenario,
            local_path,
            trim,
            merge,
            sync,
            all_merged,
            force_merge,
            force,
            dry_run,
            bucket_path,
        } => {
            let store = if sync { open_bucket(&config, bucket_path)? } else { None };
            let request = SyncRequest {
                tile: tile.parse()?,
                scenario: scenario.parse()?,
                root: local_path,
                trim,
                merge,
                push: sync,
                merged_only: all_merged,
                force_merge,
                force,
                dry_run,
            };
            run_sync(
                &request,
                store.as_deref(),
                codec.as_ref(),
                &merge_options(&config, StageToggles::default(), None),
                &config.retry,
            )?;
        }
        Commands::Mosaic { scenario, output } => {
            let scenario: Scenario = scenario.parse()?;
            let out_dir = output.unwrap_or_else(|| default_output_dir(&config.root, &scenario));
            mosaic_scenario(&config.root, &scenario, codec.as_ref(), &out_dir)?;
        }
        Commands::Trim { split_path, dry_run } => {
            let plan = Inventory::scan(&split_path)?.trim_plan();
            if let Some(reference) = plan.reference_batch {
                println!(
                    "[trim] reference batch_{} with {} files",
                    reference, plan.reference_files
                );
            }
            let removed = plan.apply(dry_run)?;
            println!(
                "[trim] {} {} extra output files",
                if dry_run { "would remove" } else { "removed" },
                removed
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    init_tracing("tilemerge");
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}", e);
            ExitCode::FAILURE
        }
    }
}
