mod common;

use common::TileFixture;
use std::fs;
use tilemerge::backoff::RetryPolicy;
use tilemerge::completion::scan_local;
use tilemerge::grid::BinCodec;
use tilemerge::merge::MergeOptions;
use tilemerge::store::{walk, DirObjectStore, ObjectStore};
use tilemerge::sync::{pull_scenario, run_sync, SyncRequest};
use tilemerge::TileError;

fn quick() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_backoff_ms: 1,
    }
}

fn request(fixture: &TileFixture) -> SyncRequest {
    SyncRequest {
        tile: fixture.tile.clone(),
        scenario: fixture.scenario.clone(),
        root: fixture.root().to_path_buf(),
        trim: false,
        merge: false,
        push: false,
        merged_only: false,
        force_merge: false,
        force: false,
        dry_run: false,
    }
}

/// Four complete batches, batch_0 carrying one shard no other batch has.
fn untrimmed_tile() -> TileFixture {
    let fixture = TileFixture::new(8, 6);
    let windows = fixture.build_bands(4, |_| true);
    fixture.write_monthly_shard(0, "NPP", &windows[0]);
    fixture
}

#[test]
fn test_trim_merge_and_push_merged_outputs() -> Result<(), TileError> {
    let fixture = untrimmed_tile();
    let bucket_dir = tempfile::tempdir().unwrap();
    let store = DirObjectStore::new(bucket_dir.path());
    let split = fixture.split();

    let first = SyncRequest {
        trim: true,
        merge: true,
        push: true,
        merged_only: true,
        ..request(&fixture)
    };
    let report = run_sync(&first, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert_eq!(report.trimmed, 1);
    assert!(!split.batch_output(0).join("NPP_monthly_tr.grid").exists());
    assert!(report.merge.is_some());

    let merged_files = walk(&split.merged_dir())?.len();
    let push = report.push.unwrap();
    assert_eq!(push.transferred, merged_files);
    assert_eq!(push.deleted, 0);
    let remote = store.list("H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/")?;
    assert_eq!(remote.len(), merged_files);
    assert!(bucket_dir
        .path()
        .join("H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/run_status.grid")
        .is_file());

    // Already merged and already pushed: nothing to do.
    let again = SyncRequest {
        trim: false,
        ..first.clone()
    };
    let report = run_sync(&again, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert!(report.merge.is_none());
    let push = report.push.unwrap();
    assert_eq!(push.transferred, 0);
    assert_eq!(push.skipped, merged_files);

    let forced = SyncRequest {
        force_merge: true,
        push: false,
        ..again
    };
    let report = run_sync(&forced, None, &BinCodec, &MergeOptions::default(), &quick())?;
    assert!(report.merge.is_some());
    Ok(())
}

#[test]
fn test_dry_run_changes_nothing_locally_or_remotely() -> Result<(), TileError> {
    let fixture = untrimmed_tile();
    let bucket_dir = tempfile::tempdir().unwrap();
    let store = DirObjectStore::new(bucket_dir.path());
    let split = fixture.split();

    let dry = SyncRequest {
        trim: true,
        merge: true,
        push: true,
        dry_run: true,
        ..request(&fixture)
    };
    let report = run_sync(&dry, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert_eq!(report.trimmed, 1);
    assert!(split.batch_output(0).join("NPP_monthly_tr.grid").exists());
    assert!(report.merge.is_none());
    assert!(!split.merged_dir().exists());
    assert_eq!(report.push.unwrap().transferred, 0);
    assert!(store.list("H10_V15/")?.is_empty());
    Ok(())
}

#[test]
fn test_differing_remote_file_needs_force() -> Result<(), TileError> {
    let fixture = TileFixture::new(8, 6);
    fixture.build_bands(4, |_| true);
    let bucket_dir = tempfile::tempdir().unwrap();
    let store = DirObjectStore::new(bucket_dir.path());
    let stale_key = "H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/run_status.grid";
    store.put(stale_key, b"stale".to_vec())?;
    store.put("H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/OLD_monthly_tr.grid", b"old".to_vec())?;

    let push = SyncRequest {
        merge: true,
        push: true,
        merged_only: true,
        ..request(&fixture)
    };
    match run_sync(&push, Some(&store), &BinCodec, &MergeOptions::default(), &quick()) {
        Err(TileError::SyncConflict { conflicts }) => assert_eq!(conflicts, vec![stale_key.to_string()]),
        other => panic!("expected a sync conflict, got {:?}", other),
    }
    assert_eq!(store.get(stale_key)?, b"stale".to_vec());

    let forced = SyncRequest { force: true, ..push };
    let report = run_sync(&forced, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert_eq!(report.push.unwrap().deleted, 1);
    assert_ne!(store.get(stale_key)?, b"stale".to_vec());
    assert!(store
        .list("H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/")?
        .iter()
        .all(|m| !m.key.ends_with("OLD_monthly_tr.grid")));
    Ok(())
}

#[test]
fn test_pulled_split_scans_like_the_original() -> Result<(), TileError> {
    let fixture = TileFixture::new(8, 6);
    fixture.build_bands(4, |p| p.row > 0);
    let bucket_dir = tempfile::tempdir().unwrap();
    let store = DirObjectStore::new(bucket_dir.path());

    let push = SyncRequest {
        push: true,
        ..request(&fixture)
    };
    run_sync(&push, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    let mask = fs::read(fixture.tile_layout().tile_mask(&fixture.scenario))?;
    store.put("H10_V15/ssp2_4_5_mri_esm2_0/run-mask.grid", mask)?;

    let elsewhere = tempfile::tempdir().unwrap();
    let pulled = pull_scenario(
        &store,
        &quick(),
        elsewhere.path(),
        &fixture.tile,
        &fixture.scenario,
        "grid",
        false,
    )?;
    assert!(pulled.transferred > 8);

    let original = scan_local(&fixture.split(), &BinCodec)?.counts();
    let copy_layout = tilemerge::layout::TileLayout::new(elsewhere.path(), &fixture.tile, "grid");
    assert!(copy_layout.tile_mask(&fixture.scenario).is_file());
    let copy = scan_local(&copy_layout.split(&fixture.scenario), &BinCodec)?.counts();
    assert_eq!(copy, original);
    assert_eq!((copy.completed, copy.enabled), (42, 48));
    Ok(())
}

#[test]
fn test_forced_push_replaces_same_size_remote_files() -> Result<(), TileError> {
    let fixture = TileFixture::new(8, 6);
    fixture.build_bands(4, |_| true);
    let bucket_dir = tempfile::tempdir().unwrap();
    let store = DirObjectStore::new(bucket_dir.path());
    let split = fixture.split();

    let push = SyncRequest {
        merge: true,
        push: true,
        merged_only: true,
        ..request(&fixture)
    };
    run_sync(&push, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    let key = "H10_V15/ssp2_4_5_mri_esm2_0_split/all_merged/GPP_monthly_tr.grid";
    let local = fs::read(split.merged_dir().join("GPP_monthly_tr.grid"))?;
    let stale = vec![0u8; local.len()];
    store.put(key, stale.clone())?;

    run_sync(&push, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert_eq!(store.get(key)?, stale);

    let forced = SyncRequest {
        force_merge: true,
        force: true,
        ..push
    };
    let report = run_sync(&forced, Some(&store), &BinCodec, &MergeOptions::default(), &quick())?;
    assert!(report.merge.is_some());
    assert_eq!(report.push.unwrap().transferred, walk(&split.merged_dir())?.len());
    assert_eq!(store.get(key)?, local);
    Ok(())
}
