use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tilemerge::canvas::{Canvas, ShardKey};
use tilemerge::config::{Scenario, TileId};
use tilemerge::grid::{BinCodec, Dataset, GridCodec, GridVar};
use tilemerge::layout::TileLayout;
use tilemerge::mask::{MaskWindow, PixelCoord, RunMask, RunStatus, STATUS_COMPLETE};
use tilemerge::merge::{merge_split, MergeOptions};

const MONTHS: usize = 120;
const BATCHES: usize = 10;

/// Writes a `size x size` tile split into horizontal bands, one monthly shard
/// per variable per batch.
fn write_tile(root: &Path, size: usize, vars: &[&str]) -> std::path::PathBuf {
    let tile: TileId = "H10_V15".parse().unwrap();
    let scenario: Scenario = "ssp1_2_6_mri_esm2_0".parse().unwrap();
    let layout = TileLayout::new(root, &tile, BinCodec.extension());
    let split = layout.split(&scenario);

    let pixels = (0..size).flat_map(|r| (0..size).map(move |c| PixelCoord::new(r, c)));
    let tile_mask = RunMask::from_pixels(size, size, pixels);
    let mask_path = layout.tile_mask(&scenario);
    fs::create_dir_all(mask_path.parent().unwrap()).unwrap();
    BinCodec.write(&mask_path, &Dataset::new().with_var(tile_mask.to_var())).unwrap();

    let band = size / BATCHES;
    for n in 0..BATCHES {
        let window = MaskWindow {
            row_offset: n * band,
            col_offset: 0,
            mask: RunMask::from_pixels(band, size, (0..band).flat_map(|r| (0..size).map(move |c| PixelCoord::new(r, c)))),
        };
        fs::create_dir_all(split.batch_mask(n).parent().unwrap()).unwrap();
        fs::create_dir_all(split.batch_output(n)).unwrap();
        BinCodec.write(&split.batch_mask(n), &window.to_dataset()).unwrap();
        RunStatus::uniform(band, size, STATUS_COMPLETE)
            .write(&BinCodec, &split.batch_status(n))
            .unwrap();
        for var in vars {
            let data: Vec<f64> = (0..MONTHS * band * size).map(|i| i as f64 * 0.01).collect();
            let grid = GridVar::new(var, &["time", "y", "x"], &[MONTHS, band, size], data).unwrap();
            let path = split.batch_output(n).join(format!("{}_monthly_tr.grid", var));
            BinCodec.write(&path, &Dataset::new().with_var(grid)).unwrap();
        }
    }
    split.dir().to_path_buf()
}

fn bench_merge_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_split");
    group.sample_size(10);

    for size in [20, 50, 100] {
        let dir = TempDir::new().unwrap();
        let split = write_tile(dir.path(), size, &["GPP", "NPP", "RH"]);
        let options = MergeOptions::default();
        group.bench_with_input(BenchmarkId::new("tile", size), &split, |b, split| {
            b.iter(|| merge_split(black_box(split), &BinCodec, &options).unwrap());
        });
    }
    group.finish();
}

fn bench_canvas_populate(c: &mut Criterion) {
    let size = 100;
    let key = ShardKey::parse("GPP_monthly_tr").unwrap();
    let enabled = RunMask::from_pixels(size, size, (0..size).flat_map(|r| (0..size).map(move |c| PixelCoord::new(r, c))));
    let series: Vec<f64> = (0..MONTHS).map(|t| t as f64 * 0.5).collect();

    c.bench_function("canvas_populate_100x100", |b| {
        b.iter(|| {
            let mut canvas = Canvas::new(key.clone(), vec!["time".to_string()], &[MONTHS], &enabled);
            for pixel in enabled.enabled() {
                canvas.populate(pixel, black_box(&series)).unwrap();
            }
            canvas.to_grid_var()
        });
    });
}

criterion_group!(benches, bench_merge_split, bench_canvas_populate);
criterion_main!(benches);
