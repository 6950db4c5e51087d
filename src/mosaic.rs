//! Regional mosaic of one scenario.
//!
//! Every tile whose split has an `all_merged` directory contributes its
//! canvases. Tiles are placed by their `H`/`V` indices, `H` counting columns
//! and `V` counting rows, so all tiles must share one grid shape. Cells no
//! tile covers hold the disabled fill.

use crate::canvas::{ShardKey, DISABLED_FILL};
use crate::config::{Scenario, TileId};
use crate::grid::{AttrValue, Dataset, GridCodec, GridVar, X_DIM, Y_DIM};
use crate::layout::{TileLayout, MERGE_MANIFEST};
use crate::merge::MergeManifest;
use crate::TileError;
use ndarray::{ArrayD, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MOSAIC_DIR: &str = "mosaic";
pub const MOSAIC_MANIFEST: &str = "mosaic_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedTile {
    pub tile: TileId,
    pub row_offset: usize,
    pub col_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MosaicManifest {
    pub scenario: String,
    pub rows: usize,
    pub cols: usize,
    pub tiles: Vec<PlacedTile>,
    pub variables: Vec<String>,
    /// Tiles left out, with the reason.
    pub skipped: Vec<(TileId, String)>,
}

#[derive(Debug, Clone)]
pub struct MosaicReport {
    pub output_dir: PathBuf,
    pub manifest: MosaicManifest,
}

struct MergedTile {
    tile: TileId,
    merged_dir: PathBuf,
    rows: usize,
    cols: usize,
    h: usize,
    v: usize,
}

/// `{root}/mosaic/{scenario}`
pub fn default_output_dir(root: &Path, scenario: &Scenario) -> PathBuf {
    root.join(MOSAIC_DIR).join(scenario.as_str())
}

/// Tiles under `root` with a merged split for `scenario`, sorted by id.
pub fn merged_tiles(root: &Path, scenario: &Scenario, ext: &'static str) -> Result<Vec<TileId>, TileError> {
    let mut tiles = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type()?.is_dir() || !name.ends_with("_sc") {
            continue;
        }
        let Ok(tile) = name.parse::<TileId>() else {
            debug!(dir = %name, "not a tile directory");
            continue;
        };
        let split = TileLayout::new(root, &tile, ext).split(scenario);
        if split.merge_manifest().is_file() {
            tiles.push(tile);
        }
    }
    tiles.sort();
    Ok(tiles)
}

fn load_tile(root: &Path, tile: &TileId, scenario: &Scenario, ext: &'static str) -> Result<MergedTile, TileError> {
    let split = TileLayout::new(root, tile, ext).split(scenario);
    let manifest: MergeManifest = serde_json::from_slice(&fs::read(split.merged_dir().join(MERGE_MANIFEST))?)?;
    let (h, v) = tile.indices()?;
    Ok(MergedTile {
        tile: tile.clone(),
        merged_dir: split.merged_dir(),
        rows: manifest.tile_rows,
        cols: manifest.tile_cols,
        h,
        v,
    })
}

/// Shard keys of the merged canvases in `dir`, one per variable and resolution.
fn merged_keys(dir: &Path, ext: &str) -> Result<BTreeMap<(String, String), ShardKey>, TileError> {
    let mut keys: BTreeMap<(String, String), ShardKey> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let Some(key) = ShardKey::from_file_name(&name, ext) else {
            continue;
        };
        let slot = (key.var.clone(), key.res.clone());
        if let Some(kept) = keys.get(&slot).filter(|kept| **kept <= key) {
            warn!(kept = %kept, ignored = %key, "several stages for one variable, keeping the first");
            continue;
        }
        keys.insert(slot, key);
    }
    Ok(keys)
}

/// Lead dims and extents of a merged variable; `None` if it does not cover the tile grid.
fn tile_lead(var: &GridVar, rows: usize, cols: usize) -> Option<(Vec<String>, Vec<usize>)> {
    if var.spatial_shape() != Some((rows, cols)) || !var.is_complete() {
        return None;
    }
    Some((var.lead_dims().to_vec(), var.lead_shape().to_vec()))
}

/// Places every merged tile of `scenario` into one regional grid per
/// variable and resolution, written as `{var}_{scenario}_{res}` in `out_dir`.
pub fn mosaic_scenario(
    root: &Path,
    scenario: &Scenario,
    codec: &dyn GridCodec,
    out_dir: &Path,
) -> Result<MosaicReport, TileError> {
    let ids = merged_tiles(root, scenario, codec.extension())?;
    let mut skipped = Vec::new();
    let mut tiles = Vec::new();
    for id in &ids {
        match load_tile(root, id, scenario, codec.extension()) {
            Ok(tile) => tiles.push(tile),
            Err(e) => {
                warn!(tile = %id, error = %e, "merged tile unusable, left out of the mosaic");
                skipped.push((id.clone(), e.to_string()));
            }
        }
    }
    let Some(first) = tiles.first() else {
        return Err(TileError::NoMergedTiles {
            root: root.to_path_buf(),
            scenario: scenario.to_string(),
        });
    };
    let (tile_rows, tile_cols) = (first.rows, first.cols);
    tiles.retain(|t| {
        if (t.rows, t.cols) == (tile_rows, tile_cols) {
            return true;
        }
        warn!(tile = %t.tile, rows = t.rows, cols = t.cols, "tile grid differs from {}x{}", tile_rows, tile_cols);
        skipped.push((t.tile.clone(), format!("{}x{} grid, mosaic uses {}x{}", t.rows, t.cols, tile_rows, tile_cols)));
        false
    });

    let min_h = tiles.iter().map(|t| t.h).min().unwrap_or_default();
    let max_h = tiles.iter().map(|t| t.h).max().unwrap_or_default();
    let min_v = tiles.iter().map(|t| t.v).min().unwrap_or_default();
    let max_v = tiles.iter().map(|t| t.v).max().unwrap_or_default();
    let rows = (max_v - min_v + 1) * tile_rows;
    let cols = (max_h - min_h + 1) * tile_cols;
    let placed: Vec<PlacedTile> = tiles
        .iter()
        .map(|t| PlacedTile {
            tile: t.tile.clone(),
            row_offset: (t.v - min_v) * tile_rows,
            col_offset: (t.h - min_h) * tile_cols,
        })
        .collect();
    println!(
        "[mosaic] {} tiles for {} on a {}x{} grid",
        placed.len(),
        scenario,
        rows,
        cols
    );

    let mut keys: BTreeMap<(String, String), Vec<(usize, ShardKey)>> = BTreeMap::new();
    for (i, tile) in tiles.iter().enumerate() {
        for (slot, key) in merged_keys(&tile.merged_dir, codec.extension())? {
            keys.entry(slot).or_default().push((i, key));
        }
    }

    fs::create_dir_all(out_dir)?;
    let mut variables = Vec::new();
    for ((var_name, res), sources) in &keys {
        let mut region: Option<(Vec<String>, ArrayD<f64>)> = None;
        for (i, key) in sources {
            let tile = &tiles[*i];
            let path = tile.merged_dir.join(codec.file_name(&key.stem()));
            let dataset = codec.read(&path)?;
            let Some(var) = dataset.var(var_name) else {
                warn!(tile = %tile.tile, key = %key, "variable missing from merged file");
                continue;
            };
            let Some((lead_dims, lead_shape)) = tile_lead(var, tile_rows, tile_cols) else {
                warn!(tile = %tile.tile, key = %key, shape = ?var.shape, "merged variable does not cover the tile grid");
                continue;
            };
            let (dims, target) = region.get_or_insert_with(|| {
                let mut shape = lead_shape.clone();
                shape.extend([rows, cols]);
                (lead_dims.clone(), ArrayD::from_elem(IxDyn(&shape), DISABLED_FILL))
            });
            if *dims != lead_dims || target.shape()[..lead_shape.len()] != lead_shape[..] {
                warn!(tile = %tile.tile, key = %key, "lead dims differ from the other tiles");
                continue;
            }

            let mut shape = lead_shape;
            shape.extend([tile_rows, tile_cols]);
            let values = ArrayD::from_shape_vec(IxDyn(&shape), var.data[..var.expected_len()].to_vec())
                .map_err(|e| TileError::codec(&path, e.to_string()))?;
            let nd = shape.len();
            let place = &placed[*i];
            target
                .slice_each_axis_mut(|ax| match ax.axis.index() {
                    a if a == nd - 2 => Slice::from(place.row_offset..place.row_offset + tile_rows),
                    a if a == nd - 1 => Slice::from(place.col_offset..place.col_offset + tile_cols),
                    _ => Slice::from(..),
                })
                .assign(&values);
        }

        let Some((mut dims, data)) = region else {
            continue;
        };
        dims.extend([Y_DIM.to_string(), X_DIM.to_string()]);
        let out = GridVar::from_array(var_name, &dims, &data)
            .with_attr("_FillValue", AttrValue::Number(DISABLED_FILL))
            .with_attr("time_resolution", AttrValue::Text(res.clone()));
        let stem = format!("{}_{}_{}", var_name, scenario, res);
        codec.write(&out_dir.join(codec.file_name(&stem)), &Dataset::new().with_var(out))?;
        info!(variable = %stem, tiles = sources.len(), "mosaic written");
        variables.push(stem);
    }

    let manifest = MosaicManifest {
        scenario: scenario.to_string(),
        rows,
        cols,
        tiles: placed,
        variables,
        skipped,
    };
    fs::write(out_dir.join(MOSAIC_MANIFEST), serde_json::to_string_pretty(&manifest)?)?;
    println!(
        "[mosaic] wrote {} variables to {}",
        manifest.variables.len(),
        out_dir.display()
    );
    Ok(MosaicReport {
        output_dir: out_dir.to_path_buf(),
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BinCodec;

    #[test]
    fn several_stages_keep_the_first_key() {
        let dir = tempfile::tempdir().unwrap();
        let var = GridVar::new("GPP", &["y", "x"], &[1, 1], vec![1.0]).unwrap();
        for stem in ["GPP_yearly_tr", "GPP_yearly_sc", "GPP_monthly_tr"] {
            BinCodec
                .write(&dir.path().join(format!("{}.grid", stem)), &Dataset::new().with_var(var.clone()))
                .unwrap();
        }
        fs::write(dir.path().join("run_status.grid"), b"").unwrap();
        let keys = merged_keys(dir.path(), "grid").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[&("GPP".to_string(), "yearly".to_string())].stage, "sc");
        assert_eq!(keys[&("GPP".to_string(), "monthly".to_string())].stage, "tr");
    }

    #[test]
    fn partial_variable_does_not_cover_the_grid() {
        let mut var = GridVar::new("GPP", &["time", "y", "x"], &[2, 2, 2], vec![0.0; 8]).unwrap();
        assert_eq!(tile_lead(&var, 2, 2), Some((vec!["time".to_string()], vec![2])));
        assert_eq!(tile_lead(&var, 3, 2), None);
        var.data.truncate(5);
        assert_eq!(tile_lead(&var, 2, 2), None);
    }
}
