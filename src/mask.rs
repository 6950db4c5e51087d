use crate::grid::{AttrValue, Dataset, GridCodec, GridVar, X_DIM, Y_DIM};
use crate::TileError;
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const RUN_VAR: &str = "run";
pub const STATUS_VAR: &str = "run_status";
pub const ROW_OFFSET_ATTR: &str = "row_offset";
pub const COL_OFFSET_ATTR: &str = "col_offset";

pub const STATUS_COMPLETE: f64 = 100.0;
pub const STATUS_MASKED: f64 = 0.0;
pub const STATUS_FAILED: f64 = -100.0;
pub const STATUS_TIMEOUT: f64 = -5.0;
pub const STATUS_FILL: f64 = -9999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelCoord {
    pub row: usize,
    pub col: usize,
}

impl PixelCoord {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn offset(self, rows: usize, cols: usize) -> Self {
        Self::new(self.row + rows, self.col + cols)
    }
}

impl fmt::Display for PixelCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Per-pixel enabled flags, stored row-major in a bitset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMask {
    rows: usize,
    cols: usize,
    bits: FixedBitSet,
}

impl RunMask {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            bits: FixedBitSet::with_capacity(rows * cols),
        }
    }

    pub fn from_pixels(rows: usize, cols: usize, pixels: impl IntoIterator<Item = PixelCoord>) -> Self {
        let mut mask = Self::new(rows, cols);
        for p in pixels {
            mask.set(p, true);
        }
        mask
    }

    /// A cell is enabled when its value is exactly 1.
    pub fn from_values(rows: usize, cols: usize, values: &[f64]) -> Self {
        let mut mask = Self::new(rows, cols);
        for (i, v) in values.iter().take(rows * cols).enumerate() {
            if *v == 1.0 {
                mask.bits.insert(i);
            }
        }
        mask
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn contains(&self, p: PixelCoord) -> bool {
        p.row < self.rows && p.col < self.cols
    }

    pub fn is_enabled(&self, p: PixelCoord) -> bool {
        self.contains(p) && self.bits.contains(p.row * self.cols + p.col)
    }

    pub fn set(&mut self, p: PixelCoord, enabled: bool) {
        if self.contains(p) {
            self.bits.set(p.row * self.cols + p.col, enabled);
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.bits.count_ones(..)
    }

    /// Enabled pixels in row-major order.
    pub fn enabled(&self) -> impl Iterator<Item = PixelCoord> + '_ {
        let cols = self.cols.max(1);
        self.bits.ones().map(move |i| PixelCoord::new(i / cols, i % cols))
    }

    pub fn to_values(&self) -> Vec<f64> {
        (0..self.rows * self.cols)
            .map(|i| if self.bits.contains(i) { 1.0 } else { 0.0 })
            .collect()
    }

    pub fn to_var(&self) -> GridVar {
        GridVar {
            name: RUN_VAR.to_string(),
            dims: vec![Y_DIM.to_string(), X_DIM.to_string()],
            shape: vec![self.rows, self.cols],
            data: self.to_values(),
            attrs: Default::default(),
        }
    }

    pub fn from_dataset(ds: &Dataset, path: &Path) -> Result<Self, TileError> {
        let var = ds.require_var(RUN_VAR, path)?;
        let (rows, cols) = var
            .spatial_shape()
            .ok_or_else(|| TileError::codec(path, "run mask is not a (y, x) grid"))?;
        Ok(Self::from_values(rows, cols, &var.data))
    }

    pub fn read(codec: &dyn GridCodec, path: &Path) -> Result<Self, TileError> {
        Self::from_dataset(&codec.read(path)?, path)
    }
}

/// A batch's run mask together with where it sits inside the tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskWindow {
    pub row_offset: usize,
    pub col_offset: usize,
    pub mask: RunMask,
}

impl MaskWindow {
    pub fn read(codec: &dyn GridCodec, path: &Path) -> Result<Self, TileError> {
        let ds = codec.read(path)?;
        let var = ds.require_var(RUN_VAR, path)?;
        let row_offset = var.attr_number(ROW_OFFSET_ATTR).unwrap_or(0.0).max(0.0) as usize;
        let col_offset = var.attr_number(COL_OFFSET_ATTR).unwrap_or(0.0).max(0.0) as usize;
        Ok(Self {
            row_offset,
            col_offset,
            mask: RunMask::from_dataset(&ds, path)?,
        })
    }

    pub fn to_tile(&self, local: PixelCoord) -> PixelCoord {
        local.offset(self.row_offset, self.col_offset)
    }

    pub fn to_local(&self, tile: PixelCoord) -> Option<PixelCoord> {
        let row = tile.row.checked_sub(self.row_offset)?;
        let col = tile.col.checked_sub(self.col_offset)?;
        let local = PixelCoord::new(row, col);
        self.mask.contains(local).then_some(local)
    }

    /// The same window with only `pixels` enabled.
    pub fn restricted_to(&self, pixels: &[PixelCoord]) -> Self {
        let mut mask = RunMask::new(self.mask.rows(), self.mask.cols());
        for p in pixels {
            if self.mask.is_enabled(*p) {
                mask.set(*p, true);
            }
        }
        Self {
            row_offset: self.row_offset,
            col_offset: self.col_offset,
            mask,
        }
    }

    pub fn to_dataset(&self) -> Dataset {
        let var = self
            .mask
            .to_var()
            .with_attr(ROW_OFFSET_ATTR, AttrValue::Number(self.row_offset as f64))
            .with_attr(COL_OFFSET_ATTR, AttrValue::Number(self.col_offset as f64));
        Dataset::new().with_var(var)
    }
}

/// Per-pixel run status codes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    rows: usize,
    cols: usize,
    codes: Vec<f64>,
}

impl RunStatus {
    pub fn filled(rows: usize, cols: usize) -> Self {
        Self::uniform(rows, cols, STATUS_FILL)
    }

    pub fn uniform(rows: usize, cols: usize, code: f64) -> Self {
        Self {
            rows,
            cols,
            codes: vec![code; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, p: PixelCoord) -> Option<f64> {
        if p.row < self.rows && p.col < self.cols {
            self.codes.get(p.row * self.cols + p.col).copied()
        } else {
            None
        }
    }

    pub fn set(&mut self, p: PixelCoord, code: f64) {
        if p.row < self.rows && p.col < self.cols {
            self.codes[p.row * self.cols + p.col] = code;
        }
    }

    /// NaN and every code other than 100 count as not complete.
    pub fn is_complete(&self, p: PixelCoord) -> bool {
        self.get(p) == Some(STATUS_COMPLETE)
    }

    pub fn complete_count(&self, mask: &RunMask) -> usize {
        mask.enabled().filter(|p| self.is_complete(*p)).count()
    }

    pub fn from_dataset(ds: &Dataset, path: &Path) -> Result<Self, TileError> {
        let var = ds.require_var(STATUS_VAR, path)?;
        let (rows, cols) = var
            .spatial_shape()
            .ok_or_else(|| TileError::codec(path, "run status is not a (y, x) grid"))?;
        let mut codes = var.data.clone();
        codes.resize(rows * cols, f64::NAN);
        Ok(Self { rows, cols, codes })
    }

    pub fn read(codec: &dyn GridCodec, path: &Path) -> Result<Self, TileError> {
        Self::from_dataset(&codec.read(path)?, path)
    }

    pub fn to_dataset(&self) -> Dataset {
        Dataset::new().with_var(GridVar {
            name: STATUS_VAR.to_string(),
            dims: vec![Y_DIM.to_string(), X_DIM.to_string()],
            shape: vec![self.rows, self.cols],
            data: self.codes.clone(),
            attrs: Default::default(),
        })
    }

    pub fn write(&self, codec: &dyn GridCodec, path: &Path) -> Result<(), TileError> {
        codec.write(path, &self.to_dataset())
    }
}
