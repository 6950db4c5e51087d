use crate::grid::{AttrValue, GridVar, X_DIM, Y_DIM};
use crate::mask::{PixelCoord, RunMask, STATUS_FILL};
use crate::TileError;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use std::fmt;

/// Value written to cells the run mask disables.
pub const DISABLED_FILL: f64 = STATUS_FILL;

const TIME_RESOLUTIONS: [&str; 3] = ["yearly", "monthly", "daily"];

/// `{VAR}_{res}_{stage}`, the stem shared by a variable's shard in every batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub var: String,
    pub res: String,
    pub stage: String,
}

impl ShardKey {
    pub fn parse(stem: &str) -> Option<Self> {
        let (rest, stage) = stem.rsplit_once('_')?;
        let (var, res) = rest.rsplit_once('_')?;
        if var.is_empty() || stage.is_empty() || !TIME_RESOLUTIONS.contains(&res) {
            return None;
        }
        Some(Self {
            var: var.to_string(),
            res: res.to_string(),
            stage: stage.to_string(),
        })
    }

    /// Parses a file name carrying the given extension.
    pub fn from_file_name(name: &str, ext: &str) -> Option<Self> {
        let stem = name.strip_suffix(ext)?.strip_suffix('.')?;
        Self::parse(stem)
    }

    pub fn stem(&self) -> String {
        format!("{}_{}_{}", self.var, self.res, self.stage)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Disabled,
    Missing,
    Populated,
}

/// Tile-shaped array for one variable: lead dims then `(y, x)`.
#[derive(Debug, Clone)]
pub struct Canvas {
    pub key: ShardKey,
    pub lead_dims: Vec<String>,
    pub data: ArrayD<f64>,
    cells: Array2<CellState>,
}

impl Canvas {
    /// Enabled cells start missing (NaN), the rest disabled.
    pub fn new(key: ShardKey, lead_dims: Vec<String>, lead_shape: &[usize], enabled: &RunMask) -> Self {
        let (rows, cols) = (enabled.rows(), enabled.cols());
        let cells = Array2::from_shape_fn((rows, cols), |(r, c)| {
            if enabled.is_enabled(PixelCoord::new(r, c)) {
                CellState::Missing
            } else {
                CellState::Disabled
            }
        });
        let mut shape = lead_shape.to_vec();
        shape.extend([rows, cols]);
        let mut canvas = Self {
            key,
            lead_dims,
            data: ArrayD::from_elem(IxDyn(&shape), f64::NAN),
            cells,
        };
        canvas.reapply_fills();
        canvas
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn cols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn lead_shape(&self) -> Vec<usize> {
        let shape = self.data.shape();
        shape[..shape.len() - 2].to_vec()
    }

    pub fn lead_len(&self) -> usize {
        self.lead_shape().iter().product()
    }

    pub fn cell(&self, pixel: PixelCoord) -> Option<CellState> {
        self.cells.get((pixel.row, pixel.col)).copied()
    }

    pub fn populated_count(&self) -> usize {
        self.cells.iter().filter(|c| **c == CellState::Populated).count()
    }

    /// Writes one pixel's series. Each enabled cell may be written once.
    pub fn populate(&mut self, pixel: PixelCoord, series: &[f64]) -> Result<(), TileError> {
        match self.cell(pixel) {
            Some(CellState::Missing) => {}
            Some(state) => {
                return Err(TileError::Other(format!(
                    "{}: cell {} cannot be populated from state {:?}",
                    self.key, pixel, state
                )));
            }
            None => {
                return Err(TileError::Other(format!("{}: cell {} is outside the canvas", self.key, pixel)));
            }
        }
        if series.len() != self.lead_len() {
            return Err(TileError::Other(format!(
                "{}: series for {} has {} values, canvas expects {}",
                self.key,
                pixel,
                series.len(),
                self.lead_len()
            )));
        }

        let nd = self.data.ndim();
        let mut column = self.data.index_axis_mut(Axis(nd - 1), pixel.col);
        let mut lane = column.index_axis_mut(Axis(nd - 2), pixel.row);
        for (dst, src) in lane.iter_mut().zip(series) {
            *dst = *src;
        }
        self.cells[(pixel.row, pixel.col)] = CellState::Populated;
        Ok(())
    }

    pub fn series(&self, pixel: PixelCoord) -> Vec<f64> {
        let nd = self.data.ndim();
        let column = self.data.index_axis(Axis(nd - 1), pixel.col);
        column.index_axis(Axis(nd - 2), pixel.row).iter().copied().collect()
    }

    /// Disabled cells get the fill value and missing cells NaN, whatever the
    /// data currently holds.
    pub fn reapply_fills(&mut self) {
        let nd = self.data.ndim();
        for ((row, col), state) in self.cells.indexed_iter() {
            let value = match state {
                CellState::Populated => continue,
                CellState::Disabled => DISABLED_FILL,
                CellState::Missing => f64::NAN,
            };
            let mut column = self.data.index_axis_mut(Axis(nd - 1), col);
            column.index_axis_mut(Axis(nd - 2), row).fill(value);
        }
    }

    /// Replaces the data array after a reduction; spatial extent must not change.
    pub fn replace_data(&mut self, lead_dims: Vec<String>, data: ArrayD<f64>) -> Result<(), TileError> {
        let shape = data.shape();
        if shape.len() != lead_dims.len() + 2
            || shape[shape.len() - 2] != self.rows()
            || shape[shape.len() - 1] != self.cols()
        {
            return Err(TileError::Other(format!(
                "{}: reduced shape {:?} does not keep the {}x{} grid",
                self.key,
                shape,
                self.rows(),
                self.cols()
            )));
        }
        self.lead_dims = lead_dims;
        self.data = data;
        self.reapply_fills();
        Ok(())
    }

    pub fn to_grid_var(&self) -> GridVar {
        let mut dims = self.lead_dims.clone();
        dims.push(Y_DIM.to_string());
        dims.push(X_DIM.to_string());
        GridVar::from_array(&self.key.var, &dims, &self.data)
            .with_attr("_FillValue", AttrValue::Number(DISABLED_FILL))
            .with_attr("time_resolution", AttrValue::Text(self.key.res.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ShardKey {
        ShardKey::parse("GPP_monthly_tr").unwrap()
    }

    #[test]
    fn shard_keys_split_from_the_right() {
        let k = ShardKey::parse("LAYER_DZ_yearly_sc").unwrap();
        assert_eq!(k.var, "LAYER_DZ");
        assert_eq!(k.res, "yearly");
        assert_eq!(k.stage, "sc");
        assert!(ShardKey::parse("run_status").is_none());
        assert!(ShardKey::parse("restart-tr").is_none());
        assert_eq!(ShardKey::from_file_name("RH_monthly_tr.nc", "nc").unwrap().var, "RH");
        assert!(ShardKey::from_file_name("RH_monthly_tr.nc", "grid").is_none());
    }

    #[test]
    fn fresh_canvas_holds_fills() {
        let mask = RunMask::from_pixels(2, 2, [PixelCoord::new(0, 1)]);
        let canvas = Canvas::new(key(), vec!["time".into()], &[3], &mask);
        assert_eq!(canvas.data.shape(), &[3, 2, 2]);
        assert!(canvas.series(PixelCoord::new(0, 1)).iter().all(|v| v.is_nan()));
        assert!(canvas.series(PixelCoord::new(1, 1)).iter().all(|v| *v == DISABLED_FILL));
    }

    #[test]
    fn populate_writes_once_and_only_enabled_cells() {
        let mask = RunMask::from_pixels(2, 2, [PixelCoord::new(1, 0)]);
        let mut canvas = Canvas::new(key(), vec!["time".into()], &[2], &mask);
        canvas.populate(PixelCoord::new(1, 0), &[1.5, 2.5]).unwrap();
        assert_eq!(canvas.series(PixelCoord::new(1, 0)), vec![1.5, 2.5]);
        assert_eq!(canvas.data[[1, 1, 0]], 2.5);

        assert!(canvas.populate(PixelCoord::new(1, 0), &[0.0, 0.0]).is_err());
        assert!(canvas.populate(PixelCoord::new(0, 0), &[0.0, 0.0]).is_err());
        assert!(canvas.populate(PixelCoord::new(5, 5), &[0.0, 0.0]).is_err());
        assert_eq!(canvas.populated_count(), 1);
    }
}
