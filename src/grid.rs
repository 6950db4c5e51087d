//! Codec-neutral gridded datasets.
//!
//! Every file the pipeline touches (run masks, run status, output shards,
//! merged canvases) is a small set of named `f64` variables laid out in
//! row-major order over named dimensions, with the two spatial dimensions
//! `y` and `x` always last. A [`GridCodec`] moves a [`Dataset`] to and from
//! disk; the built-in [`BinCodec`] is a bincode container and the NetCDF
//! codec is available behind the `netcdf` feature.

use crate::TileError;
use bincode::{Decode, Encode};
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub const Y_DIM: &str = "y";
pub const X_DIM: &str = "x";

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

/// Dimension names compare without regard to case.
pub fn is_dim(name: &str, dim: &str) -> bool {
    name.eq_ignore_ascii_case(dim)
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct GridVar {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    /// Row-major values. May be shorter than `shape` implies when the
    /// producer stopped writing part way through.
    pub data: Vec<f64>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl GridVar {
    pub fn new(name: &str, dims: &[&str], shape: &[usize], data: Vec<f64>) -> Result<Self, TileError> {
        if dims.len() != shape.len() {
            return Err(TileError::Other(format!(
                "variable {} has {} dims but {} extents",
                name,
                dims.len(),
                shape.len()
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TileError::Other(format!(
                "variable {} expects {} values, got {}",
                name,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape: shape.to_vec(),
            data,
            attrs: BTreeMap::new(),
        })
    }

    pub fn filled(name: &str, dims: &[&str], shape: &[usize], value: f64) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape: shape.to_vec(),
            data: vec![value; len],
            attrs: BTreeMap::new(),
        }
    }

    pub fn from_array(name: &str, dims: &[String], array: &ArrayD<f64>) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.to_vec(),
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn attr_number(&self, key: &str) -> Option<f64> {
        match self.attrs.get(key) {
            Some(AttrValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len()
    }

    /// Extent of the trailing `(y, x)` dimensions. The engine writes `Y`/`X`,
    /// so the names match in either case.
    pub fn spatial_shape(&self) -> Option<(usize, usize)> {
        let n = self.dims.len();
        if n < 2 || self.shape.len() != n {
            return None;
        }
        if !is_dim(&self.dims[n - 2], Y_DIM) || !is_dim(&self.dims[n - 1], X_DIM) {
            return None;
        }
        Some((self.shape[n - 2], self.shape[n - 1]))
    }

    pub fn lead_dims(&self) -> &[String] {
        &self.dims[..self.dims.len().saturating_sub(2)]
    }

    pub fn lead_shape(&self) -> &[usize] {
        &self.shape[..self.shape.len().saturating_sub(2)]
    }

    pub fn to_array(&self) -> Result<ArrayD<f64>, TileError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
            .map_err(|e| TileError::Other(format!("variable {}: {}", self.name, e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct Dataset {
    pub vars: Vec<GridVar>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, var: GridVar) -> Self {
        self.push(var);
        self
    }

    /// Adds a variable, replacing any existing one with the same name.
    pub fn push(&mut self, var: GridVar) {
        if let Some(existing) = self.vars.iter_mut().find(|v| v.name == var.name) {
            *existing = var;
        } else {
            self.vars.push(var);
        }
    }

    pub fn var(&self, name: &str) -> Option<&GridVar> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut GridVar> {
        self.vars.iter_mut().find(|v| v.name == name)
    }

    pub fn require_var(&self, name: &str, path: &Path) -> Result<&GridVar, TileError> {
        self.var(name)
            .ok_or_else(|| TileError::codec(path, format!("variable '{}' not present", name)))
    }
}

pub trait GridCodec: Send + Sync {
    /// File extension, without the dot.
    fn extension(&self) -> &'static str;

    fn read(&self, path: &Path) -> Result<Dataset, TileError>;

    fn write(&self, path: &Path, dataset: &Dataset) -> Result<(), TileError>;

    fn file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.extension())
    }
}

const GRID_MAGIC: &[u8; 4] = b"TMG1";

/// Bincode container: a four byte magic followed by the encoded [`Dataset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinCodec;

impl GridCodec for BinCodec {
    fn extension(&self) -> &'static str {
        "grid"
    }

    fn read(&self, path: &Path) -> Result<Dataset, TileError> {
        let bytes = fs::read(path)?;
        if bytes.len() < GRID_MAGIC.len() || &bytes[..GRID_MAGIC.len()] != GRID_MAGIC {
            return Err(TileError::codec(path, "missing grid header"));
        }
        let (dataset, _): (Dataset, usize) =
            bincode::decode_from_slice(&bytes[GRID_MAGIC.len()..], bincode::config::standard())
                .map_err(|e| TileError::codec(path, e.to_string()))?;
        if let Some(var) = dataset.vars.iter().find(|v| v.dims.len() != v.shape.len()) {
            return Err(TileError::codec(
                path,
                format!("variable '{}' has {} dims but {} extents", var.name, var.dims.len(), var.shape.len()),
            ));
        }
        Ok(dataset)
    }

    fn write(&self, path: &Path, dataset: &Dataset) -> Result<(), TileError> {
        let mut bytes = GRID_MAGIC.to_vec();
        bytes.extend(bincode::encode_to_vec(dataset, bincode::config::standard())?);
        fs::write(path, bytes)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Grid,
    NetCdf,
}

impl Default for CodecKind {
    fn default() -> Self {
        if cfg!(feature = "netcdf") {
            CodecKind::NetCdf
        } else {
            CodecKind::Grid
        }
    }
}

impl FromStr for CodecKind {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" | "bin" => Ok(CodecKind::Grid),
            "nc" | "netcdf" => Ok(CodecKind::NetCdf),
            other => Err(TileError::Config(format!("unknown grid codec '{}'", other))),
        }
    }
}

pub fn codec_for(kind: CodecKind) -> Result<Arc<dyn GridCodec>, TileError> {
    match kind {
        CodecKind::Grid => Ok(Arc::new(BinCodec)),
        #[cfg(feature = "netcdf")]
        CodecKind::NetCdf => Ok(Arc::new(crate::netcdf_codec::NetCdfCodec)),
        #[cfg(not(feature = "netcdf"))]
        CodecKind::NetCdf => Err(TileError::Config(
            "NetCDF support was not compiled in; rebuild with --features netcdf".to_string(),
        )),
    }
}
