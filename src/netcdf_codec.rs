use crate::grid::{AttrValue, Dataset, GridCodec, GridVar};
use crate::TileError;
use std::collections::BTreeMap;
use std::path::Path;

/// Reads and writes `.nc` files through libnetcdf. Every variable is
/// converted to `f64` on read.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetCdfCodec;

fn nc_err(path: &Path, e: netcdf::error::Error) -> TileError {
    TileError::codec(path, e.to_string())
}

fn convert_attr(value: netcdf::AttrValue) -> Option<AttrValue> {
    use netcdf::AttrValue as Nc;
    match value {
        Nc::Double(v) => Some(AttrValue::Number(v)),
        Nc::Float(v) => Some(AttrValue::Number(v as f64)),
        Nc::Int(v) => Some(AttrValue::Number(v as f64)),
        Nc::Short(v) => Some(AttrValue::Number(v as f64)),
        Nc::Longlong(v) => Some(AttrValue::Number(v as f64)),
        Nc::Str(s) => Some(AttrValue::Text(s)),
        _ => None,
    }
}

impl GridCodec for NetCdfCodec {
    fn extension(&self) -> &'static str {
        "nc"
    }

    fn read(&self, path: &Path) -> Result<Dataset, TileError> {
        let file = netcdf::open(path).map_err(|e| nc_err(path, e))?;
        let mut dataset = Dataset::new();

        for attr in file.attributes() {
            if let Some(value) = attr.value().ok().and_then(convert_attr) {
                dataset.attrs.insert(attr.name().to_string(), value);
            }
        }

        for var in file.variables() {
            let dims: Vec<String> = var.dimensions().iter().map(|d| d.name().to_string()).collect();
            let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
            let len: usize = shape.iter().product();
            let mut data = vec![0.0f64; len];
            if len > 0 {
                var.values_to(&mut data, None, None).map_err(|e| nc_err(path, e))?;
            }

            let mut attrs = BTreeMap::new();
            for attr in var.attributes() {
                if let Some(value) = attr.value().ok().and_then(convert_attr) {
                    attrs.insert(attr.name().to_string(), value);
                }
            }

            dataset.vars.push(GridVar {
                name: var.name().to_string(),
                dims,
                shape,
                data,
                attrs,
            });
        }

        Ok(dataset)
    }

    fn write(&self, path: &Path, dataset: &Dataset) -> Result<(), TileError> {
        let mut file = netcdf::create(path).map_err(|e| nc_err(path, e))?;
        let mut defined: BTreeMap<String, usize> = BTreeMap::new();

        for (key, value) in &dataset.attrs {
            match value {
                AttrValue::Number(v) => file.add_attribute(key, *v),
                AttrValue::Text(s) => file.add_attribute(key, s.as_str()),
            }
            .map_err(|e| nc_err(path, e))?;
        }

        for var in &dataset.vars {
            for (dim, len) in var.dims.iter().zip(&var.shape) {
                match defined.get(dim) {
                    Some(existing) if existing == len => {}
                    Some(existing) => {
                        return Err(TileError::ShardWrite {
                            path: path.to_path_buf(),
                            message: format!("dimension {} has lengths {} and {}", dim, existing, len),
                        });
                    }
                    None => {
                        file.add_dimension(dim, *len).map_err(|e| nc_err(path, e))?;
                        defined.insert(dim.clone(), *len);
                    }
                }
            }

            let dims: Vec<&str> = var.dims.iter().map(|d| d.as_str()).collect();
            let mut nc_var = file.add_variable::<f64>(&var.name, &dims).map_err(|e| nc_err(path, e))?;
            for (key, value) in &var.attrs {
                match value {
                    AttrValue::Number(v) => nc_var.add_attribute(key, *v),
                    AttrValue::Text(s) => nc_var.add_attribute(key, s.as_str()),
                }
                .map_err(|e| nc_err(path, e))?;
            }
            if !var.data.is_empty() {
                nc_var.put_values(&var.data, None, None).map_err(|e| nc_err(path, e))?;
            }
        }

        Ok(())
    }
}
