//! Post-merge aggregation: yearly, then compartment, then PFT, then layer.
//!
//! Each stage removes (or, for the yearly stage, shortens) one lead
//! dimension of a canvas using the reduction named in the output spec.
//! Reductions never skip NaN, so a missing month poisons its year.

use crate::canvas::Canvas;
use crate::grid::is_dim;
use crate::output_spec::{OutputSpec, Reduction, VariableRules};
use crate::TileError;
use ndarray::{ArrayD, ArrayView1, ArrayViewD, Axis, Slice};
use tracing::{debug, warn};

pub const MONTHS_PER_YEAR: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageToggles {
    pub yearly: bool,
    pub compartment: bool,
    pub pft: bool,
    pub layer: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            yearly: true,
            compartment: true,
            pft: true,
            layer: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Yearly,
    Compartment,
    Pft,
    Layer,
}

impl StageKind {
    pub fn dim(self) -> &'static str {
        match self {
            StageKind::Yearly => "time",
            StageKind::Compartment => "pftpart",
            StageKind::Pft => "pft",
            StageKind::Layer => "layer",
        }
    }

    pub fn rule(self, rules: &VariableRules) -> Reduction {
        match self {
            StageKind::Yearly => rules.yearly,
            StageKind::Compartment => rules.compartment,
            StageKind::Pft => rules.pft,
            StageKind::Layer => rules.layer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub kind: StageKind,
    pub name: &'static str,
    pub enabled: bool,
}

pub fn stages(toggles: StageToggles) -> [Stage; 4] {
    [
        Stage { kind: StageKind::Yearly, name: "yearsynth", enabled: toggles.yearly },
        Stage { kind: StageKind::Compartment, name: "compsynth", enabled: toggles.compartment },
        Stage { kind: StageKind::Pft, name: "pftsynth", enabled: toggles.pft },
        Stage { kind: StageKind::Layer, name: "layersynth", enabled: toggles.layer },
    ]
}

/// Reduces one lane. NaN anywhere makes the result NaN, except for `Last`.
pub fn reduce_lane(lane: ArrayView1<f64>, rule: Reduction, weights: Option<&[f64]>) -> Result<f64, TileError> {
    let has_nan = lane.iter().any(|v| v.is_nan());
    let value = match rule {
        Reduction::Sum => lane.sum(),
        Reduction::Mean => {
            if lane.is_empty() {
                f64::NAN
            } else {
                lane.sum() / lane.len() as f64
            }
        }
        Reduction::Last => return Ok(lane.iter().last().copied().unwrap_or(f64::NAN)),
        Reduction::Max => lane.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Reduction::Min => lane.iter().copied().fold(f64::INFINITY, f64::min),
        Reduction::Weighted => {
            let weights = weights.ok_or_else(|| TileError::Config("weighted reduction needs PFT weights".to_string()))?;
            if weights.len() != lane.len() {
                return Err(TileError::Config(format!(
                    "{} PFT weights for a dimension of length {}",
                    weights.len(),
                    lane.len()
                )));
            }
            lane.iter().zip(weights).map(|(v, w)| v * w).sum()
        }
        Reduction::Invalid => return Err(TileError::Other("invalid reduction applied".to_string())),
    };
    Ok(if has_nan { f64::NAN } else { value })
}

fn reduce_axis(
    data: ArrayViewD<f64>,
    axis: Axis,
    rule: Reduction,
    weights: Option<&[f64]>,
) -> Result<ArrayD<f64>, TileError> {
    let mut failure = None;
    let reduced = data.map_axis(axis, |lane| match reduce_lane(lane, rule, weights) {
        Ok(v) => v,
        Err(e) => {
            failure.get_or_insert(e);
            f64::NAN
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(reduced),
    }
}

pub struct Synthesizer<'a> {
    spec: &'a OutputSpec,
    pft_weights: Option<&'a [f64]>,
    stages: [Stage; 4],
}

impl<'a> Synthesizer<'a> {
    pub fn new(spec: &'a OutputSpec, toggles: StageToggles, pft_weights: Option<&'a [f64]>) -> Self {
        Self {
            spec,
            pft_weights,
            stages: stages(toggles),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Names of stages that will run, in order.
    pub fn enabled_stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().filter(|s| s.enabled).map(|s| s.name).collect()
    }

    pub fn run(&self, canvas: &mut Canvas) -> Result<(), TileError> {
        let Some(rules) = self.spec.rules(&canvas.key.var) else {
            debug!(var = %canvas.key.var, "no output spec entry, synthesis skipped");
            return Ok(());
        };
        for stage in self.stages.iter().filter(|s| s.enabled) {
            let rule = stage.kind.rule(rules);
            if rule == Reduction::Invalid {
                continue;
            }
            match stage.kind {
                StageKind::Yearly => self.yearly(canvas, rule)?,
                kind => self.collapse(canvas, kind, rule)?,
            }
        }
        Ok(())
    }

    fn yearly(&self, canvas: &mut Canvas, rule: Reduction) -> Result<(), TileError> {
        if canvas.key.res != "monthly" {
            return Ok(());
        }
        let Some(t) = canvas.lead_dims.iter().position(|d| is_dim(d, StageKind::Yearly.dim())) else {
            warn!(key = %canvas.key, "monthly variable without a time dimension, yearly synthesis skipped");
            return Ok(());
        };
        let months = canvas.data.len_of(Axis(t));
        if months % MONTHS_PER_YEAR != 0 {
            warn!(key = %canvas.key, months, "time length is not a whole number of years, yearly synthesis skipped");
            return Ok(());
        }

        let years: Vec<ArrayD<f64>> = (0..months / MONTHS_PER_YEAR)
            .map(|y| {
                let window = canvas
                    .data
                    .slice_axis(Axis(t), Slice::from(y * MONTHS_PER_YEAR..(y + 1) * MONTHS_PER_YEAR));
                reduce_axis(window, Axis(t), rule, None).map(|a| a.insert_axis(Axis(t)))
            })
            .collect::<Result<_, _>>()?;
        let views: Vec<ArrayViewD<f64>> = years.iter().map(|a| a.view()).collect();
        let data = ndarray::concatenate(Axis(t), &views)
            .map_err(|e| TileError::Other(format!("{}: {}", canvas.key, e)))?;

        canvas.replace_data(canvas.lead_dims.clone(), data)?;
        canvas.key.res = "yearly".to_string();
        Ok(())
    }

    fn collapse(&self, canvas: &mut Canvas, kind: StageKind, rule: Reduction) -> Result<(), TileError> {
        let Some(axis) = canvas.lead_dims.iter().position(|d| is_dim(d, kind.dim())) else {
            return Ok(());
        };
        let weights = if kind == StageKind::Pft { self.pft_weights } else { None };
        let data = reduce_axis(canvas.data.view(), Axis(axis), rule, weights)?;
        let mut dims = canvas.lead_dims.clone();
        dims.remove(axis);
        canvas.replace_data(dims, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::ShardKey;
    use crate::mask::{PixelCoord, RunMask};
    use ndarray::arr1;

    fn spec(text: &str) -> OutputSpec {
        OutputSpec::parse(text).unwrap()
    }

    fn monthly_canvas(values: &[f64]) -> Canvas {
        let mask = RunMask::from_pixels(1, 2, [PixelCoord::new(0, 0)]);
        let key = ShardKey::parse("GPP_monthly_tr").unwrap();
        let mut canvas = Canvas::new(key, vec!["time".into()], &[values.len()], &mask);
        canvas.populate(PixelCoord::new(0, 0), values).unwrap();
        canvas
    }

    #[test]
    fn lane_reductions() {
        let lane = arr1(&[1.0, 2.0, 3.0, 6.0]);
        assert_eq!(reduce_lane(lane.view(), Reduction::Sum, None).unwrap(), 12.0);
        assert_eq!(reduce_lane(lane.view(), Reduction::Mean, None).unwrap(), 3.0);
        assert_eq!(reduce_lane(lane.view(), Reduction::Last, None).unwrap(), 6.0);
        assert_eq!(reduce_lane(lane.view(), Reduction::Max, None).unwrap(), 6.0);
        assert_eq!(reduce_lane(lane.view(), Reduction::Min, None).unwrap(), 1.0);
        let w = [0.5, 0.5, 0.0, 0.0];
        assert_eq!(reduce_lane(lane.view(), Reduction::Weighted, Some(&w)).unwrap(), 1.5);
        assert!(reduce_lane(lane.view(), Reduction::Weighted, None).is_err());
    }

    #[test]
    fn nan_propagates_through_sum_and_max() {
        let lane = arr1(&[1.0, f64::NAN, 3.0]);
        assert!(reduce_lane(lane.view(), Reduction::Sum, None).unwrap().is_nan());
        assert!(reduce_lane(lane.view(), Reduction::Max, None).unwrap().is_nan());
    }

    #[test]
    fn yearly_sum_mean_last() {
        let months: Vec<f64> = (1..=24).map(|m| m as f64).collect();
        for (rule, expected) in [("sum", [78.0, 222.0]), ("mean", [6.5, 18.5]), ("last", [12.0, 24.0])] {
            let spec = spec(&format!("Name,Yearsynth\nGPP,{}\n", rule));
            let synth = Synthesizer::new(&spec, StageToggles::default(), None);
            let mut canvas = monthly_canvas(&months);
            synth.run(&mut canvas).unwrap();
            assert_eq!(canvas.key.res, "yearly");
            assert_eq!(canvas.data.shape(), &[2, 1, 2]);
            assert_eq!(canvas.series(PixelCoord::new(0, 0)), expected.to_vec(), "rule {}", rule);
            assert!(canvas.series(PixelCoord::new(0, 1)).iter().all(|v| *v == -9999.0));
        }
    }

    #[test]
    fn disabled_stage_leaves_canvas_untouched() {
        let spec = spec("Name,Yearsynth\nGPP,sum\n");
        let toggles = StageToggles { yearly: false, ..StageToggles::default() };
        let synth = Synthesizer::new(&spec, toggles, None);
        let mut canvas = monthly_canvas(&[1.0; 12]);
        synth.run(&mut canvas).unwrap();
        assert_eq!(canvas.key.res, "monthly");
        assert_eq!(canvas.data.shape(), &[12, 1, 2]);
    }

    #[test]
    fn pft_stage_collapses_axis_with_weights() {
        let spec = spec("Name,Pftsynth\nVEGC,weighted\n");
        let weights = [1.0, 2.0, 0.0];
        let synth = Synthesizer::new(&spec, StageToggles::default(), Some(&weights));
        let mask = RunMask::from_pixels(1, 1, [PixelCoord::new(0, 0)]);
        let key = ShardKey::parse("VEGC_yearly_tr").unwrap();
        let mut canvas = Canvas::new(key, vec!["time".into(), "pft".into()], &[2, 3], &mask);
        canvas.populate(PixelCoord::new(0, 0), &[1.0, 1.0, 5.0, 2.0, 3.0, 9.0]).unwrap();

        synth.run(&mut canvas).unwrap();
        assert_eq!(canvas.lead_dims, vec!["time".to_string()]);
        assert_eq!(canvas.series(PixelCoord::new(0, 0)), vec![3.0, 8.0]);
    }
}
