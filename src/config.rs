use crate::backoff::RetryPolicy;
use crate::grid::CodecKind;
use crate::TileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SCENARIOS: [&str; 2] = ["ssp1_2_6_mri_esm2_0", "ssp5_8_5_mri_esm2_0"];
pub const DEFAULT_BASE_SCENARIO: &str = "ssp1_2_6_mri_esm2_0";
pub const DEFAULT_PARTITION: &str = "spot";
pub const DEFAULT_MAX_RETRY_PIXELS: usize = 100;
pub const DEFAULT_LOCK_GRACE_SECS: u64 = 600;
pub const DEFAULT_ENGINE_COMMAND: &str = "mpirun --use-hwthread-cpus /opt/apps/dvm-dos-tem/dvmdostem -f {config} -l disabled --max-output-volume=-1 -p 100 -e 2000 -s 200 -t 124 -n 76";

/// Tile identifier of the form `H{h}_V{v}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(String);

impl TileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `H10_V15` → `(10, 15)`: column and row of the tile in the regional grid.
    pub fn indices(&self) -> Result<(usize, usize), TileError> {
        let invalid = || TileError::Config(format!("'{}' is not a tile id like H10_V15", self.0));
        let (h, v) = self
            .0
            .strip_prefix('H')
            .and_then(|rest| rest.split_once("_V"))
            .ok_or_else(invalid)?;
        Ok((h.parse().map_err(|_| invalid())?, v.parse().map_err(|_| invalid())?))
    }
}

impl FromStr for TileId {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches("_sc");
        let valid = s
            .strip_prefix('H')
            .and_then(|rest| rest.split_once("_V"))
            .map(|(h, v)| {
                !h.is_empty()
                    && !v.is_empty()
                    && h.chars().all(|c| c.is_ascii_digit())
                    && v.chars().all(|c| c.is_ascii_digit())
            })
            .unwrap_or(false);
        if valid {
            Ok(TileId(s.to_string()))
        } else {
            Err(TileError::Config(format!("'{}' is not a tile id like H10_V15", s)))
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Climate pathway and GCM, e.g. `ssp2_4_5_mri_esm2_0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scenario(String);

impl Scenario {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `sspX_Y_Z` part.
    pub fn pathway(&self) -> String {
        self.0.split('_').take(3).collect::<Vec<_>>().join("_")
    }

    pub fn gcm(&self) -> String {
        self.0.split('_').skip(3).collect::<Vec<_>>().join("_")
    }
}

impl FromStr for Scenario {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches("_split");
        if s.is_empty() || s.contains('/') || s.split('_').count() < 4 {
            return Err(TileError::Config(format!(
                "'{}' is not a scenario like ssp2_4_5_mri_esm2_0",
                s
            )));
        }
        Ok(Scenario(s.to_string()))
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable settings handed to every component.
#[derive(Debug, Clone)]
pub struct TileConfig {
    /// Directory holding the `{tile}_sc` trees.
    pub root: PathBuf,
    /// Bucket location: `s3://`, `gs://` or a mounted directory.
    pub bucket: Option<String>,
    pub scenarios: Vec<Scenario>,
    /// Seeds restart state for the others, so it is always checked first.
    pub base_scenario: Scenario,
    pub codec: CodecKind,
    pub partition: String,
    pub max_pixels_per_retry: usize,
    pub lock_grace_secs: u64,
    /// Fresh-run command; `{config}` is replaced by the batch config path.
    pub engine_command: String,
    pub retry: RetryPolicy,
    pub pft_weights: Option<Vec<f64>>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_list<T: FromStr<Err = TileError>>(raw: &str) -> Result<Vec<T>, TileError> {
    raw.split(',').filter(|s| !s.trim().is_empty()).map(|s| s.parse()).collect()
}

pub fn parse_weights(raw: &str) -> Result<Vec<f64>, TileError> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|e| TileError::Config(format!("bad PFT weight '{}': {}", s, e)))
        })
        .collect()
}

impl TileConfig {
    /// Configuration for production use, from `TILEMERGE_*` variables.
    pub fn from_env() -> Result<Self, TileError> {
        let root = env_var("TILEMERGE_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::custom(root);
        config.bucket = env_var("TILEMERGE_BUCKET");
        config.codec = match env_var("TILEMERGE_CODEC") {
            Some(raw) => raw.parse()?,
            None => CodecKind::default(),
        };
        if let Some(raw) = env_var("TILEMERGE_SCENARIOS") {
            config.scenarios = parse_list(&raw)?;
        }
        if let Some(raw) = env_var("TILEMERGE_BASE_SCENARIO") {
            config.base_scenario = raw.parse()?;
        }
        if let Some(partition) = env_var("TILEMERGE_PARTITION") {
            config.partition = partition;
        }
        if let Some(raw) = env_var("TILEMERGE_MAX_RETRY_PIXELS") {
            config.max_pixels_per_retry = raw
                .trim()
                .parse()
                .map_err(|e| TileError::Config(format!("TILEMERGE_MAX_RETRY_PIXELS: {}", e)))?;
        }
        if let Some(cmd) = env_var("TILEMERGE_ENGINE_CMD") {
            config.engine_command = cmd;
        }
        if let Some(raw) = env_var("TILEMERGE_PFT_WEIGHTS") {
            config.pft_weights = Some(parse_weights(&raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Custom configuration for tests.
    pub fn custom(root: PathBuf) -> Self {
        Self {
            root,
            bucket: None,
            scenarios: DEFAULT_SCENARIOS.iter().map(|s| Scenario(s.to_string())).collect(),
            base_scenario: Scenario(DEFAULT_BASE_SCENARIO.to_string()),
            codec: CodecKind::Grid,
            partition: DEFAULT_PARTITION.to_string(),
            max_pixels_per_retry: DEFAULT_MAX_RETRY_PIXELS,
            lock_grace_secs: DEFAULT_LOCK_GRACE_SECS,
            engine_command: DEFAULT_ENGINE_COMMAND.to_string(),
            retry: RetryPolicy::default(),
            pft_weights: None,
        }
    }

    pub fn validate(&self) -> Result<(), TileError> {
        if self.max_pixels_per_retry == 0 {
            return Err(TileError::Config("max pixels per retry batch must be positive".to_string()));
        }
        if self.scenarios.is_empty() {
            return Err(TileError::Config("no scenarios configured".to_string()));
        }
        Ok(())
    }

    /// Configured scenarios with the base scenario first.
    pub fn ordered_scenarios(&self) -> Vec<Scenario> {
        let mut out: Vec<Scenario> = self
            .scenarios
            .iter()
            .filter(|s| **s == self.base_scenario)
            .cloned()
            .collect();
        out.extend(self.scenarios.iter().filter(|s| **s != self.base_scenario).cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_ids_accept_directory_suffix() {
        let tile: TileId = "H10_V15_sc".parse().unwrap();
        assert_eq!(tile.as_str(), "H10_V15");
        assert_eq!(tile.indices().unwrap(), (10, 15));
        assert!("V10_H15".parse::<TileId>().is_err());
        assert!("H10_Vx".parse::<TileId>().is_err());
    }

    #[test]
    fn scenario_splits_pathway_and_gcm() {
        let s: Scenario = "ssp2_4_5_mri_esm2_0_split".parse().unwrap();
        assert_eq!(s.as_str(), "ssp2_4_5_mri_esm2_0");
        assert_eq!(s.pathway(), "ssp2_4_5");
        assert_eq!(s.gcm(), "mri_esm2_0");
        assert!("ssp2".parse::<Scenario>().is_err());
    }

    #[test]
    fn base_scenario_is_checked_first() {
        let mut config = TileConfig::custom(PathBuf::from("/tmp"));
        config.scenarios = vec![
            "ssp5_8_5_mri_esm2_0".parse().unwrap(),
            "ssp1_2_6_mri_esm2_0".parse().unwrap(),
        ];
        let order = config.ordered_scenarios();
        assert_eq!(order[0].as_str(), "ssp1_2_6_mri_esm2_0");
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn weights_parse_from_comma_list() {
        assert_eq!(parse_weights("0.5, 0.25,0.25").unwrap(), vec![0.5, 0.25, 0.25]);
        assert!(parse_weights("0.5,abc").is_err());
    }
}
