//! `output_spec.csv`: which reduction each synthesis stage applies per variable.

use crate::TileError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const OUTPUT_SPEC_FILE: &str = "output_spec.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    Last,
    Max,
    Min,
    Weighted,
    Invalid,
}

impl FromStr for Reduction {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Reduction::Sum),
            "mean" | "avg" => Ok(Reduction::Mean),
            "last" => Ok(Reduction::Last),
            "max" => Ok(Reduction::Max),
            "min" => Ok(Reduction::Min),
            "weighted" => Ok(Reduction::Weighted),
            "" | "invalid" => Ok(Reduction::Invalid),
            other => Err(TileError::Config(format!("unknown reduction '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableRules {
    pub yearly: Reduction,
    pub compartment: Reduction,
    pub pft: Reduction,
    pub layer: Reduction,
}

impl Default for VariableRules {
    fn default() -> Self {
        Self {
            yearly: Reduction::Invalid,
            compartment: Reduction::Invalid,
            pft: Reduction::Invalid,
            layer: Reduction::Invalid,
        }
    }
}

/// Splits one CSV record. Commas inside double quotes stay in the field and
/// `""` inside quotes is a literal quote.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSpec {
    rules: BTreeMap<String, VariableRules>,
}

impl OutputSpec {
    /// Header must carry `Name`; stage columns that are absent default to invalid.
    /// Every row must have as many fields as the header.
    pub fn parse(text: &str) -> Result<Self, TileError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .filter(|(_, l)| !l.trim().is_empty());
        let (_, header_line) = lines
            .next()
            .ok_or_else(|| TileError::Config("output spec is empty".to_string()))?;
        let header: Vec<String> = split_record(header_line)
            .into_iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        let column = |name: &str| header.iter().position(|h| h == name);
        let name_col = column("name").ok_or_else(|| TileError::Config("output spec has no Name column".to_string()))?;
        let yearly_col = column("yearsynth");
        let comp_col = column("compsynth");
        let pft_col = column("pftsynth");
        let layer_col = column("layersynth");

        let mut rules = BTreeMap::new();
        for (number, line) in lines {
            let fields = split_record(line);
            if fields.len() != header.len() {
                return Err(TileError::Config(format!(
                    "output spec line {} has {} fields, header has {}",
                    number,
                    fields.len(),
                    header.len()
                )));
            }
            let Some(name) = fields.get(name_col).filter(|n| !n.is_empty()) else { continue };
            let pick = |col: Option<usize>| -> Result<Reduction, TileError> {
                col.and_then(|c| fields.get(c))
                    .map(|v| v.parse())
                    .unwrap_or(Ok(Reduction::Invalid))
                    .map_err(|e| TileError::Config(format!("output spec line {}: {}", number, e)))
            };
            let entry = VariableRules {
                yearly: pick(yearly_col)?,
                compartment: pick(comp_col)?,
                pft: pick(pft_col)?,
                layer: pick(layer_col)?,
            };
            rules.insert(name.to_string(), entry);
        }
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self, TileError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn rules(&self, var: &str) -> Option<&VariableRules> {
        self.rules.get(var)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// First existing candidate among the explicit path, the split directory,
/// the data root and `TILEMERGE_OUTPUT_SPEC`.
pub fn locate(explicit: Option<&Path>, split_dir: &Path, root: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = explicit {
        candidates.push(p.to_path_buf());
    }
    candidates.push(split_dir.join(OUTPUT_SPEC_FILE));
    if let Some(root) = root {
        candidates.push(root.join(OUTPUT_SPEC_FILE));
    }
    if let Ok(env_path) = std::env::var("TILEMERGE_OUTPUT_SPEC") {
        candidates.push(PathBuf::from(env_path));
    }
    candidates.into_iter().find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_with_missing_columns() {
        let text = "Name,Units,Yearsynth,Pftsynth\nGPP,g/m2,sum,sum\nLAI,m2/m2,mean,\nALD,m,last,invalid\n";
        let spec = OutputSpec::parse(text).unwrap();
        assert_eq!(spec.len(), 3);
        let gpp = spec.rules("GPP").unwrap();
        assert_eq!(gpp.yearly, Reduction::Sum);
        assert_eq!(gpp.pft, Reduction::Sum);
        assert_eq!(gpp.compartment, Reduction::Invalid);
        assert_eq!(spec.rules("LAI").unwrap().pft, Reduction::Invalid);
        assert!(spec.rules("RH").is_none());
    }

    #[test]
    fn unknown_reduction_is_an_error() {
        assert!(OutputSpec::parse("Name,Yearsynth\nGPP,median\n").is_err());
        assert!(OutputSpec::parse("Var,Yearsynth\nGPP,sum\n").is_err());
    }

    #[test]
    fn quoted_commas_stay_in_their_field() {
        let text = "Name,Description,Yearsynth,Pftsynth\nGPP,\"gross primary production, all \"\"PFTs\"\"\",sum,mean\n";
        let spec = OutputSpec::parse(text).unwrap();
        let gpp = spec.rules("GPP").unwrap();
        assert_eq!(gpp.yearly, Reduction::Sum);
        assert_eq!(gpp.pft, Reduction::Mean);
        assert_eq!(
            split_record("a,\"b, \"\"c\"\"\",d"),
            vec!["a".to_string(), "b, \"c\"".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn short_or_long_rows_name_their_line() {
        let text = "Name,Description,Yearsynth\nGPP,carbon,sum\n\nNPP,net, primary,sum\n";
        match OutputSpec::parse(text) {
            Err(TileError::Config(message)) => assert!(message.contains("line 4"), "{}", message),
            other => panic!("expected a config error, got {:?}", other),
        }
        match OutputSpec::parse("Name,Yearsynth\nGPP,sum\nRH,median\n") {
            Err(TileError::Config(message)) => {
                assert!(message.contains("line 3"), "{}", message);
                assert!(message.contains("median"), "{}", message);
            }
            other => panic!("expected a config error, got {:?}", other),
        }
    }
}
