//! Rewrites of a batch's `slurm_runner.sh` and `config/config.js`.

use crate::TileError;
use regex_lite::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::warn;

const OPENMPI_MARKER: &str = "module load openmpi";
const FRESH_TIME_LIMIT: i64 = 7200;
const OLD_TIME_LIMIT: i64 = 3600;

fn regex(pattern: &str) -> Result<Regex, TileError> {
    Regex::new(pattern).map_err(|e| TileError::Other(format!("bad pattern {}: {}", pattern, e)))
}

fn replace_partition(line: &str, partition: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("#SBATCH") {
        return None;
    }
    for flag in ["-p ", "--partition=", "--partition "] {
        if let Some(at) = trimmed.find(flag) {
            let head = &trimmed[..at + flag.len()];
            let tail = &trimmed[at + flag.len()..];
            let rest = tail.trim_start().split_once(char::is_whitespace).map(|(_, r)| r).unwrap_or("");
            let mut out = format!("{}{}", head, partition);
            if !rest.is_empty() {
                out.push(' ');
                out.push_str(rest);
            }
            return Some(out);
        }
    }
    None
}

/// Points a copied runner at its retry directory: config path, log path,
/// job name and partition.
pub fn rewrite_for_retry(
    script: &str,
    retry_dir: &Path,
    logs_dir: &Path,
    source_batch: usize,
    retry_name: &str,
    partition: &str,
) -> Result<String, TileError> {
    let config_path = retry_dir.join("config").join("config.js");
    let log_path = logs_dir.join(format!("batch-{}-{}", source_batch, retry_name));

    let config_re = regex(r"(-f\s+)\S+")?;
    let log_re = regex(r"(-o\s+)\S+")?;
    let job_re = regex(r#"(--job-name=)("?)([^\s"]+)"#)?;

    let mut out = Vec::new();
    for line in script.lines() {
        let mut line = line.to_string();
        if line.trim_start().starts_with("#SBATCH") {
            if let Some(rewritten) = replace_partition(&line, partition) {
                line = rewritten;
            }
            line = log_re
                .replace(&line, |c: &regex_lite::Captures| format!("{}{}", &c[1], log_path.display()))
                .to_string();
            line = job_re
                .replace(&line, |c: &regex_lite::Captures| format!("{}{}{}-retry", &c[1], &c[2], &c[3]))
                .to_string();
        } else {
            line = config_re
                .replace_all(&line, |c: &regex_lite::Captures| format!("{}{}", &c[1], config_path.display()))
                .to_string();
        }
        out.push(line);
    }
    Ok(out.join("\n") + "\n")
}

/// Keeps the runner up to `module load openmpi`, rewrites the log path,
/// optionally the partition and walltime, then appends a fresh run command.
pub fn rewrite_for_fresh_run(
    script: &str,
    batch_dir: &Path,
    logs_dir: &Path,
    batch: usize,
    partition: Option<&str>,
    nowalltime: bool,
    engine_command: &str,
) -> Result<String, TileError> {
    let mut out = Vec::new();
    let mut found = false;
    for line in script.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#SBATCH -o") {
            out.push(format!("#SBATCH -o {}", logs_dir.join(format!("batch-{}", batch)).display()));
            continue;
        }
        if let Some(p) = partition {
            if let Some(rewritten) = replace_partition(line, p) {
                out.push(rewritten);
                continue;
            }
        }
        if nowalltime && trimmed.starts_with("#SBATCH --time=") {
            continue;
        }
        out.push(line.to_string());
        if line.contains(OPENMPI_MARKER) {
            found = true;
            break;
        }
    }
    if !found {
        return Err(TileError::Other(format!(
            "'{}' not found in runner for batch_{}",
            OPENMPI_MARKER, batch
        )));
    }
    let config = batch_dir.join("config").join("config.js");
    out.push(String::new());
    out.push(engine_command.replace("{config}", &config.display().to_string()));
    Ok(out.join("\n") + "\n")
}

/// Re-roots every string path containing `/batch_N` at `new_root`.
pub fn retarget_paths(config: &mut Value, new_root: &Path) -> Result<usize, TileError> {
    let re = regex(r"/batch[_-]\d+(/.*)?$")?;
    let mut changed = 0;
    retarget_value(config, new_root, &re, &mut changed);
    Ok(changed)
}

fn retarget_value(value: &mut Value, new_root: &Path, re: &Regex, changed: &mut usize) {
    match value {
        Value::String(s) => {
            let Some(caps) = re.captures(s) else { return };
            let rel = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let updated = format!("{}{}", new_root.display(), rel);
            if *s != updated {
                *s = updated;
                *changed += 1;
            }
        }
        Value::Array(items) => {
            for item in items {
                retarget_value(item, new_root, re, changed);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                retarget_value(item, new_root, re, changed);
            }
        }
        _ => {}
    }
}

/// Input, output and parameter paths a fresh run reads from its own batch.
fn fresh_path_for(key: &str, batch_dir: &Path) -> Option<String> {
    let b = batch_dir.display();
    let input = |f: &str| Some(format!("{}/input/{}", b, f));
    match key {
        "parameter_dir" => Some(format!("{}/parameters/", b)),
        "hist_climate_file" => input("historic-climate.nc"),
        "proj_climate_file" => input("projected-climate.nc"),
        "veg_class_file" => input("vegetation.nc"),
        "drainage_file" => input("drainage.nc"),
        "soil_texture_file" => input("soil-texture.nc"),
        "co2_file" => input("co2.nc"),
        "proj_co2_file" => input("projected-co2.nc"),
        "topo_file" => input("topo.nc"),
        "fri_fire_file" => input("fri-fire.nc"),
        "hist_exp_fire_file" => input("historic-explicit-fire.nc"),
        "proj_exp_fire_file" => input("projected-explicit-fire.nc"),
        "runmask_file" => input("run-mask.nc"),
        "output_dir" => Some(format!("{}/output/", b)),
        "output_spec_file" => Some(format!("{}/config/output_spec.csv", b)),
        _ => None,
    }
}

/// Resets known paths to the batch's own directory and doubles the old
/// one-hour cell time limit.
pub fn refresh_fresh_run_config(config: &mut Value, batch_dir: &Path) -> usize {
    let mut changed = 0;
    refresh_value(config, batch_dir, &mut changed);
    changed
}

fn refresh_value(value: &mut Value, batch_dir: &Path, changed: &mut usize) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if let (Some(path), Value::String(current)) = (fresh_path_for(key, batch_dir), &*item) {
                    if *current != path {
                        *item = Value::String(path);
                        *changed += 1;
                    }
                } else if key == "cell_timelimit" && item.as_i64() == Some(OLD_TIME_LIMIT) {
                    *item = Value::from(FRESH_TIME_LIMIT);
                    *changed += 1;
                } else {
                    refresh_value(item, batch_dir, changed);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                refresh_value(item, batch_dir, changed);
            }
        }
        _ => {}
    }
}

/// Applies `edit` to a JSON config file in place. A missing file is skipped.
pub fn edit_config_file<F>(path: &Path, edit: F) -> Result<usize, TileError>
where
    F: FnOnce(&mut Value) -> Result<usize, TileError>,
{
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "config.js not found, left as is");
            return Ok(0);
        }
        Err(e) => return Err(TileError::Io(e)),
    };
    let mut value: Value = serde_json::from_str(&text)?;
    let changed = edit(&mut value)?;
    if changed > 0 {
        fs::write(path, serde_json::to_string_pretty(&value)? + "\n")?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RUNNER: &str = "#!/bin/bash -l
#SBATCH --job-name=\"H10_V15-ssp1-batch-3\"
#SBATCH -p spot
#SBATCH -N 1
#SBATCH --time=24:00:00
#SBATCH -o /data/H10_V15_sc/ssp1_2_6_mri_esm2_0_split/logs/batch-3

ulimit -s unlimited
module load openmpi

mpirun --use-hwthread-cpus /opt/apps/dvm-dos-tem/dvmdostem -f /data/H10_V15_sc/ssp1_2_6_mri_esm2_0_split/batch_3/config/config.js -l disabled --max-output-volume=-1 --restart-run
";

    #[test]
    fn retry_runner_points_at_retry_dir() {
        let retry = Path::new("/data/split/retry/retry_0");
        let logs = Path::new("/data/split/logs");
        let out = rewrite_for_retry(RUNNER, retry, logs, 3, "retry_0", "compute").unwrap();
        assert!(out.contains("-f /data/split/retry/retry_0/config/config.js -l disabled"));
        assert!(out.contains("#SBATCH -o /data/split/logs/batch-3-retry_0"));
        assert!(out.contains("--job-name=\"H10_V15-ssp1-batch-3-retry\""));
        assert!(out.contains("#SBATCH -p compute"));
        assert!(!out.contains("spot"));
        assert!(out.contains("--restart-run"));
    }

    #[test]
    fn fresh_runner_truncates_after_openmpi() {
        let batch = Path::new("/data/split/batch_3");
        let logs = Path::new("/data/split/logs");
        let out = rewrite_for_fresh_run(RUNNER, batch, logs, 3, Some("dask"), true, "dvmdostem -f {config} -p 100").unwrap();
        assert!(!out.contains("--restart-run"));
        assert!(!out.contains("--time="));
        assert!(out.contains("#SBATCH -p dask"));
        assert!(out.trim_end().ends_with("dvmdostem -f /data/split/batch_3/config/config.js -p 100"));

        assert!(rewrite_for_fresh_run("#!/bin/bash\necho hi\n", batch, logs, 3, None, false, "x").is_err());
    }

    #[test]
    fn config_paths_follow_the_retry_dir() {
        let mut config = json!({
            "IO": {
                "parameter_dir": "/data/split/batch_3/parameters/",
                "runmask_file": "/data/split/batch_3/input/run-mask.nc",
                "output_dir": "/data/split/batch_3/output/",
                "output_spec_file": "/shared/output_spec.csv"
            },
            "calibration-IO": { "caldata_tree_loc": "/tmp/batch_3" }
        });
        let changed = retarget_paths(&mut config, Path::new("/data/split/retry/retry_0")).unwrap();
        assert_eq!(changed, 4);
        assert_eq!(config["IO"]["runmask_file"], "/data/split/retry/retry_0/input/run-mask.nc");
        assert_eq!(config["IO"]["output_spec_file"], "/shared/output_spec.csv");
        assert_eq!(config["calibration-IO"]["caldata_tree_loc"], "/data/split/retry/retry_0");
    }

    #[test]
    fn fresh_config_resets_paths_and_time_limit() {
        let mut config = json!({
            "IO": { "output_dir": "/elsewhere/", "unrelated": "/x" },
            "model_settings": { "cell_timelimit": 3600 }
        });
        let changed = refresh_fresh_run_config(&mut config, Path::new("/data/split/batch_1"));
        assert_eq!(changed, 2);
        assert_eq!(config["IO"]["output_dir"], "/data/split/batch_1/output/");
        assert_eq!(config["model_settings"]["cell_timelimit"], 7200);
    }
}
