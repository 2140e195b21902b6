use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "leaktrace.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DetectConfig {
    pub rules_dir: Option<PathBuf>,
    pub compiled_dir: Option<PathBuf>,
    pub yara: Option<PathBuf>,
    pub yarac: Option<PathBuf>,
    pub tshark: Option<PathBuf>,
    pub threads: Option<u32>,
    pub readiness_attempts: Option<u32>,
    pub readiness_delay_ms: Option<u64>,
    pub indexed: Option<bool>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub detect: Option<DetectConfig>,
}

/// Explicit path must exist; the implicit `./leaktrace.yaml` is optional.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(Some(cfg))
}
