//! Server configuration with env-var overrides.
//!
//! Reads the TOML file named by `BIOGRAPH_CONFIG` when set, then applies
//! `BIOGRAPH_DB_PATH` and `BIOGRAPH_LOG_LEVEL`. Without a file every value
//! takes its default.
//!
//! ```toml
//! [server]
//! db_path = "./biograph.redb"
//! log_level = "info"
//!
//! [engine.similarity]
//! divergence_penalty = 0.5
//!
//! [[sources]]
//! name = "wikidata-occupations"
//! path = "datasets/occupations.json"
//! reliability = 0.9
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use biograph::{confidence, EngineConfig, SourceKind};
use serde::Deserialize;

use crate::logger;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: String,
    pub log_level: String,
    pub engine: EngineConfig,
    pub sources: Vec<SourceConfig>,
}

/// A JSON dataset of raw records, queried on every ingest prompt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Relative paths resolve against the config file's directory.
    pub path: PathBuf,
    #[serde(default = "external_dataset")]
    pub kind: SourceKind,
    #[serde(default = "full_reliability")]
    pub reliability: f64,
}

fn external_dataset() -> SourceKind {
    SourceKind::ExternalDataset
}

fn full_reliability() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawServer {
    db_path: String,
    log_level: String,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            db_path: "./biograph.redb".to_string(),
            log_level: "info".to_string(),
        }
    }
}

pub fn load() -> Result<ServerConfig> {
    let config_path = env::var("BIOGRAPH_CONFIG").ok();
    let db_path_override = env::var("BIOGRAPH_DB_PATH").ok();
    let log_level_override = env::var("BIOGRAPH_LOG_LEVEL").ok();
    load_from(
        config_path.as_deref().map(Path::new),
        db_path_override.as_deref(),
        log_level_override.as_deref(),
    )
}

pub fn load_from(
    path: Option<&Path>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<ServerConfig> {
    let parsed = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            toml::from_str::<RawConfig>(&raw)
                .with_context(|| format!("parse error in {}", path.display()))?
        }
        None => RawConfig::default(),
    };
    parsed.engine.validate()?;

    let base = path
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut sources = parsed.sources;
    for source in &mut sources {
        if source.name.trim().is_empty() {
            anyhow::bail!("dataset source name must not be empty");
        }
        confidence::validate(source.reliability, "dataset source")
            .with_context(|| format!("dataset source {}", source.name))?;
        if source.path.is_relative() {
            source.path = base.join(&source.path);
        }
    }

    let log_level = log_level_override.unwrap_or(&parsed.server.log_level);
    logger::parse_level(log_level).context("BIOGRAPH_LOG_LEVEL / server.log_level")?;

    Ok(ServerConfig {
        db_path: db_path_override.unwrap_or(&parsed.server.db_path).to_string(),
        log_level: log_level.to_string(),
        engine: parsed.engine,
        sources,
    })
}
