//! Service configuration.
//!
//! Settings are read from a TOML file and then overridden by the
//! environment variables a mu-semtech stack conventionally sets on the
//! container. Every field has a default, so a missing file is not an error.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:80"
//!
//! [graph]
//! sparql_endpoint = "http://database:8890/sparql"
//! kanselarij_graph = "http://mu.semte.ch/graphs/organizations/kanselarij"
//!
//! [storage]
//! share_root = "/share"
//!
//! [pipeline]
//! retry_delay_ms = 5000
//! log_incoming_deltas = true
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::access::AccessLadder;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub access_levels: AccessLevelsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:80".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_sparql_endpoint")]
    pub sparql_endpoint: String,
    /// Graph used by session-scoped (non-sudo) requests.
    #[serde(default = "default_application_graph")]
    pub application_graph: String,
    /// Graph the delta-driven pipeline reads from and writes to.
    #[serde(default = "default_kanselarij_graph")]
    pub kanselarij_graph: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sparql_endpoint: default_sparql_endpoint(),
            application_graph: default_application_graph(),
            kanselarij_graph: default_kanselarij_graph(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_sparql_endpoint() -> String {
    "http://database:8890/sparql".to_string()
}
fn default_application_graph() -> String {
    "http://mu.semte.ch/application".to_string()
}
fn default_kanselarij_graph() -> String {
    "http://mu.semte.ch/graphs/organizations/kanselarij".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory that `share://` URIs resolve against.
    #[serde(default = "default_share_root")]
    pub share_root: PathBuf,
    /// Subdirectory of `share_root` that new artifacts are written to.
    #[serde(default)]
    pub subpath: String,
    #[serde(default = "default_file_resource_base")]
    pub file_resource_base: String,
    #[serde(default = "default_piece_resource_base")]
    pub piece_resource_base: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            share_root: default_share_root(),
            subpath: String::new(),
            file_resource_base: default_file_resource_base(),
            piece_resource_base: default_piece_resource_base(),
        }
    }
}

fn default_share_root() -> PathBuf {
    PathBuf::from("/share")
}
fn default_file_resource_base() -> String {
    "http://themis.vlaanderen.be/id/bestand/".to_string()
}
fn default_piece_resource_base() -> String {
    "http://themis.vlaanderen.be/id/stuk/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Delay before re-running the main-piece test on an item that failed it.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_eligibility_retries")]
    pub eligibility_retries: u32,
    /// Delay of the coordinator's pending re-check while a run is active.
    #[serde(default = "default_recheck_delay_ms")]
    pub recheck_delay_ms: u64,
    #[serde(default)]
    pub log_incoming_deltas: bool,
    #[serde(default = "default_copy_title_suffix")]
    pub copy_title_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            eligibility_retries: default_eligibility_retries(),
            recheck_delay_ms: default_recheck_delay_ms(),
            log_incoming_deltas: false,
            copy_title_suffix: default_copy_title_suffix(),
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_eligibility_retries() -> u32 {
    1
}
fn default_recheck_delay_ms() -> u64 {
    1000
}
fn default_copy_title_suffix() -> String {
    " (met certificaat)".to_string()
}

impl PipelineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessLevelsConfig {
    /// Confidentiality levels, lowest first.
    #[serde(default = "default_ladder")]
    pub ladder: Vec<String>,
    /// How many of the lowest levels are escalated one step on copy creation.
    #[serde(default = "default_promote_up_to")]
    pub promote_up_to: usize,
}

impl Default for AccessLevelsConfig {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            promote_up_to: default_promote_up_to(),
        }
    }
}

pub const ACCESS_LEVEL_PUBLIC: &str =
    "http://themis.vlaanderen.be/id/concept/toegangsniveau/c3de9c70-391e-4031-a85e-4b03433d6266";
pub const ACCESS_LEVEL_GOVERNMENT: &str =
    "http://themis.vlaanderen.be/id/concept/toegangsniveau/634f438e-0d62-4ae4-923a-b63460f6bc46";
pub const ACCESS_LEVEL_CABINET: &str =
    "http://themis.vlaanderen.be/id/concept/toegangsniveau/13ae94b0-6188-49df-8ecd-4c4a17511d6d";

fn default_ladder() -> Vec<String> {
    vec![
        ACCESS_LEVEL_PUBLIC.to_string(),
        ACCESS_LEVEL_GOVERNMENT.to_string(),
        ACCESS_LEVEL_CABINET.to_string(),
    ]
}
fn default_promote_up_to() -> usize {
    2
}

impl AccessLevelsConfig {
    pub fn ladder(&self) -> AccessLadder {
        AccessLadder::new(self.ladder.clone(), self.promote_up_to)
    }
}

/// Values accepted as "on" for boolean environment flags.
pub fn is_truthy(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes" | "Y" | "on")
}

impl Config {
    /// Apply container environment overrides on top of file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MU_SPARQL_ENDPOINT") {
            self.graph.sparql_endpoint = v;
        }
        if let Some(v) = lookup("MU_APPLICATION_GRAPH") {
            self.graph.application_graph = v;
        }
        if let Some(v) = lookup("KANSELARIJ_GRAPH") {
            self.graph.kanselarij_graph = v;
        }
        if let Some(v) = lookup("MU_APPLICATION_FILE_STORAGE_PATH") {
            self.storage.subpath = v;
        }
        if let Some(v) = lookup("FILE_RESOURCE_BASE") {
            self.storage.file_resource_base = v;
        }
        if let Some(v) = lookup("PIECE_RESOURCE_BASE") {
            self.storage.piece_resource_base = v;
        }
        if let Some(v) = lookup("RETRY_TIMEOUT_MS") {
            self.pipeline.retry_delay_ms = v
                .trim()
                .parse()
                .with_context(|| format!("RETRY_TIMEOUT_MS is not a number: '{}'", v))?;
        }
        if let Some(v) = lookup("LOG_INCOMING_DELTAS") {
            self.pipeline.log_incoming_deltas = is_truthy(&v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.graph.sparql_endpoint.trim().is_empty() {
            bail!("graph.sparql_endpoint must not be empty");
        }
        for (name, graph) in [
            ("graph.application_graph", &self.graph.application_graph),
            ("graph.kanselarij_graph", &self.graph.kanselarij_graph),
        ] {
            if !is_absolute_iri(graph) {
                bail!("{} must be an absolute IRI, got '{}'", name, graph);
            }
        }
        for (name, base) in [
            ("storage.file_resource_base", &self.storage.file_resource_base),
            ("storage.piece_resource_base", &self.storage.piece_resource_base),
        ] {
            if !is_absolute_iri(base) || !base.ends_with('/') {
                bail!("{} must be an absolute IRI ending in '/', got '{}'", name, base);
            }
        }
        if self.pipeline.recheck_delay_ms == 0 {
            bail!("pipeline.recheck_delay_ms must be > 0");
        }

        let ladder = &self.access_levels.ladder;
        if ladder.len() < 2 {
            bail!("access_levels.ladder needs at least two levels");
        }
        for (i, level) in ladder.iter().enumerate() {
            if !is_absolute_iri(level) {
                bail!("access_levels.ladder[{}] is not an absolute IRI: '{}'", i, level);
            }
            if ladder[..i].contains(level) {
                bail!("access_levels.ladder contains '{}' twice", level);
            }
        }
        if self.access_levels.promote_up_to >= ladder.len() {
            bail!(
                "access_levels.promote_up_to must be < {} (the ladder length)",
                ladder.len()
            );
        }
        Ok(())
    }
}

fn is_absolute_iri(value: &str) -> bool {
    match value.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
                && !rest.is_empty()
                && !value.chars().any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '"'))
        }
        None => false,
    }
}

/// Load configuration from `path` (if it exists) and the process environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
