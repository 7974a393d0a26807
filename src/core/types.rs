//! DC-001: Configuration and data-model types.
//!
//! Defines the YAML schema types for settings, datasources and step files,
//! plus the step options/overrides model and run statistics. All config
//! types derive Serialize/Deserialize for YAML roundtripping.

use super::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Top-level dbchef.yaml
// ============================================================================

/// Cookbook-wide settings, read from `<root>/dbchef.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// How steps inside one priority tier are run
    #[serde(default)]
    pub mode: RunMode,

    /// Free-form values available to templates as `{{params.key}}`
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Connection acquisition policy beneath step init
    #[serde(default)]
    pub connect: ConnectPolicy,

    /// Directory for the JSONL run journal
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

/// Execution mode for steps sharing a priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Fixed-attempt connection policy. No backoff: every attempt gets the same
/// timeout and the same pause before the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_secs: default_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

// ============================================================================
// Datasources
// ============================================================================

/// Contents of `<recipe>/datasources.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourcesFile {
    #[serde(default)]
    pub datasources: IndexMap<String, DatasourceSpec>,
}

/// A datasource declaration as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceSpec {
    /// Datasource kind
    #[serde(rename = "type")]
    pub kind: DatasourceKind,

    /// Concrete engine; must agree with `kind`
    pub engine: Engine,

    /// Selection tags, some of form `name:value`
    #[serde(default)]
    pub tags: Vec<String>,

    // -- Database fields --
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: Option<String>,

    /// Wrap step work in a transaction
    #[serde(default = "default_true")]
    pub transactional: bool,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    // -- File fields --
    /// File path, relative to the recipe folder
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    4
}

/// Datasource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceKind {
    Database,
    File,
}

impl fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::File => write!(f, "file"),
        }
    }
}

/// Datasource engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Mysql,
    Postgres,
    Json,
    Yaml,
    Csv,
}

impl Engine {
    /// The only kind this engine can back.
    pub fn kind(self) -> DatasourceKind {
        match self {
            Self::Mysql | Self::Postgres => DatasourceKind::Database,
            Self::Json | Self::Yaml | Self::Csv => DatasourceKind::File,
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Mysql => Some(3306),
            Self::Postgres => Some(5432),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mysql => write!(f, "mysql"),
            Self::Postgres => write!(f, "postgres"),
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

// ============================================================================
// Step files
// ============================================================================

/// Closed set of step kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Migration,
    Sql,
    Shell,
    Template,
    Sync,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migration => write!(f, "migration"),
            Self::Sql => write!(f, "sql"),
            Self::Shell => write!(f, "shell"),
            Self::Template => write!(f, "template"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Fields common to every step file. Kind-specific fields live next to
/// these in the same document and are read by the kind's factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHeader {
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Base step name (defaults to the file stem)
    #[serde(default)]
    pub name: Option<String>,

    /// Tier; lower runs first
    #[serde(default)]
    pub priority: i32,

    /// Datasource selectors
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub options: StepOptions,
}

impl StepHeader {
    /// Selectors with the "select everything" default applied.
    pub fn selectors(&self) -> Vec<String> {
        if self.tags.is_empty() {
            vec![String::new()]
        } else {
            self.tags.clone()
        }
    }
}

/// Options every step honours; `post_load` overrides land here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Run even when the skip predicate says there is nothing to do
    #[serde(default)]
    pub force: bool,

    /// Evaluate everything, change nothing
    #[serde(default)]
    pub dry_run: bool,

    /// Maximum number of migrations to apply
    #[serde(default)]
    pub steps: Option<u32>,

    /// Apply migrations up to and including this version
    #[serde(default)]
    pub target_version: Option<i64>,
}

impl StepOptions {
    /// Merge superseding overrides. An override set that names both halves
    /// of an exclusive pair is rejected; naming one half clears the other.
    pub fn merge(&mut self, overrides: &Overrides) -> Result<()> {
        overrides.validate()?;
        if let Some(force) = overrides.get_bool("force")? {
            self.force = force;
            if force {
                self.dry_run = false;
            }
        }
        if let Some(dry_run) = overrides.get_bool("dry_run")? {
            self.dry_run = dry_run;
            if dry_run {
                self.force = false;
            }
        }
        if let Some(steps) = overrides.get_u32("steps")? {
            self.steps = Some(steps);
            self.target_version = None;
        }
        if let Some(version) = overrides.get_i64("target_version")? {
            self.target_version = Some(version);
            self.steps = None;
        }
        self.check()
    }

    /// Reject exclusive combinations in the resolved options.
    pub fn check(&self) -> Result<()> {
        if self.force && self.dry_run {
            return Err(Error::Override(
                "force and dry_run are mutually exclusive".to_string(),
            ));
        }
        if self.steps.is_some() && self.target_version.is_some() {
            return Err(Error::Override(
                "steps and target_version are mutually exclusive".to_string(),
            ));
        }
        if self.steps == Some(0) {
            return Err(Error::Override("steps must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Overrides
// ============================================================================

const OVERRIDE_KEYS: [&str; 4] = ["force", "dry_run", "steps", "target_version"];

/// Superseding key/value configuration applied after load (command line).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    values: BTreeMap<String, serde_yaml_ng::Value>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<serde_yaml_ng::Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reject unknown keys and exclusive pairs within the override set.
    pub fn validate(&self) -> Result<()> {
        for key in self.values.keys() {
            if !OVERRIDE_KEYS.contains(&key.as_str()) {
                return Err(Error::Override(format!("unknown key '{}'", key)));
            }
        }
        if self.get_bool("force")? == Some(true) && self.get_bool("dry_run")? == Some(true) {
            return Err(Error::Override(
                "force and dry_run are mutually exclusive".to_string(),
            ));
        }
        if self.values.contains_key("steps") && self.values.contains_key("target_version") {
            return Err(Error::Override(
                "steps and target_version are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(serde_yaml_ng::Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Error::Override(format!(
                "'{}' must be a boolean, got {}",
                key,
                yaml_value_to_string(other)
            ))),
        }
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(serde_yaml_ng::Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| Error::Override(format!("'{}' must be an integer", key))),
            Some(_) => Err(Error::Override(format!("'{}' must be an integer", key))),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get_i64(key)? {
            None => Ok(None),
            Some(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| Error::Override(format!("'{}' out of range: {}", key, n))),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Step counts per recipe, one entry per priority tier in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub per_recipe: BTreeMap<String, Vec<usize>>,
    pub total: usize,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
