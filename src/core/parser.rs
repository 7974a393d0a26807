//! DC-005: YAML parsing for settings, datasource and step files.
//!
//! Every parse failure is a load-time `Error::Config` carrying the path, so
//! nothing executes when a recipe is malformed.

use super::error::{Error, Result};
use super::types::{DatasourcesFile, Settings, StepHeader};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Settings file looked up at the config root.
pub const SETTINGS_FILE: &str = "dbchef.yaml";

/// A step file: its header and the raw document kind factories read from.
#[derive(Debug, Clone)]
pub struct StepFile {
    pub path: PathBuf,
    pub header: StepHeader,
    pub raw: serde_yaml_ng::Value,
}

impl StepFile {
    /// Base step name: explicit `name`, else the file stem.
    pub fn base_name(&self) -> String {
        self.header.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        })
    }

    /// Deserialize the kind-specific part of the document.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_yaml_ng::from_value(self.raw.clone())
            .map_err(|e| Error::config(&self.path, e.to_string()))
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

fn parse_yaml<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    serde_yaml_ng::from_str(content)
        .map_err(|e| Error::config(path, format!("YAML parse error: {}", e)))
}

/// Parse `dbchef.yaml` from the config root; absent file means defaults.
pub fn parse_settings(config_root: &Path) -> Result<Settings> {
    let path = config_root.join(SETTINGS_FILE);
    if !path.is_file() {
        return Ok(Settings::default());
    }
    let content = read(&path)?;
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    parse_yaml(&path, &content)
}

/// Parse a `datasources.yaml` file.
pub fn parse_datasources_file(path: &Path) -> Result<DatasourcesFile> {
    let content = read(path)?;
    if content.trim().is_empty() {
        return Ok(DatasourcesFile::default());
    }
    parse_yaml(path, &content)
}

/// Parse a step file from disk.
pub fn parse_step_file(path: &Path) -> Result<StepFile> {
    let content = read(path)?;
    parse_step(path, &content)
}

/// Parse a step document from a string.
pub fn parse_step(path: &Path, content: &str) -> Result<StepFile> {
    let raw: serde_yaml_ng::Value = parse_yaml(path, content)?;
    let header: StepHeader = serde_yaml_ng::from_value(raw.clone())
        .map_err(|e| Error::config(path, e.to_string()))?;
    header
        .options
        .check()
        .map_err(|e| Error::config(path, e.to_string()))?;
    if header.tags.iter().any(|t| t.trim() == "!") {
        return Err(Error::config(path, "empty negated selector '!'"));
    }
    Ok(StepFile {
        path: path.to_path_buf(),
        header,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunMode, StepKind};

    #[test]
    fn test_dc005_parse_step() {
        let yaml = r#"
type: sql
name: seed
priority: 5
tags: [primary]
sql: "INSERT INTO t VALUES (1)"
"#;
        let step = parse_step(Path::new("/r/10-seed.yaml"), yaml).unwrap();
        assert_eq!(step.header.kind, StepKind::Sql);
        assert_eq!(step.base_name(), "seed");
        assert_eq!(step.header.priority, 5);

        #[derive(serde::Deserialize)]
        struct Body {
            sql: String,
        }
        let body: Body = step.body().unwrap();
        assert!(body.sql.starts_with("INSERT"));
    }

    #[test]
    fn test_dc005_base_name_defaults_to_stem() {
        let step = parse_step(Path::new("/r/notify.yaml"), "type: shell\ncommand: 'true'\n").unwrap();
        assert_eq!(step.base_name(), "notify");
    }

    #[test]
    fn test_dc005_unknown_kind() {
        let err = parse_step(Path::new("/r/x.yaml"), "type: ftp\n").unwrap_err();
        assert!(err.is_load_error());
        assert!(err.to_string().contains("/r/x.yaml"));
    }

    #[test]
    fn test_dc005_missing_type() {
        assert!(parse_step(Path::new("/r/x.yaml"), "priority: 1\n").is_err());
    }

    #[test]
    fn test_dc005_exclusive_options_in_file() {
        let err = parse_step(
            Path::new("/r/x.yaml"),
            "type: migration\nsteps: 1\ntarget_version: 4\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_dc005_bare_negation_rejected() {
        assert!(parse_step(Path::new("/r/x.yaml"), "type: shell\ntags: ['!']\n").is_err());
    }

    #[test]
    fn test_dc005_invalid_yaml() {
        assert!(parse_step(Path::new("/r/x.yaml"), "not: [valid: yaml: {{").is_err());
    }

    #[test]
    fn test_dc005_settings_absent_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let s = parse_settings(dir.path()).unwrap();
        assert_eq!(s.mode, RunMode::Sequential);

        std::fs::write(dir.path().join(SETTINGS_FILE), "mode: parallel\n").unwrap();
        let s = parse_settings(dir.path()).unwrap();
        assert_eq!(s.mode, RunMode::Parallel);
    }

    #[test]
    fn test_dc005_settings_bad_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "mode: sideways\n").unwrap();
        assert!(parse_settings(dir.path()).unwrap_err().is_load_error());
    }

    #[test]
    fn test_dc005_parse_step_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.yaml");
        std::fs::write(&path, "type: template\ncontent: x\noutput: out.txt\n").unwrap();
        let step = parse_step_file(&path).unwrap();
        assert_eq!(step.header.kind, StepKind::Template);
        assert!(parse_step_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_dc005_empty_datasources_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasources.yaml");
        std::fs::write(&path, "\n").unwrap();
        assert!(parse_datasources_file(&path).unwrap().datasources.is_empty());
    }
}
