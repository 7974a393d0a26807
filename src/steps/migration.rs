//! DC-011: Versioned SQL migrations.
//!
//! Files named `<version>_<name>.sql` are applied in version order inside
//! the step's session. Applied versions are tracked in a table on the
//! datasource itself, so a re-run only applies what is pending.

use super::{commit_session, instance_name, open_session, rollback_session, StepBase};
use crate::connect::database::Session;
use crate::core::error::{Error, Result};
use crate::core::parser::StepFile;
use crate::core::registry::Datasource;
use crate::core::step::{bound, LoadScope, Step, StepContext, StepFactory};
use crate::core::types::{ConnectPolicy, DatasourceKind, Overrides, StepKind, StepOptions};
use crate::journal::eventlog::now_iso8601;
use crate::steps::codec::{check_identifier, quote};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

/// Tracking table used when the step file names none.
pub const DEFAULT_TABLE: &str = "dbchef_migrations";

static MIGRATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_([A-Za-z0-9_\-]+)\.sql$").expect("migration file pattern is valid")
});

#[derive(Debug, Deserialize)]
struct MigrationBody {
    migrations: PathBuf,
    #[serde(default = "default_table")]
    table: String,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

/// One migration file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
}

/// List the migrations in a directory, ordered by version. Files that do not
/// follow the naming scheme are ignored; two files sharing a version are an
/// error.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(caps) = MIGRATION_RE.captures(&file_name) else {
            continue;
        };
        let version: i64 = caps[1].parse().map_err(|_| {
            Error::Migration(format!("version of '{}' is out of range", file_name))
        })?;
        files.push(MigrationFile {
            version,
            name: caps[2].to_string(),
            path: entry.path(),
        });
    }
    files.sort_by_key(|f| f.version);

    for pair in files.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(Error::Migration(format!(
                "duplicate migration version {}: {} and {}",
                pair[0].version,
                pair[0].path.display(),
                pair[1].path.display()
            )));
        }
    }
    Ok(files)
}

/// Migrations still to apply, honouring the `steps` limit or the
/// `target_version` ceiling.
pub fn pending(
    files: &[MigrationFile],
    applied: &BTreeSet<i64>,
    options: &StepOptions,
) -> Vec<MigrationFile> {
    let limit = options.steps.map_or(usize::MAX, |n| n as usize);
    files
        .iter()
        .filter(|f| !applied.contains(&f.version))
        .filter(|f| options.target_version.is_none_or(|t| f.version <= t))
        .take(limit)
        .cloned()
        .collect()
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (version BIGINT PRIMARY KEY, name VARCHAR(255) NOT NULL, applied_at VARCHAR(32) NOT NULL)",
        table
    )
}

fn record_sql(table: &str, file: &MigrationFile) -> String {
    format!(
        "INSERT INTO {} (version, name, applied_at) VALUES ({}, {}, {})",
        table,
        file.version,
        quote(&file.name),
        quote(&now_iso8601())
    )
}

pub struct MigrationFactory;

impl StepFactory for MigrationFactory {
    fn kind(&self) -> StepKind {
        StepKind::Migration
    }

    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
        let body: MigrationBody = file.body()?;
        check_identifier(&body.table).map_err(|e| Error::config(&file.path, e.to_string()))?;
        let dir = scope.folder.join(&body.migrations);
        if !dir.is_dir() {
            return Err(Error::config(
                &file.path,
                format!("migrations directory {} does not exist", dir.display()),
            ));
        }
        let files = discover(&dir).map_err(|e| Error::config(&file.path, e.to_string()))?;

        let base = file.base_name();
        let steps = scope
            .select(file, Some(DatasourceKind::Database), None)
            .iter()
            .map(|ds| {
                Box::new(MigrationStep {
                    base: StepBase::new(
                        instance_name(&base, &ds.name),
                        StepKind::Migration,
                        &file.header.options,
                    ),
                    datasource: Arc::downgrade(ds),
                    policy: scope.settings.connect.clone(),
                    table: body.table.clone(),
                    files: files.clone(),
                    pending: Vec::new(),
                    session: None,
                }) as Box<dyn Step>
            })
            .collect();
        Ok(steps)
    }
}

pub struct MigrationStep {
    base: StepBase,
    datasource: Weak<Datasource>,
    policy: ConnectPolicy,
    table: String,
    files: Vec<MigrationFile>,
    pending: Vec<MigrationFile>,
    session: Option<Session>,
}

#[async_trait]
impl Step for MigrationStep {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Migration
    }

    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.base.post_load(overrides, span)
    }

    async fn init(&mut self, ctx: &StepContext) -> Result<()> {
        let ds = bound(&self.datasource)?;
        let mut session = Session::open(&ds, &self.policy).await?;
        session.execute(&create_table_sql(&self.table)).await?;
        let applied: BTreeSet<i64> = session
            .fetch_i64(&format!("SELECT version FROM {}", self.table))
            .await?
            .into_iter()
            .collect();
        self.pending = pending(&self.files, &applied, &self.base.options);
        self.session = Some(session);
        tracing::info!(
            parent: &ctx.span,
            datasource = %ds.name,
            applied = applied.len(),
            pending = self.pending.len(),
            "migration state read"
        );
        Ok(())
    }

    async fn to_skip(&mut self, _ctx: &StepContext) -> Result<bool> {
        Ok(self
            .base
            .decided()
            .unwrap_or_else(|| self.pending.is_empty()))
    }

    async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
        let session = open_session(&mut self.session, &self.base.name)?;
        for file in &self.pending {
            if ctx.is_cancelled() {
                tracing::info!(parent: &ctx.span, version = file.version, "migration interrupted");
                return Ok(());
            }
            let sql = tokio::fs::read_to_string(&file.path)
                .await
                .map_err(|e| Error::io(&file.path, e))?;
            session.execute(&sql).await.map_err(|e| {
                Error::Migration(format!("{}_{}: {}", file.version, file.name, e))
            })?;
            session.execute(&record_sql(&self.table, file)).await?;
            tracing::info!(parent: &ctx.span, version = file.version, name = %file.name, "migration applied");
        }
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StepContext) {
        rollback_session(&mut self.session, &self.base.name).await;
    }

    async fn finish(&mut self, _ctx: &StepContext) -> Result<()> {
        commit_session(&mut self.session).await
    }
}
