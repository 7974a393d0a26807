//! DC-011: Copy records from a file datasource into other datasources.
//!
//! File targets are re-encoded in their own format through a staging file.
//! Database targets receive batched `INSERT`s inside the step's session.

use super::codec::{self, Record};
use super::{
    commit_session, commit_staged, discard_staged, instance_name, open_session, prepare_output,
    rollback_session, stage, staging_path, StepBase,
};
use crate::connect::database::Session;
use crate::core::error::{Error, Result};
use crate::core::parser::StepFile;
use crate::core::registry::{Datasource, Endpoint};
use crate::core::step::{bound, LoadScope, Step, StepContext, StepFactory};
use crate::core::types::{ConnectPolicy, DatasourceKind, Engine, Overrides, StepKind};
use crate::journal::hasher::{hash_file_if_exists, hash_string};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
struct SyncBody {
    source: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Where a sync step writes.
enum Target {
    File {
        engine: Engine,
        output: PathBuf,
        staging: PathBuf,
        encoded: Option<String>,
    },
    Database {
        datasource: Weak<Datasource>,
        policy: ConnectPolicy,
        table: String,
        batch_size: usize,
        session: Option<Session>,
    },
}

pub struct SyncFactory;

impl StepFactory for SyncFactory {
    fn kind(&self) -> StepKind {
        StepKind::Sync
    }

    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
        let body: SyncBody = file.body()?;
        let fail = |msg: String| Error::config(&file.path, msg);

        let source = scope
            .registry
            .get(&body.source)
            .ok_or_else(|| fail(format!("unknown source datasource '{}'", body.source)))?;
        if source.kind != DatasourceKind::File {
            return Err(fail(format!("source '{}' is not a file datasource", body.source)));
        }
        if body.batch_size == 0 {
            return Err(fail("batch_size must be at least 1".to_string()));
        }
        if let Some(table) = &body.table {
            codec::check_identifier(table).map_err(|e| fail(e.to_string()))?;
        }

        let base = file.base_name();
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        for ds in scope.select(file, None, None) {
            if ds.name == source.name {
                continue;
            }
            let target = match &ds.endpoint {
                Endpoint::File(path) => Target::File {
                    engine: ds.engine,
                    output: path.clone(),
                    staging: staging_path(path),
                    encoded: None,
                },
                Endpoint::Database(_) => {
                    let table = body.table.clone().ok_or_else(|| {
                        fail(format!("database target '{}' needs a `table`", ds.name))
                    })?;
                    Target::Database {
                        datasource: Arc::downgrade(&ds),
                        policy: scope.settings.connect.clone(),
                        table,
                        batch_size: body.batch_size,
                        session: None,
                    }
                }
            };
            steps.push(Box::new(SyncStep {
                base: StepBase::new(
                    instance_name(&base, &ds.name),
                    StepKind::Sync,
                    &file.header.options,
                ),
                source: Arc::downgrade(source),
                records: Vec::new(),
                target,
            }));
        }
        Ok(steps)
    }
}

pub struct SyncStep {
    base: StepBase,
    source: Weak<Datasource>,
    records: Vec<Record>,
    target: Target,
}

/// Read and decode every record of a file datasource.
async fn read_source(ds: &Datasource) -> Result<Vec<Record>> {
    let path = ds
        .file_path()
        .ok_or_else(|| Error::datasource(&ds.name, "not a file datasource"))?;
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    codec::decode(ds.engine, &text)
}

#[async_trait]
impl Step for SyncStep {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Sync
    }

    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.base.post_load(overrides, span)
    }

    async fn init(&mut self, ctx: &StepContext) -> Result<()> {
        let source = bound(&self.source)?;
        self.records = read_source(&source).await?;
        tracing::debug!(parent: &ctx.span, source = %source.name, records = self.records.len(), "source read");

        match &mut self.target {
            Target::File {
                engine,
                output,
                encoded,
                ..
            } => {
                prepare_output(output).await?;
                *encoded = Some(codec::encode(*engine, &self.records)?);
            }
            Target::Database {
                datasource,
                policy,
                session,
                ..
            } => {
                let ds = bound(datasource)?;
                *session = Some(Session::open(&ds, policy).await?);
            }
        }
        Ok(())
    }

    async fn to_skip(&mut self, _ctx: &StepContext) -> Result<bool> {
        if let Some(decided) = self.base.decided() {
            return Ok(decided);
        }
        match &self.target {
            Target::File {
                output, encoded, ..
            } => {
                let current = hash_file_if_exists(output)?;
                let wanted = encoded.as_deref().map(hash_string);
                Ok(current.is_some() && current == wanted)
            }
            Target::Database { .. } => Ok(self.records.is_empty()),
        }
    }

    async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
        match &mut self.target {
            Target::File {
                staging, encoded, ..
            } => {
                let text = encoded.as_deref().unwrap_or_default();
                stage(staging, text).await?;
            }
            Target::Database {
                table,
                batch_size,
                session,
                ..
            } => {
                let session = open_session(session, &self.base.name)?;
                let columns = codec::columns(&self.records);
                for (n, batch) in self.records.chunks(*batch_size).enumerate() {
                    if ctx.is_cancelled() {
                        tracing::info!(parent: &ctx.span, batches_done = n, "sync interrupted");
                        return Ok(());
                    }
                    let sql = codec::insert_statement(table, &columns, batch)?;
                    session.execute(&sql).await?;
                }
                tracing::debug!(parent: &ctx.span, rows = self.records.len(), table = %table, "rows inserted");
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StepContext) {
        match &mut self.target {
            Target::File { staging, .. } => discard_staged(staging).await,
            Target::Database { session, .. } => rollback_session(session, &self.base.name).await,
        }
    }

    async fn finish(&mut self, _ctx: &StepContext) -> Result<()> {
        match &mut self.target {
            Target::File {
                staging, output, ..
            } => commit_staged(staging, output).await,
            Target::Database { session, .. } => commit_session(session).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Registry;
    use crate::core::step::LoadFilter;
    use crate::core::types::Settings;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    const DATASOURCES: &str = r#"
datasources:
  seed:
    type: file
    engine: csv
    path: seed.csv
  export:
    type: file
    engine: json
    tags: [export]
    path: out/users.json
  mirror:
    type: file
    engine: yaml
    tags: [export]
    path: out/users.yaml
  warehouse:
    type: database
    engine: postgres
    tags: [db]
    host: localhost
    user: app
    database: dw
"#;

    const EXPORT: &str = "type: sync\nsource: seed\ntags: [export]\n";

    fn recipe_folder() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("datasources.yaml"), DATASOURCES).unwrap();
        std::fs::write(dir.path().join("seed.csv"), "id,name\n1,Ada\n2,Lin\n").unwrap();
        dir
    }

    /// The registry must outlive the steps: they hold weak bindings into it.
    fn build(registry: &Registry, folder: &Path, yaml: &str) -> Result<Vec<Box<dyn Step>>> {
        let settings = Settings::default();
        let filter = LoadFilter::default();
        let scope = LoadScope {
            recipe: "shop",
            folder,
            registry,
            settings: &settings,
            filter: &filter,
        };
        let file = crate::core::parser::parse_step(&folder.join("users.yaml"), yaml).unwrap();
        SyncFactory.build(&file, &scope)
    }

    fn names(steps: &[Box<dyn Step>]) -> Vec<String> {
        steps.iter().map(|s| s.name().to_string()).collect()
    }

    fn ctx() -> StepContext {
        StepContext::new("shop", "users", tracing::Span::none(), CancellationToken::new())
    }

    #[test]
    fn test_dc011_sync_targets_exclude_source() {
        let dir = recipe_folder();
        let registry = Registry::load_all(dir.path()).unwrap();
        let steps = build(&registry, dir.path(), "type: sync\nsource: seed\ntable: users\n").unwrap();
        assert_eq!(
            names(&steps),
            vec!["users@export", "users@mirror", "users@warehouse"]
        );
    }

    #[test]
    fn test_dc011_sync_load_errors() {
        let dir = recipe_folder();
        let cases = [
            "type: sync\nsource: nope\n",
            "type: sync\nsource: warehouse\n",
            "type: sync\nsource: seed\ntags: [db]\n",
            "type: sync\nsource: seed\ntable: \"bad name\"\n",
            "type: sync\nsource: seed\nbatch_size: 0\ntags: [export]\n",
        ];
        let registry = Registry::load_all(dir.path()).unwrap();
        for yaml in cases {
            let err = build(&registry, dir.path(), yaml).unwrap_err();
            assert!(err.is_load_error(), "{}: {}", yaml, err);
        }
    }

    #[tokio::test]
    async fn test_dc011_sync_file_targets() {
        let dir = recipe_folder();
        let registry = Registry::load_all(dir.path()).unwrap();
        let mut steps = build(&registry, dir.path(), EXPORT).unwrap();
        let ctx = ctx();
        for step in steps.iter_mut() {
            step.init(&ctx).await.unwrap();
            assert!(!step.to_skip(&ctx).await.unwrap());
            step.execute(&ctx).await.unwrap();
            step.finish(&ctx).await.unwrap();
        }

        let json = std::fs::read_to_string(dir.path().join("out/users.json")).unwrap();
        let records = codec::decode(Engine::Json, &json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["name"], serde_json::json!("Lin"));
        let yaml = std::fs::read_to_string(dir.path().join("out/users.yaml")).unwrap();
        assert!(yaml.contains("name: Ada"));

        // rerun: targets already hold the data
        let mut again = build(&registry, dir.path(), EXPORT).unwrap();
        for step in again.iter_mut() {
            step.init(&ctx).await.unwrap();
            assert!(step.to_skip(&ctx).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_dc011_sync_cancel_discards_staging() {
        let dir = recipe_folder();
        let registry = Registry::load_all(dir.path()).unwrap();
        let mut steps = build(&registry, dir.path(), EXPORT).unwrap();
        let ctx = ctx();
        let step = &mut steps[0];
        step.init(&ctx).await.unwrap();
        step.execute(&ctx).await.unwrap();
        let output = dir.path().join("out/users.json");
        assert!(staging_path(&output).exists());
        step.cancel(&ctx).await;
        assert!(!staging_path(&output).exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_dc011_sync_missing_source_file_fails_init() {
        let dir = recipe_folder();
        std::fs::remove_file(dir.path().join("seed.csv")).unwrap();
        let registry = Registry::load_all(dir.path()).unwrap();
        let mut steps = build(&registry, dir.path(), EXPORT).unwrap();
        assert!(steps[0].init(&ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_dc011_sync_released_registry_fails_init() {
        let dir = recipe_folder();
        let mut steps = {
            let registry = Registry::load_all(dir.path()).unwrap();
            build(&registry, dir.path(), EXPORT).unwrap()
        };
        let err = steps[0].init(&ctx()).await.unwrap_err();
        assert!(err.to_string().contains("registry was closed"), "{}", err);
    }
}
