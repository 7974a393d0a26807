//! DC-011: Templated SQL scripts.

use super::{commit_session, instance_name, open_session, recipe_vars, rollback_session, StepBase};
use crate::connect::database::Session;
use crate::core::error::{Error, Result};
use crate::core::parser::StepFile;
use crate::core::registry::Datasource;
use crate::core::step::{bound, LoadScope, Step, StepContext, StepFactory};
use crate::core::template::{self, TemplateScope};
use crate::core::types::{ConnectPolicy, DatasourceKind, Overrides, StepKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

#[derive(Debug, Deserialize)]
struct SqlBody {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    files: Vec<PathBuf>,
}

/// One rendered script and where it came from.
#[derive(Debug, Clone)]
pub struct SqlUnit {
    pub label: String,
    pub text: String,
}

/// Render every `(label, text)` source against one datasource.
pub fn render_units(sources: &[(String, String)], scope: &TemplateScope<'_>) -> Result<Vec<SqlUnit>> {
    sources
        .iter()
        .map(|(label, text)| {
            template::render(text, scope)
                .map(|text| SqlUnit {
                    label: label.clone(),
                    text,
                })
                .map_err(|e| Error::template(format!("{}: {}", label, e)))
        })
        .collect()
}

pub struct SqlFactory;

impl StepFactory for SqlFactory {
    fn kind(&self) -> StepKind {
        StepKind::Sql
    }

    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
        let body: SqlBody = file.body()?;
        if body.sql.is_none() && body.files.is_empty() {
            return Err(Error::config(&file.path, "sql step needs `sql` or `files`"));
        }

        let mut sources = Vec::new();
        if let Some(sql) = body.sql {
            sources.push(("inline".to_string(), sql));
        }
        for f in &body.files {
            let path = scope.folder.join(f);
            let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            sources.push((f.display().to_string(), text));
        }

        let base = file.base_name();
        let extra = recipe_vars(scope.recipe);
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        for ds in scope.select(file, Some(DatasourceKind::Database), None) {
            let tscope = TemplateScope::new()
                .with_datasource(&ds)
                .with_params(&scope.settings.params)
                .with_extra(&extra);
            let units = render_units(&sources, &tscope)
                .map_err(|e| Error::config(&file.path, e.to_string()))?;

            steps.push(Box::new(SqlStep {
                base: StepBase::new(
                    instance_name(&base, &ds.name),
                    StepKind::Sql,
                    &file.header.options,
                ),
                datasource: Arc::downgrade(&ds),
                policy: scope.settings.connect.clone(),
                units,
                session: None,
            }));
        }
        Ok(steps)
    }
}

pub struct SqlStep {
    base: StepBase,
    datasource: Weak<Datasource>,
    policy: ConnectPolicy,
    units: Vec<SqlUnit>,
    session: Option<Session>,
}

#[async_trait]
impl Step for SqlStep {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Sql
    }

    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.base.post_load(overrides, span)
    }

    async fn init(&mut self, _ctx: &StepContext) -> Result<()> {
        let ds = bound(&self.datasource)?;
        self.session = Some(Session::open(&ds, &self.policy).await?);
        Ok(())
    }

    async fn to_skip(&mut self, _ctx: &StepContext) -> Result<bool> {
        Ok(self.base.decided().unwrap_or_else(|| self.units.is_empty()))
    }

    async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
        let session = open_session(&mut self.session, &self.base.name)?;
        for unit in &self.units {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let rows = session.execute(&unit.text).await?;
            tracing::debug!(parent: &ctx.span, unit = %unit.label, rows, "sql executed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::tests::db_ds;
    use crate::core::registry::Registry;
    use crate::core::step::LoadFilter;
    use crate::core::types::{Engine, Settings};
    use std::path::Path;

    fn recipe_folder() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("datasources.yaml"),
            r#"
datasources:
  fr:
    type: database
    engine: postgres
    tags: ["env:fr"]
    host: localhost
    user: app
    database: shop_fr
  de:
    type: database
    engine: mysql
    tags: ["env:de"]
    host: localhost
    user: app
    database: shop_de
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("grants.sql"),
            "GRANT SELECT ON ALL TABLES TO {{params.reader}};",
        )
        .unwrap();
        dir
    }

    fn build(folder: &Path, yaml: &str) -> Result<Vec<Box<dyn Step>>> {
        let registry = Registry::load_all(folder).unwrap();
        let mut settings = Settings::default();
        settings
            .params
            .insert("reader".into(), serde_yaml_ng::Value::String("ro".into()));
        let filter = LoadFilter::default();
        let scope = LoadScope {
            recipe: "shop",
            folder,
            registry: &registry,
            settings: &settings,
            filter: &filter,
        };
        let file = crate::core::parser::parse_step(&folder.join("setup.yaml"), yaml).unwrap();
        SqlFactory.build(&file, &scope)
    }

    #[test]
    fn test_dc011_sql_rendered_per_datasource() {
        let dir = recipe_folder();
        let steps = build(
            dir.path(),
            "type: sql\nsql: \"-- {{recipe}}\\nCREATE SCHEMA {{ds.tag.env}};\"\nfiles: [grants.sql]\n",
        )
        .unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["setup@fr", "setup@de"]);
    }

    #[test]
    fn test_dc011_sql_units_text() {
        let ds = db_ds("de", Engine::Mysql, &["env:de"]);
        let extra = recipe_vars("shop");
        let scope = TemplateScope::new().with_datasource(&ds).with_extra(&extra);
        let sources = vec![
            ("inline".to_string(), "USE {{ds.database}};".to_string()),
            ("tag.sql".to_string(), "-- {{recipe}} {{ds.tag.env}}".to_string()),
        ];
        let units = render_units(&sources, &scope).unwrap();
        assert_eq!(units[0].text, "USE app;");
        assert_eq!(units[1].label, "tag.sql");
        assert_eq!(units[1].text, "-- shop de");

        let bad = vec![("broken.sql".to_string(), "{{ds.path}}".to_string())];
        let err = render_units(&bad, &scope).unwrap_err();
        assert!(err.to_string().contains("broken.sql"));
    }

    #[test]
    fn test_dc011_sql_needs_content() {
        let dir = recipe_folder();
        let err = build(dir.path(), "type: sql\n").unwrap_err();
        assert!(err.is_load_error());
    }

    #[test]
    fn test_dc011_sql_template_error_is_load_error() {
        let dir = recipe_folder();
        let err = build(dir.path(), "type: sql\nsql: \"SELECT {{params.nope}}\"\n").unwrap_err();
        assert!(err.is_load_error());
        assert!(err.to_string().contains("inline"));
    }

    #[test]
    fn test_dc011_sql_missing_file() {
        let dir = recipe_folder();
        assert!(build(dir.path(), "type: sql\nfiles: [absent.sql]\n").is_err());
    }
}
