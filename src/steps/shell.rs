//! DC-011: Shell commands bound to a set of datasources.
//!
//! Unlike the other kinds a shell step does not fan out: one step covers
//! every selected datasource, exposed to the command as `{{datasources}}`.

use super::{recipe_vars, StepBase};
use crate::connect::shell::exec_local;
use crate::core::error::{Error, Result};
use crate::core::parser::StepFile;
use crate::core::registry::Datasource;
use crate::core::step::{bound, LoadScope, Step, StepContext, StepFactory};
use crate::core::template::{self, TemplateScope};
use crate::core::types::{Overrides, StepKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Weak};

#[derive(Debug, Deserialize)]
struct ShellBody {
    command: String,
    /// Guard command; a zero exit means there is nothing to do
    #[serde(default)]
    unless: Option<String>,
}

pub struct ShellFactory;

impl StepFactory for ShellFactory {
    fn kind(&self) -> StepKind {
        StepKind::Shell
    }

    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
        let body: ShellBody = file.body()?;
        let selected = scope.select(file, None, None);
        let names: Vec<&str> = selected.iter().map(|ds| ds.name.as_str()).collect();

        let mut extra = recipe_vars(scope.recipe);
        extra.insert("datasources".to_string(), names.join(","));
        let tscope = TemplateScope::new()
            .with_params(&scope.settings.params)
            .with_extra(&extra);
        let render = |text: &str| {
            template::render(text, &tscope).map_err(|e| Error::config(&file.path, e.to_string()))
        };

        let step = ShellStep {
            base: StepBase::new(file.base_name(), StepKind::Shell, &file.header.options),
            command: render(&body.command)?,
            unless: body.unless.as_deref().map(render).transpose()?,
            datasources: selected.iter().map(Arc::downgrade).collect(),
        };
        Ok(vec![Box::new(step)])
    }
}

pub struct ShellStep {
    base: StepBase,
    command: String,
    unless: Option<String>,
    datasources: Vec<Weak<Datasource>>,
}

impl ShellStep {
    async fn run(&self, script: &str, ctx: &StepContext) -> Result<Option<crate::connect::ExecOutput>> {
        let out = exec_local(script, &ctx.cancel).await?;
        if let Some(out) = &out {
            tracing::debug!(
                parent: &ctx.span,
                exit_code = out.exit_code,
                stdout = %out.stdout.trim_end(),
                "shell command returned"
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl Step for ShellStep {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Shell
    }

    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.base.post_load(overrides, span)
    }

    /// Every bound datasource must still be registered.
    async fn init(&mut self, _ctx: &StepContext) -> Result<()> {
        for ds in &self.datasources {
            bound(ds)?;
        }
        Ok(())
    }

    async fn to_skip(&mut self, ctx: &StepContext) -> Result<bool> {
        if let Some(decided) = self.base.decided() {
            return Ok(decided);
        }
        let Some(unless) = &self.unless else {
            return Ok(false);
        };
        // interrupted guard: fall through, execute sees the cancellation
        Ok(self
            .run(unless, ctx)
            .await?
            .is_some_and(|out| out.success()))
    }

    async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
        let Some(out) = self.run(&self.command, ctx).await? else {
            tracing::info!(parent: &ctx.span, "shell command not started, tier cancelled");
            return Ok(());
        };
        if !out.success() {
            return Err(Error::Command(format!(
                "'{}' exited with {}: {}",
                self.base.name,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn cancel(&mut self, ctx: &StepContext) {
        tracing::debug!(parent: &ctx.span, step = %self.base.name, "shell effects are not rolled back");
    }

    async fn finish(&mut self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}
