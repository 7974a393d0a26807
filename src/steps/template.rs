//! DC-011: Rendered files, one per selected datasource.
//!
//! Output goes to a staging file beside the target and is renamed into place
//! on `finish`, so a cancelled tier leaves the previous file untouched.

use super::{commit_staged, discard_staged, instance_name, prepare_output, recipe_vars, stage, staging_path, StepBase};
use crate::core::error::{Error, Result};
use crate::core::parser::StepFile;
use crate::core::step::{LoadScope, Step, StepContext, StepFactory};
use crate::core::template::{self as tpl, TemplateScope};
use crate::core::types::{Overrides, StepKind};
use crate::journal::hasher::{hash_file_if_exists, hash_string};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct TemplateBody {
    #[serde(default)]
    template: Option<PathBuf>,
    #[serde(default)]
    content: Option<String>,
    output: String,
}

pub struct TemplateFactory;

impl StepFactory for TemplateFactory {
    fn kind(&self) -> StepKind {
        StepKind::Template
    }

    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
        let body: TemplateBody = file.body()?;
        let source = match (&body.template, body.content) {
            (Some(path), None) => {
                let path = scope.folder.join(path);
                std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?
            }
            (None, Some(content)) => content,
            _ => {
                return Err(Error::config(
                    &file.path,
                    "template step needs exactly one of `template` or `content`",
                ))
            }
        };

        let base = file.base_name();
        let extra = recipe_vars(scope.recipe);
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        for ds in scope.select(file, None, None) {
            let tscope = TemplateScope::new()
                .with_datasource(&ds)
                .with_params(&scope.settings.params)
                .with_extra(&extra);
            let render = |text: &str| {
                tpl::render(text, &tscope).map_err(|e| Error::config(&file.path, e.to_string()))
            };
            let output = scope.folder.join(render(&body.output)?);
            steps.push(Box::new(TemplateStep {
                base: StepBase::new(
                    instance_name(&base, &ds.name),
                    StepKind::Template,
                    &file.header.options,
                ),
                content: render(&source)?,
                staging: staging_path(&output),
                output,
            }));
        }
        Ok(steps)
    }
}

pub struct TemplateStep {
    base: StepBase,
    content: String,
    output: PathBuf,
    staging: PathBuf,
}

#[async_trait]
impl Step for TemplateStep {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Template
    }

    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.base.post_load(overrides, span)
    }

    async fn init(&mut self, _ctx: &StepContext) -> Result<()> {
        prepare_output(&self.output).await
    }

    /// Up to date when the output already holds the rendered content.
    async fn to_skip(&mut self, _ctx: &StepContext) -> Result<bool> {
        if let Some(decided) = self.base.decided() {
            return Ok(decided);
        }
        let current = hash_file_if_exists(&self.output)?;
        Ok(current.as_deref() == Some(hash_string(&self.content).as_str()))
    }

    async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
        stage(&self.staging, &self.content).await?;
        tracing::debug!(parent: &ctx.span, output = %self.output.display(), "output staged");
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StepContext) {
        discard_staged(&self.staging).await;
    }

    async fn finish(&mut self, ctx: &StepContext) -> Result<()> {
        commit_staged(&self.staging, &self.output).await?;
        tracing::info!(parent: &ctx.span, output = %self.output.display(), "output written");
        Ok(())
    }
}
