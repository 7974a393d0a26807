//! DC-011: Built-in step kinds and the shared pieces they use.

pub mod codec;
pub mod migration;
pub mod shell;
pub mod sql;
pub mod sync;
pub mod template;

use crate::connect::database::Session;
use crate::core::error::{Error, Result};
use crate::core::step::StepFactories;
use crate::core::types::{Overrides, StepKind, StepOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Factory table with every built-in kind registered.
pub fn builtin() -> StepFactories {
    let mut factories = StepFactories::new();
    factories.register(Box::new(migration::MigrationFactory));
    factories.register(Box::new(sql::SqlFactory));
    factories.register(Box::new(shell::ShellFactory));
    factories.register(Box::new(template::TemplateFactory));
    factories.register(Box::new(sync::SyncFactory));
    factories
}

/// Name, kind and resolved options carried by every built-in step.
#[derive(Debug, Clone)]
pub struct StepBase {
    pub name: String,
    pub kind: StepKind,
    pub options: StepOptions,
}

impl StepBase {
    pub fn new(name: String, kind: StepKind, options: &StepOptions) -> Self {
        Self {
            name,
            kind,
            options: options.clone(),
        }
    }

    /// Merge overrides into the options.
    pub fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        self.options.merge(overrides)?;
        tracing::debug!(
            parent: span,
            step = %self.name,
            force = self.options.force,
            dry_run = self.options.dry_run,
            "overrides applied"
        );
        Ok(())
    }

    /// Skip decision fixed by options alone: dry-run always skips, force
    /// never does. `None` means the step's own predicate decides.
    pub fn decided(&self) -> Option<bool> {
        if self.options.dry_run {
            Some(true)
        } else if self.options.force {
            Some(false)
        } else {
            None
        }
    }
}

/// Fan-out step name.
pub fn instance_name(base: &str, datasource: &str) -> String {
    format!("{}@{}", base, datasource)
}

/// Variables every built-in kind exposes besides `ds.*` and `params.*`.
pub fn recipe_vars(recipe: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("recipe".to_string(), recipe.to_string());
    vars
}

/// The session opened by `init`.
pub fn open_session<'a>(session: &'a mut Option<Session>, step: &str) -> Result<&'a mut Session> {
    session
        .as_mut()
        .ok_or_else(|| Error::Command(format!("step '{}' has no open session", step)))
}

/// Commit and release the session, if `init` opened one.
pub async fn commit_session(session: &mut Option<Session>) -> Result<()> {
    match session.take() {
        Some(s) => s.commit().await,
        None => Ok(()),
    }
}

/// Roll back and release the session. Failures are logged, not returned.
pub async fn rollback_session(session: &mut Option<Session>, step: &str) {
    if let Some(s) = session.take() {
        if let Err(e) = s.rollback().await {
            tracing::warn!(step, error = %e, "rollback failed");
        }
    }
}

/// Sibling temp file an output is staged in before it is renamed into place.
pub fn staging_path(output: &Path) -> PathBuf {
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.dbchef.tmp", file_name))
}

/// Make sure the output's directory exists.
pub async fn prepare_output(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    Ok(())
}

/// Write the staged content.
pub async fn stage(staging: &Path, content: &str) -> Result<()> {
    tokio::fs::write(staging, content)
        .await
        .map_err(|e| Error::io(staging, e))
}

/// Move a staged file into place; no-op when nothing was staged.
pub async fn commit_staged(staging: &Path, output: &Path) -> Result<()> {
    if !tokio::fs::try_exists(staging).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::rename(staging, output)
        .await
        .map_err(|e| Error::io(output, e))
}

/// Drop a staged file if there is one.
pub async fn discard_staged(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => tracing::debug!(path = %staging.display(), "staged output discarded"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %staging.display(), error = %e, "cannot remove staged output"),
    }
}
