//! DC-006: Step lifecycle contract and the kind-keyed factory registry.
//!
//! Lifecycle: `post_load* → init → {to_skip → execute} → finish | cancel`.
//! Exactly one of `finish`/`cancel` is called on a step whose `init`
//! succeeded; neither is called when `init` fails. The scheduler enforces
//! this, steps only implement the hooks.

use super::error::{Error, Result};
use super::parser::{self, StepFile};
use super::registry::{Datasource, Registry};
use super::types::{Overrides, Settings, StepKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// What every lifecycle hook (after `post_load`) receives.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub recipe: String,
    pub step: String,
    pub span: tracing::Span,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(recipe: &str, step: &str, span: tracing::Span, cancel: CancellationToken) -> Self {
        Self {
            recipe: recipe.to_string(),
            step: step.to_string(),
            span,
            cancel,
        }
    }

    /// Non-blocking poll, used between units of bulk work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of work bound to zero or more datasources.
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Merge superseding overrides into the resolved options.
    fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()>;

    /// Acquire external resources.
    async fn init(&mut self, ctx: &StepContext) -> Result<()>;

    /// True when there is nothing to do; `execute` is then never called.
    async fn to_skip(&mut self, ctx: &StepContext) -> Result<bool>;

    /// Perform the effect. Returns `Ok(())` as soon as cancellation is seen.
    async fn execute(&mut self, ctx: &StepContext) -> Result<()>;

    /// Roll back partial effects and release resources.
    async fn cancel(&mut self, ctx: &StepContext);

    /// Commit pending effects and release resources.
    async fn finish(&mut self, ctx: &StepContext) -> Result<()>;
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Shared handle so a worker and its watchdog can both reach the step.
#[derive(Clone)]
pub struct StepHandle {
    name: String,
    kind: StepKind,
    inner: Arc<Mutex<Box<dyn Step>>>,
}

impl StepHandle {
    pub fn new(step: Box<dyn Step>) -> Self {
        Self {
            name: step.name().to_string(),
            kind: step.kind(),
            inner: Arc::new(Mutex::new(step)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Box<dyn Step>> {
        self.inner.lock().await
    }

    /// Apply overrides. Only possible while no run holds the step.
    pub fn post_load(&mut self, overrides: &Overrides, span: &tracing::Span) -> Result<()> {
        let step = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| Error::Override(format!("step '{}' is running", self.name)))?
            .get_mut();
        step.post_load(overrides, span)
    }
}

impl std::fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Upgrade a step's weak datasource binding.
pub fn bound(ds: &Weak<Datasource>) -> Result<Arc<Datasource>> {
    ds.upgrade()
        .ok_or_else(|| Error::datasource("<released>", "registry was closed before the step ran"))
}

// ============================================================================
// Loading
// ============================================================================

/// Command-line restrictions applied while loading step files.
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    /// Instance restriction intersected with every step's selectors
    pub tags: Vec<String>,
    /// Keep only steps with these names (base or `base@datasource`)
    pub step_names: Vec<String>,
    /// Keep only steps of these kinds
    pub step_kinds: Vec<StepKind>,
}

impl LoadFilter {
    pub fn limited(&self) -> Option<&[String]> {
        if self.tags.is_empty() {
            None
        } else {
            Some(&self.tags)
        }
    }

    pub fn wants_kind(&self, kind: StepKind) -> bool {
        self.step_kinds.is_empty() || self.step_kinds.contains(&kind)
    }

    pub fn wants_name(&self, name: &str) -> bool {
        if self.step_names.is_empty() {
            return true;
        }
        let base = name.split('@').next().unwrap_or(name);
        self.step_names.iter().any(|n| n == name || n == base)
    }
}

/// Everything a factory may consult while building steps from a file.
pub struct LoadScope<'a> {
    pub recipe: &'a str,
    pub folder: &'a Path,
    pub registry: &'a Registry,
    pub settings: &'a Settings,
    pub filter: &'a LoadFilter,
}

impl LoadScope<'_> {
    /// Resolve a step's selectors against the registry, honouring the
    /// instance restriction.
    pub fn select(
        &self,
        file: &StepFile,
        kind: Option<super::types::DatasourceKind>,
        engine: Option<super::types::Engine>,
    ) -> Vec<Arc<Datasource>> {
        let selectors = file.header.selectors();
        self.registry
            .lookup(&selectors, self.filter.limited(), kind, engine)
    }
}

/// Constructor for one step kind.
pub trait StepFactory: Send + Sync {
    fn kind(&self) -> StepKind;

    /// Build zero or more steps from a parsed step file.
    fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>>;
}

/// Kind → factory table, resolved once per load.
#[derive(Default)]
pub struct StepFactories {
    by_kind: HashMap<StepKind, Box<dyn StepFactory>>,
}

impl StepFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn StepFactory>) {
        self.by_kind.insert(factory.kind(), factory);
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.by_kind.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Load one step file into `(priority, steps)`. Filtering everything
    /// out is not an error.
    pub fn load_step_file(
        &self,
        path: &Path,
        scope: &LoadScope<'_>,
    ) -> Result<(i32, Vec<Box<dyn Step>>)> {
        let file = parser::parse_step_file(path)?;
        let priority = file.header.priority;
        if !scope.filter.wants_kind(file.header.kind) {
            return Ok((priority, Vec::new()));
        }

        let factory = self.by_kind.get(&file.header.kind).ok_or_else(|| {
            Error::config(path, format!("no factory for step kind '{}'", file.header.kind))
        })?;

        let mut steps = factory.build(&file, scope)?;
        steps.retain(|s| scope.filter.wants_name(s.name()));
        tracing::debug!(
            file = %path.display(),
            kind = %file.header.kind,
            priority,
            steps = steps.len(),
            "step file loaded"
        );
        Ok((priority, steps))
    }
}

impl std::fmt::Debug for StepFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepFactories")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::registry::tests::file_ds;
    use crate::core::types::Engine;
    use std::sync::Mutex as StdMutex;

    /// Shared log of lifecycle calls, `"<step>:<hook>"`.
    pub(crate) type CallLog = Arc<StdMutex<Vec<String>>>;

    pub(crate) fn calls(log: &CallLog, step: &str) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.strip_prefix(&format!("{}:", step)).map(str::to_string))
            .collect()
    }

    /// Scripted behaviour of a mock step.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub(crate) enum Behavior {
        #[default]
        Succeed,
        FailInit,
        FailSkip,
        Skip,
        FailExecute,
        FailFinish,
        /// Block in execute until the tier is cancelled, then return cleanly
        AwaitCancel,
        /// Fail in execute after a short delay
        FailExecuteLate,
    }

    pub(crate) struct MockStep {
        pub name: String,
        pub behavior: Behavior,
        pub log: CallLog,
        pub forced: bool,
    }

    impl MockStep {
        pub(crate) fn boxed(name: &str, behavior: Behavior, log: &CallLog) -> Box<dyn Step> {
            Box::new(Self {
                name: name.to_string(),
                behavior,
                log: Arc::clone(log),
                forced: false,
            })
        }

        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, hook));
        }
    }

    #[async_trait]
    impl Step for MockStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> StepKind {
            StepKind::Shell
        }

        fn post_load(&mut self, overrides: &Overrides, _span: &tracing::Span) -> Result<()> {
            let mut options = crate::core::types::StepOptions::default();
            options.merge(overrides)?;
            self.forced = options.force;
            self.record("post_load");
            Ok(())
        }

        async fn init(&mut self, _ctx: &StepContext) -> Result<()> {
            self.record("init");
            if self.behavior == Behavior::FailInit {
                return Err(Error::Command("init refused".into()));
            }
            Ok(())
        }

        async fn to_skip(&mut self, _ctx: &StepContext) -> Result<bool> {
            self.record("to_skip");
            match self.behavior {
                Behavior::FailSkip => Err(Error::Command("skip check failed".into())),
                Behavior::Skip => Ok(!self.forced),
                _ => Ok(false),
            }
        }

        async fn execute(&mut self, ctx: &StepContext) -> Result<()> {
            self.record("execute");
            match self.behavior {
                Behavior::FailExecute => Err(Error::Command("boom".into())),
                Behavior::FailExecuteLate => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    Err(Error::Command("late boom".into()))
                }
                Behavior::AwaitCancel => {
                    ctx.cancel.cancelled().await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn cancel(&mut self, _ctx: &StepContext) {
            self.record("cancel");
        }

        async fn finish(&mut self, _ctx: &StepContext) -> Result<()> {
            self.record("finish");
            if self.behavior == Behavior::FailFinish {
                return Err(Error::Command("commit failed".into()));
            }
            Ok(())
        }
    }

    /// Factory building one mock step per selected datasource.
    pub(crate) struct MockFactory {
        pub log: CallLog,
    }

    impl StepFactory for MockFactory {
        fn kind(&self) -> StepKind {
            StepKind::Shell
        }

        fn build(&self, file: &StepFile, scope: &LoadScope<'_>) -> Result<Vec<Box<dyn Step>>> {
            let base = file.base_name();
            Ok(scope
                .select(file, None, None)
                .iter()
                .map(|ds| {
                    MockStep::boxed(&format!("{}@{}", base, ds.name), Behavior::Succeed, &self.log)
                })
                .collect())
        }
    }

    fn scope_fixture() -> (Registry, Settings) {
        let registry = Registry::from_datasources(vec![
            file_ds("a", Engine::Json, &["env:fr"]),
            file_ds("b", Engine::Json, &[]),
        ]);
        (registry, Settings::default())
    }

    fn load(filter: &LoadFilter, yaml: &str) -> Result<(i32, Vec<String>)> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.yaml");
        std::fs::write(&path, yaml).unwrap();
        let (registry, settings) = scope_fixture();
        let scope = LoadScope {
            recipe: "r",
            folder: dir.path(),
            registry: &registry,
            settings: &settings,
            filter,
        };
        let log = CallLog::default();
        let mut factories = StepFactories::new();
        factories.register(Box::new(MockFactory { log }));
        let (priority, steps) = factories.load_step_file(&path, &scope)?;
        Ok((priority, steps.iter().map(|s| s.name().to_string()).collect()))
    }

    #[test]
    fn test_dc006_fan_out_per_datasource() {
        let (priority, names) = load(&LoadFilter::default(), "type: shell\npriority: 3\n").unwrap();
        assert_eq!(priority, 3);
        assert_eq!(names, vec!["notify@a", "notify@b"]);
    }

    #[test]
    fn test_dc006_tag_restriction() {
        let filter = LoadFilter {
            tags: vec!["env:fr".into()],
            ..Default::default()
        };
        let (_, names) = load(&filter, "type: shell\n").unwrap();
        assert_eq!(names, vec!["notify@a"]);
    }

    #[test]
    fn test_dc006_kind_filter_drops_file() {
        let filter = LoadFilter {
            step_kinds: vec![StepKind::Migration],
            ..Default::default()
        };
        let (_, names) = load(&filter, "type: shell\n").unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_dc006_name_filter() {
        let filter = LoadFilter {
            step_names: vec!["notify@b".into()],
            ..Default::default()
        };
        let (_, names) = load(&filter, "type: shell\n").unwrap();
        assert_eq!(names, vec!["notify@b"]);

        let filter = LoadFilter {
            step_names: vec!["notify".into()],
            ..Default::default()
        };
        assert_eq!(load(&filter, "type: shell\n").unwrap().1.len(), 2);

        let filter = LoadFilter {
            step_names: vec!["other".into()],
            ..Default::default()
        };
        assert!(load(&filter, "type: shell\n").unwrap().1.is_empty());
    }

    #[test]
    fn test_dc006_missing_factory() {
        let err = load(&LoadFilter::default(), "type: sync\n").unwrap_err();
        assert!(err.is_load_error());
        assert!(err.to_string().contains("no factory"));
    }

    #[test]
    fn test_dc006_handle_post_load() {
        let log = CallLog::default();
        let mut handle = StepHandle::new(MockStep::boxed("s", Behavior::Succeed, &log));
        assert_eq!(handle.name(), "s");
        handle
            .post_load(&Overrides::new().set("force", true), &tracing::Span::none())
            .unwrap();
        assert_eq!(calls(&log, "s"), vec!["post_load"]);

        let _clone = handle.clone();
        assert!(handle.post_load(&Overrides::new(), &tracing::Span::none()).is_err());
    }

    #[test]
    fn test_dc006_bound_released() {
        let weak = {
            let registry = Registry::from_datasources(vec![file_ds("a", Engine::Csv, &[])]);
            Arc::downgrade(registry.get("a").unwrap())
        };
        assert!(bound(&weak).is_err());
    }

    #[test]
    fn test_dc006_step_debug_names_step() {
        let log = CallLog::default();
        let steps = vec![MockStep::boxed("seed@fr", Behavior::Succeed, &log)];
        let shown = format!("{:?}", steps);
        assert!(shown.contains("\"seed@fr\""), "{}", shown);
        assert!(shown.starts_with("[Step {"), "{}", shown);
    }
}
