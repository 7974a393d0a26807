//! DC-009: Cookbook, the set of recipes for one run.
//!
//! `load → post_load* → run → close`. Recipes are independent: one recipe's
//! failure never stops another.

use super::error::{Error, Result};
use super::executor::{RecipeReport, RunReport, Scheduler};
use super::parser;
use super::recipe::Recipe;
use super::step::{LoadFilter, StepFactories};
use super::types::{Overrides, RunMode, Settings, Statistics};
use crate::journal::eventlog::Journal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// All recipes selected for a run, plus cookbook-wide settings.
#[derive(Debug)]
pub struct Cookbook {
    pub root: PathBuf,
    pub settings: Settings,
    recipes: BTreeMap<String, Arc<Recipe>>,
}

impl Cookbook {
    /// Load the settings and the named recipes (all of them when `names` is
    /// empty) from a config root. Any load error aborts the whole load.
    pub fn load(
        config_root: &Path,
        names: &[String],
        factories: &StepFactories,
        filter: &LoadFilter,
    ) -> Result<Self> {
        let settings = parser::parse_settings(config_root)?;
        let mut available = recipe_folders(config_root)?;
        if let Some(journal) = &settings.journal {
            let journal = config_root.join(journal);
            available.retain(|_, folder| *folder != journal);
        }

        let selected: Vec<(String, PathBuf)> = if names.is_empty() {
            available.into_iter().collect()
        } else {
            let mut selected = Vec::with_capacity(names.len());
            for name in names {
                let folder = available
                    .get(name)
                    .ok_or_else(|| Error::UnknownRecipe(name.clone()))?;
                selected.push((name.clone(), folder.clone()));
            }
            selected
        };

        let mut recipes = BTreeMap::new();
        for (name, folder) in selected {
            let recipe = Recipe::load(&name, &folder, &settings, factories, filter)?;
            recipes.insert(name, Arc::new(recipe));
        }

        Ok(Self {
            root: config_root.to_path_buf(),
            settings,
            recipes,
        })
    }

    /// Assemble a cookbook from already built recipes.
    pub fn from_recipes(settings: Settings, recipes: Vec<Recipe>) -> Self {
        Self {
            root: PathBuf::from("."),
            settings,
            recipes: recipes
                .into_iter()
                .map(|r| (r.name.clone(), Arc::new(r)))
                .collect(),
        }
    }

    pub fn recipe_names(&self) -> Vec<&str> {
        self.recipes.keys().map(String::as_str).collect()
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name).map(Arc::as_ref)
    }

    pub fn mode(&self) -> RunMode {
        self.settings.mode
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.settings.mode = mode;
    }

    /// Apply overrides to every step of every recipe.
    pub fn post_load(&mut self, overrides: &Overrides) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        overrides.validate()?;
        for (name, recipe) in &mut self.recipes {
            Arc::get_mut(recipe)
                .ok_or_else(|| Error::Override(format!("recipe '{}' is running", name)))?
                .post_load(overrides)?;
        }
        Ok(())
    }

    /// Step counts per recipe by ascending priority, and the grand total.
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        for (name, recipe) in &self.recipes {
            let counts = recipe.step_counts();
            stats.total += counts.iter().sum::<usize>();
            stats.per_recipe.insert(name.clone(), counts);
        }
        stats
    }

    /// Journal directory, relative paths resolved against the config root.
    pub fn journal_dir(&self) -> Option<PathBuf> {
        self.settings.journal.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.root.join(dir)
            }
        })
    }

    /// Run every recipe. Parallel mode runs recipes concurrently, sequential
    /// mode one after another in name order.
    pub async fn run(&self, root: &CancellationToken) -> RunReport {
        let start = Instant::now();
        let journal = self.journal_dir().map(|dir| Journal::new(&dir));
        let scheduler = Scheduler::new(self.settings.mode).with_journal(journal);
        tracing::info!(
            recipes = self.recipes.len(),
            mode = %self.settings.mode,
            "cookbook run started"
        );

        let mut report = RunReport::default();
        match self.settings.mode {
            RunMode::Sequential => {
                for recipe in self.recipes.values() {
                    report.recipes.push(scheduler.run_recipe(recipe, root).await);
                }
            }
            RunMode::Parallel => {
                let mut tasks = Vec::with_capacity(self.recipes.len());
                for (name, recipe) in &self.recipes {
                    let recipe = Arc::clone(recipe);
                    let scheduler = scheduler.clone();
                    let root = root.clone();
                    let task = tokio::spawn(async move { scheduler.run_recipe(&recipe, &root).await });
                    tasks.push((name.clone(), task));
                }
                for (name, task) in tasks {
                    let recipe_report = task.await.unwrap_or_else(|e| {
                        tracing::error!(recipe = %name, error = %e, "recipe task aborted");
                        RecipeReport {
                            recipe: name,
                            error: Some(e.to_string()),
                            ..Default::default()
                        }
                    });
                    report.recipes.push(recipe_report);
                }
            }
        }

        report.duration = start.elapsed();
        tracing::info!(failed = report.failed(), "cookbook run completed");
        report
    }

    /// Release every datasource connection of every recipe.
    pub async fn close(&self) {
        for recipe in self.recipes.values() {
            recipe.close().await;
        }
    }
}

/// Recipe folders under the config root, by name.
pub fn recipe_folders(config_root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let entries = std::fs::read_dir(config_root).map_err(|e| Error::io(config_root, e))?;
    let mut folders = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(config_root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        folders.insert(name, path);
    }
    Ok(folders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::StepStatus;
    use crate::core::registry::Registry;
    use crate::core::step::tests::{calls, Behavior, CallLog, MockFactory, MockStep};

    fn factories(log: &CallLog) -> StepFactories {
        let mut f = StepFactories::new();
        f.register(Box::new(MockFactory {
            log: CallLog::clone(log),
        }));
        f
    }

    fn write_root(root: &Path) {
        for (recipe, files) in [
            ("alpha", vec![("a.yaml", "type: shell\npriority: 1\n"), ("b.yaml", "type: shell\npriority: 2\n")]),
            ("beta", vec![("x.yaml", "type: shell\n")]),
        ] {
            let folder = root.join(recipe);
            std::fs::create_dir_all(&folder).unwrap();
            std::fs::write(
                folder.join("datasources.yaml"),
                "datasources:\n  one:\n    type: file\n    engine: csv\n    path: one.csv\n  two:\n    type: file\n    engine: yaml\n    path: two.yaml\n    tags: [env:fr]\n",
            )
            .unwrap();
            for (file, body) in files {
                std::fs::write(folder.join(file), body).unwrap();
            }
        }
        std::fs::write(root.join("dbchef.yaml"), "mode: parallel\njournal: journal\n").unwrap();
    }

    #[test]
    fn test_dc009_load_all_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path());
        let log = CallLog::default();
        let book = Cookbook::load(dir.path(), &[], &factories(&log), &LoadFilter::default()).unwrap();

        assert_eq!(book.recipe_names(), vec!["alpha", "beta"]);
        assert_eq!(book.mode(), RunMode::Parallel);
        let stats = book.statistics();
        assert_eq!(stats.per_recipe["alpha"], vec![2, 2]);
        assert_eq!(stats.per_recipe["beta"], vec![2]);
        assert_eq!(stats.total, 6);
        let sum: usize = stats.per_recipe.values().flatten().sum();
        assert_eq!(sum, stats.total);
        assert_eq!(book.journal_dir(), Some(dir.path().join("journal")));
    }

    #[test]
    fn test_dc009_load_named_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path());
        let log = CallLog::default();
        let f = factories(&log);

        let book = Cookbook::load(dir.path(), &["beta".into()], &f, &LoadFilter::default()).unwrap();
        assert_eq!(book.recipe_names(), vec!["beta"]);

        let err = Cookbook::load(dir.path(), &["gamma".into()], &f, &LoadFilter::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownRecipe(ref n) if n == "gamma"));
        assert!(err.is_load_error());
    }

    #[test]
    fn test_dc009_load_with_tag_restriction() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path());
        let log = CallLog::default();
        let filter = LoadFilter {
            tags: vec!["env:fr".into()],
            ..Default::default()
        };
        let book = Cookbook::load(dir.path(), &[], &factories(&log), &filter).unwrap();
        assert_eq!(book.statistics().total, 3);
    }

    #[test]
    fn test_dc009_post_load_rejects_exclusive() {
        let log = CallLog::default();
        let mut r = Recipe::new("r", Path::new("/r"), Registry::default());
        r.add_step(0, MockStep::boxed("a", Behavior::Succeed, &log));
        let mut book = Cookbook::from_recipes(Settings::default(), vec![r]);

        let err = book
            .post_load(&Overrides::new().set("steps", 1).set("target_version", 3))
            .unwrap_err();
        assert!(err.is_load_error());
        assert!(calls(&log, "a").is_empty(), "rejected before touching steps");

        book.post_load(&Overrides::new().set("force", true)).unwrap();
        assert_eq!(calls(&log, "a"), vec!["post_load"]);
    }

    #[tokio::test]
    async fn test_dc009_parallel_scenario_from_tiers() {
        let log = CallLog::default();
        let mut r = Recipe::new("r", Path::new("/r"), Registry::default());
        r.add_step(1, MockStep::boxed("s1", Behavior::FailExecute, &log));
        r.add_step(1, MockStep::boxed("s2", Behavior::AwaitCancel, &log));
        r.add_step(2, MockStep::boxed("s3", Behavior::Succeed, &log));
        let settings = Settings {
            mode: RunMode::Parallel,
            ..Default::default()
        };
        let book = Cookbook::from_recipes(settings, vec![r]);

        let report = book.run(&CancellationToken::new()).await;
        assert!(report.failed());
        assert_eq!(report.status("r", "s2"), Some(StepStatus::Cancelled));
        assert_eq!(report.status("r", "s3"), None);
        assert!(calls(&log, "s3").is_empty());
        book.close().await;
    }

    #[tokio::test]
    async fn test_dc009_recipes_are_independent() {
        for mode in [RunMode::Sequential, RunMode::Parallel] {
            let log = CallLog::default();
            let mut bad = Recipe::new("bad", Path::new("/bad"), Registry::default());
            bad.add_step(0, MockStep::boxed("boom", Behavior::FailExecute, &log));
            bad.add_step(1, MockStep::boxed("never", Behavior::Succeed, &log));
            let mut good = Recipe::new("good", Path::new("/good"), Registry::default());
            good.add_step(0, MockStep::boxed("g1", Behavior::Succeed, &log));
            good.add_step(1, MockStep::boxed("g2", Behavior::Succeed, &log));
            let settings = Settings {
                mode,
                ..Default::default()
            };
            let book = Cookbook::from_recipes(settings, vec![bad, good]);

            let report = book.run(&CancellationToken::new()).await;
            assert!(report.failed());
            assert!(report.recipe("bad").unwrap().failed());
            assert!(!report.recipe("good").unwrap().failed());
            assert_eq!(report.status("good", "g2"), Some(StepStatus::Finished));
            assert!(calls(&log, "never").is_empty());
        }
    }

    #[tokio::test]
    async fn test_dc009_run_writes_journal() {
        let dir = tempfile::tempdir().unwrap();
        write_root(dir.path());
        let log = CallLog::default();
        let book = Cookbook::load(dir.path(), &[], &factories(&log), &LoadFilter::default()).unwrap();
        let report = book.run(&CancellationToken::new()).await;
        assert!(!report.failed());

        let events = crate::journal::eventlog::read_events(&dir.path().join("journal"), "alpha").unwrap();
        // started + 4 finished + completed
        assert_eq!(events.len(), 6);

        // the journal folder is not mistaken for a recipe on the next load
        let again = Cookbook::load(dir.path(), &[], &factories(&log), &LoadFilter::default()).unwrap();
        assert_eq!(again.recipe_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_dc009_recipe_folders_skip_files_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("r1")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("dbchef.yaml"), "").unwrap();
        let folders = recipe_folders(dir.path()).unwrap();
        assert_eq!(folders.keys().collect::<Vec<_>>(), vec!["r1"]);
    }
}
