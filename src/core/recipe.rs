//! DC-007: Recipe loading into priority tiers.
//!
//! A recipe is a folder under the config root: an optional
//! `datasources.yaml` plus one YAML file per step declaration. Several files
//! may contribute to the same priority tier; within a tier steps keep file
//! name order, then factory order.

use super::error::{Error, Result};
use super::registry::{Registry, DATASOURCE_FILES};
use super::step::{LoadFilter, LoadScope, Step, StepFactories, StepHandle};
use super::types::{Overrides, Settings};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A named, priority-tiered collection of steps and the registry they use.
#[derive(Debug)]
pub struct Recipe {
    pub name: String,
    pub folder: PathBuf,
    registry: Registry,
    tiers: BTreeMap<i32, Vec<StepHandle>>,
}

impl Recipe {
    pub fn new(name: &str, folder: &Path, registry: Registry) -> Self {
        Self {
            name: name.to_string(),
            folder: folder.to_path_buf(),
            registry,
            tiers: BTreeMap::new(),
        }
    }

    /// Load a recipe folder: registry first, then every step file.
    pub fn load(
        name: &str,
        folder: &Path,
        settings: &Settings,
        factories: &StepFactories,
        filter: &LoadFilter,
    ) -> Result<Self> {
        let registry = Registry::load_all(folder)?;
        let files = step_files(folder)?;

        let mut loaded: Vec<(i32, Vec<Box<dyn Step>>)> = Vec::with_capacity(files.len());
        {
            let scope = LoadScope {
                recipe: name,
                folder,
                registry: &registry,
                settings,
                filter,
            };
            for path in &files {
                loaded.push(factories.load_step_file(path, &scope)?);
            }
        }

        let mut recipe = Self::new(name, folder, registry);
        for (priority, steps) in loaded {
            for step in steps {
                recipe.add_step(priority, step);
            }
        }
        tracing::info!(
            recipe = %name,
            files = files.len(),
            steps = recipe.step_count(),
            tiers = recipe.tiers.len(),
            "recipe loaded"
        );
        Ok(recipe)
    }

    /// Append a step to its priority tier.
    pub fn add_step(&mut self, priority: i32, step: Box<dyn Step>) {
        self.tiers
            .entry(priority)
            .or_default()
            .push(StepHandle::new(step));
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Tiers in ascending priority order.
    pub fn tiers(&self) -> impl Iterator<Item = (i32, &[StepHandle])> {
        self.tiers.iter().map(|(p, s)| (*p, s.as_slice()))
    }

    /// Step counts per tier, ascending by priority.
    pub fn step_counts(&self) -> Vec<usize> {
        self.tiers.values().map(Vec::len).collect()
    }

    pub fn step_count(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    /// Apply overrides to every step. The first rejection aborts.
    pub fn post_load(&mut self, overrides: &Overrides) -> Result<()> {
        for (priority, steps) in &mut self.tiers {
            for handle in steps {
                let span = tracing::debug_span!(
                    "post_load",
                    recipe = %self.name,
                    priority = *priority,
                    step = %handle.name()
                );
                handle.post_load(overrides, &span)?;
            }
        }
        Ok(())
    }

    /// Release every connection held by the registry.
    pub async fn close(&self) {
        self.registry.close_all().await;
    }
}

/// Step files of a recipe folder, sorted by file name.
pub fn step_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for ext in ["yaml", "yml"] {
        let pattern = folder.join(format!("*.{}", ext));
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::config(folder, format!("bad recipe path: {}", e)))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(e.path().to_path_buf(), e.into_error()))?;
            let is_datasources = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| DATASOURCE_FILES.contains(&n));
            if path.is_file() && !is_datasources {
                files.push(path);
            }
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}
