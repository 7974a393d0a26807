//! DC-002: Datasource registry with load, tag index, lookup and close.
//!
//! The registry is built once per recipe from `datasources.yaml` and is
//! read-only afterwards. Steps hold `Weak` references into it; closing the
//! registry drains every connection pool that was opened during the run.

use super::error::{Error, Result};
use super::parser;
use super::resolver::{self, TagIndex};
use super::types::{DatasourceKind, DatasourceSpec, Engine};
use indexmap::IndexMap;
use sqlx::AnyPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// File names searched for the datasource declarations of a recipe.
pub const DATASOURCE_FILES: [&str; 2] = ["datasources.yaml", "datasources.yml"];

/// Connection descriptor of a database datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub transactional: bool,
    pub pool_size: u32,
}

/// Where a datasource lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Database(DatabaseEndpoint),
    File(PathBuf),
}

/// A loaded, immutable datasource.
#[derive(Debug)]
pub struct Datasource {
    pub name: String,
    pub kind: DatasourceKind,
    pub engine: Engine,
    pub tags: Vec<String>,
    pub endpoint: Endpoint,
    pool: OnceCell<AnyPool>,
}

impl Datasource {
    /// Build a datasource from its on-disk declaration. File paths are
    /// resolved against `base`.
    pub fn from_spec(name: &str, spec: &DatasourceSpec, base: &Path) -> Result<Self> {
        if spec.engine.kind() != spec.kind {
            return Err(Error::datasource(
                name,
                format!("engine {} cannot back a {} datasource", spec.engine, spec.kind),
            ));
        }

        let endpoint = match spec.kind {
            DatasourceKind::Database => {
                let missing = |field: &str| {
                    Error::datasource(name, format!("database datasource has no {}", field))
                };
                Endpoint::Database(DatabaseEndpoint {
                    host: spec.host.clone().ok_or_else(|| missing("host"))?,
                    port: spec
                        .port
                        .or_else(|| spec.engine.default_port())
                        .ok_or_else(|| missing("port"))?,
                    user: spec.user.clone().ok_or_else(|| missing("user"))?,
                    password: spec.password.clone(),
                    database: spec.database.clone().ok_or_else(|| missing("database"))?,
                    transactional: spec.transactional,
                    pool_size: spec.pool_size.max(1),
                })
            }
            DatasourceKind::File => {
                let path = spec
                    .path
                    .as_ref()
                    .ok_or_else(|| Error::datasource(name, "file datasource has no path"))?;
                Endpoint::File(base.join(path))
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind: spec.kind,
            engine: spec.engine,
            tags: normalize_tags(&spec.tags),
            endpoint,
            pool: OnceCell::new(),
        })
    }

    pub fn database(&self) -> Option<&DatabaseEndpoint> {
        match &self.endpoint {
            Endpoint::Database(db) => Some(db),
            Endpoint::File(_) => None,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::File(p) => Some(p),
            Endpoint::Database(_) => None,
        }
    }

    /// Value of the first `prefix:value` tag.
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| {
            t.split_once(':')
                .filter(|(p, _)| *p == prefix)
                .map(|(_, v)| v)
        })
    }

    /// The pool for this datasource, created on first use.
    pub(crate) fn pool_cell(&self) -> &OnceCell<AnyPool> {
        &self.pool
    }
}

/// Drop blanks and duplicates, keep first-seen order.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for t in tags {
        let t = t.trim();
        if !t.is_empty() && !out.iter().any(|e| e == t) {
            out.push(t.to_string());
        }
    }
    out
}

/// Owner of every datasource of one recipe.
#[derive(Debug, Default)]
pub struct Registry {
    datasources: IndexMap<String, Arc<Datasource>>,
    index: TagIndex,
}

impl Registry {
    /// Load `datasources.yaml` from a recipe folder. A folder without one
    /// yields an empty registry.
    pub fn load_all(recipe_folder: &Path) -> Result<Self> {
        let file = DATASOURCE_FILES
            .iter()
            .map(|f| recipe_folder.join(f))
            .find(|p| p.is_file());
        let Some(path) = file else {
            return Ok(Self::default());
        };

        let decl = parser::parse_datasources_file(&path)?;
        let mut datasources = Vec::with_capacity(decl.datasources.len());
        for (name, spec) in &decl.datasources {
            let ds = Datasource::from_spec(name, spec, recipe_folder)
                .map_err(|e| Error::config(&path, e.to_string()))?;
            datasources.push(ds);
        }
        let registry = Self::from_datasources(datasources);
        tracing::debug!(
            folder = %recipe_folder.display(),
            datasources = registry.len(),
            "datasource registry loaded"
        );
        Ok(registry)
    }

    /// Build a registry from already constructed datasources.
    pub fn from_datasources(datasources: Vec<Datasource>) -> Self {
        let mut map = IndexMap::with_capacity(datasources.len());
        for ds in datasources {
            map.insert(ds.name.clone(), Arc::new(ds));
        }
        let index = TagIndex::build(
            map.values()
                .map(|ds| (ds.kind, ds.engine, ds.tags.as_slice())),
        );
        Self {
            datasources: map,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.datasources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Datasource>> {
        self.datasources.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Datasource>> {
        self.datasources.values()
    }

    /// Names indexed under a tag, in load order.
    pub fn names_for_tag(&self, tag: &str) -> Vec<&str> {
        self.index
            .positions(tag)
            .map(|set| {
                set.iter()
                    .filter_map(|&i| self.datasources.get_index(i).map(|(n, _)| n.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve selectors to datasources, in load order.
    pub fn lookup<S: AsRef<str>>(
        &self,
        selectors: &[S],
        limited: Option<&[S]>,
        kind: Option<DatasourceKind>,
        engine: Option<Engine>,
    ) -> Vec<Arc<Datasource>> {
        resolver::lookup(&self.index, selectors, limited, kind, engine)
            .into_iter()
            .filter_map(|i| self.datasources.get_index(i).map(|(_, ds)| Arc::clone(ds)))
            .collect()
    }

    /// Close every connection pool opened during the run.
    pub async fn close_all(&self) {
        for ds in self.datasources.values() {
            if let Some(pool) = ds.pool.get() {
                pool.close().await;
                tracing::debug!(datasource = %ds.name, "pool closed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn file_ds(name: &str, engine: Engine, tags: &[&str]) -> Datasource {
        Datasource {
            name: name.to_string(),
            kind: engine.kind(),
            engine,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            endpoint: Endpoint::File(PathBuf::from(format!("/tmp/{}", name))),
            pool: OnceCell::new(),
        }
    }

    pub(crate) fn db_ds(name: &str, engine: Engine, tags: &[&str]) -> Datasource {
        Datasource {
            name: name.to_string(),
            kind: engine.kind(),
            engine,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            endpoint: Endpoint::Database(DatabaseEndpoint {
                host: "db.local".to_string(),
                port: engine.default_port().unwrap_or(0),
                user: "app".to_string(),
                password: Some("s3cret".to_string()),
                database: "app".to_string(),
                transactional: true,
                pool_size: 2,
            }),
            pool: OnceCell::new(),
        }
    }

    const DATASOURCES_YAML: &str = r#"
datasources:
  fr-db:
    type: database
    engine: postgres
    host: localhost
    user: app
    database: app_fr
    tags: [env:fr, primary, primary, ""]
  plain:
    type: database
    engine: mysql
    host: localhost
    user: root
    database: app
  seed:
    type: file
    engine: csv
    path: seeds/users.csv
    tags: [seed]
"#;

    #[test]
    fn test_dc002_load_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("datasources.yaml"), DATASOURCES_YAML).unwrap();
        let reg = Registry::load_all(dir.path()).unwrap();
        assert_eq!(reg.len(), 3);

        let fr = reg.get("fr-db").unwrap();
        assert_eq!(fr.tags, vec!["env:fr", "primary"]);
        assert_eq!(fr.database().unwrap().port, 5432);
        assert_eq!(reg.get("plain").unwrap().database().unwrap().port, 3306);
        assert_eq!(
            reg.get("seed").unwrap().file_path().unwrap(),
            dir.path().join("seeds/users.csv")
        );
    }

    #[test]
    fn test_dc002_missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load_all(dir.path()).unwrap();
        assert!(reg.is_empty());
        assert!(reg.lookup::<&str>(&[], None, None, None).is_empty());
    }

    #[test]
    fn test_dc002_kind_engine_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("datasources.yml"),
            "datasources:\n  x:\n    type: file\n    engine: mysql\n    path: a\n",
        )
        .unwrap();
        let err = Registry::load_all(dir.path()).unwrap_err();
        assert!(err.is_load_error());
        assert!(err.to_string().contains("cannot back a file datasource"));
    }

    #[test]
    fn test_dc002_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("datasources.yaml"),
            "datasources:\n  x:\n    type: database\n    engine: postgres\n    user: u\n    database: d\n",
        )
        .unwrap();
        let err = Registry::load_all(dir.path()).unwrap_err();
        assert!(err.to_string().contains("has no host"));
    }

    #[test]
    fn test_dc002_index_includes_empty_tag() {
        let reg = Registry::from_datasources(vec![
            file_ds("a", Engine::Json, &["env:fr"]),
            file_ds("b", Engine::Json, &[]),
        ]);
        assert_eq!(reg.names_for_tag(""), vec!["a", "b"]);
        assert_eq!(reg.names_for_tag("env:fr"), vec!["a"]);
        assert!(reg.names_for_tag("env:de").is_empty());
    }

    #[test]
    fn test_dc002_lookup_scenario_env_fr() {
        let reg = Registry::from_datasources(vec![
            file_ds("tagged", Engine::Json, &["env:fr"]),
            file_ds("untagged", Engine::Json, &[]),
        ]);
        let all: Vec<_> = reg
            .lookup::<&str>(&[], None, None, None)
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(all, vec!["tagged", "untagged"]);

        let fr: Vec<_> = reg
            .lookup(&["env:fr"], None, None, None)
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(fr, vec!["tagged"]);
    }

    #[test]
    fn test_dc002_tag_value() {
        let ds = db_ds("x", Engine::Postgres, &["primary", "env:fr", "env:de"]);
        assert_eq!(ds.tag_value("env"), Some("fr"));
        assert_eq!(ds.tag_value("region"), None);
        assert_eq!(ds.tag_value("primary"), None);
    }

    #[tokio::test]
    async fn test_dc002_close_all_without_pools() {
        let reg = Registry::from_datasources(vec![db_ds("x", Engine::Mysql, &[])]);
        reg.close_all().await;
        assert_eq!(reg.len(), 1);
    }
}
