//! Projects: a set of packages installed together.
//!
//! A project tracks its package sources, pulls dependencies from caches,
//! orders the packages topologically by their `Uses` clauses, and installs
//! them inside one transaction. The bootstrap package is always present and
//! always installs first.

use std::collections::{BTreeMap, HashSet};

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use tracing::info;

use crate::bootstrap::{bootstrap_source, BOOTSTRAP_PKG, PGPKG_SCHEMA};
use crate::cache::{Cache, SourceCache, WriteCache};
use crate::error::{ErrorKind, PkgError, Result};
use crate::options;
use crate::package::Package;
use crate::source::{open_path, Source};
use crate::tx::PkgTx;

/// A collection of packages to be installed into a single database.
pub struct Project {
    pkgs: BTreeMap<String, Package>,
    /// The writable project cache, target of `pgpkg import`.
    pub cache: Option<WriteCache>,
    /// Read-only caches searched (in order, before the project cache) when
    /// resolving dependencies.
    pub search: Vec<Box<dyn Cache>>,
    root_name: Option<String>,
}

impl Project {
    /// Create a project holding only the embedded bootstrap package.
    pub fn new() -> Result<Project> {
        let mut project = Project {
            pkgs: BTreeMap::new(),
            cache: None,
            search: Vec::new(),
            root_name: None,
        };
        let pkg = project.add_source(Box::new(bootstrap_source()), false)?;
        pkg.bootstrap = true;
        Ok(project)
    }

    /// Create a project from a package path (a directory or a `.zip`
    /// file). The package's own cache, if any, becomes the project cache;
    /// extra search caches take precedence over it.
    pub fn from_path(path: &str, search: Vec<Box<dyn Cache>>) -> Result<Project> {
        let mut project = Project::new()?;

        // A read-only cache shipped inside the package (e.g. inside an
        // archive) is searched before any caller-provided caches; a
        // writable one becomes the project cache.
        let source = open_path(path)?;
        match source.cache()? {
            Some(SourceCache::Write(cache)) => project.cache = Some(cache),
            Some(SourceCache::Read(cache)) => project.search.push(Box::new(cache)),
            None => {}
        }
        project.search.extend(search);

        let root_name = project.add_source(source, false)?.name.clone();
        project.root_name = Some(root_name);
        Ok(project)
    }

    /// Add a package to the project from a source tree.
    pub fn add_source(
        &mut self,
        source: Box<dyn Source>,
        is_dependency: bool,
    ) -> Result<&mut Package> {
        let location = source.location();
        let mut pkg = Package::read(&location, source)?;
        pkg.is_dependency = is_dependency;

        if let Some(existing) = self.pkgs.get(&pkg.name) {
            return Err(PkgError::new(
                ErrorKind::Config,
                format!(
                    "duplicate package {}; found in {}, but also in {}",
                    pkg.name, existing.location, pkg.location
                ),
            ));
        }

        let name = pkg.name.clone();
        self.pkgs.insert(name.clone(), pkg);
        Ok(self.pkgs.get_mut(&name).expect("package was just inserted"))
    }

    /// The primary (non-dependency) package the project was created from.
    pub fn root(&self) -> Option<&Package> {
        self.root_name.as_deref().and_then(|n| self.pkgs.get(n))
    }

    /// All packages, in name order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.pkgs.values()
    }

    /// Close the project under `Uses`: for every dependency not already
    /// loaded, search the caches in order and add the cached source as a
    /// dependency package. Missing dependencies are fatal.
    pub fn resolve_dependencies(&mut self) -> Result<()> {
        let mut queue: Vec<String> = self.pkgs.keys().cloned().collect();

        while let Some(name) = queue.pop() {
            let uses = match self.pkgs.get(&name) {
                Some(pkg) => pkg.uses.clone(),
                None => continue,
            };

            for dep in uses {
                if self.pkgs.contains_key(&dep) {
                    continue;
                }

                let mut found = false;
                let project_cache = self.cache.take();
                let mut caches: Vec<&dyn Cache> =
                    self.search.iter().map(|c| c.as_ref()).collect();
                if let Some(cache) = &project_cache {
                    caches.push(cache);
                }

                let mut lookup: Result<Option<Box<dyn Source>>> = Ok(None);
                for cache in caches {
                    match cache.get(&dep) {
                        Ok(Some(source)) => {
                            lookup = Ok(Some(source));
                            break;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            lookup = Err(e);
                            break;
                        }
                    }
                }
                self.cache = project_cache;

                if let Some(source) = lookup.map_err(|e| e.at_location(name.clone()))? {
                    self.add_source(source, true).map_err(|e| {
                        PkgError::new(
                            ErrorKind::Config,
                            format!("unable to add dependency {}", dep),
                        )
                        .at_location(name.clone())
                        .with_source(e)
                    })?;
                    queue.push(dep.clone());
                    found = true;
                }

                if !found {
                    return Err(PkgError::new(
                        ErrorKind::DependencyMissing,
                        format!("dependency not found in package caches: {}", dep),
                    )
                    .at_location(name.clone()));
                }
            }
        }

        Ok(())
    }

    /// Every schema name must belong to exactly one package.
    fn check_schema_owners(&self) -> Result<()> {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for pkg in self.pkgs.values() {
            for schema in &pkg.schema_names {
                if let Some(other) = owners.insert(schema, &pkg.name) {
                    return Err(PkgError::new(
                        ErrorKind::Config,
                        format!(
                            "schema {} is declared by both {} and {}",
                            schema, other, pkg.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Topological install order: depth-first post-order over the `Uses`
    /// graph, with the bootstrap package visited first unconditionally.
    /// Cycles are reported with the edge that closed them.
    pub fn sort_packages(&self) -> Result<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        self.dfs(BOOTSTRAP_PKG, &mut visited, &mut stack, &mut HashSet::new())?;

        for name in self.pkgs.keys() {
            if !visited.contains(name) {
                self.dfs(name, &mut visited, &mut stack, &mut HashSet::new())?;
            }
        }

        Ok(stack)
    }

    fn dfs(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        current_path: &mut HashSet<String>,
    ) -> Result<()> {
        let pkg = self.pkgs.get(name).ok_or_else(|| {
            PkgError::new(
                ErrorKind::DependencyMissing,
                format!("package not loaded: {}", name),
            )
        })?;

        visited.insert(name.to_string());
        current_path.insert(name.to_string());

        for neighbor in &pkg.uses {
            if current_path.contains(neighbor) {
                return Err(PkgError::new(
                    ErrorKind::Cycle,
                    format!(
                        "dependency cycle detected for package {}, uses {}",
                        name, neighbor
                    ),
                ));
            }
            if !visited.contains(neighbor) {
                self.dfs(neighbor, visited, stack, current_path)?;
            }
        }

        stack.push(name.to_string());
        current_path.remove(name);
        Ok(())
    }

    /// Install the project and return the open connection. The install is
    /// atomic: it either fully succeeds and commits, or the database is
    /// left untouched. Under `--dry-run` a successful install is rolled
    /// back and the distinguished user-request error is returned.
    pub async fn open(&mut self, connect: &PgConnectOptions) -> Result<PgConnection> {
        self.resolve_dependencies()?;
        self.check_schema_owners()?;
        let order = self.sort_packages()?;

        let mut tx = PkgTx::begin(connect).await?;

        match self.install_packages(&mut tx, &order).await {
            Ok(()) => {}
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        if options::get().dry_run {
            tx.rollback().await?;
            return Err(PkgError::user_request());
        }

        tx.commit().await
    }

    /// Install the project, then close the connection.
    pub async fn migrate(&mut self, connect: &PgConnectOptions) -> Result<()> {
        let conn = self.open(connect).await?;
        conn.close().await.map_err(|e| {
            PkgError::new(
                ErrorKind::CatalogAccess,
                "unable to close database after migration",
            )
            .with_source(e)
        })
    }

    async fn install_packages(&mut self, tx: &mut PkgTx, order: &[String]) -> Result<()> {
        // On a fresh database the ledger table doesn't exist yet; flag the
        // bootstrap package to run its migrations without reading it.
        let row = sqlx::query(
            "select count(*) from information_schema.schemata where schema_name = $1",
        )
        .bind(PGPKG_SCHEMA)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to read schema").with_source(e)
        })?;
        let initialized: i64 = row.get(0);
        if initialized == 0 {
            if let Some(pkg) = self.pkgs.get_mut(BOOTSTRAP_PKG) {
                pkg.bootstrap_schema = true;
            }
        }

        for name in order {
            let pkg = self.pkgs.get_mut(name).ok_or_else(|| {
                PkgError::new(
                    ErrorKind::DependencyMissing,
                    format!("package not loaded: {}", name),
                )
            })?;
            info!("installing {}", name);
            pkg.apply(tx).await.map_err(|e| {
                PkgError::new(e.kind(), format!("unable to install package {}", name))
                    .with_source(e)
            })?;
        }

        Ok(())
    }
}
