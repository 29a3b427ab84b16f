//! Packages and the package applicator.
//!
//! A package is one installable unit: a set of schemas owned by a derived
//! role, an ordered migration list, a managed-object bundle, and tests.
//! [`Package::apply`] drives the whole per-package protocol, always inside
//! the project's single outer transaction.

use std::collections::HashSet;

use sqlx::Row;
use tracing::{debug, info};

use crate::config::{Config, CONFIG_FILENAME};
use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::ident::{role_for_package, sanitize, EXTENSION_PATTERN, ROLE_PATTERN, SCHEMA_PATTERN};
use crate::migration::{Migrations, MIGRATION_INDEX};
use crate::mob::Mob;
use crate::options;
use crate::source::Source;
use crate::testing::TestBundle;
use crate::tx::PkgTx;

/// Install counters, reported by the `--summary` option.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Managed functions declared.
    pub functions: usize,
    /// Managed views declared.
    pub views: usize,
    /// Managed triggers declared.
    pub triggers: usize,
    /// Migration scripts run by this install.
    pub migrations: usize,
    /// Test functions found.
    pub tests: usize,
}

/// One installable package.
pub struct Package {
    /// Canonical, globally unique package name.
    pub name: String,
    /// Where the package was loaded from.
    pub location: String,
    /// The database role owning the package's schemas, derived from the
    /// package name.
    pub role: String,
    /// Schema names the package owns.
    pub schema_names: Vec<String>,
    /// Extensions the package needs.
    pub extensions: Vec<String>,
    /// Names of the packages this package depends on.
    pub uses: Vec<String>,
    /// The file tree the package was loaded from.
    pub source: Box<dyn Source>,
    /// The ordered migration bundle.
    pub migrations: Migrations,
    /// The managed-object bundle.
    pub mob: Mob,
    /// The test bundle.
    pub tests: TestBundle,
    /// True for the tool's own embedded package, which installs first and
    /// is never exported.
    pub bootstrap: bool,
    /// Set when the tool's schema does not exist yet, so the bootstrap
    /// package must run its migrations without consulting the ledger.
    pub bootstrap_schema: bool,
    /// True if the package was pulled in from a cache to satisfy a `Uses`
    /// clause.
    pub is_dependency: bool,
    /// Install counters.
    pub stats: Stats,

    config: Config,
}

impl Package {
    /// Read and classify a package from a source tree.
    ///
    /// Every non-hidden `.sql` file belongs to exactly one bundle: files
    /// named by the migration list form the schema bundle, `*_test.sql`
    /// files form the test bundle, and everything else is a managed object.
    pub fn read(location: &str, source: Box<dyn Source>) -> Result<Package> {
        let config_text = crate::source::read_string(source.as_ref(), CONFIG_FILENAME)
            .map_err(|e| e.at_location(location.to_string()))?;
        let config =
            Config::parse(&config_text).map_err(|e| e.at_location(location.to_string()))?;

        let mut files = Vec::new();
        source.walk(&mut |path| {
            // Dotfiles (including the .pgpkg cache) never contribute.
            if path.split('/').any(|part| part.starts_with('.')) {
                return Ok(());
            }
            files.push(path.to_string());
            Ok(())
        })?;

        let index_dirs: Vec<String> = files
            .iter()
            .filter(|f| crate::migration::basename(f) == MIGRATION_INDEX)
            .map(|f| match f.rfind('/') {
                Some(pos) => f[..pos].to_string(),
                None => String::new(),
            })
            .collect();

        let migrations = if let Some(paths) = &config.migrations {
            if !index_dirs.is_empty() {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    format!(
                        "only one of Migrations and {} can be specified",
                        MIGRATION_INDEX
                    ),
                )
                .at_location(location.to_string()));
            }
            Migrations::from_config(&config.package, paths, source.as_ref())?
        } else if let Some(dir) = index_dirs.first() {
            if index_dirs.len() > 1 {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    format!("multiple {} files found", MIGRATION_INDEX),
                )
                .at_location(location.to_string()));
            }
            let prefix = if dir.is_empty() {
                String::new()
            } else {
                format!("{}/", dir)
            };
            let dir_files: Vec<String> = files
                .iter()
                .filter(|f| f.starts_with(&prefix) && f.ends_with(".sql"))
                .cloned()
                .collect();
            Migrations::from_index(&config.package, source.as_ref(), dir, &dir_files)?
        } else {
            Migrations::from_config(&config.package, &[], source.as_ref())?
        };

        let migration_set: HashSet<&String> = migrations.index().iter().collect();

        let mut mob_units = Vec::new();
        let mut test_units = Vec::new();
        for file in &files {
            if migration_set.contains(file) || !file.ends_with(".sql") {
                continue;
            }
            if file.ends_with("_test.sql") {
                test_units.push(crate::unit::Unit::new(&config.package, file.clone()));
            } else {
                mob_units.push(crate::unit::Unit::new(&config.package, file.clone()));
            }
        }

        Ok(Package {
            name: config.package.clone(),
            location: location.to_string(),
            role: role_for_package(&config.package),
            schema_names: config.schemas.clone(),
            extensions: config.extensions.clone(),
            uses: config.uses.clone(),
            source,
            migrations,
            mob: Mob::new(mob_units),
            tests: TestBundle::new(test_units),
            bootstrap: false,
            bootstrap_schema: false,
            is_dependency: false,
            stats: Stats::default(),
            config,
        })
    }

    /// The config as it should be written to a cache or archive: the
    /// canonical migration list replaces any sidecar index.
    pub fn export_config(&self) -> Config {
        let mut config = self.config.clone();
        config.schema = None;
        config.migrations = if self.migrations.is_empty() {
            None
        } else {
            Some(self.migrations.index().to_vec())
        };
        config
    }

    /// Every source file that constitutes the package, relative to its
    /// root: migrations, managed objects and tests.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.migrations.index().to_vec();
        paths.extend(self.mob.unit_paths().map(String::from));
        paths.extend(self.tests.unit_paths().map(String::from));
        paths
    }

    /// Install or upgrade the package. Runs inside the outer transaction;
    /// any error aborts the whole project install.
    pub async fn apply(&mut self, tx: &mut PkgTx) -> Result<()> {
        let opts = options::get();

        // Serialize concurrent installs before touching anything.
        tx.advisory_lock().await?;

        let role = opts
            .force_role
            .clone()
            .unwrap_or_else(|| self.role.clone());

        self.prepare_role_and_schemas(tx, &role).await?;

        // Parse and purge the managed objects as the invoking user: the
        // purge reads pgpkg tables and drops objects across schemas.
        if !self.mob.is_empty() {
            self.mob
                .parse(self.source.as_ref(), &self.schema_names, &mut self.stats)?;
            self.mob.purge(tx, &self.name).await?;
        } else {
            debug!("{}: no managed objects defined", self.name);
        }

        self.grant(tx, &role).await?;

        // Migrations run as the invoking user.
        self.migrations.load_state(tx, self.bootstrap_schema).await?;
        self.migrations
            .apply(tx, self.source.as_ref(), &mut self.stats)
            .await?;

        // Managed objects are created under the package role. The role is
        // reset on every exit path, including failure.
        if !self.mob.is_empty() {
            tx.set_role(&role).await?;
            let applied = self.mob.apply(tx).await;
            let reset = tx.reset_role().await;
            applied.and(reset)?;
            self.mob.update_state(tx, &self.name).await?;
        }

        // Ledger rows are written outside the role switch.
        self.migrations.save_state(tx).await?;

        self.register(tx).await?;

        if !self.tests.is_empty() && !opts.skip_tests {
            tx.set_role(&role).await?;
            let ran = self
                .tests
                .run(tx, self.source.as_ref(), &self.schema_names, &mut self.stats)
                .await;
            let reset = tx.reset_role().await;
            ran.and(reset)?;
        }

        if opts.summary {
            info!(
                "{}: {} migrations, {} functions, {} views, {} triggers, {} tests",
                self.name,
                self.stats.migrations,
                self.stats.functions,
                self.stats.views,
                self.stats.triggers,
                self.stats.tests
            );
        }

        Ok(())
    }

    /// Create the package role (unless one is forced), its schemas, and
    /// any extensions. Identifiers are sanitized immediately before
    /// interpolation.
    async fn prepare_role_and_schemas(&self, tx: &mut PkgTx, role: &str) -> Result<()> {
        let role = sanitize(&ROLE_PATTERN, role)?;

        if options::get().force_role.is_none() && !self.has_role(tx, role).await? {
            tx.execute(&format!("create role \"{}\"", role))
                .await
                .map_err(|e| {
                    PkgError::new(
                        ErrorKind::CatalogAccess,
                        format!("unable to create role {}", role),
                    )
                    .at(self)
                    .with_source(e)
                })?;
            // Grant the role to the invoking user so a non-superuser can
            // SET ROLE into it later.
            tx.execute(&format!("grant \"{}\" to current_user", role))
                .await
                .map_err(|e| {
                    PkgError::new(
                        ErrorKind::CatalogAccess,
                        format!("unable to grant role {}", role),
                    )
                    .at(self)
                    .with_source(e)
                })?;
        }

        for schema in &self.schema_names {
            let schema = sanitize(&SCHEMA_PATTERN, schema)?;
            tx.execute(&format!(
                "create schema if not exists \"{}\" authorization \"{}\"",
                schema, role
            ))
            .await
            .map_err(|e| {
                PkgError::new(
                    ErrorKind::CatalogAccess,
                    format!("unable to create schema {}", schema),
                )
                .at(self)
                .with_source(e)
            })?;
        }

        for extension in &self.extensions {
            let extension = sanitize(&EXTENSION_PATTERN, extension)?;
            tx.execute(&format!(
                "create extension if not exists \"{}\" with schema public",
                extension
            ))
            .await
            .map_err(|e| {
                PkgError::new(
                    ErrorKind::CatalogAccess,
                    format!("unable to create package extension {}", extension),
                )
                .at(self)
                .with_source(e)
            })?;
        }

        Ok(())
    }

    async fn has_role(&self, tx: &mut PkgTx, role: &str) -> Result<bool> {
        let row = sqlx::query("select count(*) from pg_roles where rolname = $1")
            .bind(role)
            .fetch_one(tx.conn())
            .await
            .map_err(|e| {
                PkgError::new(ErrorKind::CatalogAccess, "unable to check role")
                    .at(self)
                    .with_source(e)
            })?;
        let count: i64 = row.get(0);
        Ok(count == 1)
    }

    /// Grant the package role access to the pgpkg schema, and to the
    /// schemas of every package named in `Uses` (looked up through the
    /// registry written by their own installs).
    async fn grant(&self, tx: &mut PkgTx, role: &str) -> Result<()> {
        let role = sanitize(&ROLE_PATTERN, role)?;

        tx.execute(&format!("grant usage on schema pgpkg to \"{}\"", role))
            .await
            .map_err(|e| self.grant_error(e))?;
        tx.execute(&format!(
            "grant execute on all functions in schema pgpkg to \"{}\"",
            role
        ))
        .await
        .map_err(|e| self.grant_error(e))?;

        for uses in &self.uses {
            let row = sqlx::query("select schema_names from pgpkg.pkg where pkg = $1")
                .bind(uses)
                .fetch_optional(tx.conn())
                .await
                .map_err(|e| {
                    PkgError::new(ErrorKind::CatalogAccess, "unable to read package registry")
                        .at(self)
                        .with_source(e)
                })?;
            let schema_names: Vec<String> = match row {
                Some(row) => row.get(0),
                None => {
                    return Err(PkgError::new(
                        ErrorKind::DependencyMissing,
                        format!("used package {} is not registered", uses),
                    )
                    .at(self))
                }
            };

            for schema in &schema_names {
                let schema = sanitize(&SCHEMA_PATTERN, schema)?;
                for grant in [
                    format!("grant usage on schema \"{}\" to \"{}\"", schema, role),
                    format!(
                        "grant execute on all functions in schema \"{}\" to \"{}\"",
                        schema, role
                    ),
                    format!(
                        "grant select, update, insert, references on all tables in schema \"{}\" to \"{}\"",
                        schema, role
                    ),
                    format!(
                        "grant usage on all sequences in schema \"{}\" to \"{}\"",
                        schema, role
                    ),
                ] {
                    tx.execute(&grant).await.map_err(|e| self.grant_error(e))?;
                }
            }
        }

        Ok(())
    }

    fn grant_error(&self, e: sqlx::Error) -> PkgError {
        PkgError::new(ErrorKind::CatalogAccess, "unable to grant package access")
            .at(self)
            .with_source(e)
    }

    /// Upsert the package's registry row, recording its schemas and
    /// dependencies for other packages' grant phases.
    async fn register(&self, tx: &mut PkgTx) -> Result<()> {
        sqlx::query(
            "insert into pgpkg.pkg (pkg, schema_names, uses) values ($1, $2, $3) \
             on conflict (pkg) do update set schema_names = excluded.schema_names, \
             uses = excluded.uses",
        )
        .bind(&self.name)
        .bind(&self.schema_names)
        .bind(&self.uses)
        .execute(tx.conn())
        .await
        .map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to register package")
                .at(self)
                .with_source(e)
        })?;
        Ok(())
    }
}

impl Located for Package {
    fn location(&self) -> String {
        self.name.clone()
    }
}
