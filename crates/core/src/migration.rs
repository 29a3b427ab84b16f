//! The migration engine.
//!
//! A schema bundle is an ordered list of migration files. Migrations are
//! identified by basename alone, so the file tree can be reorganized
//! without re-running anything; each basename runs at most once per
//! database, tracked in the append-only `pgpkg.migration` ledger.
//!
//! The ordered list comes from one of two places: the `Migrations` field of
//! `pgpkg.toml`, or a `@migration.pgpkg` index file sitting in a migration
//! directory. Only one of the two may be used.

use std::collections::HashSet;

use sqlx::Row;
use tracing::debug;

use crate::error::{ErrorKind, PkgError, Result};
use crate::package::Stats;
use crate::source::{read_string, Source};
use crate::tx::PkgTx;
use crate::unit::Unit;

/// Name of the sidecar index file that declares a migration directory.
pub const MIGRATION_INDEX: &str = "@migration.pgpkg";

/// The basename a migration is identified by.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The schema bundle: ordered migrations plus their ledger state.
#[derive(Debug, Default)]
pub struct Migrations {
    pkg_name: String,
    /// Ordered unit paths, relative to the package root.
    index: Vec<String>,
    /// Basenames already applied to this database, loaded from the ledger.
    applied: Option<HashSet<String>>,
    /// Basenames applied by this run, pending their ledger rows.
    applied_now: Vec<String>,
}

impl Migrations {
    /// Build the bundle from the `Migrations` list in `pgpkg.toml`.
    pub fn from_config(pkg_name: &str, paths: &[String], source: &dyn Source) -> Result<Self> {
        let mut unique = HashSet::new();
        for path in paths {
            if !unique.insert(basename(path).to_string()) {
                return Err(PkgError::new(
                    ErrorKind::Duplicate,
                    format!(
                        "duplicate migration name '{}' found in path {}",
                        basename(path),
                        path
                    ),
                )
                .at_location(pkg_name.to_string()));
            }
            if !source.exists(path) {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    format!("migration not found: {}", path),
                )
                .at_location(pkg_name.to_string()));
            }
        }

        Ok(Migrations {
            pkg_name: pkg_name.to_string(),
            index: paths.to_vec(),
            ..Default::default()
        })
    }

    /// Build the bundle from a `@migration.pgpkg` index in `dir`. Every
    /// `.sql` file under the directory must be listed; forgetting to index
    /// a migration is a surprisingly common mistake.
    ///
    /// `dir_files` holds the package-relative paths of all files under
    /// `dir`, as discovered by the package walk.
    pub fn from_index(
        pkg_name: &str,
        source: &dyn Source,
        dir: &str,
        dir_files: &[String],
    ) -> Result<Self> {
        let index_path = if dir.is_empty() {
            MIGRATION_INDEX.to_string()
        } else {
            format!("{}/{}", dir, MIGRATION_INDEX)
        };

        let catalog = read_string(source, &index_path)
            .map_err(|e| e.at_location(pkg_name.to_string()))?;

        let mut index = Vec::new();
        let mut unique = HashSet::new();
        let mut listed = HashSet::new();
        for line in catalog.lines() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            let path = if dir.is_empty() {
                entry.to_string()
            } else {
                format!("{}/{}", dir, entry)
            };
            if !unique.insert(basename(&path).to_string()) {
                return Err(PkgError::new(
                    ErrorKind::Duplicate,
                    format!(
                        "duplicate migration name '{}' found in path {}",
                        basename(&path),
                        path
                    ),
                )
                .at_location(index_path.clone()));
            }
            listed.insert(path.clone());
            index.push(path);
        }

        for file in dir_files {
            if file.ends_with(".sql") && !listed.contains(file) {
                return Err(PkgError::new(
                    ErrorKind::Config,
                    format!("{}: not listed in {}", file, index_path),
                )
                .at_location(pkg_name.to_string()));
            }
        }

        Ok(Migrations {
            pkg_name: pkg_name.to_string(),
            index,
            ..Default::default()
        })
    }

    /// The ordered migration paths.
    pub fn index(&self) -> &[String] {
        &self.index
    }

    /// True if no migrations are declared.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Read the ledger into the applied set. The bootstrap package skips
    /// the read on a fresh database, where the ledger table does not exist
    /// until its own first migration runs.
    pub async fn load_state(&mut self, tx: &mut PkgTx, bootstrap: bool) -> Result<()> {
        let mut applied = HashSet::new();

        if !bootstrap {
            let rows = sqlx::query("select path from pgpkg.migration where pkg = $1")
                .bind(&self.pkg_name)
                .fetch_all(tx.conn())
                .await
                .map_err(|e| {
                    PkgError::new(ErrorKind::CatalogAccess, "unable to get migration status")
                        .at_location(self.pkg_name.clone())
                        .with_source(e)
                })?;
            for row in rows {
                let path: String = row.get(0);
                applied.insert(basename(&path).to_string());
            }
        }

        self.applied = Some(applied);
        Ok(())
    }

    /// Run every migration that isn't in the ledger, in declared order.
    /// Statements run one by one, each in its own savepoint; the first
    /// failure aborts with the statement's source context, and nothing is
    /// retried.
    pub async fn apply(
        &mut self,
        tx: &mut PkgTx,
        source: &dyn Source,
        stats: &mut Stats,
    ) -> Result<()> {
        let applied = self.applied.as_ref().ok_or_else(|| {
            PkgError::new(ErrorKind::ExecRuntime, "migration state was not loaded")
        })?;

        for path in &self.index {
            let name = basename(path);
            if applied.contains(name) {
                debug!("{}: migration {} already applied", self.pkg_name, name);
                continue;
            }

            let unit = Unit::new(&self.pkg_name, path.clone());
            let statements = unit.parse(source)?;
            for mut stmt in statements {
                if !stmt.try_exec(tx).await? {
                    let cause = stmt.take_error().unwrap_or_else(|| {
                        PkgError::new(ErrorKind::ExecRuntime, "statement failed")
                    });
                    return Err(PkgError::new(
                        ErrorKind::ExecRuntime,
                        "unable to upgrade schema",
                    )
                    .at_location(self.pkg_name.clone())
                    .with_source(cause));
                }
            }

            stats.migrations += 1;
            self.applied_now.push(name.to_string());
        }

        Ok(())
    }

    /// Append ledger rows for the migrations this run applied.
    pub async fn save_state(&self, tx: &mut PkgTx) -> Result<()> {
        for name in &self.applied_now {
            sqlx::query("insert into pgpkg.migration (pkg, path) values ($1, $2)")
                .bind(&self.pkg_name)
                .bind(name)
                .execute(tx.conn())
                .await
                .map_err(|e| {
                    PkgError::new(ErrorKind::CatalogAccess, "unable to save migration state")
                        .at_location(self.pkg_name.clone())
                        .with_source(e)
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;

    #[test]
    fn basenames() {
        assert_eq!(basename("schema/0001.sql"), "0001.sql");
        assert_eq!(basename("0001.sql"), "0001.sql");
        assert_eq!(basename("a/b/c.sql"), "c.sql");
    }

    #[test]
    fn config_mode_checks_duplicates_and_existence() {
        static FILES: &[(&str, &str)] = &[
            ("schema/0001.sql", "create table demo.a ();"),
            ("schema/sub/0002.sql", "create table demo.b ();"),
        ];
        let source = StaticSource::new("embedded:test", FILES);

        let m = Migrations::from_config(
            "example.com/demo",
            &["schema/0001.sql".into(), "schema/sub/0002.sql".into()],
            &source,
        )
        .unwrap();
        assert_eq!(m.index().len(), 2);

        // Same basename on different paths is still a duplicate.
        let err = Migrations::from_config(
            "example.com/demo",
            &["schema/0001.sql".into(), "schema/sub/0001.sql".into()],
            &source,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);

        let err = Migrations::from_config(
            "example.com/demo",
            &["schema/missing.sql".into()],
            &source,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn index_mode_reads_catalog() {
        static FILES: &[(&str, &str)] = &[
            (
                "schema/@migration.pgpkg",
                "# initial schema\n0001.sql\n\n0002.sql\n",
            ),
            ("schema/0001.sql", "create table demo.a ();"),
            ("schema/0002.sql", "create table demo.b ();"),
        ];
        let source = StaticSource::new("embedded:test", FILES);
        let dir_files = vec![
            "schema/0001.sql".to_string(),
            "schema/0002.sql".to_string(),
        ];

        let m =
            Migrations::from_index("example.com/demo", &source, "schema", &dir_files).unwrap();
        assert_eq!(m.index(), &["schema/0001.sql", "schema/0002.sql"]);
    }

    #[test]
    fn index_mode_requires_every_file_listed() {
        static FILES: &[(&str, &str)] = &[
            ("schema/@migration.pgpkg", "0001.sql\n"),
            ("schema/0001.sql", "create table demo.a ();"),
            ("schema/0002.sql", "create table demo.b ();"),
        ];
        let source = StaticSource::new("embedded:test", FILES);
        let dir_files = vec![
            "schema/0001.sql".to_string(),
            "schema/0002.sql".to_string(),
        ];

        let err = Migrations::from_index("example.com/demo", &source, "schema", &dir_files)
            .unwrap_err();
        assert!(err.to_string().contains("0002.sql"), "err: {}", err);
    }

    #[test]
    fn empty_migration_list_is_fine() {
        static FILES: &[(&str, &str)] = &[];
        let source = StaticSource::new("embedded:test", FILES);
        let m = Migrations::from_config("example.com/demo", &[], &source).unwrap();
        assert!(m.is_empty());
    }
}
