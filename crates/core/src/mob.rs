//! The managed-object bundle.
//!
//! A MOB holds the statements that declare replaceable objects: functions,
//! views, triggers, casts, and comments on them. Units don't matter here;
//! the bundle is a flat set of CREATE statements that the resolver orders
//! at install time. On every install, the previous install's objects are
//! dropped first (in reverse install order, through the same resolver loop)
//! and the new set is created and recorded.

use std::collections::HashMap;

use sqlx::Row;

use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::object::{self, drop_sql};
use crate::package::Stats;
use crate::resolver::{apply_state, ApplyState};
use crate::rewrite::rewrite_function;
use crate::source::Source;
use crate::statement::Statement;
use crate::tx::PkgTx;
use crate::unit::Unit;

/// The managed-object bundle of one package.
#[derive(Debug, Default)]
pub struct Mob {
    units: Vec<Unit>,
    state: Option<ApplyState>,
}

impl Mob {
    /// Create a bundle over the given units.
    pub fn new(units: Vec<Unit>) -> Self {
        Mob { units, state: None }
    }

    /// True if the bundle has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Paths of the bundle's units, relative to the package root.
    pub fn unit_paths(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.path.as_str())
    }

    /// Parse every unit, identify each statement's managed object, rewrite
    /// functions, and reject duplicate declarations.
    pub fn parse(&mut self, source: &dyn Source, schemas: &[String], stats: &mut Stats) -> Result<()> {
        let mut pending = Vec::new();
        let mut definitions: HashMap<String, String> = HashMap::new();

        for unit in &self.units {
            let statements = unit
                .parse(source)
                .map_err(|e| PkgError::new(ErrorKind::Parse, "unable to parse managed objects")
                    .at(unit)
                    .with_source(e))?;

            for mut stmt in statements {
                let obj = object::identify(&stmt, schemas)?;

                if obj.object_type == "function" {
                    // Give the function its own schema on the search path,
                    // so bodies can name package objects without
                    // qualification.
                    rewrite_function(&mut stmt, &obj.schema)?;
                }

                // Duplicates are a subtle bug here because most of these
                // statements are "create or replace".
                let key = obj.key();
                if let Some(previous) = definitions.get(&key) {
                    return Err(PkgError::new(
                        ErrorKind::Duplicate,
                        format!(
                            "duplicate declaration for {} {}; also defined in {}",
                            obj.object_type, obj.name, previous
                        ),
                    )
                    .at(&stmt));
                }
                definitions.insert(key, stmt.location());

                match obj.object_type.as_str() {
                    "function" => stats.functions += 1,
                    "view" => stats.views += 1,
                    "trigger" => stats.triggers += 1,
                    _ => {}
                }

                stmt.object = Some(obj);
                pending.push(stmt);
            }
        }

        self.state = Some(ApplyState::new(pending));
        Ok(())
    }

    /// Drop every object recorded by the previous install, most recent
    /// first. Drops that fail because a dependent object still exists are
    /// retried by the resolver loop. CASCADE is never used, so objects
    /// outside the package that lean on managed objects fail the purge
    /// instead of silently disappearing.
    pub async fn purge(&self, tx: &mut PkgTx, pkg_name: &str) -> Result<()> {
        let rows = sqlx::query(
            "select obj_type, obj_name from pgpkg.managed_object \
             where pkg = $1 order by seq desc",
        )
        .bind(pkg_name)
        .fetch_all(tx.conn())
        .await
        .map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to load managed object state")
                .at_location(pkg_name.to_string())
                .with_source(e)
        })?;

        let pending: Vec<Statement> = rows
            .iter()
            .map(|row| {
                let obj_type: String = row.get(0);
                let obj_name: String = row.get(1);
                Statement::synthetic(drop_sql(&obj_type, &obj_name))
            })
            .collect();

        let mut purge_state = ApplyState::new(pending);
        apply_state(tx, &mut purge_state, "purge of managed objects").await
    }

    /// Install the bundle. [`Mob::parse`] must have been called first.
    pub async fn apply(&mut self, tx: &mut PkgTx) -> Result<()> {
        let state = self.state.as_mut().ok_or_else(|| {
            PkgError::new(ErrorKind::ExecRuntime, "managed object bundle was not parsed")
        })?;
        apply_state(tx, state, "managed objects").await
    }

    /// Replace the recorded object list with this install's objects, in the
    /// order they succeeded.
    pub async fn update_state(&self, tx: &mut PkgTx, pkg_name: &str) -> Result<()> {
        let state = self.state.as_ref().ok_or_else(|| {
            PkgError::new(ErrorKind::ExecRuntime, "managed object bundle was not parsed")
        })?;

        sqlx::query("delete from pgpkg.managed_object where pkg = $1")
            .bind(pkg_name)
            .execute(tx.conn())
            .await
            .map_err(|e| {
                PkgError::new(ErrorKind::CatalogAccess, "unable to remove existing state")
                    .with_source(e)
            })?;

        for (seq, stmt) in state.success.iter().enumerate() {
            if let Some(obj) = &stmt.object {
                sqlx::query(
                    "insert into pgpkg.managed_object (pkg, seq, obj_type, obj_name) \
                     values ($1, $2, $3, $4)",
                )
                .bind(pkg_name)
                .bind(seq as i32)
                .bind(&obj.object_type)
                .bind(&obj.name)
                .execute(tx.conn())
                .await
                .map_err(|e| {
                    PkgError::new(ErrorKind::CatalogAccess, "unable to update package state")
                        .with_source(e)
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;

    static GOOD: &[(&str, &str)] = &[
        (
            "api/items.sql",
            "create view demo.items_active as select 1 as id;\n\
             create function demo.item_count() returns bigint language sql as $$ \
             select count(*) from demo.items_active $$;",
        ),
        (
            "api/audit.sql",
            "comment on view demo.items_active is 'live items';",
        ),
    ];

    static DUPED: &[(&str, &str)] = &[
        ("api/a.sql", "create view demo.v as select 1;"),
        ("api/b.sql", "create or replace view demo.v as select 2;"),
    ];

    fn units(files: &'static [(&'static str, &'static str)]) -> Vec<Unit> {
        files
            .iter()
            .map(|(path, _)| Unit::new("example.com/demo", *path))
            .collect()
    }

    #[test]
    fn parse_identifies_and_rewrites() {
        let source = StaticSource::new("embedded:test", GOOD);
        let mut mob = Mob::new(units(GOOD));
        let mut stats = Stats::default();
        mob.parse(&source, &["demo".to_string()], &mut stats).unwrap();

        assert_eq!(stats.views, 1);
        assert_eq!(stats.functions, 1);

        let state = mob.state.as_ref().unwrap();
        assert_eq!(state.pending.len(), 3);

        let func = state
            .pending
            .iter()
            .find(|s| s.object.as_ref().unwrap().object_type == "function")
            .unwrap();
        assert!(func.source.to_uppercase().contains("SECURITY DEFINER"));
    }

    #[test]
    fn parse_rejects_duplicates() {
        let source = StaticSource::new("embedded:test", DUPED);
        let mut mob = Mob::new(units(DUPED));
        let mut stats = Stats::default();
        let err = mob
            .parse(&source, &["demo".to_string()], &mut stats)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert!(err.to_string().contains("api/a.sql"), "err: {}", err);
        assert_eq!(
            err.location(),
            Some("example.com/demo:api/b.sql:1")
        );
    }

    #[test]
    fn empty_mob_is_fine() {
        let mob = Mob::default();
        assert!(mob.is_empty());
    }
}
