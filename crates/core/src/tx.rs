//! Database plumbing.
//!
//! All database work for an install flows through one [`PkgTx`]: a single
//! connection holding the single outer transaction. Savepoints are the only
//! sub-transactional unit; role switches bracket work that must run with
//! package privileges.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgDatabaseError, PgErrorPosition};
use sqlx::{Connection, Row};
use tracing::debug;

use crate::error::{ErrorContext, ErrorKind, PkgError, Result};
use crate::ident::{sanitize, ROLE_PATTERN};

/// Key of the advisory lock that serializes installs against a database.
const LOCK_KEY: &str = "pgpkg";

/// Connection options for a DSN. An empty DSN falls back to the libpq-style
/// environment (`PGHOST`, `PGDATABASE`, ...), which the driver reads
/// natively; otherwise the DSN must be a `postgres://` URL.
pub fn connect_options(dsn: &str) -> Result<PgConnectOptions> {
    if dsn.is_empty() {
        Ok(PgConnectOptions::new())
    } else {
        PgConnectOptions::from_str(dsn).map_err(|e| {
            PkgError::new(ErrorKind::Config, format!("invalid DSN: {}", dsn)).with_source(e)
        })
    }
}

/// The install transaction.
pub struct PkgTx {
    conn: PgConnection,
}

impl PkgTx {
    /// Connect and begin the outer transaction.
    pub async fn begin(options: &PgConnectOptions) -> Result<PkgTx> {
        let conn = PgConnection::connect_with(options).await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "connection to database failed").with_source(e)
        })?;
        let mut tx = PkgTx { conn };
        tx.execute("begin").await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to begin transaction").with_source(e)
        })?;
        Ok(tx)
    }

    /// Commit the outer transaction and return the connection.
    pub async fn commit(mut self) -> Result<PgConnection> {
        self.execute("commit").await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to commit installation").with_source(e)
        })?;
        Ok(self.conn)
    }

    /// Roll the outer transaction back and close the connection.
    pub async fn rollback(mut self) -> Result<()> {
        self.execute("rollback").await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to roll back installation")
                .with_source(e)
        })?;
        let _ = self.conn.close().await;
        Ok(())
    }

    /// Execute raw SQL inside the transaction. Errors are returned as plain
    /// driver errors so callers can decide whether they are retryable.
    pub async fn execute(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error> {
        debug!(target: "pgpkg::sql", "{}", sql.split('\n').next().unwrap_or(sql));
        sqlx::raw_sql(sql).execute(&mut self.conn).await?;
        Ok(())
    }

    /// Direct access to the connection, for parameterized catalog queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    /// Serialize installs against this database. The lock is transaction
    /// scoped and blocks until the competing install finishes.
    pub async fn advisory_lock(&mut self) -> Result<()> {
        self.execute(&format!(
            "select pg_advisory_xact_lock(hashtext('{}'))",
            LOCK_KEY
        ))
        .await
        .map_err(|e| {
            PkgError::new(ErrorKind::Lock, "unable to obtain install lock").with_source(e)
        })
    }

    /// Begin a savepoint. A failure here is infrastructure, never retryable.
    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.execute(&format!("savepoint {}", name)).await.map_err(|e| {
            PkgError::new(ErrorKind::ExecRuntime, format!("unable to begin savepoint {}", name))
                .with_source(e)
        })
    }

    /// Release a savepoint, keeping its effects.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.execute(&format!("release savepoint {}", name))
            .await
            .map_err(|e| {
                PkgError::new(
                    ErrorKind::ExecRuntime,
                    format!("unable to release savepoint {}", name),
                )
                .with_source(e)
            })
    }

    /// Roll back to a savepoint, discarding its effects. The savepoint
    /// stays defined.
    pub async fn rollback_savepoint(&mut self, name: &str) -> Result<()> {
        self.execute(&format!("rollback to savepoint {}", name))
            .await
            .map_err(|e| {
                PkgError::new(
                    ErrorKind::ExecRuntime,
                    format!("unable to rollback to savepoint {}", name),
                )
                .with_source(e)
            })
    }

    /// Switch to a package role.
    pub async fn set_role(&mut self, role: &str) -> Result<()> {
        let role = sanitize(&ROLE_PATTERN, role)?;
        self.execute(&format!("set role \"{}\"", role)).await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, format!("unable to change to role {}", role))
                .with_source(e)
        })
    }

    /// Return to the invoking user.
    pub async fn reset_role(&mut self) -> Result<()> {
        self.execute("reset role").await.map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "unable to reset role").with_source(e)
        })
    }

    /// Fetch the body of a function from the live catalog, given a
    /// `schema.name(args)` reference from an error diagnostic.
    pub async fn function_source(&mut self, fname: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "select prosrc from pg_catalog.pg_proc \
             where oid = ($1::pg_catalog.regprocedure)::pg_catalog.oid",
        )
        .bind(fname)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(|e| {
            PkgError::new(ErrorKind::CatalogAccess, "error looking up function source")
                .with_source(e)
        })?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Build the execution context chain for a runtime SQL error.
    ///
    /// The driver's `where` field carries one line per stack frame,
    /// innermost first. Frames naming a function pull the function's source
    /// from the catalog; inline frames and frames we cannot resolve attach
    /// the failing statement's source instead. When only a character offset
    /// is reported, it is converted to a line number within the statement.
    /// The returned chain lists frames innermost last.
    pub async fn runtime_context(
        &mut self,
        stmt_source: &str,
        stmt_location: &str,
        err: &sqlx::Error,
    ) -> Option<ErrorContext> {
        static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"function ([a-z_][a-z0-9_."]*\([^)]*\))(?: line (\d+))?"#).unwrap()
        });
        static LINE_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"line (\d+)").unwrap());

        let db_err = err.as_database_error()?;
        let pg_err = db_err.try_downcast_ref::<PgDatabaseError>()?;

        if let Some(where_) = pg_err.r#where() {
            let mut frames = Vec::new();
            for frame in where_.split('\n').filter(|f| !f.trim().is_empty()) {
                if let Some(caps) = FUNCTION_RE.captures(frame) {
                    let fname = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                    let line = caps
                        .get(2)
                        .and_then(|m| m.as_str().parse().ok())
                        .unwrap_or(1);
                    if let Ok(Some(source)) = self.function_source(fname).await {
                        frames.push(ErrorContext::new(source, line, frame.to_string()));
                        continue;
                    }
                }
                // Inline code blocks and anything we can't resolve: report
                // against the statement that was executing.
                let line = LINE_RE
                    .captures(frame)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(1);
                frames.push(ErrorContext::new(
                    stmt_source.to_string(),
                    line,
                    frame.to_string(),
                ));
            }

            // Chain outermost first so the innermost frame renders last.
            let mut chain: Option<ErrorContext> = None;
            for frame in frames.into_iter().rev() {
                match &mut chain {
                    Some(c) => c.push(frame),
                    None => chain = Some(frame),
                }
            }
            if chain.is_some() {
                return chain;
            }
        }

        // The reported position is a 1-based character offset.
        let line = match pg_err.position() {
            Some(PgErrorPosition::Original(pos)) => {
                1 + stmt_source
                    .chars()
                    .take(pos.saturating_sub(1))
                    .filter(|&c| c == '\n')
                    .count()
            }
            _ => 1,
        };

        Some(ErrorContext::new(
            stmt_source.to_string(),
            line,
            stmt_location.to_string(),
        ))
    }
}
