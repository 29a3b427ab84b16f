//! Parsed SQL statements.

use pg_query::protobuf::node::Node as NodeEnum;

use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::object::ManagedObject;
use crate::tx::PkgTx;

/// One top-level SQL statement within a unit.
///
/// Statements created by the unit parser carry their syntax tree and
/// location. The purge phase also builds synthetic statements (drops) that
/// have neither.
#[derive(Debug)]
pub struct Statement {
    unit_location: String,
    /// 1-based line number of the first code line within the unit.
    pub line: usize,
    /// The statement's SQL. Rewriting replaces this text.
    pub source: String,
    /// The parsed syntax tree node, if the statement came from a unit.
    pub node: Option<NodeEnum>,
    /// Cached managed-object identity, filled in during bundle parsing.
    pub object: Option<ManagedObject>,
    /// The most recent execution error, kept for diagnostics while the
    /// resolver retries.
    pub error: Option<PkgError>,
}

impl Statement {
    /// Create a statement parsed from a unit.
    pub fn new(unit_location: String, line: usize, source: String, node: Option<NodeEnum>) -> Self {
        Statement {
            unit_location,
            line,
            source,
            node,
            object: None,
            error: None,
        }
    }

    /// Create a synthetic statement (used for purge drops).
    pub fn synthetic(source: String) -> Self {
        Statement {
            unit_location: "<internal>".to_string(),
            line: 1,
            source,
            node: None,
            object: None,
            error: None,
        }
    }

    /// First line of the statement, for logs.
    pub fn headline(&self) -> &str {
        self.source.split('\n').next().unwrap_or("")
    }

    /// Attempt to execute the statement inside a savepoint.
    ///
    /// Returns `Ok(true)` if the statement succeeded (savepoint released),
    /// and `Ok(false)` if it failed with a SQL error that may be retried
    /// (savepoint rolled back, the error recorded on the statement). An
    /// `Err` means the savepoint machinery itself failed; that is never
    /// retryable and aborts the install.
    pub async fn try_exec(&mut self, tx: &mut PkgTx) -> Result<bool> {
        tx.savepoint("statement").await?;

        match tx.execute(&self.source).await {
            Ok(()) => {
                tx.release_savepoint("statement").await?;
                self.error = None;
                Ok(true)
            }
            Err(sql_err) => {
                tx.rollback_savepoint("statement").await?;
                let context = tx
                    .runtime_context(&self.source, &self.location(), &sql_err)
                    .await;
                let mut err = PkgError::new(ErrorKind::ExecRuntime, short_error(&sql_err))
                    .at(self)
                    .with_source(sql_err);
                if let Some(context) = context {
                    err = err.with_context(context);
                }
                self.error = Some(err);
                Ok(false)
            }
        }
    }

    /// Take the recorded execution error, leaving `None`.
    pub fn take_error(&mut self) -> Option<PkgError> {
        self.error.take()
    }
}

impl Located for Statement {
    fn location(&self) -> String {
        format!("{}:{}", self.unit_location, self.line)
    }
}

/// The driver's message for a SQL error, without the full diagnostic dump.
fn short_error(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_statements_have_internal_location() {
        let stmt = Statement::synthetic("drop view if exists \"a\".\"b\"".to_string());
        assert_eq!(stmt.location(), "<internal>:1");
        assert_eq!(stmt.headline(), "drop view if exists \"a\".\"b\"");
    }

    #[test]
    fn headline_is_first_line() {
        let stmt = Statement::new(
            "demo:api/f.sql".to_string(),
            3,
            "create view demo.v as\nselect 1".to_string(),
            None,
        );
        assert_eq!(stmt.headline(), "create view demo.v as");
        assert_eq!(stmt.location(), "demo:api/f.sql:3");
    }
}
