//! The managed-object resolver.
//!
//! A managed-object bundle is a set of CREATE statements whose
//! interdependencies are not declared. The resolver discovers a working
//! installation order by trial: every pending statement is attempted inside
//! a savepoint, failures are parked and retried on the next pass, and the
//! loop ends when a pass installs nothing new. The same loop drives purges,
//! where drop statements fail until their dependents are gone.

use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::statement::Statement;
use crate::tx::PkgTx;

/// Statement lists tracked while the resolver searches for an order.
#[derive(Debug, Default)]
pub struct ApplyState {
    /// Statements still waiting to execute.
    pub pending: Vec<Statement>,
    /// Statements that failed in the current pass.
    pub failed: Vec<Statement>,
    /// Statements that executed, in execution order. This is the canonical
    /// install order and is persisted for the next purge.
    pub success: Vec<Statement>,
}

impl ApplyState {
    /// Start a resolution with the given statements.
    pub fn new(pending: Vec<Statement>) -> Self {
        ApplyState {
            pending,
            failed: Vec::new(),
            success: Vec::new(),
        }
    }
}

/// Run one pass: attempt every pending statement once. SQL failures move
/// the statement to `failed`; infrastructure failures abort.
async fn exec_all(tx: &mut PkgTx, state: &mut ApplyState) -> Result<()> {
    for mut stmt in std::mem::take(&mut state.pending) {
        if stmt.try_exec(tx).await? {
            state.success.push(stmt);
        } else {
            // Normal when a dependency hasn't been created yet; the
            // statement will be tried again in the next pass.
            state.failed.push(stmt);
        }
    }
    Ok(())
}

/// Run passes until all statements have executed, or a whole pass makes no
/// progress. On no progress, the first stuck statement's error becomes the
/// principal error and the remainder ride along as siblings.
pub async fn apply_state(tx: &mut PkgTx, state: &mut ApplyState, what: &str) -> Result<()> {
    loop {
        let len_pending = state.pending.len();
        if len_pending == 0 {
            return Ok(());
        }

        exec_all(tx, state).await?;

        state.pending = std::mem::take(&mut state.failed);

        if state.pending.len() == len_pending {
            let location = state.pending[0].location();
            let mut errors: Vec<PkgError> = state
                .pending
                .iter_mut()
                .filter_map(|s| s.take_error())
                .collect();
            let mut err = PkgError::new(ErrorKind::NoProgress, format!("unable to install {}", what))
                .at_location(location);
            if !errors.is_empty() {
                let principal = errors.remove(0);
                err = err.with_source(principal).with_siblings(errors);
            }
            return Err(err);
        }
    }
}
