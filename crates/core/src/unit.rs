//! Build units.
//!
//! A unit is one SQL source file. Units are lazily parsed: the file is read
//! and split into statements only when a bundle needs them. Parsing uses the
//! real PostgreSQL parser, so anything the server would accept parses here.

use pg_query::protobuf::node::Node as NodeEnum;

use crate::error::{ErrorKind, Located, PkgError, Result};
use crate::source::{read_string, Source};
use crate::statement::Statement;

/// Files starting with this marker are skipped entirely.
pub const IGNORE_MARKER: &str = "--pgpkg:ignore";

/// One SQL source file within a bundle.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Path of the file, relative to the package root.
    pub path: String,
    location: String,
}

impl Unit {
    /// Create a unit. `pkg_name` is used only for location strings.
    pub fn new(pkg_name: &str, path: impl Into<String>) -> Self {
        let path = path.into();
        Unit {
            location: format!("{}:{}", pkg_name, path),
            path,
        }
    }

    /// Read and parse the unit into statements. Returns an empty list for
    /// ignored files.
    pub fn parse(&self, source: &dyn Source) -> Result<Vec<Statement>> {
        let text = read_string(source, &self.path).map_err(|e| e.at_location(self.location()))?;
        self.parse_text(&text)
    }

    /// Parse SQL text as this unit's contents.
    pub fn parse_text(&self, text: &str) -> Result<Vec<Statement>> {
        if text.starts_with(IGNORE_MARKER) {
            return Ok(Vec::new());
        }

        // The parser is happier when the last statement is terminated.
        let mut sql = text.trim().to_string();
        if sql.is_empty() {
            return Ok(Vec::new());
        }
        if !sql.ends_with(';') {
            sql.push(';');
        }

        let parsed = pg_query::parse(&sql).map_err(|e| {
            PkgError::new(ErrorKind::Parse, "unable to parse unit")
                .at(self)
                .with_source(e)
        })?;

        let mut statements = Vec::new();
        for raw in &parsed.protobuf.stmts {
            let start = raw.stmt_location.max(0) as usize;
            let end = if raw.stmt_len > 0 {
                (start + raw.stmt_len as usize).min(sql.len())
            } else {
                sql.len()
            };
            let chunk = &sql[start..end];

            // The chunk includes whitespace and comments that precede the
            // statement; step the line number forward to the first line of
            // actual code.
            let mut line = 1 + sql[..start].matches('\n').count();
            for text_line in chunk.split('\n') {
                let trimmed = text_line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with("--") {
                    break;
                }
                line += 1;
            }

            let node: Option<NodeEnum> = raw
                .stmt
                .as_ref()
                .and_then(|n| n.node.as_ref())
                .cloned();

            statements.push(Statement::new(
                self.location(),
                line,
                chunk.trim().to_string(),
                node,
            ));
        }

        Ok(statements)
    }
}

impl Located for Unit {
    fn location(&self) -> String {
        self.location.clone()
    }
}
